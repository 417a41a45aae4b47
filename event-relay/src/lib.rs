//! Relays broker push deliveries into a warehouse table, one row per event,
//! continuing the producer's trace along the way.

pub mod auth;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod exporter;
pub mod metrics_defs;
pub mod relay;
pub mod service;
pub mod trace_context;
pub mod tracer;
pub mod warehouse;

#[cfg(test)]
mod testutils;

use crate::config::Config;
use crate::errors::{RelayError, Result};
use crate::relay::EventRelay;
use crate::service::RelayService;
use crate::tracer::{TracerProvider, TracerSettings};
use crate::warehouse::BigQueryWriter;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

const USER_AGENT: &str = concat!("event-relay/", env!("CARGO_PKG_VERSION"));

/// Serves push deliveries until `shutdown` resolves, then flushes pending spans.
pub async fn run<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    config.validate()?;

    let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

    let writer = Arc::new(BigQueryWriter::new(&config.warehouse, client.clone())?);
    tracing::info!(url = %writer.insert_url(), "streaming events to {}", config.warehouse.sink_name);

    let exporter = exporter::from_config(&config.tracing.exporter, client)?;
    tracing::info!(exporter = exporter.name(), "span exporter ready");

    let (tracer, provider) = TracerProvider::spawn(
        exporter,
        TracerSettings {
            queue_capacity: config.tracing.queue_capacity,
            max_batch_size: config.tracing.max_batch_size,
            flush_interval: Duration::from_millis(config.tracing.flush_interval_ms),
        },
    );

    let relay = EventRelay::new(
        writer,
        tracer,
        Duration::from_secs(config.warehouse.insert_timeout_secs),
        &config.tracing.span_name,
        &config.warehouse.sink_name,
    );
    let service = RelayService::new(relay, &config.stream_path, config.max_body_bytes);

    let (stop_tx, stop_rx) = watch::channel(false);
    let ready = Arc::new(AtomicBool::new(true));

    let relay_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        service,
        stopped(stop_rx.clone()),
    );
    let admin_task = async {
        let Some(admin) = &config.admin_listener else {
            return Ok(());
        };
        let flag = ready.clone();
        let admin_service =
            AdminService::<_, RelayError>::new(move || flag.load(Ordering::Relaxed));
        run_http_service(&admin.host, admin.port, admin_service, stopped(stop_rx.clone())).await
    };
    let signal_task = async {
        shutdown.await;
        ready.store(false, Ordering::Relaxed);
        let _ = stop_tx.send(true);
        Ok::<_, RelayError>(())
    };

    let served = tokio::try_join!(relay_task, admin_task, signal_task);

    // Idle keep-alive connections may still hold tracer handles.
    provider.shutdown().await;
    tracing::info!("event relay stopped");

    served.map(|_| ())
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    // An error means the sender is gone, which also means stop.
    let _ = stop.wait_for(|stop| *stop).await;
}
