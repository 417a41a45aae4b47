//! Per-request spans and the process wide tracer that ships them.
//!
//! A single [`TracerProvider`] is created at startup. Request handlers get a
//! cheap [`Tracer`] handle, open an [`ActiveSpan`] per delivery and end it
//! before responding. Finished spans go onto a bounded queue; a background
//! worker batches them into the configured [`SpanExporter`]. Handlers never
//! wait for the export.

use crate::exporter::SpanExporter;
use crate::metrics_defs::{SPANS_DROPPED, SPANS_EXPORT_FAILED};
use crate::trace_context::{SpanContext, SpanId};
use chrono::{DateTime, Utc};
use shared::counter;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Debug, PartialEq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub time: DateTime<Utc>,
    pub description: String,
}

/// A finished span as handed to exporters.
#[derive(Clone, Debug)]
pub struct SpanData {
    pub name: String,
    pub context: SpanContext,
    pub parent_span_id: Option<SpanId>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub attributes: BTreeMap<String, String>,
    pub annotations: Vec<Annotation>,
    pub status: SpanStatus,
}

/// A span that is still open. Ends on [`ActiveSpan::end`] or when dropped.
pub struct ActiveSpan {
    context: SpanContext,
    data: Option<SpanData>,
    tracer: Tracer,
}

impl ActiveSpan {
    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        if let Some(data) = self.data.as_mut() {
            data.attributes.insert(key.into(), value.into());
        }
    }

    pub fn annotate(&mut self, description: impl Into<String>) {
        if let Some(data) = self.data.as_mut() {
            data.annotations.push(Annotation {
                time: Utc::now(),
                description: description.into(),
            });
        }
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        if let Some(data) = self.data.as_mut() {
            data.status = status;
        }
    }

    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(mut data) = self.data.take() {
            data.end_time = Utc::now();
            self.tracer.submit(data);
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Handle for opening spans. Clones share one export queue.
#[derive(Clone)]
pub struct Tracer {
    sender: mpsc::Sender<SpanData>,
}

impl Tracer {
    /// Creates a tracer whose finished spans arrive on the returned receiver.
    pub fn channel(capacity: usize) -> (Tracer, mpsc::Receiver<SpanData>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Tracer { sender }, receiver)
    }

    /// Opens a span. With a parent it joins the parent's trace, otherwise it
    /// starts a new root trace.
    pub fn start_span(&self, name: impl Into<String>, parent: Option<&SpanContext>) -> ActiveSpan {
        let (context, parent_span_id) = match parent {
            Some(parent) => (parent.new_child(), Some(parent.span_id)),
            None => (SpanContext::new_root(), None),
        };

        let now = Utc::now();
        ActiveSpan {
            context: context.clone(),
            data: Some(SpanData {
                name: name.into(),
                context,
                parent_span_id,
                start_time: now,
                end_time: now,
                attributes: BTreeMap::new(),
                annotations: Vec::new(),
                status: SpanStatus::Unset,
            }),
            tracer: self.clone(),
        }
    }

    fn submit(&self, span: SpanData) {
        match self.sender.try_send(span) {
            Ok(()) => {}
            Err(TrySendError::Full(span)) => {
                tracing::warn!(
                    trace_id = %span.context.trace_id,
                    "span export queue is full, dropping span"
                );
                counter!(SPANS_DROPPED).increment(1);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("span export worker has stopped, dropping span");
                counter!(SPANS_DROPPED).increment(1);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct TracerSettings {
    pub queue_capacity: usize,
    pub max_batch_size: usize,
    pub flush_interval: Duration,
}

/// Owns the background export worker.
pub struct TracerProvider {
    worker: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

impl TracerProvider {
    pub fn spawn(exporter: Arc<dyn SpanExporter>, settings: TracerSettings) -> (Tracer, Self) {
        let (tracer, receiver) = Tracer::channel(settings.queue_capacity);
        let (stop, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(run_export_worker(exporter, receiver, stop_rx, settings));
        (tracer, TracerProvider { worker, stop })
    }

    /// Closes the queue and waits until every span already in it has been
    /// exported. Spans ended afterwards are dropped.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "span export worker panicked");
        }
    }
}

async fn run_export_worker(
    exporter: Arc<dyn SpanExporter>,
    mut receiver: mpsc::Receiver<SpanData>,
    mut stop: oneshot::Receiver<()>,
    settings: TracerSettings,
) {
    let max_batch_size = settings.max_batch_size.max(1);
    let mut batch = Vec::with_capacity(max_batch_size);
    let first_tick = tokio::time::Instant::now() + settings.flush_interval;
    let mut ticker = tokio::time::interval_at(first_tick, settings.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Some(span) => {
                    batch.push(span);
                    if batch.len() >= max_batch_size {
                        flush(exporter.as_ref(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => flush(exporter.as_ref(), &mut batch).await,
            _ = &mut stop => {
                // Drain what is buffered, then recv returns None.
                receiver.close();
                while let Some(span) = receiver.recv().await {
                    batch.push(span);
                    if batch.len() >= max_batch_size {
                        flush(exporter.as_ref(), &mut batch).await;
                    }
                }
                break;
            }
        }
    }

    flush(exporter.as_ref(), &mut batch).await;
    tracing::debug!(exporter = exporter.name(), "span export worker stopped");
}

async fn flush(exporter: &dyn SpanExporter, batch: &mut Vec<SpanData>) {
    if batch.is_empty() {
        return;
    }

    let spans = std::mem::take(batch);
    let count = spans.len();
    if let Err(e) = exporter.export(spans).await {
        tracing::warn!(
            exporter = exporter.name(),
            spans = count,
            error = %e,
            "failed to export spans"
        );
        counter!(SPANS_EXPORT_FAILED, "exporter" => exporter.name()).increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MetadataTokenSource, TokenSource};
    use crate::errors::ExportError;
    use crate::exporter::CloudTraceExporter;
    use crate::testutils::SilentServer;
    use crate::trace_context::parse_traceparent;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingExporter {
        batches: Mutex<Vec<Vec<SpanData>>>,
        fail: bool,
    }

    #[async_trait]
    impl SpanExporter for CollectingExporter {
        fn name(&self) -> &'static str {
            "collecting"
        }

        async fn export(&self, spans: Vec<SpanData>) -> Result<(), ExportError> {
            if self.fail {
                return Err(ExportError::Status {
                    status: http::StatusCode::BAD_GATEWAY,
                    body: String::new(),
                });
            }
            self.batches.lock().unwrap().push(spans);
            Ok(())
        }
    }

    fn settings(max_batch_size: usize) -> TracerSettings {
        TracerSettings {
            queue_capacity: 16,
            max_batch_size,
            flush_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_root_span() {
        let (tracer, mut receiver) = Tracer::channel(4);

        let mut span = tracer.start_span("root", None);
        span.set_attribute("event.type", "order_created");
        span.annotate("saved");
        span.set_status(SpanStatus::Ok);
        let context = span.context().clone();
        span.end();

        let data = receiver.recv().await.unwrap();
        assert_eq!(data.name, "root");
        assert_eq!(data.context, context);
        assert!(data.parent_span_id.is_none());
        assert!(!data.context.is_remote);
        assert!(data.end_time >= data.start_time);
        assert_eq!(data.attributes.get("event.type").unwrap(), "order_created");
        assert_eq!(data.annotations.len(), 1);
        assert_eq!(data.annotations[0].description, "saved");
        assert_eq!(data.status, SpanStatus::Ok);
    }

    #[tokio::test]
    async fn test_child_of_remote_parent() {
        let (tracer, mut receiver) = Tracer::channel(4);
        let parent =
            parse_traceparent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01").unwrap();

        tracer.start_span("child", Some(&parent)).end();

        let data = receiver.recv().await.unwrap();
        assert_eq!(data.context.trace_id, parent.trace_id);
        assert_eq!(data.parent_span_id, Some(parent.span_id));
        assert_ne!(data.context.span_id, parent.span_id);
    }

    #[tokio::test]
    async fn test_dropped_span_is_ended_once() {
        let (tracer, mut receiver) = Tracer::channel(4);
        {
            let mut span = tracer.start_span("dropped", None);
            span.annotate("never explicitly ended");
        }
        drop(tracer);

        assert_eq!(receiver.recv().await.unwrap().name, "dropped");
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (tracer, mut receiver) = Tracer::channel(1);
        tracer.start_span("first", None).end();
        tracer.start_span("second", None).end();
        drop(tracer);

        assert_eq!(receiver.recv().await.unwrap().name, "first");
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_provider_batches_and_flushes_on_shutdown() {
        let exporter = Arc::new(CollectingExporter::default());
        let (tracer, provider) = TracerProvider::spawn(exporter.clone(), settings(2));

        for name in ["a", "b", "c"] {
            tracer.start_span(name, None).end();
        }
        drop(tracer);
        provider.shutdown().await;

        let batches = exporter.batches.lock().unwrap();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1]);
        let names: Vec<&str> = batches.iter().flatten().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_shutdown_with_live_tracer() {
        let exporter = Arc::new(CollectingExporter::default());
        let (tracer, provider) = TracerProvider::spawn(exporter.clone(), settings(8));

        tracer.start_span("queued", None).end();
        provider.shutdown().await;
        tracer.start_span("late", None).end();

        let batches = exporter.batches.lock().unwrap();
        let names: Vec<&str> = batches.iter().flatten().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["queued"]);
    }

    #[tokio::test]
    async fn test_shutdown_with_stalled_metadata_server() {
        let metadata = SilentServer::start().await;
        let client = reqwest::Client::new();
        let token = TokenSource::Metadata(MetadataTokenSource::new(
            client.clone(),
            metadata.url.clone(),
        ));
        let exporter = CloudTraceExporter::new(
            "storefront",
            &metadata.url,
            Duration::from_millis(200),
            token,
            client,
        )
        .unwrap();
        let (tracer, provider) = TracerProvider::spawn(Arc::new(exporter), settings(8));

        tracer.start_span("stuck", None).end();
        tokio::time::timeout(Duration::from_secs(5), provider.shutdown())
            .await
            .expect("shutdown must not wait on the metadata server");
        assert_eq!(metadata.connections(), 1);
    }

    #[tokio::test]
    async fn test_export_failure_is_swallowed() {
        let exporter = Arc::new(CollectingExporter {
            fail: true,
            ..Default::default()
        });
        let (tracer, provider) = TracerProvider::spawn(exporter, settings(1));

        tracer.start_span("lost", None).end();
        drop(tracer);
        // Completes normally even though every export failed.
        provider.shutdown().await;
    }
}
