//! Per-delivery flow: decode, join the inbound trace, insert, report.

use crate::envelope::{self, DecodedMessage};
use crate::errors::{EnvelopeError, InsertError};
use crate::metrics_defs::{
    EVENTS_ACKED, EVENTS_INSERT_FAILED, EVENTS_MALFORMED, EVENTS_RECEIVED,
    WAREHOUSE_INSERT_DURATION,
};
use crate::trace_context;
use crate::tracer::{ActiveSpan, SpanStatus, Tracer};
use crate::warehouse::{NormalizedRecord, WarehouseWriter};
use http::StatusCode;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SUCCESS_ANNOTATION: &str = "streamEvents succeeded!";
const FAILURE_ANNOTATION: &str = "streamEvents failed!";

/// Terminal state of one push delivery.
#[derive(Debug)]
pub enum Outcome {
    /// The row is in the warehouse.
    Acked { traceparent: String },
    /// Never reached the warehouse. No span was opened.
    Malformed(EnvelopeError),
    /// Decoded, but the warehouse did not take the row.
    InsertFailed {
        error: InsertError,
        traceparent: String,
    },
}

impl Outcome {
    pub fn status(&self) -> StatusCode {
        match self {
            Outcome::Acked { .. } => StatusCode::OK,
            Outcome::Malformed(_) => StatusCode::BAD_REQUEST,
            Outcome::InsertFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Traceparent of the relay span, if one was opened.
    pub fn traceparent(&self) -> Option<&str> {
        match self {
            Outcome::Acked { traceparent } | Outcome::InsertFailed { traceparent, .. } => {
                Some(traceparent)
            }
            Outcome::Malformed(_) => None,
        }
    }
}

/// Everything a delivery needs, built once at startup and shared by all
/// connections.
#[derive(Clone)]
pub struct EventRelay {
    writer: Arc<dyn WarehouseWriter>,
    tracer: Tracer,
    insert_timeout: Duration,
    span_name: Arc<str>,
    sink_name: Arc<str>,
}

impl EventRelay {
    pub fn new(
        writer: Arc<dyn WarehouseWriter>,
        tracer: Tracer,
        insert_timeout: Duration,
        span_name: &str,
        sink_name: &str,
    ) -> Self {
        EventRelay {
            writer,
            tracer,
            insert_timeout,
            span_name: span_name.into(),
            sink_name: sink_name.into(),
        }
    }

    /// Human readable name of the warehouse, used in error responses.
    pub fn sink_name(&self) -> &str {
        &self.sink_name
    }

    /// Handles one raw push body. Waits for the insert to finish before
    /// returning; nothing is acknowledged early.
    pub async fn process(&self, body: &[u8]) -> Outcome {
        counter!(EVENTS_RECEIVED).increment(1);

        let message = match envelope::decode(body) {
            Ok(message) => message,
            Err(e) => return self.reject(e, body.len()),
        };

        let propagation = trace_context::extract(message.event.carrier.as_ref());
        if let Some(e) = &propagation.rejected {
            tracing::debug!(error = %e, "ignoring unusable traceparent, starting a new trace");
        }

        let mut span = self
            .tracer
            .start_span(self.span_name.as_ref(), propagation.parent.as_ref());
        tag_span(&mut span, &message, propagation.identity.as_deref());
        let traceparent = span.context().to_traceparent();

        match self.insert(&message).await {
            Ok(()) => {
                span.annotate(SUCCESS_ANNOTATION);
                span.set_status(SpanStatus::Ok);
                span.end();

                counter!(EVENTS_ACKED).increment(1);
                tracing::debug!(
                    message_id = message.message_id.as_deref(),
                    traceparent = %traceparent,
                    "event streamed"
                );
                Outcome::Acked { traceparent }
            }
            Err(error) => {
                span.annotate(FAILURE_ANNOTATION);
                span.set_status(SpanStatus::Error(error.to_string()));
                span.end();

                counter!(EVENTS_INSERT_FAILED, "reason" => error.reason()).increment(1);
                tracing::error!(
                    sink = %self.sink_name,
                    message_id = message.message_id.as_deref(),
                    event_type = message.event.event_type.as_deref(),
                    created_time = ?message.event.created_time,
                    context = %message.event.event_context,
                    traceparent = %traceparent,
                    error = %error,
                    "failed to stream event"
                );
                Outcome::InsertFailed { error, traceparent }
            }
        }
    }

    /// Records a delivery that could not be decoded. Only the size of the
    /// body is logged.
    pub fn reject(&self, error: EnvelopeError, body_size: usize) -> Outcome {
        counter!(EVENTS_MALFORMED, "reason" => error.reason()).increment(1);
        tracing::warn!(body_size, error = %error, "rejecting malformed push envelope");
        Outcome::Malformed(error)
    }

    async fn insert(&self, message: &DecodedMessage) -> Result<(), InsertError> {
        let record = NormalizedRecord::try_from(&message.event)?;

        let started = Instant::now();
        let result = tokio::time::timeout(self.insert_timeout, self.writer.insert(&record)).await;
        histogram!(WAREHOUSE_INSERT_DURATION, "writer" => self.writer.name())
            .record(started.elapsed().as_secs_f64());

        result.map_err(|_| InsertError::Timeout(self.insert_timeout))?
    }
}

fn tag_span(span: &mut ActiveSpan, message: &DecodedMessage, identity: Option<&str>) {
    if let Some(event_type) = &message.event.event_type {
        span.set_attribute("event.type", event_type.as_str());
    }
    if let Some(identity) = identity {
        span.set_attribute("enduser.id", identity);
    }
    if let Some(message_id) = &message.message_id {
        span.set_attribute("messaging.message_id", message_id.as_str());
    }
    if let Some(subscription) = &message.subscription {
        span.set_attribute("messaging.subscription", subscription.as_str());
    }
    if let Some(publish_time) = &message.publish_time {
        span.set_attribute("messaging.publish_time", publish_time.as_str());
    }
    for (key, value) in &message.attributes {
        span.set_attribute(format!("messaging.attribute.{key}"), value.as_str());
    }
}
