//! Span export backends. Which one runs is a configuration choice.

use crate::auth::TokenSource;
use crate::config::{ExporterConfig, ValidationError};
use crate::errors::ExportError;
use crate::tracer::{SpanData, SpanStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Ships finished spans to a trace collector.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn export(&self, spans: Vec<SpanData>) -> Result<(), ExportError>;
}

/// Builds the exporter selected in the configuration.
pub fn from_config(
    config: &ExporterConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn SpanExporter>, ValidationError> {
    Ok(match config {
        ExporterConfig::None => Arc::new(NoopExporter),
        ExporterConfig::Log => Arc::new(LogExporter),
        ExporterConfig::CloudTrace {
            project_id,
            endpoint,
            timeout_secs,
            auth,
        } => Arc::new(CloudTraceExporter::new(
            project_id,
            endpoint,
            Duration::from_secs(*timeout_secs),
            TokenSource::from_config(auth, client.clone()),
            client,
        )?),
    })
}

pub struct NoopExporter;

#[async_trait]
impl SpanExporter for NoopExporter {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn export(&self, _spans: Vec<SpanData>) -> Result<(), ExportError> {
        Ok(())
    }
}

/// Writes every span as a structured log line.
pub struct LogExporter;

#[async_trait]
impl SpanExporter for LogExporter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn export(&self, spans: Vec<SpanData>) -> Result<(), ExportError> {
        for span in spans {
            let duration_ms = (span.end_time - span.start_time).num_milliseconds();
            let annotations: Vec<&str> = span
                .annotations
                .iter()
                .map(|a| a.description.as_str())
                .collect();

            tracing::info!(
                target: "spans",
                name = %span.name,
                trace_id = %span.context.trace_id,
                span_id = %span.context.span_id,
                parent_span_id = span.parent_span_id.map(|id| id.to_string()),
                duration_ms,
                status = ?span.status,
                attributes = ?span.attributes,
                annotations = ?annotations,
                "span finished"
            );
        }
        Ok(())
    }
}

/// Google Cloud Trace v2 `batchWrite` exporter.
pub struct CloudTraceExporter {
    client: reqwest::Client,
    project_id: String,
    batch_write_url: Url,
    timeout: Duration,
    token: TokenSource,
}

impl CloudTraceExporter {
    pub fn new(
        project_id: &str,
        endpoint: &Url,
        timeout: Duration,
        token: TokenSource,
        client: reqwest::Client,
    ) -> Result<Self, ValidationError> {
        let mut batch_write_url = endpoint.clone();
        batch_write_url
            .path_segments_mut()
            .map_err(|_| ValidationError::InvalidEndpoint("tracing.exporter.endpoint"))?
            .pop_if_empty()
            .extend(["v2", "projects", project_id, "traces:batchWrite"]);

        Ok(CloudTraceExporter {
            client,
            project_id: project_id.to_owned(),
            batch_write_url,
            timeout,
            token,
        })
    }

    fn to_wire<'a>(&self, span: &'a SpanData) -> WireSpan<'a> {
        let span_id = span.context.span_id.to_string();
        let (code, message) = match &span.status {
            SpanStatus::Unset | SpanStatus::Ok => (0, None),
            // google.rpc.Code.UNKNOWN
            SpanStatus::Error(message) => (2, Some(message.as_str())),
        };

        WireSpan {
            name: format!(
                "projects/{}/traces/{}/spans/{}",
                self.project_id, span.context.trace_id, span_id
            ),
            span_id,
            parent_span_id: span.parent_span_id.map(|id| id.to_string()),
            display_name: TruncatableString { value: &span.name },
            start_time: span.start_time,
            end_time: span.end_time,
            attributes: Attributes {
                attribute_map: span
                    .attributes
                    .iter()
                    .map(|(key, value)| {
                        (
                            key.as_str(),
                            AttributeValue {
                                string_value: TruncatableString { value },
                            },
                        )
                    })
                    .collect(),
            },
            time_events: TimeEvents {
                time_event: span
                    .annotations
                    .iter()
                    .map(|annotation| TimeEvent {
                        time: annotation.time,
                        annotation: WireAnnotation {
                            description: TruncatableString {
                                value: &annotation.description,
                            },
                        },
                    })
                    .collect(),
            },
            status: Status { code, message },
            span_kind: "SERVER",
        }
    }
}

#[async_trait]
impl SpanExporter for CloudTraceExporter {
    fn name(&self) -> &'static str {
        "cloud_trace"
    }

    /// The token fetch counts against the same timeout as the write.
    async fn export(&self, spans: Vec<SpanData>) -> Result<(), ExportError> {
        tokio::time::timeout(self.timeout, self.batch_write(&spans))
            .await
            .map_err(|_| ExportError::Timeout(self.timeout))?
    }
}

impl CloudTraceExporter {
    async fn batch_write(&self, spans: &[SpanData]) -> Result<(), ExportError> {
        let body = BatchWrite {
            spans: spans.iter().map(|span| self.to_wire(span)).collect(),
        };

        let request = self
            .client
            .post(self.batch_write_url.clone())
            .timeout(self.timeout)
            .json(&body);
        let response = self.token.authorize(request).await?.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::Status { status, body });
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct BatchWrite<'a> {
    spans: Vec<WireSpan<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireSpan<'a> {
    name: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    display_name: TruncatableString<'a>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    attributes: Attributes<'a>,
    time_events: TimeEvents<'a>,
    status: Status<'a>,
    span_kind: &'static str,
}

#[derive(Serialize)]
struct TruncatableString<'a> {
    value: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Attributes<'a> {
    attribute_map: BTreeMap<&'a str, AttributeValue<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttributeValue<'a> {
    string_value: TruncatableString<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeEvents<'a> {
    time_event: Vec<TimeEvent<'a>>,
}

#[derive(Serialize)]
struct TimeEvent<'a> {
    time: DateTime<Utc>,
    annotation: WireAnnotation<'a>,
}

#[derive(Serialize)]
struct WireAnnotation<'a> {
    description: TruncatableString<'a>,
}

#[derive(Serialize)]
struct Status<'a> {
    code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MetadataTokenSource;
    use crate::config::AuthConfig;
    use crate::testutils::{MockServer, SilentServer};
    use crate::trace_context::parse_traceparent;
    use crate::tracer::Tracer;
    use http::StatusCode;
    use serde_json::json;

    async fn finished_span() -> SpanData {
        let (tracer, mut receiver) = Tracer::channel(1);
        let parent =
            parse_traceparent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01").unwrap();

        let mut span = tracer.start_span("stream events app", Some(&parent));
        span.set_attribute("enduser.id", "user-1");
        span.annotate("streamEvents failed!");
        span.set_status(SpanStatus::Error("timeout".into()));
        span.end();

        receiver.recv().await.unwrap()
    }

    fn exporter_for(server: &MockServer, auth: AuthConfig) -> Arc<dyn SpanExporter> {
        from_config(
            &ExporterConfig::CloudTrace {
                project_id: "storefront".into(),
                endpoint: server.url.clone(),
                timeout_secs: 5,
                auth,
            },
            reqwest::Client::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_cloud_trace_batch_write() {
        let server = MockServer::start(|_| (StatusCode::OK, "{}".into())).await;
        let exporter = exporter_for(
            &server,
            AuthConfig::Static {
                token: "secret".into(),
            },
        );
        assert_eq!(exporter.name(), "cloud_trace");

        let span = finished_span().await;
        let span_id = span.context.span_id.to_string();
        exporter.export(vec![span]).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/v2/projects/storefront/traces:batchWrite");
        assert_eq!(
            requests[0].headers.get("authorization").unwrap(),
            "Bearer secret"
        );

        let body = requests[0].json();
        let wire = &body["spans"][0];
        assert_eq!(
            wire["name"],
            json!(format!(
                "projects/storefront/traces/0af7651916cd43dd8448eb211c80319c/spans/{span_id}"
            ))
        );
        assert_eq!(wire["parentSpanId"], json!("b7ad6b7169203331"));
        assert_eq!(wire["displayName"], json!({"value": "stream events app"}));
        assert_eq!(
            wire["attributes"]["attributeMap"]["enduser.id"],
            json!({"stringValue": {"value": "user-1"}})
        );
        assert_eq!(
            wire["timeEvents"]["timeEvent"][0]["annotation"]["description"]["value"],
            json!("streamEvents failed!")
        );
        assert_eq!(wire["status"], json!({"code": 2, "message": "timeout"}));
        assert!(wire["startTime"].is_string());
        assert!(wire["endTime"].is_string());
    }

    #[tokio::test]
    async fn test_cloud_trace_error_status() {
        let server = MockServer::start(|_| (StatusCode::FORBIDDEN, String::new())).await;
        let exporter = exporter_for(&server, AuthConfig::None);

        let result = exporter.export(vec![finished_span().await]).await;
        assert!(matches!(result, Err(ExportError::Status { .. })));
    }

    #[tokio::test]
    async fn test_cloud_trace_stalled_token_fetch_is_bounded() {
        let metadata = SilentServer::start().await;
        let collector = MockServer::start(|_| (StatusCode::OK, "{}".into())).await;
        let client = reqwest::Client::new();
        let token = TokenSource::Metadata(
            MetadataTokenSource::new(client.clone(), metadata.url.clone())
                .with_timeout(Duration::from_secs(60)),
        );
        let exporter = CloudTraceExporter::new(
            "storefront",
            &collector.url,
            Duration::from_millis(200),
            token,
            client,
        )
        .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            exporter.export(vec![finished_span().await]),
        )
        .await
        .expect("export must give up on its own");
        assert!(matches!(result, Err(ExportError::Timeout(_))));
        assert!(collector.requests().is_empty());
    }

    #[tokio::test]
    async fn test_log_and_noop_exporters() {
        let client = reqwest::Client::new();

        let log = from_config(&ExporterConfig::Log, client.clone()).unwrap();
        assert_eq!(log.name(), "log");
        log.export(vec![finished_span().await]).await.unwrap();

        let noop = from_config(&ExporterConfig::None, client).unwrap();
        assert_eq!(noop.name(), "none");
        noop.export(vec![finished_span().await]).await.unwrap();
    }
}
