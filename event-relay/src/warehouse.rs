//! Append-only writes of normalized event records into the analytics table.

use crate::auth::TokenSource;
use crate::config::{ValidationError, WarehouseConfig};
use crate::envelope::Event;
use crate::errors::InsertError;
use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

/// The flat row stored per event. `context` is always the serialized JSON of
/// the event context, never a nested object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(rename = "createdTime")]
    pub created_time: String,
    pub context: String,
}

impl TryFrom<&Event> for NormalizedRecord {
    type Error = InsertError;

    fn try_from(event: &Event) -> Result<Self, Self::Error> {
        let event_type = event
            .event_type
            .clone()
            .ok_or(InsertError::InvalidRecord("event_type"))?;
        let created_time = event
            .created_time
            .as_ref()
            .ok_or(InsertError::InvalidRecord("created_time"))?
            .to_string();
        let context = serde_json::to_string(&event.event_context)?;

        Ok(NormalizedRecord {
            event_type,
            created_time,
            context,
        })
    }
}

/// Sink for normalized records.
///
/// One call appends one row. Implementations do not retry and do not
/// deduplicate; a redelivered envelope becomes a second row.
#[async_trait]
pub trait WarehouseWriter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn insert(&self, record: &NormalizedRecord) -> Result<(), InsertError>;
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<RowErrors>,
}

#[derive(Deserialize)]
struct RowErrors {
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

/// Streams rows through the BigQuery `tabledata.insertAll` REST method.
pub struct BigQueryWriter {
    client: reqwest::Client,
    insert_url: Url,
    token: TokenSource,
}

impl BigQueryWriter {
    pub fn new(config: &WarehouseConfig, client: reqwest::Client) -> Result<Self, ValidationError> {
        let mut insert_url = config.endpoint.clone();
        insert_url
            .path_segments_mut()
            .map_err(|_| ValidationError::InvalidEndpoint("warehouse.endpoint"))?
            .pop_if_empty()
            .extend([
                "bigquery",
                "v2",
                "projects",
                config.project.as_str(),
                "datasets",
                config.dataset.as_str(),
                "tables",
                config.table.as_str(),
                "insertAll",
            ]);

        let token = TokenSource::from_config(&config.auth, client.clone());

        Ok(BigQueryWriter {
            client,
            insert_url,
            token,
        })
    }

    pub fn insert_url(&self) -> &Url {
        &self.insert_url
    }
}

#[async_trait]
impl WarehouseWriter for BigQueryWriter {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn insert(&self, record: &NormalizedRecord) -> Result<(), InsertError> {
        let body = json!({
            "kind": "bigquery#tableDataInsertAllRequest",
            "rows": [{ "json": record }],
        });

        let request = self.client.post(self.insert_url.clone()).json(&body);
        let response = self.token.authorize(request).await?.send().await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(InsertError::Auth { status });
        }

        let text = response.text().await?;
        if !status.is_success() {
            return Err(InsertError::Status { status, body: text });
        }

        // A 200 can still carry per-row failures.
        let parsed = match serde_json::from_str::<InsertAllResponse>(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "could not parse insertAll response, assuming success");
                InsertAllResponse::default()
            }
        };

        let messages: Vec<String> = parsed
            .insert_errors
            .into_iter()
            .flat_map(|row| row.errors)
            .map(|error| {
                format!(
                    "{}: {}",
                    error.reason.as_deref().unwrap_or("unknown"),
                    error.message.as_deref().unwrap_or("")
                )
            })
            .collect();

        if messages.is_empty() {
            Ok(())
        } else {
            Err(InsertError::Rejected(messages.join("; ")))
        }
    }
}
