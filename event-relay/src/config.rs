use serde::Deserialize;
use thiserror::Error;
use url::Url;

const DEFAULT_BIGQUERY_ENDPOINT: &str = "https://bigquery.googleapis.com";
const DEFAULT_CLOUD_TRACE_ENDPOINT: &str = "https://cloudtrace.googleapis.com";
const DEFAULT_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("stream path must start with '/' and must not be '/': {0}")]
    InvalidStreamPath(String),

    #[error("{0} must be greater than 0")]
    ZeroValue(&'static str),

    #[error("{0} must be an http(s) URL")]
    InvalidEndpoint(&'static str),

    #[error("environment variable {name} has an invalid value: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Event relay configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for push deliveries
    #[serde(default)]
    pub listener: Listener,
    /// Optional listener for `/health` and `/ready`
    #[serde(default)]
    pub admin_listener: Option<Listener>,
    /// Path the push subscription delivers to
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    /// Request bodies above this size are rejected as malformed
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::default(),
            admin_listener: None,
            stream_path: default_stream_path(),
            max_body_bytes: default_max_body_bytes(),
            warehouse: WarehouseConfig::default(),
            tracing: TracingConfig::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from the process environment alone.
    pub fn from_env<F>(lookup: F) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides file based settings with recognized environment variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(port) = lookup("PORT") {
            self.listener.port = port.trim().parse().map_err(|_| ValidationError::InvalidEnv {
                name: "PORT",
                value: port,
            })?;
        }

        if let Some(project) = ["BIGQUERY_PROJECT", "GOOGLE_CLOUD_PROJECT", "GCP_PROJECT"]
            .into_iter()
            .find_map(&lookup)
        {
            self.warehouse.project = project;
        }
        if let Some(dataset) = lookup("BIGQUERY_DATASET") {
            self.warehouse.dataset = dataset;
        }
        if let Some(table) = lookup("BIGQUERY_TABLE") {
            self.warehouse.table = table;
        }
        if let Some(token) = lookup("BIGQUERY_ACCESS_TOKEN") {
            self.warehouse.auth = AuthConfig::Static { token };
        }

        let trace_project = lookup("TRACE_PROJECT_ID");
        match lookup("TRACE_EXPORTER").as_deref().map(str::trim) {
            Some("none") => self.tracing.exporter = ExporterConfig::None,
            Some("log") => self.tracing.exporter = ExporterConfig::Log,
            Some("cloud_trace") => {
                let project_id = trace_project
                    .clone()
                    .unwrap_or_else(|| self.warehouse.project.clone());
                self.tracing.exporter = ExporterConfig::cloud_trace(project_id);
            }
            Some(other) => {
                return Err(ValidationError::InvalidEnv {
                    name: "TRACE_EXPORTER",
                    value: other.to_owned(),
                });
            }
            None => {
                if let Some(project_id) = trace_project.clone() {
                    self.tracing.exporter = ExporterConfig::cloud_trace(project_id);
                }
            }
        }
        if let (Some(project), ExporterConfig::CloudTrace { project_id, .. }) =
            (trace_project, &mut self.tracing.exporter)
        {
            *project_id = project;
        }

        Ok(())
    }

    /// Validates the relay configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        if let Some(admin) = &self.admin_listener {
            admin.validate()?;
        }

        if !self.stream_path.starts_with('/') || self.stream_path == "/" {
            return Err(ValidationError::InvalidStreamPath(self.stream_path.clone()));
        }
        if self.max_body_bytes == 0 {
            return Err(ValidationError::ZeroValue("max_body_bytes"));
        }

        self.warehouse.validate()?;
        self.tracing.validate()?;

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Destination table for normalized records
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub dataset: String,
    #[serde(default)]
    pub table: String,
    #[serde(default = "default_bigquery_endpoint")]
    pub endpoint: Url,
    /// Upper bound for a single insert call
    #[serde(default = "default_insert_timeout_secs")]
    pub insert_timeout_secs: u64,
    /// Name used in the error returned to the push caller
    #[serde(default = "default_sink_name")]
    pub sink_name: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        WarehouseConfig {
            project: String::new(),
            dataset: String::new(),
            table: String::new(),
            endpoint: default_bigquery_endpoint(),
            insert_timeout_secs: default_insert_timeout_secs(),
            sink_name: default_sink_name(),
            auth: AuthConfig::default(),
        }
    }
}

impl WarehouseConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.project.is_empty() {
            return Err(ValidationError::EmptyField("warehouse.project"));
        }
        if self.dataset.is_empty() {
            return Err(ValidationError::EmptyField("warehouse.dataset"));
        }
        if self.table.is_empty() {
            return Err(ValidationError::EmptyField("warehouse.table"));
        }
        if !is_http(&self.endpoint) {
            return Err(ValidationError::InvalidEndpoint("warehouse.endpoint"));
        }
        if self.insert_timeout_secs == 0 {
            return Err(ValidationError::ZeroValue("warehouse.insert_timeout_secs"));
        }
        self.auth.validate()
    }
}

/// Where bearer tokens for Google APIs come from
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No Authorization header, e.g. for emulators
    None,
    Static {
        token: String,
    },
    /// The instance metadata server of the runtime environment
    Metadata {
        #[serde(default = "default_metadata_token_url")]
        url: Url,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::Metadata {
            url: default_metadata_token_url(),
        }
    }
}

impl AuthConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            AuthConfig::None => Ok(()),
            AuthConfig::Static { token } if token.is_empty() => {
                Err(ValidationError::EmptyField("auth.token"))
            }
            AuthConfig::Static { .. } => Ok(()),
            AuthConfig::Metadata { url } if !is_http(url) => {
                Err(ValidationError::InvalidEndpoint("auth.url"))
            }
            AuthConfig::Metadata { .. } => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TracingConfig {
    #[serde(default)]
    pub exporter: ExporterConfig,
    /// Name of the span opened for every push delivery
    #[serde(default = "default_span_name")]
    pub span_name: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            exporter: ExporterConfig::default(),
            span_name: default_span_name(),
            queue_capacity: default_queue_capacity(),
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl TracingConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.span_name.is_empty() {
            return Err(ValidationError::EmptyField("tracing.span_name"));
        }
        if self.queue_capacity == 0 {
            return Err(ValidationError::ZeroValue("tracing.queue_capacity"));
        }
        if self.max_batch_size == 0 {
            return Err(ValidationError::ZeroValue("tracing.max_batch_size"));
        }
        if self.flush_interval_ms == 0 {
            return Err(ValidationError::ZeroValue("tracing.flush_interval_ms"));
        }
        match &self.exporter {
            ExporterConfig::CloudTrace {
                project_id,
                endpoint,
                timeout_secs,
                auth,
            } => {
                if project_id.is_empty() {
                    return Err(ValidationError::EmptyField("tracing.exporter.project_id"));
                }
                if !is_http(endpoint) {
                    return Err(ValidationError::InvalidEndpoint("tracing.exporter.endpoint"));
                }
                if *timeout_secs == 0 {
                    return Err(ValidationError::ZeroValue("tracing.exporter.timeout_secs"));
                }
                auth.validate()
            }
            ExporterConfig::None | ExporterConfig::Log => Ok(()),
        }
    }
}

/// Span export backend
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExporterConfig {
    None,
    #[default]
    Log,
    CloudTrace {
        project_id: String,
        #[serde(default = "default_cloud_trace_endpoint")]
        endpoint: Url,
        #[serde(default = "default_export_timeout_secs")]
        timeout_secs: u64,
        #[serde(default)]
        auth: AuthConfig,
    },
}

impl ExporterConfig {
    fn cloud_trace(project_id: String) -> Self {
        ExporterConfig::CloudTrace {
            project_id,
            endpoint: default_cloud_trace_endpoint(),
            timeout_secs: default_export_timeout_secs(),
            auth: AuthConfig::default(),
        }
    }
}

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.has_host()
}

fn default_stream_path() -> String {
    "/stream".into()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_bigquery_endpoint() -> Url {
    Url::parse(DEFAULT_BIGQUERY_ENDPOINT).expect("default endpoint is a valid URL")
}

fn default_cloud_trace_endpoint() -> Url {
    Url::parse(DEFAULT_CLOUD_TRACE_ENDPOINT).expect("default endpoint is a valid URL")
}

fn default_metadata_token_url() -> Url {
    Url::parse(DEFAULT_METADATA_TOKEN_URL).expect("default metadata URL is valid")
}

fn default_insert_timeout_secs() -> u64 {
    10
}

fn default_export_timeout_secs() -> u64 {
    5
}

fn default_sink_name() -> String {
    "BigQuery".into()
}

fn default_span_name() -> String {
    "stream events app".into()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_batch_size() -> usize {
    64
}

fn default_flush_interval_ms() -> u64 {
    1000
}
