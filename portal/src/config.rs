use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("dataset {0:?} may only contain letters, digits and underscores")]
    InvalidDataset(String),
    #[error("warehouse.job_timeout_secs must be greater than 0")]
    ZeroJobTimeout,
    #[error("upload.max_upload_bytes must be greater than 0")]
    ZeroUploadLimit,
}

/// Portal configuration. Every section has defaults, so an empty file is a
/// valid config.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub listener: Listener,
    pub gcp: GcpConfig,
    pub warehouse: WarehouseConfig,
    pub upload: UploadConfig,
    pub identity: IdentityConfig,
    pub analysis: AnalysisConfig,
    pub cloud_sql: Option<CloudSqlConfig>,
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Listener {
    pub host: String,
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

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GcpConfig {
    pub project: String,
    /// Dataset holding base, analysis and view tables.
    pub dataset: String,
    /// Location new datasets are created in.
    pub dataset_location: String,
    pub bucket: String,
    pub sql_import_topic: String,
    pub credentials: Credentials,
    pub endpoints: Endpoints,
}

impl Default for GcpConfig {
    fn default() -> Self {
        GcpConfig {
            project: "data-analysis-webapp".into(),
            dataset: "analysis_dataset".into(),
            dataset_location: "US".into(),
            bucket: "data-analysis-upload-1000".into(),
            sql_import_topic: "sql-import-topic".into(),
            credentials: Credentials::default(),
            endpoints: Endpoints::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// Default service account of the instance the portal runs on.
    #[default]
    MetadataServer,
    Static {
        #[serde(skip_serializing)]
        token: String,
    },
}

/// Base URL overrides for the Google APIs, used to point at fakes. Unset
/// entries use the public endpoints.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Endpoints {
    pub storage: Option<Url>,
    pub bigquery: Option<Url>,
    pub pubsub: Option<Url>,
    pub sqladmin: Option<Url>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WarehouseConfig {
    pub job_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl WarehouseConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        WarehouseConfig {
            job_timeout_secs: 120,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    pub max_upload_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            max_upload_bytes: 100 * 1024 * 1024,
        }
    }
}

pub const DEFAULT_IDENTITY_HEADER: &str = "x-goog-authenticated-user-email";
pub const DEFAULT_IDENTITY_PREFIX: &str = "accounts.google.com:";
pub const DEFAULT_TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";
pub const DEFAULT_TOKEN_PARAM: &str = "id_token";

fn default_identity_header() -> String {
    DEFAULT_IDENTITY_HEADER.into()
}

fn default_identity_prefix() -> String {
    DEFAULT_IDENTITY_PREFIX.into()
}

fn default_tokeninfo_url() -> String {
    DEFAULT_TOKENINFO_URL.into()
}

fn default_token_param() -> String {
    DEFAULT_TOKEN_PARAM.into()
}

/// How requests are tied to a principal.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IdentityConfig {
    /// An authenticating proxy in front of the portal asserts the user in a
    /// header.
    ProxyHeader {
        #[serde(default = "default_identity_header")]
        header: String,
        #[serde(default = "default_identity_prefix")]
        prefix: String,
    },
    /// The client presents an identity token which is checked against a
    /// token-info endpoint.
    BearerToken {
        #[serde(default = "default_tokeninfo_url")]
        tokeninfo_url: String,
        #[serde(default)]
        audience: Option<String>,
        #[serde(default = "default_token_param")]
        query_param: String,
        #[serde(default = "default_token_param")]
        form_field: String,
    },
    None,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig::ProxyHeader {
            header: default_identity_header(),
            prefix: default_identity_prefix(),
        }
    }
}

/// Which table a preview reads when both base and analysis tables exist.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourcePolicy {
    #[default]
    BaseFirst,
    AnalysisFirst,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub source_policy: SourcePolicy,
    /// Run previews on another portal deployment instead of in-process.
    pub service_url: Option<Url>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CloudSqlConfig {
    pub instance: String,
    pub database: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Loads the file if given, applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides settings from environment variables, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.listener.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "PORT",
                value: port,
            })?;
        }

        let strings: [(&'static str, &mut String); 5] = [
            ("GCP_PROJECT", &mut self.gcp.project),
            ("BIGQUERY_DATASET", &mut self.gcp.dataset),
            ("BIGQUERY_LOCATION", &mut self.gcp.dataset_location),
            ("BUCKET_NAME", &mut self.gcp.bucket),
            ("PUBSUB_TOPIC_FOR_SQL_IMPORT", &mut self.gcp.sql_import_topic),
        ];
        for (name, field) in strings {
            if let Some(value) = lookup(name) {
                *field = value;
            }
        }

        if let Some(url) = lookup("ANALYSIS_SERVICE_URL") {
            let parsed = Url::parse(&url).map_err(|_| ConfigError::InvalidEnv {
                name: "ANALYSIS_SERVICE_URL",
                value: url,
            })?;
            self.analysis.service_url = Some(parsed);
        }

        let instance = lookup("CLOUDSQL_INSTANCE");
        let database = lookup("CLOUDSQL_DATABASE");
        if instance.is_some() || database.is_some() {
            let current = self.cloud_sql.take();
            self.cloud_sql = Some(CloudSqlConfig {
                instance: instance
                    .or_else(|| current.as_ref().map(|c| c.instance.clone()))
                    .unwrap_or_default(),
                database: database
                    .or_else(|| current.as_ref().map(|c| c.database.clone()))
                    .unwrap_or_default(),
            });
        }

        if let Some(token) = lookup("GOOGLE_OAUTH_ACCESS_TOKEN") {
            self.gcp.credentials = Credentials::Static { token };
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.listener.port == 0 {
            return Err(ValidationError::InvalidPort);
        }

        let required = [
            ("gcp.project", &self.gcp.project),
            ("gcp.dataset", &self.gcp.dataset),
            ("gcp.dataset_location", &self.gcp.dataset_location),
            ("gcp.bucket", &self.gcp.bucket),
            ("gcp.sql_import_topic", &self.gcp.sql_import_topic),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::Empty(name));
            }
        }

        if !self
            .gcp
            .dataset
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(ValidationError::InvalidDataset(self.gcp.dataset.clone()));
        }

        if let Credentials::Static { token } = &self.gcp.credentials
            && token.is_empty()
        {
            return Err(ValidationError::Empty("gcp.credentials.token"));
        }

        if let Some(cloud_sql) = &self.cloud_sql {
            if cloud_sql.instance.is_empty() {
                return Err(ValidationError::Empty("cloud_sql.instance"));
            }
            if cloud_sql.database.is_empty() {
                return Err(ValidationError::Empty("cloud_sql.database"));
            }
        }

        if self.warehouse.job_timeout_secs == 0 {
            return Err(ValidationError::ZeroJobTimeout);
        }
        if self.upload.max_upload_bytes == 0 {
            return Err(ValidationError::ZeroUploadLimit);
        }

        Ok(())
    }
}
