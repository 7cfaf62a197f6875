use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the publisher service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Local intake directory configuration
    #[serde(default)]
    pub intake: IntakeConfig,
    /// Remote backend selection
    #[serde(default)]
    pub backend: BackendConfig,
    /// S3 configuration (required when `backend.kind = "s3"`)
    pub s3: Option<S3Config>,
    /// Remote call policy
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Pipeline execution limits
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Where uploaded bytes wait until the pipeline finishes
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    /// Directory holding opaque-named intake files
    #[serde(default = "default_intake_directory")]
    pub directory: PathBuf,
}

/// Which remote backend implementation to construct
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    S3,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Base URL the in-memory backend hands out references under
    #[serde(default = "default_memory_base_url")]
    pub memory_base_url: String,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for published files
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL for references (CDN or website endpoint)
    pub public_base_url: Option<String>,
    /// Apply a `public-read` ACL when granting visibility.
    /// Disable for buckets that expose objects through a bucket policy.
    #[serde(default = "default_true")]
    pub grant_acl: bool,
    /// Key prefix for published objects
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default, S3's minimum)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Remote call policy
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Upper bound for each individual remote call, in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of pipeline runs executing at once
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

/// API configuration for the upload endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Multipart field carrying the file
    #[serde(default = "default_file_field")]
    pub file_field: String,
}

/// Smallest part S3 accepts for any part but the last
const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

// Default value functions
fn default_service_name() -> String {
    "publisher-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_intake_directory() -> PathBuf {
    std::env::temp_dir().join("publisher-intake")
}

fn default_memory_base_url() -> String {
    "http://localhost:8080/objects".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "uploads".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    MIN_PART_SIZE_BYTES
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_runs() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    25 * 1024 * 1024 // 25MB
}

fn default_file_field() -> String {
    "file".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "publisher-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/publisher").required(false))
            .add_source(config::File::with_name("/etc/storefront/publisher").required(false))
            // Override with environment variables
            // PUBLISHER__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("PUBLISHER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-section requirements serde cannot express
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend.kind == BackendKind::S3 && self.s3.is_none() {
            anyhow::bail!("backend.kind = \"s3\" requires an [s3] section with a bucket");
        }
        if let Some(ref s3) = self.s3 {
            if s3.part_size_bytes < MIN_PART_SIZE_BYTES {
                anyhow::bail!("s3.part_size_bytes must be at least {MIN_PART_SIZE_BYTES}");
            }
        }
        if self.remote.call_timeout_secs == 0 {
            anyhow::bail!("remote.call_timeout_secs must be greater than zero");
        }
        if self.pipeline.max_concurrent_runs == 0 {
            anyhow::bail!("pipeline.max_concurrent_runs must be greater than zero");
        }
        Ok(())
    }

    /// Get the per-call remote timeout as Duration
    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.call_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            directory: default_intake_directory(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            memory_base_url: default_memory_base_url(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
            file_field: default_file_field(),
        }
    }
}
