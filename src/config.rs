use std::time::Duration;

use thiserror::Error;

use crate::object_store::key;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub uploads: UploadConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
    /// Base of URLs the service hands out, including locally signed ones.
    pub public_base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    S3,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for local storage backend
    pub local_storage_path: String,
    /// HMAC key for locally signed transfer URLs. Without it the local
    /// backend only supports proxied transfers.
    pub signing_secret: Option<String>,
    pub default_bucket: String,
    pub public_bucket: Option<String>,
    pub s3: S3Config,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...)
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub force_path_style: bool,
    /// Base for direct URLs into the public bucket
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Maximum upload size in bytes; also the `general` purpose limit
    pub max_upload_size: u64,
    pub avatar_max_size: u64,
    pub resize_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub presign_ttl: Duration,
    pub redirect_cache_max_entries: usize,
    pub redirect_cache_ttl: Duration,
    pub variant_fallback: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            data_dir: "./data".to_string(),
            public_base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            local_storage_path: "./files".to_string(),
            signing_secret: None,
            default_bucket: "files".to_string(),
            public_bucket: None,
            s3: S3Config::default(),
            timeout: Duration::from_millis(30_000),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_size: 50 * MIB,
            avatar_max_size: 5 * MIB,
            resize_concurrency: 2,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            presign_ttl: Duration::from_secs(900),
            redirect_cache_max_entries: 1024,
            redirect_cache_ttl: Duration::from_secs(300),
            variant_fallback: true,
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env_opt(name) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::ValidationError(format!("{name} has an invalid value '{raw}'"))
        }),
        None => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env_opt(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let node = NodeConfig {
            bind_address: env_opt("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            data_dir: env_opt("DATA_DIR").unwrap_or_else(|| "./data".to_string()),
            public_base_url: env_opt("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
        };

        let backend = match env_opt("STORAGE_BACKEND")
            .unwrap_or_else(|| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => StorageBackend::Local,
            "s3" => StorageBackend::S3,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "STORAGE_BACKEND must be 'local' or 's3', got '{other}'"
                )))
            }
        };

        let storage = StorageConfig {
            backend,
            local_storage_path: env_opt("LOCAL_STORAGE_PATH")
                .unwrap_or_else(|| "./files".to_string()),
            signing_secret: env_opt("SIGNING_SECRET"),
            default_bucket: env_opt("DEFAULT_BUCKET").unwrap_or_else(|| "files".to_string()),
            public_bucket: env_opt("PUBLIC_BUCKET"),
            s3: S3Config {
                endpoint: env_opt("S3_ENDPOINT"),
                region: env_opt("S3_REGION"),
                force_path_style: env_bool("S3_FORCE_PATH_STYLE", false),
                public_base_url: env_opt("S3_PUBLIC_BASE_URL"),
            },
            timeout: Duration::from_millis(env_parse("STORAGE_TIMEOUT_MS", 30_000)?),
        };

        let uploads = UploadConfig {
            max_upload_size: env_parse("MAX_UPLOAD_SIZE", 50 * MIB)?,
            avatar_max_size: env_parse("AVATAR_MAX_SIZE", 5 * MIB)?,
            resize_concurrency: env_parse("RESIZE_CONCURRENCY", 2)?,
        };

        let delivery = DeliveryConfig {
            presign_ttl: Duration::from_secs(env_parse("PRESIGN_TTL_SECS", 900)?),
            redirect_cache_max_entries: env_parse("REDIRECT_CACHE_MAX_ENTRIES", 1024)?,
            redirect_cache_ttl: Duration::from_secs(env_parse("REDIRECT_CACHE_TTL_SECS", 300)?),
            variant_fallback: env_bool("VARIANT_FALLBACK", true),
        };

        let config = Config {
            node,
            storage,
            uploads,
            delivery,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        key::validate_bucket(&self.storage.default_bucket)
            .map_err(|e| ConfigError::ValidationError(format!("DEFAULT_BUCKET: {e}")))?;
        if let Some(ref bucket) = self.storage.public_bucket {
            key::validate_bucket(bucket)
                .map_err(|e| ConfigError::ValidationError(format!("PUBLIC_BUCKET: {e}")))?;
        }

        if self.delivery.redirect_cache_ttl >= self.delivery.presign_ttl {
            return Err(ConfigError::ValidationError(
                "REDIRECT_CACHE_TTL_SECS must be shorter than PRESIGN_TTL_SECS".to_string(),
            ));
        }

        if self.storage.timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "STORAGE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        if self.uploads.max_upload_size == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_UPLOAD_SIZE must be greater than zero".to_string(),
            ));
        }

        if self.uploads.avatar_max_size > self.uploads.max_upload_size {
            tracing::warn!(
                "AVATAR_MAX_SIZE ({}) exceeds MAX_UPLOAD_SIZE ({}); the smaller limit applies",
                self.uploads.avatar_max_size,
                self.uploads.max_upload_size
            );
        }

        if self.storage.backend == StorageBackend::Local && self.storage.signing_secret.is_none() {
            tracing::warn!("SIGNING_SECRET not set; local storage will only accept proxied uploads");
        }

        Ok(())
    }
}
