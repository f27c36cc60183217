use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub data_dir: String,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
    /// Timeout applied to every outbound backend and extraction call
    pub request_timeout: Duration,
    pub retry_max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendKind {
    Local,
    S3,
    Drive,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    /// Directory for local storage backend
    pub local_storage_path: String,
    pub s3: S3Settings,
    pub drive: DriveSettings,
}

#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: Option<String>,
    pub region: String,
    pub endpoint: Option<String>,
    pub prefix: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DriveSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub folder: String,
    pub credentials_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    pub ocr_api_url: String,
    pub ocr_api_key: Option<String>,
    pub ocr_model: String,
    pub vision_api_url: String,
    pub vision_api_key: Option<String>,
    pub vision_model: String,
    pub workers: usize,
    pub image_concurrency: usize,
}

impl ProcessingConfig {
    /// Processing runs only when both extraction services have credentials.
    pub fn is_enabled(&self) -> bool {
        self.ocr_api_key.is_some() && self.vision_api_key.is_some()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Local,
            local_storage_path: "./files".to_string(),
            s3: S3Settings {
                region: "us-east-1".to_string(),
                prefix: "docstore".to_string(),
                ..Default::default()
            },
            drive: DriveSettings {
                folder: "docstore".to_string(),
                credentials_file: PathBuf::from("./data/drive-credentials.json"),
                ..Default::default()
            },
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            ocr_api_url: "https://api.mistral.ai/v1/ocr".to_string(),
            ocr_api_key: None,
            ocr_model: "mistral-ocr-latest".to_string(),
            vision_api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            vision_api_key: None,
            vision_model: "gpt-4o-mini".to_string(),
            workers: 2,
            image_concurrency: 4,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            data_dir: "./data".to_string(),
            max_upload_size: 50 * 1024 * 1024, // 50MB
            storage: StorageConfig::default(),
            processing: ProcessingConfig::default(),
            request_timeout: Duration::from_secs(60),
            retry_max_attempts: 4,
        }
    }
}

/// Non-empty environment variable.
fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Some(raw) => raw.parse().map_err(|_| {
            ConfigError::ValidationError(format!("{name} has an invalid value: {raw}"))
        }),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let data_dir = var("DATA_DIR").unwrap_or(defaults.data_dir);

        let backend = match var("STORAGE_BACKEND")
            .unwrap_or_else(|| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => StorageBackendKind::Local,
            "s3" => StorageBackendKind::S3,
            "drive" => StorageBackendKind::Drive,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "STORAGE_BACKEND must be one of local, s3, drive (got {other})"
                )))
            }
        };

        let storage = StorageConfig {
            backend,
            local_storage_path: var("LOCAL_STORAGE_PATH")
                .unwrap_or(defaults.storage.local_storage_path),
            s3: S3Settings {
                bucket: var("S3_BUCKET"),
                region: var("S3_REGION").unwrap_or(defaults.storage.s3.region),
                endpoint: var("S3_ENDPOINT"),
                prefix: var("S3_PREFIX").unwrap_or(defaults.storage.s3.prefix),
                access_key_id: var("AWS_ACCESS_KEY_ID"),
                secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
                session_token: var("AWS_SESSION_TOKEN"),
            },
            drive: DriveSettings {
                client_id: var("DRIVE_CLIENT_ID"),
                client_secret: var("DRIVE_CLIENT_SECRET"),
                redirect_uri: var("DRIVE_REDIRECT_URI"),
                folder: var("DRIVE_FOLDER").unwrap_or(defaults.storage.drive.folder),
                credentials_file: var("DRIVE_CREDENTIALS_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(&data_dir).join("drive-credentials.json")),
            },
        };

        let processing = ProcessingConfig {
            ocr_api_url: var("OCR_API_URL").unwrap_or(defaults.processing.ocr_api_url),
            ocr_api_key: var("OCR_API_KEY"),
            ocr_model: var("OCR_MODEL").unwrap_or(defaults.processing.ocr_model),
            vision_api_url: var("VISION_API_URL").unwrap_or(defaults.processing.vision_api_url),
            vision_api_key: var("VISION_API_KEY"),
            vision_model: var("VISION_MODEL").unwrap_or(defaults.processing.vision_model),
            workers: parsed("PIPELINE_WORKERS", defaults.processing.workers)?,
            image_concurrency: parsed("IMAGE_CONCURRENCY", defaults.processing.image_concurrency)?,
        };

        let config = Config {
            bind_address: var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            data_dir,
            max_upload_size: parsed("MAX_UPLOAD_SIZE", defaults.max_upload_size)?,
            storage,
            processing,
            request_timeout: Duration::from_secs(parsed("REQUEST_TIMEOUT_SECS", 60u64)?),
            retry_max_attempts: parsed("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.storage.backend {
            StorageBackendKind::Local => {}
            StorageBackendKind::S3 => {
                let s3 = &self.storage.s3;
                if s3.bucket.is_none() {
                    return Err(ConfigError::ValidationError(
                        "S3_BUCKET is required when STORAGE_BACKEND=s3".to_string(),
                    ));
                }
                if s3.access_key_id.is_none() || s3.secret_access_key.is_none() {
                    return Err(ConfigError::ValidationError(
                        "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY are required when STORAGE_BACKEND=s3"
                            .to_string(),
                    ));
                }
            }
            StorageBackendKind::Drive => {
                let drive = &self.storage.drive;
                if drive.client_id.is_none()
                    || drive.client_secret.is_none()
                    || drive.redirect_uri.is_none()
                {
                    return Err(ConfigError::ValidationError(
                        "DRIVE_CLIENT_ID, DRIVE_CLIENT_SECRET and DRIVE_REDIRECT_URI are required when STORAGE_BACKEND=drive"
                            .to_string(),
                    ));
                }
            }
        }

        if self.max_upload_size == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_UPLOAD_SIZE must be greater than 0".to_string(),
            ));
        }
        if self.processing.workers == 0 || self.processing.image_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "PIPELINE_WORKERS and IMAGE_CONCURRENCY must be greater than 0".to_string(),
            ));
        }

        if !self.processing.is_enabled() {
            tracing::warn!("OCR_API_KEY or VISION_API_KEY not set; document processing is disabled");
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            ..RetryPolicy::default()
        }
    }
}
