use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docstore::{
    api,
    backend::{DriveConfig, DriveStore, LocalStore, S3Config, S3Store, StorageBackend},
    config::{Config, StorageBackendKind},
    content::ContentStore,
    pipeline::{DocumentPipeline, MistralOcr, VisionDescriber},
    scheduler::{self, ProcessingScheduler},
    storage::Database,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "docstore starting");

    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db = Database::open(&config.data_dir)?;
    info!("Database opened at: {}", config.data_dir);

    // Initialize storage backend
    let backend = Arc::new(build_backend(&config)?);
    let content = ContentStore::new(db.clone(), Arc::clone(&backend), config.max_upload_size);

    // Processing is optional; without it stale records can never finish.
    let scheduler = if config.processing.is_enabled() {
        let scheduler = Arc::new(build_scheduler(&config, content.clone())?);
        scheduler.reconcile().await?;
        Some(scheduler)
    } else {
        let failed = scheduler::fail_stale(&db)?;
        if failed > 0 {
            info!(failed, "Failed stale processing records");
        }
        None
    };

    let worker_handles = match &scheduler {
        Some(s) => s.start(config.processing.workers),
        None => Vec::new(),
    };

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        content,
        scheduler,
    });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Listening on: {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Runs still in flight are reconciled on the next start.
    info!("Shutting down pipeline workers");
    for handle in worker_handles {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

fn build_backend(config: &Config) -> anyhow::Result<StorageBackend> {
    let timeout = config.request_timeout;
    let retry = config.retry_policy();

    let backend = match config.storage.backend {
        StorageBackendKind::Local => {
            let store = LocalStore::new(&config.storage.local_storage_path)?;
            info!(
                "Using local storage backend at: {}",
                config.storage.local_storage_path
            );
            StorageBackend::LocalDisk(store)
        }
        StorageBackendKind::S3 => {
            let s3 = &config.storage.s3;
            let required = |v: &Option<String>, name: &str| {
                v.clone()
                    .ok_or_else(|| anyhow::anyhow!("{name} validated in config"))
            };
            let store = S3Store::new(
                S3Config {
                    bucket: required(&s3.bucket, "S3_BUCKET")?,
                    region: s3.region.clone(),
                    endpoint: s3.endpoint.clone(),
                    prefix: s3.prefix.clone(),
                    access_key_id: required(&s3.access_key_id, "AWS_ACCESS_KEY_ID")?,
                    secret_access_key: required(&s3.secret_access_key, "AWS_SECRET_ACCESS_KEY")?,
                    session_token: s3.session_token.clone(),
                },
                timeout,
                retry,
            )?;
            info!(bucket = ?s3.bucket, region = %s3.region, "Using S3 storage backend");
            StorageBackend::ObjectStore(store)
        }
        StorageBackendKind::Drive => {
            let drive = &config.storage.drive;
            let required = |v: &Option<String>, name: &str| {
                v.clone()
                    .ok_or_else(|| anyhow::anyhow!("{name} validated in config"))
            };
            let store = DriveStore::new(
                DriveConfig::google(
                    required(&drive.client_id, "DRIVE_CLIENT_ID")?,
                    required(&drive.client_secret, "DRIVE_CLIENT_SECRET")?,
                    required(&drive.redirect_uri, "DRIVE_REDIRECT_URI")?,
                    drive.folder.clone(),
                    drive.credentials_file.clone(),
                ),
                timeout,
                retry,
            )?;
            info!(folder = %drive.folder, "Using Drive storage backend");
            StorageBackend::ConsumerDrive(store)
        }
    };
    Ok(backend)
}

fn build_scheduler(config: &Config, content: ContentStore) -> anyhow::Result<ProcessingScheduler> {
    let processing = &config.processing;
    let timeout = config.request_timeout;
    let retry = config.retry_policy();
    let missing = || anyhow::anyhow!("extraction API keys validated in config");

    let ocr = MistralOcr::new(
        processing.ocr_api_url.clone(),
        processing.ocr_api_key.clone().ok_or_else(missing)?,
        processing.ocr_model.clone(),
        timeout,
        retry.clone(),
    )?;
    let describer = VisionDescriber::new(
        processing.vision_api_url.clone(),
        processing.vision_api_key.clone().ok_or_else(missing)?,
        processing.vision_model.clone(),
        timeout,
        retry,
    )?;

    let db = content.db().clone();
    let pipeline = DocumentPipeline::new(
        content,
        Arc::new(ocr),
        Arc::new(describer),
        processing.image_concurrency,
    );
    info!(
        workers = processing.workers,
        image_concurrency = processing.image_concurrency,
        "Document processing enabled"
    );
    Ok(ProcessingScheduler::new(db, Arc::new(pipeline)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
