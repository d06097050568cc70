use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fm_core::{
    api,
    cache::RedirectCache,
    config::{Config, StorageBackend},
    links::LinkTracker,
    object_store as obj,
    policy::UploadPolicy,
    service::{FileService, ServiceOptions},
    storage::{Connector, Database},
    variants::ImageVariantPipeline,
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

    info!(version = env!("CARGO_PKG_VERSION"), "fm-core starting");

    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    // Initialize object store backend
    let (object_store, local_store): (Arc<dyn obj::ObjectStore>, Option<Arc<obj::LocalStore>>) =
        match config.storage.backend {
            StorageBackend::Local => {
                let mut store = obj::LocalStore::new(&config.storage.local_storage_path)?;
                if let Some(ref secret) = config.storage.signing_secret {
                    store = store.with_signing(secret.as_bytes(), &config.node.public_base_url);
                }
                info!(
                    "Using local storage backend at: {}",
                    config.storage.local_storage_path
                );
                let store = Arc::new(store);
                (Arc::clone(&store) as Arc<dyn obj::ObjectStore>, Some(store))
            }
            StorageBackend::S3 => {
                let s3 = &config.storage.s3;
                let store = obj::S3Store::new(
                    s3.endpoint.as_deref(),
                    s3.region.as_deref(),
                    s3.force_path_style,
                    s3.public_base_url.clone(),
                )
                .await;
                info!(
                    endpoint = s3.endpoint.as_deref().unwrap_or("aws"),
                    "Using S3 storage backend"
                );
                (Arc::new(store), None)
            }
        };
    info!(capabilities = ?object_store.capabilities(), "Storage capabilities");

    let connector: Arc<dyn Connector> = Arc::new(db);

    let service = FileService::new(
        object_store,
        Arc::clone(&connector),
        UploadPolicy::with_defaults(
            config.uploads.max_upload_size,
            config.uploads.avatar_max_size,
        ),
        RedirectCache::new(
            config.delivery.redirect_cache_max_entries,
            config.delivery.redirect_cache_ttl,
        ),
        ImageVariantPipeline::new(config.uploads.resize_concurrency),
        ServiceOptions {
            default_bucket: config.storage.default_bucket.clone(),
            public_bucket: config.storage.public_bucket.clone(),
            presign_ttl: config.delivery.presign_ttl,
            storage_timeout: config.storage.timeout,
            variant_fallback: config.delivery.variant_fallback,
        },
    );

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        service: Arc::new(service),
        links: LinkTracker::new(connector),
        local_store,
    });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
