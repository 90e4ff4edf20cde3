//! Formgate Web Server - signed form submission receiver.
//!
//! This binary:
//! - Loads the signer's public keys and keeps them fresh in the background
//! - Verifies every submission before it reaches the store
//! - Optionally mirrors the store to a directory and restores it on start

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use formgate::store::SubmissionRepository;
use formgate::web::router;
use formgate::{
    AppState, Config, HttpKeySource, IngestionPipeline, JsonDirRepository, KeyCache,
    PersistenceWriter, SignatureVerifier, SubmissionStore,
};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        keys_url = %config.keys_url,
        key_cache_ttl_secs = config.key_cache_ttl.as_secs(),
        signature_max_skew_secs = config.signature_max_skew.as_secs(),
        key_unavailable_policy = ?config.key_unavailable_policy,
        store_capacity = config.store_capacity,
        persistence_enabled = config.store_data_dir.is_some(),
        retention_days = ?config.retention_days,
        admin_token_configured = config.admin_token.is_some(),
        "config_loaded"
    );

    // Key cache: one eager load, then refreshed on demand
    let source = HttpKeySource::new(config.keys_url.clone(), config.key_fetch_timeout)
        .context("Failed to build key source client")?;
    let cache = KeyCache::new(Arc::new(source), config.key_cache_ttl, config.key_fetch_timeout);
    match cache.await_refresh().await {
        Ok(snapshot) => info!(keys = snapshot.len(), "initial_keys_loaded"),
        Err(e) => warn!(error = %e, "initial_key_load_failed"),
    }
    let verifier = SignatureVerifier::new(cache, config.signature_max_skew);

    // Submission store, optionally mirrored to disk
    let mut store = SubmissionStore::new(config.store_capacity);
    let mut writer = None;
    if let Some(dir) = &config.store_data_dir {
        let repository = JsonDirRepository::open(dir)
            .await
            .with_context(|| format!("Failed to open data directory {}", dir.display()))?;
        let restored = store
            .restore(&repository)
            .await
            .context("Failed to restore persisted submissions")?;
        info!(restored = restored, data_dir = %dir.display(), "store_restored");

        let repository: Arc<dyn SubmissionRepository> = Arc::new(repository);
        let (handle, task) = PersistenceWriter::spawn(repository, config.persist_queue_depth);
        store = store.with_persistence(handle.clone());
        writer = Some((handle, task));
    }
    let store = Arc::new(store);

    let mut pipeline =
        IngestionPipeline::new(verifier, Arc::clone(&store), config.key_unavailable_policy);
    if let Some(forms) = &config.allowed_form_ids {
        pipeline = pipeline.with_allowed_forms(forms.iter().cloned());
    }

    if let Some(days) = config.retention_days {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let removed = store.cleanup(days);
                if removed > 0 {
                    info!(removed = removed, retention_days = days, "retention_sweep");
                }
            }
        });
    }

    if config.admin_token.is_none() {
        warn!("admin_token_not_configured");
    }
    let app = router(AppState::new(pipeline).with_admin_token(config.admin_token.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain pending persistence jobs
    if let Some((handle, _task)) = writer {
        if let Err(e) = handle.flush().await {
            warn!(error = %e, "persistence_flush_failed");
        }
        info!(
            failures = handle.failures(),
            dropped = handle.dropped(),
            "persistence_writer_drained"
        );
    }

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
