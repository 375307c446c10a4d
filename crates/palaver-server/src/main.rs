//! # palaver-server
//!
//! Backend for the Palaver AI chat application.
//!
//! This binary provides:
//! - **Quota ledger** tracking messages, tokens and uploads per user over a
//!   rolling window
//! - **Chat access control** with a short-lived per-chat cache
//! - **Message lifecycle** (send, edit, regenerate-from-here, votes, branching)
//! - **Blob storage** for uploads and generated files, scoped by hashed
//!   user/chat path segments
//! - **Cascading deletion** of chats and accounts
//! - **REST API** (axum) in front of all of the above

mod access;
mod api;
mod auth;
mod blob_store;
mod config;
mod deletion;
mod error;
mod messages;
mod quota;
mod storage;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use palaver_store::Database;

use crate::access::ChatAccessCache;
use crate::api::AppState;
use crate::blob_store::BlobStore;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,palaver_server=debug")),
        )
        .init();

    info!("Starting Palaver server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;

    // Blob store (creates the bucket directories if missing)
    let blob_store = Arc::new(
        BlobStore::new(config.storage_path.clone(), config.storage_base_url.clone()).await?,
    );

    let access_cache = ChatAccessCache::new(config.access_cache_ttl);

    let app_state = AppState {
        db: Arc::new(Mutex::new(db)),
        blob_store,
        access_cache: access_cache.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic access cache cleanup (every 5 minutes)
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            access_cache.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
