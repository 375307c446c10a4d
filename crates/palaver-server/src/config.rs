//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use palaver_shared::constants::MAX_UPLOAD_SIZE;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./data/palaver.db`
    pub database_path: PathBuf,

    /// Root directory of the blob storage buckets.
    /// Env: `STORAGE_PATH`
    /// Default: `./storage`
    pub storage_path: PathBuf,

    /// Public base URL that storage object URLs are built from. Duplication
    /// only accepts URLs under this prefix.
    /// Env: `STORAGE_BASE_URL`
    /// Default: `http://localhost:8080`
    pub storage_base_url: String,

    /// Header the upstream identity provider puts the session JSON in.
    /// Env: `SESSION_HEADER`
    /// Default: `x-palaver-session`
    pub session_header: String,

    /// Maximum upload size in bytes.
    /// Env: `MAX_UPLOAD_SIZE`
    /// Default: 10 MiB
    pub max_upload_size: usize,

    /// How long a chat's owner/visibility stays in the access cache.
    /// Env: `ACCESS_CACHE_TTL_SECS`
    /// Default: 60 seconds
    pub access_cache_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./data/palaver.db"),
            storage_path: PathBuf::from("./storage"),
            storage_base_url: "http://localhost:8080".to_string(),
            session_header: "x-palaver-session".to_string(),
            max_upload_size: MAX_UPLOAD_SIZE,
            access_cache_ttl: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }

        if let Some(url) = lookup("STORAGE_BASE_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if url.starts_with("http://") || url.starts_with("https://") {
                config.storage_base_url = url;
            } else {
                tracing::warn!(value = %url, "Invalid STORAGE_BASE_URL, using default");
            }
        }

        if let Some(header) = lookup("SESSION_HEADER") {
            if !header.trim().is_empty() {
                config.session_header = header.trim().to_ascii_lowercase();
            }
        }

        if let Some(val) = lookup("MAX_UPLOAD_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_upload_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_UPLOAD_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("ACCESS_CACHE_TTL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.access_cache_ttl = Duration::from_secs(secs),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid ACCESS_CACHE_TTL_SECS, using default")
                }
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
