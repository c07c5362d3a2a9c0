use anyhow::{Context, Result, bail};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
mod storage;

use config::{AppConfig, Backend};
use state::AppState;
use storage::{local::LocalBlobStore, vercel::VercelBlobStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Loaded before the filter is built so RUST_LOG may come from .env.
    let dotenv = dotenv_problem(dotenvy::dotenv());

    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Some(err) = dotenv {
        tracing::warn!("Ignoring .env file: {}", err);
    }

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;

    tracing::info!("Starting blob-gallery with config: {:?}", cfg);

    // --- Initialize storage backend ---
    let state = match cfg.backend {
        Backend::Vercel => {
            if cfg.migrate {
                bail!("--migrate only applies to the local backend");
            }
            let settings = cfg.vercel_settings()?;
            let store = VercelBlobStore::new(&settings).context("creating Vercel Blob client")?;
            AppState::new(Arc::new(store))
        }
        Backend::Local => {
            let local = open_local_store(&cfg).await?;
            if cfg.migrate {
                tracing::info!("Database migration complete.");
                return Ok(()); // exit after migration
            }
            AppState::with_local(local)
        }
    };

    // --- Build router ---
    let app = routes::routes::app(state, &cfg.static_dir);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err).with_context(|| format!("binding {}", addr)),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Open (and migrate) the SQLite + disk backend, creating directories as needed.
async fn open_local_store(cfg: &AppConfig) -> Result<LocalBlobStore> {
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    let options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database url `{}`", cfg.database_url))?
        .create_if_missing(true);

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;

    let store = LocalBlobStore::new(Arc::new(db), &cfg.storage_dir, &cfg.public_base_url);
    store.migrate().await.context("applying schema")?;
    Ok(store)
}

/// A missing .env file is fine; the environment may be set directly.
fn dotenv_problem<T>(result: dotenvy::Result<T>) -> Option<dotenvy::Error> {
    match result {
        Ok(_) => None,
        Err(err) if err.not_found() => None,
        Err(err) => Some(err),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
