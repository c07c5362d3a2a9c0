use crate::storage::vercel::{DEFAULT_API_URL, VercelSettings};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, ValueEnum};
use std::{env, fmt, path::PathBuf};

/// Which storage backend the server proxies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Managed Vercel Blob storage.
    Vercel,
    /// SQLite metadata + local disk, served under `/blobs`.
    Local,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub blob_token: Option<String>,
    pub vercel_api_url: String,
    pub static_dir: PathBuf,
    pub storage_dir: String,
    pub database_url: String,
    pub public_base_url: String,
    pub migrate: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Blob gallery API")]
pub struct Args {
    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend (overrides BLOB_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Directory served as the frontend (overrides STATIC_DIR)
    #[arg(long)]
    pub static_dir: Option<PathBuf>,

    /// Directory where the local backend stores payloads (overrides STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// SQLite URL for the local backend (overrides DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Origin used in locators minted by the local backend (overrides PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Apply the local backend schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse the process environment + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge `args` over the variables returned by `lookup`, then defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_port = match lookup("PORT") {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing PORT value `{}`", value))?,
            None => 3000,
        };
        let env_backend = match lookup("BLOB_BACKEND") {
            Some(value) => Backend::from_str(&value, true)
                .map_err(|err| anyhow!(err))
                .with_context(|| format!("parsing BLOB_BACKEND value `{}`", value))?,
            None => Backend::Vercel,
        };

        let port = args.port.unwrap_or(env_port);
        let public_base_url = args
            .public_base_url
            .or_else(|| lookup("PUBLIC_BASE_URL"))
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        Ok(Self {
            host: args
                .host
                .or_else(|| lookup("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port,
            backend: args.backend.unwrap_or(env_backend),
            blob_token: lookup("BLOB_READ_WRITE_TOKEN").filter(|t| !t.trim().is_empty()),
            vercel_api_url: lookup("VERCEL_BLOB_API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.into()),
            static_dir: args
                .static_dir
                .or_else(|| lookup("STATIC_DIR").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("public")),
            storage_dir: args
                .storage_dir
                .or_else(|| lookup("STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| lookup("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/blobs.db".into()),
            public_base_url,
            migrate: args.migrate,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings for the Vercel backend. Fails when no token is configured.
    pub fn vercel_settings(&self) -> Result<VercelSettings> {
        let Some(token) = self.blob_token.clone() else {
            bail!("BLOB_READ_WRITE_TOKEN must be set to use the vercel backend");
        };
        Ok(VercelSettings {
            token,
            api_url: self.vercel_api_url.clone(),
        })
    }
}

// Manual impl so the blob token never reaches the logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("backend", &self.backend)
            .field("blob_token", &self.blob_token.as_ref().map(|_| "<redacted>"))
            .field("vercel_api_url", &self.vercel_api_url)
            .field("static_dir", &self.static_dir)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("public_base_url", &self.public_base_url)
            .field("migrate", &self.migrate)
            .finish()
    }
}
