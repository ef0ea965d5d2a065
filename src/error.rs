// Error types for each layer of the importer.
// Recoverable conditions (unknown counts, empty pages, per-row failures) never
// become errors; only these do.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid configuration:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),

    #[error("SQL client binary not found (install hdbsql or set HANA_CLIENT_PATH)")]
    ClientNotFound,
}

/// Failures invoking the external SQL client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("timeout after {}s waiting for the SQL client", .0.as_secs())]
    Timeout(Duration),

    #[error("failed to spawn SQL client {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SQL file does not exist: {0}")]
    MissingFile(PathBuf),

    #[error("I/O error talking to SQL client: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }
}

/// Failures turning DDL into a table description.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("no column definitions found in DDL for {0}")]
    NoColumns(String),
}

/// Failures reading the export archive or extracted tree.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("export not found: neither {archive} nor {extracted} exists")]
    NotFound { archive: PathBuf, extracted: PathBuf },

    #[error("could not detect the export schema name (set SCHEMA)")]
    NoSchema,

    #[error("archive error in {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Umbrella error for run-level operations.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} not found in the export")]
    MissingExportFile(String),

    #[error("cannot connect to the database: {0}")]
    Connectivity(String),

    #[error("thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T, E = ImportError> = std::result::Result<T, E>;
