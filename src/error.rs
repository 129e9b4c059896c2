//! Error types for wuflow.

use std::path::PathBuf;

/// Top-level error type for the pipeline daemons.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transitioner error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Assimilation error: {0}")]
    Assimilate(#[from] AssimilateError),

    #[error("File deletion error: {0}")]
    Sweep(#[from] SweepError),

    #[error("Purge error: {0}")]
    Purge(#[from] PurgeError),

    #[error("Feeder error: {0}")]
    Feeder(#[from] FeederError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job-store errors. Connection loss and failed queries are systemic:
/// every daemon treats them as fatal and relies on external restart.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open job store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: i64 },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Transition Engine errors. A single workunit failing is treated as
/// systemic by policy: one bad WU is historically more often a shared
/// bug than an isolated data problem.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("Store error handling WU {wu_id}: {source}")]
    Store {
        wu_id: i64,
        #[source]
        source: StoreError,
    },

    #[error("Concurrent update detected on WU {wu_id}; another process changed the row")]
    ConcurrentUpdate { wu_id: i64 },
}

/// Assimilation Runner errors.
#[derive(Debug, thiserror::Error)]
pub enum AssimilateError {
    /// A handler reported an unexpected failure. The runner exits with
    /// `code` rather than continuing and corrupting subsequent WUs.
    #[error("Assimilate handler failed on WU {wu_id} (exit code {code}): {reason}")]
    Handler {
        wu_id: i64,
        code: i32,
        reason: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// File Deletion Sweeper errors.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Malformed file manifest for {entity} {id}: {reason}")]
    BadManifest {
        entity: &'static str,
        id: i64,
        reason: String,
    },

    #[error("Upload directory missing: {0}")]
    UploadDirMissing(PathBuf),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// DB Purge / Archiver errors.
#[derive(Debug, thiserror::Error)]
pub enum PurgeError {
    #[error("Archive write failed: {0}")]
    Archive(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Feeder errors.
#[derive(Debug, thiserror::Error)]
pub enum FeederError {
    #[error("No job streams configured; pass at least one --user ID SHARE")]
    NoStreams,

    #[error("Invalid share {share} for user {user_id}: shares must be positive")]
    InvalidShare { user_id: i64, share: f64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
