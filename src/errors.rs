//! Errors for the AIS sentinel
use std::path::PathBuf;
use thiserror::Error;

use crate::database::TransactionError;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Configuration invalid: {message}")]
    Configuration { message: String },

    #[error("Configuration load error")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Data file not found: {path}")]
    SourceMissing { path: PathBuf },

    #[error("Data file missing required columns: {columns:?}")]
    MissingColumns { columns: Vec<String> },

    #[error("Failed to decode source {path}: {message}")]
    SourceDecode { path: PathBuf, message: String },

    #[error("CSV error")]
    Csv(#[from] csv::Error),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Database error")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    DatabaseTransaction(#[from] TransactionError),

    #[error("Serialization error")]
    Serde(#[from] serde_json::Error),

    #[error("Job scheduler error")]
    JobScheduler(#[from] tokio_cron_scheduler::JobSchedulerError),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid MMSI: {value:?}")]
    InvalidMmsi { value: String },

    #[error("Invalid timestamp: {value:?}")]
    InvalidTimestamp { value: String },

    #[error("Unknown alert status: {value:?}")]
    InvalidAlertStatus { value: String },

    #[error("Unknown rule type: {value:?}")]
    InvalidRuleType { value: String },

    #[error("Alert {id} not found")]
    AlertNotFound { id: i64 },

    #[error("A replay session is already active")]
    AlreadyRunning,

    #[error("No replay session is active")]
    NotRunning,

    #[error("Failed to open database at {path}: {origin}")]
    DatabaseOpen { path: PathBuf, origin: String },

    #[error("Database configuration error - {message}: {origin}")]
    DatabaseConfig { message: String, origin: String },

    #[error("Failed to create table {table}: {origin}")]
    TableCreation { table: String, origin: String },

    #[error("Failed to create index {index}: {origin}")]
    IndexCreation { index: String, origin: String },
}

impl SentinelError {
    /// Shorthand for configuration validation failures.
    pub fn config(message: impl Into<String>) -> Self {
        SentinelError::Configuration {
            message: message.into(),
        }
    }
}
