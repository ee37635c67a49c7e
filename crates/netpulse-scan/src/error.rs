//! Error types for the netpulse-scan crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Nmap not found at path: {path}")]
    NmapNotFound { path: String },

    #[error("Failed to launch scan process: {0}")]
    Launch(String),

    #[error("Scan timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Scan tool exited with code {code}: {stderr}")]
    ToolFailed { code: i32, stderr: String },

    #[error("Empty scan output")]
    EmptyOutput,

    #[error("Failed to parse scan XML output: {0}")]
    XmlParse(String),

    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Task {id} is not runnable (status: {status})")]
    TaskNotRunnable { id: i64, status: String },

    #[error("Invalid scan target: {0}")]
    InvalidTarget(String),

    #[error("Scheduling error: {0}")]
    Schedule(String),

    #[error("OUI update error: {0}")]
    OuiUpdate(String),

    #[error("Store error: {0}")]
    Store(#[from] netpulse_store::StoreError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScanError>;
