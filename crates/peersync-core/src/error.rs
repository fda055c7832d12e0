use thiserror::Error;

/// Errors that can occur in the sync layer.
///
/// Election timing out is not an error: `elect_leader` returns `Ok(false)`
/// when another instance holds leadership.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
