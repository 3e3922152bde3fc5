//! Error types for resource loading

/// Errors from loading resources into the pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resource source unreadable: {0}")]
    Unreadable(String),

    #[error("resource source yielded no usable entries ({skipped} malformed, {duplicates} duplicate)")]
    NoUsableEntries { skipped: usize, duplicates: usize },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
