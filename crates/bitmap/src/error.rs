use thiserror::Error;

pub type Result<T> = std::result::Result<T, BitmapError>;

#[derive(Debug, Error)]
pub enum BitmapError {
    #[error("unsupported bitmap format version: {0}")]
    UnsupportedVersion(u8),

    #[error("bitmap serialization failed: {0}")]
    Serialization(#[from] std::io::Error),

    #[error("recompute failed: {0}")]
    Resolve(String),
}
