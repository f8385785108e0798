//! Structured status codes surfaced by the store.
//!
//! Tier operations bubble these up to the `EmbeddingVariable` façade.
//! `NotFound` is not an error on the fast path — it signals "create if
//! admitted" and optimizer callers treat it as "skip this id".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Id absent from every tier.
    #[error("id not found")]
    NotFound,

    /// Configuration conflict, shape mismatch, or reserved key.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires state that has not been established yet.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// SSD read/write failure. Surfaced, never retried inside the core.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum mismatch during an SSD read or restart scan.
    #[error("corruption: {0}")]
    Corruption(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::FailedPrecondition(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        fn read() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))?;
            Ok(())
        }
        match read() {
            Err(Error::Io(e)) => assert_eq!(e.to_string(), "disk gone"),
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
