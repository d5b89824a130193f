use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupted data: {0}")]
    Corruption(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("contract violation: {0}")]
    Invariant(String),
    #[error(
        "unequal step counts across domains (merge snapshots first): accounts={accounts}, storage={storage}, code={code}"
    )]
    Misaligned {
        accounts: usize,
        storage: usize,
        code: usize,
    },
}

impl StrataError {
    /// Cancellation propagates untouched and is not worth a warning line.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<rocksdb::Error> for StrataError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for StrataError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for StrataError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
