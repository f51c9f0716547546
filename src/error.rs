use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open database connection: {0}")]
    Connect(String),
    #[error("statement rejected: {0}")]
    Sql(String),
    #[error("missing or malformed row: {0}")]
    Schema(String),
    #[error("unknown type name: {0}")]
    TypeMap(String),
    #[error("size limit exceeded: {0}")]
    SizeLimit(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
