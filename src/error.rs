//! Error types for mrd-stream

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MrdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown message kind: {0}")]
    UnknownKind(u16),

    #[error("value too long: {0}")]
    ValueTooLong(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("unresolved config selector: {0}")]
    Config(String),

    #[error("resource error: {0}")]
    Resource(String),
}

pub type Result<T> = std::result::Result<T, MrdError>;
