use thiserror::Error;

/// Errors produced across the Drawbridge gateway.
#[derive(Debug, Error)]
pub enum DrawbridgeError {
    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("authorization failure: {0}")]
    Authorization(String),

    #[error("protocol failure: {0}")]
    Protocol(String),

    #[error("unknown service: {0}")]
    UnknownService(u16),

    #[error("target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("outbound connection evicted")]
    OutboundEvicted,

    #[error("store failure: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type DrawbridgeResult<T> = Result<T, DrawbridgeError>;
