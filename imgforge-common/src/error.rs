use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SizeError {
    #[error("unknown data size units in string: {0}")]
    UnknownUnit(String),
    #[error("invalid data size: {0:?}")]
    Invalid(String),
    #[error("data size out of range: {0}")]
    Overflow(String),
}

#[derive(Debug, Error)]
pub enum CommonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Size(#[from] SizeError),
    #[error("invalid checksum {0:?}: expected sha256:<64 hex digits>")]
    InvalidDigest(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("unknown architecture: {0}")]
    UnknownArch(String),
    #[error("invalid seed {value:?} in {var}: {reason}")]
    InvalidSeed {
        var: String,
        value: String,
        reason: String,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
