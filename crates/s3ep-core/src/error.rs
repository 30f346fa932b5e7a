use thiserror::Error;

/// Cheap, copyable classification of a [`CoreError`] for callers that want to
/// branch on kind (e.g. to pick an HTTP status class) without matching the
/// full variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Provider,
    Crypto,
    Integrity,
    OutOfOrder,
    NotFound,
    Conflict,
    Cancelled,
    Policy,
}

impl ErrorKind {
    /// Whether the caller may retry the operation that produced this error.
    /// Per the error handling design: retry is permitted for `Cancelled` and
    /// transient `ProviderError`, never for `Integrity`, `OutOfOrder`, or
    /// `Conflict`.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::Cancelled | ErrorKind::Provider)
    }
}

/// The core's error taxonomy. Every variant's `Display` interpolates only
/// identifiers (object key, upload id, alias, fingerprint), never key
/// material, plaintext, or ciphertext.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("provider error (alias={alias:?}): {reason}")]
    ProviderError { alias: Option<String>, reason: String },

    #[error("crypto error: {0}")]
    CryptoError(String),

    #[error("integrity check failed for object {object_key:?}")]
    Integrity { object_key: Option<String> },

    #[error("part {got} submitted out of order for upload {upload_id:?} (expected {expected})")]
    OutOfOrder {
        upload_id: String,
        expected: u32,
        got: u32,
    },

    #[error("no session found for {0:?}")]
    NotFound(String),

    #[error("upload id {0:?} already in use")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("policy violation: {0}")]
    Policy(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ConfigError(_) => ErrorKind::Config,
            CoreError::ProviderError { .. } => ErrorKind::Provider,
            CoreError::CryptoError(_) => ErrorKind::Crypto,
            CoreError::Integrity { .. } => ErrorKind::Integrity,
            CoreError::OutOfOrder { .. } => ErrorKind::OutOfOrder,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::Policy(_) => ErrorKind::Policy,
        }
    }

    pub fn integrity(object_key: impl Into<String>) -> Self {
        CoreError::Integrity {
            object_key: Some(object_key.into()),
        }
    }

    pub fn integrity_anonymous() -> Self {
        CoreError::Integrity { object_key: None }
    }

    pub fn provider(alias: Option<&str>, reason: impl Into<String>) -> Self {
        CoreError::ProviderError {
            alias: alias.map(String::from),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
