use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Complete was already called for unit of work {0}")]
    CompleteCalledTwice(String),

    #[error("Invalid company id: {0}")]
    InvalidCompanyId(String),

    #[error("Unknown data filter '{0}'")]
    UnknownFilter(String),

    #[error("Unknown audit field '{0}'")]
    UnknownAuditField(String),

    #[error("No ambient context is installed on the current call chain")]
    NoAmbientContext,

    #[error("Ambient scope '{0}' released out of LIFO order")]
    ScopeReleasedOutOfOrder(String),

    #[error("Unit of work {0} is not active")]
    NotActive(String),

    #[error("Inner unit of work was disposed without calling complete")]
    InnerNotCompleted,

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Database concurrency error: {0}")]
    Concurrency(String),

    #[error("Operation failed: {0}")]
    Operation(String),
}

/// Coarse classification of [`UowError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Contract violations: fail fast, never retried.
    Configuration,
    /// Connection, session or transaction resolution failures.
    Resource,
    /// Optimistic concurrency conflicts on save or commit.
    Concurrency,
    /// Failures raised by the wrapped business operation.
    Operation,
}

impl UowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UowError::Configuration(_)
            | UowError::CompleteCalledTwice(_)
            | UowError::InvalidCompanyId(_)
            | UowError::UnknownFilter(_)
            | UowError::UnknownAuditField(_)
            | UowError::NoAmbientContext
            | UowError::ScopeReleasedOutOfOrder(_)
            | UowError::NotActive(_)
            | UowError::InnerNotCompleted => ErrorKind::Configuration,
            UowError::Resource(_) | UowError::Session(_) | UowError::Transaction(_) => {
                ErrorKind::Resource
            }
            UowError::Concurrency(_) => ErrorKind::Concurrency,
            UowError::Operation(_) => ErrorKind::Operation,
        }
    }

    /// Only concurrency conflicts are worth retrying; nothing is retried internally.
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }
}

pub type Result<T> = std::result::Result<T, UowError>;
