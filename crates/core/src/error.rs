use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown arm: {0}")]
    UnknownArm(String),

    #[error("Duplicate arm id: {0}")]
    DuplicateArm(String),

    #[error("Bandit requires at least one arm")]
    NoArms,

    #[error("Empty action set")]
    EmptyActionSet,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The backing store could not be read or written.
    #[error("State store error: {0}")]
    Store(String),

    /// The in-memory mutation was applied but the snapshot write failed.
    /// The next successful persist carries the missed update.
    #[error("Persist failed after in-memory update: {0}")]
    Persist(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
