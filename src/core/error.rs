use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthzError {
    #[error("storage: backing store is either down or not configured")]
    StoreDown,

    #[error("Store operation failed: {0}")]
    Store(String),

    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown condition type: {0}")]
    UnknownCondition(String),

    #[error("Invalid condition {kind}: {reason}")]
    InvalidCondition { kind: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Audit pipeline error: {0}")]
    Pipeline(String),

    #[error("Shutdown callback failed ({manager}): {reason}")]
    Shutdown { manager: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl From<validator::ValidationErrors> for AuthzError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AuthzError::Config(errors.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthzError>;
