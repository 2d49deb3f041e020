use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloudtapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid checkpoint key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CloudtapError {
    fn from(e: serde_json::Error) -> Self {
        CloudtapError::Serialize(e.to_string())
    }
}
