// NovelMind Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NovelMindError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Port allocation error: {0}")]
    PortAllocation(String),

    #[error("Backend launch error: {0}")]
    Launch(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

// Implement serialization for Tauri commands
impl serde::Serialize for NovelMindError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NovelMindError>;
