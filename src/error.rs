//! Error types for controller link operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Outbound queue full ({0} frames pending)")]
    QueueFull(usize),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Invalid track: {0}")]
    InvalidTrack(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
