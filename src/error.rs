use thiserror::Error;

/// Error types for the pusher-client library
#[derive(Error, Debug)]
pub enum PusherError {
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Already subscribed to channel {0}")]
    DuplicateSubscription(String),
    #[error("Channel authorization failed: {0}")]
    AuthError(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Send error: {0}")]
    SendError(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, PusherError>;
