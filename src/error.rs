//! Crate error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("audio device error: {0:#}")]
    Device(anyhow::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend unhealthy: {0}")]
    Health(String),

    #[error("not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, Error>;
