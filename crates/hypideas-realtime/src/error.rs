use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("realtime connection closed")]
    Closed,
}
