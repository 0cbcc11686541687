use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Balance error: {0}")]
    Balance(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
