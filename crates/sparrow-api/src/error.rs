use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid api config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to assemble schema: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("failed to render document: {0}")]
    Document(#[from] serde_yaml::Error),
}
