use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Method not implemented: {0}")]
    NotImplemented(String),

    #[error("HTTP version not supported: {0}")]
    VersionNotSupported(String),

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Upstream timed out")]
    GatewayTimeout,

    #[error("Server overloaded")]
    Overloaded,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl ProxyError {
    /// Status code and reason phrase for the error response written to the
    /// client, or `None` when the connection is abandoned without one.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            ProxyError::BadRequest(_) => Some((400, "Bad Request")),
            ProxyError::NotImplemented(_) => Some((501, "Not Implemented")),
            ProxyError::VersionNotSupported(_) => Some((505, "HTTP Version Not Supported")),
            ProxyError::BadGateway(_) => Some((502, "Bad Gateway")),
            ProxyError::GatewayTimeout => Some((504, "Gateway Timeout")),
            ProxyError::Overloaded => Some((503, "Service Unavailable")),
            ProxyError::Io(_) | ProxyError::Config(_) | ProxyError::ConnectionClosed => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
