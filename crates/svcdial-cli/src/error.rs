//! Error types for the CLI

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("proxy error: {0}")]
    Proxy(#[from] svcdial_proxy::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },
}

impl Error {
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidUrl {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }
}
