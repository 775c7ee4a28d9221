use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// Configuration that must stop the monitor from starting at all.
    #[error("fatal configuration: {message}")]
    Config { message: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
