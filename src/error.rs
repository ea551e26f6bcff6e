use thiserror::Error;

/// Failures surfaced by the client and session layers
#[derive(Debug, Error)]
pub enum Error {
    /// No API key stored; detected before any network call
    #[error("API key required - set your OpenRouter API key first")]
    MissingApiKey,

    /// Non-2xx response that is not worth retrying (4xx other than 429)
    #[error("API request failed: {status} {message}")]
    Api { status: u16, message: String },

    /// Request setup failure, 5xx or rate limit; retried with backoff
    #[error("network error: {0}")]
    Network(String),

    /// Body read failed after exhausting read retries
    #[error("stream interrupted: {0}")]
    Stream(String),

    /// A send is already in flight for this session
    #[error("a response is already being generated")]
    RequestInFlight,

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether the retry policy may re-attempt the operation
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Stream(_) => true,
            Error::Api { status, .. } => *status == 429 || *status >= 500,
            Error::MissingApiKey
            | Error::RequestInFlight
            | Error::UnknownModel(_)
            | Error::Storage(_) => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
