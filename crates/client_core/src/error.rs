use shared::error::ApiError;
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid api base url '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("backend rejected request: {0}")]
    Api(#[from] ApiError),
    #[error("malformed response from {endpoint}: {reason}")]
    MalformedResponse { endpoint: String, reason: String },
}

impl ClientError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ClientError::Api(err) => Some(err),
            _ => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ClientError::Api(err) => err.message.clone(),
            ClientError::Transport { .. } | ClientError::HttpClient(_) => {
                "Server unreachable; check your connection and retry.".to_string()
            }
            ClientError::MalformedResponse { .. } => {
                "The server sent an unexpected response.".to_string()
            }
            ClientError::InvalidBaseUrl { url, .. } => format!("Invalid server address: {url}"),
        }
    }
}
