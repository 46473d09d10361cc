//! Error taxonomy for the ensurer.
//!
//! Nothing in here is retried. Errors propagate to the loop driver, which
//! either logs them and waits for the next cycle or stops, depending on
//! [`crate::config::CycleErrorPolicy`].

use ensurer_reconcile::MalformedAgentError;
use reqwest::{Method, StatusCode};
use thiserror::Error;

/// Failure talking to the CI server.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The server answered with a non-success status.
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
        body: String,
    },

    /// The request never produced a response.
    #[error("{method} {url} failed: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A success response whose body did not decode.
    #[error("{url} returned an unparsable body: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RemoteError {
    /// HTTP status of the failed response, if there was one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport { source, .. } => source.status(),
            Self::Decode { .. } => None,
        }
    }
}

/// Invalid or unresolvable configuration. Fatal before the loop starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("auth token refers to environment variable {name}, which is not set")]
    MissingTokenVariable { name: String },

    #[error("auth token is empty")]
    EmptyToken,

    #[error("auth token cannot be sent in an HTTP header")]
    InvalidToken,

    #[error("invalid base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("cloud profile id is empty")]
    EmptyCloudProfileId,

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Any error the ensurer can surface.
#[derive(Debug, Error)]
pub enum EnsurerError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    MalformedAgent(#[from] MalformedAgentError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_carries_status_and_body() {
        let err = RemoteError::Status {
            method: Method::GET,
            url: "https://ci.example.com/app/rest/agents".to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".to_string(),
        };

        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        let message = err.to_string();
        assert!(message.contains("GET"));
        assert!(message.contains("500"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn test_ensurer_error_is_transparent() {
        let err = EnsurerError::from(ConfigError::EmptyCloudProfileId);
        assert_eq!(err.to_string(), "cloud profile id is empty");
    }
}
