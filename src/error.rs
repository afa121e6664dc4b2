//! Error types for the sidecar injector and the log relay

use thiserror::Error;

/// Main error type for loglet operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The admission request could not be acted on (e.g. no pod in it)
    #[error("invalid admission request: {0}")]
    InvalidRequest(String),

    /// Creating or deleting the pod-scoped RBAC objects failed
    #[error("provisioning error: {message}")]
    Provisioning {
        /// What was being provisioned when it failed
        message: String,
        /// The client error behind the failure, when there is one
        #[source]
        source: Option<Box<Error>>,
    },

    /// Looking up the service-account token secret failed
    #[error("lookup error: {0}")]
    Lookup(String),

    /// The followed log stream failed while reading
    #[error("log stream error: {0}")]
    Stream(String),

    /// The followed log stream closed. Always terminal for a relay run.
    #[error("log stream ended")]
    StreamEnded,

    /// The ingestion client rejected a record or could not be built
    #[error("ingestion error: {0}")]
    Ingestion(String),

    /// TLS material could not be loaded or applied
    #[error("TLS error: {0}")]
    Tls(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an invalid request error with the given message
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a provisioning error with the given message
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a provisioning error wrapping the client error that caused it
    pub fn provisioning_caused_by(msg: impl Into<String>, source: Error) -> Self {
        Self::Provisioning {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a lookup error with the given message
    pub fn lookup(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    /// Create a stream error with the given message
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create an ingestion error with the given message
    pub fn ingestion(msg: impl Into<String>) -> Self {
        Self::Ingestion(msg.into())
    }

    /// Create a TLS error with the given message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// HTTP-style status code reported in an admission denial
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidRequest(_) | Error::Config(_) => 400,
            Error::Kube(kube::Error::Api(e)) => e.code,
            Error::Provisioning {
                source: Some(source),
                ..
            } => source.status_code(),
            _ => 500,
        }
    }

    /// True when the error is the API server reporting 409 Conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// True when the error is the API server reporting 404 Not Found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }
}
