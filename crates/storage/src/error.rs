//! Backend error types.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

/// Errors produced by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Builds an API error from a status code and store error code.
    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for failures that are worth retrying: network errors,
    /// throttling, server-side errors and request timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, code, .. } => {
                *status >= 500
                    || *status == 429
                    || matches!(
                        code.as_str(),
                        "RequestTimeout" | "SlowDown" | "InternalError" | "ServiceUnavailable"
                    )
            }
            Self::Auth(_)
            | Self::InvalidEndpoint(_)
            | Self::InvalidRequest(_)
            | Self::BucketNotFound(_)
            | Self::InvalidResponse(_)
            | Self::Io(_) => false,
        }
    }
}

impl<E> From<SdkError<E, HttpResponse>> for BackendError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    fn from(err: SdkError<E, HttpResponse>) -> Self {
        match &err {
            SdkError::ServiceError(context) => Self::Api {
                status: context.raw().status().as_u16(),
                code: context.err().code().unwrap_or("Unknown").to_string(),
                message: context.err().message().unwrap_or_default().to_string(),
            },
            SdkError::ConstructionFailure(_) => {
                Self::InvalidRequest(DisplayErrorContext(&err).to_string())
            }
            SdkError::ResponseError(_) => {
                Self::InvalidResponse(DisplayErrorContext(&err).to_string())
            }
            // Timeouts and dispatch failures never reached a store decision.
            _ => Self::Http(DisplayErrorContext(&err).to_string()),
        }
    }
}
