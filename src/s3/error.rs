//! Error taxonomy for S3 operations

use hyper::StatusCode;
use thiserror::Error;

/// S3 client errors
#[derive(Error, Debug)]
pub enum S3Error {
    /// Transport-layer failure (connect, TLS, broken stream)
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status with the decoded S3 `<Error>` document
    #[error("s3 error: status {status} code {code} request-id {request_id}: {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
        request_id: String,
    },

    /// Credentials unusable or signing failed
    #[error("signature error: {0}")]
    Signature(String),

    /// Local file open/read/write/stat
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or incomplete response payload
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// External cancel signal or deadline expiry
    #[error("operation cancelled")]
    Cancelled,

    /// Caller-supplied input rejected before any request was made
    #[error("invalid input: {0}")]
    Input(String),
}

impl S3Error {
    /// Whether a pipeline worker may retry the failed attempt.
    ///
    /// Transport failures, HTTP status errors and local I/O are retried (the
    /// spool-and-retry paths always restart from a fresh temp file). Signature,
    /// protocol, cancellation and input errors are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            S3Error::Transport(_) | S3Error::Status { .. } | S3Error::Io(_)
        )
    }

    pub(crate) fn status(op: &str, status: StatusCode, code: String, message: String, request_id: String) -> Self {
        tracing::debug!(op, status = status.as_u16(), code = %code, "request rejected");
        S3Error::Status {
            status: status.as_u16(),
            code,
            message,
            request_id,
        }
    }
}

impl From<hyper::Error> for S3Error {
    fn from(err: hyper::Error) -> Self {
        S3Error::Transport(err.to_string())
    }
}

impl From<hyper::http::Error> for S3Error {
    fn from(err: hyper::http::Error) -> Self {
        S3Error::Transport(format!("request build error: {err}"))
    }
}

impl From<hyper_util::client::legacy::Error> for S3Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        S3Error::Transport(err.to_string())
    }
}

impl From<quick_xml::Error> for S3Error {
    fn from(err: quick_xml::Error) -> Self {
        S3Error::Protocol(format!("xml parse error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, S3Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(S3Error::Transport("reset".into()).is_retryable());
        assert!(S3Error::Status {
            status: 500,
            code: "InternalError".into(),
            message: String::new(),
            request_id: String::new(),
        }
        .is_retryable());
        assert!(S3Error::Io(std::io::Error::other("boom")).is_retryable());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(!S3Error::Cancelled.is_retryable());
        assert!(!S3Error::Input("same source and target".into()).is_retryable());
        assert!(!S3Error::Signature("bad key".into()).is_retryable());
        assert!(!S3Error::Protocol("missing UploadId".into()).is_retryable());
    }
}
