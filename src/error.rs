use std::time::Duration;

use thiserror::Error;

/// Broad classification of a [`ProvisioningError`]
///
/// Transient "still assigning" responses never surface as errors, they are absorbed by the
/// registration state machine and drive further polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The provisioning service answered with a terminal failure status
    Service,
    /// Connectivity, timeout or protocol failure below the registration protocol
    Transport,
    /// The service answered with a body or topic that could not be decoded
    MalformedResponse,
    /// The operation was interrupted by `cancel` or `disconnect`
    Cancelled,
    /// The caller used the client in a way the protocol does not allow
    InvalidOperation,
}

/// Errors that can be raised during provisioning or registration
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisioningError {
    /// The provisioning service rejected the request
    #[error("provisioning service rejected the request ({status}): {message}")]
    Service {
        /// HTTP (or MQTT topic) status code
        status: u16,
        /// Service error code, when the body carried one
        error_code: Option<i64>,
        /// Service supplied message, or the raw body
        message: String,
        /// Service tracking id for support requests
        tracking_id: Option<String>,
    },
    ///
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    ///
    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),
    ///
    #[cfg(feature = "http-transport")]
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    ///
    #[cfg(feature = "http-transport")]
    #[error("invalid http request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),
    /// MQTT protocol level failure (encoding, unexpected packets, refused subscriptions)
    #[error("mqtt error: {0}")]
    Mqtt(String),
    /// The broker refused the connection
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    /// The connection dropped while operations were outstanding
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// A network call did not complete in time
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The response body could not be decoded
    #[error("malformed response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
    /// The response topic could not be decoded
    #[error("malformed response topic: {0}")]
    MalformedTopic(String),
    /// The provisioning service replied, but there was no operation Id
    #[error("provisioning service reply is missing the operation id")]
    MissingOperationId,
    /// The provisioning service replied with a status this client does not understand
    #[error("unexpected registration status: {0}")]
    UnexpectedStatus(String),
    /// The operation was cancelled before a result arrived
    #[error("operation cancelled")]
    Cancelled,
    /// The operation is not allowed in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// A request id was registered twice in the correlation table
    #[error("request id {0} is already pending")]
    DuplicateRequestId(String),
    /// The selected transport cannot authenticate with the supplied credentials
    #[error("authentication not supported by this transport: {0}")]
    UnsupportedAuthentication(&'static str),
    /// The TPM challenge handler failed to produce a token
    #[error("tpm challenge failed: {0}")]
    TpmChallenge(String),
    /// The symmetric key could not be used to sign a token
    #[error("invalid symmetric key: {0}")]
    InvalidKey(String),
    /// The transport's background task is gone
    #[error("transport is closed")]
    TransportClosed,
}

impl ProvisioningError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisioningError::Service { .. } | ProvisioningError::UnexpectedStatus(_) => {
                ErrorKind::Service
            }
            ProvisioningError::MalformedResponse(_)
            | ProvisioningError::MalformedTopic(_)
            | ProvisioningError::MissingOperationId => ErrorKind::MalformedResponse,
            ProvisioningError::Cancelled => ErrorKind::Cancelled,
            ProvisioningError::InvalidOperation(_)
            | ProvisioningError::DuplicateRequestId(_)
            | ProvisioningError::UnsupportedAuthentication(_) => ErrorKind::InvalidOperation,
            _ => ErrorKind::Transport,
        }
    }

    /// Whether this error is the result of `cancel` or `disconnect`
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProvisioningError::Cancelled)
    }

    /// A copy of this error suitable for handing to a second waiter
    ///
    /// Source errors that cannot be cloned are flattened into their message.
    pub(crate) fn duplicate(&self) -> ProvisioningError {
        match self {
            ProvisioningError::Service {
                status,
                error_code,
                message,
                tracking_id,
            } => ProvisioningError::Service {
                status: *status,
                error_code: *error_code,
                message: message.clone(),
                tracking_id: tracking_id.clone(),
            },
            ProvisioningError::Timeout(d) => ProvisioningError::Timeout(*d),
            ProvisioningError::Cancelled => ProvisioningError::Cancelled,
            ProvisioningError::ConnectionRefused(m) => {
                ProvisioningError::ConnectionRefused(m.clone())
            }
            ProvisioningError::Mqtt(m) => ProvisioningError::Mqtt(m.clone()),
            ProvisioningError::ConnectionLost(m) => ProvisioningError::ConnectionLost(m.clone()),
            ProvisioningError::MalformedTopic(m) => ProvisioningError::MalformedTopic(m.clone()),
            ProvisioningError::MissingOperationId => ProvisioningError::MissingOperationId,
            ProvisioningError::UnexpectedStatus(m) => {
                ProvisioningError::UnexpectedStatus(m.clone())
            }
            ProvisioningError::InvalidOperation(m) => ProvisioningError::InvalidOperation(m),
            ProvisioningError::DuplicateRequestId(m) => {
                ProvisioningError::DuplicateRequestId(m.clone())
            }
            ProvisioningError::UnsupportedAuthentication(m) => {
                ProvisioningError::UnsupportedAuthentication(m)
            }
            other => match other.kind() {
                ErrorKind::MalformedResponse => ProvisioningError::MalformedTopic(other.to_string()),
                ErrorKind::Service => ProvisioningError::UnexpectedStatus(other.to_string()),
                _ => ProvisioningError::ConnectionLost(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        let service = ProvisioningError::Service {
            status: 401,
            error_code: Some(401002),
            message: "unauthorized".into(),
            tracking_id: None,
        };
        assert_eq!(service.kind(), ErrorKind::Service);
        assert_eq!(ProvisioningError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            ProvisioningError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            ProvisioningError::MissingOperationId.kind(),
            ErrorKind::MalformedResponse
        );
        assert_eq!(
            ProvisioningError::InvalidOperation("busy").kind(),
            ErrorKind::InvalidOperation
        );
    }

    #[test]
    fn duplicate_keeps_kind() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let errors = vec![
            ProvisioningError::MalformedResponse(parse),
            ProvisioningError::MissingOperationId,
            ProvisioningError::UnexpectedStatus("weird".into()),
            ProvisioningError::InvalidOperation("busy"),
            ProvisioningError::Io(std::io::Error::new(std::io::ErrorKind::Other, "reset")),
            ProvisioningError::TransportClosed,
        ];
        for err in errors {
            assert_eq!(err.duplicate().kind(), err.kind(), "{:?}", err);
        }
    }

    #[test]
    fn duplicate_keeps_service_details() {
        let err = ProvisioningError::Service {
            status: 400,
            error_code: Some(400004),
            message: "bad".into(),
            tracking_id: Some("t".into()),
        };
        match err.duplicate() {
            ProvisioningError::Service {
                status, error_code, ..
            } => {
                assert_eq!(status, 400);
                assert_eq!(error_code, Some(400004));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
