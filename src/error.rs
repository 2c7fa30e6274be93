use std::io;

/// Unified error type for every fallible operation in this crate.
///
/// Mirrors the wire error taxonomy (`E_INVALID`, `E_BAD_BODY`, ...) plus the
/// operational and transport errors layered on top by the session, consumer
/// and producer supervisors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NsqError {
    #[error("invalid")]
    Invalid,
    #[error("bad body")]
    BadBody,
    #[error("bad topic")]
    BadTopic,
    #[error("bad channel")]
    BadChannel,
    #[error("bad message")]
    BadMessage,
    #[error("put failed")]
    PutFailed,
    #[error("pub failed")]
    PubFailed,
    #[error("mpub failed")]
    MPubFailed,
    #[error("auth disabled")]
    AuthDisabled,
    #[error("auth failed")]
    AuthFailed,
    #[error("unauthorized")]
    Unauthorized,

    #[error("finish failed")]
    FinishFailed,
    #[error("requeue failed")]
    RequeueFailed,
    #[error("touch failed")]
    TouchFailed,

    #[error("socket error: {0}")]
    SocketError(String),
    #[error("unknown frame type {0}")]
    FrameError(i32),

    #[error("no available connections")]
    NoConnections,
    #[error("message already responded")]
    AlreadyResponded,
    #[error("http error: {0}")]
    HttpError(String),

    #[error("unrecognized error code: {0}")]
    Unrecognized(String),

    /// Control-flow signal: a handler returns this to ask for a requeue
    /// with the consumer's configured delay/backoff instead of treating
    /// the return as a handler exception.
    #[error("requeue requested")]
    RequeueRequest,
}

impl NsqError {
    /// Whether this error code closes the session that produced it.
    ///
    /// Matches the fatal/non-fatal split in the wire error taxonomy; errors
    /// outside that taxonomy (transport, operational) are not meaningful
    /// here and return `false`.
    pub fn fatal(&self) -> bool {
        matches!(
            self,
            NsqError::Invalid
                | NsqError::BadBody
                | NsqError::BadTopic
                | NsqError::BadChannel
                | NsqError::BadMessage
                | NsqError::PutFailed
                | NsqError::PubFailed
                | NsqError::MPubFailed
                | NsqError::AuthDisabled
                | NsqError::AuthFailed
                | NsqError::Unauthorized
        )
    }

    /// Parses a wire error payload such as `E_BAD_TOPIC SUB could not ...`
    /// into a tagged `NsqError`, mirroring the reference client's
    /// `ERROR_CODES` dispatch table.
    pub fn from_wire(payload: &[u8]) -> NsqError {
        let text = String::from_utf8_lossy(payload);
        let code = text.split_whitespace().next().unwrap_or("");
        match code {
            "E_INVALID" => NsqError::Invalid,
            "E_BAD_BODY" => NsqError::BadBody,
            "E_BAD_TOPIC" => NsqError::BadTopic,
            "E_BAD_CHANNEL" => NsqError::BadChannel,
            "E_BAD_MESSAGE" => NsqError::BadMessage,
            "E_PUT_FAILED" => NsqError::PutFailed,
            "E_PUB_FAILED" => NsqError::PubFailed,
            "E_MPUB_FAILED" => NsqError::MPubFailed,
            "E_AUTH_DISABLED" => NsqError::AuthDisabled,
            "E_AUTH_FAILED" => NsqError::AuthFailed,
            "E_UNAUTHORIZED" => NsqError::Unauthorized,
            "E_FIN_FAILED" => NsqError::FinishFailed,
            "E_REQ_FAILED" => NsqError::RequeueFailed,
            "E_TOUCH_FAILED" => NsqError::TouchFailed,
            _ => NsqError::Unrecognized(text.into_owned()),
        }
    }
}

impl From<io::Error> for NsqError {
    fn from(e: io::Error) -> Self {
        NsqError::SocketError(e.to_string())
    }
}

impl From<serde_json::Error> for NsqError {
    fn from(e: serde_json::Error) -> Self {
        NsqError::HttpError(format!("json: {}", e))
    }
}

impl From<reqwest::Error> for NsqError {
    fn from(e: reqwest::Error) -> Self {
        NsqError::HttpError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NsqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_codes() {
        assert!(NsqError::from_wire(b"E_BAD_TOPIC SUB invalid").fatal());
        assert!(NsqError::from_wire(b"E_INVALID").fatal());
        assert!(!NsqError::from_wire(b"E_FIN_FAILED FIN failed").fatal());
    }

    #[test]
    fn unrecognized_is_not_fatal() {
        let err = NsqError::from_wire(b"E_SOMETHING_NEW oops");
        assert!(!err.fatal());
        match err {
            NsqError::Unrecognized(text) => assert!(text.starts_with("E_SOMETHING_NEW")),
            _ => panic!("expected Unrecognized"),
        }
    }
}
