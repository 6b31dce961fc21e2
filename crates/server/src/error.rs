//! Structured, wire-facing error types for the gateway core.
//!
//! Per spec §7/§10.4: domain errors that cross a boundary (auth, upgrade,
//! router dispatch) are `thiserror` enums with a `to_error_info()`-style
//! conversion to the client-safe [`ErrorInfo`] envelope. Call-site glue in
//! the binary (config loading, startup) uses `anyhow::Result` instead, since
//! it only ever needs to log-and-exit.

use gatehouse_protocol::{ErrorCode, ErrorInfo};

/// Rejections raised during `HandleUpgrade`, before a `Connection` exists.
/// Maps 1:1 onto the HTTP status codes in spec §6.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpgradeError {
    #[error("missing authentication token")]
    MissingToken,
    #[error("authentication failed")]
    InvalidToken,
    #[error("origin not allowed")]
    OriginNotAllowed,
    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,
}

impl UpgradeError {
    /// `(status_code, client-safe body)` — never leaks internal detail.
    pub fn response(&self) -> (u16, &'static str) {
        match self {
            UpgradeError::MissingToken => (401, "Missing authentication token"),
            UpgradeError::InvalidToken => (401, "Authentication failed"),
            UpgradeError::OriginNotAllowed => (403, "Origin not allowed"),
            UpgradeError::ConnectionLimitExceeded => (429, "Connection limit exceeded"),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            UpgradeError::MissingToken | UpgradeError::InvalidToken => ErrorCode::Unauthorized,
            UpgradeError::OriginNotAllowed => ErrorCode::OriginNotAllowed,
            UpgradeError::ConnectionLimitExceeded => ErrorCode::ConnectionLimitExceeded,
        }
    }
}

/// Implemented by any error type a [`crate::router::Router`] wants to surface
/// with a specific [`ErrorCode`] instead of the generic `ServiceError`
/// fallback. Spec §4.4 step 10: "If RouteMessage returns a domain error
/// carrying a code, convert via its `ToErrorInfo()`".
pub trait ErrorCoded: std::error::Error + Send + Sync + 'static {
    fn to_error_info(&self) -> ErrorInfo;
}

/// The error type returned by [`crate::router::Router`] methods: either a
/// structured, coded domain error or an opaque one that the ingress pipeline
/// must fall back to a generic `ServiceError` for.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Coded(Box<dyn ErrorCoded>),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RouterError {
    /// `None` for `Other` — the caller synthesizes the generic `ServiceError`
    /// response itself.
    pub fn to_error_info(&self) -> Option<ErrorInfo> {
        match self {
            RouterError::Coded(e) => Some(e.to_error_info()),
            RouterError::Other(_) => None,
        }
    }
}
