use serde::{Deserialize, Serialize};

use crate::ErrorInfo;

/// Domain error codes surfaced to clients in [`ErrorInfo::code`], per the
/// taxonomy in spec §7. Each variant knows its own client-safe message and
/// recoverability; internal detail (stack traces, DB names, ...) never
/// crosses this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[error("invalid message format")]
    InvalidFormat,
    #[error("service error")]
    ServiceError,
    #[error("llm unavailable")]
    LlmUnavailable,
    #[error("database error")]
    DatabaseError,
    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,
    #[error("unauthorized")]
    Unauthorized,
    #[error("origin not allowed")]
    OriginNotAllowed,
}

impl ErrorCode {
    /// The stable string surfaced on the wire as `error.code`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidFormat => "InvalidFormat",
            ErrorCode::ServiceError => "ServiceError",
            ErrorCode::LlmUnavailable => "LLMUnavailable",
            ErrorCode::DatabaseError => "DatabaseError",
            ErrorCode::ConnectionLimitExceeded => "ConnectionLimitExceeded",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::OriginNotAllowed => "OriginNotAllowed",
        }
    }

    /// Build the client-facing [`ErrorInfo`] for this code with an explicit
    /// message (callers pick among the several surfaced messages §7 lists
    /// per code) and recoverability.
    pub fn to_error_info(self, message: impl Into<String>, recoverable: bool) -> ErrorInfo {
        ErrorInfo {
            code: self.as_str().to_string(),
            message: message.into(),
            recoverable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_strings_match_wire_taxonomy() {
        assert_eq!(ErrorCode::InvalidFormat.as_str(), "InvalidFormat");
        assert_eq!(ErrorCode::ServiceError.as_str(), "ServiceError");
        assert_eq!(ErrorCode::LlmUnavailable.as_str(), "LLMUnavailable");
        assert_eq!(ErrorCode::DatabaseError.as_str(), "DatabaseError");
        assert_eq!(
            ErrorCode::ConnectionLimitExceeded.as_str(),
            "ConnectionLimitExceeded"
        );
        assert_eq!(ErrorCode::Unauthorized.as_str(), "Unauthorized");
        assert_eq!(ErrorCode::OriginNotAllowed.as_str(), "OriginNotAllowed");
    }

    #[test]
    fn to_error_info_carries_recoverable_flag() {
        let info = ErrorCode::Unauthorized.to_error_info("Authentication failed", false);
        assert_eq!(info.code, "Unauthorized");
        assert!(!info.recoverable);
    }
}
