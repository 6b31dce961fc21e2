//! Router Interface (spec §4.5): the contract between the ingress pipeline
//! and downstream collaborators (LLM relay, persistence, admin console).
//! The core depends on this trait but ships only [`NullRouter`], the
//! degraded-mode implementation used before a real router is attached
//! (spec §4.4: "When the router is absent (nil)").

use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_protocol::{ErrorCode, ErrorInfo, Message};

use crate::connection::Connection;
use crate::error::{ErrorCoded, RouterError};

/// Implementors MUST NOT block indefinitely, MUST NOT close the
/// connection's send queue, and MUST be panic-safe as a courtesy — the
/// ingress pipeline recovers from a panic regardless (spec §4.4 step 9).
#[async_trait]
pub trait Router: Send + Sync {
    /// Process one validated message. May enqueue any number of outbound
    /// messages on `connection.send_queue`, including streaming chunks.
    async fn route_message(
        &self,
        connection: &Arc<Connection>,
        message: Message,
    ) -> Result<(), RouterError>;

    /// Tell the router which live connection currently represents
    /// `session_id`. Idempotent for the same pair.
    async fn register_connection(
        &self,
        session_id: &str,
        connection: &Arc<Connection>,
    ) -> Result<(), RouterError>;

    /// Called exactly once by the Lifecycle Manager as part of teardown
    /// when the departing connection had an associated session.
    async fn unregister_connection(&self, session_id: &str);
}

/// The error `NullRouter` hands back for every message: carries a fixed
/// [`ErrorCode::ServiceError`] so the ingress pipeline's step-10 conversion
/// (spec §4.4) surfaces "Service temporarily unavailable" verbatim instead
/// of falling back to its generic "Failed to process message".
#[derive(Debug, thiserror::Error)]
#[error("router absent")]
struct NoRouterAttached;

impl ErrorCoded for NoRouterAttached {
    fn to_error_info(&self) -> ErrorInfo {
        ErrorCode::ServiceError.to_error_info("Service temporarily unavailable", true)
    }
}

/// Degraded-mode router used during startup before an embedding application
/// attaches a real one (spec §10.1 step 4). Every message produces a
/// `ServiceError` "Service temporarily unavailable" response.
pub struct NullRouter;

#[async_trait]
impl Router for NullRouter {
    async fn route_message(
        &self,
        _connection: &Arc<Connection>,
        _message: Message,
    ) -> Result<(), RouterError> {
        Err(RouterError::Coded(Box::new(NoRouterAttached)))
    }

    async fn register_connection(
        &self,
        _session_id: &str,
        _connection: &Arc<Connection>,
    ) -> Result<(), RouterError> {
        Ok(())
    }

    async fn unregister_connection(&self, _session_id: &str) {}
}
