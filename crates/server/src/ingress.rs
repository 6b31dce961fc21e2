//! Message Ingress Pipeline (spec §4.4): the per-connection reader loop.
//! Grounded on `signaling.rs`'s reader-loop shape (read → parse → dispatch
//! → write-response) generalized to the ten numbered steps here: size
//! check, JSON parse, sanitize, defaults, validate, session registration,
//! semaphore-bounded dispatch, panic-recovering spawn, error conversion.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use gatehouse_protocol::{ErrorCode, HeartbeatConfig, LimitsConfig, Message};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::fanout::FanoutRegistry;
use crate::router::Router;
use crate::sanitize::sanitize_message;
use crate::validate::validate_message;
use crate::web::Metrics;

/// Why the reader loop exited, so the caller (lifecycle.rs) can decide what
/// to log at unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    PeerClosed,
    HeartbeatTimeout,
    SizeLimitExceeded,
    SocketError,
}

/// Run the reader loop for one connection until it exits for any of the
/// [`ReaderExit`] reasons. Unregistration itself is the caller's job.
pub async fn run_reader(
    connection: Arc<Connection>,
    mut ws_receiver: SplitStream<WebSocket>,
    router: Arc<dyn Router>,
    registry: Arc<FanoutRegistry>,
    limits: LimitsConfig,
    heartbeat: HeartbeatConfig,
    metrics: Arc<Metrics>,
) -> ReaderExit {
    let pong_wait = std::time::Duration::from_secs(heartbeat.pong_wait_secs);
    let semaphore = Arc::new(Semaphore::new(limits.max_concurrent_messages_per_conn));
    let mut deadline = Instant::now() + pong_wait;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(
                    user_id = %connection.user_id,
                    connection_id = %connection.connection_id,
                    "heartbeat timeout, no frame seen within pong_wait"
                );
                return ReaderExit::HeartbeatTimeout;
            }
            frame = ws_receiver.next() => {
                let Some(frame) = frame else {
                    tracing::info!(
                        user_id = %connection.user_id,
                        connection_id = %connection.connection_id,
                        "peer closed connection"
                    );
                    return ReaderExit::PeerClosed;
                };
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::error!(
                            user_id = %connection.user_id,
                            connection_id = %connection.connection_id,
                            error = %e,
                            "websocket read error"
                        );
                        return ReaderExit::SocketError;
                    }
                };

                // Any frame refreshes liveness (spec §6); Pong additionally
                // refreshes per §4.1's narrower statement.
                deadline = Instant::now() + pong_wait;

                let text = match frame {
                    WsMessage::Close(_) => {
                        tracing::info!(
                            user_id = %connection.user_id,
                            connection_id = %connection.connection_id,
                            "received close frame"
                        );
                        return ReaderExit::PeerClosed;
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                    WsMessage::Text(text) => {
                        if text.len() > limits.max_message_size {
                            tracing::warn!(
                                user_id = %connection.user_id,
                                connection_id = %connection.connection_id,
                                limit = limits.max_message_size,
                                "inbound frame exceeds max_message_size"
                            );
                            return ReaderExit::SizeLimitExceeded;
                        }
                        text.to_string()
                    }
                    WsMessage::Binary(data) => {
                        if data.len() > limits.max_message_size {
                            tracing::warn!(
                                user_id = %connection.user_id,
                                connection_id = %connection.connection_id,
                                limit = limits.max_message_size,
                                "inbound frame exceeds max_message_size"
                            );
                            return ReaderExit::SizeLimitExceeded;
                        }
                        match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                metrics.message_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                send_error(&connection, ErrorCode::InvalidFormat, "Invalid message format", true);
                                continue;
                            }
                        }
                    }
                };

                process_frame(
                    &text,
                    &connection,
                    &router,
                    &registry,
                    &semaphore,
                    &metrics,
                    limits.max_message_size,
                )
                .await;
            }
        }
    }
}

async fn process_frame(
    text: &str,
    connection: &Arc<Connection>,
    router: &Arc<dyn Router>,
    registry: &Arc<FanoutRegistry>,
    semaphore: &Arc<Semaphore>,
    metrics: &Arc<Metrics>,
    max_content_len: usize,
) {
    // Step 3: parse.
    let mut message: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            metrics.message_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::debug!(
                user_id = %connection.user_id,
                connection_id = %connection.connection_id,
                error = %e,
                "failed to parse inbound message"
            );
            send_error(connection, ErrorCode::InvalidFormat, "Invalid message format", true);
            return;
        }
    };
    metrics.messages_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    // Step 4: sanitize.
    sanitize_message(&mut message);
    // Step 5: fill defaults.
    message.fill_defaults();
    // Step 6: validate.
    if let Err(e) = validate_message(&message, max_content_len) {
        metrics.message_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::debug!(
            user_id = %connection.user_id,
            connection_id = %connection.connection_id,
            error = %e,
            "message failed validation"
        );
        send_error(connection, ErrorCode::InvalidFormat, "Message validation failed", true);
        return;
    }

    // Step 7: session registration, first-message-wins.
    if !message.session_id.is_empty() && connection.set_session_id_if_empty(&message.session_id) {
        if let Err(e) = router.register_connection(&message.session_id, connection).await {
            tracing::warn!(
                user_id = %connection.user_id,
                connection_id = %connection.connection_id,
                session_id = %message.session_id,
                error = %e,
                "failed to register connection with router"
            );
            send_error(
                connection,
                ErrorCode::ServiceError,
                "Failed to establish session connection",
                true,
            );
            return;
        }
        registry.register(Arc::clone(connection));
    }

    // Step 8: semaphore-bounded dispatch.
    let permit = match Arc::clone(semaphore).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            metrics.messages_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            send_error(connection, ErrorCode::ServiceError, "Failed to process message", true);
            return;
        }
    };

    // Step 9: panic-recovering dispatch task. `tokio::spawn` itself is the
    // panic boundary — a panic inside `route_message` surfaces as a
    // `JoinError` on this task's handle and never touches the reader loop.
    let router = Arc::clone(router);
    let connection = Arc::clone(connection);
    let metrics = Arc::clone(metrics);
    let dispatch_user_id = connection.user_id.clone();
    let dispatch_connection_id = connection.connection_id.clone();
    let handle = tokio::spawn(async move {
        let _permit = permit;
        let result = router.route_message(&connection, message).await;
        metrics.messages_dispatched.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        // Step 10: error conversion.
        if let Err(err) = result {
            let info = err.to_error_info().unwrap_or_else(|| {
                ErrorCode::ServiceError.to_error_info("Failed to process message", true)
            });
            connection.try_enqueue(Message::error(connection.session_id(), info));
        }
    });
    // Dispatch tasks stay detached from the reader loop (a panic must not
    // block it), but a watcher awaits the handle so a panic is still logged
    // at error level instead of only reaching tokio's default panic hook.
    tokio::spawn(async move {
        if let Err(join_err) = handle.await {
            if join_err.is_panic() {
                tracing::error!(
                    user_id = %dispatch_user_id,
                    connection_id = %dispatch_connection_id,
                    "panic in route_message dispatch"
                );
            }
        }
    });
}

fn send_error(connection: &Arc<Connection>, code: ErrorCode, message: &str, recoverable: bool) {
    let info = code.to_error_info(message, recoverable);
    if !connection.try_enqueue(Message::error(connection.session_id(), info)) {
        tracing::debug!(
            user_id = %connection.user_id,
            connection_id = %connection.connection_id,
            "dropped error response: send queue full or connection closing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouterError;
    use async_trait::async_trait;
    use gatehouse_protocol::GatewayConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoRouter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Router for EchoRouter {
        async fn route_message(
            &self,
            connection: &Arc<Connection>,
            message: Message,
        ) -> Result<(), RouterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            connection.try_enqueue(message);
            Ok(())
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

    struct PanicRouter;

    #[async_trait]
    impl Router for PanicRouter {
        async fn route_message(
            &self,
            _connection: &Arc<Connection>,
            _message: Message,
        ) -> Result<(), RouterError> {
            panic!("route_message panicked");
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

    fn limits() -> LimitsConfig {
        GatewayConfig::default().limits
    }

    #[tokio::test]
    async fn process_frame_rejects_malformed_json() {
        let (conn, mut rx) = Connection::new(
            "c1".to_string(),
            "u1".to_string(),
            "name".to_string(),
            vec![],
            8,
        );
        let router: Arc<dyn Router> = Arc::new(EchoRouter {
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(FanoutRegistry::new());
        let semaphore = Arc::new(Semaphore::new(4));
        let metrics = Arc::new(Metrics::default());

        process_frame("not json", &conn, &router, &registry, &semaphore, &metrics, 4096).await;

        let out = rx.try_recv().unwrap();
        assert_eq!(out.error.unwrap().code, "InvalidFormat");
    }

    #[tokio::test]
    async fn process_frame_dispatches_well_formed_message() {
        let (conn, mut rx) = Connection::new(
            "c1".to_string(),
            "u1".to_string(),
            "name".to_string(),
            vec![],
            8,
        );
        let router: Arc<dyn Router> = Arc::new(EchoRouter {
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(FanoutRegistry::new());
        let semaphore = Arc::new(Semaphore::new(4));
        let metrics = Arc::new(Metrics::default());

        let json = r#"{"type":"user_message","content":"hi"}"#;
        process_frame(json, &conn, &router, &registry, &semaphore, &metrics, 4096).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let out = rx.try_recv().unwrap();
        assert_eq!(out.content, "hi");
    }

    #[tokio::test]
    async fn saturated_semaphore_produces_service_error() {
        let (conn, mut rx) = Connection::new(
            "c1".to_string(),
            "u1".to_string(),
            "name".to_string(),
            vec![],
            8,
        );
        let router: Arc<dyn Router> = Arc::new(EchoRouter {
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(FanoutRegistry::new());
        let semaphore = Arc::new(Semaphore::new(1));
        let metrics = Arc::new(Metrics::default());
        let _held = semaphore.clone().try_acquire_owned().unwrap();

        let json = r#"{"type":"user_message","content":"hi"}"#;
        process_frame(json, &conn, &router, &registry, &semaphore, &metrics, 4096).await;

        let out = rx.try_recv().unwrap();
        assert_eq!(out.error.unwrap().code, "ServiceError");
    }

    #[test]
    fn limits_default_is_reachable() {
        let l = limits();
        assert!(l.max_message_size > 0);
    }

    #[tokio::test]
    async fn panic_in_route_message_does_not_block_the_next_dispatch() {
        let (conn, mut rx) = Connection::new(
            "c1".to_string(),
            "u1".to_string(),
            "name".to_string(),
            vec![],
            8,
        );
        let registry = Arc::new(FanoutRegistry::new());
        let semaphore = Arc::new(Semaphore::new(4));
        let metrics = Arc::new(Metrics::default());
        let json = r#"{"type":"user_message","content":"hi"}"#;

        let panic_router: Arc<dyn Router> = Arc::new(PanicRouter);
        process_frame(json, &conn, &panic_router, &registry, &semaphore, &metrics, 4096).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let echo_router: Arc<dyn Router> = Arc::new(EchoRouter {
            calls: AtomicUsize::new(0),
        });
        process_frame(json, &conn, &echo_router, &registry, &semaphore, &metrics, 4096).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let out = rx.try_recv().unwrap();
        assert_eq!(out.content, "hi");
    }
}
