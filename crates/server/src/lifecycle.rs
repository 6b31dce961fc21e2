//! Connection Lifecycle Manager (spec §4.1): upgrade, auth, registration,
//! heartbeat, shutdown. Grounded on `web.rs`'s upgrade-handler shape (origin
//! check, bearer-token extraction, `WebSocketUpgrade`) generalized to the
//! spec's exact policy — an origin allow-list with an explicit open-origin
//! development mode, the `?token=` deprecation flag, and a
//! `Shutdown(deadline)` that concurrently closes every live connection with
//! a per-connection write deadline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::WebSocket;
use futures_util::StreamExt;
use gatehouse_protocol::{Claims, HeartbeatConfig, LimitsConfig, Message};

use crate::connection::{self, Connection};
use crate::error::UpgradeError;
use crate::fanout::FanoutRegistry;
use crate::ingress::{self, ReaderExit};
use crate::limiter::ConnectionLimiter;
use crate::router::Router;
use crate::web::Metrics;

/// Owns origin policy, the per-user limiter, the fan-out registry, and the
/// per-connection reader/writer pump pair. One instance per process.
pub struct ConnectionLifecycleManager {
    allowed_origins: RwLock<HashSet<String>>,
    deprecate_jwt_query_param: AtomicBool,
    limiter: Arc<ConnectionLimiter>,
    registry: Arc<FanoutRegistry>,
    limits: LimitsConfig,
    heartbeat: HeartbeatConfig,
    send_queue_capacity: usize,
    shutting_down: AtomicBool,
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown deadline exceeded with {remaining} connection(s) still closing")]
    DeadlineExceeded { remaining: usize },
}

impl ConnectionLifecycleManager {
    pub fn new(
        limiter: Arc<ConnectionLimiter>,
        registry: Arc<FanoutRegistry>,
        limits: LimitsConfig,
        heartbeat: HeartbeatConfig,
        send_queue_capacity: usize,
    ) -> Self {
        Self {
            allowed_origins: RwLock::new(HashSet::new()),
            deprecate_jwt_query_param: AtomicBool::new(false),
            limiter,
            registry,
            limits,
            heartbeat,
            send_queue_capacity,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn set_allowed_origins(&self, origins: Vec<String>) {
        let mut guard = self.allowed_origins.write().unwrap_or_else(|e| e.into_inner());
        *guard = origins.into_iter().collect();
    }

    pub fn set_deprecate_jwt_query_param(&self, deprecate: bool) {
        self.deprecate_jwt_query_param.store(deprecate, Ordering::Relaxed);
    }

    pub fn deprecate_jwt_query_param(&self) -> bool {
        self.deprecate_jwt_query_param.load(Ordering::Relaxed)
    }

    /// No origins configured == accept everything, an explicit development
    /// mode (spec §4.1). Callers are expected to warn when this is true.
    pub fn is_open_origin(&self) -> bool {
        self.allowed_origins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// `origin` is the raw `Origin` header value, if any was sent.
    pub fn check_origin(&self, origin: Option<&str>) -> Result<(), UpgradeError> {
        if self.is_open_origin() {
            return Ok(());
        }
        let allowed = self.allowed_origins.read().unwrap_or_else(|e| e.into_inner());
        match origin {
            Some(o) if allowed.contains(o) => Ok(()),
            Some(o) => {
                tracing::warn!(origin = %o, "origin not in allow-list, rejecting upgrade");
                Err(UpgradeError::OriginNotAllowed)
            }
            None => {
                tracing::warn!("upgrade request carried no Origin header, rejecting");
                Err(UpgradeError::OriginNotAllowed)
            }
        }
    }

    /// Extract a bearer token: `Authorization: Bearer <token>` is always
    /// accepted; `?token=` is accepted only while the deprecation flag is
    /// off, logging a warning each time it's used.
    pub fn extract_token(
        &self,
        bearer: Option<&str>,
        query_token: Option<&str>,
    ) -> Result<String, UpgradeError> {
        if let Some(token) = bearer {
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
        if !self.deprecate_jwt_query_param() && let Some(token) = query_token {
            if !token.is_empty() {
                tracing::warn!(
                    "authenticating via deprecated ?token= query parameter; set \
                     deprecate_jwt_query_param=true once clients have migrated"
                );
                return Ok(token.to_string());
            }
        }
        Err(UpgradeError::MissingToken)
    }

    /// Acquire a limiter slot for `user_id`, notifying the user's other live
    /// connections on rejection (spec §4.1: "enqueue a system notification
    /// ... advising them to close one").
    pub fn try_admit(&self, user_id: &str) -> Result<(), UpgradeError> {
        if self.is_shutting_down() {
            return Err(UpgradeError::ConnectionLimitExceeded);
        }
        if self.limiter.allow(user_id) {
            return Ok(());
        }
        self.registry.broadcast(
            user_id,
            &Message::system_notification(
                "",
                "Too many connections for this account — please close one to continue.",
            ),
        );
        Err(UpgradeError::ConnectionLimitExceeded)
    }

    /// Run one accepted connection to completion: spawn the writer, run the
    /// reader loop inline, then perform the single unregistration path
    /// (spec §4.1) regardless of why the reader exited.
    pub async fn run_connection(
        &self,
        socket: WebSocket,
        claims: Claims,
        router: Arc<dyn Router>,
        metrics: Arc<Metrics>,
    ) {
        let connection_id = connection::generate_connection_id(&claims.user_id);
        let (connection, receiver) = Connection::new(
            connection_id.clone(),
            claims.user_id.clone(),
            claims.name.clone(),
            claims.roles.clone(),
            self.send_queue_capacity,
        );

        metrics.connections_accepted.fetch_add(1, Ordering::Relaxed);
        metrics.connections_active.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "audit",
            event = "connection_accepted",
            user_id = %claims.user_id,
            connection_id = %connection_id,
            "connection accepted"
        );

        let (ws_sender, ws_receiver) = socket.split();
        let writer_connection_id = connection_id.clone();
        let writer_user_id = claims.user_id.clone();
        let writer_heartbeat = self.heartbeat.clone();
        let writer_handle = tokio::spawn(async move {
            connection::run_writer(
                &writer_connection_id,
                &writer_user_id,
                ws_sender,
                receiver,
                writer_heartbeat,
            )
            .await
        });

        let exit = ingress::run_reader(
            Arc::clone(&connection),
            ws_receiver,
            Arc::clone(&router),
            Arc::clone(&self.registry),
            self.limits.clone(),
            self.heartbeat.clone(),
            Arc::clone(&metrics),
        )
        .await;

        self.unregister(&connection, exit, &router, &metrics).await;
        // Drop the last known strong ref so `Connection`'s mpsc sender
        // closes, letting the writer task's `recv()` return `None`.
        drop(connection);
        let _ = writer_handle.await;
    }

    async fn unregister(
        &self,
        connection: &Arc<Connection>,
        exit: ReaderExit,
        router: &Arc<dyn Router>,
        metrics: &Arc<Metrics>,
    ) {
        tracing::info!(
            user_id = %connection.user_id,
            connection_id = %connection.connection_id,
            ?exit,
            "connection closing"
        );
        self.registry
            .unregister(&connection.user_id, &connection.connection_id);
        metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.limiter.release(&connection.user_id);
        connection.mark_closing();

        let session_id = connection.session_id();
        if !session_id.is_empty() {
            router.unregister_connection(&session_id).await;
        }
    }

    /// Close every live connection concurrently with a proper close frame,
    /// returning once all have closed or `deadline` elapses. No new
    /// connections are accepted once this is called.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let connections = self.registry.all_connections();
        tracing::info!(
            target: "audit",
            event = "shutdown_initiated",
            connection_count = connections.len(),
            "shutdown initiated"
        );

        let closes = connections.into_iter().map(|conn| {
            let notice = Message::system_notification("", "server shutting down");
            async move {
                conn.try_enqueue(notice);
                conn.mark_closing();
            }
        });

        match tokio::time::timeout(deadline, futures_util::future::join_all(closes)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                let remaining = self.registry.all_connections().len();
                Err(ShutdownError::DeadlineExceeded { remaining })
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionLifecycleManager {
        ConnectionLifecycleManager::new(
            Arc::new(ConnectionLimiter::new(10)),
            Arc::new(FanoutRegistry::new()),
            LimitsConfig::default(),
            HeartbeatConfig::default(),
            256,
        )
    }

    #[test]
    fn open_origin_accepts_anything_by_default() {
        let mgr = manager();
        assert!(mgr.is_open_origin());
        assert!(mgr.check_origin(None).is_ok());
        assert!(mgr.check_origin(Some("https://evil.example")).is_ok());
    }

    #[test]
    fn configured_origins_reject_mismatch() {
        let mgr = manager();
        mgr.set_allowed_origins(vec!["https://app.example.com".to_string()]);
        assert!(!mgr.is_open_origin());
        assert!(mgr.check_origin(Some("https://app.example.com")).is_ok());
        assert!(matches!(
            mgr.check_origin(Some("https://other.example.com")),
            Err(UpgradeError::OriginNotAllowed)
        ));
        assert!(matches!(
            mgr.check_origin(None),
            Err(UpgradeError::OriginNotAllowed)
        ));
    }

    #[test]
    fn extract_token_prefers_bearer_header() {
        let mgr = manager();
        let token = mgr
            .extract_token(Some("header-token"), Some("query-token"))
            .unwrap();
        assert_eq!(token, "header-token");
    }

    #[test]
    fn extract_token_falls_back_to_query_when_not_deprecated() {
        let mgr = manager();
        let token = mgr.extract_token(None, Some("query-token")).unwrap();
        assert_eq!(token, "query-token");
    }

    #[test]
    fn extract_token_rejects_query_once_deprecated() {
        let mgr = manager();
        mgr.set_deprecate_jwt_query_param(true);
        assert!(matches!(
            mgr.extract_token(None, Some("query-token")),
            Err(UpgradeError::MissingToken)
        ));
    }

    #[test]
    fn extract_token_missing_is_an_error() {
        let mgr = manager();
        assert!(matches!(
            mgr.extract_token(None, None),
            Err(UpgradeError::MissingToken)
        ));
    }

    #[test]
    fn try_admit_respects_limiter_cap() {
        let mgr = ConnectionLifecycleManager::new(
            Arc::new(ConnectionLimiter::new(1)),
            Arc::new(FanoutRegistry::new()),
            LimitsConfig::default(),
            HeartbeatConfig::default(),
            256,
        );
        assert!(mgr.try_admit("u1").is_ok());
        assert!(matches!(
            mgr.try_admit("u1"),
            Err(UpgradeError::ConnectionLimitExceeded)
        ));
    }

    #[tokio::test]
    async fn shutdown_with_no_connections_returns_immediately() {
        let mgr = manager();
        assert!(mgr.shutdown(Duration::from_millis(100)).await.is_ok());
        assert!(mgr.is_shutting_down());
    }
}
