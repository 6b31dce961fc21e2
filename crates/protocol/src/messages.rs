use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of application-level event a [`Message`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserMessage,
    AiResponse,
    Notification,
    Error,
    Loading,
    System,
}

/// Who originated a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Ai,
    Admin,
    System,
}

impl Default for Sender {
    fn default() -> Self {
        Sender::User
    }
}

/// Structured error detail attached to `type: "error"` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

/// The application-level envelope exchanged on the wire, one per WebSocket
/// text frame. Unknown fields are tolerated on deserialize (forward
/// compatibility) and never emitted on serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Message {
    /// Build a client-facing error message: `type=error`, `sender=ai`.
    pub fn error(session_id: impl Into<String>, info: ErrorInfo) -> Self {
        Self {
            kind: MessageType::Error,
            session_id: session_id.into(),
            sender: Sender::Ai,
            content: String::new(),
            file_id: None,
            file_url: None,
            timestamp: Some(Utc::now()),
            metadata: HashMap::new(),
            error: Some(info),
        }
    }

    /// Build a system notification (e.g. "close another tab").
    pub fn system_notification(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Notification,
            session_id: session_id.into(),
            sender: Sender::System,
            content: content.into(),
            file_id: None,
            file_url: None,
            timestamp: Some(Utc::now()),
            metadata: HashMap::new(),
            error: None,
        }
    }

    /// Apply ingress defaults: empty timestamp becomes server time. `sender`
    /// already defaults via serde, so only the timestamp needs this step.
    pub fn fill_defaults(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }
}

/// Post-verification identity the gateway operates on. Derived once at
/// upgrade from whatever a [`crate::ClaimsVerifier`] (server crate) returns;
/// immutable for the life of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub name: String,
    pub roles: Vec<String>,
}

impl Claims {
    /// `name` defaults to `user_id` when absent or empty, per spec §3.
    pub fn new(user_id: impl Into<String>, name: Option<String>, roles: Vec<String>) -> Self {
        let user_id = user_id.into();
        let name = match name {
            Some(n) if !n.is_empty() => n,
            _ => user_id.clone(),
        };
        Self {
            user_id,
            name,
            roles,
        }
    }
}
