use serde::{Deserialize, Serialize};

/// Top-level layered configuration, deserialized from TOML. Every field is
/// defaulted via a named `default_*` function rather than a bare
/// `#[derive(Default)]`, so a missing `[section]` — or a missing field within
/// a present section — still produces a usable configuration and each
/// default is self-documenting at its call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            session: SessionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (TLS termination is assumed upstream — see spec Non-goals).
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// JWT secret used by the reference `ClaimsVerifier`. When absent a
    /// random secret is generated for the life of the process and a warning
    /// is logged that tokens will not survive a restart.
    pub jwt_secret: Option<String>,
    /// Exact-match allow-list (scheme + host + port). Empty = open-origin
    /// development mode — see `IsOpenOrigin` in spec §4.1.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// When `false` (the default), `?token=` query-parameter auth is still
    /// accepted alongside the `Authorization` header, logging a warning.
    #[serde(default = "default_false")]
    pub deprecate_jwt_query_param: bool,
    #[serde(default = "default_shutdown_grace_period_secs")]
    pub shutdown_grace_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "default_max_concurrent_messages_per_conn")]
    pub max_concurrent_messages_per_conn: usize,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_reconnect_timeout_secs")]
    pub reconnect_timeout_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_max_response_times")]
    pub max_response_times: usize,
    #[serde(default = "default_max_session_name_len")]
    pub max_session_name_len: usize,
}

/// Heartbeat timing as configuration fields rather than module-level
/// constants (`pongWait`, `pingPeriod`, `writeWait`), so tests can inject
/// short timers without touching global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_ping_period_secs")]
    pub ping_period_secs: u64,
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            jwt_secret: None,
            allowed_origins: Vec::new(),
            deprecate_jwt_query_param: default_false(),
            shutdown_grace_period_secs: default_shutdown_grace_period_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_connections_per_user: default_max_connections_per_user(),
            max_concurrent_messages_per_conn: default_max_concurrent_messages_per_conn(),
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_timeout_secs: default_reconnect_timeout_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_response_times: default_max_response_times(),
            max_session_name_len: default_max_session_name_len(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pong_wait_secs: default_pong_wait_secs(),
            ping_period_secs: default_ping_period_secs(),
            write_wait_secs: default_write_wait_secs(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_false() -> bool {
    false
}
fn default_shutdown_grace_period_secs() -> u64 {
    10
}
fn default_max_message_size() -> usize {
    65_536
}
fn default_max_connections_per_user() -> usize {
    10
}
fn default_max_concurrent_messages_per_conn() -> usize {
    8
}
fn default_send_queue_capacity() -> usize {
    256
}
fn default_reconnect_timeout_secs() -> u64 {
    300
}
fn default_session_ttl_secs() -> u64 {
    86_400
}
fn default_cleanup_interval_secs() -> u64 {
    60
}
fn default_max_response_times() -> usize {
    100
}
fn default_max_session_name_len() -> usize {
    50
}
fn default_pong_wait_secs() -> u64 {
    60
}
fn default_ping_period_secs() -> u64 {
    54
}
fn default_write_wait_secs() -> u64 {
    10
}

/// Minimum acceptable length for a configured (not auto-generated) JWT secret.
const MIN_JWT_SECRET_LEN: usize = 16;

impl GatewayConfig {
    /// Collect every configuration problem instead of failing on the first.
    /// Each issue is prefixed `ERROR:` (abort startup) or `WARNING:` (proceed)
    /// depending on severity.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if let Some(secret) = &self.server.jwt_secret
            && secret.len() < MIN_JWT_SECRET_LEN
        {
            issues.push(format!(
                "ERROR: server.jwt_secret is set but only {} bytes long; must be at least {MIN_JWT_SECRET_LEN}.",
                secret.len()
            ));
        }
        if self.server.jwt_secret.is_none() {
            issues.push(
                "WARNING: server.jwt_secret is not set; a random secret will be generated for \
                 the life of this process and issued tokens will not survive a restart."
                    .to_string(),
            );
        }

        if self.server.allowed_origins.is_empty() {
            issues.push(
                "WARNING: server.allowed_origins is empty; every Origin will be accepted \
                 (open-origin development mode)."
                    .to_string(),
            );
        }
        for origin in &self.server.allowed_origins {
            if !looks_like_origin(origin) {
                issues.push(format!(
                    "ERROR: server.allowed_origins entry '{origin}' does not look like \
                     scheme://host[:port]."
                ));
            }
        }

        if self.limits.max_message_size == 0 {
            issues.push("ERROR: limits.max_message_size must be greater than 0.".to_string());
        }
        if self.limits.max_connections_per_user == 0 {
            issues
                .push("ERROR: limits.max_connections_per_user must be greater than 0.".to_string());
        }
        if self.limits.max_concurrent_messages_per_conn == 0 {
            issues.push(
                "ERROR: limits.max_concurrent_messages_per_conn must be greater than 0."
                    .to_string(),
            );
        }
        if self.limits.send_queue_capacity == 0 {
            issues.push("ERROR: limits.send_queue_capacity must be greater than 0.".to_string());
        }

        if self.session.max_response_times == 0 {
            issues.push("ERROR: session.max_response_times must be greater than 0.".to_string());
        }
        if self.session.max_session_name_len == 0 {
            issues
                .push("ERROR: session.max_session_name_len must be greater than 0.".to_string());
        }

        if self.heartbeat.ping_period_secs >= self.heartbeat.pong_wait_secs {
            issues.push(format!(
                "ERROR: heartbeat.ping_period_secs ({}) must be less than \
                 heartbeat.pong_wait_secs ({}); otherwise a connection can never see a ping \
                 before it's declared dead.",
                self.heartbeat.ping_period_secs, self.heartbeat.pong_wait_secs
            ));
        }
        if self.heartbeat.write_wait_secs == 0 {
            issues.push("ERROR: heartbeat.write_wait_secs must be greater than 0.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn looks_like_origin(s: &str) -> bool {
    let Some((scheme, rest)) = s.split_once("://") else {
        return false;
    };
    if scheme.is_empty() || rest.is_empty() {
        return false;
    }
    let host_port = rest.split('/').next().unwrap_or("");
    !host_port.is_empty()
}
