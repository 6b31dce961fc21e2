//! Session Manager (spec §4.3): owns all per-user session state, the
//! admin-assist latch, the response-time ring, and the periodic TTL sweep.
//!
//! Concurrency contract: one manager-level lock guards both maps
//! (`sessions` and `active_by_user`); each [`Session`] additionally has its
//! own lock guarding its fields. Nested acquisition order is always manager
//! lock first, session lock second, and operations that touch both maps and
//! a session's fields together (create/restore/end) hold the manager lock
//! for the whole critical section rather than releasing and re-acquiring.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use gatehouse_protocol::Message;

use crate::web::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid user id")]
    InvalidUserId,
    #[error("user already has an active session")]
    ActiveSessionExists,
    #[error("invalid session id")]
    InvalidSessionId,
    #[error("session not found")]
    NotFound,
    #[error("session belongs to a different user")]
    Ownership,
    #[error("reconnect window has expired")]
    Timeout,
    #[error("token usage must be non-negative")]
    NegativeTokens,
    #[error("response time must be non-negative")]
    NegativeDuration,
    #[error("session already has a different assisting admin")]
    Conflict,
    #[error("model id must not be empty")]
    EmptyModelId,
}

/// Per-user logical conversation. Cloned out of the manager as an owned
/// snapshot on every read — callers never see the internal lock.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub model_id: Option<String>,
    pub messages: Vec<Message>,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub help_requested: bool,
    pub admin_assisted: bool,
    pub assisting_admin_id: Option<String>,
    pub assisting_admin_name: Option<String>,
    pub total_tokens: u64,
    response_times_ms: VecDeque<u64>,
}

impl Session {
    fn new(id: String, user_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            name: String::new(),
            model_id: None,
            messages: Vec::new(),
            start_time: now,
            last_activity: now,
            end_time: None,
            is_active: true,
            help_requested: false,
            admin_assisted: false,
            assisting_admin_id: None,
            assisting_admin_name: None,
            total_tokens: 0,
            response_times_ms: VecDeque::new(),
        }
    }

    pub fn response_times_ms(&self) -> &VecDeque<u64> {
        &self.response_times_ms
    }
}

struct ManagerState {
    sessions: HashMap<String, Arc<RwLock<Session>>>,
    active_by_user: HashMap<String, String>,
}

pub struct SessionManager {
    state: Mutex<ManagerState>,
    reconnect_timeout: Duration,
    session_ttl: Duration,
    cleanup_interval: Duration,
    max_response_times: usize,
    max_session_name_len: usize,
    sweeper: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
    metrics: Arc<Metrics>,
}

impl SessionManager {
    pub fn new(
        reconnect_timeout: Duration,
        session_ttl: Duration,
        cleanup_interval: Duration,
        max_response_times: usize,
        max_session_name_len: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                sessions: HashMap::new(),
                active_by_user: HashMap::new(),
            }),
            reconnect_timeout,
            session_ttl,
            cleanup_interval,
            max_response_times,
            max_session_name_len,
            sweeper: Mutex::new(None),
            metrics,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find(&self, id: &str) -> Result<Arc<RwLock<Session>>, SessionError> {
        if id.is_empty() {
            return Err(SessionError::InvalidSessionId);
        }
        let state = self.lock_state();
        state
            .sessions
            .get(id)
            .cloned()
            .ok_or(SessionError::NotFound)
    }

    fn read<T>(&self, id: &str, f: impl FnOnce(&Session) -> T) -> Result<T, SessionError> {
        let arc = self.find(id)?;
        let session = arc.read().unwrap_or_else(|e| e.into_inner());
        Ok(f(&session))
    }

    fn write<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> T) -> Result<T, SessionError> {
        let arc = self.find(id)?;
        let mut session = arc.write().unwrap_or_else(|e| e.into_inner());
        Ok(f(&mut session))
    }

    pub fn create_session(&self, user_id: &str) -> Result<String, SessionError> {
        if user_id.is_empty() {
            return Err(SessionError::InvalidUserId);
        }
        let mut state = self.lock_state();
        if state.active_by_user.contains_key(user_id) {
            return Err(SessionError::ActiveSessionExists);
        }
        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), user_id.to_string());
        state
            .sessions
            .insert(id.clone(), Arc::new(RwLock::new(session)));
        state.active_by_user.insert(user_id.to_string(), id.clone());
        self.metrics.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.metrics.sessions_active.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    pub fn get_session(&self, id: &str) -> Result<Session, SessionError> {
        self.read(id, |s| s.clone())
    }

    pub fn restore_session(&self, user_id: &str, id: &str) -> Result<(), SessionError> {
        if id.is_empty() {
            return Err(SessionError::InvalidSessionId);
        }
        let mut state = self.lock_state();
        let arc = state
            .sessions
            .get(id)
            .cloned()
            .ok_or(SessionError::NotFound)?;
        {
            let mut session = arc.write().unwrap_or_else(|e| e.into_inner());
            if session.user_id != user_id {
                return Err(SessionError::Ownership);
            }
            if !session.is_active {
                let end_time = session.end_time.unwrap_or_else(Utc::now);
                let elapsed = Utc::now() - end_time;
                if elapsed
                    > chrono::Duration::from_std(self.reconnect_timeout)
                        .unwrap_or_else(|_| chrono::Duration::zero())
                {
                    return Err(SessionError::Timeout);
                }
                session.is_active = true;
                session.end_time = None;
                session.last_activity = Utc::now();
                self.metrics.sessions_active.fetch_add(1, Ordering::Relaxed);
            }
        }
        state
            .active_by_user
            .insert(user_id.to_string(), id.to_string());
        Ok(())
    }

    pub fn end_session(&self, id: &str) -> Result<(), SessionError> {
        if id.is_empty() {
            return Err(SessionError::InvalidSessionId);
        }
        let mut state = self.lock_state();
        let arc = state
            .sessions
            .get(id)
            .cloned()
            .ok_or(SessionError::NotFound)?;
        let (user_id, was_active) = {
            let mut session = arc.write().unwrap_or_else(|e| e.into_inner());
            let was_active = session.is_active;
            session.is_active = false;
            session.end_time = Some(Utc::now());
            (session.user_id.clone(), was_active)
        };
        if state.active_by_user.get(&user_id).map(String::as_str) == Some(id) {
            state.active_by_user.remove(&user_id);
        }
        if was_active {
            self.metrics.sessions_ended.fetch_add(1, Ordering::Relaxed);
            self.metrics.sessions_active.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn set_session_name_from_message(
        &self,
        id: &str,
        message: &Message,
    ) -> Result<(), SessionError> {
        let max_len = self.max_session_name_len;
        self.write(id, |session| {
            if session.name.is_empty() {
                session.name = generate_session_name(&message.content, max_len);
            }
        })
    }

    pub fn append_message(&self, id: &str, message: Message) -> Result<(), SessionError> {
        self.write(id, |session| {
            session.messages.push(message);
            session.last_activity = Utc::now();
        })
    }

    pub fn update_token_usage(&self, id: &str, n: i64) -> Result<(), SessionError> {
        if n < 0 {
            return Err(SessionError::NegativeTokens);
        }
        self.write(id, |session| {
            session.total_tokens += n as u64;
        })
    }

    pub fn record_response_time(&self, id: &str, duration_ms: i64) -> Result<(), SessionError> {
        if duration_ms < 0 {
            return Err(SessionError::NegativeDuration);
        }
        let cap = self.max_response_times;
        self.write(id, |session| {
            session.response_times_ms.push_back(duration_ms as u64);
            while session.response_times_ms.len() > cap {
                session.response_times_ms.pop_front();
            }
        })
    }

    pub fn get_max_response_time(&self, id: &str) -> Result<u64, SessionError> {
        self.read(id, |s| {
            s.response_times_ms.iter().copied().max().unwrap_or(0)
        })
    }

    pub fn get_average_response_time(&self, id: &str) -> Result<f64, SessionError> {
        self.read(id, |s| {
            if s.response_times_ms.is_empty() {
                0.0
            } else {
                let sum: u64 = s.response_times_ms.iter().sum();
                sum as f64 / s.response_times_ms.len() as f64
            }
        })
    }

    pub fn get_session_duration(&self, id: &str) -> Result<chrono::Duration, SessionError> {
        self.read(id, |s| {
            let end = s.end_time.unwrap_or_else(Utc::now);
            end - s.start_time
        })
    }

    pub fn set_model_id(&self, id: &str, model_id: &str) -> Result<(), SessionError> {
        if model_id.is_empty() {
            return Err(SessionError::EmptyModelId);
        }
        self.write(id, |s| s.model_id = Some(model_id.to_string()))
    }

    pub fn get_model_id(&self, id: &str) -> Result<Option<String>, SessionError> {
        self.read(id, |s| s.model_id.clone())
    }

    pub fn mark_help_requested(&self, id: &str) -> Result<(), SessionError> {
        self.write(id, |s| s.help_requested = true)
    }

    pub fn is_help_requested(&self, id: &str) -> Result<bool, SessionError> {
        self.read(id, |s| s.help_requested)
    }

    pub fn mark_admin_assisted(
        &self,
        id: &str,
        admin_id: &str,
        admin_name: &str,
    ) -> Result<(), SessionError> {
        let arc = self.find(id)?;
        let mut session = arc.write().unwrap_or_else(|e| e.into_inner());
        let was_unassisted = session.assisting_admin_id.is_none();
        if let Some(current) = &session.assisting_admin_id {
            if current != admin_id {
                return Err(SessionError::Conflict);
            }
        }
        session.assisting_admin_id = Some(admin_id.to_string());
        session.assisting_admin_name = Some(admin_name.to_string());
        session.admin_assisted = true;
        if was_unassisted {
            self.metrics.admin_assist_takeovers.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn clear_admin_assistance(&self, id: &str) -> Result<(), SessionError> {
        self.write(id, |s| {
            s.assisting_admin_id = None;
            s.assisting_admin_name = None;
        })
    }

    pub fn get_assisting_admin(&self, id: &str) -> Result<(String, String), SessionError> {
        self.read(id, |s| {
            (
                s.assisting_admin_id.clone().unwrap_or_default(),
                s.assisting_admin_name.clone().unwrap_or_default(),
            )
        })
    }

    /// Run one TTL sweep synchronously. Exposed so tests (and the spawned
    /// sweeper below) share a single code path for the removal rule in spec
    /// §4.3: `!is_active && end_time.is_some() && now - end_time > ttl`.
    pub fn sweep_once(&self) {
        let now = Utc::now();
        let ttl =
            chrono::Duration::from_std(self.session_ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.lock_state();
        let expired: Vec<String> = state
            .sessions
            .iter()
            .filter_map(|(id, arc)| {
                let session = arc.read().unwrap_or_else(|e| e.into_inner());
                if !session.is_active {
                    if let Some(end_time) = session.end_time {
                        if now - end_time > ttl {
                            return Some(id.clone());
                        }
                    }
                }
                None
            })
            .collect();
        for id in expired {
            state.sessions.remove(&id);
            state.active_by_user.retain(|_, sid| sid != &id);
        }
    }

    /// Start the periodic sweeper. Calling it while already running is a
    /// no-op — it does not restart or duplicate the task.
    pub fn start_cleanup(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let interval = self.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep_once();
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *sweeper = Some((handle, stop_tx));
    }

    /// Stop the sweeper and wait for it to exit. Idempotent: safe to call
    /// twice, and safe even if [`Self::start_cleanup`] was never called.
    pub async fn stop_cleanup(&self) {
        let taken = {
            let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
            sweeper.take()
        };
        if let Some((handle, stop_tx)) = taken {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }
    }
}

/// `GenerateSessionName` (spec §4.3): derive a short session title from the
/// first message's content, applied by the manager only when the session's
/// current name is empty.
pub fn generate_session_name(text: &str, max_len: usize) -> String {
    const PAD: &[char] = &[' ', '\t', '\r', '\n'];

    let trimmed = text.trim_matches(|c: char| PAD.contains(&c));
    if trimmed.is_empty() {
        return "New Chat".to_string();
    }

    let newline_pos = trimmed.find('\n');
    let term_pos = trimmed.find(['.', '?', '!']);
    let candidate = match (newline_pos, term_pos) {
        (None, None) => trimmed.to_string(),
        (Some(n), None) => trimmed[..n].to_string(),
        (None, Some(t)) => trimmed[..=t].to_string(),
        (Some(n), Some(t)) => {
            if n <= t {
                trimmed[..n].to_string()
            } else {
                trimmed[..=t].to_string()
            }
        }
    };
    let candidate = candidate
        .trim_matches(|c: char| PAD.contains(&c))
        .to_string();

    if candidate.chars().count() <= max_len {
        return candidate;
    }
    if max_len <= 3 {
        return "...".to_string();
    }

    let limit = max_len - 3;
    let chars: Vec<char> = candidate.chars().collect();
    let head = &chars[..limit.min(chars.len())];
    let truncate_at = head.iter().rposition(|&c| c == ' ').unwrap_or(head.len());
    let mut result: String = chars[..truncate_at].iter().collect();
    result = result
        .trim_end_matches(|c: char| PAD.contains(&c))
        .to_string();
    result.push_str("...");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_protocol::{MessageType, Sender};
    use std::collections::HashMap as StdHashMap;

    fn manager() -> SessionManager {
        SessionManager::new(
            Duration::from_secs(300),
            Duration::from_secs(86_400),
            Duration::from_secs(60),
            100,
            50,
            Arc::new(Metrics::default()),
        )
    }

    fn msg(content: &str) -> Message {
        Message {
            kind: MessageType::UserMessage,
            session_id: String::new(),
            sender: Sender::User,
            content: content.to_string(),
            file_id: None,
            file_url: None,
            timestamp: None,
            metadata: StdHashMap::new(),
            error: None,
        }
    }

    #[test]
    fn name_derivation_s1_sentence_terminator() {
        let name = generate_session_name("What is the weather today? I need to know.", 50);
        assert_eq!(name, "What is the weather today?");
    }

    #[test]
    fn name_derivation_s2_truncation_respects_word_boundary() {
        let text = "This is a very long message that should be truncated to fit within the maximum length limit";
        let name = generate_session_name(text, 50);
        assert!(name.chars().count() <= 50);
        assert!(name.ends_with("..."));
        assert!(!name.contains("  "));
    }

    #[test]
    fn name_derivation_s3_blank_input_is_new_chat() {
        assert_eq!(generate_session_name("   \n\t  ", 50), "New Chat");
    }

    #[test]
    fn name_derivation_max_len_at_or_below_three() {
        assert_eq!(generate_session_name("hello world", 3), "...");
        assert_eq!(generate_session_name("hello world", 2), "...");
    }

    #[test]
    fn create_session_rejects_empty_user_id() {
        let mgr = manager();
        assert_eq!(mgr.create_session(""), Err(SessionError::InvalidUserId));
    }

    #[test]
    fn create_session_rejects_second_active_session() {
        let mgr = manager();
        mgr.create_session("u1").unwrap();
        assert_eq!(
            mgr.create_session("u1"),
            Err(SessionError::ActiveSessionExists)
        );
    }

    #[test]
    fn create_session_succeeds_after_end() {
        let mgr = manager();
        let s1 = mgr.create_session("u1").unwrap();
        mgr.end_session(&s1).unwrap();
        let s2 = mgr.create_session("u1").unwrap();
        assert_ne!(s1, s2);
    }

    #[test]
    fn get_session_not_found() {
        let mgr = manager();
        assert_eq!(mgr.get_session("ghost"), Err(SessionError::NotFound));
    }

    #[test]
    fn restore_session_within_window_succeeds() {
        let mgr = SessionManager::new(
            Duration::from_millis(200),
            Duration::from_secs(86_400),
            Duration::from_secs(60),
            100,
            50,
            Arc::new(Metrics::default()),
        );
        let id = mgr.create_session("u1").unwrap();
        mgr.end_session(&id).unwrap();
        mgr.restore_session("u1", &id).unwrap();
        let session = mgr.get_session(&id).unwrap();
        assert!(session.is_active);
        assert!(session.end_time.is_none());
    }

    #[test]
    fn restore_session_rejects_wrong_owner() {
        let mgr = manager();
        let id = mgr.create_session("u1").unwrap();
        mgr.end_session(&id).unwrap();
        assert_eq!(mgr.restore_session("u2", &id), Err(SessionError::Ownership));
    }

    #[tokio::test]
    async fn restore_session_after_timeout_fails() {
        let mgr = SessionManager::new(
            Duration::from_millis(20),
            Duration::from_secs(86_400),
            Duration::from_secs(60),
            100,
            50,
            Arc::new(Metrics::default()),
        );
        let id = mgr.create_session("u1").unwrap();
        mgr.end_session(&id).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(mgr.restore_session("u1", &id), Err(SessionError::Timeout));
    }

    #[test]
    fn set_session_name_is_first_message_wins() {
        let mgr = manager();
        let id = mgr.create_session("u1").unwrap();
        mgr.set_session_name_from_message(&id, &msg("Hello there. More text"))
            .unwrap();
        mgr.set_session_name_from_message(&id, &msg("second message should not overwrite"))
            .unwrap();
        let session = mgr.get_session(&id).unwrap();
        assert_eq!(session.name, "Hello there.");
    }

    #[test]
    fn update_token_usage_rejects_negative() {
        let mgr = manager();
        let id = mgr.create_session("u1").unwrap();
        assert_eq!(
            mgr.update_token_usage(&id, -1),
            Err(SessionError::NegativeTokens)
        );
    }

    #[test]
    fn update_token_usage_zero_is_a_no_op() {
        let mgr = manager();
        let id = mgr.create_session("u1").unwrap();
        mgr.update_token_usage(&id, 10).unwrap();
        mgr.update_token_usage(&id, 0).unwrap();
        assert_eq!(mgr.get_session(&id).unwrap().total_tokens, 10);
    }

    #[test]
    fn response_time_ring_evicts_oldest() {
        let mgr = SessionManager::new(
            Duration::from_secs(300),
            Duration::from_secs(86_400),
            Duration::from_secs(60),
            3,
            50,
            Arc::new(Metrics::default()),
        );
        let id = mgr.create_session("u1").unwrap();
        for ms in [10, 20, 30, 40, 50] {
            mgr.record_response_time(&id, ms).unwrap();
        }
        let session = mgr.get_session(&id).unwrap();
        let times: Vec<u64> = session.response_times_ms().iter().copied().collect();
        assert_eq!(times, vec![30, 40, 50]);
    }

    #[test]
    fn max_and_average_response_time_are_zero_with_no_samples() {
        let mgr = manager();
        let id = mgr.create_session("u1").unwrap();
        assert_eq!(mgr.get_max_response_time(&id).unwrap(), 0);
        assert_eq!(mgr.get_average_response_time(&id).unwrap(), 0.0);
    }

    #[test]
    fn admin_assist_exclusivity_s7() {
        let mgr = manager();
        let id = mgr.create_session("u1").unwrap();
        mgr.mark_admin_assisted(&id, "A1", "Alice").unwrap();
        assert_eq!(
            mgr.mark_admin_assisted(&id, "A2", "Bob"),
            Err(SessionError::Conflict)
        );
        assert_eq!(
            mgr.get_assisting_admin(&id).unwrap(),
            ("A1".to_string(), "Alice".to_string())
        );
        mgr.clear_admin_assistance(&id).unwrap();
        assert_eq!(
            mgr.get_assisting_admin(&id).unwrap(),
            (String::new(), String::new())
        );
        assert!(mgr.get_session(&id).unwrap().admin_assisted);
    }

    #[test]
    fn sweep_removes_only_expired_ended_sessions() {
        let mgr = SessionManager::new(
            Duration::from_secs(300),
            Duration::from_millis(10),
            Duration::from_secs(60),
            100,
            50,
            Arc::new(Metrics::default()),
        );
        let active = mgr.create_session("u1").unwrap();
        let ended_recent = mgr.create_session("u2").unwrap();
        mgr.end_session(&ended_recent).unwrap();

        mgr.sweep_once();
        assert!(mgr.get_session(&active).is_ok());
        assert!(mgr.get_session(&ended_recent).is_ok());
    }

    #[tokio::test]
    async fn sweep_removes_expired_and_keeps_active_and_nil_end_time() {
        let mgr = SessionManager::new(
            Duration::from_secs(300),
            Duration::from_millis(10),
            Duration::from_secs(60),
            100,
            50,
            Arc::new(Metrics::default()),
        );
        let active = mgr.create_session("u1").unwrap();
        let to_expire = mgr.create_session("u2").unwrap();
        mgr.end_session(&to_expire).unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        mgr.sweep_once();

        assert!(mgr.get_session(&active).is_ok());
        assert_eq!(mgr.get_session(&to_expire), Err(SessionError::NotFound));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_and_stop_cleanup_is_idempotent() {
        let mgr = Arc::new(SessionManager::new(
            Duration::from_secs(300),
            Duration::from_secs(86_400),
            Duration::from_millis(5),
            100,
            50,
            Arc::new(Metrics::default()),
        ));
        mgr.start_cleanup();
        mgr.start_cleanup();
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.stop_cleanup().await;
        mgr.stop_cleanup().await;
    }
}
