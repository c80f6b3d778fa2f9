//! Per-controller sessions: creation, idle expiry, eviction, and the
//! reasons a session can die.
//!
//! The manager is pure bookkeeping over a guarded map. Destroyed records
//! are returned to the caller so the relay layer can notify and close
//! the owning transport; nothing here touches the network.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::RelayConfig;
use crate::protocol::{now_ms, DeviceInfo, SessionInfo};
use crate::registry::ConnectionId;

/// Why a session was destroyed. The wire `reason` string is `as_str()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Expired,
    Manual,
    MaxSessionsExceeded,
    Kicked,
    PasswordChanged,
}

impl DestroyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Manual => "manual",
            Self::MaxSessionsExceeded => "max_sessions_exceeded",
            Self::Kicked => "kicked",
            Self::PasswordChanged => "password_changed",
        }
    }

    /// Human-readable companion text for the `session_expired` notice.
    pub fn notice(self) -> &'static str {
        match self {
            Self::Expired => "Session expired due to inactivity",
            Self::Manual => "Logged out",
            Self::MaxSessionsExceeded => "Session limit reached",
            Self::Kicked => "Session was terminated by another controller",
            Self::PasswordChanged => "Password changed",
        }
    }
}

/// One live session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub password: String,
    pub device_info: DeviceInfo,
    /// Transport the session belongs to.
    pub conn: ConnectionId,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    created: Instant,
    last_activity: Instant,
}

impl SessionRecord {
    pub fn info(&self, caller: &str) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            device_info: self.device_info.clone(),
            created_at: self.created_at_ms,
            last_activity: self.last_activity_ms,
            current: self.id == caller,
        }
    }
}

/// Outcome of a session lookup.
#[derive(Debug)]
pub enum SessionCheck {
    Valid(SessionRecord),
    /// The session was idle past the timeout and has been destroyed.
    Expired(SessionRecord),
    Missing,
}

/// Aggregate counts for `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub unique_users: usize,
}

/// Generate an unforgeable session token: 64 alphanumeric characters,
/// well past 256 bits of entropy.
pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

/// Manages every live session, keyed by session id.
pub struct SessionManager {
    inner: Mutex<HashMap<String, SessionRecord>>,
    timeout: Duration,
    max_per_user: usize,
}

impl SessionManager {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            timeout: config.session_timeout,
            max_per_user: config.max_sessions_per_user,
        }
    }

    /// Create a session for a controller. If the password is already at
    /// its session cap, the oldest session (by creation time) is removed
    /// first and returned so the caller can notify its transport.
    pub fn create(
        &self,
        password: &str,
        device_info: DeviceInfo,
        conn: ConnectionId,
    ) -> (SessionRecord, Option<SessionRecord>) {
        let mut inner = self.inner.lock();

        let mut evicted = None;
        let count = inner.values().filter(|s| s.password == password).count();
        if count >= self.max_per_user {
            let oldest_id = inner
                .values()
                .filter(|s| s.password == password)
                .min_by_key(|s| s.created)
                .map(|s| s.id.clone());
            if let Some(id) = oldest_id {
                evicted = inner.remove(&id);
            }
        }

        let now = now_ms();
        let session = SessionRecord {
            id: generate_session_id(),
            password: password.to_string(),
            device_info,
            conn,
            created_at_ms: now,
            last_activity_ms: now,
            created: Instant::now(),
            last_activity: Instant::now(),
        };
        inner.insert(session.id.clone(), session.clone());
        (session, evicted)
    }

    /// Look up a session, destroying it if idle past the timeout.
    pub fn validate(&self, id: &str) -> SessionCheck {
        let mut inner = self.inner.lock();
        match inner.get(id) {
            None => SessionCheck::Missing,
            Some(s) if s.last_activity.elapsed() > self.timeout => {
                let removed = inner.remove(id).expect("session present");
                SessionCheck::Expired(removed)
            }
            Some(s) => SessionCheck::Valid(s.clone()),
        }
    }

    /// Bump a session's activity clock.
    pub fn touch(&self, id: &str) {
        if let Some(s) = self.inner.lock().get_mut(id) {
            s.last_activity = Instant::now();
            s.last_activity_ms = now_ms();
        }
    }

    /// Remove a session by id.
    pub fn destroy(&self, id: &str) -> Option<SessionRecord> {
        self.inner.lock().remove(id)
    }

    /// Remove the session owned by a transport, if any.
    pub fn destroy_by_conn(&self, conn: ConnectionId) -> Option<SessionRecord> {
        let mut inner = self.inner.lock();
        let id = inner.values().find(|s| s.conn == conn).map(|s| s.id.clone())?;
        inner.remove(&id)
    }

    /// Every session for a password, oldest first.
    pub fn sessions_for(&self, password: &str) -> Vec<SessionRecord> {
        let inner = self.inner.lock();
        let mut sessions: Vec<_> = inner
            .values()
            .filter(|s| s.password == password)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created);
        sessions
    }

    /// Remove and return every idle-expired session.
    pub fn sweep(&self) -> Vec<SessionRecord> {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .values()
            .filter(|s| s.last_activity.elapsed() > self.timeout)
            .map(|s| s.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| inner.remove(id))
            .collect()
    }

    /// Counts for the status endpoint. `expired` counts sessions past
    /// their idle timeout that the sweep has not yet collected.
    pub fn stats(&self) -> SessionStats {
        let inner = self.inner.lock();
        let total = inner.len();
        let expired = inner
            .values()
            .filter(|s| s.last_activity.elapsed() > self.timeout)
            .count();
        let unique_users = {
            let mut passwords: Vec<&str> =
                inner.values().map(|s| s.password.as_str()).collect();
            passwords.sort_unstable();
            passwords.dedup();
            passwords.len()
        };
        SessionStats {
            total,
            active: total - expired,
            expired,
            unique_users,
        }
    }
}
