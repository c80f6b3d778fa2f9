//! Authentication state: password format checks, per-password lockout,
//! the trusted-device registry, and the security log.
//!
//! Everything here is pure bookkeeping. The relay layer decides what to
//! send to which transport; this module never performs I/O.

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::protocol::{now_ms, SecurityEvent, TrustedDeviceInfo};

/// Security log event names.
pub mod events {
    pub const COMPUTER_REGISTERED: &str = "COMPUTER_REGISTERED";
    pub const SESSION_CREATED: &str = "SESSION_CREATED";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const SESSION_KICKED: &str = "SESSION_KICKED";
    pub const LOGIN_FAILED: &str = "LOGIN_FAILED";
    pub const LOCKOUT_TRIGGERED: &str = "LOCKOUT_TRIGGERED";
    pub const TRUSTED_DEVICE_REGISTERED: &str = "TRUSTED_DEVICE_REGISTERED";
    pub const AUTO_LOGIN_SUCCESS: &str = "AUTO_LOGIN_SUCCESS";
    pub const AUTO_LOGIN_FAILED: &str = "AUTO_LOGIN_FAILED";
}

/// True iff the password is acceptable as a host identifier.
pub fn validate_password_format(password: &str) -> bool {
    password.len() >= 4
}

/// Lowercase-hex SHA-256 of a password. Trusted devices store this
/// instead of the password so a rotation silently invalidates the trust.
pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// Result of a lockout check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStatus {
    pub locked: bool,
    pub remaining_minutes: u64,
}

/// Why a trusted-device validation failed. The display strings are the
/// exact `auto_login_failed` reasons on the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrustError {
    #[error("Device not found")]
    NotFound,
    #[error("Device trust expired")]
    Expired,
    #[error("Password changed")]
    PasswordChanged,
}

struct FailedAttempts {
    count: u32,
    last_attempt: Instant,
}

struct TrustedDevice {
    device_id: String,
    password_hash: String,
    name: Option<String>,
    browser: Option<String>,
    created: Instant,
    created_at_ms: u64,
    last_used_ms: u64,
}

impl TrustedDevice {
    fn info(&self) -> TrustedDeviceInfo {
        TrustedDeviceInfo {
            device_id: self.device_id.clone(),
            name: self.name.clone(),
            browser: self.browser.clone(),
            created_at: self.created_at_ms,
            last_used: self.last_used_ms,
        }
    }
}

struct AuthInner {
    failed: HashMap<String, FailedAttempts>,
    trusted: HashMap<String, TrustedDevice>,
    log: VecDeque<SecurityEvent>,
}

/// Guarded auth tables. Cheap to clone a handle via `Arc` at the relay
/// level; internally a single mutex since every operation is O(1)-ish.
pub struct AuthStore {
    inner: Mutex<AuthInner>,
    max_failed_attempts: u32,
    lockout_duration: Duration,
    trusted_device_expiry: Duration,
    security_log_limit: usize,
}

impl AuthStore {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            inner: Mutex::new(AuthInner {
                failed: HashMap::new(),
                trusted: HashMap::new(),
                log: VecDeque::new(),
            }),
            max_failed_attempts: config.max_failed_attempts,
            lockout_duration: config.lockout_duration,
            trusted_device_expiry: config.trusted_device_expiry,
            security_log_limit: config.security_log_limit,
        }
    }

    /// Check whether a password is currently locked out. A stale entry
    /// (no new attempt within the lockout window) is cleared as a side
    /// effect.
    pub fn check_lockout(&self, password: &str) -> LockoutStatus {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.failed.get(password) else {
            return LockoutStatus {
                locked: false,
                remaining_minutes: 0,
            };
        };
        let elapsed = entry.last_attempt.elapsed();
        if elapsed >= self.lockout_duration {
            inner.failed.remove(password);
            return LockoutStatus {
                locked: false,
                remaining_minutes: 0,
            };
        }
        if entry.count >= self.max_failed_attempts {
            let remaining = self.lockout_duration - elapsed;
            return LockoutStatus {
                locked: true,
                remaining_minutes: (remaining.as_secs() + 59) / 60,
            };
        }
        LockoutStatus {
            locked: false,
            remaining_minutes: 0,
        }
    }

    /// Record a failed attempt for this password. Returns the new count.
    pub fn record_failed_attempt(&self, password: &str) -> u32 {
        let mut inner = self.inner.lock();
        let entry = inner
            .failed
            .entry(password.to_string())
            .or_insert(FailedAttempts {
                count: 0,
                last_attempt: Instant::now(),
            });
        entry.count += 1;
        entry.last_attempt = Instant::now();
        entry.count
    }

    /// Clear the failure counter after a successful attach.
    pub fn clear_failed_attempts(&self, password: &str) {
        self.inner.lock().failed.remove(password);
    }

    /// Register a trusted device for this password, returning its fresh
    /// id and metadata.
    pub fn register_trusted_device(
        &self,
        password: &str,
        name: Option<String>,
        browser: Option<String>,
    ) -> TrustedDeviceInfo {
        let now = now_ms();
        let device = TrustedDevice {
            device_id: Uuid::new_v4().to_string(),
            password_hash: hash_password(password),
            name,
            browser,
            created: Instant::now(),
            created_at_ms: now,
            last_used_ms: now,
        };
        let info = device.info();
        self.inner
            .lock()
            .trusted
            .insert(device.device_id.clone(), device);
        info
    }

    /// Validate a trusted device against a password. Expired entries are
    /// deleted; a successful validation refreshes `last_used`.
    pub fn validate_trusted_device(
        &self,
        password: &str,
        device_id: &str,
    ) -> Result<TrustedDeviceInfo, TrustError> {
        let mut inner = self.inner.lock();
        let Some(device) = inner.trusted.get_mut(device_id) else {
            return Err(TrustError::NotFound);
        };
        if device.created.elapsed() >= self.trusted_device_expiry {
            inner.trusted.remove(device_id);
            return Err(TrustError::Expired);
        }
        if device.password_hash != hash_password(password) {
            return Err(TrustError::PasswordChanged);
        }
        device.last_used_ms = now_ms();
        Ok(device.info())
    }

    /// All live trusted devices registered under this password.
    pub fn trusted_devices_for(&self, password: &str) -> Vec<TrustedDeviceInfo> {
        let hash = hash_password(password);
        let inner = self.inner.lock();
        inner
            .trusted
            .values()
            .filter(|d| d.password_hash == hash && d.created.elapsed() < self.trusted_device_expiry)
            .map(TrustedDevice::info)
            .collect()
    }

    /// Append to the security log, newest first, capped at the limit.
    pub fn log_event(&self, event: &str, details: Value, ip: Option<String>) {
        let mut inner = self.inner.lock();
        inner.log.push_front(SecurityEvent {
            timestamp: now_ms(),
            event: event.to_string(),
            details,
            ip,
        });
        inner.log.truncate(self.security_log_limit);
    }

    /// Snapshot of the security log, newest first.
    pub fn security_log(&self) -> Vec<SecurityEvent> {
        self.inner.lock().log.iter().cloned().collect()
    }
}
