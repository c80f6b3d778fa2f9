//! Connection registry: every live transport, its latched
//! classification, and the password → host / controller mappings.
//!
//! Mutations are serialized under one mutex. No method performs I/O;
//! recipients are collected under the lock and returned as handles so
//! the relay layer sends after release.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{DeviceInfo, PresenceEntry, ServerMessage};

pub type ConnectionId = u64;

/// Frames and control signals bound for one transport's writer loop.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerMessage),
    /// Protocol-level ping for the liveness probe.
    Ping,
    /// Close the socket after flushing.
    Close,
}

/// The sending half of one transport, shared with the registry.
///
/// `cancel` hard-terminates the transport's select loop (used by the
/// reaper); `close` asks the writer to finish cleanly. The `alive` flag
/// backs the ping/pong probe.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    pub cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                cancel: CancellationToken::new(),
                alive: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    /// Queue a frame. Errors (receiver gone) are ignored: a transport
    /// that is going away simply misses the frame.
    pub fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(Outbound::Frame(msg));
    }

    pub fn ping(&self) {
        let _ = self.tx.send(Outbound::Ping);
    }

    /// Ask the writer loop to close the socket cleanly.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    /// Hard-terminate the transport's select loop.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// A pong arrived.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Clear the liveness flag, returning its previous value.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

/// What a transport is. Latched on first successful registration; a
/// transport never moves between Host and Controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Unassigned,
    Host { password: String },
    Controller { password: String, session_id: String },
}

/// A controller's registry record.
#[derive(Debug, Clone)]
pub struct ControllerEntry {
    pub password: String,
    pub session_id: String,
    pub device_info: DeviceInfo,
}

struct ConnEntry {
    handle: ConnectionHandle,
    class: Classification,
}

struct HostEntry {
    conn: ConnectionId,
    #[allow(dead_code)]
    info: Value,
    controllers: HashSet<ConnectionId>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("transport is already registered")]
    AlreadyClassified,
    #[error("no host registered for this password")]
    HostNotFound,
    #[error("unknown transport")]
    UnknownConnection,
}

/// Outcome of a host registration.
pub struct RegisterOutcome {
    /// Handle of the previous host for this password, if one was live.
    pub replaced: Option<ConnectionHandle>,
}

/// What `detach` found and tore down.
pub enum DetachOutcome {
    None,
    Host {
        password: String,
        /// Handles of the controllers that were attached.
        controllers: Vec<ConnectionHandle>,
    },
    Controller {
        password: String,
        session_id: String,
    },
}

/// One pass of the liveness probe.
pub struct HeartbeatPass {
    /// Transports that never answered the previous ping.
    pub dead: Vec<(ConnectionId, ConnectionHandle)>,
    /// Transports to ping this round.
    pub live: Vec<ConnectionHandle>,
}

struct RegistryInner {
    conns: HashMap<ConnectionId, ConnEntry>,
    hosts: HashMap<String, HostEntry>,
    controllers: HashMap<ConnectionId, ControllerEntry>,
}

/// The shared connection registry.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                conns: HashMap::new(),
                hosts: HashMap::new(),
                controllers: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Track a new transport as Unassigned.
    pub fn add(&self, handle: ConnectionHandle) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().conns.insert(
            id,
            ConnEntry {
                handle,
                class: Classification::Unassigned,
            },
        );
        id
    }

    pub fn classification(&self, conn: ConnectionId) -> Option<Classification> {
        self.inner.lock().conns.get(&conn).map(|e| e.class.clone())
    }

    pub fn handle(&self, conn: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.lock().conns.get(&conn).map(|e| e.handle.clone())
    }

    /// Install a host for `password`. If another host holds the
    /// password, its handle is returned so the caller can notify and
    /// close it; its controller set is discarded (the new host starts
    /// empty) but the controllers' own records survive.
    pub fn register_host(
        &self,
        conn: ConnectionId,
        password: &str,
        info: Value,
    ) -> Result<RegisterOutcome, RegistryError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .conns
            .get(&conn)
            .ok_or(RegistryError::UnknownConnection)?;
        if entry.class != Classification::Unassigned {
            return Err(RegistryError::AlreadyClassified);
        }

        let replaced = inner
            .hosts
            .get(password)
            .and_then(|old| inner.conns.get(&old.conn))
            .map(|old| old.handle.clone());

        inner.hosts.insert(
            password.to_string(),
            HostEntry {
                conn,
                info,
                controllers: HashSet::new(),
            },
        );
        if let Some(entry) = inner.conns.get_mut(&conn) {
            entry.class = Classification::Host {
                password: password.to_string(),
            };
        }
        Ok(RegisterOutcome { replaced })
    }

    /// Attach a controller to the host for `password`.
    pub fn attach_controller(
        &self,
        conn: ConnectionId,
        password: &str,
        session_id: &str,
        device_info: DeviceInfo,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .conns
            .get(&conn)
            .ok_or(RegistryError::UnknownConnection)?;
        if entry.class != Classification::Unassigned {
            return Err(RegistryError::AlreadyClassified);
        }
        let host = inner
            .hosts
            .get_mut(password)
            .ok_or(RegistryError::HostNotFound)?;
        host.controllers.insert(conn);
        inner.controllers.insert(
            conn,
            ControllerEntry {
                password: password.to_string(),
                session_id: session_id.to_string(),
                device_info,
            },
        );
        if let Some(entry) = inner.conns.get_mut(&conn) {
            entry.class = Classification::Controller {
                password: password.to_string(),
                session_id: session_id.to_string(),
            };
        }
        Ok(())
    }

    pub fn host_exists(&self, password: &str) -> bool {
        self.inner.lock().hosts.contains_key(password)
    }

    /// Sending handle of the live host for `password`.
    pub fn host_handle(&self, password: &str) -> Option<ConnectionHandle> {
        let inner = self.inner.lock();
        let host = inner.hosts.get(password)?;
        inner.conns.get(&host.conn).map(|e| e.handle.clone())
    }

    /// The controller record for a transport, if it is attached.
    pub fn controller_entry(&self, conn: ConnectionId) -> Option<ControllerEntry> {
        self.inner.lock().controllers.get(&conn).cloned()
    }

    /// Handles of every controller attached to `password`'s host.
    pub fn controllers_of(&self, password: &str) -> Vec<ConnectionHandle> {
        let inner = self.inner.lock();
        let Some(host) = inner.hosts.get(password) else {
            return Vec::new();
        };
        host.controllers
            .iter()
            .filter_map(|c| inner.conns.get(c))
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Handle of the single attached controller whose session matches
    /// `requester_id`, for directed responses.
    pub fn controller_for_session(
        &self,
        password: &str,
        requester_id: &str,
    ) -> Option<ConnectionHandle> {
        let inner = self.inner.lock();
        let host = inner.hosts.get(password)?;
        for conn in &host.controllers {
            if let Some(entry) = inner.controllers.get(conn) {
                if entry.session_id == requester_id {
                    return inner.conns.get(conn).map(|e| e.handle.clone());
                }
            }
        }
        None
    }

    /// Presence snapshot for a password: the host handle, every attached
    /// controller handle, and the wire-ready entry list.
    pub fn presence(
        &self,
        password: &str,
    ) -> (
        Option<ConnectionHandle>,
        Vec<ConnectionHandle>,
        Vec<PresenceEntry>,
    ) {
        let inner = self.inner.lock();
        let Some(host) = inner.hosts.get(password) else {
            return (None, Vec::new(), Vec::new());
        };
        let host_handle = inner.conns.get(&host.conn).map(|e| e.handle.clone());
        let mut handles = Vec::new();
        let mut entries = Vec::new();
        for conn in &host.controllers {
            if let (Some(c), Some(record)) =
                (inner.conns.get(conn), inner.controllers.get(conn))
            {
                handles.push(c.handle.clone());
                entries.push(PresenceEntry {
                    session_id: record.session_id.clone(),
                    device_info: record.device_info.clone(),
                });
            }
        }
        (host_handle, handles, entries)
    }

    /// Remove a transport and tear down whatever it owned.
    ///
    /// A replaced host (its password now owned by a successor) tears
    /// down nothing. A detached host removes its controllers' records;
    /// their transports stay open.
    pub fn detach(&self, conn: ConnectionId) -> DetachOutcome {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.conns.remove(&conn) else {
            return DetachOutcome::None;
        };
        match entry.class {
            Classification::Unassigned => DetachOutcome::None,
            Classification::Host { password } => {
                let owns = inner
                    .hosts
                    .get(&password)
                    .map(|h| h.conn == conn)
                    .unwrap_or(false);
                if !owns {
                    return DetachOutcome::None;
                }
                let host = inner.hosts.remove(&password).expect("host present");
                let mut handles = Vec::new();
                for c in &host.controllers {
                    inner.controllers.remove(c);
                    if let Some(e) = inner.conns.get(c) {
                        handles.push(e.handle.clone());
                    }
                }
                DetachOutcome::Host {
                    password,
                    controllers: handles,
                }
            }
            Classification::Controller {
                password,
                session_id,
            } => {
                inner.controllers.remove(&conn);
                if let Some(host) = inner.hosts.get_mut(&password) {
                    host.controllers.remove(&conn);
                }
                DetachOutcome::Controller {
                    password,
                    session_id,
                }
            }
        }
    }

    /// (hosts, attached controllers) for the status endpoint.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.hosts.len(), inner.controllers.len())
    }

    /// One liveness pass: transports whose flag is still cleared are
    /// dead; the rest get their flag cleared and are due a ping.
    pub fn heartbeat_pass(&self) -> HeartbeatPass {
        let inner = self.inner.lock();
        let mut dead = Vec::new();
        let mut live = Vec::new();
        for (id, entry) in &inner.conns {
            if entry.handle.take_alive() {
                live.push(entry.handle.clone());
            } else {
                dead.push((*id, entry.handle.clone()));
            }
        }
        HeartbeatPass { dead, live }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_conn(registry: &Registry) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (handle, rx) = ConnectionHandle::new();
        (registry.add(handle), rx)
    }

    #[test]
    fn connections_start_unassigned() {
        let registry = Registry::new();
        let (conn, _rx) = add_conn(&registry);
        assert_eq!(
            registry.classification(conn),
            Some(Classification::Unassigned)
        );
    }

    #[test]
    fn at_most_one_host_per_password() {
        let registry = Registry::new();
        let (h1, _rx1) = add_conn(&registry);
        let (h2, _rx2) = add_conn(&registry);

        let outcome = registry.register_host(h1, "alpha", json!({})).unwrap();
        assert!(outcome.replaced.is_none());

        let outcome = registry.register_host(h2, "alpha", json!({})).unwrap();
        assert!(outcome.replaced.is_some());

        // The password now belongs to h2.
        let (hosts, _) = registry.counts();
        assert_eq!(hosts, 1);
        assert_eq!(
            registry.classification(h2),
            Some(Classification::Host {
                password: "alpha".into()
            })
        );
    }

    #[test]
    fn replaced_host_detach_leaves_successor_alone() {
        let registry = Registry::new();
        let (h1, _rx1) = add_conn(&registry);
        let (h2, _rx2) = add_conn(&registry);
        registry.register_host(h1, "alpha", json!({})).unwrap();
        registry.register_host(h2, "alpha", json!({})).unwrap();

        // The replaced host closing must not tear down the new record.
        assert!(matches!(registry.detach(h1), DetachOutcome::None));
        assert!(registry.host_exists("alpha"));
    }

    #[test]
    fn classification_is_latched() {
        let registry = Registry::new();
        let (conn, _rx) = add_conn(&registry);
        registry.register_host(conn, "alpha", json!({})).unwrap();

        assert!(matches!(
            registry.register_host(conn, "beta", json!({})),
            Err(RegistryError::AlreadyClassified)
        ));
        assert!(matches!(
            registry.attach_controller(conn, "alpha", "s", DeviceInfo::default()),
            Err(RegistryError::AlreadyClassified)
        ));
    }

    #[test]
    fn attach_requires_live_host() {
        let registry = Registry::new();
        let (conn, _rx) = add_conn(&registry);
        assert!(matches!(
            registry.attach_controller(conn, "alpha", "s", DeviceInfo::default()),
            Err(RegistryError::HostNotFound)
        ));
    }

    #[test]
    fn attached_controller_is_in_host_set() {
        let registry = Registry::new();
        let (host, _hrx) = add_conn(&registry);
        let (ctrl, _crx) = add_conn(&registry);
        registry.register_host(host, "alpha", json!({})).unwrap();
        registry
            .attach_controller(ctrl, "alpha", "s1", DeviceInfo::default())
            .unwrap();

        let entry = registry.controller_entry(ctrl).unwrap();
        assert_eq!(entry.password, "alpha");
        assert_eq!(registry.controllers_of("alpha").len(), 1);

        let (_, _, presence) = registry.presence("alpha");
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].session_id, "s1");
    }

    #[test]
    fn directed_lookup_matches_exactly_one() {
        let registry = Registry::new();
        let (host, _hrx) = add_conn(&registry);
        let (c1, mut rx1) = add_conn(&registry);
        let (c2, mut rx2) = add_conn(&registry);
        registry.register_host(host, "alpha", json!({})).unwrap();
        registry
            .attach_controller(c1, "alpha", "s1", DeviceInfo::default())
            .unwrap();
        registry
            .attach_controller(c2, "alpha", "s2", DeviceInfo::default())
            .unwrap();

        let target = registry.controller_for_session("alpha", "s1").unwrap();
        target.send(ServerMessage::Pong);

        assert!(matches!(rx1.try_recv(), Ok(Outbound::Frame(ServerMessage::Pong))));
        assert!(rx2.try_recv().is_err());
        assert!(registry.controller_for_session("alpha", "s3").is_none());
    }

    #[test]
    fn host_detach_reports_and_unattaches_controllers() {
        let registry = Registry::new();
        let (host, _hrx) = add_conn(&registry);
        let (ctrl, _crx) = add_conn(&registry);
        registry.register_host(host, "alpha", json!({})).unwrap();
        registry
            .attach_controller(ctrl, "alpha", "s1", DeviceInfo::default())
            .unwrap();

        match registry.detach(host) {
            DetachOutcome::Host {
                password,
                controllers,
            } => {
                assert_eq!(password, "alpha");
                assert_eq!(controllers.len(), 1);
            }
            _ => panic!("expected host detach"),
        }
        assert!(!registry.host_exists("alpha"));
        // The controller record was removed with the host.
        assert!(registry.controller_entry(ctrl).is_none());
        // But the controller transport itself is still tracked.
        assert!(registry.handle(ctrl).is_some());
    }

    #[test]
    fn controller_detach_shrinks_host_set() {
        let registry = Registry::new();
        let (host, _hrx) = add_conn(&registry);
        let (ctrl, _crx) = add_conn(&registry);
        registry.register_host(host, "alpha", json!({})).unwrap();
        registry
            .attach_controller(ctrl, "alpha", "s1", DeviceInfo::default())
            .unwrap();

        match registry.detach(ctrl) {
            DetachOutcome::Controller {
                password,
                session_id,
            } => {
                assert_eq!(password, "alpha");
                assert_eq!(session_id, "s1");
            }
            _ => panic!("expected controller detach"),
        }
        assert!(registry.controllers_of("alpha").is_empty());
    }

    #[test]
    fn heartbeat_pass_splits_live_and_dead() {
        let registry = Registry::new();
        let (a, _rxa) = add_conn(&registry);
        let (_b, _rxb) = add_conn(&registry);

        // First pass clears both flags; everyone was alive.
        let pass = registry.heartbeat_pass();
        assert_eq!(pass.live.len(), 2);
        assert!(pass.dead.is_empty());

        // Only `a` pongs before the next pass.
        registry.handle(a).unwrap().mark_alive();
        let pass = registry.heartbeat_pass();
        assert_eq!(pass.live.len(), 1);
        assert_eq!(pass.dead.len(), 1);
    }
}
