//! Message routing between hosts and their attached controllers, plus
//! connection lifecycle: disconnect propagation, presence fan-out, the
//! heartbeat reaper, and the expired-session sweep.
//!
//! Handlers collect recipients from the registry (which snapshots them
//! under its lock) and send afterwards through each transport's outbound
//! queue, so no socket I/O ever happens while shared state is locked.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::auth::{self, events, AuthStore};
use crate::config::RelayConfig;
use crate::protocol::{
    now_ms, parse_client_message, ClientMessage, DeviceInfo, ProtocolError, ServerMessage,
};
use crate::registry::{
    Classification, ConnectionHandle, ConnectionId, DetachOutcome, Registry, RegistryError,
};
use crate::session::{DestroyReason, SessionCheck, SessionManager, SessionRecord};
use crate::transfer::TransferStore;

const MSG_REPLACED: &str = "Another computer connected with same password";
const MSG_HOST_OFFLINE: &str = "Computer not found or offline";
const MSG_BAD_PASSWORD: &str = "Invalid password format";
const MSG_DISCONNECTED: &str = "Computer has disconnected";

/// The relay core: connection registry, auth state, sessions, and
/// transfer buffers behind one facade the transport layer talks to.
pub struct Relay {
    pub registry: Registry,
    pub auth: AuthStore,
    pub sessions: SessionManager,
    pub transfers: TransferStore,
    pub config: RelayConfig,
}

/// Resolved sender context for a controller-originated message.
struct ControllerCtx {
    password: String,
    session_id: String,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Registry::new(),
            auth: AuthStore::new(&config),
            sessions: SessionManager::new(&config),
            transfers: TransferStore::new(&config),
            config,
        }
    }

    /// Track a freshly upgraded transport.
    pub fn register_connection(&self, handle: ConnectionHandle) -> ConnectionId {
        self.registry.add(handle)
    }

    /// A protocol-level pong arrived on this transport.
    pub fn pong_received(&self, conn: ConnectionId) {
        if let Some(handle) = self.registry.handle(conn) {
            handle.mark_alive();
        }
    }

    fn send_to(&self, conn: ConnectionId, msg: ServerMessage) {
        if let Some(handle) = self.registry.handle(conn) {
            handle.send(msg);
        }
    }

    fn send_error(&self, conn: ConnectionId, message: impl Into<String>) {
        self.send_to(
            conn,
            ServerMessage::Error {
                message: message.into(),
            },
        );
    }

    /// Decode and dispatch one inbound frame.
    pub fn handle_frame(self: &Arc<Self>, conn: ConnectionId, text: &str) {
        let msg = match parse_client_message(text) {
            Ok(msg) => msg,
            Err(ProtocolError::UnknownType(tag)) => {
                tracing::debug!(conn, tag = %tag, "dropping unknown message type");
                return;
            }
            Err(ProtocolError::InvalidPayload(tag, e)) => {
                tracing::debug!(conn, tag = %tag, error = %e, "invalid payload");
                self.send_error(conn, format!("Invalid {tag} message"));
                return;
            }
            Err(e) => {
                tracing::debug!(conn, error = %e, "malformed frame");
                self.send_error(conn, "Invalid message format");
                return;
            }
        };

        match msg {
            ClientMessage::Ping => self.send_to(conn, ServerMessage::Pong),
            ClientMessage::RegisterComputer { password, info } => {
                self.register_computer(conn, password, info)
            }
            ClientMessage::ConnectToComputer {
                password,
                trust_device,
                device_info,
            } => self.connect_to_computer(conn, password, trust_device, device_info),
            ClientMessage::AutoLogin {
                device_id,
                password,
            } => self.auto_login(conn, device_id, password),
            ClientMessage::Relay { data } => self.relay_command(conn, data),
            ClientMessage::Screenshot { rest } => {
                self.broadcast_from_host(conn, |rest| ServerMessage::Screenshot { rest }, rest)
            }
            ClientMessage::CommandResult { rest } => {
                self.broadcast_from_host(conn, |rest| ServerMessage::CommandResult { rest }, rest)
            }
            ClientMessage::GetSessions => self.get_sessions(conn),
            ClientMessage::KickSession { session_id } => self.kick_session(conn, session_id),
            ClientMessage::Logout => self.logout(conn),
            ClientMessage::GetSecurityLog => {
                if self.controller_ctx(conn).is_some() {
                    self.send_to(
                        conn,
                        ServerMessage::SecurityLog {
                            log: self.auth.security_log(),
                        },
                    );
                }
            }
            ClientMessage::GetTrustedDevices => {
                if let Some(ctx) = self.controller_ctx(conn) {
                    self.send_to(
                        conn,
                        ServerMessage::TrustedDevices {
                            devices: self.auth.trusted_devices_for(&ctx.password),
                        },
                    );
                }
            }
            ClientMessage::GetConnectedUsers => {
                if let Some(ctx) = self.controller_ctx(conn) {
                    let (_, _, users) = self.registry.presence(&ctx.password);
                    let total_count = users.len();
                    self.send_to(
                        conn,
                        ServerMessage::ConnectedUsers { users, total_count },
                    );
                }
            }
            ClientMessage::GetRecentFiles => {
                if let Some(ctx) = self.controller_ctx(conn) {
                    self.send_to(
                        conn,
                        ServerMessage::RecentFiles {
                            files: self.transfers.recent_files(&ctx.password),
                        },
                    );
                }
            }
            ClientMessage::FileUploadStart {
                file_name,
                file_size,
                file_type,
            } => self.file_upload_start(conn, file_name, file_size, file_type),
            ClientMessage::FileChunk {
                transfer_id,
                chunk_index,
                data,
            } => self.file_chunk(conn, transfer_id, chunk_index, data),
            ClientMessage::FileUploadComplete { transfer_id } => {
                self.file_upload_complete(conn, transfer_id)
            }
            ClientMessage::FileCancel { transfer_id } => {
                if self.controller_ctx(conn).is_some() {
                    self.transfers.cancel(&transfer_id);
                }
            }
            ClientMessage::FileDownloadRequest { rest } => {
                self.forward_file_command(conn, "file_download_request", rest)
            }
            ClientMessage::BrowseFiles { rest } => {
                self.forward_file_command(conn, "browse_files", rest)
            }
            ClientMessage::FileOperation { rest } => {
                self.forward_file_command(conn, "file_operation", rest)
            }
            ClientMessage::StartFileWatcher { rest } => {
                self.forward_file_command(conn, "start_file_watcher", rest)
            }
            ClientMessage::StopFileWatcher { rest } => {
                self.forward_file_command(conn, "stop_file_watcher", rest)
            }
            ClientMessage::GetWatchedFolders => {
                self.forward_file_command(conn, "get_watched_folders", Map::new())
            }
            ClientMessage::FileDownloadResponse { requester_id, rest } => self.deliver_directed(
                conn,
                requester_id,
                ServerMessage::FileDownloadResponse { rest },
            ),
            ClientMessage::FileOperationResult { requester_id, rest } => self.deliver_directed(
                conn,
                requester_id,
                ServerMessage::FileOperationResult { rest },
            ),
            ClientMessage::BrowseResultRelay { requester_id, rest } => {
                self.deliver_directed(conn, requester_id, ServerMessage::BrowseResult { rest })
            }
            ClientMessage::WatcherResult { requester_id, rest } => {
                self.deliver_directed(conn, requester_id, ServerMessage::WatcherResult { rest })
            }
            ClientMessage::WatchedFolders { requester_id, rest } => {
                self.deliver_directed(conn, requester_id, ServerMessage::WatchedFolders { rest })
            }
            ClientMessage::FileChangeEvent { rest } => self.file_change_event(conn, rest),
            ClientMessage::Unknown => unreachable!("filtered by the parser"),
        }
    }

    // ── Registration and attachment ─────────────────────────────────

    fn register_computer(&self, conn: ConnectionId, password: String, info: Value) {
        if !auth::validate_password_format(&password) {
            self.send_error(conn, MSG_BAD_PASSWORD);
            return;
        }
        match self.registry.register_host(conn, &password, info) {
            Ok(outcome) => {
                if let Some(old) = outcome.replaced {
                    old.send(ServerMessage::Replaced {
                        message: MSG_REPLACED.to_string(),
                    });
                    old.close();
                    tracing::info!(conn, "host replaced a previous registration");
                }
                self.auth.log_event(
                    events::COMPUTER_REGISTERED,
                    json!({ "password": mask(&password) }),
                    None,
                );
                self.send_to(conn, ServerMessage::Registered { success: true });
                tracing::info!(conn, "host registered");
            }
            Err(RegistryError::AlreadyClassified) => {
                self.send_error(conn, "Already registered");
            }
            Err(_) => {}
        }
    }

    fn connect_to_computer(
        &self,
        conn: ConnectionId,
        password: String,
        trust_device: bool,
        device_info: DeviceInfo,
    ) {
        let lockout = self.auth.check_lockout(&password);
        if lockout.locked {
            self.send_error(
                conn,
                format!(
                    "Too many attempts. Try again in {} minutes",
                    lockout.remaining_minutes
                ),
            );
            return;
        }
        if !auth::validate_password_format(&password) {
            self.send_error(conn, MSG_BAD_PASSWORD);
            return;
        }
        if !self.registry.host_exists(&password) {
            let count = self.auth.record_failed_attempt(&password);
            self.auth.log_event(
                events::LOGIN_FAILED,
                json!({ "password": mask(&password) }),
                None,
            );
            if count == self.config.max_failed_attempts {
                self.auth.log_event(
                    events::LOCKOUT_TRIGGERED,
                    json!({ "password": mask(&password) }),
                    None,
                );
                tracing::warn!(conn, "password locked out after repeated failures");
            }
            self.send_error(conn, MSG_HOST_OFFLINE);
            return;
        }
        self.auth.clear_failed_attempts(&password);

        let device_id = trust_device.then(|| {
            let device = self.auth.register_trusted_device(
                &password,
                device_info.name.clone(),
                device_info.browser.clone(),
            );
            self.auth.log_event(
                events::TRUSTED_DEVICE_REGISTERED,
                json!({ "deviceId": device.device_id }),
                None,
            );
            device.device_id
        });

        self.attach(conn, &password, device_info, device_id, false);
    }

    fn auto_login(&self, conn: ConnectionId, device_id: String, password: String) {
        let fail = |reason: String| {
            self.auth
                .log_event(events::AUTO_LOGIN_FAILED, json!({ "reason": &reason }), None);
            self.send_to(conn, ServerMessage::AutoLoginFailed { reason });
        };

        let lockout = self.auth.check_lockout(&password);
        if lockout.locked {
            fail(format!(
                "Too many attempts. Try again in {} minutes",
                lockout.remaining_minutes
            ));
            return;
        }
        let device = match self.auth.validate_trusted_device(&password, &device_id) {
            Ok(device) => device,
            Err(e) => {
                fail(e.to_string());
                return;
            }
        };
        if !self.registry.host_exists(&password) {
            fail(MSG_HOST_OFFLINE.to_string());
            return;
        }
        self.auth.log_event(
            events::AUTO_LOGIN_SUCCESS,
            json!({ "deviceId": &device.device_id }),
            None,
        );
        let device_info = DeviceInfo {
            name: device.name.clone(),
            browser: device.browser.clone(),
            trusted: true,
            extra: Map::new(),
        };
        self.attach(conn, &password, device_info, Some(device.device_id), true);
    }

    /// Shared tail of both attach paths: session creation, registry
    /// insertion, the `connected` reply, eviction notice, and presence.
    fn attach(
        &self,
        conn: ConnectionId,
        password: &str,
        device_info: DeviceInfo,
        device_id: Option<String>,
        via_auto_login: bool,
    ) {
        match self.registry.classification(conn) {
            Some(Classification::Unassigned) => {}
            Some(_) => {
                if via_auto_login {
                    self.send_to(
                        conn,
                        ServerMessage::AutoLoginFailed {
                            reason: "Already registered".to_string(),
                        },
                    );
                } else {
                    self.send_error(conn, "Already registered");
                }
                return;
            }
            None => return,
        }

        let (session, evicted) = self.sessions.create(password, device_info.clone(), conn);
        if let Err(e) = self
            .registry
            .attach_controller(conn, password, &session.id, device_info)
        {
            // The host vanished between the existence check and now.
            self.sessions.destroy(&session.id);
            tracing::debug!(conn, error = %e, "attach raced a host removal");
            self.send_error(conn, MSG_HOST_OFFLINE);
            return;
        }

        self.auth.log_event(
            events::SESSION_CREATED,
            json!({ "sessionId": mask(&session.id) }),
            None,
        );
        self.send_to(
            conn,
            ServerMessage::Connected {
                session_id: session.id.clone(),
                device_id,
                expires_in: self.config.session_timeout.as_millis() as u64,
            },
        );
        tracing::info!(conn, "controller attached");

        if let Some(evicted) = evicted {
            self.notify_destroyed(&evicted, DestroyReason::MaxSessionsExceeded);
        }
        self.broadcast_presence(password);
    }

    // ── Controller-originated traffic ───────────────────────────────

    /// Resolve and touch the sender's session. Expired sessions are
    /// destroyed and notified here; unattached or sessionless senders
    /// yield `None` and the message is dropped silently.
    fn controller_ctx(&self, conn: ConnectionId) -> Option<ControllerCtx> {
        let entry = self.registry.controller_entry(conn)?;
        match self.sessions.validate(&entry.session_id) {
            SessionCheck::Valid(_) => {
                self.sessions.touch(&entry.session_id);
                Some(ControllerCtx {
                    password: entry.password,
                    session_id: entry.session_id,
                })
            }
            SessionCheck::Expired(record) => {
                self.notify_destroyed(&record, DestroyReason::Expired);
                None
            }
            SessionCheck::Missing => None,
        }
    }

    fn relay_command(&self, conn: ConnectionId, data: Value) {
        let Some(ctx) = self.controller_ctx(conn) else {
            return;
        };
        if let Some(host) = self.registry.host_handle(&ctx.password) {
            host.send(ServerMessage::Command {
                session_id: ctx.session_id,
                data,
            });
        }
    }

    fn get_sessions(&self, conn: ConnectionId) {
        let Some(ctx) = self.controller_ctx(conn) else {
            return;
        };
        let sessions = self
            .sessions
            .sessions_for(&ctx.password)
            .iter()
            .map(|s| s.info(&ctx.session_id))
            .collect();
        self.send_to(conn, ServerMessage::SessionsList { sessions });
    }

    fn kick_session(&self, conn: ConnectionId, session_id: String) {
        let Some(ctx) = self.controller_ctx(conn) else {
            return;
        };
        let target = self
            .sessions
            .sessions_for(&ctx.password)
            .into_iter()
            .find(|s| s.id == session_id);
        match target {
            Some(target) => {
                self.sessions.destroy(&target.id);
                self.notify_destroyed(&target, DestroyReason::Kicked);
                self.send_to(
                    conn,
                    ServerMessage::KickResult {
                        success: true,
                        message: None,
                    },
                );
            }
            None => {
                self.send_to(
                    conn,
                    ServerMessage::KickResult {
                        success: false,
                        message: Some("Session not found".to_string()),
                    },
                );
            }
        }
    }

    fn logout(&self, conn: ConnectionId) {
        let Some(entry) = self.registry.controller_entry(conn) else {
            return;
        };
        if let Some(record) = self.sessions.destroy(&entry.session_id) {
            self.notify_destroyed(&record, DestroyReason::Manual);
        } else if let Some(handle) = self.registry.handle(conn) {
            handle.close();
        }
    }

    fn file_upload_start(
        &self,
        conn: ConnectionId,
        file_name: String,
        file_size: u64,
        file_type: String,
    ) {
        let Some(ctx) = self.controller_ctx(conn) else {
            return;
        };
        match self
            .transfers
            .begin_upload(conn, &ctx.password, &file_name, file_size, &file_type)
        {
            Ok(transfer_id) => {
                tracing::debug!(conn, file = %file_name, size = file_size, "upload started");
                self.send_to(
                    conn,
                    ServerMessage::FileUploadReady {
                        success: true,
                        transfer_id,
                    },
                );
            }
            Err(e) => self.send_error(conn, e.to_string()),
        }
    }

    fn file_chunk(&self, conn: ConnectionId, transfer_id: String, chunk_index: u32, data: String) {
        if self.controller_ctx(conn).is_none() {
            return;
        }
        match self.transfers.store_chunk(&transfer_id, chunk_index, &data) {
            Ok(progress) => self.send_to(
                conn,
                ServerMessage::FileProgress {
                    transfer_id: progress.transfer_id,
                    progress: progress.progress,
                    speed: progress.speed,
                    eta: progress.eta,
                },
            ),
            Err(e) => self.send_error(conn, e.to_string()),
        }
    }

    fn file_upload_complete(self: &Arc<Self>, conn: ConnectionId, transfer_id: String) {
        if self.controller_ctx(conn).is_none() {
            return;
        }
        let done = match self.transfers.complete(&transfer_id) {
            Ok(done) => done,
            Err(e) => {
                self.send_error(conn, e.to_string());
                return;
            }
        };

        if let Some(host) = self.registry.host_handle(&done.password) {
            let mut rest = Map::new();
            rest.insert("transferId".into(), json!(&done.transfer_id));
            rest.insert("fileName".into(), json!(&done.file_name));
            rest.insert("fileData".into(), json!(&done.data_base64));
            rest.insert("fileSize".into(), json!(done.file_size));
            rest.insert("fileType".into(), json!(&done.file_type));
            host.send(ServerMessage::FileCommand {
                command: "file_receive".to_string(),
                requester_id: None,
                rest,
            });
        }
        self.send_to(
            conn,
            ServerMessage::FileUploadSuccess {
                transfer_id: transfer_id.clone(),
                file_name: done.file_name,
            },
        );

        // Retain the record for a grace window, then purge.
        let relay = Arc::clone(self);
        let grace = self.config.transfer_purge_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            relay.transfers.purge(&transfer_id);
        });
    }

    /// Stamp a controller request with its session id and pass it to the
    /// host as a `file_command`.
    fn forward_file_command(&self, conn: ConnectionId, command: &str, rest: Map<String, Value>) {
        let Some(ctx) = self.controller_ctx(conn) else {
            return;
        };
        if let Some(host) = self.registry.host_handle(&ctx.password) {
            host.send(ServerMessage::FileCommand {
                command: command.to_string(),
                requester_id: Some(ctx.session_id),
                rest,
            });
        }
    }

    // ── Host-originated traffic ─────────────────────────────────────

    fn host_password(&self, conn: ConnectionId) -> Option<String> {
        match self.registry.classification(conn)? {
            Classification::Host { password } => Some(password),
            _ => None,
        }
    }

    fn broadcast_from_host(
        &self,
        conn: ConnectionId,
        build: impl Fn(Map<String, Value>) -> ServerMessage,
        rest: Map<String, Value>,
    ) {
        let Some(password) = self.host_password(conn) else {
            return;
        };
        for controller in self.registry.controllers_of(&password) {
            controller.send(build(rest.clone()));
        }
    }

    /// Deliver a host response to exactly the controller whose session
    /// matches `requester_id`; silently dropped when nobody matches.
    fn deliver_directed(&self, conn: ConnectionId, requester_id: String, msg: ServerMessage) {
        let Some(password) = self.host_password(conn) else {
            return;
        };
        if let Some(target) = self.registry.controller_for_session(&password, &requester_id) {
            target.send(msg);
        }
    }

    fn file_change_event(&self, conn: ConnectionId, mut rest: Map<String, Value>) {
        let Some(password) = self.host_password(conn) else {
            return;
        };
        // The server's clock wins over anything the host stamped.
        rest.remove("timestamp");
        let timestamp = now_ms();
        for controller in self.registry.controllers_of(&password) {
            controller.send(ServerMessage::FileChangeEvent {
                timestamp,
                rest: rest.clone(),
            });
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Send the `session_expired` notice to a destroyed session's
    /// transport, close it, and record the event.
    fn notify_destroyed(&self, session: &SessionRecord, reason: DestroyReason) {
        let event = match reason {
            DestroyReason::Kicked => events::SESSION_KICKED,
            _ => events::SESSION_EXPIRED,
        };
        self.auth.log_event(
            event,
            json!({ "sessionId": mask(&session.id), "reason": reason.as_str() }),
            None,
        );
        if let Some(handle) = self.registry.handle(session.conn) {
            handle.send(ServerMessage::SessionExpired {
                reason: reason.as_str().to_string(),
                message: reason.notice().to_string(),
            });
            handle.close();
        }
    }

    /// Emit `users_changed` to the host and every attached controller.
    fn broadcast_presence(&self, password: &str) {
        let (host, controllers, users) = self.registry.presence(password);
        let total_count = users.len();
        let msg = ServerMessage::UsersChanged { users, total_count };
        if let Some(host) = host {
            host.send(msg.clone());
        }
        for controller in controllers {
            controller.send(msg.clone());
        }
    }

    /// A transport closed (cleanly or reaped). Tear down whatever it
    /// owned and propagate.
    pub fn disconnect(&self, conn: ConnectionId) {
        self.transfers.cancel_for_conn(conn);
        match self.registry.detach(conn) {
            DetachOutcome::None => {}
            DetachOutcome::Host {
                password: _,
                controllers,
            } => {
                tracing::info!(conn, "host disconnected");
                for controller in controllers {
                    controller.send(ServerMessage::ComputerDisconnected {
                        message: MSG_DISCONNECTED.to_string(),
                    });
                }
            }
            DetachOutcome::Controller {
                password,
                session_id,
            } => {
                tracing::info!(conn, "controller disconnected");
                self.sessions.destroy(&session_id);
                self.broadcast_presence(&password);
            }
        }
    }

    /// One heartbeat round: reap transports that never answered the
    /// previous ping, probe the rest.
    pub fn heartbeat_tick(&self) {
        let pass = self.registry.heartbeat_pass();
        for (conn, handle) in pass.dead {
            tracing::debug!(conn, "terminating unresponsive transport");
            handle.terminate();
        }
        for handle in pass.live {
            handle.ping();
        }
    }

    /// Destroy every idle-expired session and notify its transport.
    pub fn sweep_sessions(&self) {
        for record in self.sessions.sweep() {
            tracing::debug!(session = %mask(&record.id), "session expired");
            self.notify_destroyed(&record, DestroyReason::Expired);
        }
    }

    /// Spawn the heartbeat and cleanup loops.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(relay.config.heartbeat_interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                relay.heartbeat_tick();
            }
        });

        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(relay.config.cleanup_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                relay.sweep_sessions();
            }
        });
    }
}

/// Truncate a secret for the security log.
fn mask(secret: &str) -> String {
    let mut masked: String = secret.chars().take(2).collect();
    masked.push_str("***");
    masked
}
