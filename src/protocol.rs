//! Wire protocol for the relay WebSocket.
//!
//! Every frame is a UTF-8 JSON object with a snake_case `type`
//! discriminator and camelCase fields. Frames the relay forwards without
//! interpreting carry a flattened map so host/controller extensions
//! survive the trip untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Free-form device descriptor supplied by a controller at connect time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default)]
    pub trusted: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Messages arriving over a transport, from hosts and controllers alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    #[serde(rename_all = "camelCase")]
    RegisterComputer {
        password: String,
        #[serde(default)]
        info: Value,
    },
    #[serde(rename_all = "camelCase")]
    ConnectToComputer {
        password: String,
        #[serde(default)]
        trust_device: bool,
        #[serde(default)]
        device_info: DeviceInfo,
    },
    #[serde(rename_all = "camelCase")]
    AutoLogin {
        device_id: String,
        password: String,
    },
    Relay {
        data: Value,
    },
    Screenshot {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    #[serde(rename = "result")]
    CommandResult {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    GetSessions,
    #[serde(rename_all = "camelCase")]
    KickSession {
        session_id: String,
    },
    Logout,
    GetSecurityLog,
    GetTrustedDevices,
    GetConnectedUsers,
    GetRecentFiles,
    #[serde(rename_all = "camelCase")]
    FileUploadStart {
        file_name: String,
        file_size: u64,
        #[serde(default)]
        file_type: String,
    },
    #[serde(rename_all = "camelCase")]
    FileChunk {
        transfer_id: String,
        chunk_index: u32,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    FileUploadComplete {
        transfer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FileCancel {
        transfer_id: String,
    },
    FileDownloadRequest {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    BrowseFiles {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    FileOperation {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    StartFileWatcher {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    StopFileWatcher {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    GetWatchedFolders,
    #[serde(rename_all = "camelCase")]
    FileDownloadResponse {
        requester_id: String,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    FileOperationResult {
        requester_id: String,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    BrowseResultRelay {
        requester_id: String,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    WatcherResult {
        requester_id: String,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    WatchedFolders {
        requester_id: String,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    FileChangeEvent {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    /// Catch-all for tags this relay does not know. Logged and dropped.
    #[serde(other)]
    Unknown,
}

/// Messages the relay sends to a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong,
    Registered {
        success: bool,
    },
    Replaced {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Connected {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        expires_in: u64,
    },
    AutoLoginFailed {
        reason: String,
    },
    Error {
        message: String,
    },
    SessionExpired {
        reason: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Command {
        session_id: String,
        data: Value,
    },
    Screenshot {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    #[serde(rename = "result")]
    CommandResult {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    SessionsList {
        sessions: Vec<SessionInfo>,
    },
    KickResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SecurityLog {
        log: Vec<SecurityEvent>,
    },
    TrustedDevices {
        devices: Vec<TrustedDeviceInfo>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectedUsers {
        users: Vec<PresenceEntry>,
        total_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    UsersChanged {
        users: Vec<PresenceEntry>,
        total_count: usize,
    },
    ComputerDisconnected {
        message: String,
    },
    RecentFiles {
        files: Vec<RecentFile>,
    },
    #[serde(rename_all = "camelCase")]
    FileUploadReady {
        success: bool,
        transfer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FileProgress {
        transfer_id: String,
        progress: u32,
        speed: f64,
        eta: f64,
    },
    #[serde(rename_all = "camelCase")]
    FileUploadSuccess {
        transfer_id: String,
        file_name: String,
    },
    #[serde(rename_all = "camelCase")]
    FileCommand {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        requester_id: Option<String>,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    FileDownloadResponse {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    FileOperationResult {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    BrowseResult {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    WatcherResult {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    WatchedFolders {
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    FileChangeEvent {
        timestamp: u64,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
}

/// One session, as reported in `sessions_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub device_info: DeviceInfo,
    pub created_at: u64,
    pub last_activity: u64,
    pub current: bool,
}

/// One attached controller, as reported in presence frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub session_id: String,
    pub device_info: DeviceInfo,
}

/// One trusted device, as reported in `trusted_devices`. The password
/// hash never leaves the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedDeviceInfo {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    pub created_at: u64,
    pub last_used: u64,
}

/// One entry of the append-only security log, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: u64,
    pub event: String,
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// One recently transferred file descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentFile {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub direction: String,
    pub timestamp: u64,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON frame: {0}")]
    Malformed(serde_json::Error),
    #[error("frame has no type field")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {0} payload: {1}")]
    InvalidPayload(String, serde_json::Error),
}

/// Decode an inbound frame, distinguishing malformed JSON, unknown
/// `type` tags, and bad payloads for known tags so the dispatcher can
/// apply the right error policy to each.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    match serde_json::from_value::<ClientMessage>(value) {
        Ok(ClientMessage::Unknown) => Err(ProtocolError::UnknownType(tag)),
        Ok(msg) => Ok(msg),
        Err(e) => Err(ProtocolError::InvalidPayload(tag, e)),
    }
}

/// Encode an outbound frame as a JSON string.
pub fn encode_server_message(msg: &ServerMessage) -> String {
    // ServerMessage contains nothing a serializer can reject.
    serde_json::to_string(msg).expect("server message serializes")
}

/// Milliseconds since the Unix epoch, for wire timestamps.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ping_round_trip() {
        let msg = parse_client_message(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn register_computer_parses() {
        let msg = parse_client_message(
            r#"{"type":"register_computer","password":"alpha","info":{"os":"linux"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::RegisterComputer { password, info } => {
                assert_eq!(password, "alpha");
                assert_eq!(info["os"], "linux");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn connect_uses_camel_case_fields() {
        let msg = parse_client_message(
            r#"{"type":"connect_to_computer","password":"alpha","trustDevice":true,
                "deviceInfo":{"name":"Pixel","browser":"Chrome"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::ConnectToComputer {
                password,
                trust_device,
                device_info,
            } => {
                assert_eq!(password, "alpha");
                assert!(trust_device);
                assert_eq!(device_info.name.as_deref(), Some("Pixel"));
                assert_eq!(device_info.browser.as_deref(), Some("Chrome"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn connect_defaults_optional_fields() {
        let msg =
            parse_client_message(r#"{"type":"connect_to_computer","password":"alpha"}"#).unwrap();
        match msg {
            ClientMessage::ConnectToComputer {
                trust_device,
                device_info,
                ..
            } => {
                assert!(!trust_device);
                assert_eq!(device_info, DeviceInfo::default());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_distinguished() {
        let err = parse_client_message(r#"{"type":"frobnicate","data":1}"#).unwrap_err();
        match err {
            ProtocolError::UnknownType(tag) => assert_eq!(tag, "frobnicate"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn malformed_json_is_distinguished() {
        let err = parse_client_message("{nope").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn missing_type_is_distinguished() {
        let err = parse_client_message(r#"{"password":"alpha"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn bad_payload_for_known_type() {
        // chunkIndex must be a number.
        let err = parse_client_message(
            r#"{"type":"file_chunk","transferId":"t","chunkIndex":"x","data":""}"#,
        )
        .unwrap_err();
        match err {
            ProtocolError::InvalidPayload(tag, _) => assert_eq!(tag, "file_chunk"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn passthrough_frames_keep_extra_fields() {
        let msg = parse_client_message(
            r#"{"type":"browse_files","path":"/home","showHidden":true}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::BrowseFiles { rest } => {
                assert_eq!(rest["path"], "/home");
                assert_eq!(rest["showHidden"], true);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn directed_relay_extracts_requester_id() {
        let msg = parse_client_message(
            r#"{"type":"browse_result_relay","requesterId":"S1","success":true,"items":[]}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::BrowseResultRelay { requester_id, rest } => {
                assert_eq!(requester_id, "S1");
                assert_eq!(rest["success"], true);
                assert!(!rest.contains_key("requesterId"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn connected_serializes_camel_case() {
        let encoded = encode_server_message(&ServerMessage::Connected {
            session_id: "abc".into(),
            device_id: None,
            expires_in: 1_800_000,
        });
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["sessionId"], "abc");
        assert_eq!(value["expiresIn"], 1_800_000);
        assert!(value.get("deviceId").is_none());
    }

    #[test]
    fn file_command_flattens_rest() {
        let mut rest = Map::new();
        rest.insert("path".into(), json!("/tmp"));
        let encoded = encode_server_message(&ServerMessage::FileCommand {
            command: "browse_files".into(),
            requester_id: Some("S1".into()),
            rest,
        });
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "file_command");
        assert_eq!(value["command"], "browse_files");
        assert_eq!(value["requesterId"], "S1");
        assert_eq!(value["path"], "/tmp");
    }

    #[test]
    fn result_frames_use_result_tag() {
        let msg = parse_client_message(r#"{"type":"result","data":{"ok":true}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::CommandResult { .. }));

        let encoded = encode_server_message(&ServerMessage::CommandResult {
            rest: Map::new(),
        });
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "result");
    }

    #[test]
    fn users_changed_shape() {
        let encoded = encode_server_message(&ServerMessage::UsersChanged {
            users: vec![PresenceEntry {
                session_id: "s".into(),
                device_info: DeviceInfo::default(),
            }],
            total_count: 1,
        });
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "users_changed");
        assert_eq!(value["totalCount"], 1);
        assert_eq!(value["users"][0]["sessionId"], "s");
    }

    #[test]
    fn extra_fields_on_known_types_are_ignored() {
        let msg = parse_client_message(r#"{"type":"ping","stray":"field"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }
}
