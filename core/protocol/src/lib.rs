//! IPC protocol types and validation for the Moped wait protocol.
//!
//! This crate is shared by the editor host and the `moped` CLI to prevent
//! schema drift. The host remains the authority on validation, but the CLI
//! reuses the same types to construct valid requests.
//!
//! Two layers live here:
//!
//! - the request/response envelope spoken over the host's Unix socket
//!   (one JSON object per line), and
//! - the broadcast notifications carried inside `post` requests and
//!   `subscribe` streams (`CLIWaitRequest` / `CLIWaitComplete`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

pub const APP_IDENTIFIER: &str = "net.machorro.roberto.Moped";
pub const WAIT_REQUEST_NOTIFICATION: &str = "net.machorro.roberto.Moped.CLIWaitRequest";
pub const WAIT_COMPLETE_NOTIFICATION: &str = "net.machorro.roberto.Moped.CLIWaitComplete";

pub const SESSION_ID_KEY: &str = "sessionID";
pub const FILES_KEY: &str = "files";
pub const SESSION_FILE_KEY: &str = "sessionFilePath";

pub const MARKER_EXTENSION: &str = "wait";

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Post,
    Subscribe,
    OpenFiles,
    CloseFiles,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// A named broadcast message with a loosely-typed payload.
///
/// `user_info` stays a raw JSON object on purpose: receivers pull the keys
/// they understand and drop anything malformed instead of failing the whole
/// frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub name: String,
    #[serde(default)]
    pub user_info: Map<String, Value>,
}

impl Notification {
    pub fn new(name: &str, user_info: Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            user_info,
        }
    }

    fn string_field(&self, key: &str) -> Option<&str> {
        self.user_info.get(key).and_then(Value::as_str)
    }
}

pub fn parse_notification(params: Value) -> Result<Notification, ErrorInfo> {
    let notification: Notification = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("notification payload is invalid: {}", err),
        )
    })?;
    if notification.name.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "name is required"));
    }
    Ok(notification)
}

/// Payload of `CLIWaitRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitRequest {
    pub session_id: String,
    pub files: Vec<String>,
    pub session_file_path: Option<String>,
}

impl WaitRequest {
    pub fn to_notification(&self) -> Notification {
        let mut user_info = Map::new();
        user_info.insert(
            SESSION_ID_KEY.to_string(),
            Value::String(self.session_id.clone()),
        );
        user_info.insert(
            FILES_KEY.to_string(),
            Value::Array(self.files.iter().cloned().map(Value::String).collect()),
        );
        if let Some(path) = &self.session_file_path {
            user_info.insert(SESSION_FILE_KEY.to_string(), Value::String(path.clone()));
        }
        Notification::new(WAIT_REQUEST_NOTIFICATION, user_info)
    }

    /// Extracts a wait request from a notification.
    ///
    /// `sessionID` and `files` are mandatory; a `files` array holding anything
    /// other than strings rejects the whole request. `sessionFilePath` is
    /// optional and ignored when it is not a string.
    pub fn from_notification(notification: &Notification) -> Result<Self, ErrorInfo> {
        if notification.name != WAIT_REQUEST_NOTIFICATION {
            return Err(ErrorInfo::new(
                "unexpected_notification",
                format!("expected {}", WAIT_REQUEST_NOTIFICATION),
            ));
        }

        let session_id = require_session_id(notification)?;

        let files = match notification.user_info.get(FILES_KEY) {
            Some(Value::Array(values)) => values
                .iter()
                .map(|value| value.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    ErrorInfo::new("invalid_field", format!("{} must be strings", FILES_KEY))
                })?,
            Some(_) => {
                return Err(ErrorInfo::new(
                    "invalid_field",
                    format!("{} must be an array", FILES_KEY),
                ))
            }
            None => {
                return Err(ErrorInfo::new(
                    "missing_field",
                    format!("{} is required", FILES_KEY),
                ))
            }
        };

        let session_file_path = notification
            .string_field(SESSION_FILE_KEY)
            .filter(|value| !value.trim().is_empty())
            .map(str::to_string);

        Ok(Self {
            session_id,
            files,
            session_file_path,
        })
    }
}

/// Payload of `CLIWaitComplete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitComplete {
    pub session_id: String,
}

impl WaitComplete {
    pub fn to_notification(&self) -> Notification {
        let mut user_info = Map::new();
        user_info.insert(
            SESSION_ID_KEY.to_string(),
            Value::String(self.session_id.clone()),
        );
        Notification::new(WAIT_COMPLETE_NOTIFICATION, user_info)
    }

    pub fn from_notification(notification: &Notification) -> Result<Self, ErrorInfo> {
        if notification.name != WAIT_COMPLETE_NOTIFICATION {
            return Err(ErrorInfo::new(
                "unexpected_notification",
                format!("expected {}", WAIT_COMPLETE_NOTIFICATION),
            ));
        }
        Ok(Self {
            session_id: require_session_id(notification)?,
        })
    }
}

fn require_session_id(notification: &Notification) -> Result<String, ErrorInfo> {
    let session_id = notification
        .string_field(SESSION_ID_KEY)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ErrorInfo::new("missing_field", format!("{} is required", SESSION_ID_KEY))
        })?;
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_field",
            format!(
                "{} must be {} characters or fewer",
                SESSION_ID_KEY, MAX_SESSION_ID_LEN
            ),
        ));
    }
    Ok(session_id.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscribeParams {
    pub names: Vec<String>,
}

pub fn parse_subscribe(params: Value) -> Result<SubscribeParams, ErrorInfo> {
    let parsed: SubscribeParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("subscribe payload is invalid: {}", err),
        )
    })?;
    if parsed.names.iter().all(|name| name.trim().is_empty()) {
        return Err(ErrorInfo::new("missing_field", "names is required"));
    }
    Ok(parsed)
}

/// Parameters of `open_files` and `close_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesParams {
    pub files: Vec<String>,
}

pub fn parse_files(params: Value) -> Result<FilesParams, ErrorInfo> {
    let parsed: FilesParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("files payload is invalid: {}", err),
        )
    })?;
    if parsed.files.is_empty() {
        return Err(ErrorInfo::new("missing_field", "files is required"));
    }
    Ok(parsed)
}

/// Data returned by `get_health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthInfo {
    pub status: String,
    pub app_id: String,
    pub pid: u32,
    pub version: String,
    pub protocol_version: u32,
    pub started_at: String,
    #[serde(default)]
    pub pending_sessions: usize,
    #[serde(default)]
    pub open_documents: usize,
}

impl HealthInfo {
    pub fn is_moped(&self) -> bool {
        self.status == "ok" && self.app_id == APP_IDENTIFIER
    }
}

/// File name of the marker for `session_id`.
pub fn marker_file_name(session_id: &str) -> String {
    format!("{}.{}", session_id, MARKER_EXTENSION)
}
