//! Wire frame types. Every frame is a single JSON object; inbound frames
//! carry a `cmd` tag, replies carry `ret` plus a boolean `result`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Timestamp format used on the wire ("cloudtime") and in the store.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Backup slot tag that identifies the face-template modality in the store.
pub const FACE_BACKUP_NUM: i32 = 50;

pub fn cloudtime_now() -> String {
    chrono::Local::now().format(TIME_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// Device-initiated commands

#[derive(Debug, Clone, Deserialize)]
pub struct RegCmd {
    pub sn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendUserCmd {
    pub sn: String,
    #[serde(default)]
    pub enrollid: i64,
    #[serde(default)]
    pub backupnum: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub admin: i32,
    #[serde(default)]
    pub record: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendLogCmd {
    pub sn: String,
    #[serde(default)]
    pub record: Vec<LogRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    pub enrollid: i64,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub note: Option<LogNote>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogNote {
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingCmd {
    #[serde(default)]
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Operator-initiated commands

#[derive(Debug, Clone, Deserialize)]
pub struct AdminAddUserCmd {
    #[serde(rename = "deviceSn")]
    pub device_sn: String,
    pub name: String,
    #[serde(rename = "isAdmin", default)]
    pub is_admin: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminUserIdCmd {
    #[serde(rename = "enrollId")]
    pub enroll_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminSetActiveCmd {
    #[serde(rename = "enrollId")]
    pub enroll_id: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminSearchCmd {
    pub name: String,
}

// ---------------------------------------------------------------------------
// Replies and server-initiated frames

/// Builder for the common `{ ret, result, ... }` reply shape.
pub struct Reply {
    body: serde_json::Map<String, Value>,
}

impl Reply {
    pub fn ok(ret: &str) -> Self {
        let mut body = serde_json::Map::new();
        body.insert("ret".into(), Value::String(ret.to_string()));
        body.insert("result".into(), Value::Bool(true));
        Self { body }
    }

    pub fn fail(ret: &str, error: &str) -> Self {
        let mut body = serde_json::Map::new();
        body.insert("ret".into(), Value::String(ret.to_string()));
        body.insert("result".into(), Value::Bool(false));
        body.insert("error".into(), Value::String(error.to_string()));
        Self { body }
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

/// Per-scan reply to a device. `access` is 1 to open the door, 0 otherwise.
pub fn sendlog_reply(access: i32, message: &str) -> Value {
    Reply::ok("sendlog")
        .field("access", access)
        .field("message", message)
        .field("cloudtime", cloudtime_now())
        .into_value()
}

/// Registration acknowledgement sent to a device after `reg` (and re-sent
/// when an operator console reconnects).
pub fn reg_ack() -> Value {
    Reply::ok("reg")
        .field("cloudtime", cloudtime_now())
        .field("nosenduser", false)
        .into_value()
}

/// Server command instructing a device to purge enrolled users.
pub fn clean_user_cmd() -> Value {
    serde_json::json!({ "cmd": "cleanuser" })
}

/// Server command instructing a device to purge stored logs.
pub fn clean_log_cmd() -> Value {
    serde_json::json!({ "cmd": "cleanlog" })
}

/// Liveness details attached to `live_scan` telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessTelemetry {
    #[serde(rename = "Score")]
    pub score: f32,
    #[serde(rename = "Prob")]
    pub prob: f32,
    #[serde(rename = "TimeMs")]
    pub time_ms: u64,
}

/// Telemetry pushed to every operator after each scan.
#[derive(Debug, Clone, Serialize)]
pub struct LiveScan {
    pub ret: &'static str,
    #[serde(rename = "deviceSn")]
    pub device_sn: String,
    #[serde(rename = "deviceIp")]
    pub device_ip: String,
    pub time: String,
    pub matched: bool,
    #[serde(rename = "matchScore")]
    pub match_score: f32,
    #[serde(rename = "enrollId")]
    pub enroll_id: i64,
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(rename = "hasFace")]
    pub has_face: bool,
    pub liveness: Option<LivenessTelemetry>,
}

/// Broadcast to operators when an enrollment completes.
pub fn enroll_complete_frame(enroll_id: i64, username: &str, device_sn: &str) -> Value {
    serde_json::json!({
        "ret": "admin_enroll_complete",
        "enrollId": enroll_id,
        "username": username,
        "deviceSn": device_sn,
    })
}
