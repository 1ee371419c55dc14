use serde::{Deserialize, Serialize};

pub const DEFAULT_LED_STATE: &str = "off";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogSource {
    Web,
    Esp,
    Srv,
}

impl LogSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "WEB",
            Self::Esp => "ESP",
            Self::Srv => "SRV",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: String,
    pub source: LogSource,
    pub msg: String,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub online: bool,
    #[serde(rename = "ledState")]
    pub led_state: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: Option<String>,
    #[serde(rename = "serverTime")]
    pub server_time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetLedRequest {
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLedResponse {
    pub ok: bool,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedResponse {
    pub led: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostLogRequest {
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Server-to-dashboard message on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    Status(StatusPayload),
    Logs(Vec<LogEntry>),
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status(_) => crate::EVENT_STATUS,
            Self::Logs(_) => crate::EVENT_LOGS,
        }
    }
}

/// Dashboard-to-server message on the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Refresh,
}

impl ClientEvent {
    /// Accepts either the bare event name or a JSON envelope.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed == crate::EVENT_REFRESH {
            return Some(Self::Refresh);
        }
        serde_json::from_str(trimmed).ok()
    }
}
