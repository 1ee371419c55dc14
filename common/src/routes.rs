pub const ROUTE_SET: &str = "/set";
pub const ROUTE_GET: &str = "/get";
pub const ROUTE_LOG: &str = "/log";
pub const ROUTE_LOGS: &str = "/logs";
pub const ROUTE_STATUS: &str = "/status";
pub const ROUTE_WS: &str = "/ws";

pub const EVENT_STATUS: &str = "status";
pub const EVENT_LOGS: &str = "logs";
pub const EVENT_REFRESH: &str = "refresh";

pub const KEY_LED_STATE: &str = "ledState";
pub const KEY_LAST_HEARTBEAT: &str = "lastHeartbeat";
