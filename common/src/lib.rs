pub mod config;
pub mod log;
pub mod routes;
pub mod status;
pub mod types;

pub use config::RelayConfig;
pub use log::{format_log_time, LogBuffer};
pub use routes::*;
pub use status::{derive_status, is_online, iso_timestamp};
pub use types::{
    ClientEvent, LedResponse, LogEntry, LogSource, OkResponse, PostLogRequest, PushEvent,
    SetLedRequest, SetLedResponse, StatusPayload, DEFAULT_LED_STATE,
};
