use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub port: u16,
    /// Device counts as online while its last poll is younger than this.
    pub heartbeat_timeout_ms: u64,
    pub liveness_check_interval_ms: u64,
    /// Entries retained by the log store.
    pub log_capacity: usize,
    /// Entries exposed to readers.
    pub log_read_limit: usize,
    pub broadcast_capacity: usize,
    /// IANA zone for log timestamps; system local time when unset.
    pub timezone: Option<String>,
    /// Persist state and logs under this directory; in-memory when unset.
    pub data_dir: Option<String>,
    pub web_root: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            heartbeat_timeout_ms: 10_000,
            liveness_check_interval_ms: 1_000,
            log_capacity: 500,
            log_read_limit: 100,
            broadcast_capacity: 64,
            timezone: None,
            data_dir: None,
            web_root: None,
        }
    }
}

impl RelayConfig {
    pub fn sanitize(&mut self) {
        self.heartbeat_timeout_ms = self.heartbeat_timeout_ms.max(1_000);
        self.liveness_check_interval_ms = self.liveness_check_interval_ms.max(100);
        self.log_capacity = self.log_capacity.max(1);
        self.log_read_limit = self.log_read_limit.clamp(1, self.log_capacity);
        self.broadcast_capacity = self.broadcast_capacity.max(1);

        for value in [&mut self.timezone, &mut self.data_dir, &mut self.web_root] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *value = None;
            }
        }
    }

    /// Clamps a requested read count to the exposed limit.
    pub fn read_count(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.log_read_limit)
            .min(self.log_read_limit)
    }
}
