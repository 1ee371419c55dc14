use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use relay_common::{
    derive_status, format_log_time, LogEntry, LogSource, PushEvent, RelayConfig, StatusPayload,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::store::{Store, StoreError};

/// The relay operations shared by the device and dashboard endpoints.
///
/// Mutating calls hold `write_lock` across the store write and the
/// broadcasts that follow it, so observers see events in mutation order.
#[derive(Clone)]
pub struct Relay {
    store: Store,
    events: Broadcaster,
    config: Arc<RelayConfig>,
    timezone: Option<Tz>,
    write_lock: Arc<Mutex<()>>,
}

impl Relay {
    pub fn new(store: Store, config: RelayConfig) -> Self {
        let timezone = config.timezone.as_deref().and_then(|name| match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!("unknown timezone {name:?}, using system local time for log entries");
                None
            }
        });

        Self {
            store,
            events: Broadcaster::new(config.broadcast_capacity),
            config: Arc::new(config),
            timezone,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.events.observer_count()
    }

    /// Dashboard write. Returns the stored state.
    pub async fn set_led(&self, state: &str, now: DateTime<Utc>) -> Result<String, StoreError> {
        let _guard = self.write_lock.lock().await;

        let previous = self.store.swap_led_state(state).await?;
        if previous != state {
            self.append_entry(LogSource::Web, &format!("LED changed: {previous} → {state}"), now)
                .await?;
        }

        self.publish_logs().await?;
        self.publish_status(now).await?;
        Ok(state.to_string())
    }

    /// Device poll. Doubles as the liveness ping.
    pub async fn get_led(&self, now: DateTime<Utc>) -> Result<String, StoreError> {
        let _guard = self.write_lock.lock().await;

        self.store.set_heartbeat(now.timestamp_millis()).await?;
        let led = self.store.led_state().await?;
        self.publish_status(now).await?;
        Ok(led)
    }

    /// Device log line. Also counts as contact from the device.
    pub async fn post_log(&self, msg: &str, now: DateTime<Utc>) -> Result<LogEntry, StoreError> {
        let _guard = self.write_lock.lock().await;

        let entry = self.append_entry(LogSource::Esp, msg, now).await?;
        self.store.set_heartbeat(now.timestamp_millis()).await?;

        self.publish_logs().await?;
        self.publish_status(now).await?;
        Ok(entry)
    }

    /// Appends an entry on behalf of the relay itself and pushes the new tail.
    pub async fn record(
        &self,
        source: LogSource,
        msg: &str,
        now: DateTime<Utc>,
    ) -> Result<LogEntry, StoreError> {
        let _guard = self.write_lock.lock().await;

        let entry = self.append_entry(source, msg, now).await?;
        self.publish_logs().await?;
        Ok(entry)
    }

    pub async fn logs(&self, limit: Option<usize>) -> Result<Vec<LogEntry>, StoreError> {
        self.store.recent_logs(self.config.read_count(limit)).await
    }

    pub async fn status(&self, now: DateTime<Utc>) -> Result<StatusPayload, StoreError> {
        let led = self.store.led_state().await?;
        let heartbeat = self.store.heartbeat().await?;
        Ok(derive_status(
            &led,
            heartbeat,
            now.timestamp_millis(),
            self.config.heartbeat_timeout_ms,
        ))
    }

    /// What a newly connected observer is sent before any live event.
    pub async fn connect_snapshot(&self, now: DateTime<Utc>) -> Result<Vec<PushEvent>, StoreError> {
        Ok(vec![
            PushEvent::Status(self.status(now).await?),
            PushEvent::Logs(self.logs(None).await?),
        ])
    }

    /// Re-derives liveness and reports an edge to observers. Returns the
    /// current online flag for the next check.
    pub async fn check_liveness(
        &self,
        was_online: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;

        let status = self.status(now).await?;
        if status.online == was_online {
            return Ok(was_online);
        }

        if !status.online {
            let silent_for_s = match self.store.heartbeat().await? {
                Some(heartbeat) => (now.timestamp_millis() - heartbeat).max(0) / 1_000,
                None => 0,
            };
            self.append_entry(
                LogSource::Srv,
                &format!("ESP offline (no contact for {silent_for_s}s)"),
                now,
            )
            .await?;
            self.publish_logs().await?;
        }

        self.events.publish(&PushEvent::Status(status));
        Ok(!was_online)
    }

    async fn append_entry(
        &self,
        source: LogSource,
        msg: &str,
        now: DateTime<Utc>,
    ) -> Result<LogEntry, StoreError> {
        let time = self.log_time(now);
        let entry = self
            .store
            .append_log(source, msg, time, now.timestamp_millis())
            .await?;
        info!("[{}] {}: {}", entry.time, entry.source.as_str(), entry.msg);
        Ok(entry)
    }

    async fn publish_logs(&self) -> Result<(), StoreError> {
        let logs = self.logs(None).await?;
        self.events.publish(&PushEvent::Logs(logs));
        Ok(())
    }

    async fn publish_status(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let status = self.status(now).await?;
        self.events.publish(&PushEvent::Status(status));
        Ok(())
    }

    fn log_time(&self, now: DateTime<Utc>) -> String {
        match self.timezone {
            Some(tz) => format_log_time(&now.with_timezone(&tz)),
            None => format_log_time(&now.with_timezone(&Local)),
        }
    }
}
