use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use relay_common::{
    LogBuffer, LogEntry, LogSource, DEFAULT_LED_STATE, KEY_LAST_HEARTBEAT, KEY_LED_STATE,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("stored value for `{key}` has an unexpected type")]
    Corrupt { key: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey {
    LedState,
    LastHeartbeat,
}

impl StateKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LedState => KEY_LED_STATE,
            Self::LastHeartbeat => KEY_LAST_HEARTBEAT,
        }
    }
}

/// Key-value table plus append-only log, optionally mirrored to disk.
#[derive(Clone)]
pub struct Store {
    tables: Arc<Mutex<Tables>>,
    files: Option<Arc<StoreFiles>>,
}

struct Tables {
    values: BTreeMap<String, Value>,
    log: LogBuffer,
}

struct StoreFiles {
    state_path: PathBuf,
    logs_path: PathBuf,
}

impl Store {
    pub fn in_memory(log_capacity: usize) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables {
                values: BTreeMap::new(),
                log: LogBuffer::new(log_capacity),
            })),
            files: None,
        }
    }

    /// Opens a file-backed store, loading whatever a previous run left behind.
    pub async fn open(dir: impl AsRef<Path>, log_capacity: usize) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        let files = StoreFiles {
            state_path: dir.join("state.json"),
            logs_path: dir.join("logs.json"),
        };

        let values: BTreeMap<String, Value> = load_or_default(&files.state_path).await?;
        let entries: Vec<LogEntry> = load_or_default(&files.logs_path).await?;

        let log = LogBuffer::from_entries(log_capacity, entries);
        info!(
            dir = %dir.display(),
            keys = values.len(),
            log_entries = log.len(),
            "opened persistent store"
        );

        Ok(Self {
            tables: Arc::new(Mutex::new(Tables { values, log })),
            files: Some(Arc::new(files)),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.files.is_some()
    }

    pub async fn get(&self, key: StateKey) -> Result<Option<Value>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.values.get(key.as_str()).cloned())
    }

    pub async fn set(&self, key: StateKey, value: Value) -> Result<(), StoreError> {
        self.replace(key, value).await.map(|_| ())
    }

    /// Writes `value` and returns what was stored before, in one step.
    pub async fn replace(&self, key: StateKey, value: Value) -> Result<Option<Value>, StoreError> {
        let mut tables = self.tables.lock().await;
        let previous = tables.values.insert(key.as_str().to_string(), value);
        if let Some(files) = &self.files {
            files.save_values(&tables.values).await?;
        }
        Ok(previous)
    }

    pub async fn append_log(
        &self,
        source: LogSource,
        msg: &str,
        time: String,
        now_ms: i64,
    ) -> Result<LogEntry, StoreError> {
        let mut tables = self.tables.lock().await;
        let entry = tables.log.append(source, msg, time, now_ms);
        if let Some(files) = &self.files {
            files.save_log(&tables.log).await?;
        }
        Ok(entry)
    }

    pub async fn recent_logs(&self, n: usize) -> Result<Vec<LogEntry>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.log.recent(n))
    }

    pub async fn led_state(&self) -> Result<String, StoreError> {
        led_state_from(self.get(StateKey::LedState).await?)
    }

    /// Stores a new LED state verbatim and returns the previous one.
    pub async fn swap_led_state(&self, state: &str) -> Result<String, StoreError> {
        let previous = self
            .replace(StateKey::LedState, Value::String(state.to_string()))
            .await?;
        led_state_from(previous)
    }

    pub async fn heartbeat(&self) -> Result<Option<i64>, StoreError> {
        match self.get(StateKey::LastHeartbeat).await? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_i64().map(Some).ok_or(StoreError::Corrupt {
                key: KEY_LAST_HEARTBEAT,
            }),
        }
    }

    pub async fn set_heartbeat(&self, now_ms: i64) -> Result<(), StoreError> {
        self.set(StateKey::LastHeartbeat, Value::from(now_ms)).await
    }
}

fn led_state_from(value: Option<Value>) -> Result<String, StoreError> {
    match value {
        None | Some(Value::Null) => Ok(DEFAULT_LED_STATE.to_string()),
        Some(Value::String(state)) => Ok(state),
        Some(_) => Err(StoreError::Corrupt { key: KEY_LED_STATE }),
    }
}

impl StoreFiles {
    async fn save_values(&self, values: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(values)?;
        write_file(&self.state_path, payload).await
    }

    async fn save_log(&self, log: &LogBuffer) -> Result<(), StoreError> {
        let entries: Vec<&LogEntry> = log.entries().collect();
        let payload = serde_json::to_vec(&entries)?;
        write_file(&self.logs_path, payload).await
    }
}

/// Missing files start empty. So do unreadable ones: a torn write must not
/// keep the relay from starting.
async fn load_or_default<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<T>(&raw).unwrap_or_else(|err| {
            warn!("discarding unreadable {}: {err}", path.display());
            T::default()
        })),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

/// Writes to a sibling temp file and renames it over `path`.
async fn write_file(path: &Path, payload: Vec<u8>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, payload).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
