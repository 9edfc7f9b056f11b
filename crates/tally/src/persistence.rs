//! Durable storage for persistent replicants.
//!
//! One JSON blob per `(namespace, name)` under the state directory. Writes
//! go through a temp file in the target directory followed by an atomic
//! rename, so a crash can never leave a truncated blob readable. Writes are
//! debounced per key: the first dirtying of a window schedules a write at
//! the window's edge, later dirtyings within the window just refresh the
//! blob (latest wins).

use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tallyproto::path as op_path;
use tracing::{debug, warn};

/// Filesystem layout for replicant blobs.
#[derive(Debug, Clone)]
pub struct ReplicantStore {
    root: PathBuf,
}

impl ReplicantStore {
    /// Open (creating if needed) a store rooted at `<state_dir>/replicants`.
    pub fn open(state_dir: &Path) -> std::io::Result<Self> {
        let root = state_dir.join("replicants");
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root
            .join(fs_component(namespace))
            .join(format!("{}.json", fs_component(name)))
    }

    /// Read the persisted value, if one exists.
    pub fn read(&self, namespace: &str, name: &str) -> std::io::Result<Option<Value>> {
        let path = self.blob_path(namespace, name);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Write (or clear, for an undefined value) the persisted blob.
    pub fn write(&self, namespace: &str, name: &str, value: &Option<Value>) -> std::io::Result<()> {
        let path = self.blob_path(namespace, name);
        match value {
            None => match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            },
            Some(value) => {
                let dir = path.parent().unwrap_or(&self.root);
                std::fs::create_dir_all(dir)?;
                let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
                tmp.write_all(&serde_json::to_vec(value)?)?;
                tmp.as_file().sync_all()?;
                tmp.persist(&path).map_err(|e| e.error)?;
                Ok(())
            }
        }
    }
}

struct PendingWrite {
    value: Option<Value>,
    due: Instant,
}

/// Per-key debouncer in front of a [`ReplicantStore`].
pub struct Persistor {
    store: ReplicantStore,
    pending: Mutex<HashMap<(String, String), PendingWrite>>,
}

impl Persistor {
    pub fn new(store: ReplicantStore) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Record the latest value for a key. The write lands when the key's
    /// current window expires.
    pub fn schedule(&self, namespace: &str, name: &str, value: Option<Value>, window: Duration) {
        let mut pending = self.pending.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        match pending.get_mut(&key) {
            Some(entry) => entry.value = value,
            None => {
                pending.insert(
                    key,
                    PendingWrite {
                        value,
                        due: Instant::now() + window,
                    },
                );
            }
        }
    }

    /// Write every entry whose window has expired. Failed writes stay
    /// pending and are retried on the next tick. Returns how many blobs
    /// were written.
    pub fn flush_due(&self, now: Instant) -> usize {
        let due: Vec<((String, String), Option<Value>)> = {
            let mut pending = self.pending.lock().unwrap();
            let keys: Vec<(String, String)> = pending
                .iter()
                .filter(|(_, entry)| entry.due <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|entry| (key, entry.value)))
                .collect()
        };

        let mut written = 0;
        for ((namespace, name), value) in due {
            match self.store.write(&namespace, &name, &value) {
                Ok(()) => {
                    written += 1;
                    debug!(replicant = %format!("{namespace}/{name}"), "persisted");
                }
                Err(e) => {
                    warn!(
                        replicant = %format!("{namespace}/{name}"),
                        error = %e,
                        "persist failed, will retry"
                    );
                    let mut pending = self.pending.lock().unwrap();
                    pending.entry((namespace, name)).or_insert(PendingWrite {
                        value,
                        due: now,
                    });
                }
            }
        }
        written
    }

    /// Write everything immediately. For shutdown.
    pub fn flush_all(&self) -> usize {
        let past_every_window = Instant::now() + Duration::from_secs(60 * 60 * 24 * 365);
        self.flush_due(past_every_window)
    }
}

/// A single filesystem component for a replicant namespace or name. Slashes
/// get the operation-path escape; dot-only components are prefixed so they
/// cannot walk out of the store.
fn fs_component(raw: &str) -> String {
    let escaped = op_path::escape_key(raw);
    if escaped == "." || escaped == ".." {
        format!("~{}", escaped)
    } else {
        escaped
    }
}
