//! Durable key-value storage with change notifications.
//!
//! Every handle has its own origin. Writes are broadcast to the other
//! handles sharing the same backing store, mirroring how a browser only
//! delivers `storage` events to the tabs that did not make the change.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::broadcast;

/// Key the session record lives under.
pub const SESSION_KEY: &str = "session";

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to persist storage file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A change made through another handle. `new_value` is `None` on removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    event: StorageEvent,
}

pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Read-modify-write of `key` as one step: no other write through any
    /// handle of this store lands between the read and the write. `apply`
    /// gets the current value and returns the new one, or `None` to leave
    /// the entry as it is. `apply` must not call back into the storage.
    /// Returns whether a value was written.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Option<String>,
    ) -> Result<bool>;

    /// Subscribes to changes made through other handles.
    fn subscribe(&self) -> StorageEvents;
}

/// Stream of foreign storage changes for one handle.
pub struct StorageEvents {
    origin: u64,
    rx: broadcast::Receiver<Envelope>,
}

impl StorageEvents {
    /// Waits for the next change made elsewhere. Returns `None` once every
    /// handle of the backing store is gone.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.origin == self.origin => continue,
                Ok(envelope) => return Some(envelope.event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("storage listener lagged, {} changes skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Origin allocation and fan-out shared by all handles of one store.
struct ChangeHub {
    next_origin: AtomicU64,
    tx: broadcast::Sender<Envelope>,
}

impl ChangeHub {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            next_origin: AtomicU64::new(1),
            tx,
        }
    }

    fn allocate_origin(&self) -> u64 {
        self.next_origin.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, origin: u64, key: &str, new_value: Option<String>) {
        // No receivers is not an error: nobody else is listening.
        let _ = self.tx.send(Envelope {
            origin,
            event: StorageEvent {
                key: key.to_string(),
                new_value,
            },
        });
    }

    fn subscribe(&self, origin: u64) -> StorageEvents {
        StorageEvents {
            origin,
            rx: self.tx.subscribe(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MemoryInner {
    entries: Mutex<HashMap<String, String>>,
    hub: ChangeHub,
}

/// In-process storage. `attach` opens another handle ("tab") on the same data.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
    origin: u64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let hub = ChangeHub::new();
        let origin = hub.allocate_origin();
        Self {
            inner: Arc::new(MemoryInner {
                entries: Mutex::new(HashMap::new()),
                hub,
            }),
            origin,
        }
    }

    pub fn attach(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            origin: self.inner.hub.allocate_origin(),
        }
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.inner.entries).get(key).cloned()
    }

    // Events are published while the entries are still locked, so they go
    // out in the order the writes happened.
    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = lock(&self.inner.entries);
        let previous = entries.insert(key.to_string(), value.to_string());
        if previous.as_deref() != Some(value) {
            self.inner
                .hub
                .publish(self.origin, key, Some(value.to_string()));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = lock(&self.inner.entries);
        if entries.remove(key).is_some() {
            self.inner.hub.publish(self.origin, key, None);
        }
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Option<String>,
    ) -> Result<bool> {
        let mut entries = lock(&self.inner.entries);
        let current = entries.get(key).cloned();
        let Some(value) = apply(current.clone()) else {
            return Ok(false);
        };
        if current.as_deref() != Some(value.as_str()) {
            self.inner.hub.publish(self.origin, key, Some(value.clone()));
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }

    fn subscribe(&self) -> StorageEvents {
        self.inner.hub.subscribe(self.origin)
    }
}

/// Storage backed by one JSON file per key inside a directory.
///
/// Writes go through a temporary file in the same directory and are renamed
/// into place, so a crash never leaves a half-written record behind.
///
/// Handles created through `attach` serialize their writes on a shared
/// lock. Separate `open` calls on the same directory do not.
#[derive(Clone)]
pub struct FileStorage {
    dir: PathBuf,
    shared: Arc<FileShared>,
    origin: u64,
}

struct FileShared {
    hub: ChangeHub,
    writes: Mutex<()>,
}

impl FileStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let hub = ChangeHub::new();
        let origin = hub.allocate_origin();
        Ok(Self {
            dir,
            shared: Arc::new(FileShared {
                hub,
                writes: Mutex::new(()),
            }),
            origin,
        })
    }

    pub fn attach(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            shared: Arc::clone(&self.shared),
            origin: self.shared.hub.allocate_origin(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Writes `value` and announces it if it changed. Caller holds `writes`.
    fn write_locked(&self, key: &str, previous: Option<&str>, value: &str) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(value.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(self.path_for(key))?;

        if previous != Some(value) {
            self.shared
                .hub
                .publish(self.origin, key, Some(value.to_string()));
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _writes = lock(&self.shared.writes);
        let previous = self.get(key);
        self.write_locked(key, previous.as_deref(), value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _writes = lock(&self.shared.writes);
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => {
                self.shared.hub.publish(self.origin, key, None);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Option<String>,
    ) -> Result<bool> {
        let _writes = lock(&self.shared.writes);
        let current = self.get(key);
        let Some(value) = apply(current.clone()) else {
            return Ok(false);
        };
        self.write_locked(key, current.as_deref(), &value)?;
        Ok(true)
    }

    fn subscribe(&self) -> StorageEvents {
        self.shared.hub.subscribe(self.origin)
    }
}
