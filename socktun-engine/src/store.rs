//! Saved proxy profiles
//!
//! A list of previously used endpoints plus one selected entry with the
//! status it last reported. The session controller only ever reads the
//! selected entry.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::endpoint::ProxyEndpoint;
use crate::error::{Error, Result};
use crate::event::Status;

/// The selected profile and its last status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedProfile {
    pub endpoint: ProxyEndpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

/// Storage for saved profiles
pub trait ProfileStore: Send + Sync {
    /// Saved profiles, most recently added first
    fn profiles(&self) -> Result<Vec<ProxyEndpoint>>;

    /// Save a profile at the front of the list
    fn add(&self, endpoint: ProxyEndpoint) -> Result<()>;

    /// Remove every saved copy of `endpoint`; returns how many were removed
    fn remove(&self, endpoint: &ProxyEndpoint) -> Result<usize>;

    /// The selected profile, if any
    fn selected(&self) -> Result<Option<SelectedProfile>>;

    /// Replace the selected profile
    fn select(&self, selected: SelectedProfile) -> Result<()>;
}

/// Run a store operation on the blocking thread pool
///
/// File-backed stores do synchronous I/O; async callers go through here so
/// the runtime's worker threads never block on the disk.
pub async fn run_blocking<T, F>(store: &Arc<dyn ProfileStore>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ProfileStore) -> Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| Error::Store(format!("store task failed: {}", e)))?
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    profiles: Vec<ProxyEndpoint>,
    #[serde(default)]
    selected: Option<SelectedProfile>,
}

impl StoreData {
    fn add(&mut self, endpoint: ProxyEndpoint) {
        self.profiles.insert(0, endpoint);
    }

    fn remove(&mut self, endpoint: &ProxyEndpoint) -> usize {
        let before = self.profiles.len();
        self.profiles.retain(|p| p != endpoint);
        before - self.profiles.len()
    }
}

/// Profiles kept in memory
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    data: Mutex<StoreData>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut StoreData) -> T) -> Result<T> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::Store("profile store lock poisoned".into()))?;
        Ok(f(&mut data))
    }
}

impl ProfileStore for MemoryProfileStore {
    fn profiles(&self) -> Result<Vec<ProxyEndpoint>> {
        self.with(|data| data.profiles.clone())
    }

    fn add(&self, endpoint: ProxyEndpoint) -> Result<()> {
        self.with(|data| data.add(endpoint))
    }

    fn remove(&self, endpoint: &ProxyEndpoint) -> Result<usize> {
        self.with(|data| data.remove(endpoint))
    }

    fn selected(&self) -> Result<Option<SelectedProfile>> {
        self.with(|data| data.selected.clone())
    }

    fn select(&self, selected: SelectedProfile) -> Result<()> {
        self.with(|data| data.selected = Some(selected))
    }
}

/// Profiles kept in a JSON file
///
/// Every call reads the file, so several processes see each other's
/// changes. Writes go to a temporary file that is renamed over the
/// original.
#[derive(Debug)]
pub struct JsonProfileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonProfileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreData> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(StoreData::default()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::Store(format!("invalid profile store {:?}: {}", self.path, e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreData::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(data)
            .map_err(|e| Error::Store(format!("failed to serialize profiles: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&StoreData) -> T) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::Store("profile store lock poisoned".into()))?;
        Ok(f(&self.load()?))
    }

    fn update<T>(&self, f: impl FnOnce(&mut StoreData) -> T) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::Store("profile store lock poisoned".into()))?;
        let mut data = self.load()?;
        let result = f(&mut data);
        self.save(&data)?;
        Ok(result)
    }
}

impl ProfileStore for JsonProfileStore {
    fn profiles(&self) -> Result<Vec<ProxyEndpoint>> {
        self.read(|data| data.profiles.clone())
    }

    fn add(&self, endpoint: ProxyEndpoint) -> Result<()> {
        self.update(|data| data.add(endpoint))
    }

    fn remove(&self, endpoint: &ProxyEndpoint) -> Result<usize> {
        self.update(|data| data.remove(endpoint))
    }

    fn selected(&self) -> Result<Option<SelectedProfile>> {
        self.read(|data| data.selected.clone())
    }

    fn select(&self, selected: SelectedProfile) -> Result<()> {
        self.update(|data| data.selected = Some(selected))
    }
}
