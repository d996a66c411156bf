//! On-disk topology cache
//!
//! One directory per (system, partition) pair under the topology root, each
//! holding up to two artifacts:
//!
//! | File | Content |
//! |------|---------|
//! | `processor.json` | single object, property -> value |
//! | `devices.json` | array of device objects (`type`, `arch`, ...) |
//!
//! Reads never fail: a missing artifact is [`Lookup::Absent`], anything that
//! does not parse or validate is [`Lookup::Invalid`]. Writes go through a
//! temporary sibling file and a rename, so a torn write is never visible
//! under the artifact name.

use crate::error::{TopoError, TopoResult};
use crate::topology::info::{DeviceInfo, ProcessorInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};
use uuid::Uuid;

/// Processor artifact file name
pub const PROCESSOR_FILE: &str = "processor.json";

/// Devices artifact file name
pub const DEVICES_FILE: &str = "devices.json";

/// Topology root below the home directory
pub const DEFAULT_TOPOLOGY_SUBDIR: &str = ".topocache/topology";

/// Resolve the topology cache root
///
/// An explicit override always wins; otherwise the root lives under the
/// home directory.
pub fn resolve_root(home: Option<&Path>, override_dir: Option<&Path>) -> TopoResult<PathBuf> {
    match (override_dir, home) {
        (Some(dir), _) => Ok(dir.to_path_buf()),
        (None, Some(home)) => Ok(home.join(DEFAULT_TOPOLOGY_SUBDIR)),
        (None, None) => Err(TopoError::TopologyRootUnresolved),
    }
}

/// Identifies the cache entry of one partition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    system: String,
    partition: String,
}

impl CacheKey {
    pub fn new(system: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            partition: partition.into(),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Directory name of this entry: `<system>-<partition>`
    ///
    /// `-` and `%` inside either name are percent-escaped so that the
    /// separator is unambiguous and distinct pairs never share a directory.
    pub fn dir_name(&self) -> String {
        format!("{}-{}", escape(&self.system), escape(&self.partition))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.system, self.partition)
    }
}

fn escape(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '-' => escaped.push_str("%2D"),
            '/' => escaped.push_str("%2F"),
            '\\' => escaped.push_str("%5C"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// A malformed or schema-invalid artifact
#[derive(Debug, Clone, Error)]
#[error("corrupt topology artifact {path}: {reason}")]
pub struct CacheCorruptError {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of reading one artifact
#[derive(Debug)]
pub enum Lookup<T> {
    /// No artifact on disk
    Absent,
    /// Artifact exists but cannot be used
    Invalid(CacheCorruptError),
    /// Artifact loaded and validated
    Hit(T),
}

impl<T> Lookup<T> {
    /// The loaded value, if any
    pub fn hit(self) -> Option<T> {
        match self {
            Self::Hit(value) => Some(value),
            _ => None,
        }
    }
}

/// A complete cache entry as read from disk
#[derive(Debug, Clone, PartialEq)]
pub struct CachedTopology {
    pub processor: ProcessorInfo,
    pub devices: Vec<DeviceInfo>,
}

/// Per-key async locks serializing access to one cache entry
#[derive(Debug, Clone, Default)]
pub struct CacheLocks {
    inner: Arc<Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl CacheLocks {
    /// Acquire the lock of a single entry
    pub async fn acquire(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Reads and writes topology artifacts below a fixed root
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    locks: CacheLocks,
}

impl CacheStore {
    /// Create a store rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: CacheLocks::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one partition's entry
    pub fn path_for(&self, system: &str, partition: &str) -> PathBuf {
        self.entry_dir(&CacheKey::new(system, partition))
    }

    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.dir_name())
    }

    pub fn processor_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(PROCESSOR_FILE)
    }

    pub fn devices_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(DEVICES_FILE)
    }

    /// Load the processor artifact of an entry
    pub async fn load_processor(&self, key: &CacheKey) -> Lookup<ProcessorInfo> {
        load_artifact(&self.processor_path(key), ProcessorInfo::from_value).await
    }

    /// Load the devices artifact of an entry
    pub async fn load_devices(&self, key: &CacheKey) -> Lookup<Vec<DeviceInfo>> {
        load_artifact(&self.devices_path(key), |value| match value {
            Value::Array(items) => items.into_iter().map(DeviceInfo::from_value).collect(),
            _ => Err(TopoError::InvalidRecord {
                record: "DeviceInfo",
                reason: "devices artifact must be an array".to_string(),
            }),
        })
        .await
    }

    /// Write the processor artifact of an entry
    pub async fn save_processor(&self, key: &CacheKey, info: &ProcessorInfo) -> TopoResult<()> {
        let content = serde_json::to_string_pretty(info)?;
        write_atomic(&self.processor_path(key), content.as_bytes()).await?;
        debug!("Saved processor topology for {}", key);
        Ok(())
    }

    /// Write the devices artifact of an entry
    pub async fn save_devices(&self, key: &CacheKey, infos: &[DeviceInfo]) -> TopoResult<()> {
        let content = serde_json::to_string_pretty(infos)?;
        write_atomic(&self.devices_path(key), content.as_bytes()).await?;
        debug!("Saved {} device record(s) for {}", infos.len(), key);
        Ok(())
    }

    /// Read a complete entry under the key lock
    ///
    /// A valid processor artifact with no devices artifact is a hit with zero
    /// devices. An invalid artifact on either side invalidates the whole
    /// entry.
    pub async fn read_entry(&self, key: &CacheKey) -> Lookup<CachedTopology> {
        let _guard = self.locks.acquire(key).await;

        let processor = match self.load_processor(key).await {
            Lookup::Hit(processor) => processor,
            Lookup::Absent => return Lookup::Absent,
            Lookup::Invalid(e) => return Lookup::Invalid(e),
        };

        let devices = match self.load_devices(key).await {
            Lookup::Hit(devices) => devices,
            Lookup::Absent => Vec::new(),
            Lookup::Invalid(e) => return Lookup::Invalid(e),
        };

        Lookup::Hit(CachedTopology { processor, devices })
    }

    /// Read only the devices artifact under the key lock
    pub async fn read_devices(&self, key: &CacheKey) -> Lookup<Vec<DeviceInfo>> {
        let _guard = self.locks.acquire(key).await;
        self.load_devices(key).await
    }

    /// Write a complete entry under the key lock
    ///
    /// Returns the device list the entry holds afterwards. `devices` of
    /// `None` keeps an existing valid devices artifact; a missing or
    /// unreadable one is replaced by an empty list.
    pub async fn write_entry(
        &self,
        key: &CacheKey,
        processor: &ProcessorInfo,
        devices: Option<&[DeviceInfo]>,
    ) -> TopoResult<Vec<DeviceInfo>> {
        let _guard = self.locks.acquire(key).await;

        self.save_processor(key, processor).await?;
        match devices {
            Some(devices) => {
                self.save_devices(key, devices).await?;
                Ok(devices.to_vec())
            }
            None => match self.load_devices(key).await {
                Lookup::Hit(existing) => Ok(existing),
                Lookup::Absent | Lookup::Invalid(_) => {
                    self.save_devices(key, &[]).await?;
                    Ok(Vec::new())
                }
            },
        }
    }

    /// Remove one entry; returns whether anything was removed
    pub async fn clear(&self, key: &CacheKey) -> TopoResult<bool> {
        let _guard = self.locks.acquire(key).await;
        let dir = self.entry_dir(key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TopoError::io(format!("removing {}", dir.display()), e)),
        }
    }

    /// Remove every entry below the root; returns the number removed
    pub async fn clear_all(&self) -> TopoResult<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(TopoError::io("reading topology cache root", e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TopoError::io("reading topology cache entry", e))?
        {
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)
                    .await
                    .map_err(|e| TopoError::io(format!("removing {}", path.display()), e))?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

async fn load_artifact<T>(path: &Path, parse: impl FnOnce(Value) -> TopoResult<T>) -> Lookup<T> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Lookup::Absent,
        Err(e) => return corrupt(path, e.to_string()),
    };

    let value: Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => return corrupt(path, e.to_string()),
    };

    match parse(value) {
        Ok(parsed) => Lookup::Hit(parsed),
        Err(e) => corrupt(path, e.to_string()),
    }
}

fn corrupt<T>(path: &Path, reason: String) -> Lookup<T> {
    let err = CacheCorruptError {
        path: path.to_path_buf(),
        reason,
    };
    warn!("Ignoring {}", err);
    Lookup::Invalid(err)
}

async fn write_atomic(path: &Path, content: &[u8]) -> TopoResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| TopoError::Internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| TopoError::io(format!("creating {}", parent.display()), e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let written = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(TopoError::io(format!("writing {}", path.display()), e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_store() -> (CacheStore, TempDir) {
        let temp = TempDir::new().unwrap();
        (CacheStore::new(temp.path().to_path_buf()), temp)
    }

    fn key() -> CacheKey {
        CacheKey::new("generic", "default")
    }

    fn processor() -> ProcessorInfo {
        ProcessorInfo::from_value(json!({"arch": "skylake", "num_cpus": 36})).unwrap()
    }

    #[test]
    fn resolve_root_prefers_override() {
        let root = resolve_root(Some(Path::new("/home/u")), Some(Path::new("/scratch/topo")));
        assert_eq!(root.unwrap(), PathBuf::from("/scratch/topo"));

        let root = resolve_root(Some(Path::new("/home/u")), None).unwrap();
        assert_eq!(root, PathBuf::from("/home/u/.topocache/topology"));

        assert!(matches!(
            resolve_root(None, None),
            Err(TopoError::TopologyRootUnresolved)
        ));
    }

    #[test]
    fn path_for_plain_names() {
        let (store, temp) = test_store();
        assert_eq!(
            store.path_for("generic", "default"),
            temp.path().join("generic-default")
        );
    }

    #[test]
    fn dir_names_never_collide() {
        let a = CacheKey::new("a-b", "c").dir_name();
        let b = CacheKey::new("a", "b-c").dir_name();
        assert_ne!(a, b);

        let c = CacheKey::new("a%2D", "b").dir_name();
        let d = CacheKey::new("a-", "b").dir_name();
        assert_ne!(c, d);

        assert!(!CacheKey::new("../x", "y").dir_name().contains('/'));
    }

    #[tokio::test]
    async fn missing_artifacts_are_absent() {
        let (store, _temp) = test_store();
        assert!(matches!(store.load_processor(&key()).await, Lookup::Absent));
        assert!(matches!(store.load_devices(&key()).await, Lookup::Absent));
        assert!(matches!(store.read_entry(&key()).await, Lookup::Absent));
    }

    #[tokio::test]
    async fn processor_roundtrip() {
        let (store, _temp) = test_store();
        store.save_processor(&key(), &processor()).await.unwrap();

        let loaded = store.load_processor(&key()).await.hit().unwrap();
        assert_eq!(loaded, processor());
    }

    #[tokio::test]
    async fn devices_roundtrip_preserves_order() {
        let (store, _temp) = test_store();
        let devices = vec![DeviceInfo::gpu("a100", 4), DeviceInfo::gpu("v100", 2)];
        store.save_devices(&key(), &devices).await.unwrap();

        let loaded = store.load_devices(&key()).await.hit().unwrap();
        assert_eq!(loaded, devices);
    }

    #[tokio::test]
    async fn truncated_artifacts_are_invalid() {
        let (store, _temp) = test_store();
        let dir = store.entry_dir(&key());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(PROCESSOR_FILE), "{").unwrap();
        std::fs::write(dir.join(DEVICES_FILE), "{").unwrap();

        assert!(matches!(store.load_processor(&key()).await, Lookup::Invalid(_)));
        assert!(matches!(store.load_devices(&key()).await, Lookup::Invalid(_)));
        assert!(matches!(store.read_entry(&key()).await, Lookup::Invalid(_)));
    }

    #[tokio::test]
    async fn schema_invalid_devices_are_invalid() {
        let (store, _temp) = test_store();
        let dir = store.entry_dir(&key());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(DEVICES_FILE), r#"{"type": "gpu"}"#).unwrap();
        assert!(matches!(store.load_devices(&key()).await, Lookup::Invalid(_)));

        std::fs::write(dir.join(DEVICES_FILE), r#"[{"arch": "a100"}]"#).unwrap();
        assert!(matches!(store.load_devices(&key()).await, Lookup::Invalid(_)));
    }

    #[tokio::test]
    async fn entry_without_devices_is_hit() {
        let (store, _temp) = test_store();
        store.save_processor(&key(), &processor()).await.unwrap();

        let entry = store.read_entry(&key()).await.hit().unwrap();
        assert_eq!(entry.processor, processor());
        assert!(entry.devices.is_empty());
    }

    #[tokio::test]
    async fn valid_processor_with_corrupt_devices_invalidates_entry() {
        let (store, _temp) = test_store();
        store.save_processor(&key(), &processor()).await.unwrap();
        std::fs::write(store.devices_path(&key()), "[{").unwrap();

        assert!(matches!(store.read_entry(&key()).await, Lookup::Invalid(_)));
    }

    #[tokio::test]
    async fn write_entry_replaces_corrupt_devices() {
        let (store, _temp) = test_store();
        let dir = store.entry_dir(&key());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(DEVICES_FILE), "{").unwrap();

        let devices = store.write_entry(&key(), &processor(), None).await.unwrap();
        assert!(devices.is_empty());

        let entry = store.read_entry(&key()).await.hit().unwrap();
        assert!(entry.devices.is_empty());
    }

    #[tokio::test]
    async fn write_entry_keeps_existing_devices() {
        let (store, _temp) = test_store();
        let devices = vec![DeviceInfo::gpu("mi250x", 8)];
        store.save_devices(&key(), &devices).await.unwrap();

        let kept = store.write_entry(&key(), &processor(), None).await.unwrap();
        assert_eq!(kept, devices);

        let entry = store.read_entry(&key()).await.hit().unwrap();
        assert_eq!(entry.devices, devices);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let (store, _temp) = test_store();
        store.save_processor(&key(), &processor()).await.unwrap();
        store.save_processor(&key(), &processor()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(store.entry_dir(&key()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![PROCESSOR_FILE.to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_mix_artifacts() {
        let (store, _temp) = test_store();
        let mut tasks = Vec::new();

        for i in 1..=8u64 {
            let writer = store.clone();
            tasks.push(tokio::spawn(async move {
                let processor = ProcessorInfo::from_value(json!({"num_cpus": i})).unwrap();
                let devices = vec![DeviceInfo::gpu(format!("gen{i}"), i)];
                writer
                    .write_entry(&key(), &processor, Some(&devices))
                    .await
                    .unwrap();
            }));

            let reader = store.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..4 {
                    match reader.read_entry(&key()).await {
                        Lookup::Hit(entry) => {
                            assert_eq!(entry.devices.len(), 1);
                            assert_eq!(entry.processor.num_cpus(), Some(entry.devices[0].num_devices()));
                        }
                        Lookup::Absent => {}
                        Lookup::Invalid(e) => panic!("torn entry: {e}"),
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert!(store.read_entry(&key()).await.hit().is_some());
    }

    #[tokio::test]
    async fn entry_lock_is_per_key() {
        let (store, _temp) = test_store();
        let other = CacheKey::new("generic", "gpu");
        store.save_processor(&key(), &processor()).await.unwrap();
        store.save_processor(&other, &processor()).await.unwrap();

        let _held = store.locks.acquire(&key()).await;

        let unrelated = tokio::time::timeout(Duration::from_secs(5), store.read_entry(&other)).await;
        assert!(unrelated.expect("other key must not wait").hit().is_some());

        let blocked = tokio::time::timeout(Duration::from_millis(50), store.read_entry(&key())).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn clear_removes_entries() {
        let (store, _temp) = test_store();
        store.save_processor(&key(), &processor()).await.unwrap();
        let other = CacheKey::new("generic", "gpu");
        store.save_processor(&other, &processor()).await.unwrap();

        assert!(store.clear(&key()).await.unwrap());
        assert!(!store.clear(&key()).await.unwrap());
        assert_eq!(store.clear_all().await.unwrap(), 1);
        assert!(matches!(store.read_entry(&other).await, Lookup::Absent));
    }
}
