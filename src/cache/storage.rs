//! Persistence collaborator interface
//!
//! The tiered manager writes serialized entries through [`PersistentStorage`].
//! Two independent instances back the session-scoped and long-lived tiers.
//! [`InMemoryStorage`] lives as long as the process; [`FileStorage`] keeps
//! one file per key under a directory so the long-lived tier survives restarts.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Best-effort storage quota report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageQuota {
    /// Total bytes allowed
    pub quota: usize,
    /// Bytes in use
    pub usage: usize,
    /// Bytes still free
    pub available: usize,
}

impl StorageQuota {
    /// Usage over quota
    pub fn utilization(&self) -> f64 {
        if self.quota == 0 {
            0.0
        } else {
            self.usage as f64 / self.quota as f64
        }
    }
}

/// Key-value persistence consumed by the tiered manager
#[async_trait]
pub trait PersistentStorage: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    async fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_item(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn remove_item(&self, key: &str) -> Result<()>;

    /// All stored keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Quota report, `None` when the backend cannot tell
    async fn quota(&self) -> Result<Option<StorageQuota>> {
        Ok(None)
    }
}

/// Map-backed storage with an optional byte quota
///
/// Used as the default persistent tier in tests and the demo binary.
pub struct InMemoryStorage {
    name: String,
    items: RwLock<HashMap<String, Vec<u8>>>,
    quota: Option<usize>,
    failing: AtomicBool,
}

impl InMemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: RwLock::new(HashMap::new()),
            quota: None,
            failing: AtomicBool::new(false),
        }
    }

    /// Limit total stored bytes (keys + values)
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// Make every operation fail with a storage error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored items
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    /// Check if storage is empty
    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Storage(format!("{} is unavailable", self.name)))
        } else {
            Ok(())
        }
    }

    fn used_bytes(items: &HashMap<String, Vec<u8>>) -> usize {
        items.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

#[async_trait]
impl PersistentStorage for InMemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_available()?;
        let mut items = self.items.write().await;

        if let Some(quota) = self.quota {
            let existing = items.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let used = Self::used_bytes(&items) - existing;
            let needed = key.len() + value.len();
            if used + needed > quota {
                return Err(CacheError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }

        items.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.items.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.items.read().await.keys().cloned().collect())
    }

    async fn quota(&self) -> Result<Option<StorageQuota>> {
        let Some(quota) = self.quota else {
            return Ok(None);
        };
        let usage = Self::used_bytes(&*self.items.read().await);
        Ok(Some(StorageQuota {
            quota,
            usage,
            available: quota.saturating_sub(usage),
        }))
    }
}

const FILE_EXTENSION: &str = "entry";
const DIGEST_EXTENSION: &str = "digest";
/// Longest file name most filesystems accept
const MAX_FILE_NAME: usize = 255;

/// Directory-backed storage, one file per key
///
/// A file is named by its hex-encoded key, or by the key's SHA-256 when that
/// name would be too long. Every file starts with its key (u32 length, big
/// endian, then the bytes) so a digest-named file can still be listed.
pub struct FileStorage {
    name: String,
    base_dir: PathBuf,
}

impl FileStorage {
    /// Open storage rooted at `base_dir`, creating the directory if needed
    pub async fn open(name: impl Into<String>, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        let name = name.into();
        debug!("Opened file storage '{}' at {}", name, base_dir.display());
        Ok(Self { name, base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let encoded = hex::encode(key.as_bytes());
        let file_name = if encoded.len() + FILE_EXTENSION.len() + 1 <= MAX_FILE_NAME {
            format!("{}.{}", encoded, FILE_EXTENSION)
        } else {
            format!("{}.{}", hex::encode(Sha256::digest(key.as_bytes())), DIGEST_EXTENSION)
        };
        self.base_dir.join(file_name)
    }

    async fn read_record(&self, path: &Path) -> Result<Option<(String, Vec<u8>)>> {
        match fs::read(path).await {
            Ok(bytes) => split_record(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn build_record(key: &str, value: &[u8]) -> Result<Vec<u8>> {
    let key_len = u32::try_from(key.len())
        .map_err(|_| CacheError::InvalidKey(format!("key of {} bytes is too long", key.len())))?;
    let mut record = Vec::with_capacity(4 + key.len() + value.len());
    record.extend_from_slice(&key_len.to_be_bytes());
    record.extend_from_slice(key.as_bytes());
    record.extend_from_slice(value);
    Ok(record)
}

fn split_record(record: &[u8]) -> Result<(String, Vec<u8>)> {
    let corrupt = || CacheError::Storage("truncated file storage record".to_string());
    let (len, rest) = record.split_first_chunk::<4>().ok_or_else(corrupt)?;
    let len = u32::from_be_bytes(*len) as usize;
    if rest.len() < len {
        return Err(corrupt());
    }
    let (key, value) = rest.split_at(len);
    let key = String::from_utf8(key.to_vec())
        .map_err(|e| CacheError::Storage(format!("record key is not UTF-8: {}", e)))?;
    Ok((key, value.to_vec()))
}

#[async_trait]
impl PersistentStorage for FileStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.read_record(&self.path_for(key)).await? {
            Some((stored, value)) if stored == key => Ok(Some(value)),
            Some((stored, _)) => {
                warn!("File for {} in {} holds {}, ignoring it", key, self.name, stored);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_item(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let record = build_record(key, &value)?;
        fs::write(self.path_for(key), record).await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.base_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(FILE_EXTENSION) => {
                    let decoded = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| hex::decode(s).ok())
                        .and_then(|bytes| String::from_utf8(bytes).ok());
                    if let Some(key) = decoded {
                        keys.push(key);
                    }
                }
                Some(DIGEST_EXTENSION) => match self.read_record(&path).await {
                    Ok(Some((key, _))) => keys.push(key),
                    Ok(None) => {}
                    Err(e) => warn!("Skipping unreadable {}: {}", path.display(), e),
                },
                _ => {}
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_roundtrip_and_remove() {
        let storage = InMemoryStorage::new("session");
        storage.set_item("k", b"v".to_vec()).await.unwrap();

        assert_eq!(storage.get_item("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(storage.keys().await.unwrap(), vec!["k".to_string()]);

        storage.remove_item("k").await.unwrap();
        storage.remove_item("k").await.unwrap();
        assert!(storage.get_item("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let storage = InMemoryStorage::new("local").with_quota(10);
        storage.set_item("a", vec![0; 5]).await.unwrap();

        let err = storage.set_item("b", vec![0; 5]).await.unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { needed: 6, available: 4 }));

        // overwriting reuses the old item's space
        storage.set_item("a", vec![0; 9]).await.unwrap();

        let quota = storage.quota().await.unwrap().unwrap();
        assert_eq!(quota.usage, 10);
        assert_eq!(quota.available, 0);
        assert_eq!(quota.utilization(), 1.0);
    }

    #[tokio::test]
    async fn test_failing_storage() {
        let storage = InMemoryStorage::new("broken");
        storage.set_failing(true);
        assert!(matches!(
            storage.get_item("k").await,
            Err(CacheError::Storage(_))
        ));
        assert!(storage.quota().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::open("local", tmp.path().join("local")).await.unwrap();
        storage.set_item("kb-cache:user:prefs", b"dark".to_vec()).await.unwrap();
        storage.set_item("kb-cache:search:é", b"x".to_vec()).await.unwrap();
        drop(storage);

        let reopened = FileStorage::open("local", tmp.path().join("local")).await.unwrap();
        assert_eq!(
            reopened.get_item("kb-cache:user:prefs").await.unwrap(),
            Some(b"dark".to_vec())
        );
        let mut keys = reopened.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["kb-cache:search:é", "kb-cache:user:prefs"]);

        reopened.remove_item("kb-cache:user:prefs").await.unwrap();
        reopened.remove_item("kb-cache:user:prefs").await.unwrap();
        assert!(reopened.get_item("kb-cache:user:prefs").await.unwrap().is_none());
        assert!(reopened.quota().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage_long_keys_use_digest_names() {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::open("local", tmp.path()).await.unwrap();
        let long_key = format!("kb-cache:search:{}", "q".repeat(300));

        storage.set_item(&long_key, b"results".to_vec()).await.unwrap();
        assert_eq!(storage.get_item(&long_key).await.unwrap(), Some(b"results".to_vec()));
        assert_eq!(storage.keys().await.unwrap(), vec![long_key.clone()]);

        let mut names = std::fs::read_dir(tmp.path()).unwrap();
        let name = names.next().unwrap().unwrap().file_name();
        assert!(name.len() <= MAX_FILE_NAME);
        assert!(name.to_string_lossy().ends_with(".digest"));

        storage.remove_item(&long_key).await.unwrap();
        assert!(storage.get_item(&long_key).await.unwrap().is_none());
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[test]
    fn test_record_layout() {
        let record = build_record("a:b", b"xyz").unwrap();
        assert_eq!(&record[..4], &[0, 0, 0, 3]);
        assert_eq!(split_record(&record).unwrap(), ("a:b".to_string(), b"xyz".to_vec()));
        assert!(split_record(&[0, 0, 0, 9, b'a']).is_err());
        assert!(split_record(&[0, 0]).is_err());
    }
}
