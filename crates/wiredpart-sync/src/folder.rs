//! # Shared Folder Access
//!
//! The engine only ever talks to the shared folder through [`SyncFolder`]:
//! list, read, atomic create, atomic replace and delete. Paths are relative
//! to the channel directory and always use `/`.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  <folder_path>/<channel>/                                              │
//! │                                                                         │
//! │    wiredpart.lock                 Lock Token (one holder at a time)    │
//! │    changes/                                                            │
//! │      <device>.000000000001.json   immutable Change Sets                │
//! │      <device>.000000000002.json                                        │
//! │    acks/                                                               │
//! │      <device>.json                peer → highest sequence incorporated │
//! │                                                                         │
//! │  Temp files start with '.' and are never listed.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`FsFolder`] is the real implementation; [`MemoryFolder`] is a shared,
//! switchable in-process fake used to simulate several devices and outages.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ACKS_DIR, CHANGES_DIR};

/// One file in a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Minimal file operations the sync round needs from the shared folder.
///
/// Every error from an implementation is either
/// [`SyncError::LockFolderUnreachable`] or [`SyncError::FolderTimeout`], so a
/// failing folder always reads as "offline" to the caller.
#[async_trait]
pub trait SyncFolder: Send + Sync {
    /// Human-readable location for logs and errors.
    fn location(&self) -> PathBuf;

    /// Verifies the folder root is reachable and creates the channel
    /// directories if missing.
    async fn check_root(&self) -> SyncResult<()>;

    /// Lists regular, non-hidden files in `dir`, sorted by name. A missing
    /// directory lists as empty.
    async fn list(&self, dir: &str) -> SyncResult<Vec<FolderEntry>>;

    /// Reads a whole file. `None` if it does not exist.
    async fn read(&self, path: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Creates `path` with `bytes` only if it does not exist yet.
    ///
    /// Readers see either nothing or the complete contents. Returns false
    /// if the file already existed.
    async fn create_exclusive(&self, path: &str, bytes: &[u8]) -> SyncResult<bool>;

    /// Replaces `path` with `bytes` atomically.
    async fn write_atomic(&self, path: &str, bytes: &[u8]) -> SyncResult<()>;

    /// Deletes `path`. Returns false if it was already gone.
    async fn delete(&self, path: &str) -> SyncResult<bool>;
}

// =============================================================================
// Filesystem Folder
// =============================================================================

/// [`SyncFolder`] over a directory on disk (cloud drive, network share).
#[derive(Debug, Clone)]
pub struct FsFolder {
    /// The configured shared folder. Must exist.
    root: PathBuf,

    /// `root/<channel>`. Created on demand.
    channel_dir: PathBuf,

    /// Upper bound for any single operation.
    io_timeout: Duration,
}

impl FsFolder {
    pub fn new(root: impl Into<PathBuf>, channel: &str, io_timeout: Duration) -> Self {
        let root = root.into();
        let channel_dir = root.join(channel);
        FsFolder {
            root,
            channel_dir,
            io_timeout,
        }
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.channel_dir.clone(), |path, part| path.join(part))
    }

    fn unreachable(&self, path: &Path, err: std::io::Error) -> SyncError {
        SyncError::LockFolderUnreachable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    /// Runs one filesystem future under the I/O timeout.
    async fn io<T, F>(&self, path: &Path, fut: F) -> SyncResult<T>
    where
        F: Future<Output = std::io::Result<T>> + Send,
    {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.unreachable(path, e)),
            Err(_) => {
                warn!(path = %path.display(), "Sync folder operation timed out");
                Err(SyncError::FolderTimeout(self.io_timeout.as_secs()))
            }
        }
    }

    fn temp_path(target: &Path) -> PathBuf {
        let name = format!(".tmp-{}", Uuid::new_v4());
        match target.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

async fn create_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<bool> {
    let opened = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;
    let mut file = match opened {
        Ok(file) => file,
        Err(e) if e.kind() == IoErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(true)
}

#[async_trait]
impl SyncFolder for FsFolder {
    fn location(&self) -> PathBuf {
        self.channel_dir.clone()
    }

    async fn check_root(&self) -> SyncResult<()> {
        let root = self.root.clone();
        let metadata = self.io(&root, fs::metadata(&root)).await?;
        if !metadata.is_dir() {
            return Err(SyncError::LockFolderUnreachable {
                path: root,
                reason: "not a directory".into(),
            });
        }

        for dir in [CHANGES_DIR, ACKS_DIR] {
            let path = self.channel_dir.join(dir);
            self.io(&path, fs::create_dir_all(&path)).await?;
        }
        Ok(())
    }

    async fn list(&self, dir: &str) -> SyncResult<Vec<FolderEntry>> {
        let path = self.resolve(dir);
        let mut entries = self
            .io(&path, async {
                let mut reader = match fs::read_dir(&path).await {
                    Ok(reader) => reader,
                    Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
                    Err(e) => return Err(e),
                };

                let mut entries = Vec::new();
                while let Some(entry) = reader.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.') {
                        continue;
                    }
                    let metadata = match entry.metadata().await {
                        Ok(m) => m,
                        // Deleted between listing and stat.
                        Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                        Err(e) => return Err(e),
                    };
                    if !metadata.is_file() {
                        continue;
                    }
                    entries.push(FolderEntry {
                        name,
                        size: metadata.len(),
                        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                    });
                }
                Ok(entries)
            })
            .await?;

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        let full = self.resolve(path);
        self.io(&full, async {
            match fs::read(&full).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn create_exclusive(&self, path: &str, bytes: &[u8]) -> SyncResult<bool> {
        let target = self.resolve(path);
        let temp = Self::temp_path(&target);

        // Write the full contents aside, then hard-link into place: the link
        // fails if the target exists and readers never see a partial file.
        let created = self
            .io(&target, async {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                write_file(&temp, bytes).await?;
                let linked = fs::hard_link(&temp, &target).await;
                let _ = fs::remove_file(&temp).await;
                match linked {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == IoErrorKind::AlreadyExists => Ok(false),
                    Err(e) => {
                        debug!(error = %e, "Hard link unsupported, falling back to create_new");
                        create_new_file(&target, bytes).await
                    }
                }
            })
            .await?;

        Ok(created)
    }

    async fn write_atomic(&self, path: &str, bytes: &[u8]) -> SyncResult<()> {
        let target = self.resolve(path);
        let temp = Self::temp_path(&target);
        self.io(&target, async {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            write_file(&temp, bytes).await?;
            if let Err(e) = fs::rename(&temp, &target).await {
                let _ = fs::remove_file(&temp).await;
                return Err(e);
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, path: &str) -> SyncResult<bool> {
        let full = self.resolve(path);
        self.io(&full, async {
            match fs::remove_file(&full).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }
}

// =============================================================================
// In-Memory Folder
// =============================================================================

#[derive(Debug, Clone)]
struct MemoryFile {
    bytes: Vec<u8>,
    modified: DateTime<Utc>,
}

/// In-process shared folder.
///
/// Clones share the same files, so several simulated devices can be pointed
/// at one `MemoryFolder`. [`MemoryFolder::set_online`] simulates the drive
/// disappearing.
#[derive(Debug, Clone)]
pub struct MemoryFolder {
    files: Arc<Mutex<BTreeMap<String, MemoryFile>>>,
    online: Arc<AtomicBool>,
}

impl Default for MemoryFolder {
    fn default() -> Self {
        MemoryFolder {
            files: Arc::new(Mutex::new(BTreeMap::new())),
            online: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryFolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation succeed or fail as unreachable.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Overrides a file's modification time.
    pub async fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> bool {
        match self.files.lock().await.get_mut(path) {
            Some(file) => {
                file.modified = modified;
                true
            }
            None => false,
        }
    }

    /// Writes raw bytes, bypassing the create-if-absent rule.
    pub async fn put_raw(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.files.lock().await.insert(
            path.to_string(),
            MemoryFile {
                bytes: bytes.into(),
                modified: Utc::now(),
            },
        );
    }

    /// Every file path currently stored, sorted.
    pub async fn paths(&self) -> Vec<String> {
        self.files.lock().await.keys().cloned().collect()
    }

    fn ensure_online(&self) -> SyncResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::LockFolderUnreachable {
                path: self.location(),
                reason: "folder offline".into(),
            })
        }
    }
}

#[async_trait]
impl SyncFolder for MemoryFolder {
    fn location(&self) -> PathBuf {
        PathBuf::from("memory://")
    }

    async fn check_root(&self) -> SyncResult<()> {
        self.ensure_online()
    }

    async fn list(&self, dir: &str) -> SyncResult<Vec<FolderEntry>> {
        self.ensure_online()?;
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir.trim_end_matches('/'))
        };

        let files = self.files.lock().await;
        let entries = files
            .iter()
            .filter_map(|(path, file)| {
                let name = path.strip_prefix(&prefix)?;
                if name.contains('/') || name.starts_with('.') {
                    return None;
                }
                Some(FolderEntry {
                    name: name.to_string(),
                    size: file.bytes.len() as u64,
                    modified: Some(file.modified),
                })
            })
            .collect();
        Ok(entries)
    }

    async fn read(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        self.ensure_online()?;
        Ok(self.files.lock().await.get(path).map(|f| f.bytes.clone()))
    }

    async fn create_exclusive(&self, path: &str, bytes: &[u8]) -> SyncResult<bool> {
        self.ensure_online()?;
        let mut files = self.files.lock().await;
        if files.contains_key(path) {
            return Ok(false);
        }
        files.insert(
            path.to_string(),
            MemoryFile {
                bytes: bytes.to_vec(),
                modified: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn write_atomic(&self, path: &str, bytes: &[u8]) -> SyncResult<()> {
        self.ensure_online()?;
        self.put_raw(path, bytes.to_vec()).await;
        Ok(())
    }

    async fn delete(&self, path: &str) -> SyncResult<bool> {
        self.ensure_online()?;
        Ok(self.files.lock().await.remove(path).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_create_exclusive() {
        let folder = MemoryFolder::new();
        assert!(folder.create_exclusive("changes/a.json", b"one").await.unwrap());
        assert!(!folder.create_exclusive("changes/a.json", b"two").await.unwrap());
        assert_eq!(
            folder.read("changes/a.json").await.unwrap(),
            Some(b"one".to_vec())
        );
    }

    #[tokio::test]
    async fn test_memory_list_is_one_level_and_skips_hidden() {
        let folder = MemoryFolder::new();
        folder.put_raw("changes/b.json", "b").await;
        folder.put_raw("changes/a.json", "a").await;
        folder.put_raw("changes/.tmp-1", "x").await;
        folder.put_raw("acks/a.json", "{}").await;
        folder.put_raw("wiredpart.lock", "{}").await;

        let names: Vec<_> = folder
            .list(CHANGES_DIR)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);

        let root: Vec<_> = folder.list("").await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(root, vec!["wiredpart.lock"]);
    }

    #[tokio::test]
    async fn test_memory_offline_fails_everything() {
        let folder = MemoryFolder::new();
        folder.put_raw("changes/a.json", "a").await;
        folder.set_online(false);

        assert!(folder.check_root().await.unwrap_err().is_offline());
        assert!(folder.read("changes/a.json").await.unwrap_err().is_offline());
        assert!(folder.delete("changes/a.json").await.unwrap_err().is_offline());

        folder.set_online(true);
        assert!(folder.delete("changes/a.json").await.unwrap());
        assert!(!folder.delete("changes/a.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_folder_operations() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FsFolder::new(dir.path(), "default", Duration::from_secs(5));

        folder.check_root().await.unwrap();
        assert!(dir.path().join("default").join(CHANGES_DIR).is_dir());
        assert!(dir.path().join("default").join(ACKS_DIR).is_dir());

        assert!(folder.create_exclusive("changes/x.json", b"first").await.unwrap());
        assert!(!folder.create_exclusive("changes/x.json", b"second").await.unwrap());
        assert_eq!(
            folder.read("changes/x.json").await.unwrap(),
            Some(b"first".to_vec())
        );

        folder.write_atomic("acks/x.json", b"v1").await.unwrap();
        folder.write_atomic("acks/x.json", b"v2").await.unwrap();
        assert_eq!(folder.read("acks/x.json").await.unwrap(), Some(b"v2".to_vec()));

        let listed = folder.list(CHANGES_DIR).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "x.json");
        assert_eq!(listed[0].size, 5);
        assert!(listed[0].modified.is_some());

        assert!(folder.list("missing").await.unwrap().is_empty());
        assert_eq!(folder.read("changes/nope.json").await.unwrap(), None);
        assert!(folder.delete("changes/x.json").await.unwrap());
        assert!(!folder.delete("changes/x.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_folder_missing_root_is_offline() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FsFolder::new(dir.path().join("unplugged"), "default", Duration::from_secs(5));

        let err = folder.check_root().await.unwrap_err();
        assert!(err.is_offline());
        assert!(!dir.path().join("unplugged").exists());
    }
}
