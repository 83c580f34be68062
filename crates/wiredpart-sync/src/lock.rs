//! # Lock Coordinator
//!
//! Cross-device mutual exclusion over the shared folder with a single Lock
//! Token file.
//!
//! ## Acquisition
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        acquire()                                       │
//! │                                                                         │
//! │   ┌──────────────────────┐  created   ┌──────────────────────────────┐  │
//! │   │ create_exclusive     │──────────► │ re-read token, ours? → HELD  │  │
//! │   │ (wiredpart.lock)     │            └──────────────────────────────┘  │
//! │   └──────────┬───────────┘                                              │
//! │              │ exists                                                   │
//! │              ▼                                                          │
//! │   ┌──────────────────────┐  age > staleness  ┌───────────────────────┐ │
//! │   │ read holder token    │─────────────────► │ warn, delete, retry   │ │
//! │   └──────────┬───────────┘                   └───────────────────────┘ │
//! │              │ live holder                                              │
//! │              ▼                                                          │
//! │   ┌──────────────────────┐  elapsed ≥ timeout  ┌─────────────────────┐ │
//! │   │ sleep (exp. backoff) │───────────────────► │ LockBusy{holder,age}│ │
//! │   └──────────────────────┘                     └─────────────────────┘ │
//! │                                                                         │
//! │  release(): delete only if the token on disk still carries our         │
//! │  token_id. A token written by a peer after a takeover is left alone.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no heartbeat: a round that outlives the staleness threshold can
//! lose its lock. [`LockCoordinator::ensure_held`] is checked before every
//! write so such a round aborts instead of writing unprotected.

use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LockSettings;
use crate::error::{SyncError, SyncResult};
use crate::folder::SyncFolder;

/// Well-known path of the Lock Token inside the channel directory.
pub const LOCK_FILE: &str = "wiredpart.lock";

// =============================================================================
// Lock Token
// =============================================================================

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub holder_device_id: String,
    pub acquired_at: DateTime<Utc>,
    /// Distinguishes two acquisitions by the same device.
    pub token_id: String,
}

impl LockToken {
    pub fn new(holder_device_id: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        LockToken {
            holder_device_id: holder_device_id.into(),
            acquired_at,
            token_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> ChronoDuration {
        now.signed_duration_since(self.acquired_at)
    }

    /// A token older than the threshold belongs to a crashed or vanished
    /// holder.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: ChronoDuration) -> bool {
        self.age(now) > threshold
    }
}

/// Proof of holding the lock. Pass back to [`LockCoordinator::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    token: LockToken,
}

impl LockHandle {
    pub fn token(&self) -> &LockToken {
        &self.token
    }
}

/// What the lock file held when it was read.
#[derive(Debug)]
enum TokenRead {
    Missing,
    Valid(LockToken),
    /// Present but not a token (partial write by a foreign tool).
    Unreadable,
}

// =============================================================================
// Lock Coordinator
// =============================================================================

/// Acquires and releases the shared-folder lock for one device.
pub struct LockCoordinator {
    folder: Arc<dyn SyncFolder>,
    device_id: String,
    settings: LockSettings,
}

impl LockCoordinator {
    pub fn new(folder: Arc<dyn SyncFolder>, device_id: impl Into<String>, settings: LockSettings) -> Self {
        LockCoordinator {
            folder,
            device_id: device_id.into(),
            settings,
        }
    }

    /// Acquires the lock, breaking stale tokens and backing off from live
    /// ones until `lock.timeout_secs` has elapsed.
    ///
    /// ## Errors
    /// - [`SyncError::LockBusy`] if a live peer kept the lock past the timeout
    /// - [`SyncError::LockFolderUnreachable`] / [`SyncError::FolderTimeout`]
    ///   if the folder failed
    pub async fn acquire(&self) -> SyncResult<LockHandle> {
        let started = Instant::now();
        let timeout = self.settings.timeout();
        let staleness = self.settings.staleness();

        let mut backoff = ExponentialBackoff {
            initial_interval: self.settings.initial_backoff(),
            max_interval: self.settings.max_backoff(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_holder: Option<LockToken> = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let candidate = LockToken::new(&self.device_id, Utc::now());
            let bytes = serde_json::to_vec(&candidate)?;

            let mut retry_now = false;
            if self.folder.create_exclusive(LOCK_FILE, &bytes).await? {
                match self.read_token().await? {
                    TokenRead::Valid(token) if token.token_id == candidate.token_id => {
                        info!(
                            device_id = %self.device_id,
                            attempt,
                            "Acquired sync lock"
                        );
                        return Ok(LockHandle { token: candidate });
                    }
                    TokenRead::Valid(token) => {
                        debug!(holder = %token.holder_device_id, "Lost lock race after create");
                        last_holder = Some(token);
                    }
                    TokenRead::Missing | TokenRead::Unreadable => retry_now = true,
                }
            } else {
                let now = Utc::now();
                match self.read_token().await? {
                    TokenRead::Missing => {
                        // Released between our create and read.
                        retry_now = true;
                    }
                    TokenRead::Valid(token) if token.is_stale(now, staleness) => {
                        warn!(
                            holder = %token.holder_device_id,
                            acquired_at = %token.acquired_at,
                            age_secs = token.age(now).num_seconds(),
                            "Breaking stale sync lock"
                        );
                        self.break_lock(&token).await?;
                        retry_now = true;
                    }
                    TokenRead::Valid(token) => {
                        debug!(
                            holder = %token.holder_device_id,
                            age_secs = token.age(now).num_seconds(),
                            "Sync lock busy"
                        );
                        last_holder = Some(token);
                    }
                    TokenRead::Unreadable => {
                        if self.unreadable_token_is_stale(now, staleness).await? {
                            warn!("Removing unreadable stale sync lock");
                            self.folder.delete(LOCK_FILE).await?;
                            retry_now = true;
                        }
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                let now = Utc::now();
                let (holder, age_secs) = match &last_holder {
                    Some(token) => (token.holder_device_id.clone(), token.age(now).num_seconds()),
                    None => ("unknown".to_string(), 0),
                };
                info!(holder = %holder, age_secs, "Sync deferred: lock held by another device");
                return Err(SyncError::LockBusy { holder, age_secs });
            }

            if !retry_now {
                let wait = backoff
                    .next_backoff()
                    .unwrap_or_else(|| self.settings.max_backoff())
                    .min(timeout - elapsed);
                debug!(attempt, wait_ms = wait.as_millis() as u64, "Waiting for sync lock");
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Fails unless the lock file still carries `handle`'s token.
    pub async fn ensure_held(&self, handle: &LockHandle) -> SyncResult<()> {
        match self.read_token().await? {
            TokenRead::Valid(token) if token.token_id == handle.token.token_id => Ok(()),
            TokenRead::Valid(token) => {
                warn!(
                    holder = %token.holder_device_id,
                    "Sync lock was taken over during the round"
                );
                Err(SyncError::LockBusy {
                    age_secs: token.age(Utc::now()).num_seconds(),
                    holder: token.holder_device_id,
                })
            }
            TokenRead::Missing | TokenRead::Unreadable => {
                warn!("Sync lock vanished during the round");
                Err(SyncError::LockBusy {
                    holder: "unknown".into(),
                    age_secs: 0,
                })
            }
        }
    }

    /// Releases the lock if it is still ours.
    pub async fn release(&self, handle: LockHandle) -> SyncResult<()> {
        match self.read_token().await? {
            TokenRead::Valid(token) if token.token_id == handle.token.token_id => {
                self.folder.delete(LOCK_FILE).await?;
                debug!(device_id = %self.device_id, "Released sync lock");
            }
            TokenRead::Valid(token) => {
                warn!(
                    holder = %token.holder_device_id,
                    "Not releasing sync lock: held by a newer token"
                );
            }
            TokenRead::Missing | TokenRead::Unreadable => {
                debug!("Sync lock already gone at release");
            }
        }
        Ok(())
    }

    async fn read_token(&self) -> SyncResult<TokenRead> {
        let Some(bytes) = self.folder.read(LOCK_FILE).await? else {
            return Ok(TokenRead::Missing);
        };
        match serde_json::from_slice::<LockToken>(&bytes) {
            Ok(token) => Ok(TokenRead::Valid(token)),
            Err(e) => {
                debug!(error = %e, "Lock file is not a valid token");
                Ok(TokenRead::Unreadable)
            }
        }
    }

    /// Deletes `stale` unless it was replaced since it was read.
    async fn break_lock(&self, stale: &LockToken) -> SyncResult<()> {
        match self.read_token().await? {
            TokenRead::Valid(current) if current.token_id == stale.token_id => {
                self.folder.delete(LOCK_FILE).await?;
            }
            _ => debug!("Stale lock already replaced"),
        }
        Ok(())
    }

    /// Staleness of a token that cannot be parsed, judged by file age.
    async fn unreadable_token_is_stale(
        &self,
        now: DateTime<Utc>,
        staleness: ChronoDuration,
    ) -> SyncResult<bool> {
        let entries = self.folder.list("").await?;
        let modified = entries
            .iter()
            .find(|e| e.name == LOCK_FILE)
            .and_then(|e| e.modified);
        Ok(match modified {
            Some(modified) => now.signed_duration_since(modified) > staleness,
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::MemoryFolder;

    fn settings(timeout_secs: u64) -> LockSettings {
        LockSettings {
            timeout_secs,
            staleness_secs: 300,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        }
    }

    fn coordinator(folder: &MemoryFolder, device: &str, timeout_secs: u64) -> LockCoordinator {
        LockCoordinator::new(Arc::new(folder.clone()), device, settings(timeout_secs))
    }

    async fn plant_token(folder: &MemoryFolder, holder: &str, age: ChronoDuration) -> LockToken {
        let token = LockToken::new(holder, Utc::now() - age);
        folder
            .put_raw(LOCK_FILE, serde_json::to_vec(&token).unwrap())
            .await;
        token
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let folder = MemoryFolder::new();
        let lock = coordinator(&folder, "dev-a", 1);

        let handle = lock.acquire().await.unwrap();
        assert_eq!(handle.token().holder_device_id, "dev-a");
        lock.ensure_held(&handle).await.unwrap();

        lock.release(handle).await.unwrap();
        assert!(folder.read(LOCK_FILE).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_holder_gives_lock_busy() {
        let folder = MemoryFolder::new();
        plant_token(&folder, "dev-b", ChronoDuration::seconds(20)).await;

        let err = coordinator(&folder, "dev-a", 2).acquire().await.unwrap_err();
        match err {
            SyncError::LockBusy { holder, age_secs } => {
                assert_eq!(holder, "dev-b");
                assert!(age_secs >= 20);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The live token is untouched.
        assert!(folder.read(LOCK_FILE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let folder = MemoryFolder::new();
        // Ten minutes old, five-minute threshold.
        plant_token(&folder, "dev-crashed", ChronoDuration::minutes(10)).await;

        let lock = coordinator(&folder, "dev-a", 1);
        let handle = lock.acquire().await.unwrap();
        assert_eq!(handle.token().holder_device_id, "dev-a");
    }

    #[tokio::test]
    async fn test_release_leaves_newer_token() {
        let folder = MemoryFolder::new();
        let lock = coordinator(&folder, "dev-a", 1);
        let handle = lock.acquire().await.unwrap();

        // A peer took over after deciding our token was stale.
        let newer = plant_token(&folder, "dev-b", ChronoDuration::zero()).await;
        assert!(lock.ensure_held(&handle).await.unwrap_err().is_deferred());

        lock.release(handle).await.unwrap();
        let bytes = folder.read(LOCK_FILE).await.unwrap().unwrap();
        let on_disk: LockToken = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(on_disk, newer);
    }

    #[tokio::test]
    async fn test_unreadable_old_lock_is_removed() {
        let folder = MemoryFolder::new();
        folder.put_raw(LOCK_FILE, "{\"holder_dev").await;
        folder
            .set_modified(LOCK_FILE, Utc::now() - ChronoDuration::minutes(30))
            .await;

        let handle = coordinator(&folder, "dev-a", 1).acquire().await.unwrap();
        assert_eq!(handle.token().holder_device_id, "dev-a");
    }

    #[tokio::test]
    async fn test_offline_folder_is_unreachable() {
        let folder = MemoryFolder::new();
        folder.set_online(false);
        let err = coordinator(&folder, "dev-a", 1).acquire().await.unwrap_err();
        assert!(err.is_offline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_release() {
        let folder = MemoryFolder::new();
        let holder = coordinator(&folder, "dev-b", 1);
        let held = holder.acquire().await.unwrap();

        let waiter = coordinator(&folder, "dev-a", 30);
        let release = async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            holder.release(held).await.unwrap();
        };
        let (acquired, ()) = tokio::join!(waiter.acquire(), release);
        assert_eq!(acquired.unwrap().token().holder_device_id, "dev-a");
    }
}
