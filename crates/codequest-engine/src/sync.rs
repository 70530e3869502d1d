//! Durable profile synchronisation.
//!
//! Profile changes are appended to a JSON-lines [`ChangeLog`] before the
//! engine reports them as done. A background worker drains the log into a
//! [`ProfileStore`], retrying with exponential backoff. Entries that cannot
//! be written stay in the log and are retried on the next change or the next
//! start. Callers observe progress through [`SyncStatus`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::progression::{HistoryRecord, Profile, ProfilePatch, ProgressRecord};

// ============================================================================
// Changes and stores
// ============================================================================

/// One write to the profile collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ProfileChange {
    /// Update counters.
    Patch(ProfilePatch),
    /// Upsert a per-challenge progress record.
    Progress(ProgressRecord),
    /// Append an attempt history entry.
    History(HistoryRecord),
}

impl ProfileChange {
    /// Applies this change to an in-memory profile.
    ///
    /// Applying the same change twice leaves the profile as applying it once:
    /// patches set absolute values, progress is upserted and a history entry
    /// already present is not appended again.
    pub fn apply_to(&self, profile: &mut Profile) {
        match self {
            Self::Patch(patch) => profile.apply(patch),
            Self::Progress(record) => {
                profile
                    .progress
                    .insert(record.challenge_id.clone(), record.clone());
            }
            Self::History(record) => {
                if !profile.history.contains(record) {
                    profile.history.push(record.clone());
                }
            }
        }
    }
}

/// The profile collaborator.
pub trait ProfileStore: Send + Sync {
    /// Reads the current profile.
    fn load(&self) -> BoxFuture<'_, Result<Profile>>;

    /// Applies one change.
    fn apply<'a>(&'a self, change: &'a ProfileChange) -> BoxFuture<'a, Result<()>>;
}

/// A profile kept in a single JSON file.
#[derive(Debug)]
pub struct FileProfileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileProfileStore {
    /// Creates a store backed by `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<Profile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Profile::default()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ProfileStore for FileProfileStore {
    fn load(&self) -> BoxFuture<'_, Result<Profile>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.read().await
        })
    }

    fn apply<'a>(&'a self, change: &'a ProfileChange) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut profile = self.read().await?;
            change.apply_to(&mut profile);
            let json = serde_json::to_string_pretty(&profile)?;
            write_atomic(&self.path, json.as_bytes()).await
        })
    }
}

/// An in-memory profile with failure injection.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profile: Mutex<Profile>,
    failures: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryProfileStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `profile`.
    #[must_use]
    pub fn with_profile(profile: Profile) -> Self {
        Self {
            profile: Mutex::new(profile),
            ..Self::default()
        }
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// A copy of the stored profile.
    pub async fn snapshot(&self) -> Profile {
        self.profile.lock().await.clone()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn load(&self) -> BoxFuture<'_, Result<Profile>> {
        Box::pin(async move { Ok(self.profile.lock().await.clone()) })
    }

    fn apply<'a>(&'a self, change: &'a ProfileChange) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let injected = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(EngineError::persistence("injected store failure"));
            }
            change.apply_to(&mut *self.profile.lock().await);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

async fn write_synced(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// ============================================================================
// Change log
// ============================================================================

/// A logged, not yet synced change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Monotonic sequence number.
    pub seq: u64,
    /// When the change was recorded.
    pub recorded_at: DateTime<Utc>,
    /// The change.
    pub change: ProfileChange,
}

/// Pending profile changes, optionally backed by a JSON-lines file.
#[derive(Debug)]
pub struct ChangeLog {
    path: Option<PathBuf>,
    entries: VecDeque<LogEntry>,
    next_seq: u64,
}

impl ChangeLog {
    /// A log that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: VecDeque::new(),
            next_seq: 1,
        }
    }

    /// Opens the log at `path`, loading entries left by a previous run.
    ///
    /// Unreadable lines are skipped with a warning.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = VecDeque::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for (idx, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<LogEntry>(line) {
                        Ok(entry) => entries.push_back(entry),
                        Err(e) => warn!(
                            path = %path.display(),
                            line = idx + 1,
                            error = %e,
                            "Skipping unreadable change log entry"
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let next_seq = entries.back().map_or(1, |e: &LogEntry| e.seq + 1);
        if !entries.is_empty() {
            info!(pending = entries.len(), "Recovered unsynced profile changes");
        }
        Ok(Self {
            path: Some(path),
            entries,
            next_seq,
        })
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The oldest pending entry.
    #[must_use]
    pub fn front(&self) -> Option<&LogEntry> {
        self.entries.front()
    }

    /// Applies every pending change to `profile`, oldest first.
    ///
    /// Used at startup so the in-memory mirror includes changes the store
    /// has not seen yet.
    pub fn replay_onto(&self, profile: &mut Profile) {
        for entry in &self.entries {
            entry.change.apply_to(profile);
        }
    }

    /// Durably appends `change` and returns its sequence number.
    pub async fn append(&mut self, change: ProfileChange) -> Result<u64> {
        let seqs = self.append_all(vec![change]).await?;
        Ok(seqs.first().copied().unwrap_or_default())
    }

    /// Durably appends `changes` as one batch and returns their sequence
    /// numbers.
    ///
    /// The batch is written with a single write and sync. If that fails the
    /// file is truncated back to its previous length and none of the changes
    /// are logged.
    pub async fn append_all(&mut self, changes: Vec<ProfileChange>) -> Result<Vec<u64>> {
        let recorded_at = Utc::now();
        let batch: Vec<LogEntry> = changes
            .into_iter()
            .zip(self.next_seq..)
            .map(|(change, seq)| LogEntry {
                seq,
                recorded_at,
                change,
            })
            .collect();
        let Some(last) = batch.last().map(|e| e.seq) else {
            return Ok(Vec::new());
        };

        if let Some(path) = &self.path {
            let mut buffer = String::new();
            for entry in &batch {
                buffer.push_str(&serde_json::to_string(entry)?);
                buffer.push('\n');
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            let start = file.metadata().await?.len();
            if let Err(e) = write_synced(&mut file, buffer.as_bytes()).await {
                if let Err(truncate) = file.set_len(start).await {
                    warn!(path = %path.display(), error = %truncate, "Failed to roll back partial change log write");
                }
                return Err(e.into());
            }
        }

        let seqs = batch.iter().map(|e| e.seq).collect();
        self.next_seq = last + 1;
        self.entries.extend(batch);
        Ok(seqs)
    }

    /// Removes the entry `seq` once it has been synced.
    pub async fn acknowledge(&mut self, seq: u64) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|e| e.seq != seq);
        if self.entries.len() == before {
            return Ok(());
        }
        if let Some(path) = &self.path {
            let mut content = String::new();
            for entry in &self.entries {
                content.push_str(&serde_json::to_string(entry)?);
                content.push('\n');
            }
            write_atomic(path, content.as_bytes()).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Sync worker
// ============================================================================

/// Backoff between attempts to write one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
    /// Attempts per entry before the round gives up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Observable state of profile synchronisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing has been recorded yet.
    #[default]
    Idle,
    /// Changes are waiting to be written.
    Pending {
        /// Entries in the log.
        pending: usize,
    },
    /// Every recorded change has been written.
    Synced,
    /// The last round gave up; entries remain in the log.
    Failed {
        /// The last error.
        error: String,
        /// Entries in the log.
        pending: usize,
    },
}

impl SyncStatus {
    /// Returns `true` for [`SyncStatus::Failed`].
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

struct SyncShared {
    log: Mutex<ChangeLog>,
    wake: Notify,
    status: watch::Sender<SyncStatus>,
}

/// Handle to the background profile sync worker.
#[derive(Clone)]
pub struct ProfileSync {
    shared: Arc<SyncShared>,
}

impl std::fmt::Debug for ProfileSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileSync")
            .field("status", &*self.shared.status.borrow())
            .finish_non_exhaustive()
    }
}

impl ProfileSync {
    /// Spawns the worker. Entries already in `log` are synced right away.
    /// The worker stops when `cancel` fires.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn ProfileStore>,
        log: ChangeLog,
        retry: RetryPolicy,
        cancel: CancelToken,
    ) -> Self {
        let initial = if log.is_empty() {
            SyncStatus::Idle
        } else {
            SyncStatus::Pending { pending: log.len() }
        };
        let has_backlog = !log.is_empty();
        let (status, _) = watch::channel(initial);
        let shared = Arc::new(SyncShared {
            log: Mutex::new(log),
            wake: Notify::new(),
            status,
        });
        if has_backlog {
            shared.wake.notify_one();
        }
        tokio::spawn(sync_loop(Arc::clone(&shared), store, retry, cancel));
        Self { shared }
    }

    /// Durably logs `changes` as one batch and wakes the worker.
    ///
    /// Returns once the changes are in the log; writing them to the store
    /// happens in the background. On error none of the changes are logged.
    pub async fn record(&self, changes: Vec<ProfileChange>) -> Result<()> {
        {
            let mut log = self.shared.log.lock().await;
            log.append_all(changes).await?;
            self.shared
                .status
                .send_replace(SyncStatus::Pending { pending: log.len() });
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Asks the worker to retry pending entries.
    pub fn retry_now(&self) {
        self.shared.wake.notify_one();
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.shared.status.borrow().clone()
    }

    /// Subscribes to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    /// Number of entries not yet written.
    pub async fn pending(&self) -> usize {
        self.shared.log.lock().await.len()
    }

    /// Waits until the worker reports [`SyncStatus::Synced`] or
    /// [`SyncStatus::Failed`], returning that status.
    pub async fn settled(&self) -> SyncStatus {
        let mut rx = self.subscribe();
        loop {
            let status = rx.borrow_and_update().clone();
            if matches!(status, SyncStatus::Synced | SyncStatus::Failed { .. }) {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }
}

async fn sync_loop(
    shared: Arc<SyncShared>,
    store: Arc<dyn ProfileStore>,
    retry: RetryPolicy,
    cancel: CancelToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = shared.wake.notified() => {}
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = drain(&shared, store.as_ref(), retry) => {}
        }
    }
    debug!("profile sync worker stopped");
}

/// Writes pending entries oldest first until the log is empty or an entry
/// exhausts its retries.
///
/// Statuses are published with the log lock held.
#[instrument(skip_all)]
async fn drain(shared: &SyncShared, store: &dyn ProfileStore, retry: RetryPolicy) {
    loop {
        let entry = {
            let log = shared.log.lock().await;
            match log.front().cloned() {
                Some(entry) => entry,
                None => {
                    shared.status.send_replace(SyncStatus::Synced);
                    return;
                }
            }
        };

        if let Err(error) = write_with_retry(store, &entry, retry).await {
            let log = shared.log.lock().await;
            let pending = log.len();
            warn!(seq = entry.seq, pending, error = %error, "Profile sync gave up; changes kept in log");
            shared.status.send_replace(SyncStatus::Failed {
                error: error.to_string(),
                pending,
            });
            return;
        }

        let mut log = shared.log.lock().await;
        if let Err(e) = log.acknowledge(entry.seq).await {
            // The store has the change; a re-send after restart is a no-op.
            warn!(seq = entry.seq, error = %e, "Failed to trim change log");
        }
        shared
            .status
            .send_replace(SyncStatus::Pending { pending: log.len() });
    }
}

async fn write_with_retry(
    store: &dyn ProfileStore,
    entry: &LogEntry,
    retry: RetryPolicy,
) -> Result<()> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match store.apply(&entry.change).await {
            Ok(()) => {
                debug!(seq = entry.seq, attempt, "profile change synced");
                return Ok(());
            }
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = retry.backoff(attempt);
                warn!(
                    seq = entry.seq,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Profile write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
