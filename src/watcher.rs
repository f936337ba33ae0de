//! Watchers: one per configured watch. Each pass walks the covered files,
//! reconciles their fingerprints against the persisted baseline, and emits
//! created/modified/deleted events to the shared notifiers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono_tz::Tz;
use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::hasher;
use crate::notifier::{Event, Notifier, NotifyError};
use crate::probe;
use crate::store::{self, F32Le, PrefixedStore, StoreError, Utf8};

/// Reserved baseline key marking that the initial pass completed.
pub const INITIALIZED_KEY: &str = "initialized";

/// Depth of the scanner-to-verifier checksum channel.
const CHECKSUM_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("notifier failure: {0}")]
    Notify(#[from] NotifyError),

    #[error("invalid glob {pattern:?}: {source}")]
    Glob {
        pattern: String,
        source: globset::Error,
    },
}

/// What one pass observed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub scanned: u64,
    pub created: u64,
    pub modified: u64,
    pub deleted: u64,
}

impl PassReport {
    pub fn events(&self) -> u64 {
        self.created + self.modified + self.deleted
    }
}

/// Item on the checksum channel: a hashed file, or the end-of-scan marker.
enum ScanItem {
    File { path: String, digest: String },
    Done,
}

#[derive(Default)]
struct VerifyCounts {
    scanned: u64,
    created: u64,
    modified: u64,
}

struct DirectoryScan {
    path: PathBuf,
    matcher: GlobMatcher,
}

impl DirectoryScan {
    /// Recursively enumerate files under the directory whose dir-relative
    /// path matches the glob. Hidden files are included; directory symlinks
    /// are not followed.
    async fn enumerate(&self) -> Vec<PathBuf> {
        let root = self.path.clone();
        let matcher = self.matcher.clone();
        task::spawn_blocking(move || {
            let walker = WalkBuilder::new(&root)
                .standard_filters(false)
                .follow_links(false)
                .build();

            let mut found = Vec::new();
            for entry in walker.filter_map(Result::ok) {
                if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&root)
                    && matcher.is_match(rel)
                {
                    found.push(entry.path().to_path_buf());
                }
            }
            found
        })
        .await
        .unwrap_or_default()
    }
}

pub struct Watcher {
    name: String,
    store: PrefixedStore,
    notifiers: Vec<Arc<Notifier>>,
    files: Vec<PathBuf>,
    directories: Vec<DirectoryScan>,
    tz: Tz,
    initialized: bool,
}

impl Watcher {
    pub fn new(
        config: &WatchConfig,
        store: PrefixedStore,
        notifiers: Vec<Arc<Notifier>>,
        tz: Tz,
    ) -> Result<Self, WatchError> {
        let mut directories = Vec::with_capacity(config.directories.len());
        for dir in &config.directories {
            let matcher = Glob::new(&dir.glob)
                .map_err(|source| WatchError::Glob { pattern: dir.glob.clone(), source })?
                .compile_matcher();
            directories.push(DirectoryScan { path: dir.path.clone(), matcher });
        }

        Ok(Watcher {
            name: config.name.clone(),
            store,
            notifiers,
            files: config.files.clone(),
            directories,
            tz,
            initialized: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one pass: register with the notifiers, reconcile the filesystem
    /// against the baseline, then signal `Done` to every notifier. `Done`
    /// is sent on the failure path too, so shared notifiers can drain.
    pub async fn run(&mut self) -> Result<PassReport, WatchError> {
        for notifier in &self.notifiers {
            notifier.add_watcher();
        }

        let result = self.pass().await;

        let mut done_result = Ok(());
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(Event::Done).await {
                done_result = Err(e);
            }
        }

        let report = result?;
        done_result?;
        info!(
            watch = %self.name,
            scanned = report.scanned,
            created = report.created,
            modified = report.modified,
            deleted = report.deleted,
            "pass complete"
        );
        Ok(report)
    }

    async fn pass(&mut self) -> Result<PassReport, WatchError> {
        // The sentinel on disk wins over the constructed value, so a restart
        // after a completed first pass does not re-initialize.
        if self.store.get::<F32Le>(INITIALIZED_KEY).await?.is_some() {
            self.initialized = true;
        }
        let initialized = self.initialized;

        let (checksum_tx, checksum_rx) = mpsc::channel(CHECKSUM_QUEUE_DEPTH);
        let (delete_tx, mut delete_rx) = mpsc::unbounded_channel();

        let (deleted, (), counts) = tokio::try_join!(
            self.scan_deletions(initialized, delete_tx),
            self.scan_filesystem(checksum_tx),
            self.verify(initialized, checksum_rx),
        )?;

        // Deferred deletions: issued only now, so they never interleave with
        // the snapshot scan.
        while let Some(key) = delete_rx.recv().await {
            self.store.delete(&key).await?;
        }

        if !initialized {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f32())
                .unwrap_or(0.0);
            self.store.put::<F32Le>(INITIALIZED_KEY, &now).await?;
            self.initialized = true;
            info!(watch = %self.name, files = counts.scanned, "baseline initialized");
        }

        Ok(PassReport {
            scanned: counts.scanned,
            created: counts.created,
            modified: counts.modified,
            deleted,
        })
    }

    /// Walk the baseline snapshot and emit `Deleted` for every stored path
    /// that no longer exists. Skipped entirely on the initialization pass.
    async fn scan_deletions(
        &self,
        initialized: bool,
        pending: mpsc::UnboundedSender<String>,
    ) -> Result<u64, WatchError> {
        if !initialized {
            return Ok(0);
        }

        let sentinel = store::exact_key_pattern(self.store.prefix(), INITIALIZED_KEY)
            .map_err(StoreError::from)?;
        let mut rows = self.store.scan(vec![sentinel]).await?;

        let mut deleted = 0;
        while let Some((path, _fingerprint)) = rows.recv().await {
            let present = match probe::probe(Path::new(&path)).await {
                Ok(p) => p.resolved.is_some(),
                Err(e) => {
                    warn!(watch = %self.name, path = %path, error = %e, "probe failed, keeping baseline row");
                    continue;
                }
            };
            if !present {
                self.notify_all(Event::Deleted { path: path.clone() }).await?;
                deleted += 1;
                if pending.send(path).is_err() {
                    break;
                }
            }
        }
        Ok(deleted)
    }

    /// Hash every covered file and feed the verifier, ending with the
    /// `Done` marker.
    async fn scan_filesystem(&self, tx: mpsc::Sender<ScanItem>) -> Result<(), WatchError> {
        for path in &self.files {
            if !self.hash_and_push(path, &tx).await {
                return Ok(());
            }
        }

        for dir in &self.directories {
            for path in dir.enumerate().await {
                if !self.hash_and_push(&path, &tx).await {
                    return Ok(());
                }
            }
        }

        let _ = tx.send(ScanItem::Done).await;
        Ok(())
    }

    /// Probe and hash one path, pushing the result to the verifier.
    /// Unreadable or vanished files are skipped for this pass. Returns
    /// false once the verifier is gone.
    async fn hash_and_push(&self, path: &Path, tx: &mpsc::Sender<ScanItem>) -> bool {
        let resolved = match probe::probe(path).await {
            Ok(probe::Probe { resolved: Some(resolved), is_dir: false }) => resolved,
            Ok(probe::Probe { resolved: None, .. }) => {
                debug!(watch = %self.name, path = %path.display(), "path missing, skipped");
                return true;
            }
            Ok(probe::Probe { is_dir: true, .. }) => {
                debug!(watch = %self.name, path = %path.display(), "directory, skipped");
                return true;
            }
            Err(e) => {
                warn!(watch = %self.name, path = %path.display(), error = %e, "probe failed, skipped");
                return true;
            }
        };

        let Some(path_utf8) = resolved.to_str().map(str::to_string) else {
            warn!(watch = %self.name, path = %resolved.display(), "non-utf8 path, skipped");
            return true;
        };

        let digest = match hasher::hash_file(&resolved).await {
            Ok(digest) => digest,
            Err(e) => {
                warn!(watch = %self.name, path = %path_utf8, error = %e, "hash failed, skipped");
                return true;
            }
        };

        tx.send(ScanItem::File { path: path_utf8, digest }).await.is_ok()
    }

    /// Consume hashed files until the `Done` marker, comparing each against
    /// the baseline. On the initialization pass fingerprints are stored
    /// silently; afterwards a missing row is a creation and a differing row
    /// a modification, and the row is rewritten immediately after the event.
    async fn verify(
        &self,
        initialized: bool,
        mut rx: mpsc::Receiver<ScanItem>,
    ) -> Result<VerifyCounts, WatchError> {
        let mut counts = VerifyCounts::default();

        while let Some(item) = rx.recv().await {
            let ScanItem::File { path, digest } = item else {
                break;
            };
            counts.scanned += 1;

            if !initialized {
                self.store.put::<Utf8>(&path, &digest).await?;
                continue;
            }

            match self.store.get::<Utf8>(&path).await? {
                None => {
                    let Some(mtime) = self.mtime(&path).await else {
                        continue;
                    };
                    self.notify_all(Event::Created { path: path.clone(), mtime }).await?;
                    self.store.put::<Utf8>(&path, &digest).await?;
                    counts.created += 1;
                }
                Some(existing) if existing != digest => {
                    let Some(mtime) = self.mtime(&path).await else {
                        continue;
                    };
                    self.notify_all(Event::Modified { path: path.clone(), mtime }).await?;
                    self.store.put::<Utf8>(&path, &digest).await?;
                    counts.modified += 1;
                }
                Some(_) => {}
            }
        }

        Ok(counts)
    }

    async fn notify_all(&self, event: Event) -> Result<(), NotifyError> {
        for notifier in &self.notifiers {
            notifier.notify(event.clone()).await?;
        }
        Ok(())
    }

    /// Display timestamp for a path, or `None` when the file vanished
    /// between hashing and stat (the path is skipped for this pass).
    async fn mtime(&self, path: &str) -> Option<String> {
        match probe::mtime_display(Path::new(path), self.tz).await {
            Ok(mtime) => Some(mtime),
            Err(e) => {
                warn!(watch = %self.name, path = %path, error = %e, "stat failed, skipped");
                None
            }
        }
    }
}
