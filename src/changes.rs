//! Storage change detection.
//!
//! A snapshot summarizes the whole storage tree (counts, total size, newest
//! mtime and a content fingerprint). `refresh()` recomputes it, compares it
//! with the previous one and, when anything differs, publishes the new
//! snapshot plus a diff to the live fan-out. Refreshes are triggered by a
//! debounced filesystem watcher, by a periodic timer, and directly after every
//! mutation this service performs itself.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::live::Broadcaster;
use crate::utils::sha256_hex;

/// prefix of in-flight assembly outputs, never counted as content
pub const PART_FILE_PREFIX: &str = ".~";
pub const PART_FILE_SUFFIX: &str = ".part";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageSnapshot {
    pub file_count: u64,
    pub dir_count: u64,
    pub total_size: u64,
    /// newest file mtime, unix seconds
    pub last_modified: f64,
    pub content_fingerprint: String,
    /// when the snapshot was taken, unix seconds
    pub timestamp: f64,
}

impl StorageSnapshot {
    /// snapshot of an empty tree
    pub fn empty() -> Self {
        Self {
            file_count: 0,
            dir_count: 0,
            total_size: 0,
            last_modified: 0.0,
            content_fingerprint: sha256_hex(b""),
            timestamp: unix_now(),
        }
    }

    /// true when anything but the capture time differs
    pub fn differs_from(&self, other: &StorageSnapshot) -> bool {
        self.file_count != other.file_count
            || self.dir_count != other.dir_count
            || self.total_size != other.total_size
            || self.content_fingerprint != other.content_fingerprint
            || self.last_modified != other.last_modified
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub files_changed: i64,
    pub dirs_changed: i64,
    pub size_changed: i64,
    /// fingerprint moved while counts and size stayed put (an in-place edit)
    pub content_changed: bool,
    pub mtime_changed: bool,
}

impl ChangeEvent {
    /// diff between two snapshots, `None` when they describe the same tree
    pub fn between(old: &StorageSnapshot, new: &StorageSnapshot) -> Option<Self> {
        if !new.differs_from(old) {
            return None;
        }
        let files_changed = new.file_count as i64 - old.file_count as i64;
        let dirs_changed = new.dir_count as i64 - old.dir_count as i64;
        let size_changed = new.total_size as i64 - old.total_size as i64;
        Some(Self {
            files_changed,
            dirs_changed,
            size_changed,
            content_changed: new.content_fingerprint != old.content_fingerprint
                && files_changed == 0
                && dirs_changed == 0
                && size_changed == 0,
            mtime_changed: new.last_modified != old.last_modified,
        })
    }
}

/// walk `root` and summarize it. paths under any of `excluded` and in-flight
/// assembly outputs are skipped. unreadable entries are skipped with a warning
pub fn compute_snapshot(root: &Path, excluded: &[PathBuf]) -> std::io::Result<StorageSnapshot> {
    let mut snapshot = StorageSnapshot::empty();
    let mut lines: Vec<String> = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    // the root itself must be readable, everything below is best effort
    std::fs::read_dir(root)?;

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Skipping unreadable directory {:?}: {}", dir, e);
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if excluded.iter().any(|ex| path.starts_with(ex)) {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::trace!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };
            let rel = path
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| name.to_string());

            if meta.is_dir() {
                snapshot.dir_count += 1;
                lines.push(format!("{}/", rel));
                stack.push(path);
            } else if meta.is_file() {
                if name.starts_with(PART_FILE_PREFIX) && name.ends_with(PART_FILE_SUFFIX) {
                    continue;
                }
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .unwrap_or_default();
                snapshot.file_count += 1;
                snapshot.total_size += meta.len();
                snapshot.last_modified = snapshot.last_modified.max(mtime.as_secs_f64());
                lines.push(format!("{}:{}:{}", rel, meta.len(), mtime.as_secs()));
            }
        }
    }

    lines.sort_unstable();
    snapshot.content_fingerprint = sha256_hex(lines.join("\n").as_bytes());
    snapshot.timestamp = unix_now();
    Ok(snapshot)
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// how the monitor learns about changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    /// filesystem watcher plus the periodic timer
    Watching,
    /// timer only, the watcher could not be started
    Polling,
    /// no monitor task running
    Idle,
}

pub struct ChangeDetector {
    root: PathBuf,
    excluded: Vec<PathBuf>,
    current: watch::Sender<Arc<StorageSnapshot>>,
    refresh_lock: Mutex<()>,
    broadcaster: Arc<Broadcaster>,
    total_checks: AtomicU64,
    changes_seen: AtomicU64,
    // f64 bits of the last refresh time
    last_checked: AtomicU64,
    watching: AtomicBool,
    monitoring: AtomicBool,
}

impl ChangeDetector {
    /// take the initial snapshot of `root`, ignoring anything under `excluded`
    pub fn new(
        root: impl AsRef<Path>,
        excluded: impl IntoIterator<Item = PathBuf>,
        broadcaster: Arc<Broadcaster>,
    ) -> std::io::Result<Self> {
        let root = canonical(root.as_ref());
        let excluded: Vec<PathBuf> = excluded.into_iter().map(|p| canonical(&p)).collect();
        let initial = compute_snapshot(&root, &excluded)?;
        tracing::debug!(
            "Initial storage snapshot: {} files, {} dirs, {} bytes",
            initial.file_count,
            initial.dir_count,
            initial.total_size
        );
        let last_checked = AtomicU64::new(initial.timestamp.to_bits());
        let (current, _) = watch::channel(Arc::new(initial));

        Ok(Self {
            root,
            excluded,
            current,
            refresh_lock: Mutex::new(()),
            broadcaster,
            total_checks: AtomicU64::new(0),
            changes_seen: AtomicU64::new(0),
            last_checked,
            watching: AtomicBool::new(false),
            monitoring: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// latest published snapshot; never a partially built one
    pub fn current(&self) -> Arc<StorageSnapshot> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StorageSnapshot>> {
        self.current.subscribe()
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn total_checks(&self) -> u64 {
        self.total_checks.load(Ordering::Relaxed)
    }

    pub fn changes_seen(&self) -> u64 {
        self.changes_seen.load(Ordering::Relaxed)
    }

    /// unix seconds of the last refresh, changed or not
    pub fn last_checked(&self) -> f64 {
        f64::from_bits(self.last_checked.load(Ordering::Relaxed))
    }

    pub fn mode(&self) -> MonitorMode {
        if !self.monitoring.load(Ordering::Relaxed) {
            MonitorMode::Idle
        } else if self.watching.load(Ordering::Relaxed) {
            MonitorMode::Watching
        } else {
            MonitorMode::Polling
        }
    }

    /// recompute the snapshot and publish a change if there is one.
    /// concurrent callers are serialized so publications stay ordered
    pub async fn refresh(&self) -> std::io::Result<(Arc<StorageSnapshot>, Option<ChangeEvent>)> {
        let _guard = self.refresh_lock.lock().await;

        let root = self.root.clone();
        let excluded = self.excluded.clone();
        let fresh = tokio::task::spawn_blocking(move || compute_snapshot(&root, &excluded))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        self.last_checked.store(fresh.timestamp.to_bits(), Ordering::Relaxed);

        let previous = self.current();
        let Some(event) = ChangeEvent::between(&previous, &fresh) else {
            return Ok((previous, None));
        };

        let fresh = Arc::new(fresh);
        self.current.send_replace(fresh.clone());
        self.changes_seen.fetch_add(1, Ordering::Relaxed);
        let delivered = self.broadcaster.publish_update(&fresh, &event);
        tracing::debug!(
            "📊 Storage changed: files {:+}, dirs {:+}, size {:+} ({} live clients)",
            event.files_changed,
            event.dirs_changed,
            event.size_changed,
            delivered
        );
        Ok((fresh, Some(event)))
    }

    /// start the background monitor. falls back to timer-only refreshes when
    /// the filesystem watcher can't be started
    pub fn spawn_monitor(self: Arc<Self>, interval: Duration, debounce: Duration) -> JoinHandle<()> {
        tokio::spawn(async move { self.monitor(interval, debounce).await })
    }

    async fn monitor(&self, interval: Duration, debounce: Duration) {
        let (tx, mut rx) = mpsc::channel::<()>(256);
        let _watcher = match start_watcher(&self.root, &self.excluded, tx.clone()) {
            Ok(watcher) => {
                self.watching.store(true, Ordering::Relaxed);
                tracing::info!("👀 Watching {:?} for changes", self.root);
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!(
                    "Filesystem watcher unavailable ({}), falling back to polling every {:?}",
                    e,
                    interval
                );
                None
            }
        };
        self.monitoring.store(true, Ordering::Relaxed);

        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = rx.recv() => {
                    // coalesce a burst of events into one refresh
                    let quiet = tokio::time::sleep(debounce);
                    tokio::pin!(quiet);
                    loop {
                        tokio::select! {
                            _ = &mut quiet => break,
                            Some(()) = rx.recv() => {}
                        }
                    }
                }
            }

            if let Err(e) = self.refresh().await {
                tracing::warn!("Storage refresh failed: {}", e);
            }
        }
    }
}

fn start_watcher(
    root: &Path,
    excluded: &[PathBuf],
    tx: mpsc::Sender<()>,
) -> notify::Result<RecommendedWatcher> {
    let excluded = excluded.to_vec();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                if !event.paths.is_empty()
                    && event
                        .paths
                        .iter()
                        .all(|p| excluded.iter().any(|ex| p.starts_with(ex)))
                {
                    return;
                }
                // a full channel already has a refresh pending
                let _ = tx.try_send(());
            }
            Err(e) => tracing::warn!("Watcher error: {}", e),
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
