//! Configuration & Filesystem Watcher (spec §4.L).
//!
//! Grounded on `codescope::watch.rs`'s `debounce_loop`: a `notify` watcher
//! feeding a channel, drained by a debounce loop that coalesces rapid-fire
//! events into one per settled path. Generalized two ways: the debounce
//! loop here emits typed [`ChangeEvent`]s to an async `mpsc` channel instead
//! of mutating `ServerState` directly, and it additionally applies a
//! write-finish stability check before declaring a path settled, since
//! `codescope` only debounces, it never waits out an in-progress write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

/// Default debounce window (§4.L "default 500ms").
pub const DEBOUNCE_MS: u64 = 500;
/// Minimum quiet period after the last write before a file is considered
/// settled (§4.L "write-finish stability threshold ~200ms").
const STABILITY_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp_unix_ms: i64,
}

fn now_unix_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Live handle to a folder watch. Dropping it stops the underlying `notify`
/// watcher and its debounce thread.
pub struct FolderWatcher {
    _watcher: RecommendedWatcher,
}

impl FolderWatcher {
    /// Start watching `root` recursively, sending a debounced [`ChangeEvent`]
    /// per settled path to `events_tx`. No events are emitted before the
    /// watcher is fully registered with the OS (§4.L "no events before
    /// ready").
    pub fn start(root: PathBuf, events_tx: mpsc::UnboundedSender<ChangeEvent>) -> Result<Self, notify::Error> {
        Self::start_mode(root, RecursiveMode::Recursive, events_tx)
    }

    /// Watch a single file (§4.L "the configuration file") rather than a
    /// folder root. Registers the watch on the file's parent directory,
    /// non-recursively: most editors and config-management tools replace a
    /// file via write-to-temp-then-rename rather than an in-place write,
    /// which an inotify watch on the file's own inode would miss entirely.
    /// Callers filter the resulting events down to the one path they care
    /// about.
    pub fn start_file(path: &std::path::Path, events_tx: mpsc::UnboundedSender<ChangeEvent>) -> Result<Self, notify::Error> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        Self::start_mode(parent.to_path_buf(), RecursiveMode::NonRecursive, events_tx)
    }

    fn start_mode(
        root: PathBuf,
        mode: RecursiveMode,
        events_tx: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Result<Self, notify::Error> {
        let (raw_tx, raw_rx) = std_mpsc::channel::<Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = raw_tx.send(event);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&root, mode)?;

        std::thread::spawn(move || debounce_loop(raw_rx, events_tx));

        Ok(Self { _watcher: watcher })
    }
}

/// One pending path and the data needed to decide whether it has settled.
struct Pending {
    last_seen: Instant,
    kind: ChangeKind,
}

/// Collect raw `notify` events and flush one coalesced [`ChangeEvent`] per
/// path once it has been quiet for both the debounce window and the
/// stability threshold (§4.L "single event per debounced change").
fn debounce_loop(rx: std_mpsc::Receiver<Event>, tx: mpsc::UnboundedSender<ChangeEvent>) {
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();
    let poll_interval = Duration::from_millis(STABILITY_MS.min(DEBOUNCE_MS));

    loop {
        match rx.recv_timeout(poll_interval) {
            Ok(event) => {
                let kind = match event.kind {
                    EventKind::Create(_) => ChangeKind::Add,
                    EventKind::Modify(_) => ChangeKind::Change,
                    EventKind::Remove(_) => ChangeKind::Unlink,
                    _ => continue,
                };
                let now = Instant::now();
                for path in event.paths {
                    pending.insert(path, Pending { last_seen: now, kind });
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let cutoff = Instant::now() - Duration::from_millis(DEBOUNCE_MS.max(STABILITY_MS));
                let settled: Vec<PathBuf> =
                    pending.iter().filter(|(_, p)| p.last_seen <= cutoff).map(|(p, _)| p.clone()).collect();

                for path in settled {
                    if let Some(p) = pending.remove(&path) {
                        let event = ChangeEvent { path, kind: p.kind, timestamp_unix_ms: now_unix_ms() };
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                warn!("filesystem watcher channel disconnected, stopping debounce loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn create_then_modify_coalesces_into_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = FolderWatcher::start(dir.path().to_path_buf(), tx).unwrap();

        let file = dir.path().join("a.txt");
        std::fs::write(&file, "one").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&file, "two").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.path, file);

        // No second event should follow quickly once settled.
        let second = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(second.is_err(), "expected exactly one debounced event, got a second");
    }

    #[tokio::test]
    async fn start_file_sees_changes_to_the_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("folderd.toml");
        std::fs::write(&config_path, "version = 1").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = FolderWatcher::start_file(&config_path, tx).unwrap();
        std::fs::write(&config_path, "version = 2").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.path, config_path);
    }

    #[tokio::test]
    async fn removal_emits_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("b.txt");
        std::fs::write(&file, "x").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = FolderWatcher::start(dir.path().to_path_buf(), tx).unwrap();
        std::fs::remove_file(&file).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Unlink);
    }
}
