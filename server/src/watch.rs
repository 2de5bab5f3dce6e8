//! File watcher for incremental live re-indexing.
//!
//! One platform watch handle per indexed folder, feeding debounced
//! single-file operations into the indexing queue. Watch roots live in the
//! host namespace; every path handed to the indexer is translated to the
//! canonical (container) namespace first, so stored records never leak
//! host paths.
//!
//! Event rules: writes and creates debounce for 500 ms per path (rapid
//! bursts collapse into one re-index after the last event); removes fire
//! immediately and cancel any pending timer; a removed directory cascades
//! to every stored file underneath it; renames arrive from the platform as
//! remove-of-old plus create-of-new and are handled as such.

use crate::indexer::{IndexOp, IndexQueue, Indexer};
use crate::pathmap::PathMapper;
use crate::scan::{is_code_file, is_ignored_dir};
use crate::types::{CancelToken, IndexedFolder};
use dashmap::DashMap;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Debounce window: wait this long after the last event before indexing.
pub const DEBOUNCE_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Per-path debouncer
// ---------------------------------------------------------------------------

/// Collapses rapid repeats on the same key into one deferred action that
/// runs `delay` after the most recent schedule.
pub struct Debouncer {
    pending: DashMap<String, tokio::task::JoinHandle<()>>,
    delay: Duration,
}

impl Debouncer {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { pending: DashMap::new(), delay }
    }

    /// (Re-)arm the timer for `key`. A previously pending action for the
    /// same key is cancelled, so only the final schedule fires.
    pub fn schedule<F>(self: &Arc<Self>, key: &str, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let this = Arc::clone(self);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.pending.remove(&owned_key);
            action.await;
        });
        if let Some(previous) = self.pending.insert(key.to_string(), handle) {
            previous.abort();
        }
    }

    /// Drop a pending action, if any. Returns true when a timer was armed.
    pub fn cancel(&self, key: &str) -> bool {
        if let Some((_, handle)) = self.pending.remove(key) {
            handle.abort();
            true
        } else {
            false
        }
    }

    /// Abort everything (shutdown).
    pub fn clear(&self) {
        for entry in self.pending.iter() {
            entry.value().abort();
        }
        self.pending.clear();
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Watch manager
// ---------------------------------------------------------------------------

struct WatchedFolder {
    // Dropping the handle stops the platform watcher.
    _watcher: RecommendedWatcher,
    host_root: String,
}

/// Process-wide watcher owning one notify handle per indexed folder.
pub struct WatchManager {
    indexer: Arc<Indexer>,
    queue: IndexQueue,
    mapper: Arc<PathMapper>,
    debounce: Arc<Debouncer>,
    watched: DashMap<String, WatchedFolder>,
    cancel: CancelToken,
}

impl WatchManager {
    #[must_use]
    pub fn new(
        indexer: Arc<Indexer>,
        queue: IndexQueue,
        mapper: Arc<PathMapper>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            indexer,
            queue,
            mapper,
            debounce: Arc::new(Debouncer::new(Duration::from_millis(DEBOUNCE_MS))),
            watched: DashMap::new(),
            cancel,
        }
    }

    /// Start watching a folder root. Events flow through a channel into a
    /// per-folder receiver task so the notify callback never blocks.
    pub fn watch_folder(&self, folder: &IndexedFolder) -> crate::Result<()> {
        if self.watched.contains_key(&folder.id) {
            return Ok(());
        }

        let host_root = self.mapper.to_host(&folder.path);
        let (tx, rx) = mpsc::channel::<Event>(256);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => warn!(error = %e, "Watch event error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| crate::Error::PathUnreachable {
            path: host_root.clone().into(),
            source: std::io::Error::other(e),
        })?;

        watcher
            .watch(Path::new(&host_root), RecursiveMode::Recursive)
            .map_err(|e| crate::Error::PathUnreachable {
                path: host_root.clone().into(),
                source: std::io::Error::other(e),
            })?;

        self.spawn_receiver(folder.id.clone(), rx);
        info!(folder = folder.path.as_str(), root = host_root.as_str(), "Watching folder");
        self.watched.insert(
            folder.id.clone(),
            WatchedFolder { _watcher: watcher, host_root },
        );
        Ok(())
    }

    /// Stop watching a folder; pending debounce timers for its paths are
    /// left to fire (the indexer treats missing files as removals).
    pub fn unwatch_folder(&self, folder_id: &str) {
        if let Some((_, folder)) = self.watched.remove(folder_id) {
            info!(root = folder.host_root.as_str(), "Stopped watching folder");
        }
    }

    /// Stop everything (shutdown).
    pub fn shutdown(&self) {
        self.watched.clear();
        self.debounce.clear();
    }

    #[must_use]
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    fn spawn_receiver(&self, folder_id: String, mut rx: mpsc::Receiver<Event>) {
        let indexer = Arc::clone(&self.indexer);
        let queue = self.queue.clone();
        let mapper = Arc::clone(&self.mapper);
        let debounce = Arc::clone(&self.debounce);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    e = rx.recv() => e,
                    () = cancel.cancelled() => None,
                };
                let Some(event) = event else { break };
                handle_event(&indexer, &queue, &mapper, &debounce, &folder_id, event).await;
            }
            debug!(folder = folder_id.as_str(), "Watch receiver stopped");
        });
    }
}

// ---------------------------------------------------------------------------
// Event handling
// ---------------------------------------------------------------------------

async fn handle_event(
    indexer: &Arc<Indexer>,
    queue: &IndexQueue,
    mapper: &Arc<PathMapper>,
    debounce: &Arc<Debouncer>,
    folder_id: &str,
    event: Event,
) {
    let (is_remove, is_write) = match event.kind {
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            (true, false)
        }
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other)
        | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => (false, true),
        _ => return,
    };

    for path in event.paths {
        let host_path = path.to_string_lossy().replace('\\', "/");
        if is_event_path_ignored(&path) {
            continue;
        }

        let canonical = mapper.to_container(&host_path);
        if mapper.has_mappings() && !mapper.validate_container(&canonical) {
            debug!(path = host_path.as_str(), "Event outside mapped volumes, ignored");
            continue;
        }

        if is_remove {
            // A pending write timer for a now-deleted path must not fire.
            debounce.cancel(&canonical);
            queue.submit(folder_id, &canonical, IndexOp::Remove).await;

            // Directory removal: cascade to every stored descendant.
            match indexer.files_under(folder_id, &canonical).await {
                Ok(children) => {
                    for child in children {
                        debounce.cancel(&child);
                        queue.submit(folder_id, &child, IndexOp::Remove).await;
                    }
                }
                Err(e) => warn!(path = canonical.as_str(), error = %e, "Cascade lookup failed"),
            }
            continue;
        }

        if is_write {
            if path.is_dir() {
                // Recursive watch already covers new directories; the files
                // inside raise their own create events.
                continue;
            }
            if !is_code_file(&path) {
                continue;
            }
            let queue = queue.clone();
            let folder_id = folder_id.to_string();
            let key = canonical.clone();
            debounce.schedule(&canonical, async move {
                queue.submit(&folder_id, &key, IndexOp::Index).await;
            });
        }
    }
}

/// Ignore rules for event paths: any ignored directory component, plus
/// dot-basenames whose extension is not in the supported set.
fn is_event_path_ignored(path: &Path) -> bool {
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if is_ignored_dir(&name) {
            return true;
        }
    }
    if let Some(basename) = path.file_name().and_then(|n| n.to_str()) {
        if basename.starts_with('.') && !is_code_file(path) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_rapid_schedules() {
        let debounce = Arc::new(Debouncer::new(Duration::from_millis(DEBOUNCE_MS)));
        let fired = Arc::new(AtomicUsize::new(0));

        // 10 schedules inside a 300 ms window must fire exactly once.
        for _ in 0..10 {
            let fired = Arc::clone(&fired);
            debounce.schedule("util.go", async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS + 50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(debounce.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_fire_independently() {
        let debounce = Arc::new(Debouncer::new(Duration::from_millis(DEBOUNCE_MS)));
        let fired = Arc::new(AtomicUsize::new(0));
        for key in ["a.go", "b.go", "c.go"] {
            let fired = Arc::clone(&fired);
            debounce.schedule(key, async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS + 50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_pending_action() {
        let debounce = Arc::new(Debouncer::new(Duration::from_millis(DEBOUNCE_MS)));
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            debounce.schedule("util.go", async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(debounce.cancel("util.go"));
        tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS * 2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!debounce.cancel("util.go"));
    }

    #[test]
    fn dotfiles_ignored_unless_supported() {
        assert!(is_event_path_ignored(Path::new("/ws/m0/.env")));
        assert!(is_event_path_ignored(Path::new("/ws/m0/.DS_Store")));
        // Dotfile with a supported extension is fair game.
        assert!(!is_event_path_ignored(Path::new("/ws/m0/.eslintrc.json")));
        assert!(is_event_path_ignored(Path::new("/ws/m0/node_modules/x/index.js")));
        assert!(!is_event_path_ignored(Path::new("/ws/m0/src/main.rs")));
    }
}
