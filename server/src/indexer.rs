//! Indexing pipeline: scan → diff → chunk → embed → upsert.
//!
//! One folder is orchestrated at a time. The vector upsert always precedes
//! the metadata commit, so a crash in between leaves extra vector points
//! (reclaimed by the next scan) rather than metadata rows pointing at
//! missing vectors; deletions run in the opposite order. Same-path
//! operations serialize on per-path async mutexes shared with the watcher.

use crate::embed::EmbeddingClient;
use crate::error::{Error, Result};
use crate::pathmap::PathMapper;
use crate::scan::{self, ScannedFile};
use crate::store::MetaStore;
use crate::types::{
    CancelToken, FileChunk, FolderStatus, IndexedFile, IndexedFolder, ScanCounters, new_id,
    point_id,
};
use crate::vector::{ChunkPayload, PointFilter, VectorPoint, VectorStore};
use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

/// Maximum texts per embedding request.
pub const EMBED_BATCH: usize = 100;

/// Transient-failure retry budget (embedding, vector store).
const MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

/// Orchestrates indexing for all folders. Cheap to share via [`Arc`].
pub struct Indexer {
    store: Arc<MetaStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    mapper: Arc<PathMapper>,
    collection: String,
    /// Per-path mutexes serializing same-path operations; scans and
    /// incremental ops both acquire them.
    path_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Indexer {
    #[must_use]
    pub fn new(
        store: Arc<MetaStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
        mapper: Arc<PathMapper>,
        collection: &str,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            mapper,
            collection: collection.to_string(),
            path_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    #[must_use]
    pub fn mapper(&self) -> &Arc<PathMapper> {
        &self.mapper
    }

    fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -----------------------------------------------------------------------
    // Folder lifecycle
    // -----------------------------------------------------------------------

    /// Register a folder for indexing. The given path may be in the host
    /// namespace; the stored record always uses the canonical (container)
    /// namespace. Ensures the vector collection exists up front.
    pub async fn add_folder(
        &self,
        path: &str,
        description: Option<&str>,
    ) -> Result<IndexedFolder> {
        let canonical = if self.mapper.has_mappings() {
            let mapped = self.mapper.to_container(path);
            if !self.mapper.validate_container(&mapped) {
                return Err(Error::Config(format!(
                    "path '{path}' is outside every configured mount"
                )));
            }
            mapped
        } else {
            // Host mode: resolve symlinks and relative paths so the stored
            // record matches what the scanner and watcher will see.
            std::fs::canonicalize(path)
                .map_err(|source| Error::PathUnreachable { path: path.into(), source })?
                .to_string_lossy()
                .replace('\\', "/")
        };
        std::fs::metadata(&canonical).map_err(|source| Error::PathUnreachable {
            path: canonical.clone().into(),
            source,
        })?;

        self.vectors
            .ensure_collection(&self.collection, self.embedder.dimensions())
            .await?;
        let folder = self.store.create_folder(&canonical, description).await?;
        info!(folder = canonical.as_str(), id = folder.id.as_str(), "Folder registered");
        Ok(folder)
    }

    /// Remove a folder and everything derived from it: vector points
    /// first, then the metadata cascade.
    pub async fn remove_folder(&self, folder_id: &str) -> Result<()> {
        let folder = self
            .store
            .folder(folder_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("folder {folder_id}")))?;

        let cancel = CancelToken::new();
        let filter = PointFilter::for_folder(folder_id);
        with_retry("vector folder delete", &cancel, || {
            self.vectors.delete_by_filter(&self.collection, &filter)
        })
        .await?;
        self.store.delete_folder(folder_id).await?;
        info!(folder = folder.path.as_str(), "Folder removed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Full folder scan
    // -----------------------------------------------------------------------

    /// Scan one folder: classify files as new/changed/unchanged/removed and
    /// reconcile the vector and metadata stores. The folder is quarantined
    /// (status=error) on non-recoverable failure; other folders are
    /// unaffected.
    pub async fn scan_folder(
        &self,
        folder_id: &str,
        cancel: &CancelToken,
    ) -> Result<ScanCounters> {
        let folder = self
            .store
            .folder(folder_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("folder {folder_id}")))?;

        self.store
            .set_folder_status(folder_id, FolderStatus::Scanning, None)
            .await?;

        let outcome = self.scan_folder_inner(&folder, cancel).await;
        match &outcome {
            Ok(counters) => {
                self.store.finish_scan(folder_id, counters.total_files).await?;
                info!(
                    folder = folder.path.as_str(),
                    indexed = counters.files_indexed,
                    updated = counters.files_updated,
                    skipped = counters.files_skipped,
                    "Scan complete"
                );
            }
            Err(Error::Cancelled) => {
                // In-flight files were never committed; the folder stays
                // usable and the next scan reconciles leftovers.
                self.store
                    .set_folder_status(folder_id, FolderStatus::Active, None)
                    .await?;
            }
            Err(e) => {
                error!(folder = folder.path.as_str(), error = %e, "Scan failed");
                self.store
                    .set_folder_status(folder_id, FolderStatus::Error, Some(&e.to_string()))
                    .await?;
            }
        }
        outcome
    }

    async fn scan_folder_inner(
        &self,
        folder: &IndexedFolder,
        cancel: &CancelToken,
    ) -> Result<ScanCounters> {
        let root = Path::new(&folder.path);
        let scanned = scan::scan_root(root)?;
        for (path, reason) in &scanned.failed {
            warn!(path = %path.display(), reason = reason.as_str(), "File skipped during scan");
        }

        let stored = self.store.files_in_folder(&folder.id).await?;
        let mut stored_by_path: std::collections::HashMap<String, IndexedFile> =
            stored.into_iter().map(|f| (f.path.clone(), f)).collect();

        let mut counters = ScanCounters {
            total_files: scanned.files.len() as u64,
            ..ScanCounters::default()
        };

        for current in &scanned.files {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let abs = current.abs_path.to_string_lossy().replace('\\', "/");
            match stored_by_path.remove(&abs) {
                None => {
                    self.index_one_locked(folder, current, None, cancel).await?;
                    counters.files_indexed += 1;
                }
                Some(existing) if existing.content_hash != current.content_hash => {
                    self.index_one_locked(folder, current, Some(existing), cancel).await?;
                    counters.files_updated += 1;
                }
                Some(_) => {
                    counters.files_skipped += 1;
                }
            }
        }

        // Everything left in the stored map no longer exists on disk.
        for (path, removed) in stored_by_path {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let lock = self.path_lock(&path);
            let _guard = lock.lock().await;
            self.remove_stored_file(&removed, cancel).await?;
            debug!(path = path.as_str(), "Removed stale file from index");
        }

        Ok(counters)
    }

    // -----------------------------------------------------------------------
    // Single-file operations (watcher path)
    // -----------------------------------------------------------------------

    /// Incrementally (re-)index one file. `path` is in the canonical
    /// namespace. Returns true when work was done, false when the stored
    /// hash already matched.
    pub async fn index_single_file(
        &self,
        folder_id: &str,
        path: &str,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let folder = self
            .store
            .folder(folder_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("folder {folder_id}")))?;

        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        let existing = self.store.file_by_path(folder_id, path).await?;
        let scanned = match scan::scan_single(Path::new(&folder.path), Path::new(path)) {
            Ok(s) => s,
            Err(Error::Unsupported(_) | Error::FileTooLarge { .. }) if existing.is_some() => {
                // The file fell out of the supported set; drop it.
                let removed = existing.unwrap();
                self.remove_stored_file(&removed, cancel).await?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        if let Some(ref stored) = existing {
            if stored.content_hash == scanned.content_hash {
                debug!(path = path, "Hash unchanged, skipping re-index");
                return Ok(false);
            }
        }

        self.index_one(&folder, &scanned, existing, cancel).await?;
        Ok(true)
    }

    /// Remove one file's points and metadata. No-op when the path was
    /// never indexed.
    pub async fn remove_single_file(&self, folder_id: &str, path: &str) -> Result<()> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        let Some(existing) = self.store.file_by_path(folder_id, path).await? else {
            return Ok(());
        };
        self.remove_stored_file(&existing, &CancelToken::new()).await
    }

    /// Every stored file under a directory prefix (for directory removals).
    pub async fn files_under(&self, folder_id: &str, dir_path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", dir_path.trim_end_matches('/'));
        Ok(self
            .store
            .files_in_folder(folder_id)
            .await?
            .into_iter()
            .map(|f| f.path)
            .filter(|p| p.starts_with(&prefix))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Upsert / delete protocol
    // -----------------------------------------------------------------------

    async fn index_one_locked(
        &self,
        folder: &IndexedFolder,
        scanned: &ScannedFile,
        existing: Option<IndexedFile>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let path = scanned.abs_path.to_string_lossy().replace('\\', "/");
        let lock = self.path_lock(&path);
        let _guard = lock.lock().await;
        self.index_one(folder, scanned, existing, cancel).await
    }

    /// Chunk, embed, upsert vectors, then commit metadata. On failure after
    /// any points were written, the just-written points are rolled back so
    /// the stores never diverge silently.
    async fn index_one(
        &self,
        folder: &IndexedFolder,
        scanned: &ScannedFile,
        existing: Option<IndexedFile>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let file_id = existing.as_ref().map_or_else(new_id, |f| f.id.clone());
        let path = scanned.abs_path.to_string_lossy().replace('\\', "/");

        let slices = scan::chunk_file(&scanned.abs_path)?;
        let texts: Vec<String> = slices.iter().map(|c| c.content.clone()).collect();

        // Embed in bounded batches, preserving chunk order.
        let mut vectors_out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let embedded =
                with_retry("embed batch", cancel, || self.embedder.embed_batch(batch)).await?;
            vectors_out.extend(embedded);
        }

        // Changed files drop their previous points first so stale chunks
        // beyond the new chunk count cannot survive.
        if existing.is_some() {
            let filter = PointFilter::for_file(&file_id);
            with_retry("vector file delete", cancel, || {
                self.vectors.delete_by_filter(&self.collection, &filter)
            })
            .await?;
        }

        let points: Vec<VectorPoint> = slices
            .iter()
            .zip(vectors_out)
            .map(|(slice, vector)| VectorPoint {
                id: point_id(&file_id, slice.index),
                vector,
                payload: ChunkPayload {
                    file_id: file_id.clone(),
                    folder_id: folder.id.clone(),
                    folder_path: folder.path.clone(),
                    file_path: path.clone(),
                    relative_path: scanned.relative_path.clone(),
                    language: scanned.language.clone(),
                    chunk_index: slice.index,
                    start_line: slice.start_line,
                    end_line: slice.end_line,
                    content: slice.content.clone(),
                }
                .to_value(),
            })
            .collect();
        let written_ids: Vec<String> = points.iter().map(|p| p.id.clone()).collect();

        let upserted = with_retry("vector upsert", cancel, || {
            self.vectors.upsert_points(&self.collection, points.clone())
        })
        .await;
        if let Err(e) = upserted {
            self.rollback_points(&written_ids).await;
            return Err(e);
        }

        if cancel.is_cancelled() {
            self.rollback_points(&written_ids).await;
            return Err(Error::Cancelled);
        }

        // Vector write succeeded; now the metadata commit makes it real.
        let now = Utc::now();
        let record = IndexedFile {
            id: file_id.clone(),
            folder_id: folder.id.clone(),
            path,
            relative_path: scanned.relative_path.clone(),
            language: scanned.language.clone(),
            content_hash: scanned.content_hash.clone(),
            size_bytes: scanned.size_bytes,
            line_count: scanned.line_count,
            chunk_count: slices.len() as u32,
            indexed_at: existing.as_ref().map_or(now, |f| f.indexed_at),
            updated_at: now,
        };
        let chunks: Vec<FileChunk> = slices
            .into_iter()
            .map(|slice| FileChunk {
                file_id: file_id.clone(),
                chunk_index: slice.index,
                content: slice.content,
                start_line: slice.start_line,
                end_line: slice.end_line,
            })
            .collect();

        if let Err(e) = self.store.upsert_file(&record, &chunks).await {
            self.rollback_points(&written_ids).await;
            return Err(e);
        }
        Ok(())
    }

    /// Best-effort cleanup of points written for a file that failed to
    /// commit. A leftover point is recoverable (next scan rewrites or
    /// deletes it), so failures here only log.
    async fn rollback_points(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.vectors.delete_points(&self.collection, ids).await {
            warn!(count = ids.len(), error = %e, "Rollback of partial vector points failed");
        }
    }

    /// Vector delete strictly precedes the metadata delete.
    async fn remove_stored_file(&self, file: &IndexedFile, cancel: &CancelToken) -> Result<()> {
        let filter = PointFilter::for_file(&file.id);
        with_retry("vector file delete", cancel, || {
            self.vectors.delete_by_filter(&self.collection, &filter)
        })
        .await?;
        self.store.delete_file(&file.id).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retry with backoff
// ---------------------------------------------------------------------------

/// Run `op`, retrying transient failures up to [`MAX_RETRIES`] times with
/// doubling backoff. Cancellation interrupts the backoff sleep.
async fn with_retry<T, F, Fut>(what: &str, cancel: &CancelToken, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(200);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                warn!(what = what, attempt = attempt, error = %e, "Transient failure, retrying");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                }
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Indexing worker queue
// ---------------------------------------------------------------------------

/// Operation kinds drained by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Index,
    Remove,
}

#[derive(Debug)]
struct QueueItem {
    folder_id: String,
    path: String,
    op: IndexOp,
}

/// Bounded queue feeding a fixed worker pool. Work on distinct paths runs
/// concurrently; same-path work serializes inside the indexer.
#[derive(Clone)]
pub struct IndexQueue {
    tx: mpsc::Sender<QueueItem>,
}

impl IndexQueue {
    /// Spawn `workers` drain tasks (at least one) over a shared queue.
    #[must_use]
    pub fn start(indexer: Arc<Indexer>, workers: usize, cancel: CancelToken) -> Self {
        let (tx, rx) = mpsc::channel::<QueueItem>(1024);
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let indexer = Arc::clone(&indexer);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let item = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            item = guard.recv() => item,
                            () = cancel.cancelled() => None,
                        }
                    };
                    let Some(item) = item else { break };
                    let result = match item.op {
                        IndexOp::Index => indexer
                            .index_single_file(&item.folder_id, &item.path, &cancel)
                            .await
                            .map(|_| ()),
                        IndexOp::Remove => {
                            indexer.remove_single_file(&item.folder_id, &item.path).await
                        }
                    };
                    match result {
                        Ok(()) => {}
                        Err(Error::Cancelled) => break,
                        Err(e) => {
                            warn!(
                                worker = worker_id,
                                path = item.path.as_str(),
                                error = %e,
                                "Incremental index operation failed"
                            );
                        }
                    }
                }
                debug!(worker = worker_id, "Index worker stopped");
            });
        }
        Self { tx }
    }

    /// Enqueue one operation; drops the item (with a log) if the queue is
    /// shutting down.
    pub async fn submit(&self, folder_id: &str, path: &str, op: IndexOp) {
        let item = QueueItem {
            folder_id: folder_id.to_string(),
            path: path.to_string(),
            op,
        };
        if self.tx.send(item).await.is_err() {
            warn!(path = path, "Index queue closed, dropping operation");
        }
    }
}
