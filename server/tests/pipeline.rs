//! End-to-end pipeline tests: add → scan → search, edit detection,
//! incremental operations, cascades, namespace translation, and folder
//! quarantine, all over in-memory stores and tempdir fixture trees.

mod helpers;

use devatlas_server::pathmap::PathMapper;
use devatlas_server::types::{CancelToken, FolderStatus, RetrieveMode, SearchRequest, point_id};
use helpers::{COLLECTION, TestBackend, go_source, write_file};

async fn add_and_scan(backend: &TestBackend, path: &str) -> (String, devatlas_server::types::ScanCounters) {
    let folder = backend
        .indexer
        .add_folder(path, None)
        .await
        .expect("add folder");
    let counters = backend
        .indexer
        .scan_folder(&folder.id, &CancelToken::new())
        .await
        .expect("scan folder");
    (folder.id, counters)
}

// ---------------------------------------------------------------------------
// Scenario: add + scan + search cycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_scan_search_cycle() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "auth.go", &go_source(200, "JWT validation for incoming requests"));
    write_file(dir.path(), "util.go", &go_source(50, "string helpers"));

    let backend = TestBackend::default();
    let (folder_id, counters) = add_and_scan(&backend, &dir.path().to_string_lossy()).await;

    assert_eq!(counters.files_indexed, 2);
    assert_eq!(counters.files_updated, 0);
    assert_eq!(counters.files_skipped, 0);
    assert_eq!(counters.total_files, 2);

    let folder = backend.store.folder(&folder_id).await.unwrap().unwrap();
    assert_eq!(folder.status, FolderStatus::Active);
    assert_eq!(folder.file_count, 2);
    assert!(folder.last_scanned_at.is_some());

    let hits = backend
        .search
        .search(&SearchRequest {
            query: "JWT validation".into(),
            limit: Some(1),
            ..SearchRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].relative_path, "auth.go");
    assert!(hits[0].score > 0.0);
}

// ---------------------------------------------------------------------------
// Scenario: edit detection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rescan_detects_single_edit() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "auth.go", &go_source(200, "JWT validation"));
    let util = go_source(50, "string helpers");
    write_file(dir.path(), "util.go", &util);

    let backend = TestBackend::default();
    let (folder_id, _) = add_and_scan(&backend, &dir.path().to_string_lossy()).await;

    let before = backend
        .store
        .files_in_folder(&folder_id)
        .await
        .unwrap()
        .into_iter()
        .find(|f| f.relative_path == "util.go")
        .unwrap();

    // Flip one byte.
    let edited = util.replacen("string", "strinG", 1);
    write_file(dir.path(), "util.go", &edited);

    let counters = backend
        .indexer
        .scan_folder(&folder_id, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(counters.files_indexed, 0);
    assert_eq!(counters.files_updated, 1);
    assert_eq!(counters.files_skipped, 1);
    assert_eq!(counters.total_files, 2);

    let after = backend
        .store
        .files_in_folder(&folder_id)
        .await
        .unwrap()
        .into_iter()
        .find(|f| f.relative_path == "util.go")
        .unwrap();
    assert_ne!(before.content_hash, after.content_hash);
    assert_eq!(before.id, after.id, "file id survives re-index");
}

// ---------------------------------------------------------------------------
// Hash stability: re-scan with no changes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unchanged_rescan_skips_everything() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.go", &go_source(10, "alpha"));
    write_file(dir.path(), "b.go", &go_source(10, "beta"));
    write_file(dir.path(), "c.go", &go_source(10, "gamma"));

    let backend = TestBackend::default();
    let (folder_id, _) = add_and_scan(&backend, &dir.path().to_string_lossy()).await;

    let ids_before = backend.vectors.point_ids(COLLECTION);
    let counters = backend
        .indexer
        .scan_folder(&folder_id, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(counters.files_indexed, 0);
    assert_eq!(counters.files_updated, 0);
    assert_eq!(counters.files_skipped, 3);
    assert_eq!(counters.total_files, 3);
    // Point ids are deterministic and re-upserts never duplicate.
    assert_eq!(backend.vectors.point_ids(COLLECTION), ids_before);
}

// ---------------------------------------------------------------------------
// Chunking across the store boundary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chunks_cover_file_and_points_match() {
    let dir = tempfile::tempdir().unwrap();
    let content = go_source(450, "three chunk file");
    write_file(dir.path(), "big.go", &content);

    let backend = TestBackend::default();
    let (folder_id, _) = add_and_scan(&backend, &dir.path().to_string_lossy()).await;

    let file = backend
        .store
        .files_in_folder(&folder_id)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(file.line_count, 450);
    assert_eq!(file.chunk_count, 3);

    let chunks = backend.store.chunks_for_file(&file.id).await.unwrap();
    assert_eq!(chunks.len(), 3);
    let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(joined, content, "chunks reproduce the file byte-for-byte");
    assert_eq!(chunks[0].start_line, 1);
    assert_eq!(chunks[2].end_line, 450);

    let expected: Vec<String> = (0..3).map(|i| point_id(&file.id, i)).collect();
    let mut stored = backend.vectors.point_ids(COLLECTION);
    stored.sort();
    let mut expected_sorted = expected.clone();
    expected_sorted.sort();
    assert_eq!(stored, expected_sorted);
}

#[tokio::test]
async fn empty_file_gets_single_empty_chunk() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "empty.go", "");

    let backend = TestBackend::default();
    let (folder_id, counters) = add_and_scan(&backend, &dir.path().to_string_lossy()).await;
    assert_eq!(counters.files_indexed, 1);

    let file = backend
        .store
        .files_in_folder(&folder_id)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(file.line_count, 0);
    assert_eq!(file.chunk_count, 1);

    let chunks = backend.store.chunks_for_file(&file.id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 0));
    assert!(chunks[0].content.is_empty());
}

// ---------------------------------------------------------------------------
// Removal paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deleted_file_drops_out_on_rescan() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "keep.go", &go_source(10, "keep"));
    let gone = write_file(dir.path(), "gone.go", &go_source(10, "gone"));

    let backend = TestBackend::default();
    let (folder_id, _) = add_and_scan(&backend, &dir.path().to_string_lossy()).await;
    assert_eq!(backend.vectors.point_count(COLLECTION), 2);

    std::fs::remove_file(gone).unwrap();
    let counters = backend
        .indexer
        .scan_folder(&folder_id, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(counters.total_files, 1);
    assert_eq!(counters.files_skipped, 1);

    let files = backend.store.files_in_folder(&folder_id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].relative_path, "keep.go");
    assert_eq!(backend.vectors.point_count(COLLECTION), 1);
}

#[tokio::test]
async fn folder_removal_cascades_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.go", &go_source(10, "alpha"));
    write_file(dir.path(), "sub/b.go", &go_source(10, "beta"));

    let backend = TestBackend::default();
    let (folder_id, _) = add_and_scan(&backend, &dir.path().to_string_lossy()).await;
    assert_eq!(backend.vectors.point_count(COLLECTION), 2);

    backend.indexer.remove_folder(&folder_id).await.unwrap();

    let counts = backend.store.counts().await.unwrap();
    assert_eq!(counts.folders, 0);
    assert_eq!(counts.files, 0);
    assert_eq!(counts.chunks, 0);
    assert_eq!(backend.vectors.point_count(COLLECTION), 0);
}

// ---------------------------------------------------------------------------
// Incremental single-file operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_file_index_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.go", &go_source(10, "alpha"));

    let backend = TestBackend::default();
    let (folder_id, _) = add_and_scan(&backend, &dir.path().to_string_lossy()).await;

    // New file appears via the watcher path.
    let new_path = write_file(dir.path(), "b.go", &go_source(10, "beta"));
    let new_canonical = new_path.to_string_lossy().to_string();
    let did_work = backend
        .indexer
        .index_single_file(&folder_id, &new_canonical, &CancelToken::new())
        .await
        .unwrap();
    assert!(did_work);
    assert_eq!(backend.store.files_in_folder(&folder_id).await.unwrap().len(), 2);

    // Unchanged content short-circuits on the stored hash.
    let did_work = backend
        .indexer
        .index_single_file(&folder_id, &new_canonical, &CancelToken::new())
        .await
        .unwrap();
    assert!(!did_work);

    backend
        .indexer
        .remove_single_file(&folder_id, &new_canonical)
        .await
        .unwrap();
    assert_eq!(backend.store.files_in_folder(&folder_id).await.unwrap().len(), 1);
    assert_eq!(backend.vectors.point_count(COLLECTION), 1);

    // Removing a never-indexed path is a no-op.
    backend
        .indexer
        .remove_single_file(&folder_id, "/nowhere/else.go")
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Scenario: cross-namespace add and search
// ---------------------------------------------------------------------------

#[tokio::test]
async fn host_namespace_add_stores_container_paths() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "auth.go", &go_source(20, "JWT validation"));

    let container_root = dir.path().to_string_lossy().to_string();
    let mapper = PathMapper::parse(&format!("/Users/alice/proj:{container_root}"));
    let backend = TestBackend::new(mapper);

    // Add by host path; the stored record must be canonical.
    let folder = backend
        .indexer
        .add_folder("/Users/alice/proj", None)
        .await
        .unwrap();
    assert_eq!(folder.path, container_root);
    backend
        .indexer
        .scan_folder(&folder.id, &CancelToken::new())
        .await
        .unwrap();

    let by_host = backend
        .search
        .search(&SearchRequest {
            query: "JWT validation".into(),
            folder_path: Some("/Users/alice/proj".into()),
            ..SearchRequest::default()
        })
        .await
        .unwrap();
    let by_container = backend
        .search
        .search(&SearchRequest {
            query: "JWT validation".into(),
            folder_path: Some(container_root.clone()),
            ..SearchRequest::default()
        })
        .await
        .unwrap();

    assert!(!by_host.is_empty());
    assert_eq!(
        by_host.iter().map(|h| &h.file_id).collect::<Vec<_>>(),
        by_container.iter().map(|h| &h.file_id).collect::<Vec<_>>()
    );
}

// ---------------------------------------------------------------------------
// Scenario: folder quarantine on vector outage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn vector_outage_quarantines_only_that_folder() {
    let dir_ok = tempfile::tempdir().unwrap();
    write_file(dir_ok.path(), "good.go", &go_source(10, "healthy folder"));
    let dir_bad = tempfile::tempdir().unwrap();
    write_file(dir_bad.path(), "bad.go", &go_source(10, "unlucky folder"));

    let backend = TestBackend::default();
    let (ok_id, _) = add_and_scan(&backend, &dir_ok.path().to_string_lossy()).await;

    let bad = backend
        .indexer
        .add_folder(&dir_bad.path().to_string_lossy(), None)
        .await
        .unwrap();

    backend.vectors.set_unavailable(true);
    let err = backend
        .indexer
        .scan_folder(&bad.id, &CancelToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VECTOR_UNAVAILABLE");
    backend.vectors.set_unavailable(false);

    let bad_folder = backend.store.folder(&bad.id).await.unwrap().unwrap();
    assert_eq!(bad_folder.status, FolderStatus::Error);
    assert!(bad_folder.error.unwrap().contains("unreachable"));

    // The healthy folder is untouched and still searchable.
    let ok_folder = backend.store.folder(&ok_id).await.unwrap().unwrap();
    assert_eq!(ok_folder.status, FolderStatus::Active);
    let hits = backend
        .search
        .search(&SearchRequest {
            query: "healthy folder".into(),
            ..SearchRequest::default()
        })
        .await
        .unwrap();
    assert!(!hits.is_empty());

    // A later scan recovers the quarantined folder.
    let counters = backend
        .indexer
        .scan_folder(&bad.id, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(counters.files_indexed, 1);
    let recovered = backend.store.folder(&bad.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, FolderStatus::Active);
    assert!(recovered.error.is_none());
}

// ---------------------------------------------------------------------------
// Full-file retrieval through the live pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_retrieve_returns_whole_file() {
    let dir = tempfile::tempdir().unwrap();
    let content = go_source(250, "JWT validation helpers");
    write_file(dir.path(), "auth.go", &content);

    let backend = TestBackend::default();
    add_and_scan(&backend, &dir.path().to_string_lossy()).await;

    let hits = backend
        .search
        .search(&SearchRequest {
            query: "JWT validation".into(),
            retrieve: RetrieveMode::Full,
            ..SearchRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1, "full mode de-duplicates chunk hits per file");
    assert!(hits[0].full_file_retrieved);
    assert_eq!(hits[0].content, content);
}

// ---------------------------------------------------------------------------
// Duplicate folder registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_add_folder_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.go", &go_source(5, "alpha"));

    let backend = TestBackend::default();
    let path = dir.path().to_string_lossy().to_string();
    backend.indexer.add_folder(&path, None).await.unwrap();
    let err = backend.indexer.add_folder(&path, None).await.unwrap_err();
    assert_eq!(err.code(), "METADATA_CONFLICT");
}
