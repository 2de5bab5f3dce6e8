//! Shared scaffolding for pipeline integration tests: an in-memory
//! backend (deterministic embedder + memory vector store + `:memory:`
//! SQLite) over a tempdir fixture tree.

#![allow(dead_code)]

use devatlas_server::embed::{EmbeddingClient, HashEmbeddingClient};
use devatlas_server::indexer::Indexer;
use devatlas_server::pathmap::PathMapper;
use devatlas_server::search::SearchEngine;
use devatlas_server::store::MetaStore;
use devatlas_server::vector::{MemoryVectorStore, VectorStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Embedding dimensionality used across the tests.
pub const DIM: usize = 128;

/// Vector collection name matching the production default.
pub const COLLECTION: &str = "code_index";

/// A fully wired backend over in-memory stores.
pub struct TestBackend {
    pub store: Arc<MetaStore>,
    pub vectors: Arc<MemoryVectorStore>,
    pub embedder: Arc<HashEmbeddingClient>,
    pub indexer: Arc<Indexer>,
    pub search: Arc<SearchEngine>,
}

impl TestBackend {
    pub fn new(mapper: PathMapper) -> Self {
        let store = Arc::new(MetaStore::in_memory().expect("in-memory store"));
        let vectors = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(HashEmbeddingClient::new(DIM));
        let mapper = Arc::new(mapper);

        let indexer = Arc::new(Indexer::new(
            Arc::clone(&store),
            Arc::clone(&vectors) as Arc<dyn VectorStore>,
            Arc::clone(&embedder) as Arc<dyn EmbeddingClient>,
            Arc::clone(&mapper),
            COLLECTION,
        ));
        let search = Arc::new(SearchEngine::new(
            Arc::clone(&store),
            Arc::clone(&vectors) as Arc<dyn VectorStore>,
            Arc::clone(&embedder) as Arc<dyn EmbeddingClient>,
            mapper,
            COLLECTION,
        ));

        Self { store, vectors, embedder, indexer, search }
    }
}

impl Default for TestBackend {
    fn default() -> Self {
        Self::new(PathMapper::default())
    }
}

/// Write a file under `dir`, creating parents.
pub fn write_file(dir: &Path, rel: &str, content: &str) -> PathBuf {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(&path, content).expect("write fixture file");
    path
}

/// A Go-looking source file with `lines` lines; `marker` lands on an
/// early line so searches can find it.
pub fn go_source(lines: usize, marker: &str) -> String {
    let mut out = String::from("package main\n");
    out.push_str(&format!("// {marker}\n"));
    for i in 2..lines {
        out.push_str(&format!("func helper{i}() int {{ return {i} }}\n"));
    }
    out
}
