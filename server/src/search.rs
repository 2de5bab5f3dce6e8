//! Semantic search: query embedding → vector search → metadata join →
//! ranked snippets, with chunk or whole-file retrieval.

use crate::embed::EmbeddingClient;
use crate::error::Result;
use crate::pathmap::PathMapper;
use crate::scan::language_for;
use crate::store::MetaStore;
use crate::types::{RetrieveMode, SearchHit, SearchRequest};
use crate::vector::{ChunkPayload, PointFilter, VectorStore};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hard cap on requested results.
pub const MAX_LIMIT: u32 = 50;

/// Result count when the request does not specify one.
pub const DEFAULT_LIMIT: u32 = 10;

/// Read side of the index: joins the vector store and metadata store into
/// ranked search results.
pub struct SearchEngine {
    store: Arc<MetaStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    mapper: Arc<PathMapper>,
    collection: String,
}

impl SearchEngine {
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
        }
    }

    /// Execute a search request. Results come back in descending score
    /// order; equal scores break ties by chunk index, then file id.
    pub async fn search(&self, req: &SearchRequest) -> Result<Vec<SearchHit>> {
        let limit = req.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize;

        let filter = self.build_filter(req);
        let query_vector = self.embedder.embed(&req.query).await?;
        let scored = self
            .vectors
            .search(&self.collection, &query_vector, limit, filter.as_ref())
            .await?;

        let mut hits: Vec<SearchHit> = Vec::with_capacity(scored.len());
        for point in scored {
            let payload = match ChunkPayload::from_value(&point.payload) {
                Ok(p) => p,
                Err(e) => {
                    warn!(point = point.id.as_str(), error = %e, "Skipping malformed payload");
                    continue;
                }
            };
            if let Some(min) = req.min_score {
                if point.score < min {
                    continue;
                }
            }
            hits.push(SearchHit {
                file_id: payload.file_id,
                folder_id: payload.folder_id,
                file_path: payload.file_path,
                relative_path: payload.relative_path,
                language: payload.language,
                chunk_index: payload.chunk_index,
                start_line: payload.start_line,
                end_line: payload.end_line,
                content: payload.content,
                score: point.score,
                folder_path: payload.folder_path,
                full_file_retrieved: false,
            });
        }

        // Store order is authoritative; re-sorting only settles exact score
        // ties deterministically.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
                .then_with(|| a.file_id.cmp(&b.file_id))
        });

        if req.retrieve == RetrieveMode::Full {
            hits = self.expand_to_full_files(hits).await?;
        }

        debug!(query = req.query.as_str(), results = hits.len(), "Search complete");
        Ok(hits)
    }

    fn build_filter(&self, req: &SearchRequest) -> Option<PointFilter> {
        let mut filter = PointFilter::default();
        if let Some(folder_path) = &req.folder_path {
            // Accept either namespace; stored payloads are canonical.
            let canonical = self.mapper.to_container(folder_path);
            filter = filter.eq("folderPath", canonical);
        }
        if let Some(types) = &req.file_types {
            if !types.is_empty() {
                // File types may arrive as extensions ("go") or language
                // labels ("python"); both resolve against the payload's
                // language field.
                let languages: Vec<serde_json::Value> = types
                    .iter()
                    .map(|t| {
                        let t = t.trim_start_matches('.');
                        language_for(t).unwrap_or(t).into()
                    })
                    .collect();
                filter = filter.any_of("language", languages);
            }
        }
        if filter.is_empty() { None } else { Some(filter) }
    }

    /// Replace chunk content with the file's full text (chunks concatenated
    /// in index order). Multiple hits on the same file collapse into the
    /// best-scoring one.
    async fn expand_to_full_files(&self, hits: Vec<SearchHit>) -> Result<Vec<SearchHit>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::with_capacity(hits.len());
        for mut hit in hits {
            if !seen.insert(hit.file_id.clone()) {
                continue;
            }
            let chunks = self.store.chunks_for_file(&hit.file_id).await?;
            if chunks.is_empty() {
                // Vector point exists but metadata lags (mid-reindex); keep
                // the chunk text rather than returning nothing.
                out.push(hit);
                continue;
            }
            hit.content = chunks.into_iter().map(|c| c.content).collect();
            hit.full_file_retrieved = true;
            out.push(hit);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbeddingClient;
    use crate::types::{FileChunk, IndexedFile, new_id, point_id};
    use crate::vector::{MemoryVectorStore, VectorPoint};
    use chrono::Utc;

    const DIM: usize = 64;

    struct Fixture {
        engine: SearchEngine,
        store: Arc<MetaStore>,
        vectors: Arc<MemoryVectorStore>,
        embedder: Arc<HashEmbeddingClient>,
    }

    fn fixture(mapper: PathMapper) -> Fixture {
        let store = Arc::new(MetaStore::in_memory().unwrap());
        let vectors = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(HashEmbeddingClient::new(DIM));
        let engine = SearchEngine::new(
            Arc::clone(&store),
            Arc::clone(&vectors) as Arc<dyn crate::vector::VectorStore>,
            Arc::clone(&embedder) as Arc<dyn EmbeddingClient>,
            Arc::new(mapper),
            "code_index",
        );
        Fixture { engine, store, vectors, embedder }
    }

    async fn seed_file(
        fx: &Fixture,
        folder_path: &str,
        rel: &str,
        language: &str,
        chunk_texts: &[&str],
    ) -> String {
        let folder = match fx.store.folder_by_path(folder_path).await.unwrap() {
            Some(f) => f,
            None => fx.store.create_folder(folder_path, None).await.unwrap(),
        };
        let file_id = new_id();
        let now = Utc::now();
        let record = IndexedFile {
            id: file_id.clone(),
            folder_id: folder.id.clone(),
            path: format!("{folder_path}/{rel}"),
            relative_path: rel.to_string(),
            language: language.to_string(),
            content_hash: "00".repeat(32),
            size_bytes: 1,
            line_count: chunk_texts.len() as u32,
            chunk_count: chunk_texts.len() as u32,
            indexed_at: now,
            updated_at: now,
        };
        let chunks: Vec<FileChunk> = chunk_texts
            .iter()
            .enumerate()
            .map(|(i, text)| FileChunk {
                file_id: file_id.clone(),
                chunk_index: i as u32,
                content: (*text).to_string(),
                start_line: i as u32 + 1,
                end_line: i as u32 + 1,
            })
            .collect();
        fx.store.upsert_file(&record, &chunks).await.unwrap();

        let mut points = Vec::new();
        for (i, text) in chunk_texts.iter().enumerate() {
            let vector = fx.embedder.embed(text).await.unwrap();
            points.push(VectorPoint {
                id: point_id(&file_id, i as u32),
                vector,
                payload: ChunkPayload {
                    file_id: file_id.clone(),
                    folder_id: folder.id.clone(),
                    folder_path: folder_path.to_string(),
                    file_path: format!("{folder_path}/{rel}"),
                    relative_path: rel.to_string(),
                    language: language.to_string(),
                    chunk_index: i as u32,
                    start_line: i as u32 + 1,
                    end_line: i as u32 + 1,
                    content: (*text).to_string(),
                }
                .to_value(),
            });
        }
        fx.vectors.ensure_collection("code_index", DIM).await.unwrap();
        fx.vectors.upsert_points("code_index", points).await.unwrap();
        file_id
    }

    #[tokio::test]
    async fn ranks_matching_chunk_first() {
        let fx = fixture(PathMapper::default());
        seed_file(
            &fx,
            "/ws/m0",
            "auth.go",
            "go",
            &["func validateJWT(token string) error { return verify(token) }"],
        )
        .await;
        seed_file(&fx, "/ws/m0", "draw.go", "go", &["func drawCanvas(w, h int) {}"]).await;

        let hits = fx
            .engine
            .search(&SearchRequest {
                query: "validateJWT token".into(),
                limit: Some(2),
                ..SearchRequest::default()
            })
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].relative_path, "auth.go");
        assert!(!hits[0].full_file_retrieved);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn folder_filter_accepts_host_namespace() {
        let fx = fixture(PathMapper::parse("/Users/alice/proj:/ws/m0"));
        seed_file(&fx, "/ws/m0", "auth.go", "go", &["jwt validation logic"]).await;
        seed_file(&fx, "/ws/other", "auth.go", "go", &["jwt validation logic"]).await;

        let container = fx
            .engine
            .search(&SearchRequest {
                query: "jwt validation".into(),
                folder_path: Some("/ws/m0".into()),
                ..SearchRequest::default()
            })
            .await
            .unwrap();
        let host = fx
            .engine
            .search(&SearchRequest {
                query: "jwt validation".into(),
                folder_path: Some("/Users/alice/proj".into()),
                ..SearchRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(container.len(), 1);
        assert_eq!(host.len(), 1);
        assert_eq!(container[0].file_id, host[0].file_id);
        assert!(container.iter().all(|h| h.folder_path == "/ws/m0"));
    }

    #[tokio::test]
    async fn file_type_filter_maps_extensions_to_languages() {
        let fx = fixture(PathMapper::default());
        seed_file(&fx, "/ws/m0", "auth.go", "go", &["token validation in go"]).await;
        seed_file(&fx, "/ws/m0", "auth.py", "python", &["token validation in python"]).await;

        let hits = fx
            .engine
            .search(&SearchRequest {
                query: "token validation".into(),
                file_types: Some(vec!["go".into()]),
                ..SearchRequest::default()
            })
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.language == "go"));
    }

    #[tokio::test]
    async fn min_score_drops_weak_hits() {
        let fx = fixture(PathMapper::default());
        seed_file(&fx, "/ws/m0", "auth.go", "go", &["completely unrelated text"]).await;

        let hits = fx
            .engine
            .search(&SearchRequest {
                query: "jwt validation".into(),
                min_score: Some(0.99),
                ..SearchRequest::default()
            })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn full_retrieval_concatenates_chunks_and_dedupes() {
        let fx = fixture(PathMapper::default());
        seed_file(
            &fx,
            "/ws/m0",
            "auth.go",
            "go",
            &["jwt validation part one\n", "jwt validation part two\n"],
        )
        .await;

        let hits = fx
            .engine
            .search(&SearchRequest {
                query: "jwt validation".into(),
                limit: Some(10),
                retrieve: RetrieveMode::Full,
                ..SearchRequest::default()
            })
            .await
            .unwrap();

        // Both chunks match, but full mode collapses to one file hit.
        assert_eq!(hits.len(), 1);
        assert!(hits[0].full_file_retrieved);
        assert_eq!(
            hits[0].content,
            "jwt validation part one\njwt validation part two\n"
        );
    }
}
