//! Vector store clients.
//!
//! [`VectorStore`] is the capability set the indexer, search engine, and
//! knowledge tools consume: ensure a named collection, upsert points,
//! delete by id or payload filter, and similarity search. The HTTP
//! implementation speaks a Qdrant-style REST surface; the in-memory
//! implementation backs tests and single-process degraded runs.

use crate::error::{Error, Result};
use crate::types::point_id;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// Points, payloads, filters
// ---------------------------------------------------------------------------

/// A point to upsert: id, vector, and a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A search hit returned by the store, sorted by descending similarity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

/// Conjunctive payload filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointFilter {
    pub must: Vec<Condition>,
}

/// One filter condition on a payload field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals value.
    Eq(String, Value),
    /// Field equals any of the values.
    AnyOf(String, Vec<Value>),
}

impl PointFilter {
    #[must_use]
    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.must.push(Condition::Eq(field.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn any_of(mut self, field: &str, values: Vec<Value>) -> Self {
        self.must.push(Condition::AnyOf(field.to_string(), values));
        self
    }

    /// Filter selecting every point of one file.
    #[must_use]
    pub fn for_file(file_id: &str) -> Self {
        Self::default().eq("fileId", file_id)
    }

    /// Filter selecting every point of one folder.
    #[must_use]
    pub fn for_folder(folder_id: &str) -> Self {
        Self::default().eq("folderId", folder_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    /// True when `payload` satisfies every condition.
    #[must_use]
    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|cond| match cond {
            Condition::Eq(field, value) => payload.get(field) == Some(value),
            Condition::AnyOf(field, values) => payload
                .get(field)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
        })
    }
}

/// Payload stored with every code-chunk point. Carries enough to render a
/// search result without a second metadata fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub file_id: String,
    pub folder_id: String,
    pub folder_path: String,
    pub file_path: String,
    pub relative_path: String,
    pub language: String,
    pub chunk_index: u32,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
}

impl ChunkPayload {
    /// The deterministic point id for this chunk.
    #[must_use]
    pub fn point_id(&self) -> String {
        point_id(&self.file_id, self.chunk_index)
    }

    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload does not have the chunk shape.
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// Vector store capability set: idempotent upsert by id, filtered
/// deletes, cosine similarity search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if absent (cosine metric, `dim` dimensions).
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()>;

    /// Upsert points; idempotent on point id.
    async fn upsert_points(&self, name: &str, points: Vec<VectorPoint>) -> Result<()>;

    /// Delete specific points by id.
    async fn delete_points(&self, name: &str, ids: &[String]) -> Result<()>;

    /// Delete every point whose payload matches the filter.
    async fn delete_by_filter(&self, name: &str, filter: &PointFilter) -> Result<()>;

    /// Similarity search, best-first. Scores are cosine in [-1, 1].
    async fn search(
        &self,
        name: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&PointFilter>,
    ) -> Result<Vec<ScoredPoint>>;
}

// ---------------------------------------------------------------------------
// HTTP implementation (Qdrant-style REST)
// ---------------------------------------------------------------------------

/// REST vector store client. Collection, point, and search routes follow
/// the Qdrant HTTP layout; the optional api key travels as `api-key`.
pub struct HttpVectorStore {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpVectorStore {
    #[must_use]
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::VectorUnavailable(format!("{what}: {e}")))?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(Error::VectorUnavailable(format!("{what}: HTTP {status}")));
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::VectorRejected(format!("{what}: HTTP {status}: {detail}")));
        }
        resp.json()
            .await
            .map_err(|e| Error::VectorRejected(format!("{what}: malformed response: {e}")))
    }

    fn filter_json(filter: &PointFilter) -> Value {
        let must: Vec<Value> = filter
            .must
            .iter()
            .map(|cond| match cond {
                Condition::Eq(field, value) => serde_json::json!({
                    "key": field,
                    "match": { "value": value },
                }),
                Condition::AnyOf(field, values) => serde_json::json!({
                    "key": field,
                    "match": { "any": values },
                }),
            })
            .collect();
        serde_json::json!({ "must": must })
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        // Existence probe first; PUT only on 404 so re-runs never disturb
        // a live collection.
        let probe = self
            .request(reqwest::Method::GET, &format!("/collections/{name}"))
            .send()
            .await
            .map_err(|e| Error::VectorUnavailable(format!("collection probe: {e}")))?;

        if probe.status().is_success() {
            return Ok(());
        }
        if probe.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::VectorUnavailable(format!(
                "collection probe: HTTP {}",
                probe.status()
            )));
        }

        let body = serde_json::json!({
            "vectors": { "size": dim, "distance": "Cosine" },
        });
        self.send(
            self.request(reqwest::Method::PUT, &format!("/collections/{name}"))
                .json(&body),
            "create collection",
        )
        .await?;
        debug!(collection = name, dim = dim, "Created vector collection");
        Ok(())
    }

    async fn upsert_points(&self, name: &str, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "points": points });
        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!("/collections/{name}/points?wait=true"),
            )
            .json(&body),
            "upsert points",
        )
        .await?;
        Ok(())
    }

    async fn delete_points(&self, name: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "points": ids });
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{name}/points/delete?wait=true"),
            )
            .json(&body),
            "delete points",
        )
        .await?;
        Ok(())
    }

    async fn delete_by_filter(&self, name: &str, filter: &PointFilter) -> Result<()> {
        if filter.is_empty() {
            return Err(Error::VectorRejected(
                "refusing unfiltered delete of entire collection".into(),
            ));
        }
        let body = serde_json::json!({ "filter": Self::filter_json(filter) });
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{name}/points/delete?wait=true"),
            )
            .json(&body),
            "delete by filter",
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&PointFilter>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = serde_json::json!({
            "vector": query,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(f) = filter {
            if !f.is_empty() {
                body["filter"] = Self::filter_json(f);
            }
        }

        let raw = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{name}/points/search"),
                )
                .json(&body),
                "search",
            )
            .await?;

        let hits = raw
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::VectorRejected("search: missing result array".into()))?;

        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let id = hit
                .get("id")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            let score = hit.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
            let payload = hit.get("payload").cloned().unwrap_or(Value::Null);
            out.push(ScoredPoint { id, score, payload });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory vector store with brute-force cosine search. Used by tests;
/// the `unavailable` switch simulates an outage for quarantine paths.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: DashMap<String, HashMap<String, (Vec<f32>, Value)>>,
    unavailable: AtomicBool,
}

impl MemoryVectorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `VectorUnavailable`.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::VectorUnavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    /// Number of points in a collection (tests).
    #[must_use]
    pub fn point_count(&self, name: &str) -> usize {
        self.collections.get(name).map_or(0, |c| c.len())
    }

    /// Ids currently stored in a collection, sorted (tests).
    #[must_use]
    pub fn point_ids(&self, name: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .collections
            .get(name)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, _dim: usize) -> Result<()> {
        self.check_up()?;
        self.collections.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn upsert_points(&self, name: &str, points: Vec<VectorPoint>) -> Result<()> {
        self.check_up()?;
        let mut coll = self.collections.entry(name.to_string()).or_default();
        for p in points {
            coll.insert(p.id, (p.vector, p.payload));
        }
        Ok(())
    }

    async fn delete_points(&self, name: &str, ids: &[String]) -> Result<()> {
        self.check_up()?;
        if let Some(mut coll) = self.collections.get_mut(name) {
            for id in ids {
                coll.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_by_filter(&self, name: &str, filter: &PointFilter) -> Result<()> {
        self.check_up()?;
        if filter.is_empty() {
            return Err(Error::VectorRejected(
                "refusing unfiltered delete of entire collection".into(),
            ));
        }
        if let Some(mut coll) = self.collections.get_mut(name) {
            coll.retain(|_, (_, payload)| !filter.matches(payload));
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&PointFilter>,
    ) -> Result<Vec<ScoredPoint>> {
        self.check_up()?;
        let Some(coll) = self.collections.get(name) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredPoint> = coll
            .iter()
            .filter(|(_, (_, payload))| filter.is_none_or(|f| f.matches(payload)))
            .map(|(id, (vector, payload))| ScoredPoint {
                id: id.clone(),
                score: cosine(query, vector),
                payload: payload.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(id: &str, vector: Vec<f32>, file_id: &str) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            vector,
            payload: serde_json::json!({ "fileId": file_id, "folderId": "folder-1" }),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_id() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("code_index", 2).await.unwrap();
        store
            .upsert_points("code_index", vec![pt("f1:0", vec![1.0, 0.0], "f1")])
            .await
            .unwrap();
        store
            .upsert_points("code_index", vec![pt("f1:0", vec![0.0, 1.0], "f1")])
            .await
            .unwrap();
        assert_eq!(store.point_count("code_index"), 1);
    }

    #[tokio::test]
    async fn delete_by_filter_removes_file_points_only() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("code_index", 2).await.unwrap();
        store
            .upsert_points(
                "code_index",
                vec![
                    pt("f1:0", vec![1.0, 0.0], "f1"),
                    pt("f1:1", vec![1.0, 0.0], "f1"),
                    pt("f2:0", vec![0.0, 1.0], "f2"),
                ],
            )
            .await
            .unwrap();

        store
            .delete_by_filter("code_index", &PointFilter::for_file("f1"))
            .await
            .unwrap();
        assert_eq!(store.point_ids("code_index"), vec!["f2:0"]);
    }

    #[tokio::test]
    async fn unfiltered_delete_is_rejected() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("code_index", 2).await.unwrap();
        let err = store
            .delete_by_filter("code_index", &PointFilter::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VECTOR_REJECTED");
    }

    #[tokio::test]
    async fn search_orders_by_descending_similarity() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("code_index", 2).await.unwrap();
        store
            .upsert_points(
                "code_index",
                vec![
                    pt("f1:0", vec![1.0, 0.0], "f1"),
                    pt("f2:0", vec![0.7, 0.7], "f2"),
                    pt("f3:0", vec![0.0, 1.0], "f3"),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .search("code_index", &[1.0, 0.0], 10, None)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["f1:0", "f2:0", "f3:0"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn search_respects_filter() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("code_index", 2).await.unwrap();
        store
            .upsert_points(
                "code_index",
                vec![
                    pt("f1:0", vec![1.0, 0.0], "f1"),
                    pt("f2:0", vec![1.0, 0.0], "f2"),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .search(
                "code_index",
                &[1.0, 0.0],
                10,
                Some(&PointFilter::for_file("f2")),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "f2:0");
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("code_index", 2).await.unwrap();
        store.set_unavailable(true);
        let err = store
            .upsert_points("code_index", vec![pt("f1:0", vec![1.0, 0.0], "f1")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VECTOR_UNAVAILABLE");
        assert!(err.is_transient());
    }

    #[test]
    fn chunk_payload_round_trips() {
        let payload = ChunkPayload {
            file_id: "f1".into(),
            folder_id: "d1".into(),
            folder_path: "/ws/m0".into(),
            file_path: "/ws/m0/auth.go".into(),
            relative_path: "auth.go".into(),
            language: "go".into(),
            chunk_index: 2,
            start_line: 401,
            end_line: 430,
            content: "func validateJWT() {}".into(),
        };
        assert_eq!(payload.point_id(), "f1:2");
        let back = ChunkPayload::from_value(&payload.to_value()).unwrap();
        assert_eq!(back.chunk_index, 2);
        assert_eq!(back.relative_path, "auth.go");
    }
}
