//! Knowledge-base tools: named collections of embedded notes living in
//! the vector store, with usage counters backing popularity ranking.

use super::{Tool, optional_u64, require_str};
use crate::embed::EmbeddingClient;
use crate::error::{Error, Result};
use crate::store::MetaStore;
use crate::types::new_id;
use crate::vector::{VectorPoint, VectorStore};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;

/// Prefix separating knowledge collections from the code index.
const KNOWLEDGE_PREFIX: &str = "knowledge_";

/// Register the knowledge tool family.
pub fn register_knowledge_tools(
    registry: &mut super::ToolRegistry,
    store: Arc<MetaStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
) -> Result<()> {
    registry.register(Arc::new(KnowledgeUpsertTool {
        store: Arc::clone(&store),
        vectors: Arc::clone(&vectors),
        embedder: Arc::clone(&embedder),
    }))?;
    registry.register(Arc::new(KnowledgeQueryTool {
        store: Arc::clone(&store),
        vectors,
        embedder,
    }))?;
    registry.register(Arc::new(PopularCollectionsTool { store }))?;
    Ok(())
}

fn collection_name(tool: &str, raw: &str) -> Result<String> {
    let valid = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(Error::Tool {
            tool: tool.to_string(),
            message: format!(
                "invalid collection name '{raw}' (lowercase letters, digits, '_', '-')"
            ),
        });
    }
    Ok(format!("{KNOWLEDGE_PREFIX}{raw}"))
}

// ---------------------------------------------------------------------------
// knowledge_upsert
// ---------------------------------------------------------------------------

struct KnowledgeUpsertTool {
    store: Arc<MetaStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
}

#[async_trait]
impl Tool for KnowledgeUpsertTool {
    fn name(&self) -> &'static str {
        "knowledge_upsert"
    }

    fn description(&self) -> &'static str {
        "Store notes in a named knowledge collection for later semantic retrieval. Creates the \
         collection on first use."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "collection": { "type": "string", "description": "Collection name, e.g. 'deploys'" },
                "entries": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "text": { "type": "string" },
                            "metadata": { "type": "object" }
                        },
                        "required": ["text"]
                    }
                }
            },
            "required": ["collection", "entries"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let raw_name = require_str(&args, "collection", self.name())?;
        let collection = collection_name(self.name(), raw_name)?;
        let entries = args
            .get("entries")
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::Tool {
                tool: self.name().to_string(),
                message: "entries must be a non-empty array".to_string(),
            })?;

        let texts: Vec<String> = entries
            .iter()
            .map(|e| {
                e.get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| Error::Tool {
                        tool: self.name().to_string(),
                        message: "every entry needs a 'text' field".to_string(),
                    })
            })
            .collect::<Result<_>>()?;

        self.vectors
            .ensure_collection(&collection, self.embedder.dimensions())
            .await?;
        let vectors = self.embedder.embed_batch(&texts).await?;

        let now = Utc::now().to_rfc3339();
        let points: Vec<VectorPoint> = texts
            .iter()
            .zip(vectors)
            .zip(entries)
            .map(|((text, vector), entry)| VectorPoint {
                id: new_id(),
                vector,
                payload: json!({
                    "collection": raw_name,
                    "text": text,
                    "metadata": entry.get("metadata").cloned().unwrap_or(Value::Null),
                    "createdAt": now,
                }),
            })
            .collect();
        let added = points.len() as u64;
        self.vectors.upsert_points(&collection, points).await?;
        self.store.record_knowledge_upsert(raw_name, added).await?;

        Ok(json!({ "collection": raw_name, "stored": added }))
    }
}

// ---------------------------------------------------------------------------
// knowledge_query
// ---------------------------------------------------------------------------

struct KnowledgeQueryTool {
    store: Arc<MetaStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
}

#[async_trait]
impl Tool for KnowledgeQueryTool {
    fn name(&self) -> &'static str {
        "knowledge_query"
    }

    fn description(&self) -> &'static str {
        "Search a knowledge collection by semantic similarity; returns the best-matching notes \
         with scores."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "collection": { "type": "string" },
                "query": { "type": "string" },
                "limit": { "type": "integer", "description": "Max results (default 5)" }
            },
            "required": ["collection", "query"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let raw_name = require_str(&args, "collection", self.name())?;
        let collection = collection_name(self.name(), raw_name)?;
        let query = require_str(&args, "query", self.name())?;
        let limit = optional_u64(&args, "limit").unwrap_or(5).clamp(1, 25) as usize;

        let query_vector = self.embedder.embed(query).await?;
        let hits = self
            .vectors
            .search(&collection, &query_vector, limit, None)
            .await?;
        self.store.record_knowledge_query(raw_name).await?;

        let results: Vec<Value> = hits
            .into_iter()
            .map(|h| {
                json!({
                    "text": h.payload.get("text").cloned().unwrap_or(Value::Null),
                    "metadata": h.payload.get("metadata").cloned().unwrap_or(Value::Null),
                    "score": h.score,
                })
            })
            .collect();
        let count = results.len();
        Ok(json!({ "collection": raw_name, "results": results, "count": count }))
    }
}

// ---------------------------------------------------------------------------
// popular_collections
// ---------------------------------------------------------------------------

struct PopularCollectionsTool {
    store: Arc<MetaStore>,
}

#[async_trait]
impl Tool for PopularCollectionsTool {
    fn name(&self) -> &'static str {
        "popular_collections"
    }

    fn description(&self) -> &'static str {
        "List knowledge collections ranked by query volume."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max collections (default 10)" }
            }
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let limit = optional_u64(&args, "limit").unwrap_or(10).clamp(1, 100) as u32;
        let collections = self.store.popular_collections(limit).await?;
        Ok(json!({ "collections": collections }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbeddingClient;
    use crate::tools::ToolRegistry;
    use crate::vector::MemoryVectorStore;

    fn registry() -> ToolRegistry {
        let store = Arc::new(MetaStore::in_memory().unwrap());
        let vectors: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbeddingClient::new(64));
        let mut registry = ToolRegistry::new();
        register_knowledge_tools(&mut registry, store, vectors, embedder).unwrap();
        registry
    }

    #[tokio::test]
    async fn upsert_then_query_round_trip() {
        let registry = registry();
        let stored = registry
            .execute(
                "c1",
                "knowledge_upsert",
                json!({
                    "collection": "deploys",
                    "entries": [
                        { "text": "deploy the api with the blue-green script" },
                        { "text": "rollback by promoting the previous color" }
                    ]
                }),
            )
            .await;
        assert!(!stored.is_error(), "{:?}", stored.error);
        assert_eq!(stored.output.as_ref().unwrap()["stored"], 2);

        let queried = registry
            .execute(
                "c2",
                "knowledge_query",
                json!({ "collection": "deploys", "query": "blue-green deploy script" }),
            )
            .await;
        assert!(!queried.is_error());
        let out = queried.output.unwrap();
        assert!(out["count"].as_u64().unwrap() >= 1);
        assert!(
            out["results"][0]["text"]
                .as_str()
                .unwrap()
                .contains("blue-green")
        );
    }

    #[tokio::test]
    async fn popularity_reflects_query_volume() {
        let registry = registry();
        for name in ["deploys", "oncall"] {
            registry
                .execute(
                    "c",
                    "knowledge_upsert",
                    json!({ "collection": name, "entries": [{ "text": "note" }] }),
                )
                .await;
        }
        for _ in 0..3 {
            registry
                .execute(
                    "c",
                    "knowledge_query",
                    json!({ "collection": "oncall", "query": "note" }),
                )
                .await;
        }

        let popular = registry.execute("c", "popular_collections", json!({})).await;
        let collections = popular.output.unwrap()["collections"].as_array().unwrap().clone();
        assert_eq!(collections[0]["name"], "oncall");
    }

    #[tokio::test]
    async fn invalid_collection_name_rejected() {
        let registry = registry();
        let result = registry
            .execute(
                "c1",
                "knowledge_upsert",
                json!({ "collection": "Bad Name!", "entries": [{ "text": "x" }] }),
            )
            .await;
        assert!(result.is_error());
        assert!(result.error.unwrap().contains("invalid collection name"));
    }
}
