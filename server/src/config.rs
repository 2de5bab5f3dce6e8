//! Runtime configuration.
//!
//! Settings come from an optional `devatlas.toml` overlaid with `DEVATLAS_*`
//! environment variables (env wins). Only missing *required* settings fail
//! startup; everything else has a workable default.

use crate::error::{Error, Result};
use crate::pathmap::PathMapper;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default vector collection for code chunks.
pub const CODE_COLLECTION: &str = "code_index";

/// Environment variable carrying `host:container` mount pairs.
pub const MOUNT_PATHS_ENV: &str = "DEVATLAS_MOUNT_PATHS";

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved configuration used to wire up the server.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path (`:memory:` accepted for tests).
    pub db_path: PathBuf,
    /// Vector store base URL, e.g. `http://localhost:6333`.
    pub vector_url: String,
    pub vector_api_key: Option<String>,
    /// Embedding endpoint base URL (OpenAI-compatible `/embeddings`).
    pub embedding_url: String,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    /// Vector dimensionality; must match the embedding model.
    pub embedding_dim: usize,
    /// LLM endpoint base URL (OpenAI-compatible chat completions).
    pub llm_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,
    pub llm_reasoning: bool,
    /// Per-request LLM timeout in seconds.
    pub llm_timeout_secs: u64,
    /// Raw `host:container` mapping spec (see [`MOUNT_PATHS_ENV`]).
    pub mount_paths: String,
    /// Bind address for serve mode.
    pub bind_addr: String,
    pub port: u16,
}

impl Config {
    /// Load configuration: defaults ← `devatlas.toml` (if present) ← env.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a required setting is missing or a
    /// numeric value fails to parse.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let file = match config_file {
            Some(path) => FileConfig::read(path)?,
            None => {
                let default = Path::new("devatlas.toml");
                if default.exists() {
                    FileConfig::read(default)?
                } else {
                    FileConfig::default()
                }
            }
        };

        let db_path = env_or("DEVATLAS_DB_PATH", file.metadata.and_then(|m| m.path))
            .unwrap_or_else(|| "devatlas.db".to_string());

        let vector = file.vector.unwrap_or_default();
        let vector_url = env_or("DEVATLAS_VECTOR_URL", vector.url)
            .ok_or_else(|| Error::Config("vector store URL is required (DEVATLAS_VECTOR_URL)".into()))?;

        let embedding = file.embedding.unwrap_or_default();
        let embedding_url = env_or("DEVATLAS_EMBEDDING_URL", embedding.url).ok_or_else(|| {
            Error::Config("embedding endpoint URL is required (DEVATLAS_EMBEDDING_URL)".into())
        })?;
        let embedding_dim = parse_env("DEVATLAS_EMBEDDING_DIM", embedding.dim)?.unwrap_or(1536);
        if embedding_dim == 0 {
            return Err(Error::Config("embedding dimension must be positive".into()));
        }

        let llm = file.llm.unwrap_or_default();

        Ok(Self {
            db_path: PathBuf::from(db_path),
            vector_url,
            vector_api_key: env_or("DEVATLAS_VECTOR_API_KEY", vector.api_key),
            embedding_url,
            embedding_api_key: env_or("DEVATLAS_EMBEDDING_API_KEY", embedding.api_key),
            embedding_model: env_or("DEVATLAS_EMBEDDING_MODEL", embedding.model)
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            embedding_dim,
            llm_url: env_or("DEVATLAS_LLM_URL", llm.url),
            llm_api_key: env_or("DEVATLAS_LLM_API_KEY", llm.api_key),
            llm_model: env_or("DEVATLAS_LLM_MODEL", llm.model)
                .unwrap_or_else(|| "gpt-4o".to_string()),
            llm_max_tokens: parse_env("DEVATLAS_LLM_MAX_TOKENS", llm.max_tokens)?.unwrap_or(4096),
            llm_temperature: parse_env("DEVATLAS_LLM_TEMPERATURE", llm.temperature)?.unwrap_or(0.2),
            llm_reasoning: parse_env("DEVATLAS_LLM_REASONING", llm.reasoning)?.unwrap_or(false),
            llm_timeout_secs: parse_env("DEVATLAS_LLM_TIMEOUT_SECS", llm.timeout_secs)?
                .unwrap_or(120),
            mount_paths: std::env::var(MOUNT_PATHS_ENV).unwrap_or_default(),
            bind_addr: env_or("DEVATLAS_BIND", None).unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_env("PORT", None)?.unwrap_or(8571),
        })
    }

    /// Build the path mapper from the configured mount spec.
    #[must_use]
    pub fn path_mapper(&self) -> PathMapper {
        PathMapper::parse(&self.mount_paths)
    }
}

// ---------------------------------------------------------------------------
// devatlas.toml shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    metadata: Option<MetadataSection>,
    vector: Option<VectorSection>,
    embedding: Option<EmbeddingSection>,
    llm: Option<LlmSection>,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataSection {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VectorSection {
    url: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingSection {
    url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    dim: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmSection {
    url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    reasoning: Option<bool>,
    timeout_secs: Option<u64>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, fallback: Option<String>) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).or(fallback)
}

fn parse_env<T: std::str::FromStr>(key: &str, fallback: Option<T>) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("cannot parse {key}={raw}"))),
        _ => Ok(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_config_parses_all_sections() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
[metadata]
path = "/data/atlas.db"

[vector]
url = "http://localhost:6333"

[embedding]
url = "http://localhost:8080"
model = "nomic-embed-text"
dim = 768

[llm]
model = "gpt-4o-mini"
temperature = 0.7
reasoning = true
"#
        )
        .unwrap();

        let parsed = FileConfig::read(f.path()).unwrap();
        assert_eq!(parsed.metadata.unwrap().path.as_deref(), Some("/data/atlas.db"));
        assert_eq!(parsed.embedding.as_ref().unwrap().dim, Some(768));
        assert_eq!(parsed.llm.as_ref().unwrap().reasoning, Some(true));
    }

    #[test]
    fn malformed_file_is_config_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "not [valid toml").unwrap();
        let err = FileConfig::read(f.path()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");
    }
}
