//! Smart-routing index (C5): embeds tool descriptions via an OpenAI-compatible
//! endpoint, stores them in a local `rusqlite` database, and ranks tools by
//! in-process cosine similarity (§4.5).

use std::sync::{Arc, Mutex as StdMutex, Once};

use rusqlite::{params, Connection};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{
    error::{HubError, HubResult},
    registry::ExposedTool,
    settings::SmartRoutingConfig,
};

/// One ranked hit (§4.5 query contract).
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub server: String,
    pub tool_name: String,
    pub score: f32,
}

pub struct SmartIndex {
    db: Arc<StdMutex<Connection>>,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    degraded_once: Once,
}

impl SmartIndex {
    pub fn open(config: &SmartRoutingConfig) -> HubResult<Self> {
        let path = config
            .db_url
            .clone()
            .unwrap_or_else(|| "./mcphub_vectors.db".to_string());
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tool_embeddings (
                content_type TEXT NOT NULL,
                content_id   TEXT NOT NULL PRIMARY KEY,
                text_content TEXT NOT NULL,
                text_hash    TEXT NOT NULL,
                embedding    BLOB,
                updated_at   TEXT NOT NULL
            )",
        )?;

        Ok(Self {
            db: Arc::new(StdMutex::new(conn)),
            client: reqwest::Client::new(),
            base_url: config
                .openai_api_base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: config.openai_api_key.clone(),
            model: config
                .openai_api_embedding_model
                .clone()
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            degraded_once: Once::new(),
        })
    }

    /// Re-embeds every tool whose `(contentId, textContent)` pair changed
    /// since the last index pass; unchanged pairs short-circuit on the text
    /// hash (§4.5 "writes are idempotent").
    pub async fn index_tools(&self, tools: &[ExposedTool]) -> HubResult<()> {
        for tool in tools {
            let content_id = format!("{}/{}", tool.server, tool.tool_name);
            let text = embedding_text(tool);
            let hash = text_hash(&text);

            if self.existing_hash(&content_id)?.as_deref() == Some(hash.as_str()) {
                continue;
            }

            let embedding = match self.embed(&text).await {
                Ok(vector) => Some(vector),
                Err(err) => {
                    warn!(content_id = %content_id, error = %err, "smart index: embedding failed, storing without a vector");
                    None
                }
            };
            self.upsert(&content_id, &text, &hash, embedding.as_deref())?;
        }
        Ok(())
    }

    /// `search(query, k, threshold, ...)` — ranking is by cosine similarity
    /// when an embedding is available for the query and every stored row;
    /// rows with no stored embedding are not ranked and fall back to the
    /// degraded mode below (§4.5).
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        threshold: f32,
        scope_filter: impl Fn(&str, &str) -> bool,
    ) -> HubResult<Vec<SearchHit>> {
        let query_embedding = self.embed(query).await.ok();

        let rows = self.all_rows()?;
        let (with_vectors, without_vectors): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(|r| r.embedding.is_some());

        let mut hits = if let Some(query_embedding) = &query_embedding {
            if without_vectors.is_empty() {
                with_vectors
                    .iter()
                    .filter_map(|row| {
                        let (server, tool) = row.content_id.split_once('/')?;
                        if !scope_filter(server, tool) {
                            return None;
                        }
                        let score =
                            cosine_similarity(query_embedding, row.embedding.as_ref().unwrap());
                        (score >= threshold).then_some(SearchHit {
                            server: server.to_string(),
                            tool_name: tool.to_string(),
                            score,
                        })
                    })
                    .collect()
            } else {
                self.degraded_fallback(&with_vectors, &without_vectors, &scope_filter)
            }
        } else {
            self.degraded_fallback(&with_vectors, &without_vectors, &scope_filter)
        };

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// No vector operators / no usable embeddings at all: filter by
    /// content-type only and assign a placeholder similarity, logged once
    /// per process (§4.5).
    fn degraded_fallback(
        &self,
        with_vectors: &[StoredRow],
        without_vectors: &[StoredRow],
        scope_filter: &impl Fn(&str, &str) -> bool,
    ) -> Vec<SearchHit> {
        self.degraded_once.call_once(|| {
            warn!("smart index: falling back to degraded mode (no usable embeddings for one or more tools)");
        });
        with_vectors
            .iter()
            .chain(without_vectors.iter())
            .filter_map(|row| {
                let (server, tool) = row.content_id.split_once('/')?;
                scope_filter(server, tool).then_some(SearchHit {
                    server: server.to_string(),
                    tool_name: tool.to_string(),
                    score: 0.5,
                })
            })
            .collect()
    }

    fn existing_hash(&self, content_id: &str) -> HubResult<Option<String>> {
        let conn = self.db.lock().expect("smart index db mutex poisoned");
        let result = conn.query_row(
            "SELECT text_hash FROM tool_embeddings WHERE content_id = ?1",
            params![content_id],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(hash) => Ok(Some(hash)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn upsert(
        &self,
        content_id: &str,
        text: &str,
        hash: &str,
        embedding: Option<&[f32]>,
    ) -> HubResult<()> {
        let conn = self.db.lock().expect("smart index db mutex poisoned");
        conn.execute(
            "INSERT INTO tool_embeddings (content_type, content_id, text_content, text_hash, embedding, updated_at)
             VALUES ('tool', ?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(content_id) DO UPDATE SET
               text_content = excluded.text_content,
               text_hash = excluded.text_hash,
               embedding = excluded.embedding,
               updated_at = excluded.updated_at",
            params![content_id, text, hash, embedding.map(encode_embedding)],
        )?;
        Ok(())
    }

    fn all_rows(&self) -> HubResult<Vec<StoredRow>> {
        let conn = self.db.lock().expect("smart index db mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT content_id, embedding FROM tool_embeddings WHERE content_type = 'tool'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let content_id: String = row.get(0)?;
                let blob: Option<Vec<u8>> = row.get(1)?;
                Ok(StoredRow {
                    content_id,
                    embedding: blob.map(|b| decode_embedding(&b)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn embed(&self, text: &str) -> HubResult<Vec<f32>> {
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url.trim_end_matches('/')))
            .json(&serde_json::json!({ "model": self.model, "input": text }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::Upstream {
                server: "smart-routing".to_string(),
                message: format!("embeddings endpoint returned {status}: {body}"),
            });
        }
        let parsed: EmbeddingResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| HubError::Upstream {
                server: "smart-routing".to_string(),
                message: "embeddings endpoint returned no data".to_string(),
            })
    }
}

struct StoredRow {
    content_id: String,
    embedding: Option<Vec<f32>>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// `"{server}.{name}: {description}\n{input-schema-summary}"` (§4.5).
fn embedding_text(tool: &ExposedTool) -> String {
    let schema_summary = tool
        .info
        .input_schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| props.keys().cloned().collect::<Vec<_>>().join(", "))
        .unwrap_or_default();
    format!(
        "{}.{}: {}\n{}",
        tool.server, tool.tool_name, tool.info.description, schema_summary
    )
}

fn text_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_round_trips_through_blob_encoding() {
        let vector = vec![0.5_f32, -1.25, 3.0];
        let bytes = encode_embedding(&vector);
        assert_eq!(decode_embedding(&bytes), vector);
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0_f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![0.0_f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn open_creates_schema_on_a_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = SmartRoutingConfig {
            enabled: true,
            db_url: Some(dir.path().join("vectors.db").to_string_lossy().to_string()),
            openai_api_base_url: None,
            openai_api_key: None,
            openai_api_embedding_model: None,
        };
        let index = SmartIndex::open(&config).unwrap();
        assert!(index.all_rows().unwrap().is_empty());
    }
}
