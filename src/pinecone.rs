use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::retry::{self, RetryPolicy};

/// Vectors sent per upsert request.
const UPSERT_BATCH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
  #[error("HTTP error: {0}")]
  Http(#[from] reqwest::Error),
  #[error("index API error: {status} - {message}")]
  Api { status: u16, message: String },
}

/// One vector with its chunk text and source metadata.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct IndexRecord {
  pub id: String,
  pub values: Vec<f32>,
  pub metadata: Map<String, Value>,
}

/// A retrieved chunk and its similarity score.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredChunk {
  pub id: String,
  pub score: f32,
  pub text: String,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
  /// Appends records to the index, returning how many were written.
  async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize, IndexError>;

  /// Nearest neighbours of `vector`, best first.
  async fn query(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<ScoredChunk>, IndexError>;
}

#[derive(Debug, Clone)]
pub struct PineconeConfig {
  pub api_key: String,
  pub host: String,
  pub namespace: String,
}

/// Data-plane client for one hosted index, addressed by its host URL.
pub struct PineconeIndex {
  http: Client,
  config: PineconeConfig,
  retry: RetryPolicy,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
  vectors: &'a [IndexRecord],
  namespace: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertResponse {
  upserted_count: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
  vector: Vec<f32>,
  top_k: usize,
  namespace: &'a str,
  include_metadata: bool,
}

#[derive(Deserialize)]
struct QueryResponse {
  #[serde(default)]
  matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
  id: String,
  #[serde(default)]
  score: f32,
  #[serde(default)]
  metadata: Option<Map<String, Value>>,
}

impl PineconeIndex {
  pub fn new(http: Client, config: PineconeConfig, retry: RetryPolicy) -> Self {
    Self { http, config, retry }
  }

  fn url(&self, path: &str) -> String {
    let host = self.config.host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
      format!("{host}/{path}")
    } else {
      format!("https://{host}/{path}")
    }
  }

  async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response, IndexError> {
    let request = self
      .http
      .post(self.url(path))
      .header("Api-Key", &self.config.api_key)
      .json(body);
    let resp = retry::send(request, &self.retry, "pinecone").await?;
    if !resp.status().is_success() {
      let status = resp.status().as_u16();
      let message = resp.text().await.unwrap_or_default();
      return Err(IndexError::Api { status, message });
    }
    Ok(resp)
  }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
  async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize, IndexError> {
    let mut written = 0;
    for batch in records.chunks(UPSERT_BATCH) {
      let body = UpsertRequest {
        vectors: batch,
        namespace: &self.config.namespace,
      };
      let resp = self.post("vectors/upsert", &body).await?;
      let count = resp
        .json::<UpsertResponse>()
        .await?
        .upserted_count
        .unwrap_or(batch.len());
      debug!("upserted {count} vectors");
      written += count;
    }
    Ok(written)
  }

  async fn query(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
    let body = QueryRequest {
      vector,
      top_k,
      namespace: &self.config.namespace,
      include_metadata: true,
    };
    let resp = self.post("query", &body).await?;
    let matches = resp.json::<QueryResponse>().await?.matches;
    Ok(
      matches
        .into_iter()
        .filter_map(|m| {
          let text = m.metadata.as_ref()?.get("text")?.as_str()?.to_string();
          Some(ScoredChunk {
            id: m.id,
            score: m.score,
            text,
          })
        })
        .collect(),
    )
  }
}
