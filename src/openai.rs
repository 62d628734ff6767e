use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::ChatMessage;
use crate::retry::{self, RetryPolicy};

/// Embedding inputs sent per request.
const EMBEDDING_BATCH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum OpenAiError {
  #[error("HTTP error: {0}")]
  Http(#[from] reqwest::Error),
  #[error("API error: {status} - {message}")]
  Api { status: u16, message: String },
  #[error("Parse error: {0}")]
  Parse(String),
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CompletionRequest {
  pub model: String,
  pub messages: Vec<ChatMessage>,
  pub temperature: f64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_tokens: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub n: Option<u32>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
  /// Returns the content of the first completion choice.
  async fn complete(&self, request: &CompletionRequest) -> Result<String, OpenAiError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
  /// One vector per input, in input order.
  async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OpenAiError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
  pub api_key: String,
  pub base_url: String,
  pub embedding_model: String,
}

/// Client for the hosted chat-completion and embeddings endpoints.
pub struct OpenAiClient {
  http: Client,
  config: OpenAiConfig,
  retry: RetryPolicy,
}

#[derive(Deserialize)]
struct CompletionResponse {
  choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
  message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
  content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
  model: &'a str,
  input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
  data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
  index: usize,
  embedding: Vec<f32>,
}

impl OpenAiClient {
  pub fn new(http: Client, config: OpenAiConfig, retry: RetryPolicy) -> Self {
    Self { http, config, retry }
  }

  fn headers(&self) -> Result<HeaderMap, OpenAiError> {
    let mut headers = HeaderMap::new();
    let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
      .map_err(|err| OpenAiError::Parse(err.to_string()))?;
    headers.insert(AUTHORIZATION, bearer);
    Ok(headers)
  }

  fn url(&self, path: &str) -> String {
    format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
  }

  async fn post_json<B: Serialize + ?Sized>(
    &self,
    path: &str,
    body: &B,
  ) -> Result<reqwest::Response, OpenAiError> {
    let request = self.http.post(self.url(path)).headers(self.headers()?).json(body);
    let resp = retry::send(request, &self.retry, "openai").await?;
    if !resp.status().is_success() {
      let status = resp.status().as_u16();
      let message = resp.text().await.unwrap_or_default();
      return Err(OpenAiError::Api { status, message });
    }
    Ok(resp)
  }

  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OpenAiError> {
    let body = EmbeddingRequest {
      model: &self.config.embedding_model,
      input: texts,
    };
    let resp = self.post_json("embeddings", &body).await?;
    let mut data = resp.json::<EmbeddingResponse>().await?.data;
    if data.len() != texts.len() {
      return Err(OpenAiError::Parse(format!(
        "expected {} embeddings, got {}",
        texts.len(),
        data.len()
      )));
    }
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
  }
}

#[async_trait]
impl ChatModel for OpenAiClient {
  async fn complete(&self, request: &CompletionRequest) -> Result<String, OpenAiError> {
    debug!("completion: model {} with {} messages", request.model, request.messages.len());
    let resp = self.post_json("chat/completions", request).await?;
    let body = resp.json::<CompletionResponse>().await?;
    body
      .choices
      .into_iter()
      .next()
      .map(|choice| choice.message.content.unwrap_or_default())
      .ok_or_else(|| OpenAiError::Parse("completion returned no choices".to_string()))
  }
}

#[async_trait]
impl Embedder for OpenAiClient {
  async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OpenAiError> {
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(EMBEDDING_BATCH) {
      vectors.extend(self.embed_batch(batch).await?);
    }
    Ok(vectors)
  }
}
