use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::retry::RetryPolicy;

/// Process settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
  pub openai_api_key: String,
  pub openai_base_url: String,
  pub embedding_model: String,
  pub pinecone_api_key: String,
  pub pinecone_host: String,
  pub pinecone_index: String,
  pub pinecone_namespace: String,
  pub database_path: PathBuf,
  pub upload_dir: PathBuf,
  pub api_host: String,
  pub api_port: u16,
  pub tokenizer: String,
  pub tokenizer_file: Option<PathBuf>,
  pub retrieval_top_k: usize,
  pub http_timeout: Duration,
  pub retry: RetryPolicy,
}

impl Settings {
  pub fn from_env() -> anyhow::Result<Self> {
    let settings = Self {
      openai_api_key: required("OPENAI_API_KEY")?,
      openai_base_url: optional("OPENAI_BASE_URL", "https://api.openai.com/v1"),
      embedding_model: optional("EMBEDDING_MODEL", "text-embedding-ada-002"),
      pinecone_api_key: required("PINECONE_API_KEY")?,
      pinecone_host: required("PINECONE_HOST")?,
      pinecone_index: optional("PINECONE_INDEX", "chat-os"),
      pinecone_namespace: optional("PINECONE_NAMESPACE", ""),
      database_path: optional("DATABASE_PATH", "chatos.sqlite3").into(),
      upload_dir: optional("UPLOAD_DIR", "./files").into(),
      api_host: optional("API_HOST", "127.0.0.1"),
      api_port: parsed("API_PORT", 5000)?,
      tokenizer: optional("TOKENIZER", "gpt2"),
      tokenizer_file: env::var("TOKENIZER_FILE").ok().map(PathBuf::from),
      retrieval_top_k: parsed("RETRIEVAL_TOP_K", 4)?,
      http_timeout: Duration::from_secs(parsed("HTTP_TIMEOUT_SECONDS", 60)?),
      retry: RetryPolicy {
        max_attempts: parsed("RETRY_MAX_ATTEMPTS", 3)?,
        base_delay: Duration::from_millis(parsed("RETRY_BASE_DELAY_MS", 250)?),
        ..RetryPolicy::default()
      },
    };

    info!(
      "Settings loaded: index {} at {}, top_k {}, timeout {:?}",
      settings.pinecone_index, settings.pinecone_host, settings.retrieval_top_k, settings.http_timeout
    );
    Ok(settings)
  }

  /// Optional log file, read before the subscriber is installed.
  pub fn log_path() -> Option<PathBuf> {
    env::var("LOG_PATH").ok().map(PathBuf::from)
  }

  pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", self.api_host, self.api_port)
      .parse()
      .with_context(|| format!("invalid bind address {}:{}", self.api_host, self.api_port))
  }
}

fn required(key: &str) -> anyhow::Result<String> {
  let value = env::var(key).with_context(|| format!("{key} environment variable not set"))?;
  if value.trim().is_empty() {
    anyhow::bail!("{key} environment variable is empty");
  }
  Ok(value)
}

fn optional(key: &str, default: &str) -> String {
  env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match env::var(key) {
    Ok(raw) => raw
      .trim()
      .parse()
      .with_context(|| format!("{key} has an invalid value: {raw:?}")),
    Err(_) => Ok(default),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parsed_falls_back_to_default() {
    let value: u16 = parsed("CHATOS_TEST_UNSET_PORT", 5000).expect("default");
    assert_eq!(value, 5000);
  }

  #[test]
  fn parsed_reports_bad_values() {
    env::set_var("CHATOS_TEST_BAD_TOP_K", "four");
    let err = parsed::<usize>("CHATOS_TEST_BAD_TOP_K", 4).unwrap_err();
    assert!(err.to_string().contains("CHATOS_TEST_BAD_TOP_K"));
  }

  #[test]
  fn required_rejects_blank() {
    env::set_var("CHATOS_TEST_BLANK_KEY", "  ");
    assert!(required("CHATOS_TEST_BLANK_KEY").is_err());
    assert!(required("CHATOS_TEST_MISSING_KEY").is_err());
  }
}
