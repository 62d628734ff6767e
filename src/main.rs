mod chunker;
mod config;
mod error;
mod extract;
mod ingest;
mod logger;
mod models;
mod openai;
mod pinecone;
mod responder;
mod retry;
mod router;
mod settings;
mod storage;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use chunker::{HfTokenCounter, TokenCounter};
use ingest::Ingestor;
use openai::{OpenAiClient, OpenAiConfig};
use pinecone::{PineconeConfig, PineconeIndex};
use responder::Responder;
use router::{run_router, RouterState};
use settings::Settings;
use storage::ConfigStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let dotenv = dotenvy::dotenv();
  logger::init(Settings::log_path().as_deref())?;
  match dotenv {
    Ok(path) => info!("Loaded environment variables from {}", path.display()),
    Err(err) => warn!("No .env file loaded ({err}); using process environment"),
  }

  let settings = Settings::from_env()?;
  let store = ConfigStore::open(&settings.database_path)
    .with_context(|| format!("failed to open {}", settings.database_path.display()))?;

  let tokens: Arc<dyn TokenCounter> = match settings.tokenizer_file.clone() {
    Some(path) => Arc::new(HfTokenCounter::from_file(&path)?),
    None => {
      let id = settings.tokenizer.clone();
      Arc::new(tokio::task::spawn_blocking(move || HfTokenCounter::from_pretrained(&id)).await??)
    }
  };
  info!("Tokenizer ready");

  let http = reqwest::Client::builder()
    .timeout(settings.http_timeout)
    .build()
    .context("failed to build HTTP client")?;
  let openai = Arc::new(OpenAiClient::new(
    http.clone(),
    OpenAiConfig {
      api_key: settings.openai_api_key.clone(),
      base_url: settings.openai_base_url.clone(),
      embedding_model: settings.embedding_model.clone(),
    },
    settings.retry.clone(),
  ));
  let index = Arc::new(PineconeIndex::new(
    http,
    PineconeConfig {
      api_key: settings.pinecone_api_key.clone(),
      host: settings.pinecone_host.clone(),
      namespace: settings.pinecone_namespace.clone(),
    },
    settings.retry.clone(),
  ));

  let state = RouterState {
    store,
    responder: Responder::new(openai.clone(), openai.clone(), index.clone(), settings.retrieval_top_k),
    ingestor: Ingestor::new(openai, index, tokens),
    upload_dir: settings.upload_dir.clone(),
  };

  let listener = tokio::net::TcpListener::bind(settings.bind_addr()?).await?;
  info!("ChatOS backend listening on {}", listener.local_addr()?);
  run_router(listener, state).await
}
