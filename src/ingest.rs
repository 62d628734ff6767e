use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crate::chunker::{DocumentChunk, TextSplitter, TokenCounter};
use crate::error::AppError;
use crate::extract::extract_pdf_text;
use crate::openai::Embedder;
use crate::pinecone::{IndexRecord, VectorIndex};

/// Turns uploaded documents into vectors in the external index.
pub struct Ingestor {
  embedder: Arc<dyn Embedder>,
  index: Arc<dyn VectorIndex>,
  tokens: Arc<dyn TokenCounter>,
  splitter: TextSplitter,
}

impl Ingestor {
  pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, tokens: Arc<dyn TokenCounter>) -> Self {
    Self {
      embedder,
      index,
      tokens,
      splitter: TextSplitter::default(),
    }
  }

  /// Extracts, chunks, embeds and upserts one PDF. Returns the number of vectors written.
  pub async fn ingest_pdf(&self, path: PathBuf, source: String) -> Result<usize, AppError> {
    let tokens = self.tokens.clone();
    let splitter = self.splitter.clone();
    let chunks = tokio::task::spawn_blocking(move || {
      let text = extract_pdf_text(&path)?;
      info!("Text parsing done: {} characters from {source}", text.len());
      Ok::<_, AppError>(splitter.chunk_document(&text, &source, tokens.as_ref()))
    })
    .await
    .map_err(|err| AppError::Document(format!("extraction task failed: {err}")))??;

    if chunks.is_empty() {
      return Err(AppError::Document("no extractable text".to_string()));
    }
    self.index_chunks(chunks).await
  }

  pub async fn index_chunks(&self, chunks: Vec<DocumentChunk>) -> Result<usize, AppError> {
    info!("Embedding {} chunks", chunks.len());
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = self.embedder.embed(&texts).await?;
    if vectors.len() != chunks.len() {
      return Err(AppError::Upstream {
        service: "openai",
        message: format!("expected {} embeddings, got {}", chunks.len(), vectors.len()),
      });
    }

    let records = chunks
      .into_iter()
      .zip(vectors)
      .map(|(chunk, values)| {
        let mut metadata = Map::new();
        metadata.insert("text".to_string(), Value::String(chunk.text));
        metadata.insert("source".to_string(), Value::String(chunk.source));
        IndexRecord {
          id: uuid::Uuid::new_v4().to_string(),
          values,
          metadata,
        }
      })
      .collect();

    let written = self.index.upsert(records).await?;
    info!("Sent {written} vectors to the index");
    Ok(written)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::responder::tests::{CountingEmbedder, MemoryIndex};
  use std::io::Write;
  use std::sync::atomic::Ordering;

  struct WordCounter;

  impl TokenCounter for WordCounter {
    fn count(&self, text: &str) -> usize {
      text.split_whitespace().count()
    }
  }

  fn ingestor(index: Arc<MemoryIndex>, embedder: Arc<CountingEmbedder>) -> Ingestor {
    Ingestor::new(embedder, index, Arc::new(WordCounter))
  }

  #[tokio::test]
  async fn chunks_become_records_with_metadata() {
    let index = Arc::new(MemoryIndex::default());
    let embedder = Arc::new(CountingEmbedder::default());
    let chunks = vec![
      DocumentChunk { text: "first part".into(), source: "guide.pdf".into() },
      DocumentChunk { text: "second part".into(), source: "guide.pdf".into() },
    ];

    let written = ingestor(index.clone(), embedder.clone())
      .index_chunks(chunks)
      .await
      .expect("index");
    assert_eq!(written, 2);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

    let records = index.records.lock().unwrap();
    assert_eq!(records[0].metadata["text"], "first part");
    assert_eq!(records[1].metadata["source"], "guide.pdf");
    assert_eq!(records[0].values, vec![10.0, 1.0]);
    assert_ne!(records[0].id, records[1].id);
  }

  #[tokio::test]
  async fn repeated_ingestion_appends() {
    let index = Arc::new(MemoryIndex::default());
    let ingestor = ingestor(index.clone(), Arc::new(CountingEmbedder::default()));
    for _ in 0..2 {
      let chunk = DocumentChunk { text: "same".into(), source: "a.pdf".into() };
      ingestor.index_chunks(vec![chunk]).await.expect("index");
    }
    assert_eq!(index.records.lock().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn malformed_pdf_is_document_error() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(b"%PDF-1.4 garbage").expect("write");
    let index = Arc::new(MemoryIndex::default());

    let err = ingestor(index.clone(), Arc::new(CountingEmbedder::default()))
      .ingest_pdf(file.path().to_path_buf(), "broken.pdf".into())
      .await
      .unwrap_err();
    assert!(matches!(err, AppError::Document(_)));
    assert!(index.records.lock().unwrap().is_empty());
  }
}
