use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Configuration;
use crate::error::AppError;
use crate::models::{ChatMessage, Role};
use crate::openai::{ChatModel, CompletionRequest, Embedder};
use crate::pinecone::VectorIndex;

const CONDENSE_PROMPT: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question, in its original language.";

const QA_PROMPT: &str = "Use the following pieces of context to answer the user's question. \n\
If you don't know the answer, just say that you don't know, don't try to make up an answer.\n\
----------------\n";

/// One exchange of earlier conversation. Either side may be missing when the
/// history does not strictly alternate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Turn {
  pub user: Option<String>,
  pub assistant: Option<String>,
}

/// Drops the placeholder messages the frontend inserts after uploads.
pub fn without_upload_markers(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
  messages.into_iter().filter(|m| !m.is_upload_marker()).collect()
}

/// Groups history into turns by role. System messages are skipped; a user
/// message without a reply is kept as a turn of its own.
pub fn build_turns(history: &[ChatMessage]) -> Vec<Turn> {
  let mut turns: Vec<Turn> = Vec::new();
  for msg in history {
    match msg.role {
      Role::System => {}
      Role::User => turns.push(Turn {
        user: Some(msg.content.clone()),
        assistant: None,
      }),
      Role::Assistant => match turns.last_mut() {
        Some(turn) if turn.assistant.is_none() => turn.assistant = Some(msg.content.clone()),
        _ => turns.push(Turn {
          user: None,
          assistant: Some(msg.content.clone()),
        }),
      },
    }
  }
  turns
}

fn render_history(turns: &[Turn]) -> String {
  let mut out = String::new();
  for turn in turns {
    if let Some(user) = &turn.user {
      out.push_str("\nHuman: ");
      out.push_str(user);
    }
    if let Some(assistant) = &turn.assistant {
      out.push_str("\nAssistant: ");
      out.push_str(assistant);
    }
  }
  out
}

/// Answers chat requests, either directly or grounded in indexed documents.
pub struct Responder {
  model: Arc<dyn ChatModel>,
  embedder: Arc<dyn Embedder>,
  index: Arc<dyn VectorIndex>,
  top_k: usize,
}

impl Responder {
  pub fn new(
    model: Arc<dyn ChatModel>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
  ) -> Self {
    Self {
      model,
      embedder,
      index,
      top_k,
    }
  }

  /// `messages` must be non-empty and already free of upload markers.
  pub async fn reply(&self, config: &Configuration, messages: Vec<ChatMessage>) -> Result<String, AppError> {
    if config.use_uploaded_data {
      info!("Answering with retrieval over uploaded documents");
      self.augmented_reply(config, &messages).await
    } else {
      info!("Answering with the model only");
      self.plain_reply(config, messages).await
    }
  }

  pub async fn plain_reply(&self, config: &Configuration, messages: Vec<ChatMessage>) -> Result<String, AppError> {
    let mut all = Vec::with_capacity(messages.len() + 1);
    all.push(ChatMessage::system(config.persona.clone()));
    all.extend(messages);

    let request = CompletionRequest {
      model: config.selected_model.clone(),
      messages: all,
      temperature: config.temperature,
      max_tokens: Some(config.max_tokens),
      n: Some(config.chat_completion_choices),
    };
    Ok(self.model.complete(&request).await?)
  }

  pub async fn augmented_reply(&self, config: &Configuration, messages: &[ChatMessage]) -> Result<String, AppError> {
    let (last, history) = messages
      .split_last()
      .ok_or_else(|| AppError::bad_input("messages must not be empty"))?;
    let turns = build_turns(history);

    let question = if turns.is_empty() {
      last.content.clone()
    } else {
      self.standalone_question(config, &turns, &last.content).await?
    };
    debug!("retrieval question: {question}");

    let vector = self
      .embedder
      .embed(std::slice::from_ref(&question))
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| AppError::Upstream {
        service: "openai",
        message: "no embedding returned for question".to_string(),
      })?;
    let matches = self.index.query(vector, self.top_k).await?;
    info!(
      "retrieved {} chunks, best score {:?}",
      matches.len(),
      matches.first().map(|m| m.score)
    );
    debug!("matched ids: {:?}", matches.iter().map(|m| m.id.as_str()).collect::<Vec<_>>());

    let context = matches
      .iter()
      .map(|m| m.text.as_str())
      .collect::<Vec<_>>()
      .join("\n\n");
    let request = CompletionRequest {
      model: config.selected_model.clone(),
      messages: vec![
        ChatMessage::system(format!("{QA_PROMPT}{context}")),
        ChatMessage::user(question),
      ],
      temperature: config.temperature,
      max_tokens: None,
      n: None,
    };
    Ok(self.model.complete(&request).await?)
  }

  async fn standalone_question(
    &self,
    config: &Configuration,
    turns: &[Turn],
    question: &str,
  ) -> Result<String, AppError> {
    let prompt = format!(
      "{CONDENSE_PROMPT}\n\nChat History:\n{}\nFollow Up Input: {question}\nStandalone question:",
      render_history(turns)
    );
    let request = CompletionRequest {
      model: config.selected_model.clone(),
      messages: vec![ChatMessage::user(prompt)],
      temperature: config.temperature,
      max_tokens: None,
      n: None,
    };
    let rewritten = self.model.complete(&request).await?;
    let rewritten = rewritten.trim();
    Ok(if rewritten.is_empty() {
      question.to_string()
    } else {
      rewritten.to_string()
    })
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::openai::OpenAiError;
  use crate::pinecone::{IndexError, IndexRecord, ScoredChunk};
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Replies with queued answers and records every request.
  #[derive(Default)]
  pub struct ScriptedModel {
    pub replies: Mutex<Vec<String>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
  }

  impl ScriptedModel {
    pub fn with_replies(replies: &[&str]) -> Self {
      Self {
        replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
        requests: Mutex::new(Vec::new()),
      }
    }
  }

  #[async_trait]
  impl ChatModel for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, OpenAiError> {
      self.requests.lock().unwrap().push(request.clone());
      self
        .replies
        .lock()
        .unwrap()
        .pop()
        .ok_or_else(|| OpenAiError::Parse("no scripted reply".into()))
    }
  }

  /// Embeds every text as its length and counts calls.
  #[derive(Default)]
  pub struct CountingEmbedder {
    pub calls: AtomicUsize,
  }

  #[async_trait]
  impl Embedder for CountingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OpenAiError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
    }
  }

  /// Keeps upserted records in memory and returns fixed matches for queries.
  #[derive(Default)]
  pub struct MemoryIndex {
    pub records: Mutex<Vec<IndexRecord>>,
    pub matches: Vec<ScoredChunk>,
    pub queries: AtomicUsize,
  }

  #[async_trait]
  impl VectorIndex for MemoryIndex {
    async fn upsert(&self, records: Vec<IndexRecord>) -> Result<usize, IndexError> {
      let count = records.len();
      self.records.lock().unwrap().extend(records);
      Ok(count)
    }

    async fn query(&self, _vector: Vec<f32>, top_k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
      self.queries.fetch_add(1, Ordering::SeqCst);
      Ok(self.matches.iter().take(top_k).cloned().collect())
    }
  }

  pub fn config(use_uploaded_data: bool) -> Configuration {
    Configuration {
      selected_model: "gpt-4".to_string(),
      persona: "You are a pirate.".to_string(),
      temperature: 0.3,
      chat_completion_choices: 1,
      max_tokens: 100,
      use_uploaded_data,
    }
  }

  fn chunk(id: &str, text: &str) -> ScoredChunk {
    ScoredChunk {
      id: id.to_string(),
      score: 0.9,
      text: text.to_string(),
    }
  }

  #[test]
  fn markers_are_removed_in_order() {
    let filtered = without_upload_markers(vec![
      ChatMessage::user("one"),
      ChatMessage::user("[NEW FILE UPLOADED TO CHAT]"),
      ChatMessage::assistant("two"),
    ]);
    assert_eq!(filtered, vec![ChatMessage::user("one"), ChatMessage::assistant("two")]);
  }

  #[test]
  fn turns_pair_by_role_and_keep_unanswered_questions() {
    let turns = build_turns(&[
      ChatMessage::system("ignored"),
      ChatMessage::assistant("Welcome!"),
      ChatMessage::user("q1"),
      ChatMessage::assistant("a1"),
      ChatMessage::user("q2"),
    ]);
    assert_eq!(
      turns,
      vec![
        Turn { user: None, assistant: Some("Welcome!".into()) },
        Turn { user: Some("q1".into()), assistant: Some("a1".into()) },
        Turn { user: Some("q2".into()), assistant: None },
      ]
    );
    assert_eq!(render_history(&turns[1..]), "\nHuman: q1\nAssistant: a1\nHuman: q2");
  }

  #[tokio::test]
  async fn plain_reply_prepends_persona() {
    let model = Arc::new(ScriptedModel::with_replies(&["Arr!"]));
    let embedder = Arc::new(CountingEmbedder::default());
    let index = Arc::new(MemoryIndex::default());
    let responder = Responder::new(model.clone(), embedder.clone(), index.clone(), 4);

    let reply = responder
      .reply(&config(false), vec![ChatMessage::user("hi")])
      .await
      .expect("reply");
    assert_eq!(reply, "Arr!");

    let requests = model.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].messages[0], ChatMessage::system("You are a pirate."));
    assert_eq!(requests[0].messages[1], ChatMessage::user("hi"));
    assert_eq!(requests[0].max_tokens, Some(100));
    assert_eq!(requests[0].n, Some(1));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(index.queries.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn augmented_reply_without_history_skips_condensing() {
    let model = Arc::new(ScriptedModel::with_replies(&["Grounded answer"]));
    let index = Arc::new(MemoryIndex {
      matches: vec![chunk("a", "Refunds take 5 days."), chunk("b", "Shipping is free.")],
      ..MemoryIndex::default()
    });
    let responder = Responder::new(model.clone(), Arc::new(CountingEmbedder::default()), index.clone(), 4);

    let reply = responder
      .reply(&config(true), vec![ChatMessage::user("How long do refunds take?")])
      .await
      .expect("reply");
    assert_eq!(reply, "Grounded answer");
    assert_eq!(index.queries.load(Ordering::SeqCst), 1);

    let requests = model.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let system = &requests[0].messages[0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.ends_with("Refunds take 5 days.\n\nShipping is free."));
    assert_eq!(requests[0].messages[1], ChatMessage::user("How long do refunds take?"));
  }

  #[tokio::test]
  async fn augmented_reply_condenses_follow_up() {
    let model = Arc::new(ScriptedModel::with_replies(&["How long do refunds take for shoes?", "Five days."]));
    let index = Arc::new(MemoryIndex {
      matches: vec![chunk("a", "Refunds take 5 days.")],
      ..MemoryIndex::default()
    });
    let responder = Responder::new(model.clone(), Arc::new(CountingEmbedder::default()), index, 1);

    let reply = responder
      .reply(
        &config(true),
        vec![
          ChatMessage::user("I bought shoes."),
          ChatMessage::assistant("Nice!"),
          ChatMessage::user("How long do refunds take?"),
        ],
      )
      .await
      .expect("reply");
    assert_eq!(reply, "Five days.");

    let requests = model.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let condense = &requests[0].messages[0].content;
    assert!(condense.contains("Human: I bought shoes.\nAssistant: Nice!"));
    assert!(condense.contains("Follow Up Input: How long do refunds take?"));
    assert_eq!(
      requests[1].messages[1],
      ChatMessage::user("How long do refunds take for shoes?")
    );
  }

  #[tokio::test]
  async fn index_failure_is_upstream_error() {
    struct DownIndex;

    #[async_trait]
    impl VectorIndex for DownIndex {
      async fn upsert(&self, _records: Vec<IndexRecord>) -> Result<usize, IndexError> {
        Err(IndexError::Api { status: 503, message: "down".into() })
      }

      async fn query(&self, _vector: Vec<f32>, _top_k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        Err(IndexError::Api { status: 503, message: "down".into() })
      }
    }

    let responder = Responder::new(
      Arc::new(ScriptedModel::default()),
      Arc::new(CountingEmbedder::default()),
      Arc::new(DownIndex),
      4,
    );
    let err = responder
      .reply(&config(true), vec![ChatMessage::user("hi")])
      .await
      .unwrap_err();
    assert!(matches!(err, AppError::Upstream { service: "vector index", .. }));
  }
}
