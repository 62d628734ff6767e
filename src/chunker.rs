use std::path::Path;

use tokenizers::Tokenizer;

pub const CHUNK_SIZE: usize = 512;
pub const CHUNK_OVERLAP: usize = 24;

/// Coarsest first; the empty separator splits into single characters.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Measures text length in model tokens.
pub trait TokenCounter: Send + Sync {
  fn count(&self, text: &str) -> usize;
}

/// Token counter backed by a Hugging Face tokenizer definition.
pub struct HfTokenCounter {
  tokenizer: Tokenizer,
}

impl HfTokenCounter {
  pub fn from_pretrained(identifier: &str) -> anyhow::Result<Self> {
    let tokenizer = Tokenizer::from_pretrained(identifier, None)
      .map_err(|err| anyhow::anyhow!("failed to fetch tokenizer {identifier}: {err}"))?;
    Ok(Self { tokenizer })
  }

  pub fn from_file(path: &Path) -> anyhow::Result<Self> {
    let tokenizer = Tokenizer::from_file(path)
      .map_err(|err| anyhow::anyhow!("failed to load tokenizer {}: {err}", path.display()))?;
    Ok(Self { tokenizer })
  }
}

impl TokenCounter for HfTokenCounter {
  fn count(&self, text: &str) -> usize {
    match self.tokenizer.encode(text, false) {
      Ok(encoding) => encoding.get_ids().len(),
      // Byte length never undercounts byte-level BPE tokens.
      Err(_) => text.len(),
    }
  }
}

/// A chunk of one uploaded document, ready for embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChunk {
  pub text: String,
  pub source: String,
}

/// Recursive separator-based splitter with a token bound and overlap.
#[derive(Debug, Clone)]
pub struct TextSplitter {
  chunk_size: usize,
  overlap: usize,
}

impl Default for TextSplitter {
  fn default() -> Self {
    Self::new(CHUNK_SIZE, CHUNK_OVERLAP)
  }
}

impl TextSplitter {
  pub fn new(chunk_size: usize, overlap: usize) -> Self {
    assert!(overlap * 2 < chunk_size, "overlap must be under half the chunk size");
    Self { chunk_size, overlap }
  }

  pub fn chunk_document(&self, text: &str, source: &str, counter: &dyn TokenCounter) -> Vec<DocumentChunk> {
    self
      .split(text, counter)
      .into_iter()
      .map(|text| DocumentChunk {
        text,
        source: source.to_string(),
      })
      .collect()
  }

  pub fn split(&self, text: &str, counter: &dyn TokenCounter) -> Vec<String> {
    let mut packer = Packer::new(self, counter);
    self.split_with(text, &SEPARATORS, &mut packer);
    packer.finish()
  }

  /// Largest piece that still fits in a chunk behind a carried tail.
  fn piece_limit(&self) -> usize {
    self.chunk_size - self.overlap * 2
  }

  fn split_with(&self, text: &str, separators: &[&str], packer: &mut Packer<'_>) {
    let position = separators
      .iter()
      .position(|sep| sep.is_empty() || text.contains(sep))
      .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(position).copied().unwrap_or("");
    let finer = separators.get(position + 1..).unwrap_or(&[]);

    let mut small: Vec<&str> = Vec::new();
    for piece in split_keeping_separator(text, separator) {
      if packer.counter.count(piece) <= self.piece_limit() {
        small.push(piece);
        continue;
      }
      if !small.is_empty() {
        packer.pack(&small);
        small.clear();
      }
      if finer.is_empty() {
        packer.pack(&[piece]);
      } else {
        self.split_with(piece, finer, packer);
      }
    }
    if !small.is_empty() {
      packer.pack(&small);
    }
  }

  /// Shortest suffix of `chunk` holding at least `overlap` tokens, cut at the
  /// coarsest separator that keeps it under twice the overlap.
  fn overlap_tail<'c>(&self, chunk: &'c str, counter: &dyn TokenCounter) -> &'c str {
    if counter.count(chunk) <= self.overlap {
      return chunk;
    }
    let mut candidate = chunk;
    for separator in SEPARATORS {
      let mut start = candidate.len();
      for piece in split_keeping_separator(candidate, separator).iter().rev() {
        start -= piece.len();
        if counter.count(&candidate[start..]) >= self.overlap {
          break;
        }
      }
      candidate = &candidate[start..];
      if counter.count(candidate) <= self.overlap * 2 {
        break;
      }
    }
    candidate
  }
}

/// Greedily packs pieces into chunks. Every chunk after the first starts with
/// the overlap tail of the one before it, across separator groups too.
struct Packer<'a> {
  splitter: &'a TextSplitter,
  counter: &'a dyn TokenCounter,
  chunks: Vec<String>,
  tail: String,
  tail_count: usize,
  // A chunk shorter than the overlap is not emitted on its own; it rides
  // along as the tail of the next one.
  held: bool,
}

impl<'a> Packer<'a> {
  fn new(splitter: &'a TextSplitter, counter: &'a dyn TokenCounter) -> Self {
    Self {
      splitter,
      counter,
      chunks: Vec::new(),
      tail: String::new(),
      tail_count: 0,
      held: false,
    }
  }

  fn pack(&mut self, pieces: &[&str]) {
    let size = self.splitter.chunk_size;
    let counts: Vec<usize> = pieces.iter().map(|p| self.counter.count(p)).collect();

    let mut start = 0;
    while start < pieces.len() {
      let mut end = start + 1;
      let mut total = self.tail_count + counts[start];
      while end < pieces.len() && total + counts[end] <= size {
        total += counts[end];
        end += 1;
      }

      // Piece counts are not strictly additive once joined; shrink until the
      // joined text really fits, keeping at least one new piece.
      let mut body = pieces[start..end].concat();
      while end > start + 1 && self.counter.count(&format!("{}{body}", self.tail)) > size {
        end -= 1;
        body = pieces[start..end].concat();
      }
      start = end;
      if body.trim().is_empty() {
        self.tail.push_str(&body);
        self.tail_count = self.counter.count(&self.tail);
        continue;
      }

      let text = format!("{}{body}", self.tail);
      if self.counter.count(&text) <= size {
        self.emit(&text);
      } else {
        // The bound wins over the overlap.
        self.release_held();
        self.emit(&body);
      }
    }
  }

  fn emit(&mut self, text: &str) {
    let chunk = text.trim();
    self.held = self.counter.count(chunk) < self.splitter.overlap;
    self.tail = self.splitter.overlap_tail(chunk, self.counter).to_string();
    self.tail_count = self.counter.count(&self.tail);
    if !self.held {
      self.chunks.push(chunk.to_string());
    }
  }

  fn release_held(&mut self) {
    if self.held {
      let chunk = self.tail.trim().to_string();
      if !chunk.is_empty() {
        self.chunks.push(chunk);
      }
      self.held = false;
    }
  }

  fn finish(mut self) -> Vec<String> {
    self.release_held();
    self.chunks
  }
}

/// Splits on `separator`, attaching each separator to the start of the piece after it.
fn split_keeping_separator<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
  if separator.is_empty() {
    return text
      .char_indices()
      .map(|(i, c)| &text[i..i + c.len_utf8()])
      .collect();
  }

  let mut pieces = Vec::new();
  let mut start = 0;
  for (pos, _) in text.match_indices(separator) {
    if pos > start {
      pieces.push(&text[start..pos]);
    }
    start = pos;
  }
  if start < text.len() {
    pieces.push(&text[start..]);
  }
  pieces
}
