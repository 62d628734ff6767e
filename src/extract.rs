use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
  #[error("failed to read document: {0}")]
  Io(#[from] std::io::Error),
  #[error("PDF parse error: {0}")]
  Pdf(String),
}

/// Plain text of every page of the PDF at `path`, in page order.
pub fn extract_pdf_text(path: &Path) -> Result<String, ExtractError> {
  let bytes = std::fs::read(path)?;
  pdf_extract::extract_text_from_mem(&bytes).map_err(|err| ExtractError::Pdf(err.to_string()))
}
