use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use crate::extract::ExtractError;
use crate::models::{Envelope, DATA_FAILED};
use crate::openai::OpenAiError;
use crate::pinecone::IndexError;
use crate::storage::StoreError;

/// Faults surfaced at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
  /// The request itself is wrong; the message is safe to show the caller.
  #[error("{0}")]
  BadInput(String),
  #[error("configuration unavailable: {0}")]
  Config(#[source] StoreError),
  #[error("{service} unavailable: {message}")]
  Upstream { service: &'static str, message: String },
  #[error("document could not be processed: {0}")]
  Document(String),
  #[error("upload too large: {0}")]
  TooLarge(String),
  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

impl AppError {
  pub fn bad_input(message: impl Into<String>) -> Self {
    AppError::BadInput(message.into())
  }

  pub fn status(&self) -> StatusCode {
    match self {
      AppError::BadInput(_) => StatusCode::BAD_REQUEST,
      AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
      AppError::Document(_) => StatusCode::UNPROCESSABLE_ENTITY,
      AppError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
      AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<StoreError> for AppError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::Missing(_) | StoreError::Incomplete(_) => AppError::Config(err),
      other => AppError::Upstream {
        service: "configuration store",
        message: other.to_string(),
      },
    }
  }
}

impl From<OpenAiError> for AppError {
  fn from(err: OpenAiError) -> Self {
    AppError::Upstream {
      service: "openai",
      message: err.to_string(),
    }
  }
}

impl From<IndexError> for AppError {
  fn from(err: IndexError) -> Self {
    AppError::Upstream {
      service: "vector index",
      message: err.to_string(),
    }
  }
}

impl From<ExtractError> for AppError {
  fn from(err: ExtractError) -> Self {
    AppError::Document(err.to_string())
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    let status = self.status();
    let message = match &self {
      AppError::BadInput(message) => {
        warn!("rejected request: {message}");
        message.clone()
      }
      AppError::TooLarge(detail) => {
        warn!("rejected upload: {detail}");
        DATA_FAILED.to_string()
      }
      other => {
        error!("request failed: {other}");
        DATA_FAILED.to_string()
      }
    };
    (status, Json(Envelope::failed(message))).into_response()
  }
}
