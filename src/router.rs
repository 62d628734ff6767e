use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::AppError;
use crate::ingest::Ingestor;
use crate::models::{AskData, AskRequest, ChatMessage, Envelope, StatusResponse, UpdateConfigRequest};
use crate::responder::{self, Responder};
use crate::storage::ConfigStore;

/// Default upload ceiling for `/update_gpt_database`.
pub const MAX_UPLOAD_BYTES: usize = 120 * 1024 * 1024;

const NO_FILE_PART: &str = "No file part in the request";
const NO_SELECTED_FILE: &str = "No selected file";

pub struct RouterState {
  pub store: ConfigStore,
  pub responder: Responder,
  pub ingestor: Ingestor,
  pub upload_dir: PathBuf,
}

pub fn build_router(state: RouterState, upload_limit: usize) -> Router {
  Router::new()
    .route("/status", get(status))
    .route("/ask_assistant", post(ask_assistant))
    .route(
      "/update_gpt_database",
      post(update_gpt_database).layer(DefaultBodyLimit::max(upload_limit)),
    )
    .route("/update_config", post(update_config))
    .route("/get_config", get(get_config))
    .layer(TraceLayer::new_for_http())
    .layer(CompressionLayer::new())
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
    .with_state(Arc::new(state))
}

pub async fn run_router(listener: tokio::net::TcpListener, state: RouterState) -> anyhow::Result<()> {
  axum::serve(listener, build_router(state, MAX_UPLOAD_BYTES))
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  Ok(())
}

async fn shutdown_signal() {
  if let Err(err) = tokio::signal::ctrl_c().await {
    warn!("failed to listen for ctrl-c: {err}");
    std::future::pending::<()>().await;
  }
  info!("Shutting down");
}

async fn status() -> Json<StatusResponse> {
  Json(StatusResponse { stat: "API is ONLINE" })
}

async fn ask_assistant(
  State(state): State<Arc<RouterState>>,
  payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<Envelope<AskData>>, AppError> {
  let Json(req) = payload.map_err(|err| AppError::bad_input(err.body_text()))?;
  let messages = req
    .messages
    .ok_or_else(|| AppError::bad_input("messages is required"))?;
  let messages = responder::without_upload_markers(messages);
  if messages.is_empty() {
    return Err(AppError::bad_input("messages must not be empty"));
  }

  let config = state.store.load().await?;
  let reply = state.responder.reply(&config, messages).await?;
  Ok(Json(Envelope::ok(AskData {
    message: ChatMessage::assistant(reply),
  })))
}

async fn update_gpt_database(
  State(state): State<Arc<RouterState>>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Envelope<()>>, AppError> {
  let mut multipart = multipart.map_err(|_| AppError::bad_input(NO_FILE_PART))?;

  let mut upload = None;
  while let Some(field) = multipart
    .next_field()
    .await
    .map_err(|err| multipart_error(err, "invalid multipart body"))?
  {
    if field.name() != Some("file") {
      continue;
    }
    let filename = field.file_name().unwrap_or_default().to_string();
    let data = field
      .bytes()
      .await
      .map_err(|err| multipart_error(err, "failed to read upload"))?;
    upload = Some((filename, data));
    break;
  }

  let (filename, data) = upload.ok_or_else(|| AppError::bad_input(NO_FILE_PART))?;
  let source = match Path::new(filename.trim()).file_name() {
    Some(name) => name.to_string_lossy().into_owned(),
    None => return Err(AppError::bad_input(NO_SELECTED_FILE)),
  };
  info!("Received upload {source} ({} bytes)", data.len());

  tokio::fs::create_dir_all(&state.upload_dir)
    .await
    .map_err(|err| AppError::Internal(err.into()))?;
  let saved = tempfile::Builder::new()
    .prefix("upload-")
    .suffix(".pdf")
    .tempfile_in(&state.upload_dir)
    .map_err(|err| AppError::Internal(err.into()))?;
  tokio::fs::write(saved.path(), &data)
    .await
    .map_err(|err| AppError::Internal(err.into()))?;

  let written = state
    .ingestor
    .ingest_pdf(saved.path().to_path_buf(), source)
    .await?;
  info!("Upload indexed as {written} vectors");
  Ok(Json(Envelope::done()))
}

fn multipart_error(err: MultipartError, context: &str) -> AppError {
  if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
    AppError::TooLarge(err.body_text())
  } else {
    AppError::bad_input(format!("{context}: {}", err.body_text()))
  }
}

async fn update_config(
  State(state): State<Arc<RouterState>>,
  payload: Result<Json<UpdateConfigRequest>, JsonRejection>,
) -> Result<Json<Envelope<()>>, AppError> {
  let Json(req) = payload.map_err(|err| AppError::bad_input(err.body_text()))?;
  let patch = req
    .config
    .ok_or_else(|| AppError::bad_input("config is required"))?;
  if patch.is_empty() {
    return Err(AppError::bad_input("config must contain at least one field"));
  }
  patch.validate().map_err(AppError::BadInput)?;

  state.store.update(&patch).await?;
  info!("Configuration updated");
  Ok(Json(Envelope::done()))
}

async fn get_config(State(state): State<Arc<RouterState>>) -> Result<Json<Envelope<Vec<Value>>>, AppError> {
  let records = state.store.records().await?;
  Ok(Json(Envelope::ok(records)))
}
