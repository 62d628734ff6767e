use serde::{Deserialize, Serialize};

use crate::config::ConfigPatch;

/// Placeholder message the frontend appends to a conversation after a file upload.
pub const UPLOAD_MARKER: &str = "[NEW FILE UPLOADED TO CHAT]";

pub const DATA_SUCCESS: &str = "Operation done successfully";
pub const DATA_FAILED: &str = "Some error occurred while loading data.";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  System,
  User,
  Assistant,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
  pub role: Role,
  pub content: String,
}

impl ChatMessage {
  pub fn new(role: Role, content: impl Into<String>) -> Self {
    Self {
      role,
      content: content.into(),
    }
  }

  pub fn system(content: impl Into<String>) -> Self {
    Self::new(Role::System, content)
  }

  pub fn user(content: impl Into<String>) -> Self {
    Self::new(Role::User, content)
  }

  pub fn assistant(content: impl Into<String>) -> Self {
    Self::new(Role::Assistant, content)
  }

  pub fn is_upload_marker(&self) -> bool {
    self.content.contains(UPLOAD_MARKER)
  }
}

#[derive(Deserialize)]
pub struct AskRequest {
  pub messages: Option<Vec<ChatMessage>>,
}

#[derive(Serialize)]
pub struct AskData {
  pub message: ChatMessage,
}

#[derive(Deserialize)]
pub struct UpdateConfigRequest {
  pub config: Option<ConfigPatch>,
}

#[derive(Serialize)]
pub struct StatusResponse {
  pub stat: &'static str,
}

/// Uniform response body shared by every route except `/status`.
#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
  pub status: bool,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
  pub fn ok(data: T) -> Self {
    Self {
      status: true,
      message: DATA_SUCCESS.to_string(),
      data: Some(data),
    }
  }
}

impl Envelope<()> {
  pub fn done() -> Self {
    Self {
      status: true,
      message: DATA_SUCCESS.to_string(),
      data: None,
    }
  }

  pub fn failed(message: impl Into<String>) -> Self {
    Self {
      status: false,
      message: message.into(),
      data: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roles_use_lowercase_wire_names() {
    let msg: ChatMessage = serde_json::from_str(r#"{"role":"assistant","content":"hey"}"#)
      .expect("message should parse");
    assert_eq!(msg.role, Role::Assistant);
    let json = serde_json::to_value(ChatMessage::system("be kind")).expect("serialize");
    assert_eq!(json["role"], "system");
  }

  #[test]
  fn unknown_role_is_rejected() {
    let parsed = serde_json::from_str::<ChatMessage>(r#"{"role":"tool","content":"x"}"#);
    assert!(parsed.is_err());
  }

  #[test]
  fn marker_is_matched_as_substring() {
    assert!(ChatMessage::user("[NEW FILE UPLOADED TO CHAT]").is_upload_marker());
    assert!(ChatMessage::user("see [NEW FILE UPLOADED TO CHAT] above").is_upload_marker());
    assert!(!ChatMessage::user("new file uploaded").is_upload_marker());
  }

  #[test]
  fn failed_envelope_omits_data() {
    let json = serde_json::to_value(Envelope::failed("No selected file")).expect("serialize");
    assert_eq!(json, serde_json::json!({ "status": false, "message": "No selected file" }));
  }
}
