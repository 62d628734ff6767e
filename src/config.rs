use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Type tag of the singleton configuration record.
pub const CONFIG_TAG: &str = "chatsos";

/// Assistant settings read before every chat request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
  pub selected_model: String,
  pub persona: String,
  pub temperature: f64,
  pub chat_completion_choices: u32,
  pub max_tokens: u32,
  #[serde(deserialize_with = "deserialize_flag")]
  pub use_uploaded_data: bool,
}

impl Configuration {
  /// Reads a configuration from a stored document. Every field must be present.
  pub fn from_document(document: &Map<String, Value>) -> Result<Self, serde_json::Error> {
    serde_json::from_value(Value::Object(document.clone()))
  }
}

/// Partial update of the configuration; absent fields keep their stored value.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub selected_model: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub persona: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub temperature: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub chat_completion_choices: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_tokens: Option<u32>,
  #[serde(
    default,
    deserialize_with = "deserialize_optional_flag",
    skip_serializing_if = "Option::is_none"
  )]
  pub use_uploaded_data: Option<Flag>,
}

impl ConfigPatch {
  pub fn is_empty(&self) -> bool {
    *self == ConfigPatch::default()
  }

  pub fn validate(&self) -> Result<(), String> {
    if let Some(model) = &self.selected_model {
      if model.trim().is_empty() {
        return Err("selectedModel must not be empty".to_string());
      }
    }
    if let Some(temperature) = self.temperature {
      if !(0.0..=2.0).contains(&temperature) {
        return Err("temperature must be between 0 and 2".to_string());
      }
    }
    if self.chat_completion_choices == Some(0) {
      return Err("chatCompletionChoices must be at least 1".to_string());
    }
    if self.max_tokens == Some(0) {
      return Err("maxTokens must be at least 1".to_string());
    }
    Ok(())
  }

  /// Overwrites the fields present in this patch, leaving the rest of `document` alone.
  pub fn apply_to(&self, document: &mut Map<String, Value>) -> Result<(), serde_json::Error> {
    if let Value::Object(fields) = serde_json::to_value(self)? {
      for (key, value) in fields {
        document.insert(key, value);
      }
    }
    Ok(())
  }
}

/// `useUploadedData` as the client sent it. The admin frontend uses "Yes"/"No";
/// booleans are accepted as well. Stored verbatim so reads return what was written.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Flag {
  Bool(bool),
  Text(String),
}

impl Flag {
  pub fn as_bool(&self) -> Result<bool, String> {
    match self {
      Flag::Bool(value) => Ok(*value),
      Flag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        other => Err(format!("invalid useUploadedData value: {other:?}")),
      },
    }
  }
}

impl From<bool> for Flag {
  fn from(value: bool) -> Self {
    Flag::Bool(value)
  }
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
  D: Deserializer<'de>,
{
  Flag::deserialize(deserializer)?
    .as_bool()
    .map_err(serde::de::Error::custom)
}

fn deserialize_optional_flag<'de, D>(deserializer: D) -> Result<Option<Flag>, D::Error>
where
  D: Deserializer<'de>,
{
  match Option::<Flag>::deserialize(deserializer)? {
    Some(flag) => {
      flag.as_bool().map_err(serde::de::Error::custom)?;
      Ok(Some(flag))
    }
    None => Ok(None),
  }
}
