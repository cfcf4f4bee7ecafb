//! Request types shared by the admission filter, the store and the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identity field used when a request does not name one.
pub const DEFAULT_ID_KEY: &str = "id";

/// The mutation a cached request performs.
///
/// Persisted as the HTTP verb so queues written by older clients keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequestMethod {
  /// POST
  Create,
  /// PATCH
  Update,
  /// DELETE
  Delete,
  /// Any other verb found in a persisted queue
  Other(String),
}

impl RequestMethod {
  /// Map an outgoing HTTP method to a cacheable mutation, if it is one.
  pub fn from_http(method: &reqwest::Method) -> Option<Self> {
    match *method {
      reqwest::Method::POST => Some(Self::Create),
      reqwest::Method::PATCH => Some(Self::Update),
      reqwest::Method::DELETE => Some(Self::Delete),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      Self::Create => "POST",
      Self::Update => "PATCH",
      Self::Delete => "DELETE",
      Self::Other(verb) => verb,
    }
  }
}

impl From<String> for RequestMethod {
  fn from(verb: String) -> Self {
    match verb.to_ascii_uppercase().as_str() {
      "POST" => Self::Create,
      "PATCH" => Self::Update,
      "DELETE" => Self::Delete,
      _ => Self::Other(verb),
    }
  }
}

impl From<RequestMethod> for String {
  fn from(method: RequestMethod) -> Self {
    method.as_str().to_string()
  }
}

impl fmt::Display for RequestMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Describes a queued mutation for reconciliation purposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
  /// Name of the identity field on the affected entity
  #[serde(default = "default_id_key")]
  pub id_key: String,
  /// Logical entity type, used to group requests for projection
  #[serde(rename = "type")]
  pub entity_type: String,
  /// Human readable label; synthesized from method and url when absent
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub display_value: Option<String>,
}

fn default_id_key() -> String {
  DEFAULT_ID_KEY.to_string()
}

impl RequestMetadata {
  pub fn new(entity_type: impl Into<String>) -> Self {
    Self {
      id_key: default_id_key(),
      entity_type: entity_type.into(),
      display_value: None,
    }
  }

  pub fn with_id_key(mut self, id_key: impl Into<String>) -> Self {
    self.id_key = id_key.into();
    self
  }

  pub fn with_display_value(mut self, display_value: impl Into<String>) -> Self {
    self.display_value = Some(display_value.into());
    self
  }

  /// Metadata used when the caller attached none.
  pub fn fallback(method: &RequestMethod, url: &str) -> Self {
    Self::new("").with_display_value(default_display_value(method, url))
  }
}

/// Default label shown for a request without an explicit display value.
pub fn default_display_value(method: &RequestMethod, url: &str) -> String {
  format!("{} {}", method, url)
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRequest {
  /// Stable identity of this queue entry (not the entity id)
  #[serde(default = "fresh_request_id")]
  pub id: String,
  pub method: RequestMethod,
  pub url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  pub metadata: RequestMetadata,
  #[serde(default = "Utc::now")]
  pub queued_at: DateTime<Utc>,
}

fn fresh_request_id() -> String {
  uuid::Uuid::new_v4().to_string()
}

impl CachedRequest {
  pub fn new(
    method: RequestMethod,
    url: impl Into<String>,
    body: Option<Value>,
    metadata: RequestMetadata,
  ) -> Self {
    Self {
      id: fresh_request_id(),
      method,
      url: url.into(),
      body,
      metadata,
      queued_at: Utc::now(),
    }
  }

  /// Label for display, falling back to method and url.
  pub fn display_value(&self) -> String {
    self
      .metadata
      .display_value
      .clone()
      .unwrap_or_else(|| default_display_value(&self.method, &self.url))
  }

  /// The value of the identity field in the body, if the body carries one.
  pub fn body_id(&self) -> Option<&Value> {
    self
      .body
      .as_ref()
      .and_then(|body| body.get(&self.metadata.id_key))
      .filter(|v| !v.is_null())
  }
}

/// A mutating request on its way to the server, before admission.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
  pub method: reqwest::Method,
  pub url: String,
  pub body: Option<Value>,
  pub metadata: Option<RequestMetadata>,
}

impl OutgoingRequest {
  pub fn new(method: reqwest::Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      body: None,
      metadata: None,
    }
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
    self.metadata = Some(metadata);
    self
  }
}

/// Render an identity value the way it would appear inside a url.
pub fn id_as_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}
