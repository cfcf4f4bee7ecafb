//! HTTP transport used to replay queued requests and to forward live ones.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::config::ServerConfig;

/// Issues requests against the server.
///
/// Implementations only need `execute`; the per-mutation helpers map onto it.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Send a request and return the decoded response body (`null` if empty).
  async fn execute(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Value>;

  async fn create(&self, url: &str, body: &Value) -> Result<Value> {
    self.execute(Method::POST, url, Some(body)).await
  }

  async fn update(&self, url: &str, body: &Value) -> Result<Value> {
    self.execute(Method::PATCH, url, Some(body)).await
  }

  async fn delete(&self, url: &str) -> Result<()> {
    self.execute(Method::DELETE, url, None).await.map(|_| ())
  }
}

/// Transport backed by `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
  health_path: String,
  probe_timeout: Duration,
}

impl HttpTransport {
  pub fn new(config: &ServerConfig, token: Option<String>) -> Result<Self> {
    let base_url =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid server url {}: {}", config.url, e))?;

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
      health_path: config.health_path.clone(),
      probe_timeout: Duration::from_secs(config.probe_timeout_secs),
    })
  }

  /// Resolve a request url against the configured server.
  ///
  /// Absolute urls are used as they are.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .base_url
      .join(url)
      .map_err(|e| eyre!("Invalid request url {}: {}", url, e))
  }

  /// Whether the server answers its health endpoint at all.
  pub async fn is_reachable(&self) -> bool {
    let url = match self.resolve(&self.health_path) {
      Ok(url) => url,
      Err(_) => return false,
    };

    match self
      .client
      .get(url)
      .timeout(self.probe_timeout)
      .send()
      .await
    {
      Ok(_) => true,
      Err(e) => {
        tracing::debug!("Health probe failed: {}", e);
        false
      }
    }
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn execute(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Value> {
    let target = self.resolve(url)?;
    let mut request = self.client.request(method.clone(), target);

    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to send {} {}: {}", method, url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("{} {} returned {}", method, url, status));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response of {} {}: {}", method, url, e))?;

    if bytes.is_empty() {
      return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes)
      .map_err(|e| eyre!("Failed to parse response of {} {}: {}", method, url, e))
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn config() -> ServerConfig {
    ServerConfig {
      url: "https://api.example.com/v1/".to_string(),
      health_path: "health".to_string(),
      probe_timeout_secs: 1,
    }
  }

  #[test]
  fn test_resolve_relative_and_absolute() {
    let transport = HttpTransport::new(&config(), None).unwrap();
    assert_eq!(
      transport.resolve("items/1").unwrap().as_str(),
      "https://api.example.com/v1/items/1"
    );
    assert_eq!(
      transport.resolve("https://other.example.com/x").unwrap().as_str(),
      "https://other.example.com/x"
    );
  }

  #[test]
  fn test_invalid_base_url_is_rejected() {
    let mut config = config();
    config.url = "not a url".to_string();
    assert!(HttpTransport::new(&config, None).is_err());
  }

  #[tokio::test]
  async fn test_helpers_map_to_methods() {
    let transport = mock::MockTransport::new().reply(json!({ "id": 1 }));
    let created = transport.create("/items", &json!({ "name": "a" })).await.unwrap();
    assert_eq!(created, json!({ "id": 1 }));

    transport.delete("/items/1").await.unwrap();

    let calls = transport.calls();
    assert_eq!(calls[0].method, Method::POST);
    assert_eq!(calls[1].method, Method::DELETE);
    assert_eq!(calls[1].body, None);
  }
}
