//! Admission filter deciding whether an outgoing mutation is queued or sent.

use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;

use crate::connectivity::Connectivity;
use crate::id::{self, IdGenerator};
use crate::model::{
  default_display_value, CachedRequest, OutgoingRequest, RequestMetadata, RequestMethod,
};
use crate::queue::RequestStore;
use crate::transport::Transport;

/// Supplies metadata for requests that were sent without any.
pub type MetadataResolver = dyn Fn(&OutgoingRequest) -> Option<RequestMetadata> + Send + Sync;

/// What happened to an intercepted request.
#[derive(Debug, Clone)]
pub enum Disposition {
  /// Diverted into the queue
  Queued(CachedRequest),
  /// Must go to the server now
  Forward(OutgoingRequest),
}

pub struct Interceptor {
  store: Arc<RequestStore>,
  connectivity: Connectivity,
  ids: Arc<dyn IdGenerator>,
  id_prefix: String,
  excluded_endpoints: Vec<String>,
  resolver: Option<Arc<MetadataResolver>>,
}

impl Interceptor {
  pub fn new(
    store: Arc<RequestStore>,
    connectivity: Connectivity,
    ids: Arc<dyn IdGenerator>,
    id_prefix: impl Into<String>,
    excluded_endpoints: Vec<String>,
  ) -> Self {
    Self {
      store,
      connectivity,
      ids,
      id_prefix: id_prefix.into(),
      excluded_endpoints,
      resolver: None,
    }
  }

  pub fn with_resolver(mut self, resolver: Arc<MetadataResolver>) -> Self {
    self.resolver = Some(resolver);
    self
  }

  /// Whether `request` would be diverted given the current connectivity.
  pub fn should_queue(&self, request: &OutgoingRequest) -> bool {
    self.connectivity.is_offline()
      && RequestMethod::from_http(&request.method).is_some()
      && !self.is_excluded(&request.url)
  }

  fn is_excluded(&self, url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    self
      .excluded_endpoints
      .iter()
      .any(|endpoint| path.ends_with(endpoint.as_str()))
  }

  /// Decide the request's fate, queuing it if it is diverted.
  pub fn admit(&self, request: OutgoingRequest) -> Result<Disposition> {
    if !self.should_queue(&request) {
      return Ok(Disposition::Forward(request));
    }
    let Some(method) = RequestMethod::from_http(&request.method) else {
      return Ok(Disposition::Forward(request));
    };

    let metadata = self.resolve_metadata(&request, &method);
    let mut body = request.body;

    if method == RequestMethod::Create {
      match body.as_mut() {
        Some(Value::Object(fields)) => {
          let placeholder = id::placeholder(&self.id_prefix, self.ids.as_ref());
          fields.insert(metadata.id_key.clone(), Value::String(placeholder));
        }
        Some(Value::Null) | None => {}
        Some(_) => {
          tracing::warn!(
            url = %request.url,
            "Create body is not an object, queuing it without a placeholder id"
          );
        }
      }
    }

    let cached = CachedRequest::new(method, request.url, body, metadata);
    self.store.push(cached.clone())?;
    tracing::info!(
      request = %cached.id,
      label = %cached.display_value(),
      "Queued request while offline"
    );

    Ok(Disposition::Queued(cached))
  }

  fn resolve_metadata(&self, request: &OutgoingRequest, method: &RequestMethod) -> RequestMetadata {
    let supplied = request
      .metadata
      .clone()
      .or_else(|| self.resolver.as_ref().and_then(|resolve| resolve(request)));

    match supplied {
      Some(mut metadata) => {
        if metadata.display_value.is_none() {
          metadata.display_value = Some(default_display_value(method, &request.url));
        }
        metadata
      }
      None => {
        tracing::warn!(
          url = %request.url,
          "No metadata for request, using fallback default values"
        );
        RequestMetadata::fallback(method, &request.url)
      }
    }
  }

  /// Admit the request and, unless it was queued, send it.
  ///
  /// A queued request is answered locally with its (stamped) body, or `null`
  /// for deletions.
  pub async fn intercept(&self, request: OutgoingRequest, transport: &dyn Transport) -> Result<Value> {
    match self.admit(request)? {
      Disposition::Queued(cached) => Ok(cached.body.unwrap_or(Value::Null)),
      Disposition::Forward(request) => {
        transport
          .execute(request.method, &request.url, request.body.as_ref())
          .await
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::OfflineConfig;
  use crate::id::UuidGenerator;
  use crate::queue::MemoryStorage;
  use crate::transport::mock::MockTransport;
  use reqwest::Method;
  use serde_json::json;

  fn setup(offline: bool) -> (Interceptor, Arc<RequestStore>) {
    let store = Arc::new(RequestStore::open(MemoryStorage::new()));
    let defaults = OfflineConfig::default();
    let interceptor = Interceptor::new(
      store.clone(),
      Connectivity::new(offline),
      Arc::new(UuidGenerator),
      defaults.id_prefix,
      defaults.excluded_endpoints,
    );
    (interceptor, store)
  }

  #[test]
  fn test_create_is_stamped_with_placeholder() {
    let (interceptor, store) = setup(true);
    let request = OutgoingRequest::new(Method::POST, "/items")
      .with_body(json!({ "id": 5, "name": "x" }))
      .with_metadata(RequestMetadata::new("item"));

    let Disposition::Queued(cached) = interceptor.admit(request).unwrap() else {
      panic!("expected request to be queued");
    };

    let id = cached.body.as_ref().unwrap()["id"].as_str().unwrap();
    assert!(id.starts_with("offline "));
    assert_eq!(cached.body.as_ref().unwrap()["name"], "x");
    assert_eq!(store.current(), vec![cached]);
  }

  #[test]
  fn test_custom_id_key() {
    let (interceptor, _) = setup(true);
    let request = OutgoingRequest::new(Method::POST, "/users")
      .with_body(json!({ "name": "x" }))
      .with_metadata(RequestMetadata::new("user").with_id_key("uid"));

    let Disposition::Queued(cached) = interceptor.admit(request).unwrap() else {
      panic!("expected request to be queued");
    };
    let body = cached.body.unwrap();
    assert!(body["uid"].as_str().unwrap().starts_with("offline "));
    assert!(body.get("id").is_none());
  }

  #[test]
  fn test_online_requests_are_forwarded() {
    let (interceptor, store) = setup(false);
    let request = OutgoingRequest::new(Method::POST, "/items").with_body(json!({}));
    assert!(matches!(interceptor.admit(request).unwrap(), Disposition::Forward(_)));
    assert!(store.is_empty());
  }

  #[test]
  fn test_reads_are_never_queued() {
    let (interceptor, store) = setup(true);
    let request = OutgoingRequest::new(Method::GET, "/items");
    assert!(matches!(interceptor.admit(request).unwrap(), Disposition::Forward(_)));
    assert!(store.is_empty());
  }

  #[test]
  fn test_excluded_endpoints_are_forwarded() {
    let (interceptor, store) = setup(true);
    for url in ["/api/login", "/api/refresh-token?x=1", "/verify-password-reset-token"] {
      let request = OutgoingRequest::new(Method::POST, url).with_body(json!({}));
      assert!(matches!(interceptor.admit(request).unwrap(), Disposition::Forward(_)));
    }
    assert!(store.is_empty());
  }

  #[test]
  fn test_missing_metadata_falls_back_to_defaults() {
    let (interceptor, _) = setup(true);
    let request = OutgoingRequest::new(Method::DELETE, "/items/3");

    let Disposition::Queued(cached) = interceptor.admit(request).unwrap() else {
      panic!("expected request to be queued");
    };
    assert_eq!(cached.metadata.id_key, "id");
    assert_eq!(cached.metadata.entity_type, "");
    assert_eq!(cached.display_value(), "DELETE /items/3");
  }

  #[test]
  fn test_resolver_supplies_metadata() {
    let (interceptor, _) = setup(true);
    let interceptor = interceptor.with_resolver(Arc::new(|request: &OutgoingRequest| {
      request
        .url
        .starts_with("/items")
        .then(|| RequestMetadata::new("item"))
    }));

    let Disposition::Queued(cached) = interceptor
      .admit(OutgoingRequest::new(Method::PATCH, "/items/1").with_body(json!({ "name": "y" })))
      .unwrap()
    else {
      panic!("expected request to be queued");
    };
    assert_eq!(cached.metadata.entity_type, "item");
    assert_eq!(cached.display_value(), "PATCH /items/1");
  }

  #[test]
  fn test_requests_queue_in_submission_order() {
    let (interceptor, store) = setup(true);
    for url in ["/items/1", "/items/2", "/items/3"] {
      interceptor
        .admit(OutgoingRequest::new(Method::DELETE, url).with_metadata(RequestMetadata::new("item")))
        .unwrap();
    }
    let urls: Vec<_> = store.current().into_iter().map(|r| r.url).collect();
    assert_eq!(urls, vec!["/items/1", "/items/2", "/items/3"]);
  }

  #[tokio::test]
  async fn test_intercept_answers_queued_requests_locally() {
    let (interceptor, _) = setup(true);
    let transport = MockTransport::new();
    let response = interceptor
      .intercept(
        OutgoingRequest::new(Method::POST, "/items").with_body(json!({ "name": "a" })),
        &transport,
      )
      .await
      .unwrap();

    assert!(response["id"].as_str().unwrap().starts_with("offline "));
    assert!(transport.calls().is_empty());
  }

  #[tokio::test]
  async fn test_intercept_sends_excluded_request_live() {
    let (interceptor, store) = setup(true);
    let transport = MockTransport::new().fail("network unreachable");
    let result = interceptor
      .intercept(
        OutgoingRequest::new(Method::POST, "/auth/login").with_body(json!({ "user": "u" })),
        &transport,
      )
      .await;

    assert!(result.is_err());
    assert_eq!(transport.calls().len(), 1);
    assert!(store.is_empty());
  }
}
