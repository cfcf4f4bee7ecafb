//! Facade handed to the presentation layer.

use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;

use crate::config::{Config, OfflineConfig};
use crate::connectivity::Connectivity;
use crate::error::SyncError;
use crate::id::{IdGenerator, UuidGenerator};
use crate::interceptor::{Interceptor, MetadataResolver};
use crate::model::{CachedRequest, OutgoingRequest};
use crate::projection::{self, OfflineEntity};
use crate::queue::{QueueStorage, QueueSubscription, RequestStore};
use crate::sync::{RetryPolicy, SubstitutionMode, SyncEngine, SyncReport};
use crate::transport::Transport;

/// Outcome of a user-triggered sync action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncNotification {
  Success,
  Failure,
}

/// Receives one notification per sync action.
pub trait SyncNotifier: Send + Sync {
  fn notify(&self, notification: SyncNotification);
}

impl<F> SyncNotifier for F
where
  F: Fn(SyncNotification) + Send + Sync,
{
  fn notify(&self, notification: SyncNotification) {
    self(notification)
  }
}

/// Notifier that only logs.
pub struct LogNotifier;

impl SyncNotifier for LogNotifier {
  fn notify(&self, notification: SyncNotification) {
    match notification {
      SyncNotification::Success => tracing::info!("Synchronization finished"),
      SyncNotification::Failure => {
        tracing::warn!("Synchronization failed, please try again later")
      }
    }
  }
}

/// Offline support for one client: queue, admission, projection and sync.
pub struct OfflineService {
  store: Arc<RequestStore>,
  connectivity: Connectivity,
  transport: Arc<dyn Transport>,
  interceptor: Interceptor,
  engine: SyncEngine,
  notifier: Arc<dyn SyncNotifier>,
}

impl OfflineService {
  /// Assemble the service from configuration.
  pub fn new(
    config: &Config,
    storage: impl QueueStorage + 'static,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
  ) -> Self {
    ServiceBuilder::new(storage, transport)
      .connectivity(connectivity)
      .offline(config.offline.clone())
      .policy(RetryPolicy::from(&config.sync))
      .build()
  }

  pub fn builder(storage: impl QueueStorage + 'static, transport: Arc<dyn Transport>) -> ServiceBuilder {
    ServiceBuilder::new(storage, transport)
  }

  pub fn is_offline(&self) -> bool {
    self.connectivity.is_offline()
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn cached_requests(&self) -> Vec<CachedRequest> {
    self.store.current()
  }

  pub fn set_cached_requests(&self, requests: Vec<CachedRequest>) -> Result<()> {
    self.store.replace(requests)
  }

  pub fn has_pending(&self) -> bool {
    !self.store.is_empty()
  }

  pub fn pending_count(&self) -> usize {
    self.store.len()
  }

  /// Queue changes, starting with the current queue.
  pub fn subscribe(&self) -> QueueSubscription {
    self.store.subscribe()
  }

  /// Send a request through the admission filter.
  pub async fn request(&self, request: OutgoingRequest) -> Result<Value> {
    self
      .interceptor
      .intercept(request, self.transport.as_ref())
      .await
  }

  pub fn interceptor(&self) -> &Interceptor {
    &self.interceptor
  }

  /// Confirmed entities of `entity_type` with queued mutations applied.
  pub fn apply_offline_data(&self, entity_type: &str, entities: &[Value]) -> Vec<Value> {
    let queue = self.store.current();
    projection::apply_offline_data(&queue, entity_type, entities)
  }

  pub fn apply_offline_entities<T: OfflineEntity>(&self, entities: &[T]) -> Result<Vec<T>> {
    let queue = self.store.current();
    projection::apply_offline_entities(&queue, entities)
  }

  /// Sync a single request. Returns whether it reached the server.
  pub async fn sync(&self, request: &CachedRequest) -> bool {
    match self.engine.sync(request).await {
      Ok(()) => {
        self.notifier.notify(SyncNotification::Success);
        true
      }
      Err(SyncError::NotQueued(_)) => {
        tracing::info!("{} was already synced or discarded", request.display_value());
        false
      }
      Err(e) if e.is_deferral() => {
        tracing::info!("Deferred {}: {}", request.display_value(), e);
        false
      }
      Err(_) => {
        self.notifier.notify(SyncNotification::Failure);
        false
      }
    }
  }

  /// Run a sync pass over the whole queue. Returns whether the pass succeeded.
  pub async fn sync_all(&self) -> bool {
    self.sync_all_report().await.is_some()
  }

  /// Like [`Self::sync_all`], with the pass counts on success.
  pub async fn sync_all_report(&self) -> Option<SyncReport> {
    match self.engine.sync_all().await {
      Ok(report) => {
        self.notifier.notify(SyncNotification::Success);
        Some(report)
      }
      Err(_) => {
        self.notifier.notify(SyncNotification::Failure);
        None
      }
    }
  }

  /// Drop one request without sending it.
  pub fn remove_single_request(&self, request: &CachedRequest) -> Result<bool> {
    self.store.remove(&request.id)
  }

  /// Drop every queued request without sending anything.
  pub fn discard_all(&self) -> Result<()> {
    tracing::info!(discarded = self.store.len(), "Discarding offline changes");
    self.store.clear()
  }

  /// Run a sync pass on every offline to online transition.
  ///
  /// Runs until the surrounding task is dropped.
  pub async fn sync_on_reconnect(&self) {
    let mut rx = self.connectivity.subscribe();
    let mut was_offline = *rx.borrow_and_update();

    while rx.changed().await.is_ok() {
      let offline = *rx.borrow_and_update();
      if was_offline && !offline && self.has_pending() {
        tracing::info!(pending = self.pending_count(), "Back online, syncing queued requests");
        self.sync_all().await;
      }
      was_offline = offline;
    }
  }
}

/// Builder for [`OfflineService`] with test-friendly defaults.
pub struct ServiceBuilder {
  store: RequestStore,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  offline: OfflineConfig,
  policy: RetryPolicy,
  ids: Arc<dyn IdGenerator>,
  resolver: Option<Arc<MetadataResolver>>,
  notifier: Arc<dyn SyncNotifier>,
}

impl ServiceBuilder {
  pub fn new(storage: impl QueueStorage + 'static, transport: Arc<dyn Transport>) -> Self {
    Self {
      store: RequestStore::open(storage),
      transport,
      connectivity: Connectivity::default(),
      offline: OfflineConfig::default(),
      policy: RetryPolicy::default(),
      ids: Arc::new(UuidGenerator),
      resolver: None,
      notifier: Arc::new(LogNotifier),
    }
  }

  pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
    self.connectivity = connectivity;
    self
  }

  pub fn offline(mut self, offline: OfflineConfig) -> Self {
    self.offline = offline;
    self
  }

  pub fn policy(mut self, policy: RetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
    self.ids = ids;
    self
  }

  pub fn resolver(mut self, resolver: Arc<MetadataResolver>) -> Self {
    self.resolver = Some(resolver);
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn SyncNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn build(self) -> OfflineService {
    let store = Arc::new(self.store);

    let mut interceptor = Interceptor::new(
      store.clone(),
      self.connectivity.clone(),
      self.ids,
      self.offline.id_prefix.clone(),
      self.offline.excluded_endpoints.clone(),
    );
    if let Some(resolver) = self.resolver {
      interceptor = interceptor.with_resolver(resolver);
    }

    let mode = if self.offline.strict_dependencies {
      SubstitutionMode::Strict
    } else {
      SubstitutionMode::Substring
    };
    let engine = SyncEngine::new(
      store.clone(),
      self.transport.clone(),
      self.connectivity.clone(),
      self.offline.id_prefix,
    )
    .with_policy(self.policy)
    .with_mode(mode);

    OfflineService {
      store,
      connectivity: self.connectivity,
      transport: self.transport,
      interceptor,
      engine,
      notifier: self.notifier,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::RequestMetadata;
  use crate::queue::MemoryStorage;
  use crate::transport::mock::MockTransport;
  use reqwest::Method;
  use serde_json::json;
  use std::sync::Mutex;
  use std::time::Duration;

  struct Harness {
    service: Arc<OfflineService>,
    transport: Arc<MockTransport>,
    notifications: Arc<Mutex<Vec<SyncNotification>>>,
  }

  fn harness(transport: MockTransport, offline: bool) -> Harness {
    let transport = Arc::new(transport);
    let notifications = Arc::new(Mutex::new(Vec::new()));
    let sink = notifications.clone();

    let service = OfflineService::builder(MemoryStorage::new(), transport.clone())
      .connectivity(Connectivity::new(offline))
      .policy(RetryPolicy::once(Duration::from_secs(5)))
      .notifier(Arc::new(move |n: SyncNotification| sink.lock().unwrap().push(n)))
      .build();

    Harness {
      service: Arc::new(service),
      transport,
      notifications,
    }
  }

  fn create_item(name: &str) -> OutgoingRequest {
    OutgoingRequest::new(Method::POST, "/items")
      .with_body(json!({ "name": name }))
      .with_metadata(RequestMetadata::new("item"))
  }

  #[tokio::test]
  async fn test_offline_create_then_sync_all() {
    let h = harness(MockTransport::new().reply(json!({ "id": "42", "name": "a" })), true);

    let local = h.service.request(create_item("a")).await.unwrap();
    assert!(local["id"].as_str().unwrap().starts_with("offline "));
    assert_eq!(h.service.pending_count(), 1);
    assert_eq!(h.service.apply_offline_data("item", &[]).len(), 1);

    h.service.connectivity().set_offline(false);
    assert!(h.service.sync_all().await);

    assert!(!h.service.has_pending());
    assert!(h.service.apply_offline_data("item", &[]).is_empty());
    assert_eq!(h.transport.calls()[0].body, Some(json!({ "name": "a" })));
    assert_eq!(*h.notifications.lock().unwrap(), vec![SyncNotification::Success]);
  }

  #[tokio::test]
  async fn test_create_and_dependent_update_sync_in_order() {
    let h = harness(
      MockTransport::new()
        .reply(json!({ "id": "real-1" }))
        .reply(json!({ "id": "real-1", "name": "b" })),
      true,
    );

    let created = h.service.request(create_item("a")).await.unwrap();
    let placeholder = created["id"].as_str().unwrap().to_string();
    h.service
      .request(
        OutgoingRequest::new(Method::PATCH, format!("/items/{}", placeholder))
          .with_body(json!({ "name": "b" }))
          .with_metadata(RequestMetadata::new("item")),
      )
      .await
      .unwrap();

    let projected = h.service.apply_offline_data("item", &[]);
    assert_eq!(projected, vec![json!({ "id": placeholder, "name": "b" })]);

    h.service.connectivity().set_offline(false);
    assert!(h.service.sync_all().await);

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].url, "/items/real-1");
    assert!(!h.service.has_pending());
  }

  #[tokio::test]
  async fn test_failed_pass_notifies_and_keeps_queue() {
    let h = harness(MockTransport::new().reply(json!({ "id": 1 })).fail("502"), true);
    h.service.request(create_item("a")).await.unwrap();
    h.service.request(create_item("b")).await.unwrap();
    let before = h.service.cached_requests();

    h.service.connectivity().set_offline(false);
    assert!(!h.service.sync_all().await);

    assert_eq!(h.service.cached_requests(), before);
    assert_eq!(*h.notifications.lock().unwrap(), vec![SyncNotification::Failure]);
  }

  #[tokio::test]
  async fn test_sync_while_offline_fails_without_network() {
    let h = harness(MockTransport::new(), true);
    h.service.request(create_item("a")).await.unwrap();
    let request = h.service.cached_requests()[0].clone();

    assert!(!h.service.sync(&request).await);
    assert!(h.transport.calls().is_empty());
    assert_eq!(h.service.pending_count(), 1);
    assert_eq!(*h.notifications.lock().unwrap(), vec![SyncNotification::Failure]);
  }

  #[tokio::test]
  async fn test_deferred_single_sync_is_silent() {
    let h = harness(MockTransport::new(), true);
    h.service.request(create_item("a")).await.unwrap();
    let placeholder = h.service.cached_requests()[0].body.as_ref().unwrap()["id"]
      .as_str()
      .unwrap()
      .to_string();
    h.service
      .request(
        OutgoingRequest::new(Method::DELETE, format!("/items/{}", placeholder))
          .with_metadata(RequestMetadata::new("item")),
      )
      .await
      .unwrap();

    h.service.connectivity().set_offline(false);
    let dependent = h.service.cached_requests()[1].clone();
    assert!(!h.service.sync(&dependent).await);
    assert!(h.notifications.lock().unwrap().is_empty());
    assert_eq!(h.service.pending_count(), 2);
  }

  #[tokio::test]
  async fn test_sync_of_already_sent_request_is_a_no_op() {
    let h = harness(MockTransport::new().reply(json!({ "id": "42" })), true);
    h.service.request(create_item("a")).await.unwrap();
    let stale = h.service.cached_requests()[0].clone();

    h.service.connectivity().set_offline(false);
    assert!(h.service.sync_all().await);
    assert!(!h.service.sync(&stale).await);

    assert_eq!(h.transport.calls().len(), 1);
    assert_eq!(*h.notifications.lock().unwrap(), vec![SyncNotification::Success]);
  }

  #[tokio::test]
  async fn test_login_is_never_queued() {
    let h = harness(MockTransport::new().fail("offline"), true);
    let result = h
      .service
      .request(OutgoingRequest::new(Method::POST, "/auth/login").with_body(json!({ "u": "x" })))
      .await;

    assert!(result.is_err());
    assert!(!h.service.has_pending());
  }

  struct FixedIds;

  impl IdGenerator for FixedIds {
    fn generate(&self) -> String {
      "fixed-1".to_string()
    }
  }

  #[tokio::test]
  async fn test_injected_id_generator_and_prefix() {
    let service = OfflineService::builder(MemoryStorage::new(), Arc::new(MockTransport::new()))
      .connectivity(Connectivity::offline())
      .offline(OfflineConfig {
        id_prefix: "pending".to_string(),
        ..OfflineConfig::default()
      })
      .id_generator(Arc::new(FixedIds))
      .build();

    let local = service.request(create_item("a")).await.unwrap();
    assert_eq!(local["id"], "pending fixed-1");
  }

  #[tokio::test]
  async fn test_remove_and_discard() {
    let h = harness(MockTransport::new(), true);
    h.service.request(create_item("a")).await.unwrap();
    h.service.request(create_item("b")).await.unwrap();

    let first = h.service.cached_requests()[0].clone();
    assert!(h.service.remove_single_request(&first).unwrap());
    assert_eq!(h.service.pending_count(), 1);

    h.service.discard_all().unwrap();
    assert!(!h.service.has_pending());
    assert!(h.transport.calls().is_empty());
  }

  #[tokio::test]
  async fn test_reconnect_triggers_sync() {
    let h = harness(MockTransport::new().reply(json!({ "id": 7 })), true);
    h.service.request(create_item("a")).await.unwrap();

    let service = h.service.clone();
    let watcher = tokio::spawn(async move { service.sync_on_reconnect().await });
    // Let the watcher subscribe while still offline.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut updates = h.service.subscribe();
    assert_eq!(updates.next().await.unwrap().len(), 1);

    h.service.connectivity().set_offline(false);
    let drained = tokio::time::timeout(Duration::from_secs(2), updates.next())
      .await
      .unwrap()
      .unwrap();
    assert!(drained.is_empty());

    watcher.abort();
  }
}
