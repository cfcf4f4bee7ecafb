//! Replays the queue against the server.
//!
//! A pass repeatedly picks the first request that no longer references a
//! placeholder, sends it, drops it from the queue and rewrites the placeholder
//! it created into the server-assigned id everywhere else in the queue. Any
//! failure restores the queue as it was when the pass started.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::SyncError;
use crate::model::{id_as_text, CachedRequest, RequestMethod};
use crate::queue::RequestStore;
use crate::transport::Transport;

/// How placeholders are replaced once the server assigned a real id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubstitutionMode {
  /// Replace every occurrence in the serialized request
  #[default]
  Substring,
  /// Replace only whole JSON string values and whole url segments
  Strict,
}

/// Per-request timeout and retry behaviour.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub request_timeout: Duration,
  pub max_attempts: u32,
  /// Delay before the first retry; doubled for every further retry
  pub backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from(&SyncConfig::default())
  }
}

impl From<&SyncConfig> for RetryPolicy {
  fn from(config: &SyncConfig) -> Self {
    Self {
      request_timeout: config.request_timeout(),
      max_attempts: config.max_attempts.max(1),
      backoff: config.retry_backoff(),
    }
  }
}

impl RetryPolicy {
  /// Single attempt, no waiting; used where retries would only slow things down.
  pub fn once(request_timeout: Duration) -> Self {
    Self {
      request_timeout,
      max_attempts: 1,
      backoff: Duration::ZERO,
    }
  }

  fn delay_before(&self, attempt: u32) -> Duration {
    // attempt is 1-based and only called for retries (>= 2)
    self.backoff * 2u32.saturating_pow(attempt.saturating_sub(2))
  }
}

/// Counts from a completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Requests accepted by the server
  pub sent: usize,
  /// Requests left queued because they still wait on a placeholder
  pub deferred: usize,
}

pub struct SyncEngine {
  store: Arc<RequestStore>,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  id_prefix: String,
  policy: RetryPolicy,
  mode: SubstitutionMode,
}

impl SyncEngine {
  pub fn new(
    store: Arc<RequestStore>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    id_prefix: impl Into<String>,
  ) -> Self {
    Self {
      store,
      transport,
      connectivity,
      id_prefix: id_prefix.into(),
      policy: RetryPolicy::default(),
      mode: SubstitutionMode::default(),
    }
  }

  pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_mode(mut self, mode: SubstitutionMode) -> Self {
    self.mode = mode;
    self
  }

  /// Whether the request still mentions a placeholder anywhere.
  ///
  /// A create's own placeholder id is not sent, so it does not count.
  pub fn has_unresolved_dependency(&self, request: &CachedRequest) -> bool {
    if request.url.contains(&self.id_prefix) {
      return true;
    }
    payload(request).is_some_and(|body| body.to_string().contains(&self.id_prefix))
  }

  /// Sync exactly one request.
  ///
  /// The queued copy is sent, not the caller's. The queue is only written once
  /// the server accepted the request, so a failure leaves it untouched.
  pub async fn sync(&self, request: &CachedRequest) -> Result<(), SyncError> {
    let Some(queued) = self
      .store
      .current()
      .into_iter()
      .find(|r| r.id == request.id)
    else {
      return Err(SyncError::NotQueued(request.id.clone()));
    };

    let result = self.sync_one(&queued).await;
    match &result {
      Err(e) if e.is_deferral() => tracing::debug!("{}", e),
      Err(e) => tracing::warn!("Sync of {} failed: {}", queued.display_value(), e),
      Ok(()) => {}
    }
    result
  }

  /// Drain the queue in dependency order.
  ///
  /// All or nothing: if any request fails, everything sent during this pass is
  /// put back. Requests that still wait on a placeholder when nothing else is
  /// sendable stay queued and are counted as deferred.
  pub async fn sync_all(&self) -> Result<SyncReport, SyncError> {
    if self.connectivity.is_offline() {
      return Err(SyncError::Offline);
    }

    let prior_queue = self.store.current();
    let mut report = SyncReport::default();

    loop {
      let queue = self.store.current();
      if queue.is_empty() {
        break;
      }

      let Some(next) = queue
        .iter()
        .find(|r| !self.has_unresolved_dependency(r))
        .cloned()
      else {
        report.deferred = queue.len();
        tracing::info!(deferred = report.deferred, "No sendable request left in pass");
        break;
      };

      if let Err(e) = self.sync_one(&next).await {
        if report.sent > 0 {
          self.rollback(&prior_queue, &e);
        } else {
          tracing::warn!("Sync failed before anything was sent: {}", e);
        }
        return Err(e);
      }
      report.sent += 1;
    }

    if report.deferred == 0 {
      // Write the terminal empty state; anything admitted since the last
      // check is kept for the next pass.
      self
        .store
        .update(|queue| {
          if !queue.is_empty() {
            tracing::debug!(admitted = queue.len(), "Requests admitted during sync pass");
          }
          Ok(())
        })
        .map_err(SyncError::storage)?;
    }

    tracing::info!(sent = report.sent, deferred = report.deferred, "Sync pass finished");
    Ok(report)
  }

  /// Send one request and fold the result into the queue.
  ///
  /// Does not roll back on its own; callers own the snapshot.
  async fn sync_one(&self, request: &CachedRequest) -> Result<(), SyncError> {
    if self.connectivity.is_offline() {
      return Err(SyncError::Offline);
    }
    if self.has_unresolved_dependency(request) {
      return Err(SyncError::UnresolvedDependency(request.id.clone()));
    }

    tracing::debug!(request = %request.id, label = %request.display_value(), "Sending queued request");
    let response = self.send_with_retry(request).await?;

    let placeholder = request
      .body_id()
      .and_then(id_as_text)
      .filter(|id| id.starts_with(&self.id_prefix));
    let assigned = response
      .get(&request.metadata.id_key)
      .and_then(id_as_text);

    self
      .store
      .update(|queue| {
        queue.retain(|r| r.id != request.id);

        if let (Some(placeholder), Some(assigned)) = (&placeholder, &assigned) {
          if placeholder != assigned && !queue.is_empty() {
            *queue = self.substitute(queue, placeholder, assigned)?;
          }
        }
        Ok(())
      })
      .map_err(SyncError::storage)
  }

  async fn send_with_retry(&self, request: &CachedRequest) -> Result<Value, SyncError> {
    let mut attempt = 1;

    loop {
      let outcome = tokio::time::timeout(self.policy.request_timeout, self.send(request)).await;

      let error = match outcome {
        Ok(Ok(response)) => return Ok(response),
        Ok(Err(e)) => SyncError::Transport {
          request: request.id.clone(),
          message: format!("{:#}", e),
        },
        Err(_) => SyncError::Timeout {
          request: request.id.clone(),
          attempts: attempt,
        },
      };

      if attempt >= self.policy.max_attempts {
        return Err(error);
      }

      attempt += 1;
      tracing::warn!(request = %request.id, attempt, "Retrying queued request: {}", error);
      tokio::time::sleep(self.policy.delay_before(attempt)).await;
    }
  }

  async fn send(&self, request: &CachedRequest) -> Result<Value> {
    let body = payload(request).unwrap_or(Value::Null);
    match &request.method {
      RequestMethod::Create => self.transport.create(&request.url, &body).await,
      RequestMethod::Update => self.transport.update(&request.url, &body).await,
      RequestMethod::Delete => {
        self.transport.delete(&request.url).await?;
        Ok(Value::Null)
      }
      RequestMethod::Other(verb) => Err(eyre!("Cannot replay request with method {}", verb)),
    }
  }

  /// Rewrite `placeholder` into `assigned` across the remaining queue.
  fn substitute(&self, queue: &[CachedRequest], placeholder: &str, assigned: &str) -> Result<Vec<CachedRequest>> {
    match self.mode {
      SubstitutionMode::Substring => substitute_text(queue, placeholder, assigned),
      SubstitutionMode::Strict => Ok(
        queue
          .iter()
          .map(|r| substitute_strict(r, placeholder, assigned))
          .collect(),
      ),
    }
  }

  fn rollback(&self, prior_queue: &[CachedRequest], cause: &SyncError) {
    tracing::warn!("Sync failed, restoring queue: {}", cause);

    if let Err(e) = self.store.restore(prior_queue) {
      tracing::error!("Failed to restore queue after sync failure: {:#}", e);
    }
  }
}

/// The body as it goes over the wire: creates lose their placeholder id so the
/// server assigns the real one.
fn payload(request: &CachedRequest) -> Option<Value> {
  let mut body = request.body.clone()?;
  if request.method == RequestMethod::Create {
    if let Value::Object(fields) = &mut body {
      fields.remove(&request.metadata.id_key);
    }
  }
  Some(body)
}

/// Textual replacement over the serialized queue.
///
/// A placeholder that happens to be a substring of an unrelated value is
/// rewritten too.
fn substitute_text(queue: &[CachedRequest], placeholder: &str, assigned: &str) -> Result<Vec<CachedRequest>> {
  let serialized =
    serde_json::to_string(queue).map_err(|e| eyre!("Failed to serialize queue: {}", e))?;

  // Both sides are spliced into JSON string literals, so escape them alike.
  let from = json_escaped(placeholder)?;
  let to = json_escaped(assigned)?;

  serde_json::from_str(&serialized.replace(&from, &to))
    .map_err(|e| eyre!("Failed to parse queue after id substitution: {}", e))
}

fn json_escaped(s: &str) -> Result<String> {
  let quoted =
    serde_json::to_string(s).map_err(|e| eyre!("Failed to escape identifier: {}", e))?;
  Ok(quoted[1..quoted.len() - 1].to_string())
}

fn substitute_strict(request: &CachedRequest, placeholder: &str, assigned: &str) -> CachedRequest {
  let mut request = request.clone();
  request.url = substitute_url(&request.url, placeholder, assigned);
  if let Some(body) = request.body.as_mut() {
    substitute_value(body, placeholder, assigned);
  }
  request
}

fn substitute_value(value: &mut Value, placeholder: &str, assigned: &str) {
  match value {
    Value::String(s) if *s == placeholder => *s = assigned.to_string(),
    Value::Array(items) => items
      .iter_mut()
      .for_each(|item| substitute_value(item, placeholder, assigned)),
    Value::Object(fields) => fields
      .values_mut()
      .for_each(|field| substitute_value(field, placeholder, assigned)),
    _ => {}
  }
}

/// Replace url path segments and query values equal to the placeholder.
///
/// Placeholders contain a space, so they may appear raw or percent-encoded.
fn substitute_url(url: &str, placeholder: &str, assigned: &str) -> String {
  let encoded = placeholder.replace(' ', "%20");
  let is_placeholder = |part: &str| part == placeholder || part == encoded;

  let (path, query) = match url.split_once('?') {
    Some((path, query)) => (path, Some(query)),
    None => (url, None),
  };

  let path = path
    .split('/')
    .map(|segment| if is_placeholder(segment) { assigned } else { segment })
    .collect::<Vec<_>>()
    .join("/");

  match query {
    None => path,
    Some(query) => {
      let query = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
          Some((key, value)) if is_placeholder(value) => format!("{}={}", key, assigned),
          _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
      format!("{}?{}", path, query)
    }
  }
}
