//! In-memory owner of the queue with write-through persistence and change
//! notification.

use color_eyre::{eyre::eyre, Result};
use futures::Stream;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::storage::QueueStorage;
use crate::model::CachedRequest;

const CHANNEL_CAPACITY: usize = 64;

/// Sole source of truth for the request queue.
///
/// Every mutation goes through a single lock, so read-modify-write cycles from
/// the admission filter and the sync engine never lose each other's updates.
pub struct RequestStore {
  storage: Box<dyn QueueStorage>,
  queue: Mutex<Vec<CachedRequest>>,
  tx: broadcast::Sender<Vec<CachedRequest>>,
}

impl RequestStore {
  /// Load the last persisted queue. Unreadable contents start an empty queue.
  pub fn open(storage: impl QueueStorage + 'static) -> Self {
    let queue = match storage.load() {
      Ok(Some(queue)) => queue,
      Ok(None) => Vec::new(),
      Err(e) => {
        tracing::warn!("Discarding unreadable offline queue: {:#}", e);
        Vec::new()
      }
    };
    tracing::debug!(pending = queue.len(), "Loaded offline queue");

    let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
    Self {
      storage: Box::new(storage),
      queue: Mutex::new(queue),
      tx,
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<CachedRequest>>> {
    self.queue.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Current queue value.
  pub fn current(&self) -> Vec<CachedRequest> {
    match self.queue.lock() {
      Ok(queue) => queue.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  pub fn len(&self) -> usize {
    match self.queue.lock() {
      Ok(queue) => queue.len(),
      Err(poisoned) => poisoned.into_inner().len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Persist `queue` and publish it. On a storage error nothing changes.
  pub fn replace(&self, queue: Vec<CachedRequest>) -> Result<()> {
    self.update(|current| {
      *current = queue;
      Ok(())
    })
  }

  /// Read-modify-write the queue under the store lock.
  ///
  /// `f` works on a copy; the copy is persisted and only then becomes the
  /// current value. If `f` or the write fails, the current value is untouched.
  pub fn update<R>(&self, f: impl FnOnce(&mut Vec<CachedRequest>) -> Result<R>) -> Result<R> {
    let mut guard = self.lock()?;
    let mut next = guard.clone();
    let result = f(&mut next)?;

    self.storage.save(&next)?;
    *guard = next.clone();
    // No subscribers is fine.
    let _ = self.tx.send(next);

    Ok(result)
  }

  /// Append a request at the end of the queue.
  pub fn push(&self, request: CachedRequest) -> Result<()> {
    self.update(|queue| {
      queue.push(request);
      Ok(())
    })
  }

  /// Remove the entry with the given request id. Returns whether it was queued.
  pub fn remove(&self, request_id: &str) -> Result<bool> {
    self.update(|queue| {
      let before = queue.len();
      queue.retain(|r| r.id != request_id);
      Ok(queue.len() != before)
    })
  }

  /// Empty the queue.
  pub fn clear(&self) -> Result<()> {
    self.replace(Vec::new())
  }

  /// Put back a snapshot, keeping anything admitted after it was taken.
  pub fn restore(&self, snapshot: &[CachedRequest]) -> Result<()> {
    self.update(|queue| {
      let known: HashSet<&str> = snapshot.iter().map(|r| r.id.as_str()).collect();
      let mut restored = snapshot.to_vec();
      restored.extend(
        queue
          .iter()
          .filter(|r| !known.contains(r.id.as_str()))
          .cloned(),
      );
      *queue = restored;
      Ok(())
    })
  }

  /// Subscribe to queue changes. The current value is delivered first.
  pub fn subscribe(&self) -> QueueSubscription {
    // Taking the lock orders the snapshot before any later publish.
    let (current, rx) = match self.queue.lock() {
      Ok(queue) => (queue.clone(), self.tx.subscribe()),
      Err(poisoned) => (poisoned.into_inner().clone(), self.tx.subscribe()),
    };

    QueueSubscription {
      pending: Some(current),
      rx,
    }
  }
}

/// Replay-latest-then-live view of the queue.
pub struct QueueSubscription {
  pending: Option<Vec<CachedRequest>>,
  rx: broadcast::Receiver<Vec<CachedRequest>>,
}

impl QueueSubscription {
  /// Receive the next queue value. `None` once the store is gone.
  pub async fn next(&mut self) -> Option<Vec<CachedRequest>> {
    if let Some(queue) = self.pending.take() {
      return Some(queue);
    }

    loop {
      match self.rx.recv().await {
        Ok(queue) => return Some(queue),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          tracing::debug!(skipped, "Queue subscriber lagged, skipping to newer values");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  pub fn into_stream(self) -> impl Stream<Item = Vec<CachedRequest>> {
    futures::stream::unfold(self, |mut sub| async move {
      sub.next().await.map(|queue| (queue, sub))
    })
  }
}
