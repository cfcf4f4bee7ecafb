//! Level-triggered online/offline signal.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared handle to the current connectivity state.
///
/// Cloning yields another handle to the same signal.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(offline: bool) -> Self {
    let (tx, _) = watch::channel(offline);
    Self { tx: Arc::new(tx) }
  }

  pub fn online() -> Self {
    Self::new(false)
  }

  pub fn offline() -> Self {
    Self::new(true)
  }

  pub fn is_offline(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record a new state. Observers are only woken on an actual transition.
  pub fn set_offline(&self, offline: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == offline {
        return false;
      }
      *current = offline;
      true
    });

    if changed {
      tracing::info!(offline, "Connectivity changed");
    }
  }

  /// Watch transitions; the receiver holds `true` while offline.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::online()
  }
}
