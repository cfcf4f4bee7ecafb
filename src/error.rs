use thiserror::Error;

/// Why a sync attempt did not complete.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("client is offline")]
  Offline,

  #[error("request {0} is no longer queued")]
  NotQueued(String),

  #[error("request {0} references an entity that has not been created yet")]
  UnresolvedDependency(String),

  #[error("request {request} failed: {message}")]
  Transport { request: String, message: String },

  #[error("request {request} timed out after {attempts} attempt(s)")]
  Timeout { request: String, attempts: u32 },

  #[error("failed to persist queue: {0}")]
  Storage(String),
}

impl SyncError {
  /// Deferrals are expected and are not reported to the user as failures.
  pub fn is_deferral(&self) -> bool {
    matches!(self, Self::UnresolvedDependency(_))
  }

  pub(crate) fn storage(err: color_eyre::Report) -> Self {
    Self::Storage(format!("{:#}", err))
  }
}
