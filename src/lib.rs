//! Offline request queue for HTTP clients.
//!
//! Mutations issued while offline are diverted into a durable queue
//! ([`interceptor`]), folded into locally displayed data ([`projection`]) and
//! replayed once the server is reachable again ([`sync`]), with placeholder ids
//! of not-yet-created entities rewritten to the ids the server assigns.

pub mod config;
pub mod connectivity;
pub mod error;
pub mod id;
pub mod interceptor;
pub mod logging;
pub mod model;
pub mod projection;
pub mod queue;
pub mod service;
pub mod sync;
pub mod transport;

pub use connectivity::Connectivity;
pub use error::SyncError;
pub use model::{CachedRequest, OutgoingRequest, RequestMetadata, RequestMethod};
pub use service::{OfflineService, SyncNotification, SyncNotifier};
