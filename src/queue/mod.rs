//! Durable offline request queue.
//!
//! - `storage`: whole-queue persistence behind the `QueueStorage` trait
//! - `store`: the in-process owner of the queue, with change subscriptions

mod storage;
mod store;

pub use storage::{MemoryStorage, QueueStorage, SqliteStorage, REQUESTS_SLOT};
pub use store::{QueueSubscription, RequestStore};
