//! Optimistic projection of queued mutations onto server-confirmed data.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::model::{id_as_text, CachedRequest, RequestMethod};

/// Entities that can be projected without naming their type at every call.
pub trait OfflineEntity: Serialize + DeserializeOwned {
  /// Type tag matching `RequestMetadata::entity_type` of requests that touch it
  fn entity_type() -> &'static str;
}

/// Replay queued requests of `entity_type` onto a copy of `entities`.
///
/// Creates are appended, updates are shallow-merged into the entity whose id
/// occurs in the request url, deletes remove that entity. Targets are looked up
/// in the working copy, so earlier queued creates of the same type can be hit.
/// Updates and deletes without a matching entity are skipped.
pub fn apply_offline_data(queue: &[CachedRequest], entity_type: &str, entities: &[Value]) -> Vec<Value> {
  let mut res = entities.to_vec();
  if queue.is_empty() {
    return res;
  }

  for request in queue
    .iter()
    .filter(|r| r.metadata.entity_type == entity_type)
  {
    match &request.method {
      RequestMethod::Create => {
        if let Some(body) = &request.body {
          res.push(body.clone());
        }
      }
      RequestMethod::Update => {
        let Some(index) = find_target(&res, request) else {
          continue;
        };
        if let Some(changes) = &request.body {
          merge_changes(&mut res[index], changes);
        }
      }
      RequestMethod::Delete => {
        if let Some(index) = find_target(&res, request) {
          res.remove(index);
        }
      }
      RequestMethod::Other(verb) => {
        tracing::error!(
          method = %verb,
          url = %request.url,
          "Unknown http method in cached offline request"
        );
      }
    }
  }

  res
}

/// Typed variant of [`apply_offline_data`] that round-trips through JSON.
pub fn apply_offline_entities<T: OfflineEntity>(queue: &[CachedRequest], entities: &[T]) -> Result<Vec<T>> {
  if queue.is_empty() {
    return reserialize_all(entities);
  }

  let values = entities
    .iter()
    .map(serde_json::to_value)
    .collect::<serde_json::Result<Vec<_>>>()
    .map_err(|e| eyre!("Failed to serialize {} entity: {}", T::entity_type(), e))?;

  apply_offline_data(queue, T::entity_type(), &values)
    .into_iter()
    .map(|value| {
      serde_json::from_value(value)
        .map_err(|e| eyre!("Failed to parse projected {} entity: {}", T::entity_type(), e))
    })
    .collect()
}

fn reserialize_all<T: OfflineEntity>(entities: &[T]) -> Result<Vec<T>> {
  entities
    .iter()
    .map(|entity| {
      serde_json::to_value(entity)
        .and_then(serde_json::from_value)
        .map_err(|e| eyre!("Failed to copy {} entity: {}", T::entity_type(), e))
    })
    .collect()
}

/// Index of the entity whose identity value appears in the request url.
fn find_target(entities: &[Value], request: &CachedRequest) -> Option<usize> {
  let id_key = &request.metadata.id_key;
  entities.iter().position(|entity| {
    entity
      .get(id_key)
      .and_then(id_as_text)
      .is_some_and(|id| !id.is_empty() && request.url.contains(&id))
  })
}

/// Overwrite only the fields present in `changes`.
fn merge_changes(entity: &mut Value, changes: &Value) {
  match (entity, changes) {
    (Value::Object(target), Value::Object(fields)) => {
      for (key, value) in fields {
        target.insert(key.clone(), value.clone());
      }
    }
    _ => {
      tracing::debug!("Skipping update of a non-object entity");
    }
  }
}
