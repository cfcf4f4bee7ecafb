//! Placeholder identifiers for entities that do not exist on the server yet.

use uuid::Uuid;

/// Produces opaque, process-unique identifiers.
pub trait IdGenerator: Send + Sync {
  fn generate(&self) -> String;
}

/// Random v4 uuids; unique across sessions without coordination.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
  fn generate(&self) -> String {
    Uuid::new_v4().to_string()
  }
}

/// Build a placeholder of the form `"<prefix> <generated-id>"`.
pub fn placeholder(prefix: &str, generator: &dyn IdGenerator) -> String {
  format!("{} {}", prefix, generator.generate())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn test_generated_ids_are_unique() {
    let ids: HashSet<String> = (0..1000).map(|_| UuidGenerator.generate()).collect();
    assert_eq!(ids.len(), 1000);
  }

  #[test]
  fn test_placeholder_format() {
    let id = placeholder("offline", &UuidGenerator);
    let (prefix, rest) = id.split_once(' ').unwrap();
    assert_eq!(prefix, "offline");
    assert!(Uuid::parse_str(rest).is_ok());
  }
}
