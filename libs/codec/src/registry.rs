//! The tag-to-type payload table.

use hivemind_types::{HiveError, Result};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::any::TypeId;
use std::collections::HashMap;

/// Registry of payload types, keyed both ways: tag → TypeId for conflict
/// detection, TypeId → tag for the encode path.
///
/// Shared behind an `Arc` between the hive, its bees, and the receive
/// contexts handed to handlers.
#[derive(Default)]
pub struct PayloadRegistry {
    inner: RwLock<Tables>,
}

#[derive(Default)]
struct Tables {
    by_tag: HashMap<String, TypeId>,
    by_type: HashMap<TypeId, String>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `tag`. Idempotent for the same (tag, type) pair;
    /// a tag collision with a different type is an encoding error.
    pub fn register<T: 'static>(&self, tag: &str) -> Result<()> {
        let mut tables = self.inner.write();
        let type_id = TypeId::of::<T>();
        match tables.by_tag.get(tag) {
            Some(existing) if *existing == type_id => Ok(()),
            Some(_) => Err(HiveError::encoding(format!(
                "payload tag {tag:?} already registered for a different type"
            ))),
            None => {
                if let Some(prev) = tables.by_type.get(&type_id) {
                    return Err(HiveError::encoding(format!(
                        "payload type already registered under tag {prev:?}"
                    )));
                }
                tables.by_tag.insert(tag.to_string(), type_id);
                tables.by_type.insert(type_id, tag.to_string());
                Ok(())
            }
        }
    }

    /// The tag a type was registered under.
    pub fn tag_of<T: 'static>(&self) -> Result<String> {
        self.inner
            .read()
            .by_type
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| {
                HiveError::encoding(format!(
                    "payload type {} is not registered",
                    std::any::type_name::<T>()
                ))
            })
    }

    pub fn is_registered_tag(&self, tag: &str) -> bool {
        self.inner.read().by_tag.contains_key(tag)
    }

    /// Encodes a registered payload, returning its tag and bytes.
    pub fn encode<T: Serialize + 'static>(&self, value: &T) -> Result<(String, Vec<u8>)> {
        let tag = self.tag_of::<T>()?;
        let bytes = bincode::serialize(value)
            .map_err(|e| HiveError::encoding(format!("payload encode ({tag}): {e}")))?;
        Ok((tag, bytes))
    }

    /// Decodes payload bytes as `T`. The caller names the type; the tag on
    /// the envelope picked the handler that knows it.
    pub fn decode<T: DeserializeOwned + 'static>(&self, tag: &str, bytes: &[u8]) -> Result<T> {
        if !self.is_registered_tag(tag) {
            return Err(HiveError::encoding(format!(
                "payload tag {tag:?} is not registered"
            )));
        }
        bincode::deserialize(bytes)
            .map_err(|e| HiveError::encoding(format!("payload decode ({tag}): {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Inc {
        key: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Dec {
        key: String,
    }

    #[test]
    fn register_twice_is_idempotent() {
        let reg = PayloadRegistry::new();
        reg.register::<Inc>("inc").unwrap();
        reg.register::<Inc>("inc").unwrap();
        assert_eq!(reg.tag_of::<Inc>().unwrap(), "inc");
    }

    #[test]
    fn tag_collision_is_rejected() {
        let reg = PayloadRegistry::new();
        reg.register::<Inc>("inc").unwrap();
        let err = reg.register::<Dec>("inc").unwrap_err();
        assert_eq!(err.category(), "encoding");
    }

    #[test]
    fn unregistered_type_fails_on_the_sender() {
        let reg = PayloadRegistry::new();
        let err = reg.encode(&Inc { key: "x".into() }).unwrap_err();
        assert_eq!(err.category(), "encoding");
    }

    #[test]
    fn encode_decode_roundtrip() {
        let reg = PayloadRegistry::new();
        reg.register::<Inc>("inc").unwrap();
        let value = Inc { key: "x".into() };
        let (tag, bytes) = reg.encode(&value).unwrap();
        assert_eq!(tag, "inc");
        let back: Inc = reg.decode(&tag, &bytes).unwrap();
        assert_eq!(back, value);
    }
}
