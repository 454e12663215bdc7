//! In-memory reference backend.

use crate::StateBackend;
use std::collections::BTreeMap;

/// Named in-memory maps; dictionaries appear on first write.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    dicts: BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl StateBackend for InMemoryBackend {
    fn get(&self, dict: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.dicts.get(dict).and_then(|d| d.get(key)).cloned()
    }

    fn put(&mut self, dict: &str, key: &[u8], value: &[u8]) {
        self.dicts
            .entry(dict.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
    }

    fn del(&mut self, dict: &str, key: &[u8]) -> bool {
        self.dicts
            .get_mut(dict)
            .map(|d| d.remove(key).is_some())
            .unwrap_or(false)
    }

    fn for_each(&self, dict: &str, f: &mut dyn FnMut(&[u8], &[u8])) {
        if let Some(d) = self.dicts.get(dict) {
            for (k, v) in d {
                f(k, v);
            }
        }
    }

    fn dict_names(&self) -> Vec<String> {
        self.dicts.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dicts_created_lazily() {
        let mut b = InMemoryBackend::default();
        assert!(b.dict_names().is_empty());
        assert_eq!(b.get("c", b"x"), None);
        b.put("c", b"x", b"1");
        assert_eq!(b.dict_names(), vec!["c".to_string()]);
        assert!(b.del("c", b"x"));
        assert!(!b.del("c", b"x"));
    }
}
