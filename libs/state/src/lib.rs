//! Bee State: Dictionaries with Transactional Staging
//!
//! Each bee owns a set of named key-value dictionaries. Outside a
//! transaction, operations apply directly. Inside one, writes are staged as
//! intents keyed by (dict, key) with last-write-wins semantics, reads see the
//! stage first, and iteration merges the stage over the underlying entries.
//! Commit applies the staged ops in insertion order; abort discards them.
//!
//! The backing store is pluggable through [`StateBackend`]; the reference
//! implementation is [`InMemoryBackend`].

mod memory;

pub use memory::InMemoryBackend;

use hivemind_types::{HiveError, Result, TxOp};
use std::collections::HashMap;

/// Pluggable key-value store underneath the transactional layer.
pub trait StateBackend: Send + 'static {
    fn get(&self, dict: &str, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&mut self, dict: &str, key: &[u8], value: &[u8]);
    /// Returns true if the key existed.
    fn del(&mut self, dict: &str, key: &[u8]) -> bool;
    fn for_each(&self, dict: &str, f: &mut dyn FnMut(&[u8], &[u8]));
    fn dict_names(&self) -> Vec<String>;
}

/// A bee's state: a backend plus an optional open transaction.
///
/// At most one transaction can be open at a time.
pub struct TxState<B: StateBackend = InMemoryBackend> {
    backend: B,
    stage: Option<Stage>,
}

/// Staged intents in insertion order, with an index for last-write-wins
/// overwrites.
#[derive(Default)]
struct Stage {
    ops: Vec<TxOp>,
    index: HashMap<(String, Vec<u8>), usize>,
}

impl Stage {
    fn record(&mut self, op: TxOp) {
        let slot = (op.dict().to_string(), op.key().to_vec());
        match self.index.get(&slot) {
            Some(&i) => self.ops[i] = op,
            None => {
                self.index.insert(slot, self.ops.len());
                self.ops.push(op);
            }
        }
    }

    fn lookup(&self, dict: &str, key: &[u8]) -> Option<&TxOp> {
        self.index
            .get(&(dict.to_string(), key.to_vec()))
            .map(|&i| &self.ops[i])
    }
}

impl Default for TxState<InMemoryBackend> {
    fn default() -> Self {
        Self::new(InMemoryBackend::default())
    }
}

impl<B: StateBackend> TxState<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            stage: None,
        }
    }

    /// A handle on the named dictionary. Dictionaries are created lazily on
    /// first write. While a transaction is open the handle reads through the
    /// stage and writes into it.
    pub fn dict<'a>(&'a mut self, name: &str) -> DictRef<'a, B> {
        DictRef {
            state: self,
            name: name.to_string(),
        }
    }

    pub fn in_tx(&self) -> bool {
        self.stage.is_some()
    }

    pub fn begin_tx(&mut self) -> Result<()> {
        if self.stage.is_some() {
            return Err(HiveError::invalid_state("transaction already open"));
        }
        self.stage = Some(Stage::default());
        Ok(())
    }

    /// Applies the staged ops to the backend in insertion order and closes
    /// the transaction.
    pub fn commit_tx(&mut self) -> Result<()> {
        let stage = self
            .stage
            .take()
            .ok_or_else(|| HiveError::invalid_state("no open transaction"))?;
        apply_ops(&mut self.backend, &stage.ops);
        Ok(())
    }

    pub fn abort_tx(&mut self) -> Result<()> {
        if self.stage.take().is_none() {
            return Err(HiveError::invalid_state("no open transaction"));
        }
        Ok(())
    }

    /// The staged operations in insertion order; empty when no transaction
    /// is open.
    pub fn tx(&self) -> Vec<TxOp> {
        self.stage.as_ref().map(|s| s.ops.clone()).unwrap_or_default()
    }

    /// Applies already-committed ops directly to the backend, bypassing any
    /// stage. Used when replaying replicated transactions.
    pub fn apply_ops(&mut self, ops: &[TxOp]) {
        apply_ops(&mut self.backend, ops);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

fn apply_ops<B: StateBackend>(backend: &mut B, ops: &[TxOp]) {
    for op in ops {
        match op {
            TxOp::Put { dict, key, value } => backend.put(dict, key, value),
            TxOp::Del { dict, key } => {
                backend.del(dict, key);
            }
        }
    }
}

/// Handle on one named dictionary of a [`TxState`].
pub struct DictRef<'a, B: StateBackend> {
    state: &'a mut TxState<B>,
    name: String,
}

impl<B: StateBackend> DictRef<'_, B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(stage) = &self.state.stage {
            if let Some(op) = stage.lookup(&self.name, key) {
                return match op {
                    TxOp::Put { value, .. } => Some(value.clone()),
                    TxOp::Del { .. } => None,
                };
            }
        }
        self.state.backend.get(&self.name, key)
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let (key, value) = (key.into(), value.into());
        match &mut self.state.stage {
            Some(stage) => stage.record(TxOp::Put {
                dict: self.name.clone(),
                key,
                value,
            }),
            None => self.state.backend.put(&self.name, &key, &value),
        }
    }

    pub fn del(&mut self, key: &[u8]) {
        match &mut self.state.stage {
            Some(stage) => stage.record(TxOp::Del {
                dict: self.name.clone(),
                key: key.to_vec(),
            }),
            None => {
                self.state.backend.del(&self.name, key);
            }
        }
    }

    /// Visits every key exactly once: underlying keys with staged overrides
    /// applied and staged deletions skipped, then staged puts on keys the
    /// backend does not hold yet.
    pub fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8])) {
        let stage = self.state.stage.as_ref();
        let mut seen: Vec<Vec<u8>> = Vec::new();
        self.state.backend.for_each(&self.name, &mut |k, v| {
            match stage.and_then(|s| s.lookup(&self.name, k)) {
                Some(TxOp::Put { value, .. }) => {
                    seen.push(k.to_vec());
                    f(k, value);
                }
                Some(TxOp::Del { .. }) => {
                    seen.push(k.to_vec());
                }
                None => f(k, v),
            }
        });
        if let Some(stage) = stage {
            for op in &stage.ops {
                if op.dict() != self.name {
                    continue;
                }
                if let TxOp::Put { key, value, .. } = op {
                    if !seen.contains(key) && self.state.backend.get(&self.name, key).is_none() {
                        f(key, value);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(state: &mut TxState, dict: &str, key: &str, value: &str) {
        state.dict(dict).put(key.as_bytes(), value.as_bytes());
    }

    fn get(state: &mut TxState, dict: &str, key: &str) -> Option<Vec<u8>> {
        state.dict(dict).get(key.as_bytes())
    }

    #[test]
    fn direct_access_outside_tx() {
        let mut state = TxState::default();
        put(&mut state, "c", "x", "1");
        assert_eq!(get(&mut state, "c", "x"), Some(b"1".to_vec()));
        state.dict("c").del(b"x");
        assert_eq!(get(&mut state, "c", "x"), None);
    }

    #[test]
    fn begin_tx_twice_is_invalid_state() {
        let mut state = TxState::default();
        state.begin_tx().unwrap();
        assert!(matches!(
            state.begin_tx(),
            Err(HiveError::InvalidState(_))
        ));
    }

    #[test]
    fn commit_without_tx_is_invalid_state() {
        let mut state = TxState::default();
        assert!(matches!(state.commit_tx(), Err(HiveError::InvalidState(_))));
        assert!(matches!(state.abort_tx(), Err(HiveError::InvalidState(_))));
    }

    #[test]
    fn staged_reads_and_last_write_wins() {
        let mut state = TxState::default();
        put(&mut state, "c", "x", "old");
        state.begin_tx().unwrap();
        put(&mut state, "c", "x", "mid");
        put(&mut state, "c", "x", "new");
        assert_eq!(get(&mut state, "c", "x"), Some(b"new".to_vec()));
        state.dict("c").del(b"x");
        assert_eq!(get(&mut state, "c", "x"), None);

        // One intent per key, holding the last write.
        let ops = state.tx();
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], TxOp::Del { .. }));
    }

    #[test]
    fn abort_restores_pre_tx_values() {
        let mut state = TxState::default();
        put(&mut state, "c", "x", "1");
        state.begin_tx().unwrap();
        put(&mut state, "c", "x", "2");
        put(&mut state, "c", "y", "3");
        state.dict("c").del(b"x");
        state.abort_tx().unwrap();
        assert_eq!(get(&mut state, "c", "x"), Some(b"1".to_vec()));
        assert_eq!(get(&mut state, "c", "y"), None);
        assert!(state.tx().is_empty());
    }

    #[test]
    fn commit_applies_in_insertion_order() {
        let mut state = TxState::default();
        state.begin_tx().unwrap();
        put(&mut state, "c", "a", "1");
        put(&mut state, "c", "b", "2");
        state.dict("c").del(b"a");
        let ops = state.tx();
        assert_eq!(ops.len(), 2, "overwrite keeps one intent per key");
        state.commit_tx().unwrap();
        assert_eq!(get(&mut state, "c", "a"), None);
        assert_eq!(get(&mut state, "c", "b"), Some(b"2".to_vec()));
    }

    #[test]
    fn for_each_merges_stage_exactly_once() {
        let mut state = TxState::default();
        put(&mut state, "c", "kept", "1");
        put(&mut state, "c", "overridden", "old");
        put(&mut state, "c", "deleted", "gone");
        state.begin_tx().unwrap();
        put(&mut state, "c", "overridden", "new");
        put(&mut state, "c", "fresh", "2");
        state.dict("c").del(b"deleted");

        let mut visited: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        state
            .dict("c")
            .for_each(&mut |k, v| visited.push((k.to_vec(), v.to_vec())));
        visited.sort();

        let expect: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b"fresh".to_vec(), b"2".to_vec()),
            (b"kept".to_vec(), b"1".to_vec()),
            (b"overridden".to_vec(), b"new".to_vec()),
        ];
        assert_eq!(visited, expect);
    }

    #[test]
    fn tx_lists_exactly_the_staged_ops() {
        let mut state = TxState::default();
        state.begin_tx().unwrap();
        put(&mut state, "a", "k1", "v1");
        put(&mut state, "b", "k2", "v2");
        let ops = state.tx();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].dict(), "a");
        assert_eq!(ops[1].dict(), "b");
    }
}
