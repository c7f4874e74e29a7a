use super::{SeriesStore, StoreError, TxOp, TxOutcome, Watched};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    version: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
    sets: HashMap<String, BTreeSet<String>>,
    next_version: i64,
}

impl MemoryState {
    fn bump(&mut self) -> i64 {
        self.next_version += 1;
        self.next_version
    }

    fn put(&mut self, key: &str, value: Vec<u8>) {
        let version = self.bump();
        self.entries.insert(key.to_string(), Entry { value, version });
    }

    fn apply(&mut self, op: TxOp) {
        match op {
            TxOp::Set { key, value } => self.put(&key, value),
            TxOp::Delete { key } => {
                self.entries.remove(&key);
            }
            TxOp::RemoveMember { index, member } => {
                if let Some(set) = self.sets.get_mut(&index) {
                    set.remove(&member);
                    if set.is_empty() {
                        self.sets.remove(&index);
                    }
                }
            }
        }
    }
}

/// In-process store with the same versioning rules as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock()
            .map(|state| state.entries.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SeriesStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.lock()?;
        Ok(state.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.lock()?.put(key, value);
        Ok(())
    }

    async fn append(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let version = state.bump();
        let entry = state.entries.entry(key.to_string()).or_insert(Entry {
            value: Vec::new(),
            version,
        });
        entry.value.extend_from_slice(value);
        entry.version = version;
        Ok(())
    }

    async fn add_member(&self, index: &str, member: &str) -> Result<(), StoreError> {
        self.lock()?
            .sets
            .entry(index.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn members(&self, index: &str) -> Result<Vec<String>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .sets
            .get(index)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn watch(&self, key: &str) -> Result<Watched, StoreError> {
        let state = self.lock()?;
        let (value, version) = match state.entries.get(key) {
            Some(entry) => (Some(entry.value.clone()), Some(entry.version)),
            None => (None, None),
        };
        Ok(Watched::new(key, value, version))
    }

    async fn exec(&self, guard: &Watched, ops: Vec<TxOp>) -> Result<TxOutcome, StoreError> {
        let mut state = self.lock()?;
        let current = state.entries.get(&guard.key).map(|entry| entry.version);
        if current != guard.version() {
            return Ok(TxOutcome::Conflict);
        }
        for op in ops {
            state.apply(op);
        }
        Ok(TxOutcome::Committed)
    }
}
