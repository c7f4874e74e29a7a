mod memory;
mod pg;


pub use memory::MemoryStore;
pub use pg::{build_pool, PgSeriesStore};

use crate::series::{encode_point, CodecError, DataPoint};
use async_trait::async_trait;

const INDEX_SUFFIX: &str = "unique_metrics";
const TRIGGER_HISTORY_PREFIX: &str = "trigger_history.";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Snapshot of a key taken under watch. `exec` only commits if the key's version is unchanged.
#[derive(Debug, Clone)]
pub struct Watched {
    pub key: String,
    pub value: Option<Vec<u8>>,
    version: Option<i64>,
}

impl Watched {
    pub(crate) fn new(key: impl Into<String>, value: Option<Vec<u8>>, version: Option<i64>) -> Self {
        Self {
            key: key.into(),
            value,
            version,
        }
    }

    pub(crate) fn version(&self) -> Option<i64> {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
    RemoveMember { index: String, member: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    Conflict,
}

/// Key-value store with set indexes and per-key optimistic transactions.
///
/// Every write to a key (set, append, transactional set/delete) bumps its version, so a
/// `watch` followed by `exec` behaves like WATCH/MULTI/EXEC: the batch applies atomically or
/// not at all.
#[async_trait]
pub trait SeriesStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Atomically appends bytes to the key's value, creating it if absent.
    async fn append(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn add_member(&self, index: &str, member: &str) -> Result<(), StoreError>;

    /// Members of an index set, sorted.
    async fn members(&self, index: &str) -> Result<Vec<String>, StoreError>;

    async fn watch(&self, key: &str) -> Result<Watched, StoreError>;

    async fn exec(&self, guard: &Watched, ops: Vec<TxOp>) -> Result<TxOutcome, StoreError>;
}

pub fn index_key(namespace: &str) -> String {
    format!("{namespace}{INDEX_SUFFIX}")
}

pub fn metric_key(namespace: &str, name: &str) -> String {
    format!("{namespace}{name}")
}

pub fn trigger_history_key(metric: &str) -> String {
    format!("{TRIGGER_HISTORY_PREFIX}{metric}")
}

/// Ingestion-side append: packs the point onto the metric's blob and registers the key in the
/// namespace index.
pub async fn append_datapoint(
    store: &dyn SeriesStore,
    namespace: &str,
    name: &str,
    point: DataPoint,
) -> Result<(), StoreError> {
    let key = metric_key(namespace, name);
    let packed = encode_point(&point)?;
    store.append(&key, &packed).await?;
    store.add_member(&index_key(namespace), &key).await?;
    tracing::trace!(key = %key, timestamp = point.timestamp, "appended datapoint");
    Ok(())
}
