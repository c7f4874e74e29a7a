
use crate::series::{decode, encode};
use crate::store::{index_key, SeriesStore, StoreError, TxOp, TxOutcome, Watched};
use futures::future::join_all;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct VacuumSettings {
    pub full_namespace: String,
    pub mini_namespace: String,
    pub full_duration: i64,
    pub mini_duration: i64,
    pub skip_mini: bool,
    /// Workers per namespace; each owns one contiguous shard of the index.
    pub processes: usize,
    pub grace: i64,
    pub pass_timeout: Duration,
    /// Minimum wall-clock length of a cycle; shorter cycles sleep off the remainder.
    pub optimum_run: Duration,
}

impl Default for VacuumSettings {
    fn default() -> Self {
        Self {
            full_namespace: "metrics.".to_string(),
            mini_namespace: "mini.".to_string(),
            full_duration: 86_400,
            mini_duration: 3_600,
            skip_mini: false,
            processes: 1,
            grace: 600,
            pass_timeout: Duration::from_secs(100),
            optimum_run: Duration::from_secs(60),
        }
    }
}

/// One namespace and how long its points are kept, grace included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacuumTarget {
    pub namespace: String,
    pub retention: i64,
}

impl VacuumSettings {
    pub fn targets(&self) -> Vec<VacuumTarget> {
        let mut targets = vec![VacuumTarget {
            namespace: self.full_namespace.clone(),
            retention: self.full_duration + self.grace,
        }];
        if !self.skip_mini {
            targets.push(VacuumTarget {
                namespace: self.mini_namespace.clone(),
                retention: self.mini_duration + self.grace,
            });
        }
        targets
    }
}

/// Contiguous slice of the sorted index owned by one worker.
///
/// Every shard but the last holds `ceil(total / shards)` keys; the last takes what remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardAssignment {
    pub start: usize,
    pub end: usize,
}

impl ShardAssignment {
    pub fn compute(total: usize, shards: usize, index: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = total.div_ceil(shards);
        let start = (index * per_shard).min(total);
        let end = if index + 1 >= shards {
            total
        } else {
            ((index + 1) * per_shard).min(total)
        };
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EuthanizeReason {
    Missing,
    Corrupt,
    Empty,
    Stale,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    Trimmed { removed: usize },
    Unchanged,
    Euthanized(EuthanizeReason),
    Conflict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    pub keys: usize,
    pub trimmed: usize,
    pub unchanged: usize,
    pub euthanized: usize,
    pub points_removed: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl VacuumReport {
    fn record(&mut self, outcome: KeyOutcome) {
        match outcome {
            KeyOutcome::Trimmed { removed } => {
                self.keys += 1;
                self.trimmed += 1;
                self.points_removed += removed;
            }
            KeyOutcome::Unchanged => {
                self.keys += 1;
                self.unchanged += 1;
            }
            KeyOutcome::Euthanized(_) => {
                self.keys += 1;
                self.euthanized += 1;
            }
            KeyOutcome::Conflict => self.conflicts += 1,
        }
    }

    pub fn merge(&mut self, other: &VacuumReport) {
        self.keys += other.keys;
        self.trimmed += other.trimmed;
        self.unchanged += other.unchanged;
        self.euthanized += other.euthanized;
        self.points_removed += other.points_removed;
        self.conflicts += other.conflicts;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub report: VacuumReport,
    pub workers: usize,
    pub elapsed: Duration,
    pub timed_out: bool,
}

async fn euthanize(
    store: &dyn SeriesStore,
    index: &str,
    guard: &Watched,
    reason: EuthanizeReason,
) -> Result<KeyOutcome, StoreError> {
    let ops = vec![
        TxOp::Delete {
            key: guard.key.clone(),
        },
        TxOp::RemoveMember {
            index: index.to_string(),
            member: guard.key.clone(),
        },
    ];
    Ok(match store.exec(guard, ops).await? {
        TxOutcome::Committed => {
            tracing::debug!(key = %guard.key, reason = ?reason, "euthanized key");
            KeyOutcome::Euthanized(reason)
        }
        TxOutcome::Conflict => KeyOutcome::Conflict,
    })
}

/// Trims one key to points newer than `now - retention` under a watch guard.
///
/// A key whose series is gone, undecodable, empty, or wholly older than the cutoff is deleted
/// and dropped from the index in the same transaction.
pub async fn vacuum_key(
    store: &dyn SeriesStore,
    index: &str,
    key: &str,
    now: i64,
    retention: i64,
) -> Result<KeyOutcome, StoreError> {
    let guard = store.watch(key).await?;
    let Some(blob) = guard.value.as_deref() else {
        return euthanize(store, index, &guard, EuthanizeReason::Missing).await;
    };
    let series = match decode(blob) {
        Ok(series) => series,
        Err(err) => {
            tracing::info!(key = %key, error = %err, "undecodable series; euthanizing");
            return euthanize(store, index, &guard, EuthanizeReason::Corrupt).await;
        }
    };

    let cutoff = now - retention;
    let reason = match series.last() {
        None => Some(EuthanizeReason::Empty),
        Some(newest) if newest.timestamp < cutoff => Some(EuthanizeReason::Stale),
        Some(_) => None,
    };
    if let Some(reason) = reason {
        return euthanize(store, index, &guard, reason).await;
    }

    let kept: Vec<_> = series
        .iter()
        .filter(|point| point.timestamp > cutoff)
        .copied()
        .collect();
    if kept.is_empty() {
        return euthanize(store, index, &guard, EuthanizeReason::Expired).await;
    }

    let packed = encode(&kept)?;
    if packed == blob {
        return Ok(KeyOutcome::Unchanged);
    }
    let removed = series.len() - kept.len();
    let ops = vec![TxOp::Set {
        key: key.to_string(),
        value: packed,
    }];
    Ok(match store.exec(&guard, ops).await? {
        TxOutcome::Committed => KeyOutcome::Trimmed { removed },
        TxOutcome::Conflict => KeyOutcome::Conflict,
    })
}

/// Last resort after a failed vacuum: drop the key so it cannot fail every pass.
async fn discard(store: &dyn SeriesStore, index: &str, key: &str) {
    let result = match store.watch(key).await {
        Ok(guard) => euthanize(store, index, &guard, EuthanizeReason::Corrupt).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        tracing::warn!(key = %key, error = %err, "failed to discard key after vacuum error");
    }
}

/// Works through one shard. Keys that lose an optimistic-lock race go to the back of the queue
/// and are retried within the same pass.
pub async fn vacuum_shard(
    store: &dyn SeriesStore,
    target: &VacuumTarget,
    keys: Vec<String>,
    now: i64,
    cancel: &CancellationToken,
) -> VacuumReport {
    let index = index_key(&target.namespace);
    let mut queue: VecDeque<String> = keys.into();
    let mut report = VacuumReport::default();

    while let Some(key) = queue.pop_front() {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = vacuum_key(store, &index, &key, now, target.retention) => result,
        };
        match result {
            Ok(KeyOutcome::Conflict) => {
                report.record(KeyOutcome::Conflict);
                queue.push_back(key);
            }
            Ok(outcome) => report.record(outcome),
            Err(err) => {
                report.errors += 1;
                tracing::info!(key = %key, error = %err, "vacuum failed; euthanizing");
                discard(store, &index, &key).await;
            }
        }
    }
    report
}

/// One supervised pass over every namespace.
///
/// Each namespace index is listed once and split into shards, one worker per shard. If the
/// workers are not done within the pass timeout they are cancelled where they stand; keys they
/// did not reach are picked up next pass.
pub async fn run_vacuum_pass(
    store: Arc<dyn SeriesStore>,
    settings: &VacuumSettings,
    now: i64,
) -> Result<PassSummary, StoreError> {
    let started = Instant::now();
    let cancel = CancellationToken::new();
    let shards = settings.processes.max(1);
    let mut handles: Vec<JoinHandle<VacuumReport>> = Vec::new();

    // every index is listed before any worker starts, so a listing error leaves nothing running
    let mut listed = Vec::new();
    for target in settings.targets() {
        let keys = store.members(&index_key(&target.namespace)).await?;
        listed.push((target, keys));
    }

    for (target, keys) in listed {
        for shard in 0..shards {
            let assignment = ShardAssignment::compute(keys.len(), shards, shard);
            let shard_keys = keys[assignment.range()].to_vec();
            let store = Arc::clone(&store);
            let target = target.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                vacuum_shard(store.as_ref(), &target, shard_keys, now, &cancel).await
            }));
        }
    }

    let workers = handles.len();
    let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    let mut summary = PassSummary {
        workers,
        ..PassSummary::default()
    };

    match tokio::time::timeout(settings.pass_timeout, join_all(handles)).await {
        Ok(results) => {
            for result in results {
                match result {
                    Ok(report) => summary.report.merge(&report),
                    Err(err) => tracing::warn!(error = %err, "vacuum worker failed"),
                }
            }
        }
        Err(_) => {
            cancel.cancel();
            for handle in &abort_handles {
                handle.abort();
            }
            summary.timed_out = true;
            tracing::warn!(
                timeout_secs = settings.pass_timeout.as_secs(),
                workers,
                "vacuum pass timed out; workers cancelled"
            );
        }
    }

    summary.elapsed = started.elapsed();
    Ok(summary)
}

/// Repeats vacuum passes until cancelled.
pub struct VacuumService {
    store: Arc<dyn SeriesStore>,
    settings: VacuumSettings,
}

impl VacuumService {
    pub fn new(store: Arc<dyn SeriesStore>, settings: VacuumSettings) -> Self {
        Self { store, settings }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            processes = self.settings.processes,
            grace = self.settings.grace,
            skip_mini = self.settings.skip_mini,
            "vacuum service started"
        );
        loop {
            let started = Instant::now();
            let now = chrono::Utc::now().timestamp();
            // bounded by the pass timeout, so shutdown waits at most one pass
            match run_vacuum_pass(Arc::clone(&self.store), &self.settings, now).await {
                Ok(summary) => tracing::info!(
                    keys = summary.report.keys,
                    trimmed = summary.report.trimmed,
                    euthanized = summary.report.euthanized,
                    points_removed = summary.report.points_removed,
                    conflicts = summary.report.conflicts,
                    errors = summary.report.errors,
                    timed_out = summary.timed_out,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "vacuum pass complete"
                ),
                Err(err) => tracing::warn!(error = %err, "vacuum pass failed"),
            }

            let pause = self.settings.optimum_run.saturating_sub(started.elapsed());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        tracing::info!("vacuum service stopped");
    }
}
