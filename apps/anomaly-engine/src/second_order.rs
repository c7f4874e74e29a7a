use crate::algorithms::stats::moments;
use crate::series::{decode_in_order, encode, DataPoint};
use crate::store::{trigger_history_key, SeriesStore, StoreError, TxOp, TxOutcome};
use std::sync::Arc;

/// Triggers repeating the last recorded value within this many seconds are duplicates.
pub const DUPLICATE_WINDOW_SECONDS: i64 = 300;
const MAX_ATTEMPTS: usize = 5;

/// Second-order gate: surfaces a trigger only when the metric's trigger cadence is irregular.
///
/// History lives in the store under `trigger_history.<metric>` as packed `[timestamp, value]`
/// pairs and is updated with the same watch/exec discipline as the vacuum.
#[derive(Clone)]
pub struct TriggerFilter {
    store: Arc<dyn SeriesStore>,
}

impl TriggerFilter {
    pub fn new(store: Arc<dyn SeriesStore>) -> Self {
        Self { store }
    }

    /// Returns `true` when the trigger should surface.
    pub async fn evaluate(
        &self,
        metric: &str,
        timestamp: i64,
        value: f64,
    ) -> Result<bool, StoreError> {
        let key = trigger_history_key(metric);
        let trigger = DataPoint::new(timestamp, value);

        for attempt in 1..=MAX_ATTEMPTS {
            let guard = self.store.watch(&key).await?;
            let mut history = match guard.value.as_deref() {
                Some(blob) => decode_in_order(blob)?,
                None => Vec::new(),
            };

            if let Some(last) = history.last() {
                if last.value == value && timestamp - last.timestamp <= DUPLICATE_WINDOW_SECONDS {
                    tracing::debug!(metric = %metric, timestamp, "duplicate trigger suppressed");
                    return Ok(false);
                }
            }

            let first_trigger = history.is_empty();
            history.push(trigger);
            let ops = vec![TxOp::Set {
                key: key.clone(),
                value: encode(&history)?,
            }];
            match self.store.exec(&guard, ops).await? {
                TxOutcome::Committed if first_trigger => return Ok(true),
                TxOutcome::Committed => return Ok(irregular_cadence(&history)),
                TxOutcome::Conflict => {
                    tracing::debug!(metric = %metric, attempt, "trigger history changed; retrying");
                }
            }
        }

        Err(StoreError::Unavailable(format!(
            "trigger history for {metric} kept changing after {MAX_ATTEMPTS} attempts"
        )))
    }
}

/// Whether the latest inter-trigger interval is more than three sigma from the mean interval.
fn irregular_cadence(history: &[DataPoint]) -> bool {
    let intervals: Vec<f64> = history
        .windows(2)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp) as f64)
        .collect();
    let (Some(latest), Some(stats)) = (intervals.last(), moments(&intervals)) else {
        return false;
    };
    match stats.stdev {
        Some(stdev) => (latest - stats.mean).abs() > 3.0 * stdev,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::Result;

    async fn history_len(store: &MemoryStore, metric: &str) -> Result<usize> {
        let blob = store.get(&trigger_history_key(metric)).await?;
        Ok(match blob {
            Some(blob) => decode_in_order(&blob)?.len(),
            None => 0,
        })
    }

    #[tokio::test]
    async fn first_trigger_always_surfaces() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let filter = TriggerFilter::new(store.clone());

        assert!(filter.evaluate("m", 1_000, 5.0).await?);
        assert_eq!(history_len(&store, "m").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_trigger_within_window_is_suppressed_without_append() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let filter = TriggerFilter::new(store.clone());

        assert!(filter.evaluate("m", 1_000, 5.0).await?);
        assert!(!filter.evaluate("m", 1_120, 5.0).await?);
        assert_eq!(history_len(&store, "m").await?, 1);

        // same value but outside the window is a new trigger
        filter.evaluate("m", 1_400, 5.0).await?;
        assert_eq!(history_len(&store, "m").await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn regular_cadence_is_suppressed_and_break_in_cadence_surfaces() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let filter = TriggerFilter::new(store.clone());

        let mut ts = 0;
        for i in 0..13 {
            let surfaced = filter.evaluate("m", ts, i as f64).await?;
            if i > 0 {
                assert!(!surfaced, "regular trigger {i} surfaced");
            }
            ts += 600;
        }
        // a long gap breaks the cadence
        assert!(filter.evaluate("m", ts + 20_000, 99.0).await?);
        assert_eq!(history_len(&store, "m").await?, 14);
        Ok(())
    }

    #[tokio::test]
    async fn triggers_sharing_a_second_are_both_recorded() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let filter = TriggerFilter::new(store.clone());

        assert!(filter.evaluate("m", 1_000, 5.0).await?);
        filter.evaluate("m", 1_000, 7.0).await?;
        assert_eq!(history_len(&store, "m").await?, 2);

        // the last entry is the latest write, so a repeat of 7.0 is the duplicate
        assert!(!filter.evaluate("m", 1_010, 7.0).await?);
        assert_eq!(history_len(&store, "m").await?, 2);
        Ok(())
    }

    #[test]
    fn cadence_needs_two_intervals() {
        let history = vec![DataPoint::new(0, 1.0), DataPoint::new(60, 2.0)];
        assert!(!irregular_cadence(&history));
        assert!(!irregular_cadence(&[]));
    }
}
