use crate::series::{decode, Series};
use crate::store::{metric_key, SeriesStore, StoreError};
use std::sync::Arc;

/// Read-only view of the store for analysis. Each read returns an owned, decoded snapshot.
#[derive(Clone)]
pub struct WindowReader {
    store: Arc<dyn SeriesStore>,
}

impl WindowReader {
    pub fn new(store: Arc<dyn SeriesStore>) -> Self {
        Self { store }
    }

    /// `Ok(None)` when the key does not exist. A blob that fails to decode is an error; the
    /// vacuum removes such keys on its next pass.
    pub async fn read(&self, key: &str) -> Result<Option<Series>, StoreError> {
        match self.store.get(key).await? {
            Some(blob) => Ok(Some(decode(&blob)?)),
            None => Ok(None),
        }
    }

    pub async fn read_metric(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Series>, StoreError> {
        self.read(&metric_key(namespace, name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::DataPoint;
    use crate::store::{append_datapoint, MemoryStore};

    #[tokio::test]
    async fn reads_canonical_snapshot() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        for (timestamp, value) in [(30, 3.0), (10, 1.0), (20, 2.0), (10, 1.5)] {
            append_datapoint(&*store, "metrics.", "cpu", DataPoint::new(timestamp, value))
                .await?;
        }
        let reader = WindowReader::new(store);

        let window = reader.read_metric("metrics.", "cpu").await?;
        assert_eq!(
            window,
            Some(vec![
                DataPoint::new(10, 1.5),
                DataPoint::new(20, 2.0),
                DataPoint::new(30, 3.0),
            ])
        );
        assert_eq!(reader.read("metrics.absent").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_blob_is_a_codec_error() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.set("metrics.bad", vec![0xc1]).await?;
        let reader = WindowReader::new(store);

        assert!(matches!(
            reader.read("metrics.bad").await,
            Err(StoreError::Codec(_))
        ));
        Ok(())
    }
}
