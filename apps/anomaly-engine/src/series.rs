use serde::de::IgnoredAny;
use serde::Deserialize;
use std::io::Cursor;

/// One `(timestamp, value)` sample of a metric. Timestamps are unix seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub timestamp: i64,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl From<(i64, f64)> for DataPoint {
    fn from((timestamp, value): (i64, f64)) -> Self {
        Self { timestamp, value }
    }
}

/// Decoded snapshot of a metric's packed series, ascending by timestamp with no duplicates.
pub type Series = Vec<DataPoint>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode packed series: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode packed series: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Int(i64),
    Float(f64),
}

impl RawTimestamp {
    fn to_seconds(&self) -> Option<i64> {
        match self {
            RawTimestamp::Int(ts) => Some(*ts),
            RawTimestamp::Float(ts) if ts.is_finite() => Some(ts.trunc() as i64),
            RawTimestamp::Float(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawElement {
    Pair(RawTimestamp, f64),
    Other(IgnoredAny),
}

/// Packs a single point as a MessagePack `[timestamp, value]` array.
///
/// Appending the output of this to an existing blob is how ingestion grows a series.
pub fn encode_point(point: &DataPoint) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(14);
    rmp_serde::encode::write(&mut buf, &(point.timestamp, point.value))?;
    Ok(buf)
}

/// Packs a series as back-to-back MessagePack pairs.
///
/// This is byte-identical to packing the whole list as one array and stripping the array's
/// length prefix (1, 3 or 5 bytes depending on count), which is the form existing deployments
/// keep in the store.
pub fn encode(series: &[DataPoint]) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(series.len() * 14);
    for point in series {
        rmp_serde::encode::write(&mut buf, &(point.timestamp, point.value))?;
    }
    Ok(buf)
}

/// Decodes a packed blob into a canonical series.
///
/// Elements that are not `[timestamp, value]` pairs are skipped. A blob that is not valid
/// MessagePack at all (truncated, garbage bytes) is an error.
pub fn decode(blob: &[u8]) -> Result<Series, CodecError> {
    decode_in_order(blob).map(canonicalize)
}

/// Decodes a packed blob in write order, keeping every pair.
///
/// Trigger histories use this form: two triggers in the same second are two entries.
pub fn decode_in_order(blob: &[u8]) -> Result<Vec<DataPoint>, CodecError> {
    let mut points = Vec::new();
    let mut cursor = Cursor::new(blob);
    while (cursor.position() as usize) < blob.len() {
        let mut de = rmp_serde::Deserializer::new(&mut cursor);
        let element = RawElement::deserialize(&mut de)?;
        if let RawElement::Pair(ts, value) = element {
            if let Some(timestamp) = ts.to_seconds() {
                points.push(DataPoint { timestamp, value });
            }
        }
    }
    Ok(points)
}

/// Sorts by timestamp and collapses duplicate timestamps, keeping the most recently written
/// point of each run.
pub fn canonicalize(mut points: Vec<DataPoint>) -> Series {
    points.sort_by_key(|point| point.timestamp);
    let mut out: Vec<DataPoint> = Vec::with_capacity(points.len());
    for point in points {
        match out.last_mut() {
            Some(last) if last.timestamp == point.timestamp => *last = point,
            _ => out.push(point),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pts(raw: &[(i64, f64)]) -> Series {
        raw.iter().copied().map(DataPoint::from).collect()
    }

    #[test]
    fn in_order_decode_keeps_duplicate_timestamps() -> Result<(), CodecError> {
        let blob = encode(&pts(&[(20, 1.0), (10, 2.0), (20, 3.0)]))?;
        assert_eq!(decode_in_order(&blob)?, pts(&[(20, 1.0), (10, 2.0), (20, 3.0)]));
        assert_eq!(decode(&blob)?, pts(&[(10, 2.0), (20, 3.0)]));
        Ok(())
    }

    #[test]
    fn empty_series_round_trips() {
        let blob = encode(&[]).unwrap();
        assert!(blob.is_empty());
        assert_eq!(decode(&blob).unwrap(), Vec::new());
    }

    #[test]
    fn packed_pair_uses_fixarray_and_float64() {
        let blob = encode_point(&DataPoint::new(60, 1.5)).unwrap();
        // fixarray(2), positive fixint 60, float64 marker + 8 bytes
        assert_eq!(blob[0], 0x92);
        assert_eq!(blob[1], 60);
        assert_eq!(blob[2], 0xcb);
        assert_eq!(blob.len(), 11);
    }

    #[test]
    fn appended_points_decode_in_order() {
        let mut blob = encode_point(&DataPoint::new(120, 2.0)).unwrap();
        blob.extend(encode_point(&DataPoint::new(60, 1.0)).unwrap());
        blob.extend(encode_point(&DataPoint::new(180, 3.0)).unwrap());
        assert_eq!(
            decode(&blob).unwrap(),
            pts(&[(60, 1.0), (120, 2.0), (180, 3.0)])
        );
    }

    #[test]
    fn duplicate_timestamps_keep_last_written() {
        let mut blob = encode(&pts(&[(60, 1.0), (120, 2.0)])).unwrap();
        blob.extend(encode_point(&DataPoint::new(60, 9.0)).unwrap());
        assert_eq!(decode(&blob).unwrap(), pts(&[(60, 9.0), (120, 2.0)]));
    }

    #[test]
    fn non_pair_elements_are_dropped() {
        let mut blob = Vec::new();
        rmp_serde::encode::write(&mut blob, &1_700_000_000_i64).unwrap();
        rmp_serde::encode::write(&mut blob, &("bogus", 1.0, 2.0)).unwrap();
        blob.extend(encode_point(&DataPoint::new(60, 4.0)).unwrap());
        assert_eq!(decode(&blob).unwrap(), pts(&[(60, 4.0)]));
    }

    #[test]
    fn float_timestamps_and_integer_values_are_accepted() {
        let mut blob = Vec::new();
        rmp_serde::encode::write(&mut blob, &(1_700_000_060.7_f64, 3_i64)).unwrap();
        assert_eq!(decode(&blob).unwrap(), pts(&[(1_700_000_060, 3.0)]));
    }

    #[test]
    fn truncated_blob_is_an_error() {
        let blob = encode(&pts(&[(60, 1.0), (120, 2.0)])).unwrap();
        assert!(decode(&blob[..blob.len() - 3]).is_err());
    }

    proptest! {
        #[test]
        fn ascending_unique_series_round_trip(
            deltas in proptest::collection::vec(1i64..10_000, 0..200),
            values in proptest::collection::vec(-1.0e9f64..1.0e9, 200),
        ) {
            let mut ts = 1_600_000_000i64;
            let series: Series = deltas
                .iter()
                .zip(values.iter())
                .map(|(delta, value)| {
                    ts += delta;
                    DataPoint::new(ts, *value)
                })
                .collect();
            let blob = encode(&series).unwrap();
            prop_assert_eq!(decode(&blob).unwrap(), series);
        }
    }
}
