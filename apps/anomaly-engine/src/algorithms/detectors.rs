use super::stats::{self, moments, Moments};
use super::{tail_avg, values, AlgorithmContext, AlgorithmFault};
use crate::series::DataPoint;
use statrs::distribution::{ContinuousCDF, StudentsT};

const SIGMA: f64 = 3.0;
const HOUR: i64 = 3600;
const TEN_MINUTES: i64 = 600;
const EWM_CENTER_OF_MASS: f64 = 50.0;
const HISTOGRAM_BIN_COUNT: usize = 15;
const SPARSE_BIN_SIZE: usize = 20;
const KS_MIN_SAMPLE: usize = 20;
const ADF_MAX_LAG: usize = 10;
const DROP_OFF_MIN_POINTS: usize = 30;

fn last_point(window: &[DataPoint]) -> Result<&DataPoint, AlgorithmFault> {
    window.last().ok_or(AlgorithmFault::EmptyWindow)
}

fn tail(window: &[DataPoint]) -> Result<f64, AlgorithmFault> {
    tail_avg(window).ok_or(AlgorithmFault::EmptyWindow)
}

/// `|value - mean| > 3 sigma`, false whenever the spread is undefined.
fn outside_three_sigma(value: f64, reference: Option<Moments>) -> bool {
    match reference {
        Some(Moments {
            mean,
            stdev: Some(stdev),
            ..
        }) => (value - mean).abs() > SIGMA * stdev,
        _ => false,
    }
}

/// Anomalous when the latest point's deviation from the median is more than six times the
/// median deviation. A zero median deviation would make the ratio infinite, so it is skipped.
pub fn median_absolute_deviation(
    window: &[DataPoint],
    _ctx: &AlgorithmContext,
) -> Result<bool, AlgorithmFault> {
    let values = values(window);
    let median = stats::median(&values).ok_or(AlgorithmFault::EmptyWindow)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    let median_deviation = stats::median(&deviations).ok_or(AlgorithmFault::EmptyWindow)?;
    if median_deviation == 0.0 {
        return Ok(false);
    }
    let last = deviations.last().copied().ok_or(AlgorithmFault::EmptyWindow)?;
    Ok(last / median_deviation > 6.0)
}

/// Grubbs' outlier test on the tail average, one-sided, alpha 0.05.
pub fn grubbs(window: &[DataPoint], _ctx: &AlgorithmContext) -> Result<bool, AlgorithmFault> {
    let values = values(window);
    let m = moments(&values).ok_or(AlgorithmFault::EmptyWindow)?;
    let stdev = match m.stdev {
        Some(stdev) if stdev != 0.0 => stdev,
        _ => return Ok(false),
    };
    let n = values.len();
    if n < 3 {
        return Ok(false);
    }
    let nf = n as f64;
    let t = StudentsT::new(0.0, 1.0, nf - 2.0)
        .map_err(|err| AlgorithmFault::Numerical(err.to_string()))?;
    let threshold = t.inverse_cdf(1.0 - 0.05 / (2.0 * nf));
    let threshold_squared = threshold * threshold;
    let grubbs_score =
        ((nf - 1.0) / nf.sqrt()) * (threshold_squared / (nf - 2.0 + threshold_squared)).sqrt();
    if !grubbs_score.is_finite() {
        return Err(AlgorithmFault::Numerical(format!(
            "grubbs critical value {grubbs_score}"
        )));
    }
    let z_score = (tail(window)? - m.mean) / stdev;
    Ok(z_score > grubbs_score)
}

/// Compares the tail average to the points from the first hour of the retention window.
pub fn first_hour_average(
    window: &[DataPoint],
    ctx: &AlgorithmContext,
) -> Result<bool, AlgorithmFault> {
    let end = last_point(window)?.timestamp;
    let threshold = end - (ctx.full_duration - HOUR);
    let first_hour: Vec<f64> = window
        .iter()
        .filter(|p| p.timestamp < threshold)
        .map(|p| p.value)
        .collect();
    Ok(outside_three_sigma(tail(window)?, moments(&first_hour)))
}

pub fn stddev_from_average(
    window: &[DataPoint],
    _ctx: &AlgorithmContext,
) -> Result<bool, AlgorithmFault> {
    let values = values(window);
    let m = moments(&values).ok_or(AlgorithmFault::EmptyWindow)?;
    Ok(outside_three_sigma(tail(window)?, Some(m)))
}

/// Latest value against the exponentially weighted mean and spread (center of mass 50).
pub fn stddev_from_moving_average(
    window: &[DataPoint],
    _ctx: &AlgorithmContext,
) -> Result<bool, AlgorithmFault> {
    let values = values(window);
    let (ewm_mean, ewm_stdev) =
        stats::ewm_last(&values, EWM_CENTER_OF_MASS).ok_or(AlgorithmFault::EmptyWindow)?;
    let last = last_point(window)?.value;
    Ok(match ewm_stdev {
        Some(stdev) => (last - ewm_mean).abs() > SIGMA * stdev,
        None => false,
    })
}

/// Latest value against the mean and spread of every earlier point.
pub fn mean_subtraction_cumulation(
    window: &[DataPoint],
    _ctx: &AlgorithmContext,
) -> Result<bool, AlgorithmFault> {
    let last = last_point(window)?.value;
    let head = values(&window[..window.len() - 1]);
    Ok(outside_three_sigma(last, moments(&head)))
}

/// Average residual of the last three points against a least-squares line over the window.
pub fn least_squares(
    window: &[DataPoint],
    _ctx: &AlgorithmContext,
) -> Result<bool, AlgorithmFault> {
    if window.is_empty() {
        return Err(AlgorithmFault::EmptyWindow);
    }
    if window.len() < 3 {
        return Ok(false);
    }
    let xs: Vec<f64> = window.iter().map(|p| p.timestamp as f64).collect();
    let ys = values(window);
    let fit = stats::linear_fit(&xs, &ys)
        .ok_or_else(|| AlgorithmFault::Numerical("degenerate least squares design".into()))?;
    let errors: Vec<f64> = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| y - fit.predict(*x))
        .collect();
    let stdev = moments(&errors).and_then(|m| m.stdev).unwrap_or(0.0);
    let n = errors.len();
    let t = (errors[n - 1] + errors[n - 2] + errors[n - 3]) / 3.0;
    Ok(t.abs() > stdev * SIGMA && stdev.round_ties_even() != 0.0 && t.round_ties_even() != 0.0)
}

/// Anomalous when the tail average lands in a sparsely populated histogram bin.
pub fn histogram_bins(
    window: &[DataPoint],
    _ctx: &AlgorithmContext,
) -> Result<bool, AlgorithmFault> {
    let t = tail(window)?;
    let values = values(window);
    let histogram = stats::histogram(&values, HISTOGRAM_BIN_COUNT)
        .ok_or_else(|| AlgorithmFault::Numerical("histogram range is not finite".into()))?;
    let edges = &histogram.edges;
    for (index, &count) in histogram.counts.iter().enumerate() {
        if count > SPARSE_BIN_SIZE {
            continue;
        }
        if index == 0 {
            if t <= edges[0] {
                return Ok(true);
            }
        } else if t >= edges[index] && t < edges[index + 1] {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Two-sample KS test of the last ten minutes against the fifty before them, gated on the
/// reference sample being stationary.
pub fn ks_test(window: &[DataPoint], _ctx: &AlgorithmContext) -> Result<bool, AlgorithmFault> {
    let end = last_point(window)?.timestamp;
    let hour_ago = end - HOUR;
    let ten_minutes_ago = end - TEN_MINUTES;
    let reference: Vec<f64> = window
        .iter()
        .filter(|p| p.timestamp >= hour_ago && p.timestamp < ten_minutes_ago)
        .map(|p| p.value)
        .collect();
    let recent: Vec<f64> = window
        .iter()
        .filter(|p| p.timestamp >= ten_minutes_ago)
        .map(|p| p.value)
        .collect();
    if reference.len() < KS_MIN_SAMPLE || recent.len() < KS_MIN_SAMPLE {
        return Ok(false);
    }

    let (d, p) = stats::ks_2samp(&reference, &recent).ok_or(AlgorithmFault::EmptyWindow)?;
    if p < 0.05 && d > 0.5 {
        let adf = stats::adfuller(&reference, ADF_MAX_LAG).ok_or_else(|| {
            AlgorithmFault::Numerical("augmented Dickey-Fuller regression failed".into())
        })?;
        return Ok(adf.p_value < 0.05);
    }
    Ok(false)
}

/// Sudden drop of the latest point relative to the recent average.
///
/// The trigger ratio is chosen by successive rules where a later rule overrides an earlier
/// one. Frequent drops (two or more points at the recent minimum) and windows under the
/// configured floor are treated as normal.
pub fn detect_drop_off_cliff(
    window: &[DataPoint],
    ctx: &AlgorithmContext,
) -> Result<bool, AlgorithmFault> {
    if window.len() < DROP_OFF_MIN_POINTS {
        return Ok(false);
    }
    let end = window[window.len() - 1].timestamp;
    let resolution = end - window[window.len() - 2].timestamp;
    let since = |seconds: i64| -> Vec<f64> {
        let start = end - seconds;
        window
            .iter()
            .filter(|p| p.timestamp <= end && p.timestamp > start)
            .map(|p| p.value)
            .collect()
    };

    let ten = since(resolution * 10);
    if ten.len() <= 3 {
        return Ok(false);
    }
    let min = ten.iter().copied().fold(f64::INFINITY, f64::min);
    let max = ten.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if min < 0.0 || max == 0.0 || min == max {
        return Ok(false);
    }

    let sum: f64 = ten.iter().sum();
    let average = sum / ten.len() as f64;
    let last = ten[ten.len() - 1];

    let similar = |points: &[f64]| points.iter().filter(|v| **v <= min).count();
    if similar(&ten) >= 2 || similar(&since(resolution * 20)) >= 2 {
        return Ok(false);
    }

    let floor = ctx.drop_off_floor;
    if floor.average > 0.0 && floor.seconds > 0 {
        let recent = since(floor.seconds);
        if !recent.is_empty() {
            let recent_average = recent.iter().sum::<f64>() / recent.len() as f64;
            if recent_average < floor.average {
                return Ok(false);
            }
        }
    }

    let mut value = last.trunc();
    let mut trigger = 0.0;
    if max < 101.0 {
        trigger = 15.0;
    }
    if max < 20.0 {
        trigger = average / 2.0;
    }
    if max > 100.0 {
        trigger = 100.0;
    }
    if value == 0.0 {
        value = 0.1;
    }
    if value == 1.0 {
        trigger = 1.0;
    }
    if value == 1.0 && max < 10.0 {
        trigger = 0.1;
    }
    if value == 0.1 && average < 1.0 && sum < 7.0 {
        trigger = 7.0;
    }

    let ratio = average / value;
    let anomalous = ratio.trunc() > trigger;
    if anomalous {
        tracing::debug!(
            metric = %ctx.metric,
            end,
            value,
            sum,
            average,
            trigger,
            ratio,
            "drop off cliff detected"
        );
    }
    Ok(anomalous)
}
