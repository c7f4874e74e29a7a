use super::*;
use crate::series::DataPoint;

fn ctx() -> AlgorithmContext {
    AlgorithmContext::new("metrics.test", 86_400)
}

fn series(values: &[f64], step: i64) -> Vec<DataPoint> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| DataPoint::new(1_700_000_000 + i as i64 * step, *v))
        .collect()
}

fn alternating(len: usize) -> Vec<f64> {
    (0..len)
        .map(|i| if i % 2 == 0 { 10.0 } else { 11.0 })
        .collect()
}

fn noise(len: usize, seed: u64) -> Vec<f64> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
        })
        .collect()
}

#[test]
fn constant_window_is_never_anomalous() {
    let window = vec![
        DataPoint::new(0, 1.0),
        DataPoint::new(60, 1.0),
        DataPoint::new(120, 1.0),
    ];
    let ctx = ctx();
    assert_eq!(grubbs(&window, &ctx), Ok(false));
    assert_eq!(median_absolute_deviation(&window, &ctx), Ok(false));
    assert_eq!(stddev_from_average(&window, &ctx), Ok(false));
    assert_eq!(stddev_from_moving_average(&window, &ctx), Ok(false));
    assert_eq!(mean_subtraction_cumulation(&window, &ctx), Ok(false));
    assert_eq!(least_squares(&window, &ctx), Ok(false));
    assert_eq!(first_hour_average(&window, &ctx), Ok(false));
}

#[test]
fn constant_window_of_awkward_decimals_has_zero_spread() {
    let window = series(&[0.1; 40], 60);
    let ctx = ctx();
    assert_eq!(stddev_from_average(&window, &ctx), Ok(false));
    assert_eq!(grubbs(&window, &ctx), Ok(false));
    assert_eq!(mean_subtraction_cumulation(&window, &ctx), Ok(false));
}

#[test]
fn empty_window_is_a_fault_not_a_verdict() {
    let ctx = ctx();
    assert_eq!(grubbs(&[], &ctx), Err(AlgorithmFault::EmptyWindow));
    assert_eq!(
        median_absolute_deviation(&[], &ctx),
        Err(AlgorithmFault::EmptyWindow)
    );
    assert_eq!(histogram_bins(&[], &ctx), Err(AlgorithmFault::EmptyWindow));
    assert_eq!(Verdict::from(ks_test(&[], &ctx)), Verdict::Unknown);
}

#[test]
fn spike_trips_the_three_sigma_family() {
    let mut values = alternating(47);
    values.extend([50.0, 50.0, 50.0]);
    let window = series(&values, 60);
    let ctx = ctx();
    assert_eq!(grubbs(&window, &ctx), Ok(true));
    assert_eq!(stddev_from_average(&window, &ctx), Ok(true));
    assert_eq!(median_absolute_deviation(&window, &ctx), Ok(true));
}

#[test]
fn last_point_outlier_trips_moving_average_and_cumulation() {
    let mut values = alternating(99);
    values.push(100.0);
    let window = series(&values, 60);
    let ctx = ctx();
    assert_eq!(stddev_from_moving_average(&window, &ctx), Ok(true));
    assert_eq!(mean_subtraction_cumulation(&window, &ctx), Ok(true));

    let quiet = series(&alternating(100), 60);
    assert_eq!(stddev_from_moving_average(&quiet, &ctx), Ok(false));
    assert_eq!(mean_subtraction_cumulation(&quiet, &ctx), Ok(false));
}

#[test]
fn least_squares_flags_departure_from_trend() {
    let mut values: Vec<f64> = (0..97).map(|i| i as f64).collect();
    values.extend([300.0, 300.0, 300.0]);
    let ctx = ctx();
    assert_eq!(least_squares(&series(&values, 60), &ctx), Ok(true));

    let ramp: Vec<f64> = (0..100).map(|i| i as f64 * 2.0).collect();
    assert_eq!(least_squares(&series(&ramp, 60), &ctx), Ok(false));
}

#[test]
fn first_hour_average_uses_the_oldest_hour_of_the_retention_window() {
    let mut values = alternating(117);
    values.extend([50.0, 50.0, 50.0]);
    let window = series(&values, 60);
    let ctx = AlgorithmContext::new("metrics.test", 7_200);
    assert_eq!(first_hour_average(&window, &ctx), Ok(true));

    let quiet = series(&alternating(120), 60);
    assert_eq!(first_hour_average(&quiet, &ctx), Ok(false));
}

#[test]
fn histogram_bins_flags_tail_in_sparse_bin() {
    let mut values: Vec<f64> = (0..97).map(|i| 10.0 + (i % 10) as f64 * 0.1).collect();
    values.extend([500.0, 1000.0, 700.0]);
    assert_eq!(histogram_bins(&series(&values, 60), &ctx()), Ok(true));

    let dense: Vec<f64> = (0..300).map(|i| (i % 3) as f64).collect();
    assert_eq!(histogram_bins(&series(&dense, 60), &ctx()), Ok(false));
}

#[test]
fn ks_test_flags_level_shift_on_stationary_reference() {
    let mut values = noise(150, 3);
    values.extend(noise(31, 5).into_iter().map(|v| v + 100.0));
    let window = series(&values, 20);
    assert_eq!(ks_test(&window, &ctx()), Ok(true));
}

#[test]
fn ks_test_needs_twenty_points_per_sample() {
    let mut values = noise(150, 3);
    values.extend(noise(11, 5).into_iter().map(|v| v + 100.0));
    // one-minute resolution leaves only eleven recent points
    let window = series(&values, 60);
    assert_eq!(ks_test(&window, &ctx()), Ok(false));
}

#[test]
fn ks_test_ignores_shift_on_non_stationary_reference() {
    let mut values: Vec<f64> = noise(150, 13)
        .into_iter()
        .enumerate()
        .map(|(i, e)| 1.05f64.powi(i as i32) * (1.0 + 0.01 * e))
        .collect();
    values.extend(noise(31, 9).into_iter().map(|v| v - 100.0));
    let window = series(&values, 20);
    assert_eq!(ks_test(&window, &ctx()), Ok(false));
}

#[test]
fn drop_off_cliff_detects_fall_to_zero() {
    let mut values = vec![10.0; 29];
    values.push(0.0);
    assert_eq!(detect_drop_off_cliff(&series(&values, 60), &ctx()), Ok(true));
}

#[test]
fn drop_off_cliff_on_high_rate_metric() {
    let mut values = vec![1000.0; 29];
    values.push(5.0);
    assert_eq!(detect_drop_off_cliff(&series(&values, 60), &ctx()), Ok(true));
}

#[test]
fn drop_off_cliff_vetoes() {
    let ctx = ctx();

    let short: Vec<f64> = [vec![10.0; 28], vec![0.0]].concat();
    assert_eq!(detect_drop_off_cliff(&series(&short, 60), &ctx), Ok(false));

    let repeated_low: Vec<f64> = [vec![10.0; 28], vec![0.0, 0.0]].concat();
    assert_eq!(
        detect_drop_off_cliff(&series(&repeated_low, 60), &ctx),
        Ok(false)
    );

    let earlier_low: Vec<f64> = [vec![10.0; 15], vec![0.0], vec![10.0; 13], vec![0.0]].concat();
    assert_eq!(
        detect_drop_off_cliff(&series(&earlier_low, 60), &ctx),
        Ok(false)
    );

    let negative: Vec<f64> = [vec![10.0; 25], vec![-1.0], vec![10.0; 3], vec![0.0]].concat();
    assert_eq!(detect_drop_off_cliff(&series(&negative, 60), &ctx), Ok(false));

    let zeros = vec![0.0; 30];
    assert_eq!(detect_drop_off_cliff(&series(&zeros, 60), &ctx), Ok(false));

    let cliff: Vec<f64> = [vec![10.0; 29], vec![0.0]].concat();
    let mut floored = ctx.clone();
    floored.drop_off_floor = DropOffFloor {
        average: 50.0,
        seconds: 600,
    };
    assert_eq!(detect_drop_off_cliff(&series(&cliff, 60), &floored), Ok(false));
}

#[test]
fn tail_avg_averages_last_three_points() {
    assert_eq!(tail_avg(&series(&[1.0, 2.0, 3.0, 4.0], 60)), Some(3.0));
    assert_eq!(tail_avg(&series(&[7.0], 60)), Some(7.0));
    assert_eq!(tail_avg(&[]), None);
}

#[test]
fn negatives_present_lists_negative_points() {
    let window = series(&[1.0, -2.0, 3.0, -0.5], 60);
    let negatives = negatives_present(&window).unwrap_or_default();
    assert_eq!(negatives.len(), 2);
    assert_eq!(negatives[0].value, -2.0);
    assert!(negatives_present(&series(&[1.0, 0.0], 60)).is_none());
}

#[test]
fn registry_knows_every_builtin() {
    let registry = AlgorithmRegistry::builtin();
    for name in DEFAULT_ALGORITHMS {
        assert!(registry.contains(name), "{name} missing");
    }
    assert!(registry.contains(DETECT_DROP_OFF_CLIFF));
    assert_eq!(registry.names().len(), 10);
    assert!(registry.get("no_such_algorithm").is_none());
}

#[test]
fn verdict_conversions() {
    assert_eq!(Verdict::from(true), Verdict::Anomalous);
    assert_eq!(Verdict::from(Ok(false)), Verdict::NotAnomalous);
    assert_eq!(
        Verdict::from(Err(AlgorithmFault::EmptyWindow)),
        Verdict::Unknown
    );
    assert!(Verdict::NotAnomalous.is_false());
    assert!(!Verdict::Unknown.is_false());
    assert_eq!(Verdict::Unknown.to_string(), "unknown");
}
