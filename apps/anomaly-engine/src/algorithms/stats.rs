use statrs::distribution::{ContinuousCDF, Normal};

/// Sample mean and standard deviation (ddof = 1).
///
/// Both are accumulated relative to the first value, so a constant input yields exactly its
/// value as mean and exactly zero spread regardless of magnitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub count: usize,
    pub mean: f64,
    /// `None` when fewer than two values are present.
    pub stdev: Option<f64>,
}

pub fn moments(values: &[f64]) -> Option<Moments> {
    let first = *values.first()?;
    let n = values.len() as f64;
    let shifted_mean = values.iter().map(|v| v - first).sum::<f64>() / n;
    let stdev = if values.len() > 1 {
        let sum_sq: f64 = values
            .iter()
            .map(|v| {
                let d = (v - first) - shifted_mean;
                d * d
            })
            .sum();
        Some((sum_sq / (n - 1.0)).sqrt())
    } else {
        None
    };
    Some(Moments {
        count: values.len(),
        mean: first + shifted_mean,
        stdev,
    })
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Mean of the last three values, or the last value when fewer than three exist.
pub fn tail_average(values: &[f64]) -> Option<f64> {
    match values {
        [.., a, b, c] => Some(c + ((a - c) + (b - c)) / 3.0),
        [.., last] => Some(*last),
        [] => None,
    }
}

/// Exponentially weighted mean and unbiased standard deviation at the final observation.
///
/// Weights follow the "adjusted" form: observation `i` steps back from the end carries
/// `(1 - alpha)^i` with `alpha = 1 / (1 + com)`.
pub fn ewm_last(values: &[f64], com: f64) -> Option<(f64, Option<f64>)> {
    let first = *values.first()?;
    let decay = 1.0 - 1.0 / (1.0 + com);

    let mut weight = 1.0;
    let mut sum_w = 0.0;
    let mut sum_w2 = 0.0;
    let mut sum_wx = 0.0;
    for value in values.iter().rev() {
        sum_w += weight;
        sum_w2 += weight * weight;
        sum_wx += weight * (value - first);
        weight *= decay;
    }
    let shifted_mean = sum_wx / sum_w;

    let mut weight = 1.0;
    let mut sum_wd2 = 0.0;
    for value in values.iter().rev() {
        let d = (value - first) - shifted_mean;
        sum_wd2 += weight * d * d;
        weight *= decay;
    }
    let biased_var = sum_wd2 / sum_w;
    let denom = sum_w * sum_w - sum_w2;
    let stdev = if denom > 0.0 {
        Some((biased_var * sum_w * sum_w / denom).sqrt())
    } else {
        None
    };
    Some((first + shifted_mean, stdev))
}

/// Least-squares line, kept in centred form so unix-second abscissae do not lose precision.
#[derive(Debug, Clone, Copy)]
pub struct LineFit {
    pub slope: f64,
    x_mean: f64,
    y_mean: f64,
}

impl LineFit {
    pub fn predict(&self, x: f64) -> f64 {
        self.y_mean + self.slope * (x - self.x_mean)
    }
}

pub fn linear_fit(xs: &[f64], ys: &[f64]) -> Option<LineFit> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let n = xs.len() as f64;
    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = ys.iter().sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - x_mean;
        sxx += dx * dx;
        sxy += dx * (y - y_mean);
    }
    if sxx <= 0.0 {
        return None;
    }
    Some(LineFit {
        slope: sxy / sxx,
        x_mean,
        y_mean,
    })
}

/// Equal-width histogram over `[min, max]`; the last bin is closed on the right.
#[derive(Debug, Clone)]
pub struct Histogram {
    pub counts: Vec<usize>,
    pub edges: Vec<f64>,
}

pub fn histogram(values: &[f64], bins: usize) -> Option<Histogram> {
    if values.is_empty() || bins == 0 || values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let mut hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }
    let step = (hi - lo) / bins as f64;
    let mut edges: Vec<f64> = (0..=bins).map(|i| lo + step * i as f64).collect();
    edges[bins] = hi;

    let mut counts = vec![0usize; bins];
    for value in values {
        let mut idx = (((value - lo) / (hi - lo)) * bins as f64) as usize;
        if idx >= bins {
            idx = bins - 1;
        }
        if *value < edges[idx] && idx > 0 {
            idx -= 1;
        } else if idx != bins - 1 && *value >= edges[idx + 1] {
            idx += 1;
        }
        counts[idx] += 1;
    }
    Some(Histogram { counts, edges })
}

/// Two-sample Kolmogorov-Smirnov statistic and asymptotic two-sided p-value.
pub fn ks_2samp(a: &[f64], b: &[f64]) -> Option<(f64, f64)> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(|x, y| x.total_cmp(y));
    b.sort_by(|x, y| x.total_cmp(y));
    let n1 = a.len() as f64;
    let n2 = b.len() as f64;

    let (mut i, mut j) = (0usize, 0usize);
    let mut d: f64 = 0.0;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        d = d.max((i as f64 / n1 - j as f64 / n2).abs());
    }

    let en = (n1 * n2 / (n1 + n2)).sqrt();
    let p = kolmogorov_survival((en + 0.12 + 0.11 / en) * d);
    Some((d, p))
}

fn kolmogorov_survival(lambda: f64) -> f64 {
    let a2 = -2.0 * lambda * lambda;
    let mut fac = 2.0;
    let mut sum = 0.0;
    let mut previous = 0.0;
    for j in 1..=100 {
        let jf = j as f64;
        let term = fac * (a2 * jf * jf).exp();
        sum += term;
        if term.abs() <= 0.001 * previous || term.abs() <= 1.0e-8 * sum {
            return sum.clamp(0.0, 1.0);
        }
        fac = -fac;
        previous = term.abs();
    }
    1.0
}

struct OlsFit {
    params: Vec<f64>,
    std_errors: Vec<f64>,
    ssr: f64,
    nobs: usize,
}

impl OlsFit {
    fn aic(&self) -> f64 {
        let nobs = self.nobs as f64;
        let k = self.params.len() as f64;
        nobs * ((2.0 * std::f64::consts::PI).ln() + (self.ssr / nobs).ln() + 1.0) + 2.0 * k
    }
}

/// Ordinary least squares through the normal equations. Regressor counts here stay small.
fn ols(rows: &[Vec<f64>], y: &[f64]) -> Option<OlsFit> {
    let nobs = rows.len();
    let k = rows.first()?.len();
    if nobs <= k || y.len() != nobs {
        return None;
    }

    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for (row, target) in rows.iter().zip(y) {
        for a in 0..k {
            xty[a] += row[a] * target;
            for b in 0..k {
                xtx[a][b] += row[a] * row[b];
            }
        }
    }
    let inverse = invert(xtx)?;
    let params: Vec<f64> = (0..k)
        .map(|a| (0..k).map(|b| inverse[a][b] * xty[b]).sum())
        .collect();

    let ssr: f64 = rows
        .iter()
        .zip(y)
        .map(|(row, target)| {
            let fitted: f64 = row.iter().zip(&params).map(|(x, p)| x * p).sum();
            (target - fitted).powi(2)
        })
        .sum();
    let sigma2 = ssr / (nobs - k) as f64;
    let std_errors = (0..k).map(|a| (sigma2 * inverse[a][a]).sqrt()).collect();
    Some(OlsFit {
        params,
        std_errors,
        ssr,
        nobs,
    })
}

/// Gauss-Jordan inverse with partial pivoting.
fn invert(mut m: Vec<Vec<f64>>) -> Option<Vec<Vec<f64>>> {
    let n = m.len();
    let mut inv: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    for col in 0..n {
        let pivot = (col..n).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        inv.swap(col, pivot);
        let p = m[col][col];
        for j in 0..n {
            m[col][j] /= p;
            inv[col][j] /= p;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = m[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                m[row][j] -= factor * m[col][j];
                inv[row][j] -= factor * inv[col][j];
            }
        }
    }
    Some(inv)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdfResult {
    pub statistic: f64,
    pub p_value: f64,
    pub used_lag: usize,
}

/// Augmented Dickey-Fuller test with a constant term.
///
/// The lag order is chosen by AIC over `0..=max_lag` on a common sample, then the test
/// regression is refit on the longest sample that lag order allows. `max_lag` is capped at
/// `len / 2 - 2` so the regression stays identified on short references.
pub fn adfuller(values: &[f64], max_lag: usize) -> Option<AdfResult> {
    let n = values.len();
    if n < 6 || values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let max_lag = max_lag.min((n / 2).saturating_sub(2));
    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();

    let design = |lags: usize, start: usize| -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut rows = Vec::with_capacity(diffs.len() - start);
        let mut y = Vec::with_capacity(diffs.len() - start);
        for t in start..diffs.len() {
            let mut row = Vec::with_capacity(lags + 2);
            row.push(values[t]);
            for lag in 1..=lags {
                row.push(diffs[t - lag]);
            }
            row.push(1.0);
            rows.push(row);
            y.push(diffs[t]);
        }
        (rows, y)
    };

    let mut best: Option<(usize, f64)> = None;
    for lags in 0..=max_lag {
        let (rows, y) = design(lags, max_lag);
        let Some(fit) = ols(&rows, &y) else {
            continue;
        };
        let aic = fit.aic();
        if aic.is_nan() {
            continue;
        }
        if best.map(|(_, best_aic)| aic < best_aic).unwrap_or(true) {
            best = Some((lags, aic));
        }
    }
    let (used_lag, _) = best?;

    let (rows, y) = design(used_lag, used_lag);
    let fit = ols(&rows, &y)?;
    let statistic = fit.params[0] / fit.std_errors[0];
    if !statistic.is_finite() {
        return None;
    }
    Some(AdfResult {
        statistic,
        p_value: mackinnon_p_constant(statistic)?,
        used_lag,
    })
}

/// MacKinnon (1994) approximate p-value for the constant-only, single-series case.
fn mackinnon_p_constant(statistic: f64) -> Option<f64> {
    const TAU_MAX: f64 = 2.74;
    const TAU_MIN: f64 = -18.86;
    const TAU_STAR: f64 = -1.61;
    const SMALL_P: [f64; 3] = [2.1659, 1.4412, 0.038269];
    const LARGE_P: [f64; 4] = [1.7339, 0.93202, -0.12745, -0.010368];

    if statistic > TAU_MAX {
        return Some(1.0);
    }
    if statistic < TAU_MIN {
        return Some(0.0);
    }
    let coefficients: &[f64] = if statistic <= TAU_STAR {
        &SMALL_P
    } else {
        &LARGE_P
    };
    let poly = coefficients
        .iter()
        .rev()
        .fold(0.0, |acc, c| acc * statistic + c);
    let normal = Normal::new(0.0, 1.0).ok()?;
    Some(normal.cdf(poly))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moments_of_constant_values_have_zero_spread() {
        let m = moments(&[0.1, 0.1, 0.1, 0.1]).unwrap();
        assert_eq!(m.mean, 0.1);
        assert_eq!(m.stdev, Some(0.0));
        assert_eq!(moments(&[5.0]).unwrap().stdev, None);
        assert!(moments(&[]).is_none());
    }

    #[test]
    fn moments_use_sample_variance() {
        let m = moments(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((m.mean - 5.0).abs() < 1e-12);
        assert!((m.stdev.unwrap() - 2.138_089_935).abs() < 1e-6);
    }

    #[test]
    fn tail_average_handles_short_inputs() {
        assert_eq!(tail_average(&[]), None);
        assert_eq!(tail_average(&[4.0]), Some(4.0));
        assert_eq!(tail_average(&[1.0, 4.0]), Some(4.0));
        assert_eq!(tail_average(&[9.0, 1.0, 2.0, 3.0]), Some(2.0));
    }

    #[test]
    fn median_of_even_count_averages_middle_pair() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
    }

    #[test]
    fn ewm_needs_two_points_for_spread() {
        let (mean, stdev) = ewm_last(&[3.0], 50.0).unwrap();
        assert_eq!(mean, 3.0);
        assert!(stdev.is_none());

        let (mean, stdev) = ewm_last(&[1.0, 1.0, 1.0, 1.0], 50.0).unwrap();
        assert_eq!(mean, 1.0);
        assert_eq!(stdev, Some(0.0));
    }

    #[test]
    fn ewm_matches_hand_computed_two_point_case() {
        // alpha = 1/51, weights (1-alpha, 1) for (x0, x1)
        let w0 = 50.0 / 51.0;
        let expected_mean = (w0 * 0.0 + 1.0 * 1.0) / (w0 + 1.0);
        let (mean, _) = ewm_last(&[0.0, 1.0], 50.0).unwrap();
        assert!((mean - expected_mean).abs() < 1e-12);
    }

    #[test]
    fn linear_fit_recovers_exact_line() {
        let xs = [1_700_000_000.0, 1_700_000_060.0, 1_700_000_120.0];
        let ys = [1.0, 2.0, 3.0];
        let fit = linear_fit(&xs, &ys).unwrap();
        assert!((fit.slope - 1.0 / 60.0).abs() < 1e-12);
        assert!((fit.predict(1_700_000_180.0) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn histogram_closes_last_bin_and_pads_constant_range() {
        let h = histogram(&[0.0, 1.0, 2.0, 3.0], 3).unwrap();
        assert_eq!(h.counts, vec![1, 1, 2]);

        let h = histogram(&[5.0, 5.0], 15).unwrap();
        assert_eq!(h.edges[0], 4.5);
        assert_eq!(h.edges[15], 5.5);
        assert_eq!(h.counts.iter().sum::<usize>(), 2);
        assert_eq!(h.counts[7], 2);
    }

    #[test]
    fn ks_distinguishes_shifted_samples() {
        let a: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let b: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
        let (d, p) = ks_2samp(&a, &b).unwrap();
        assert_eq!(d, 1.0);
        assert!(p < 1e-6);

        let (d, p) = ks_2samp(&a, &a).unwrap();
        assert_eq!(d, 0.0);
        assert!(p > 0.99);
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
    fn adf_rejects_unit_root_for_white_noise() {
        let values = noise(60, 7);
        let result = adfuller(&values, 10).unwrap();
        assert!(result.statistic < 0.0);
        assert!(result.p_value < 0.05, "{result:?}");
    }

    #[test]
    fn adf_does_not_reject_for_explosive_growth() {
        let values: Vec<f64> = noise(60, 11)
            .into_iter()
            .enumerate()
            .map(|(i, e)| 1.05f64.powi(i as i32) * (1.0 + 0.01 * e))
            .collect();
        let result = adfuller(&values, 10).unwrap();
        assert!(result.p_value > 0.05, "{result:?}");
    }

    #[test]
    fn adf_refuses_tiny_samples() {
        assert!(adfuller(&[1.0, 2.0, 3.0], 10).is_none());
    }

    #[test]
    fn mackinnon_is_continuous_at_the_switch_point() {
        let below = mackinnon_p_constant(-1.6100001).unwrap();
        let above = mackinnon_p_constant(-1.6099999).unwrap();
        assert!((below - above).abs() < 0.01);
        assert_eq!(mackinnon_p_constant(3.0), Some(1.0));
        assert_eq!(mackinnon_p_constant(-20.0), Some(0.0));
    }
}
