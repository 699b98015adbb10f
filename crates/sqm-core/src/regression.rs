//! Sliding-window linear regression used as a cloudiness signal.
//!
//! A clear night produces a smooth brightness curve; passing clouds make it
//! jagged. For each reading a straight line is fitted to its neighbours and the
//! residual standard error of that fit is reported. Downstream this quantity is
//! named `r_squared` for compatibility with existing consumers, although it is
//! not a coefficient of determination.

use time::PrimitiveDateTime;

use sqm_types::NightWindow;

/// Window sizes for [`compute`], in minutes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionWindow {
    /// Full width of the fit window around each reading.
    pub time_range_minutes: f64,
    /// Full width of the window averaged into `mean_r_squared`.
    pub averaging_minutes: f64,
    /// Readings closer than this to sunset or sunrise get no fit.
    pub time_shift_minutes: f64,
}

impl Default for RegressionWindow {
    fn default() -> Self {
        Self {
            time_range_minutes: 90.0,
            averaging_minutes: 30.0,
            time_shift_minutes: 60.0,
        }
    }
}

/// Per-reading regression results, index-aligned with the input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegressionResult {
    pub r_squared: Vec<Option<f64>>,
    pub mean_r_squared: Vec<Option<f64>>,
}

/// Residual standard error of the least-squares line through the points.
///
/// Times are seconds relative to the first point. Returns `None` with two
/// points or fewer, or when the fit is degenerate.
pub fn residual_standard_error(datetimes: &[PrimitiveDateTime], values: &[f64]) -> Option<f64> {
    let n = datetimes.len().min(values.len());
    if n <= 2 {
        return None;
    }
    let first = datetimes[0];
    let times: Vec<f64> = datetimes[..n]
        .iter()
        .map(|dt| (*dt - first).whole_seconds() as f64)
        .collect();
    let values = &values[..n];
    let count = n as f64;

    let sum_time: f64 = times.iter().sum();
    let sum_value: f64 = values.iter().sum();
    let sum_time_value: f64 = times.iter().zip(values).map(|(t, v)| t * v).sum();
    let sum_time_squared: f64 = times.iter().map(|t| t * t).sum();

    let mean_time = sum_time / count;
    let mean_value = sum_value / count;
    let mean_time_value = sum_time_value / count;
    let mean_time_squared = sum_time_squared / count;

    let denominator = mean_time_squared - mean_time * mean_time;
    let slope = (mean_time_value - mean_time * mean_value) / denominator;
    let intercept = (mean_time_squared * mean_value - mean_time_value * mean_time) / denominator;

    let sum_residual_squared: f64 = times
        .iter()
        .zip(values)
        .map(|(t, v)| {
            let residual = v - (slope * t + intercept);
            residual * residual
        })
        .sum();
    let error = (sum_residual_squared / (count - 2.0)).sqrt().abs();
    error.is_finite().then_some(error)
}

/// Regression statistics for one night's readings.
///
/// `datetimes` must be sorted. A reading gets `r_squared` only if it lies at
/// least `time_shift` inside the window; its fit uses every reading inside the
/// window within half the time range of it. `mean_r_squared` averages the
/// defined `r_squared` values of computed readings within half the averaging
/// range; readings without any defined neighbour get `None`.
pub fn compute(
    datetimes: &[PrimitiveDateTime],
    values: &[f64],
    window: NightWindow,
    params: &RegressionWindow,
) -> RegressionResult {
    let n = datetimes.len().min(values.len());
    let half_range = params.time_range_minutes * 60.0 / 2.0;
    let half_averaging = params.averaging_minutes * 60.0 / 2.0;
    let shift = time::Duration::seconds_f64(params.time_shift_minutes * 60.0);
    let earliest = window.sunset.saturating_add(shift);
    let latest = window.sunrise.saturating_sub(shift);

    let seconds_between =
        |a: PrimitiveDateTime, b: PrimitiveDateTime| (a - b).whole_seconds().abs() as f64;

    let computed: Vec<usize> = (0..n)
        .filter(|&i| earliest <= datetimes[i] && datetimes[i] <= latest)
        .collect();

    let mut r_squared = vec![None; n];
    for &i in &computed {
        let (fit_times, fit_values): (Vec<PrimitiveDateTime>, Vec<f64>) = (0..n)
            .filter(|&j| window.contains(datetimes[j]))
            .filter(|&j| seconds_between(datetimes[i], datetimes[j]) <= half_range)
            .map(|j| (datetimes[j], values[j]))
            .unzip();
        r_squared[i] = residual_standard_error(&fit_times, &fit_values);
    }

    let mut mean_r_squared = vec![None; n];
    for &i in &computed {
        let neighbours: Vec<f64> = computed
            .iter()
            .filter(|&&j| seconds_between(datetimes[i], datetimes[j]) <= half_averaging)
            .filter_map(|&j| r_squared[j])
            .collect();
        if !neighbours.is_empty() {
            mean_r_squared[i] = Some(neighbours.iter().sum::<f64>() / neighbours.len() as f64);
        }
    }

    RegressionResult {
        r_squared,
        mean_r_squared,
    }
}
