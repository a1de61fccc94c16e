//! Rolling-window indicator math.
//!
//! Every function here is pure: it takes one or more time-aligned series and
//! returns a fresh series of the same length. Warm-up entries and anything
//! else that cannot be computed are `f64::NAN`; windows are counted in bars.

use crate::error::{FeatureError, FeatureResult};

/// Short window of the `VOLATILITY_LOG_MA` spread ratio.
pub const VOLATILITY_SHORT_WINDOW: usize = 12;
/// Long (baseline) window of the `VOLATILITY_LOG_MA` spread ratio.
pub const VOLATILITY_LONG_WINDOW: usize = 200;
/// Baseline mean window of `VOLUME_LOG_MA`.
pub const VOLUME_BASELINE_WINDOW: usize = 200;
/// Normalization applied to the Bollinger band width (`BBANDS` band 4).
/// The width is reported in price units, so the scale is the identity.
pub const BB_RANGE_SCALE: f64 = 1.0;

const SMALL_DIVISOR: f64 = 1e-12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deviation {
    /// Divide by `n - 1`.
    Sample,
    /// Divide by `n`.
    Population,
}

impl Deviation {
    fn ddof(self) -> usize {
        match self {
            Deviation::Sample => 1,
            Deviation::Population => 0,
        }
    }
}

/// Trailing arithmetic mean over `period` bars ending at (and including) the
/// current bar. A window holding any undefined value is undefined.
pub fn rolling_mean(values: &[f64], period: usize) -> Vec<f64> {
    let len = values.len();
    let mut out = vec![f64::NAN; len];
    if period == 0 || period > len {
        return out;
    }
    for end in period - 1..len {
        let window = &values[end + 1 - period..=end];
        if window.iter().all(|v| v.is_finite()) {
            out[end] = window_mean(window);
        }
    }
    out
}

/// Neumaier-compensated mean. A flat window returns its value exactly.
fn window_mean(window: &[f64]) -> f64 {
    let first = window[0];
    if window.iter().all(|&v| v == first) {
        return first;
    }
    let mut sum = 0.0_f64;
    let mut compensation = 0.0_f64;
    for &value in window {
        let total = sum + value;
        if sum.abs() >= value.abs() {
            compensation += (sum - total) + value;
        } else {
            compensation += (value - sum) + total;
        }
        sum = total;
    }
    (sum + compensation) / window.len() as f64
}

pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    rolling_mean(values, period)
}

pub fn rolling_std(values: &[f64], period: usize, deviation: Deviation) -> Vec<f64> {
    let len = values.len();
    let ddof = deviation.ddof();
    if period == 0 || period <= ddof {
        return vec![f64::NAN; len];
    }
    let mean = rolling_mean(values, period);
    (0..len)
        .map(|i| {
            let mean_val = mean[i];
            if i + 1 < period || !mean_val.is_finite() {
                return f64::NAN;
            }
            let window = &values[i + 1 - period..=i];
            let variance_sum = window
                .iter()
                .map(|x| (x - mean_val).powi(2))
                .sum::<f64>();
            (variance_sum / (period - ddof) as f64).sqrt()
        })
        .collect()
}

/// Shift a series forward by `lag` bars, filling the head with NaN.
pub fn shift(values: &[f64], lag: usize) -> Vec<f64> {
    let len = values.len();
    let mut out = vec![f64::NAN; len];
    if lag < len {
        out[lag..].copy_from_slice(&values[..len - lag]);
    }
    out
}

pub fn difference(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b.iter()).map(|(x, y)| x - y).collect()
}

pub fn ratio(num: &[f64], denom: &[f64]) -> Vec<f64> {
    num.iter()
        .zip(denom.iter())
        .map(|(n, d)| {
            if d.abs() < SMALL_DIVISOR {
                f64::NAN
            } else {
                n / d
            }
        })
        .collect()
}

pub fn ln(values: &[f64]) -> Vec<f64> {
    values.iter().map(|v| v.ln()).collect()
}

pub fn abs(values: &[f64]) -> Vec<f64> {
    values.iter().map(|v| v.abs()).collect()
}

/// `ln(x[t] / x[t - lag])`.
pub fn log_return(values: &[f64], lag: usize) -> Vec<f64> {
    ln(&ratio(values, &shift(values, lag)))
}

/// Replace every exact zero with the smallest strictly positive value found
/// anywhere in the series, so a following `ln` never sees zero. Undefined
/// entries stay undefined; an all-undefined series passes through unchanged.
pub fn replace_zero_with_min(values: &[f64]) -> FeatureResult<Vec<f64>> {
    let mut has_defined = false;
    let mut floor: Option<f64> = None;
    for &value in values {
        if value.is_nan() {
            continue;
        }
        has_defined = true;
        if value > 0.0 {
            floor = Some(floor.map_or(value, |current| current.min(value)));
        }
    }

    let Some(floor) = floor else {
        if has_defined {
            return Err(FeatureError::domain(
                "replace_zero_with_min",
                "series has no strictly positive values to substitute for zero",
            ));
        }
        return Ok(values.to_vec());
    };

    Ok(values
        .iter()
        .map(|&value| if value == 0.0 { floor } else { value })
        .collect())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandSelector {
    Upper = 1,
    Lower = 2,
    Middle = 3,
    Range = 4,
}

impl TryFrom<i64> for BandSelector {
    type Error = FeatureError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(BandSelector::Upper),
            2 => Ok(BandSelector::Lower),
            3 => Ok(BandSelector::Middle),
            4 => Ok(BandSelector::Range),
            other => Err(FeatureError::invalid(
                "BBANDS",
                format!("band must be one of 1=upper, 2=lower, 3=middle, 4=range (got {other})"),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BollingerBands {
    pub middle: Vec<f64>,
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
}

impl BollingerBands {
    pub fn range(&self) -> Vec<f64> {
        self.upper
            .iter()
            .zip(self.lower.iter())
            .map(|(u, l)| (u - l) * BB_RANGE_SCALE)
            .collect()
    }

    pub fn select(self, band: BandSelector) -> Vec<f64> {
        match band {
            BandSelector::Upper => self.upper,
            BandSelector::Lower => self.lower,
            BandSelector::Middle => self.middle,
            BandSelector::Range => self.range(),
        }
    }
}

/// Bollinger bands around a trailing SMA, using the population standard
/// deviation of the same window.
pub fn bollinger(values: &[f64], period: usize, std_mult: f64) -> BollingerBands {
    let middle = rolling_mean(values, period);
    let std = rolling_std(values, period, Deviation::Population);
    let upper = middle
        .iter()
        .zip(std.iter())
        .map(|(m, s)| m + s * std_mult)
        .collect();
    let lower = middle
        .iter()
        .zip(std.iter())
        .map(|(m, s)| m - s * std_mult)
        .collect();
    BollingerBands {
        middle,
        upper,
        lower,
    }
}

pub fn bbands(values: &[f64], period: usize, std_mult: f64, band: BandSelector) -> Vec<f64> {
    bollinger(values, period, std_mult).select(band)
}

/// Per-bar true range. The first bar has no previous close, so its range is
/// `high - low` alone.
pub fn true_range(close: &[f64], high: &[f64], low: &[f64]) -> Vec<f64> {
    debug_assert!(close.len() == high.len() && high.len() == low.len());
    (0..high.len())
        .map(|i| {
            let high_low = high[i] - low[i];
            if i == 0 {
                return high_low;
            }
            let prev_close = close[i - 1];
            [
                high_low,
                (high[i] - prev_close).abs(),
                (low[i] - prev_close).abs(),
            ]
            .into_iter()
            .filter(|v| !v.is_nan())
            .fold(f64::NAN, f64::max)
        })
        .collect()
}

/// Trailing simple mean of the true range.
pub fn atr(close: &[f64], high: &[f64], low: &[f64], period: usize) -> Vec<f64> {
    rolling_mean(&true_range(close, high, low), period)
}

/// Exponentially weighted mean with `alpha = 1 / period` and adjusted
/// weights: `y[t] = sum((1 - alpha)^k * x[t - k]) / sum((1 - alpha)^k)` over
/// every defined observation since the first one. Undefined bars after the
/// first observation decay the weights and repeat the last mean.
pub fn ewm_mean(values: &[f64], period: usize) -> Vec<f64> {
    let len = values.len();
    let mut out = vec![f64::NAN; len];
    if period == 0 {
        return out;
    }
    let decay = 1.0 - 1.0 / period as f64;
    let mut weighted: Option<(f64, f64)> = None;
    for (idx, &value) in values.iter().enumerate() {
        weighted = match (weighted, value.is_finite()) {
            (None, false) => None,
            (None, true) => Some((value, 1.0)),
            (Some((num, den)), true) => Some((value + decay * num, 1.0 + decay * den)),
            (Some((num, den)), false) => Some((decay * num, decay * den)),
        };
        if let Some((num, den)) = weighted {
            out[idx] = num / den;
        }
    }
    out
}

/// Close-only ATR: the true range of each `period`-bar close window against
/// the previous close, smoothed with [`ewm_mean`] over `period`.
pub fn close_atr(close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    if period == 0 || period > len {
        return vec![f64::NAN; len];
    }
    let mut ranges = vec![f64::NAN; len];
    for i in period - 1..len {
        let window = &close[i + 1 - period..=i];
        if window.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let hi = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let lo = window.iter().copied().fold(f64::INFINITY, f64::min);
        let mut range = hi - lo;
        if i >= 1 && close[i - 1].is_finite() {
            let prev = close[i - 1];
            range = range.max((hi - prev).abs()).max((lo - prev).abs());
        }
        ranges[i] = range;
    }
    ewm_mean(&ranges, period)
}

/// Sample std of `high - low` over the short window divided by the same over
/// the long window.
pub fn volatility_ratio(high: &[f64], low: &[f64]) -> Vec<f64> {
    let spread = difference(high, low);
    let short = rolling_std(&spread, VOLATILITY_SHORT_WINDOW, Deviation::Sample);
    let long = rolling_std(&spread, VOLATILITY_LONG_WINDOW, Deviation::Sample);
    ratio(&short, &long)
}

pub fn volatility_log(high: &[f64], low: &[f64]) -> FeatureResult<Vec<f64>> {
    Ok(ln(&replace_zero_with_min(&volatility_ratio(high, low))?))
}

pub fn volatility_log_ma(high: &[f64], low: &[f64], period: usize) -> FeatureResult<Vec<f64>> {
    Ok(rolling_mean(&volatility_log(high, low)?, period))
}

/// `ln(volume) / ln(mean volume over the baseline window)`, both sides with
/// zeros replaced before the log.
pub fn volume_log(volume: &[f64]) -> FeatureResult<Vec<f64>> {
    let numerator = ln(&replace_zero_with_min(volume)?);
    let baseline = rolling_mean(volume, VOLUME_BASELINE_WINDOW);
    let denominator = ln(&replace_zero_with_min(&baseline)?);
    Ok(ratio(&numerator, &denominator))
}

pub fn volume_log_ma(volume: &[f64], period: usize) -> FeatureResult<Vec<f64>> {
    Ok(rolling_mean(&volume_log(volume)?, period))
}
