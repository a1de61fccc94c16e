//! The fixed catalogue of named bar features used for trade analysis.
//!
//! Unlike the expression-driven dispatcher these columns have fixed
//! parameters and plain names (`bb_dist_upper`, `log_return_ma_12`, ...),
//! which the trade aligner relies on for its direction-adjusted fields.

use tracing::info;

use crate::data::BarTable;
use crate::dispatch::resolve_column_name;
use crate::error::{FeatureError, FeatureResult};
use crate::indicators::{self, Deviation, VOLATILITY_LONG_WINDOW, VOLATILITY_SHORT_WINDOW};
use crate::table::FeatureTable;

const BB_PERIOD: usize = 20;
const BB_STD_MULT: f64 = 2.0;
const ATR_FAST: usize = 24;
const ATR_SLOW: usize = 200;
const VOLUME_CHANGE_WINDOW: usize = 100;
const CHANGE_LAG: usize = 4;
const SMOOTHING_WINDOWS: [usize; 3] = [12, 24, 48];

const CALL: &str = "standard feature set";

/// Every standard feature, in output order.
pub const STANDARD_FEATURES: &[&str] = &[
    "lower_bb",
    "upper_bb",
    "atr",
    "volatility_12",
    "volatility_200",
    "volatility",
    "volume_change",
    "bb_dist_upper",
    "bb_dist_lower",
    "bb_range",
    "change_4bar",
    "log_return",
    "volume_log",
    "atr_log",
    "volatility_log",
    "change_4bar_log",
    "volume_log_ma_12",
    "volume_log_ma_24",
    "volume_log_ma_48",
    "volatility_log_ma_12",
    "volatility_log_ma_24",
    "volatility_log_ma_48",
    "change_4bar_log_ma_12",
    "change_4bar_log_ma_24",
    "change_4bar_log_ma_48",
    "log_return_ma_12",
    "log_return_ma_24",
    "log_return_ma_48",
];

pub fn standard_features(bars: &BarTable) -> FeatureResult<FeatureTable> {
    select_standard_features(bars, STANDARD_FEATURES)
}

/// Compute the named subset, in catalogue order.
pub fn select_standard_features(bars: &BarTable, names: &[&str]) -> FeatureResult<FeatureTable> {
    if let Some(unknown) = names.iter().find(|name| !STANDARD_FEATURES.contains(*name)) {
        return Err(FeatureError::invalid(
            CALL,
            format!("unknown standard feature '{unknown}'"),
        ));
    }

    let close = require(bars, "close")?;
    let high = require(bars, "high")?;
    let low = require(bars, "low")?;
    let volume = require(bars, "volume")?;

    let mut computed = compute_all(close, high, low, volume);
    let mut table = FeatureTable::new(bars.timestamps().to_vec());
    for name in STANDARD_FEATURES.iter().filter(|name| names.contains(*name)) {
        if let Some(pos) = computed.iter().position(|(column, _)| column.as_str() == *name) {
            let (column, values) = computed.swap_remove(pos);
            table.push_column(column, values?)?;
        }
    }

    info!(
        features = table.width(),
        rows = table.len(),
        "Computed standard features"
    );
    Ok(table)
}

fn require<'a>(bars: &'a BarTable, name: &str) -> FeatureResult<&'a [f64]> {
    bars.column(resolve_column_name(bars.schema(), name))
        .ok_or_else(|| {
            FeatureError::invalid(
                CALL,
                format!("requires multi-schema bars with a '{name}' column"),
            )
        })
}

type Column = (String, FeatureResult<Vec<f64>>);

fn log_of(name: &str, values: &[f64]) -> FeatureResult<Vec<f64>> {
    Ok(indicators::ln(
        &indicators::replace_zero_with_min(values).map_err(|err| err.in_call(name))?,
    ))
}

/// Log-scaled columns can fail on series with no positive values; that
/// failure only surfaces if the column (or its average) is requested.
fn compute_all(close: &[f64], high: &[f64], low: &[f64], volume: &[f64]) -> Vec<Column> {
    let bands = indicators::bollinger(close, BB_PERIOD, BB_STD_MULT);
    let atr = indicators::ratio(
        &indicators::close_atr(close, ATR_FAST),
        &indicators::close_atr(close, ATR_SLOW),
    );
    let spread = indicators::difference(high, low);
    let volatility_12 =
        indicators::rolling_std(&spread, VOLATILITY_SHORT_WINDOW, Deviation::Sample);
    let volatility_200 =
        indicators::rolling_std(&spread, VOLATILITY_LONG_WINDOW, Deviation::Sample);
    let volatility = indicators::ratio(&volatility_12, &volatility_200);
    let volume_change = indicators::ratio(
        volume,
        &indicators::rolling_mean(volume, VOLUME_CHANGE_WINDOW),
    );
    let bb_dist_upper = indicators::difference(&bands.upper, close);
    let bb_dist_lower = indicators::difference(close, &bands.lower);
    let bb_range = indicators::ratio(&bands.range(), close);
    let change_4bar = indicators::abs(&indicators::log_return(close, CHANGE_LAG));
    let log_return = indicators::log_return(close, 1);

    let volume_log = indicators::volume_log(volume).map_err(|err| err.in_call("volume_log"));
    let atr_log = log_of("atr_log", &atr);
    let volatility_log = log_of("volatility_log", &volatility);
    let change_4bar_log = log_of("change_4bar_log", &change_4bar);

    let mut smoothed: Vec<Column> = Vec::new();
    for (base, values) in [
        ("volume_log", &volume_log),
        ("volatility_log", &volatility_log),
        ("change_4bar_log", &change_4bar_log),
    ] {
        for window in SMOOTHING_WINDOWS {
            smoothed.push((
                format!("{base}_ma_{window}"),
                values
                    .as_ref()
                    .map(|values| indicators::rolling_mean(values, window))
                    .map_err(Clone::clone),
            ));
        }
    }
    for window in SMOOTHING_WINDOWS {
        smoothed.push((
            format!("log_return_ma_{window}"),
            Ok(indicators::rolling_mean(&log_return, window)),
        ));
    }

    let mut out: Vec<Column> = vec![
        ("lower_bb".to_string(), Ok(bands.lower.clone())),
        ("upper_bb".to_string(), Ok(bands.upper.clone())),
        ("atr".to_string(), Ok(atr)),
        ("volatility_12".to_string(), Ok(volatility_12)),
        ("volatility_200".to_string(), Ok(volatility_200)),
        ("volatility".to_string(), Ok(volatility)),
        ("volume_change".to_string(), Ok(volume_change)),
        ("bb_dist_upper".to_string(), Ok(bb_dist_upper)),
        ("bb_dist_lower".to_string(), Ok(bb_dist_lower)),
        ("bb_range".to_string(), Ok(bb_range)),
        ("change_4bar".to_string(), Ok(change_4bar)),
        ("log_return".to_string(), Ok(log_return)),
        ("volume_log".to_string(), volume_log),
        ("atr_log".to_string(), atr_log),
        ("volatility_log".to_string(), volatility_log),
        ("change_4bar_log".to_string(), change_4bar_log),
    ];
    out.extend(smoothed);
    out
}
