use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{FeatureError, FeatureResult};
use crate::indicators::{self, BandSelector};

/// How a positional argument of an indicator call is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// Positive integer window length.
    Period,
    /// Finite real number.
    Float,
    /// Bollinger band selector code, 1 through 4.
    Band,
    /// Name of a bar column.
    Column,
}

impl ArgKind {
    pub fn label(self) -> &'static str {
        match self {
            ArgKind::Period => "period",
            ArgKind::Float => "number",
            ArgKind::Band => "band selector",
            ArgKind::Column => "column",
        }
    }
}

/// A resolved argument, borrowing column data from the bar table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ArgValue<'a> {
    Period(usize),
    Float(f64),
    Band(BandSelector),
    Column(&'a [f64]),
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndicatorArgs<'a> {
    values: Vec<ArgValue<'a>>,
}

impl<'a> IndicatorArgs<'a> {
    pub fn new(values: Vec<ArgValue<'a>>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn period(&self, idx: usize) -> FeatureResult<usize> {
        match self.values.get(idx) {
            Some(ArgValue::Period(period)) => Ok(*period),
            _ => Err(mismatch(idx, ArgKind::Period)),
        }
    }

    pub fn float(&self, idx: usize) -> FeatureResult<f64> {
        match self.values.get(idx) {
            Some(ArgValue::Float(value)) => Ok(*value),
            _ => Err(mismatch(idx, ArgKind::Float)),
        }
    }

    pub fn band(&self, idx: usize) -> FeatureResult<BandSelector> {
        match self.values.get(idx) {
            Some(ArgValue::Band(band)) => Ok(*band),
            _ => Err(mismatch(idx, ArgKind::Band)),
        }
    }

    pub fn column(&self, idx: usize) -> FeatureResult<&'a [f64]> {
        match self.values.get(idx) {
            Some(ArgValue::Column(values)) => Ok(values),
            _ => Err(mismatch(idx, ArgKind::Column)),
        }
    }
}

fn mismatch(idx: usize, expected: ArgKind) -> FeatureError {
    FeatureError::invalid(
        "",
        format!("argument {} is not a {}", idx + 1, expected.label()),
    )
}

pub type ComputeFn = fn(&IndicatorArgs<'_>) -> FeatureResult<Vec<f64>>;

#[derive(Debug, Clone, Copy)]
pub struct IndicatorSpec {
    pub name: &'static str,
    pub args: &'static [ArgKind],
    /// Argument list as shown to users, e.g. `period, column`.
    pub usage: &'static str,
    pub description: &'static str,
    compute: ComputeFn,
}

impl IndicatorSpec {
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn compute(&self, args: &IndicatorArgs<'_>) -> FeatureResult<Vec<f64>> {
        (self.compute)(args)
    }
}

static INDICATORS: Lazy<HashMap<&'static str, IndicatorSpec>> = Lazy::new(|| {
    let mut m = HashMap::new();

    m.insert(
        "SMA",
        IndicatorSpec {
            name: "SMA",
            args: &[ArgKind::Period, ArgKind::Column],
            usage: "period, column",
            description: "Simple moving average",
            compute: compute_sma,
        },
    );

    m.insert(
        "BBANDS",
        IndicatorSpec {
            name: "BBANDS",
            args: &[
                ArgKind::Period,
                ArgKind::Float,
                ArgKind::Band,
                ArgKind::Column,
            ],
            usage: "period, std_mult, band (1=upper 2=lower 3=middle 4=range), column",
            description: "Bollinger band over a population standard deviation",
            compute: compute_bbands,
        },
    );

    m.insert(
        "ATR",
        IndicatorSpec {
            name: "ATR",
            args: &[
                ArgKind::Period,
                ArgKind::Column,
                ArgKind::Column,
                ArgKind::Column,
            ],
            usage: "period, close, high, low",
            description: "Simple moving average of the true range",
            compute: compute_atr,
        },
    );

    m.insert(
        "VOLATILITY_LOG_MA",
        IndicatorSpec {
            name: "VOLATILITY_LOG_MA",
            args: &[ArgKind::Period, ArgKind::Column, ArgKind::Column],
            usage: "period, high, low",
            description: "Moving average of the log short/long range-volatility ratio",
            compute: compute_volatility_log_ma,
        },
    );

    m.insert(
        "VOLUME_LOG_MA",
        IndicatorSpec {
            name: "VOLUME_LOG_MA",
            args: &[ArgKind::Period, ArgKind::Column],
            usage: "period, volume",
            description: "Moving average of log volume relative to its long baseline",
            compute: compute_volume_log_ma,
        },
    );

    m
});

fn compute_sma(args: &IndicatorArgs<'_>) -> FeatureResult<Vec<f64>> {
    Ok(indicators::sma(args.column(1)?, args.period(0)?))
}

fn compute_bbands(args: &IndicatorArgs<'_>) -> FeatureResult<Vec<f64>> {
    Ok(indicators::bbands(
        args.column(3)?,
        args.period(0)?,
        args.float(1)?,
        args.band(2)?,
    ))
}

fn compute_atr(args: &IndicatorArgs<'_>) -> FeatureResult<Vec<f64>> {
    Ok(indicators::atr(
        args.column(1)?,
        args.column(2)?,
        args.column(3)?,
        args.period(0)?,
    ))
}

fn compute_volatility_log_ma(args: &IndicatorArgs<'_>) -> FeatureResult<Vec<f64>> {
    indicators::volatility_log_ma(args.column(1)?, args.column(2)?, args.period(0)?)
}

fn compute_volume_log_ma(args: &IndicatorArgs<'_>) -> FeatureResult<Vec<f64>> {
    indicators::volume_log_ma(args.column(1)?, args.period(0)?)
}

/// Exact, case-sensitive lookup.
pub fn find_indicator(name: &str) -> Option<&'static IndicatorSpec> {
    INDICATORS.get(name)
}

pub fn indicator_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = INDICATORS.keys().copied().collect();
    names.sort_unstable();
    names
}
