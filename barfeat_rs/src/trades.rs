use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::{parse_timestamp, series_to_f64};

/// Substituted with the asset name in per-asset trade and bar paths.
pub const ASSET_PLACEHOLDER: &str = "{ASSET}";

const ASSET_HEADERS: &[&str] = &["asset"];
const ENTRY_HEADERS: &[&str] = &["open", "entry time"];
const EXIT_HEADERS: &[&str] = &["close", "exit time"];
const TYPE_HEADERS: &[&str] = &["type"];
const PROFIT_HEADERS: &[&str] = &["profit"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeDirection::Long => "Long",
            TradeDirection::Short => "Short",
        }
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeDirection {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("long") {
            Ok(TradeDirection::Long)
        } else if trimmed.eq_ignore_ascii_case("short") {
            Ok(TradeDirection::Short)
        } else {
            Err(anyhow!("Unknown trade direction '{raw}' (expected Long or Short)"))
        }
    }
}

/// One closed trade from a trade log.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub asset: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub direction: TradeDirection,
    pub profit: f64,
    /// Remaining log columns, carried through as text.
    pub extra: Vec<(String, Option<String>)>,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.profit > 0.0
    }
}

/// Where trades come from: one combined log for every asset, or one file
/// per asset selected through the `{ASSET}` placeholder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TradeSource {
    Combined(PathBuf),
    PerAsset(String),
}

impl TradeSource {
    pub fn from_path(path: &str) -> Self {
        if path.contains(ASSET_PLACEHOLDER) {
            TradeSource::PerAsset(path.to_string())
        } else {
            TradeSource::Combined(PathBuf::from(path))
        }
    }
}

/// Path for `asset` from a template. `/` is dropped from the asset name so
/// pairs such as `EUR/USD` map to a single file name.
pub fn asset_path(template: &str, asset: &str) -> PathBuf {
    PathBuf::from(template.replace(ASSET_PLACEHOLDER, &asset.replace('/', "")))
}

/// Trades ready to be handed out per asset. A combined log is read once.
#[derive(Debug, Clone)]
pub struct TradeBook {
    source: TradeSource,
    combined: Vec<Trade>,
}

impl TradeBook {
    pub fn open(source: TradeSource) -> Result<Self> {
        let combined = match &source {
            TradeSource::Combined(path) => load_trades_csv(path, None)?,
            TradeSource::PerAsset(_) => Vec::new(),
        };
        Ok(Self { source, combined })
    }

    pub fn from_trades(trades: Vec<Trade>) -> Self {
        Self {
            source: TradeSource::Combined(PathBuf::new()),
            combined: trades,
        }
    }

    /// A combined log matches every trade whose `Asset` contains `asset`.
    pub fn trades_for(&self, asset: &str) -> Result<Vec<Trade>> {
        match &self.source {
            TradeSource::Combined(_) => Ok(self
                .combined
                .iter()
                .filter(|trade| trade.asset.contains(asset))
                .cloned()
                .collect()),
            TradeSource::PerAsset(template) => {
                load_trades_csv(&asset_path(template, asset), Some(asset))
            }
        }
    }
}

/// Reads a trade log. `default_asset` fills in the asset for per-asset
/// files that omit the `Asset` column.
pub fn load_trades_csv(path: &Path, default_asset: Option<&str>) -> Result<Vec<Trade>> {
    let df = CsvReader::from_path(path)
        .with_context(|| format!("Failed to open trade log {}", path.display()))?
        .infer_schema(Some(1024))
        .has_header(true)
        .finish()
        .with_context(|| format!("Unable to read {} into a DataFrame", path.display()))?;
    let trades = trades_from_data_frame(&df, default_asset)
        .with_context(|| format!("Invalid trade log {}", path.display()))?;
    info!(trades = trades.len(), path = %path.display(), "Loaded trade log");
    Ok(trades)
}

pub fn trades_from_data_frame(df: &DataFrame, default_asset: Option<&str>) -> Result<Vec<Trade>> {
    let height = df.height();
    let assets = match find_column(df, ASSET_HEADERS) {
        Some(series) => text_cells(series),
        None => match default_asset {
            Some(asset) => vec![Some(asset.to_string()); height],
            None => return Err(anyhow!("Trade log is missing the 'Asset' column")),
        },
    };
    let entries = required(df, ENTRY_HEADERS, "open")?;
    let exits = required(df, EXIT_HEADERS, "close")?;
    let types = required(df, TYPE_HEADERS, "Type")?;
    let profit_series = find_column(df, PROFIT_HEADERS)
        .with_context(|| "Trade log is missing the 'Profit' column")?;
    let profits = series_to_f64(profit_series).context("'Profit' must be numeric")?;

    let known: Vec<&str> = [
        ASSET_HEADERS,
        ENTRY_HEADERS,
        EXIT_HEADERS,
        TYPE_HEADERS,
        PROFIT_HEADERS,
    ]
    .concat();
    let extras: Vec<(String, Vec<Option<String>>)> = df
        .get_columns()
        .iter()
        .filter(|series| {
            !known
                .iter()
                .any(|header| series.name().eq_ignore_ascii_case(header))
        })
        .map(|series| (series.name().to_string(), text_cells(series)))
        .collect();
    debug!(extra_columns = extras.len(), "Trade log extra columns");

    let mut trades = Vec::with_capacity(height);
    for row in 0..height {
        let line = row + 2;
        let asset = assets[row]
            .clone()
            .with_context(|| format!("Trade on line {line} has no asset"))?;
        let entry_time = parse_cell(&entries[row], "open", line)?;
        let exit_time = parse_cell(&exits[row], "close", line)?;
        let direction = types[row]
            .as_deref()
            .with_context(|| format!("Trade on line {line} has no Type"))?
            .parse::<TradeDirection>()
            .with_context(|| format!("Trade on line {line}"))?;
        let extra = extras
            .iter()
            .map(|(name, cells)| (name.clone(), cells[row].clone()))
            .collect();
        trades.push(Trade {
            asset,
            entry_time,
            exit_time,
            direction,
            profit: profits[row],
            extra,
        });
    }
    Ok(trades)
}

fn find_column<'a>(df: &'a DataFrame, headers: &[&str]) -> Option<&'a Series> {
    df.get_columns().iter().find(|series| {
        headers
            .iter()
            .any(|header| series.name().eq_ignore_ascii_case(header))
    })
}

fn required(df: &DataFrame, headers: &[&str], label: &str) -> Result<Vec<Option<String>>> {
    find_column(df, headers)
        .map(text_cells)
        .with_context(|| format!("Trade log is missing the '{label}' column"))
}

fn parse_cell(cell: &Option<String>, label: &str, line: usize) -> Result<DateTime<Utc>> {
    let raw = cell
        .as_deref()
        .with_context(|| format!("Trade on line {line} has no '{label}' time"))?;
    parse_timestamp(raw).with_context(|| format!("Trade on line {line}: bad '{label}' time"))
}

fn text_cells(series: &Series) -> Vec<Option<String>> {
    series.iter().map(cell_text).collect()
}

fn cell_text(value: AnyValue<'_>) -> Option<String> {
    match value {
        AnyValue::Null => None,
        AnyValue::String(s) => Some(s.to_string()),
        AnyValue::StringOwned(ref s) => Some(s.as_str().to_string()),
        other => Some(other.to_string()),
    }
}
