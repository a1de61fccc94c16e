//! Joins trades with the bar and feature values that were known when the
//! trade was placed.
//!
//! A bar's values are only known once the bar has closed, so a trade is
//! matched to the bar whose *following* bar opens at the trade's entry time.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Datelike, Timelike, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data::{BarTable, format_timestamp};
use crate::error::{FeatureError, FeatureResult};
use crate::table::{FeatureTable, unique_column_names};
use crate::trades::{Trade, TradeBook, TradeDirection};

/// Trades entering at an open that matches no bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    /// Keep them with empty feature values.
    #[default]
    Keep,
    Drop,
}

/// Source columns whose sign is flipped into a direction-relative field.
const RETURN_DIRECTIONS: [(&str, &str); 4] = [
    ("log_return", "log_return_direction"),
    ("log_return_ma_12", "log_return_direction_12"),
    ("log_return_ma_24", "log_return_direction_24"),
    ("log_return_ma_48", "log_return_direction_48"),
];

const BB_DIST_UPPER: &str = "bb_dist_upper";
const BB_DIST_LOWER: &str = "bb_dist_lower";

/// Bars and their computed features for one asset.
#[derive(Debug, Clone)]
pub struct AssetFrame {
    pub asset: String,
    pub bars: BarTable,
    pub features: FeatureTable,
}

impl AssetFrame {
    pub fn new(asset: impl Into<String>, bars: BarTable, features: FeatureTable) -> Result<Self> {
        let asset = asset.into();
        if bars.timestamps() != features.timestamps() {
            return Err(anyhow!(
                "Feature table for {asset} is not aligned with its bars ({} bars, {} feature rows)",
                bars.len(),
                features.len()
            ));
        }
        Ok(Self {
            asset,
            bars,
            features,
        })
    }

    /// Column names of a joined row: bar columns, `next_open`, then features.
    fn joined_columns(&self) -> Vec<String> {
        let names = self
            .bars
            .column_names()
            .into_iter()
            .chain(std::iter::once("next_open"))
            .chain(self.features.column_names());
        unique_column_names(names)
    }

    fn joined_row(&self, next_open: &[f64], idx: usize) -> Vec<Option<f64>> {
        self.bars
            .columns()
            .map(|(_, values)| values[idx])
            .chain(std::iter::once(next_open[idx]))
            .chain(self.features.columns().iter().map(|c| c.values[idx]))
            .map(|v| if v.is_nan() { None } else { Some(v) })
            .collect()
    }
}

/// A trade with the bar state that was knowable at entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedTrade {
    pub trade: Trade,
    /// Open time of the bar after the matched bar; equals the entry time
    /// when matched.
    pub next_bar_open: Option<DateTime<Utc>>,
    /// Open time of the matched bar.
    pub bar_time: Option<DateTime<Utc>>,
    pub values: Vec<(String, Option<f64>)>,
    pub win: u8,
    /// Day of week of the entry, Monday = 0.
    pub dow: u32,
    pub hour: u32,
}

impl AlignedTrade {
    pub fn is_matched(&self) -> bool {
        self.next_bar_open.is_some()
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(column, _)| column == name)
            .and_then(|(_, value)| *value)
    }

    fn has_column(&self, name: &str) -> bool {
        self.values.iter().any(|(column, _)| column == name)
    }

    fn negate(&mut self, name: &str) {
        for (column, value) in self.values.iter_mut() {
            if column == name {
                *value = value.map(|v| -v);
            }
        }
    }

    /// Rewrites directional fields so a larger value always reads as
    /// "further in the trade's favour".
    fn apply_direction(&mut self) {
        let direction = self.trade.direction;
        if direction == TradeDirection::Short {
            self.negate(BB_DIST_UPPER);
        }
        if direction == TradeDirection::Long {
            self.negate(BB_DIST_LOWER);
        }
        for (source, derived) in RETURN_DIRECTIONS {
            if !self.has_column(source) {
                continue;
            }
            let value = self.value(source).map(|v| match direction {
                TradeDirection::Long => v,
                TradeDirection::Short => -v,
            });
            self.values.push((derived.to_string(), value));
        }
    }
}

/// Per-asset join statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetAlignment {
    pub asset: String,
    pub trades: usize,
    pub matched: usize,
    pub unmatched_entry_times: Vec<DateTime<Utc>>,
}

impl AssetAlignment {
    pub fn unmatched(&self) -> usize {
        self.unmatched_entry_times.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlignmentReport {
    pub assets: Vec<AssetAlignment>,
}

impl AlignmentReport {
    pub fn total_trades(&self) -> usize {
        self.assets.iter().map(|a| a.trades).sum()
    }

    pub fn total_matched(&self) -> usize {
        self.assets.iter().map(|a| a.matched).sum()
    }

    pub fn total_unmatched(&self) -> usize {
        self.assets.iter().map(AssetAlignment::unmatched).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedTradeSet {
    trades: Vec<AlignedTrade>,
}

impl AlignedTradeSet {
    pub fn new(trades: Vec<AlignedTrade>) -> Self {
        Self { trades }
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn trades(&self) -> &[AlignedTrade] {
        &self.trades
    }

    /// Value columns in first-seen order across all trades.
    pub fn value_columns(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for trade in &self.trades {
            for (name, _) in &trade.values {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    fn extra_columns(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for trade in &self.trades {
            for (name, _) in &trade.trade.extra {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// `Entry Time, Exit Time, Asset, Type, Profit`, the remaining trade-log
    /// columns, `bar_time, next_bar_open`, the joined values, then
    /// `win, dow, hour`.
    pub fn to_data_frame(&self) -> Result<DataFrame> {
        let time_text = |ts: &Option<DateTime<Utc>>| ts.as_ref().map(format_timestamp);
        let extras = self.extra_columns();
        let values = self.value_columns();

        let mut series: Vec<Series> = vec![
            Series::new(
                "Entry Time",
                self.trades
                    .iter()
                    .map(|t| format_timestamp(&t.trade.entry_time))
                    .collect::<Vec<_>>(),
            ),
            Series::new(
                "Exit Time",
                self.trades
                    .iter()
                    .map(|t| format_timestamp(&t.trade.exit_time))
                    .collect::<Vec<_>>(),
            ),
            Series::new(
                "Asset",
                self.trades
                    .iter()
                    .map(|t| t.trade.asset.clone())
                    .collect::<Vec<_>>(),
            ),
            Series::new(
                "Type",
                self.trades
                    .iter()
                    .map(|t| t.trade.direction.as_str())
                    .collect::<Vec<_>>(),
            ),
            Series::new(
                "Profit",
                self.trades.iter().map(|t| t.trade.profit).collect::<Vec<_>>(),
            ),
        ];
        for name in &extras {
            let cells: Vec<Option<String>> = self
                .trades
                .iter()
                .map(|t| {
                    t.trade
                        .extra
                        .iter()
                        .find(|(column, _)| column == name)
                        .and_then(|(_, cell)| cell.clone())
                })
                .collect();
            series.push(Series::new(name, cells));
        }
        series.push(Series::new(
            "bar_time",
            self.trades
                .iter()
                .map(|t| time_text(&t.bar_time))
                .collect::<Vec<_>>(),
        ));
        series.push(Series::new(
            "next_bar_open",
            self.trades
                .iter()
                .map(|t| time_text(&t.next_bar_open))
                .collect::<Vec<_>>(),
        ));
        for name in &values {
            let cells: Vec<Option<f64>> = self.trades.iter().map(|t| t.value(name)).collect();
            series.push(Series::new(name, cells));
        }
        series.push(Series::new(
            "win",
            self.trades.iter().map(|t| t.win as u32).collect::<Vec<_>>(),
        ));
        series.push(Series::new(
            "dow",
            self.trades.iter().map(|t| t.dow).collect::<Vec<_>>(),
        ));
        series.push(Series::new(
            "hour",
            self.trades.iter().map(|t| t.hour).collect::<Vec<_>>(),
        ));

        let names = unique_column_names(series.iter().map(|s| s.name()));
        for (series, name) in series.iter_mut().zip(names) {
            if series.name() != name {
                series.rename(&name);
            }
        }
        DataFrame::new(series).context("Failed to assemble aligned trade frame")
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlignmentOutcome {
    pub trades: AlignedTradeSet,
    pub report: AlignmentReport,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TradeAligner {
    policy: UnmatchedPolicy,
}

impl TradeAligner {
    pub fn new(policy: UnmatchedPolicy) -> Self {
        Self { policy }
    }

    /// Left-join one asset's trades on `next_bar_open`, ordered by it with
    /// unmatched trades last in input order.
    pub fn align_asset(
        &self,
        frame: &AssetFrame,
        trades: &[Trade],
    ) -> (Vec<AlignedTrade>, AssetAlignment) {
        let next_bar_open = frame.bars.next_bar_open();
        let next_open = frame.bars.next_open();
        let by_next_open: HashMap<DateTime<Utc>, usize> = next_bar_open
            .iter()
            .enumerate()
            .filter_map(|(idx, ts)| ts.map(|ts| (ts, idx)))
            .collect();
        let columns = frame.joined_columns();

        let mut report = AssetAlignment {
            asset: frame.asset.clone(),
            trades: trades.len(),
            matched: 0,
            unmatched_entry_times: Vec::new(),
        };
        let mut aligned = Vec::with_capacity(trades.len());
        for trade in trades {
            let bar = by_next_open.get(&trade.entry_time).copied();
            let row = match bar {
                Some(idx) => {
                    report.matched += 1;
                    frame.joined_row(&next_open, idx)
                }
                None => {
                    report.unmatched_entry_times.push(trade.entry_time);
                    if self.policy == UnmatchedPolicy::Drop {
                        continue;
                    }
                    vec![None; columns.len()]
                }
            };
            let mut joined = AlignedTrade {
                trade: trade.clone(),
                next_bar_open: bar.and_then(|idx| next_bar_open[idx]),
                bar_time: bar.map(|idx| frame.bars.timestamps()[idx]),
                values: columns.iter().cloned().zip(row).collect(),
                win: u8::from(trade.is_win()),
                dow: trade.entry_time.weekday().num_days_from_monday(),
                hour: trade.entry_time.hour(),
            };
            joined.apply_direction();
            aligned.push(joined);
        }
        aligned.sort_by_key(|t| (t.next_bar_open.is_none(), t.next_bar_open));

        if report.unmatched() > 0 {
            warn!(
                asset = %frame.asset,
                unmatched = report.unmatched(),
                trades = report.trades,
                policy = ?self.policy,
                "Trades without a bar whose next open matches their entry time"
            );
        }
        (aligned, report)
    }

    /// Align every asset, then order all trades by entry time.
    pub fn align(&self, frames: &[AssetFrame], book: &TradeBook) -> Result<AlignmentOutcome> {
        let mut all = Vec::new();
        let mut report = AlignmentReport::default();
        for frame in frames {
            let trades = book
                .trades_for(&frame.asset)
                .with_context(|| format!("Failed to load trades for {}", frame.asset))?;
            let (aligned, asset_report) = self.align_asset(frame, &trades);
            all.extend(aligned);
            report.assets.push(asset_report);
        }
        all.sort_by_key(|t| t.trade.entry_time);

        info!(
            assets = report.assets.len(),
            trades = report.total_trades(),
            matched = report.total_matched(),
            unmatched = report.total_unmatched(),
            "Aligned trades with bar features"
        );
        Ok(AlignmentOutcome {
            trades: AlignedTradeSet::new(all),
            report,
        })
    }
}

/// Inclusive `[low, high]` range on one joined value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRange {
    pub feature: String,
    pub low: f64,
    pub high: f64,
}

impl FeatureRange {
    pub fn new(feature: impl Into<String>, low: f64, high: f64) -> FeatureResult<Self> {
        let feature = feature.into();
        if low.is_nan() || high.is_nan() || low > high {
            return Err(FeatureError::invalid(
                "filter",
                format!("bad range [{low}, {high}] for '{feature}'"),
            ));
        }
        Ok(Self { feature, low, high })
    }

    pub fn contains(&self, trade: &AlignedTrade) -> bool {
        trade
            .value(&self.feature)
            .is_some_and(|v| v >= self.low && v <= self.high)
    }
}

impl fmt::Display for FeatureRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.feature, self.low, self.high)
    }
}

/// `feature:low:high`.
impl FromStr for FeatureRange {
    type Err = FeatureError;

    fn from_str(raw: &str) -> FeatureResult<Self> {
        let mut parts = raw.trim().rsplitn(3, ':');
        let (Some(high), Some(low), Some(feature)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(FeatureError::invalid(
                "filter",
                format!("expected feature:low:high, got '{raw}'"),
            ));
        };
        let bound = |text: &str| {
            text.trim().parse::<f64>().map_err(|_| {
                FeatureError::invalid("filter", format!("bad bound '{text}' in '{raw}'"))
            })
        };
        FeatureRange::new(feature.trim(), bound(low)?, bound(high)?)
    }
}

/// Keep trades that fall inside any of `ranges`. Order is preserved and a
/// trade matching several ranges appears once.
pub fn filter_trades(
    set: &AlignedTradeSet,
    ranges: &[FeatureRange],
) -> FeatureResult<AlignedTradeSet> {
    let columns = set.value_columns();
    if !set.is_empty() {
        if let Some(missing) = ranges
            .iter()
            .find(|range| !columns.contains(&range.feature.as_str()))
        {
            return Err(FeatureError::invalid(
                "filter",
                format!("unknown feature '{}'", missing.feature),
            ));
        }
    }
    let kept: Vec<AlignedTrade> = set
        .trades
        .iter()
        .filter(|trade| ranges.iter().any(|range| range.contains(trade)))
        .cloned()
        .collect();
    info!(
        before = set.len(),
        after = kept.len(),
        ranges = ranges.len(),
        "Filtered aligned trades"
    );
    Ok(AlignedTradeSet::new(kept))
}
