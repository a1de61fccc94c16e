use std::io::Write;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::info;

use crate::align::{AlignmentReport, AssetFrame, TradeAligner, filter_trades};
use crate::config::{FeatureConfig, MergeConfig, OutputMode};
use crate::data::{BarSchema, BarTable};
use crate::dispatch::compute_features;
use crate::output::{write_aligned_csv, write_feature_csv, write_tail_newest_first};
use crate::standard::standard_features;
use crate::table::FeatureTable;
use crate::trades::TradeBook;

/// Load bars, compute the requested features and emit them. Tail output
/// goes to `out`.
pub fn run_features<W: Write>(config: &FeatureConfig, out: W) -> Result<FeatureTable> {
    let bars = BarTable::load_csv(&config.bars_csv, config.schema)?;
    let table = compute_features(&bars, &config.features)?;
    match &config.output {
        OutputMode::Tail { rows } => write_tail_newest_first(&table, *rows, out)?,
        OutputMode::Csv { path } => write_feature_csv(&table, path)?,
    }
    Ok(table)
}

/// Bars plus features for one asset. Without an expression the standard
/// feature set is used.
pub fn prepare_asset_frame(
    asset: &str,
    bars_path: &Path,
    schema: BarSchema,
    features: Option<&str>,
) -> Result<AssetFrame> {
    let bars = BarTable::load_csv(bars_path, schema)
        .with_context(|| format!("Failed to load bars for {asset}"))?;
    let table = match features {
        Some(expr) => compute_features(&bars, expr),
        None => standard_features(&bars),
    }
    .with_context(|| format!("Failed to compute features for {asset}"))?;
    AssetFrame::new(asset, bars, table)
}

#[derive(Debug, Clone)]
pub struct MergeSummary {
    pub report: AlignmentReport,
    pub written: usize,
}

/// Align prepared frames with the configured trades, filter, and write.
pub fn merge_frames(frames: &[AssetFrame], config: &MergeConfig) -> Result<MergeSummary> {
    let started = Instant::now();
    let book = TradeBook::open(config.trade_source())?;
    let outcome = TradeAligner::new(config.unmatched).align(frames, &book)?;
    let trades = if config.filters.is_empty() {
        outcome.trades
    } else {
        filter_trades(&outcome.trades, &config.filters)?
    };
    write_aligned_csv(&trades, &config.output_csv)?;
    info!(
        written = trades.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        path = %config.output_csv.display(),
        "Merged trades with bar features"
    );
    Ok(MergeSummary {
        report: outcome.report,
        written: trades.len(),
    })
}

/// Prepare every asset on a pool of `workers` threads (0 lets rayon pick),
/// then merge. Frames keep the configured asset order.
pub fn run_merge(config: &MergeConfig, workers: usize) -> Result<MergeSummary> {
    config.validate()?;
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("Failed to build worker pool")?;
    let frames = pool.install(|| {
        config
            .assets
            .par_iter()
            .map(|asset| {
                prepare_asset_frame(
                    asset,
                    &config.bars_path(asset),
                    config.schema,
                    config.features.as_deref(),
                )
            })
            .collect::<Result<Vec<_>>>()
    })?;
    merge_frames(&frames, config)
}
