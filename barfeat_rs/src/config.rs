use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::align::{FeatureRange, UnmatchedPolicy};
use crate::data::BarSchema;
use crate::trades::{ASSET_PLACEHOLDER, TradeSource, asset_path};

/// Where a computed feature table goes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum OutputMode {
    /// Last `rows` bars, newest first, headerless, to stdout.
    Tail { rows: usize },
    /// Every bar, with a header, to a CSV file.
    Csv { path: PathBuf },
}

fn default_schema() -> BarSchema {
    BarSchema::Multi
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureConfig {
    pub bars_csv: PathBuf,
    #[serde(default = "default_schema")]
    pub schema: BarSchema,
    /// `;`-separated indicator calls, e.g. `SMA(20,close);ATR(14,close,high,low)`.
    pub features: String,
    pub output: OutputMode,
}

impl FeatureConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeConfig {
    pub assets: Vec<String>,
    /// Bar CSV path; `{ASSET}` is replaced with each asset name.
    pub bars_csv: String,
    /// Combined trade log, or a per-asset template containing `{ASSET}`.
    pub trades: String,
    #[serde(default = "default_schema")]
    pub schema: BarSchema,
    /// Indicator calls to join; the standard feature set when absent.
    #[serde(default)]
    pub features: Option<String>,
    #[serde(default)]
    pub unmatched: UnmatchedPolicy,
    #[serde(default)]
    pub filters: Vec<FeatureRange>,
    pub output_csv: PathBuf,
}

impl MergeConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.assets.is_empty() {
            return Err(anyhow!("At least one asset is required"));
        }
        if self.assets.len() > 1 && !self.bars_csv.contains(ASSET_PLACEHOLDER) {
            return Err(anyhow!(
                "Bar path '{}' needs an {ASSET_PLACEHOLDER} placeholder for {} assets",
                self.bars_csv,
                self.assets.len()
            ));
        }
        for range in &self.filters {
            FeatureRange::new(range.feature.clone(), range.low, range.high)?;
        }
        Ok(())
    }

    pub fn bars_path(&self, asset: &str) -> PathBuf {
        asset_path(&self.bars_csv, asset)
    }

    pub fn trade_source(&self) -> TradeSource {
        TradeSource::from_path(&self.trades)
    }
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Unable to read config {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse config {}", path.display()))
}
