use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};

use barfeat_rs::align::{FeatureRange, UnmatchedPolicy};
use barfeat_rs::config::{FeatureConfig, MergeConfig, OutputMode};
use barfeat_rs::data::BarSchema;

#[derive(Parser, Debug)]
#[command(
    name = "barfeat",
    about = "Rolling bar features and trade/feature alignment"
)]
pub struct Cli {
    /// Also append logs to this file
    #[arg(long = "log-file", global = true, value_hint = clap::ValueHint::FilePath)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compute indicator columns over a bar file
    #[command(name = "features")]
    Features(FeaturesArgs),
    /// Join trades with the bar features known at entry
    #[command(name = "merge-trades")]
    MergeTrades(MergeArgs),
    /// List the supported indicators and their arguments
    #[command(name = "indicators")]
    Indicators,
}

#[derive(Parser, Debug)]
pub struct FeaturesArgs {
    /// Bar CSV with a timestamp column
    #[arg(
        long = "bars",
        value_name = "FILE",
        value_hint = clap::ValueHint::FilePath,
        required_unless_present = "config"
    )]
    pub bars: Option<PathBuf>,

    /// Bar layout (multi = open/high/low/close/volume, single = value)
    #[arg(long, default_value = "multi")]
    pub schema: SchemaValue,

    /// Feature request, e.g. "SMA(20,close);ATR(3,close,high,low)"
    #[arg(long = "expr", required_unless_present = "config")]
    pub expr: Option<String>,

    /// Print the last N rows, newest first, without a header
    #[arg(long = "last", value_name = "N", conflicts_with = "output")]
    pub last: Option<usize>,

    /// Write every row with a header to this CSV
    #[arg(long = "output", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    /// Read the whole run from a JSON config instead
    #[arg(
        long = "config",
        value_hint = clap::ValueHint::FilePath,
        conflicts_with_all = ["bars", "expr", "last", "output"]
    )]
    pub config: Option<PathBuf>,
}

impl FeaturesArgs {
    pub fn into_config(self) -> Result<FeatureConfig> {
        if let Some(path) = &self.config {
            return FeatureConfig::from_json_file(path);
        }
        let bars_csv = self.bars.context("--bars is required")?;
        let features = self.expr.context("--expr is required")?;
        let output = match (self.last, self.output) {
            (Some(rows), None) => OutputMode::Tail { rows },
            (None, Some(path)) => OutputMode::Csv { path },
            _ => return Err(anyhow!("Pass exactly one of --last or --output")),
        };
        Ok(FeatureConfig {
            bars_csv,
            schema: self.schema.to_schema(),
            features,
            output,
        })
    }
}

#[derive(Parser, Debug)]
pub struct MergeArgs {
    /// Comma-separated asset names
    #[arg(long, value_delimiter = ',', required_unless_present = "config")]
    pub assets: Vec<String>,

    /// Bar CSV path; {ASSET} is replaced with each asset name
    #[arg(long = "bars", value_name = "TEMPLATE", required_unless_present = "config")]
    pub bars: Option<String>,

    /// Combined trade log, or a per-asset path containing {ASSET}
    #[arg(long = "trades", value_name = "PATH", required_unless_present = "config")]
    pub trades: Option<String>,

    #[arg(long, default_value = "multi")]
    pub schema: SchemaValue,

    /// Feature request to join; the standard feature set when omitted
    #[arg(long = "expr")]
    pub expr: Option<String>,

    /// What to do with trades whose entry matches no bar
    #[arg(long, default_value = "keep")]
    pub unmatched: UnmatchedValue,

    /// Keep trades inside any of these inclusive ranges
    #[arg(long = "filter", value_name = "FEATURE:LOW:HIGH")]
    pub filters: Vec<FeatureRange>,

    /// Aligned trade CSV to write
    #[arg(long = "output", value_name = "FILE", required_unless_present = "config")]
    pub output: Option<PathBuf>,

    /// Worker threads for per-asset preparation (omit to use all cores)
    #[arg(long = "workers")]
    pub workers: Option<usize>,

    /// Read the whole run from a JSON config instead
    #[arg(long = "config", value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,
}

impl MergeArgs {
    pub fn into_config(self) -> Result<MergeConfig> {
        let config = match &self.config {
            Some(path) => MergeConfig::from_json_file(path)?,
            None => MergeConfig {
                assets: self.assets,
                bars_csv: self.bars.context("--bars is required")?,
                trades: self.trades.context("--trades is required")?,
                schema: self.schema.to_schema(),
                features: self.expr,
                unmatched: self.unmatched.to_policy(),
                filters: self.filters,
                output_csv: self.output.context("--output is required")?,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum SchemaValue {
    Single,
    Multi,
}

impl SchemaValue {
    fn to_schema(self) -> BarSchema {
        match self {
            SchemaValue::Single => BarSchema::Single,
            SchemaValue::Multi => BarSchema::Multi,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum UnmatchedValue {
    Keep,
    Drop,
}

impl UnmatchedValue {
    fn to_policy(self) -> UnmatchedPolicy {
        match self {
            UnmatchedValue::Keep => UnmatchedPolicy::Keep,
            UnmatchedValue::Drop => UnmatchedPolicy::Drop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_args_need_one_output() {
        let cli = Cli::try_parse_from([
            "barfeat", "features", "--bars", "bars.csv", "--expr", "SMA(3,close)",
        ])
        .unwrap();
        let Commands::Features(args) = cli.command else {
            panic!("expected features");
        };
        assert!(args.into_config().is_err());

        assert!(
            Cli::try_parse_from([
                "barfeat", "features", "--bars", "b.csv", "--expr", "SMA(3,close)", "--last",
                "5", "--output", "o.csv",
            ])
            .is_err()
        );
    }

    #[test]
    fn merge_args_map_into_config() {
        let cli = Cli::try_parse_from([
            "barfeat",
            "merge-trades",
            "--assets",
            "EUR/USD,GBP/USD",
            "--bars",
            "bars/{ASSET}.csv",
            "--trades",
            "trades.csv",
            "--unmatched",
            "drop",
            "--filter",
            "volatility_log:-1:0.5",
            "--output",
            "merged.csv",
        ])
        .unwrap();
        let Commands::MergeTrades(args) = cli.command else {
            panic!("expected merge-trades");
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.assets, vec!["EUR/USD", "GBP/USD"]);
        assert_eq!(config.unmatched, UnmatchedPolicy::Drop);
        assert_eq!(config.filters[0].low, -1.0);
        assert!(config.features.is_none());
    }
}
