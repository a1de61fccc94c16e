pub mod align;
pub mod config;
pub mod data;
pub mod dispatch;
pub mod error;
pub mod expr;
pub mod indicators;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod standard;
pub mod table;
pub mod trades;

pub use align::{
    AlignedTrade, AlignedTradeSet, AlignmentOutcome, AlignmentReport, AssetFrame, FeatureRange,
    TradeAligner, UnmatchedPolicy, filter_trades,
};
pub use config::{FeatureConfig, MergeConfig, OutputMode};
pub use data::{BarRecord, BarSchema, BarTable};
pub use dispatch::{compute_calls, compute_features};
pub use error::{FeatureError, FeatureResult};
pub use expr::{FeatureCall, parse_feature_expr};
pub use registry::{find_indicator, indicator_names};
pub use table::{FeatureColumn, FeatureTable};
pub use trades::{Trade, TradeBook, TradeDirection, TradeSource};
