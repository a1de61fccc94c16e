use anyhow::Result;
use barfeat_rs::align::{
    AlignedTradeSet, AssetFrame, FeatureRange, TradeAligner, UnmatchedPolicy, filter_trades,
};
use barfeat_rs::data::{BarSchema, BarTable, parse_timestamp};
use barfeat_rs::output::write_aligned_csv;
use barfeat_rs::table::FeatureTable;
use barfeat_rs::trades::{Trade, TradeBook, TradeDirection};
use barfeat_rs::{FeatureError, compute_features};
use chrono::{DateTime, Duration, Utc};
use tempfile::tempdir;

// 2024-01-01 is a Monday.
fn t(hour: i64) -> DateTime<Utc> {
    parse_timestamp("2024-01-01T00:00:00Z").unwrap() + Duration::hours(hour)
}

fn hourly_bars(closes: &[f64]) -> Result<BarTable> {
    let len = closes.len();
    let timestamps = (0..len as i64).map(t).collect();
    BarTable::new(
        BarSchema::Multi,
        timestamps,
        vec![
            ("open".to_string(), closes.iter().map(|c| c - 0.5).collect()),
            ("high".to_string(), closes.iter().map(|c| c + 1.0).collect()),
            ("low".to_string(), closes.iter().map(|c| c - 1.0).collect()),
            ("close".to_string(), closes.to_vec()),
            ("volume".to_string(), vec![10.0; len]),
        ],
    )
}

fn trade(asset: &str, entry: DateTime<Utc>, direction: TradeDirection, profit: f64) -> Trade {
    Trade {
        asset: asset.to_string(),
        entry_time: entry,
        exit_time: entry + Duration::hours(2),
        direction,
        profit,
        extra: Vec::new(),
    }
}

/// Directional columns with easy-to-read values: bar i has
/// bb_dist_upper = i + 1, bb_dist_lower = -(i + 1) and log_return = 0.1 * (i + 1).
fn directional_frame(asset: &str, bars: BarTable) -> Result<AssetFrame> {
    let n = bars.len();
    let mut features = FeatureTable::new(bars.timestamps().to_vec());
    features.push_column("bb_dist_upper", (0..n).map(|i| i as f64 + 1.0).collect())?;
    features.push_column("bb_dist_lower", (0..n).map(|i| -(i as f64) - 1.0).collect())?;
    features.push_column("log_return", (0..n).map(|i| 0.1 * (i as f64 + 1.0)).collect())?;
    AssetFrame::new(asset, bars, features)
}

#[test]
fn trade_sees_only_the_bar_closed_before_entry() -> Result<()> {
    let bars = hourly_bars(&[10.0, 20.0, 30.0])?;
    let features = compute_features(&bars, "SMA(1,close)")?;
    let frame = AssetFrame::new("ES", bars, features)?;
    let trades = [trade("ES", t(1), TradeDirection::Long, 1.0)];

    let (aligned, report) = TradeAligner::default().align_asset(&frame, &trades);

    assert_eq!(report.matched, 1);
    let joined = &aligned[0];
    assert_eq!(joined.bar_time, Some(t(0)));
    assert_eq!(joined.next_bar_open, Some(t(1)));
    assert_eq!(joined.value("SMA_1_close"), Some(10.0));
    assert_eq!(joined.value("close"), Some(10.0));
    assert_eq!(joined.value("next_open"), Some(19.5));
    Ok(())
}

#[test]
fn entry_after_the_last_bar_cannot_match() -> Result<()> {
    let bars = hourly_bars(&[10.0, 20.0, 30.0])?;
    let features = compute_features(&bars, "SMA(1,close)")?;
    let frame = AssetFrame::new("ES", bars, features)?;
    let trades = [trade("ES", t(3), TradeDirection::Long, 1.0)];

    let (aligned, report) = TradeAligner::default().align_asset(&frame, &trades);
    assert_eq!(report.unmatched(), 1);
    assert!(!aligned[0].is_matched());
    assert_eq!(aligned[0].value("SMA_1_close"), None);
    Ok(())
}

#[test]
fn unmatched_trades_are_reported_and_sorted_last() -> Result<()> {
    let frame = directional_frame("ES", hourly_bars(&[1.0, 2.0, 3.0, 4.0, 5.0])?)?;
    let off_grid = t(1) + Duration::minutes(30);
    let trades = [
        trade("ES", off_grid, TradeDirection::Long, 1.0),
        trade("ES", t(3), TradeDirection::Long, 1.0),
        trade("ES", t(2), TradeDirection::Short, -1.0),
    ];

    let (aligned, report) = TradeAligner::new(UnmatchedPolicy::Keep).align_asset(&frame, &trades);
    assert_eq!(report.trades, 3);
    assert_eq!(report.matched, 2);
    assert_eq!(report.unmatched_entry_times, vec![off_grid]);

    let order: Vec<_> = aligned.iter().map(|a| a.trade.entry_time).collect();
    assert_eq!(order, vec![t(2), t(3), off_grid]);
    assert_eq!(aligned[2].value("bb_dist_upper"), None);

    let (dropped, report) = TradeAligner::new(UnmatchedPolicy::Drop).align_asset(&frame, &trades);
    assert_eq!(dropped.len(), 2);
    assert_eq!(report.unmatched(), 1);
    Ok(())
}

#[test]
fn directional_fields_read_in_the_trades_favour() -> Result<()> {
    let frame = directional_frame("ES", hourly_bars(&[1.0, 2.0, 3.0, 4.0])?)?;
    let trades = [
        trade("ES", t(1), TradeDirection::Long, 3.0),
        trade("ES", t(2), TradeDirection::Short, -2.0),
    ];
    let (aligned, _) = TradeAligner::default().align_asset(&frame, &trades);

    let long = &aligned[0];
    assert_eq!(long.value("bb_dist_upper"), Some(1.0));
    assert_eq!(long.value("bb_dist_lower"), Some(1.0));
    assert_eq!(long.value("log_return_direction"), Some(0.1));
    assert!(long.values.iter().all(|(name, _)| name != "log_return_direction_12"));

    let short = &aligned[1];
    assert_eq!(short.value("bb_dist_upper"), Some(-2.0));
    assert_eq!(short.value("bb_dist_lower"), Some(-2.0));
    assert_eq!(short.value("log_return_direction"), Some(-0.2));
    assert_eq!(short.value("log_return"), Some(0.2));
    Ok(())
}

#[test]
fn win_dow_and_hour_come_from_entry() -> Result<()> {
    let frame = directional_frame("ES", hourly_bars(&[1.0; 30])?)?;
    let trades = [
        trade("ES", t(5), TradeDirection::Long, 0.5),
        trade("ES", t(26), TradeDirection::Long, 0.0),
    ];
    let (aligned, _) = TradeAligner::default().align_asset(&frame, &trades);
    assert_eq!((aligned[0].win, aligned[0].dow, aligned[0].hour), (1, 0, 5));
    assert_eq!((aligned[1].win, aligned[1].dow, aligned[1].hour), (0, 1, 2));
    Ok(())
}

#[test]
fn assets_are_concatenated_by_entry_time() -> Result<()> {
    let es = directional_frame("ES", hourly_bars(&[1.0, 2.0, 3.0, 4.0, 5.0])?)?;
    let nq = directional_frame("NQ", hourly_bars(&[9.0, 8.0, 7.0, 6.0, 5.0])?)?;
    let book = TradeBook::from_trades(vec![
        trade("ES", t(4), TradeDirection::Long, 1.0),
        trade("NQ", t(1), TradeDirection::Short, 1.0),
        trade("ES", t(2), TradeDirection::Long, -1.0),
        trade("NQ", t(3), TradeDirection::Long, 1.0),
    ]);

    let outcome = TradeAligner::default().align(&[es, nq], &book)?;
    let order: Vec<_> = outcome
        .trades
        .trades()
        .iter()
        .map(|a| (a.trade.asset.as_str(), a.trade.entry_time))
        .collect();
    assert_eq!(
        order,
        vec![("NQ", t(1)), ("ES", t(2)), ("NQ", t(3)), ("ES", t(4))]
    );
    assert_eq!(outcome.report.total_trades(), 4);
    assert_eq!(outcome.report.total_unmatched(), 0);
    Ok(())
}

#[test]
fn filters_are_or_combined_without_duplicates() -> Result<()> {
    let frame = directional_frame("ES", hourly_bars(&[1.0, 2.0, 3.0, 4.0, 5.0])?)?;
    let trades: Vec<Trade> = (1..5)
        .map(|h| trade("ES", t(h), TradeDirection::Long, 1.0))
        .collect();
    let (aligned, _) = TradeAligner::default().align_asset(&frame, &trades);
    let set = AlignedTradeSet::new(aligned);

    // bb_dist_upper for entries t1..t4 is 1..4.
    let ranges = [
        FeatureRange::new("bb_dist_upper", 1.0, 2.0)?,
        FeatureRange::new("bb_dist_upper", 2.0, 2.0)?,
        "log_return:0.35:0.45".parse::<FeatureRange>()?,
    ];
    let kept = filter_trades(&set, &ranges)?;
    let entries: Vec<_> = kept.trades().iter().map(|a| a.trade.entry_time).collect();
    assert_eq!(entries, vec![t(1), t(2), t(4)]);

    let unknown = [FeatureRange::new("adf", 0.0, 1.0)?];
    assert!(matches!(
        filter_trades(&set, &unknown),
        Err(FeatureError::InvalidArgument { .. })
    ));
    Ok(())
}

#[test]
fn aligned_csv_has_trade_fields_then_values() -> Result<()> {
    let frame = directional_frame("ES", hourly_bars(&[1.0, 2.0, 3.0])?)?;
    let mut with_extra = trade("ES", t(1), TradeDirection::Short, -1.0);
    with_extra.extra = vec![("ID".to_string(), Some("7".to_string()))];
    let unmatched = trade("ES", t(9), TradeDirection::Long, 1.0);
    let (aligned, _) = TradeAligner::default().align_asset(&frame, &[with_extra, unmatched]);

    let temp_dir = tempdir()?;
    let path = temp_dir.path().join("merged.csv");
    write_aligned_csv(&AlignedTradeSet::new(aligned), &path)?;

    let text = std::fs::read_to_string(&path)?;
    let mut lines = text.lines();
    let header: Vec<&str> = lines.next().unwrap().split(',').collect();
    assert_eq!(
        &header[..8],
        &["Entry Time", "Exit Time", "Asset", "Type", "Profit", "ID", "bar_time", "next_bar_open"]
    );
    assert!(header.contains(&"log_return_direction"));
    assert_eq!(&header[header.len() - 3..], &["win", "dow", "hour"]);
    let first = lines.next().unwrap();
    assert!(first.starts_with("2024-01-01T01:00:00Z,2024-01-01T03:00:00Z,ES,Short,"));
    assert_eq!(lines.count(), 1);
    Ok(())
}
