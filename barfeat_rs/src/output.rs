use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use polars::prelude::*;
use tracing::info;

use crate::align::AlignedTradeSet;
use crate::table::FeatureTable;

/// Headerless `timestamp,feature...` rows for the last `rows` bars, newest
/// first. Undefined values are written as empty fields.
pub fn write_tail_newest_first<W: Write>(
    table: &FeatureTable,
    rows: usize,
    writer: W,
) -> Result<()> {
    let mut df = table.tail_newest_first(rows).to_data_frame()?;
    CsvWriter::new(writer)
        .include_header(false)
        .finish(&mut df)
        .context("Failed to write feature rows")
}

pub fn write_frame_csv(df: &mut DataFrame, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Unable to create {}", parent.display()))?;
    }
    let mut file =
        File::create(path).with_context(|| format!("Unable to create {}", path.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(df)
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    info!(
        rows = df.height(),
        columns = df.width(),
        path = %path.display(),
        "Wrote CSV output"
    );
    Ok(())
}

/// Full feature table keyed by the input bar timestamps.
pub fn write_feature_csv(table: &FeatureTable, path: &Path) -> Result<()> {
    let mut df = table.to_data_frame()?;
    write_frame_csv(&mut df, path)
}

/// Aligned trades ordered by entry time.
pub fn write_aligned_csv(trades: &AlignedTradeSet, path: &Path) -> Result<()> {
    let mut df = trades.to_data_frame()?;
    write_frame_csv(&mut df, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::parse_timestamp;
    use tempfile::tempdir;

    fn sample() -> FeatureTable {
        let timestamps = ["2024-01-01T00:00:00Z", "2024-01-01T01:00:00Z", "2024-01-01T02:00:00Z"]
            .iter()
            .map(|raw| parse_timestamp(raw).unwrap())
            .collect();
        let mut table = FeatureTable::new(timestamps);
        table
            .push_column("SMA_2_close", vec![f64::NAN, 1.5, 2.5])
            .unwrap();
        table
    }

    #[test]
    fn tail_rows_are_newest_first_without_header() -> Result<()> {
        let mut buffer = Vec::new();
        write_tail_newest_first(&sample(), 2, &mut buffer)?;
        let text = String::from_utf8(buffer)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec!["2024-01-01T02:00:00Z,2.5", "2024-01-01T01:00:00Z,1.5"]
        );
        Ok(())
    }

    #[test]
    fn full_table_keeps_warmup_rows_empty() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("nested").join("features.csv");
        write_feature_csv(&sample(), &path)?;
        let text = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,SMA_2_close");
        assert_eq!(lines[1], "2024-01-01T00:00:00Z,");
        assert_eq!(lines.len(), 4);
        Ok(())
    }
}
