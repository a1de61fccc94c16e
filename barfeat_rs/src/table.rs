use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use polars::prelude::*;

use crate::data::format_timestamp;
use crate::error::{FeatureError, FeatureResult};

#[derive(Clone, Debug, PartialEq)]
pub struct FeatureColumn {
    pub name: String,
    pub values: Vec<f64>,
}

/// Computed feature columns sharing one time index. Column order is request
/// order and duplicate names are allowed; each request clause owns its own
/// column.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureTable {
    timestamps: Vec<DateTime<Utc>>,
    columns: Vec<FeatureColumn>,
}

impl FeatureTable {
    pub fn new(timestamps: Vec<DateTime<Utc>>) -> Self {
        Self {
            timestamps,
            columns: Vec::new(),
        }
    }

    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> FeatureResult<()> {
        let name = name.into();
        if values.len() != self.timestamps.len() {
            return Err(FeatureError::invalid(
                name,
                format!(
                    "produced {} values for {} bars",
                    values.len(),
                    self.timestamps.len()
                ),
            ));
        }
        self.columns.push(FeatureColumn { name, values });
        Ok(())
    }

    /// Number of rows (bars).
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Number of feature columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn columns(&self) -> &[FeatureColumn] {
        &self.columns
    }

    /// First column with this name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| column.values.as_slice())
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    /// The last `rows` bars, newest first.
    pub fn tail_newest_first(&self, rows: usize) -> FeatureTable {
        let take = rows.min(self.len());
        let picks: Vec<usize> = (0..self.len()).rev().take(take).collect();
        FeatureTable {
            timestamps: picks.iter().map(|&idx| self.timestamps[idx]).collect(),
            columns: self
                .columns
                .iter()
                .map(|column| FeatureColumn {
                    name: column.name.clone(),
                    values: picks.iter().map(|&idx| column.values[idx]).collect(),
                })
                .collect(),
        }
    }

    /// `timestamp` plus one nullable float column per feature. Repeated
    /// feature names get a `_2`, `_3`, ... suffix since frame columns must
    /// be unique.
    pub fn to_data_frame(&self) -> Result<DataFrame> {
        let mut series = Vec::with_capacity(self.columns.len() + 1);
        series.push(Series::new(
            "timestamp",
            self.timestamps
                .iter()
                .map(format_timestamp)
                .collect::<Vec<_>>(),
        ));
        let names = unique_column_names(self.columns.iter().map(|c| c.name.as_str()));
        for (name, column) in names.iter().zip(self.columns.iter()) {
            series.push(Series::new(name, nullable(&column.values)));
        }
        DataFrame::new(series).context("Failed to assemble feature table frame")
    }
}

pub(crate) fn nullable(values: &[f64]) -> Vec<Option<f64>> {
    values
        .iter()
        .map(|v| if v.is_nan() { None } else { Some(*v) })
        .collect()
}

pub(crate) fn unique_column_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let seen = out
            .iter()
            .filter(|existing| existing.as_str() == name || is_suffixed(existing, name))
            .count();
        if seen == 0 {
            out.push(name.to_string());
        } else {
            out.push(format!("{name}_{}", seen + 1));
        }
    }
    out
}

fn is_suffixed(candidate: &str, base: &str) -> bool {
    candidate
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|n| n.parse::<usize>().is_ok_and(|n| n >= 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::parse_timestamp;

    fn table() -> FeatureTable {
        let timestamps = (1..=4)
            .map(|day| parse_timestamp(&format!("2024-01-0{day}")).unwrap())
            .collect();
        let mut table = FeatureTable::new(timestamps);
        table
            .push_column("SMA_2_close", vec![f64::NAN, 1.5, 2.5, 3.5])
            .unwrap();
        table
            .push_column("SMA_2_close", vec![f64::NAN, 1.5, 2.5, 3.5])
            .unwrap();
        table
    }

    #[test]
    fn push_column_rejects_misaligned_series() {
        let mut table = table();
        let err = table.push_column("short", vec![1.0]).unwrap_err();
        assert!(matches!(err, FeatureError::InvalidArgument { .. }));
        assert_eq!(table.width(), 2);
    }

    #[test]
    fn tail_newest_first_reverses_and_clips() {
        let tail = table().tail_newest_first(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(
            tail.timestamps()[0],
            parse_timestamp("2024-01-04").unwrap()
        );
        assert_eq!(tail.columns()[0].values, vec![3.5, 2.5]);

        assert_eq!(table().tail_newest_first(10).len(), 4);
    }

    #[test]
    fn data_frame_disambiguates_repeated_names() -> Result<()> {
        let df = table().to_data_frame()?;
        assert_eq!(
            df.get_column_names(),
            vec!["timestamp", "SMA_2_close", "SMA_2_close_2"]
        );
        assert_eq!(df.column("SMA_2_close")?.null_count(), 1);
        Ok(())
    }
}
