use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Candidate names for the bar timestamp column, in lookup order.
const TIMESTAMP_COLUMNS: &[&str] = &["timestamp", "datetime", "date", "time"];

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Record layout of a bar source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BarSchema {
    /// One running price per bar (`value`), no bid/ask or OHLC split.
    Single,
    /// Full `open, high, low, close, volume` bars.
    Multi,
}

impl BarSchema {
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            BarSchema::Single => &["value"],
            BarSchema::Multi => &["open", "high", "low", "close", "volume"],
        }
    }

    /// Column holding the bar's opening price.
    pub fn open_column(self) -> &'static str {
        match self {
            BarSchema::Single => "value",
            BarSchema::Multi => "open",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BarRecord {
    Single {
        timestamp: DateTime<Utc>,
        value: f64,
    },
    Multi {
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    },
}

impl BarRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            BarRecord::Single { timestamp, .. } | BarRecord::Multi { timestamp, .. } => *timestamp,
        }
    }

    pub fn schema(&self) -> BarSchema {
        match self {
            BarRecord::Single { .. } => BarSchema::Single,
            BarRecord::Multi { .. } => BarSchema::Multi,
        }
    }
}

/// Bars sorted ascending by timestamp, one bar per timestamp, stored
/// column-wise. Extra numeric columns found in a source file are kept next
/// to the schema columns.
#[derive(Clone, Debug)]
pub struct BarTable {
    schema: BarSchema,
    timestamps: Vec<DateTime<Utc>>,
    columns: Vec<(String, Vec<f64>)>,
}

impl BarTable {
    /// Validate the schema columns, then sort every column by timestamp.
    /// Duplicate timestamps are rejected.
    pub fn new(
        schema: BarSchema,
        timestamps: Vec<DateTime<Utc>>,
        columns: Vec<(String, Vec<f64>)>,
    ) -> Result<Self> {
        for required in schema.required_columns() {
            if !columns.iter().any(|(name, _)| name == required) {
                return Err(anyhow!(
                    "{schema:?} bars require a '{required}' column (found: {})",
                    columns
                        .iter()
                        .map(|(name, _)| name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
        }
        for (idx, (name, values)) in columns.iter().enumerate() {
            if values.len() != timestamps.len() {
                return Err(anyhow!(
                    "Bar column '{name}' has {} rows, expected {}",
                    values.len(),
                    timestamps.len()
                ));
            }
            if columns[..idx].iter().any(|(other, _)| other == name) {
                return Err(anyhow!("Bar column '{name}' appears more than once"));
            }
        }

        let mut order: Vec<usize> = (0..timestamps.len()).collect();
        order.sort_by_key(|&idx| timestamps[idx]);
        if let Some(pair) = order
            .windows(2)
            .find(|pair| timestamps[pair[0]] == timestamps[pair[1]])
        {
            return Err(anyhow!(
                "Duplicate bar timestamp {}",
                format_timestamp(&timestamps[pair[0]])
            ));
        }

        let already_sorted = order.iter().enumerate().all(|(pos, &idx)| pos == idx);
        if !already_sorted {
            debug!(rows = order.len(), "Sorted bars ascending by timestamp");
        }

        let timestamps: Vec<DateTime<Utc>> = order.iter().map(|&idx| timestamps[idx]).collect();
        let columns: Vec<(String, Vec<f64>)> = columns
            .into_iter()
            .map(|(name, values)| {
                let sorted = order.iter().map(|&idx| values[idx]).collect();
                (name, sorted)
            })
            .collect();

        Ok(Self {
            schema,
            timestamps,
            columns,
        })
    }

    pub fn from_records(schema: BarSchema, records: &[BarRecord]) -> Result<Self> {
        if let Some(bad) = records.iter().find(|record| record.schema() != schema) {
            return Err(anyhow!(
                "Bar at {} is a {:?} record but the table schema is {schema:?}",
                format_timestamp(&bad.timestamp()),
                bad.schema()
            ));
        }

        let timestamps = records.iter().map(BarRecord::timestamp).collect();
        let columns = match schema {
            BarSchema::Single => {
                let values = records
                    .iter()
                    .map(|record| match record {
                        BarRecord::Single { value, .. } => *value,
                        BarRecord::Multi { .. } => f64::NAN,
                    })
                    .collect();
                vec![("value".to_string(), values)]
            }
            BarSchema::Multi => {
                let mut open = Vec::with_capacity(records.len());
                let mut high = Vec::with_capacity(records.len());
                let mut low = Vec::with_capacity(records.len());
                let mut close = Vec::with_capacity(records.len());
                let mut volume = Vec::with_capacity(records.len());
                for record in records {
                    if let BarRecord::Multi {
                        open: o,
                        high: h,
                        low: l,
                        close: c,
                        volume: v,
                        ..
                    } = record
                    {
                        open.push(*o);
                        high.push(*h);
                        low.push(*l);
                        close.push(*c);
                        volume.push(*v);
                    }
                }
                vec![
                    ("open".to_string(), open),
                    ("high".to_string(), high),
                    ("low".to_string(), low),
                    ("close".to_string(), close),
                    ("volume".to_string(), volume),
                ]
            }
        };
        Self::new(schema, timestamps, columns)
    }

    pub fn load_csv(path: &Path, schema: BarSchema) -> Result<Self> {
        let df = CsvReader::from_path(path)
            .with_context(|| format!("Failed to open bar file {}", path.display()))?
            .infer_schema(Some(1024))
            .has_header(true)
            .finish()
            .with_context(|| format!("Unable to read {} into a DataFrame", path.display()))?;
        let table = Self::from_data_frame(&df, schema)
            .with_context(|| format!("Invalid bar data in {}", path.display()))?;
        info!(
            rows = table.len(),
            schema = ?schema,
            path = %path.display(),
            "Loaded bar table"
        );
        Ok(table)
    }

    pub fn from_data_frame(df: &DataFrame, schema: BarSchema) -> Result<Self> {
        let ts_series = TIMESTAMP_COLUMNS
            .iter()
            .find_map(|name| df.column(name).ok())
            .with_context(|| {
                format!(
                    "Missing bar timestamp column (expected one of: {})",
                    TIMESTAMP_COLUMNS.join(", ")
                )
            })?;
        let timestamps = timestamps_from_series(ts_series)?;

        let mut columns = Vec::new();
        for series in df.get_columns() {
            if series.name() == ts_series.name() {
                continue;
            }
            if is_numeric(series.dtype()) {
                columns.push((series.name().to_string(), series_to_f64(series)?));
            } else if schema.required_columns().contains(&series.name()) {
                // Header-only files infer every column as text.
                let cast = series
                    .strict_cast(&DataType::Float64)
                    .with_context(|| format!("Bar column '{}' is not numeric", series.name()))?;
                columns.push((series.name().to_string(), series_to_f64(&cast)?));
            } else {
                debug!(
                    column = series.name(),
                    dtype = ?series.dtype(),
                    "Skipping non-numeric bar column"
                );
            }
        }
        Self::new(schema, timestamps, columns)
    }

    pub fn schema(&self) -> BarSchema {
        self.schema
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.columns
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Open time of the following bar; the last bar has none. A trade opened
    /// at `next_bar_open[i]` can only have seen bars up to and including `i`.
    pub fn next_bar_open(&self) -> Vec<Option<DateTime<Utc>>> {
        (0..self.timestamps.len())
            .map(|idx| self.timestamps.get(idx + 1).copied())
            .collect()
    }

    /// Opening price of the following bar, the price a trade placed on this
    /// bar's close would be filled at.
    pub fn next_open(&self) -> Vec<f64> {
        let len = self.len();
        match self.column(self.schema.open_column()) {
            Some(open) => (0..len)
                .map(|idx| open.get(idx + 1).copied().unwrap_or(f64::NAN))
                .collect(),
            None => vec![f64::NAN; len],
        }
    }
}

fn is_numeric(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Float64
            | DataType::Float32
            | DataType::Int64
            | DataType::Int32
            | DataType::UInt64
            | DataType::UInt32
    )
}

pub(crate) fn series_to_f64(series: &Series) -> Result<Vec<f64>> {
    match series.dtype() {
        DataType::Float64 => Ok(series
            .f64()
            .context("Failed to interpret as f64")?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect()),
        DataType::Float32 => Ok(series
            .f32()
            .context("Failed to interpret as f32")?
            .into_iter()
            .map(|v| v.map(|x| x as f64).unwrap_or(f64::NAN))
            .collect()),
        DataType::Int64 => Ok(series
            .i64()
            .context("Failed to interpret as i64")?
            .into_iter()
            .map(|v| v.map(|x| x as f64).unwrap_or(f64::NAN))
            .collect()),
        DataType::Int32 => Ok(series
            .i32()
            .context("Failed to interpret as i32")?
            .into_iter()
            .map(|v| v.map(|x| x as f64).unwrap_or(f64::NAN))
            .collect()),
        DataType::UInt64 => Ok(series
            .u64()
            .context("Failed to interpret as u64")?
            .into_iter()
            .map(|v| v.map(|x| x as f64).unwrap_or(f64::NAN))
            .collect()),
        DataType::UInt32 => Ok(series
            .u32()
            .context("Failed to interpret as u32")?
            .into_iter()
            .map(|v| v.map(|x| x as f64).unwrap_or(f64::NAN))
            .collect()),
        other => Err(anyhow!(
            "Unsupported numeric dtype for {}: {other:?}",
            series.name()
        )),
    }
}

pub(crate) fn timestamps_from_series(series: &Series) -> Result<Vec<DateTime<Utc>>> {
    let mut out = Vec::with_capacity(series.len());
    for value in series.iter() {
        let parsed = match value {
            AnyValue::String(s) => parse_timestamp(s)?,
            AnyValue::StringOwned(ref s) => parse_timestamp(s.as_str())?,
            AnyValue::Datetime(ts, unit, _) => datetime_from_epoch(ts, unit).with_context(|| {
                format!("Timestamp {ts} in '{}' is out of range", series.name())
            })?,
            AnyValue::Null => {
                return Err(anyhow!("Timestamp column '{}' contains nulls", series.name()));
            }
            other => {
                return Err(anyhow!(
                    "Timestamp column '{}' must hold strings or datetimes (got {:?})",
                    series.name(),
                    other.dtype()
                ));
            }
        };
        out.push(parsed);
    }
    Ok(out)
}

fn datetime_from_epoch(ts: i64, unit: TimeUnit) -> Option<DateTime<Utc>> {
    let (secs, nsecs) = match unit {
        TimeUnit::Nanoseconds => (
            ts.div_euclid(1_000_000_000),
            ts.rem_euclid(1_000_000_000) as u32,
        ),
        TimeUnit::Microseconds => (
            ts.div_euclid(1_000_000),
            ts.rem_euclid(1_000_000) as u32 * 1_000,
        ),
        TimeUnit::Milliseconds => (ts.div_euclid(1_000), ts.rem_euclid(1_000) as u32 * 1_000_000),
    };
    DateTime::<Utc>::from_timestamp(secs, nsecs)
}

/// Accepts RFC 3339 (`2024-01-01T00:00:00Z`), naive `YYYY-MM-DD HH:MM[:SS]`
/// (read as UTC) and bare dates.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }
    Err(anyhow!(
        "Failed to parse timestamp '{raw}' (expected RFC 3339 or YYYY-MM-DD HH:MM[:SS])"
    ))
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    #[test]
    fn load_csv_sorts_unordered_bars() -> Result<()> {
        let temp_dir = tempdir()?;
        let csv_path = temp_dir.path().join("bars.csv");
        std::fs::write(
            &csv_path,
            "timestamp,open,high,low,close,volume,spread\n\
             2024-01-01T02:00:00Z,3,3.5,2.5,3.2,30,0.1\n\
             2024-01-01T00:00:00Z,1,1.5,0.5,1.2,10,0.1\n\
             2024-01-01T01:00:00Z,2,2.5,1.5,2.2,20,0.2\n",
        )?;

        let bars = BarTable::load_csv(&csv_path, BarSchema::Multi)?;
        assert_eq!(bars.len(), 3);
        assert_eq!(
            bars.timestamps(),
            &[
                ts("2024-01-01T00:00:00Z"),
                ts("2024-01-01T01:00:00Z"),
                ts("2024-01-01T02:00:00Z"),
            ]
        );
        assert_eq!(bars.column("open").unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(bars.column("volume").unwrap(), &[10.0, 20.0, 30.0]);
        assert_eq!(bars.column("spread").unwrap(), &[0.1, 0.2, 0.1]);
        Ok(())
    }

    #[test]
    fn multi_schema_requires_ohlcv_columns() -> Result<()> {
        let temp_dir = tempdir()?;
        let csv_path = temp_dir.path().join("value_only.csv");
        std::fs::write(&csv_path, "timestamp,value\n2024-01-01 00:00,1.0\n")?;

        let err = BarTable::load_csv(&csv_path, BarSchema::Multi).unwrap_err();
        assert!(format!("{err:#}").contains("require a 'open' column"));

        let single = BarTable::load_csv(&csv_path, BarSchema::Single)?;
        assert_eq!(single.column("value").unwrap(), &[1.0]);
        Ok(())
    }

    #[test]
    fn header_only_csv_is_an_empty_table() -> Result<()> {
        let temp_dir = tempdir()?;
        let csv_path = temp_dir.path().join("empty.csv");
        std::fs::write(&csv_path, "timestamp,open,high,low,close,volume\n")?;

        let bars = BarTable::load_csv(&csv_path, BarSchema::Multi)?;
        assert!(bars.is_empty());
        assert_eq!(bars.column("close").unwrap(), &[] as &[f64]);
        Ok(())
    }

    #[test]
    fn text_in_a_price_column_is_rejected() -> Result<()> {
        let temp_dir = tempdir()?;
        let csv_path = temp_dir.path().join("text.csv");
        std::fs::write(&csv_path, "timestamp,value\n2024-01-01 00:00,abc\n")?;

        let err = BarTable::load_csv(&csv_path, BarSchema::Single).unwrap_err();
        assert!(format!("{err:#}").contains("not numeric"));
        Ok(())
    }

    #[test]
    fn duplicate_timestamps_are_rejected() {
        let t = ts("2024-01-01T00:00:00Z");
        let records = [
            BarRecord::Single {
                timestamp: t,
                value: 1.0,
            },
            BarRecord::Single {
                timestamp: t,
                value: 2.0,
            },
        ];
        let err = BarTable::from_records(BarSchema::Single, &records).unwrap_err();
        assert!(err.to_string().contains("Duplicate bar timestamp"));
    }

    #[test]
    fn records_must_match_table_schema() {
        let records = [BarRecord::Single {
            timestamp: ts("2024-01-01T00:00:00Z"),
            value: 1.0,
        }];
        assert!(BarTable::from_records(BarSchema::Multi, &records).is_err());
    }

    #[test]
    fn next_bar_open_and_next_open_look_one_bar_ahead() -> Result<()> {
        let records: Vec<BarRecord> = (0..3)
            .map(|hour| BarRecord::Single {
                timestamp: ts(&format!("2024-01-0{}T00:00:00Z", hour + 1)),
                value: 10.0 + hour as f64,
            })
            .collect();
        let bars = BarTable::from_records(BarSchema::Single, &records)?;
        assert_eq!(
            bars.next_bar_open(),
            vec![
                Some(ts("2024-01-02T00:00:00Z")),
                Some(ts("2024-01-03T00:00:00Z")),
                None,
            ]
        );
        let next_open = bars.next_open();
        assert_eq!(&next_open[..2], &[11.0, 12.0]);
        assert!(next_open[2].is_nan());
        Ok(())
    }

    #[test]
    fn parse_timestamp_accepts_common_layouts() {
        let expected = ts("2024-03-05T14:30:00Z");
        assert_eq!(ts("2024-03-05 14:30:00"), expected);
        assert_eq!(ts("2024-03-05 14:30"), expected);
        assert_eq!(ts("2024-03-05T14:30:00+00:00"), expected);
        assert_eq!(ts("2024-03-05"), ts("2024-03-05T00:00:00Z"));
        assert!(parse_timestamp("05/03/2024").is_err());
        assert_eq!(format_timestamp(&expected), "2024-03-05T14:30:00Z");
    }
}
