//! Measurement loading and per-(entity, day) aggregation.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const UNKNOWN_ENTITY: &str = "Unknown";

const ENTITY_COLUMNS: [&str; 2] = ["city", "entity"];
const TIMESTAMP_COLUMN: &str = "timestamp";
const VALUE_COLUMN: &str = "value";

/// Cell spellings that mean "no reading", compared case-insensitively.
const MISSING_VALUE_TOKENS: [&str; 5] = ["nan", "na", "n/a", "null", "none"];

const NAIVE_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub entity: String,
    /// Wall-clock time in the measurement's own offset.
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

impl Measurement {
    pub fn new(entity: Option<&str>, timestamp: NaiveDateTime, value: f64) -> Self {
        Self {
            entity: normalize_entity(entity),
            timestamp,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// One entity's daily means, sorted by date with one point per date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySeries {
    pub entity: String,
    pub points: Vec<DailyPoint>,
}

impl DailySeries {
    pub fn observed_days(&self) -> usize {
        self.points.len()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.points.first().map(|point| point.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|point| point.date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityMean {
    pub city: String,
    pub mean_value: f64,
    pub measurements: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no usable measurements in {source_name}; generate or fetch input data first")]
    EmptyInput { source_name: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing required column '{column}'")]
    MissingColumn { column: &'static str },
    #[error("row {row}: failed to parse field {field} value '{value}'")]
    ParseField {
        row: u64,
        field: &'static str,
        value: String,
    },
}

pub fn normalize_entity(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(label) if !label.is_empty() => label.to_string(),
        _ => UNKNOWN_ENTITY.to_string(),
    }
}

pub fn read_measurements_csv(path: &Path) -> Result<Vec<Measurement>, LoadError> {
    let file = fs::File::open(path)?;
    let rows = read_measurements(file)?;
    info!(
        component = "loader",
        event = "loader.read.finish",
        path = %path.display(),
        rows = rows.len()
    );
    Ok(rows)
}

/// Empty, `NaN`/`NA`-style and non-finite `value` cells are missing readings
/// and are skipped; anything else that fails to parse is an error.
pub fn read_measurements<R: Read>(input: R) -> Result<Vec<Measurement>, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let headers = reader.headers()?.clone();
    let entity_idx = ENTITY_COLUMNS
        .iter()
        .find_map(|name| column_index(&headers, name))
        .ok_or(LoadError::MissingColumn {
            column: ENTITY_COLUMNS[0],
        })?;
    let timestamp_idx =
        column_index(&headers, TIMESTAMP_COLUMN).ok_or(LoadError::MissingColumn {
            column: TIMESTAMP_COLUMN,
        })?;
    let value_idx = column_index(&headers, VALUE_COLUMN).ok_or(LoadError::MissingColumn {
        column: VALUE_COLUMN,
    })?;

    let mut rows = Vec::new();
    let mut skipped_missing_values = 0u64;
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let row = idx as u64 + 1;

        let raw_value = record.get(value_idx).unwrap_or_default().trim();
        if is_missing_value(raw_value) {
            skipped_missing_values += 1;
            continue;
        }
        let value = raw_value
            .parse::<f64>()
            .map_err(|_| LoadError::ParseField {
                row,
                field: VALUE_COLUMN,
                value: raw_value.to_string(),
            })?;
        if !value.is_finite() {
            skipped_missing_values += 1;
            continue;
        }

        let raw_ts = record.get(timestamp_idx).unwrap_or_default();
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| LoadError::ParseField {
            row,
            field: TIMESTAMP_COLUMN,
            value: raw_ts.to_string(),
        })?;

        rows.push(Measurement::new(record.get(entity_idx), timestamp, value));
    }

    if skipped_missing_values > 0 {
        debug!(
            component = "loader",
            event = "loader.read.missing_values",
            skipped = skipped_missing_values
        );
    }

    Ok(rows)
}

fn is_missing_value(raw: &str) -> bool {
    raw.is_empty()
        || MISSING_VALUE_TOKENS
            .iter()
            .any(|token| raw.eq_ignore_ascii_case(token))
}

/// Offset-carrying timestamps keep their own wall clock; nothing is converted
/// to UTC, so the calendar day is the one the station reported.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.naive_local());
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

pub fn aggregate_daily(
    measurements: &[Measurement],
) -> Result<BTreeMap<String, DailySeries>, LoadError> {
    if measurements.is_empty() {
        return Err(LoadError::EmptyInput {
            source_name: "measurement set".to_string(),
        });
    }

    let mut sums: BTreeMap<String, BTreeMap<NaiveDate, (f64, u32)>> = BTreeMap::new();
    for measurement in measurements {
        let entity = normalize_entity(Some(&measurement.entity));
        let slot = sums
            .entry(entity)
            .or_default()
            .entry(measurement.timestamp.date())
            .or_insert((0.0, 0));
        slot.0 += measurement.value;
        slot.1 += 1;
    }

    let series = sums
        .into_iter()
        .map(|(entity, days)| {
            let points = days
                .into_iter()
                .map(|(date, (sum, count))| DailyPoint {
                    date,
                    value: sum / f64::from(count),
                })
                .collect();
            let series = DailySeries {
                entity: entity.clone(),
                points,
            };
            (entity, series)
        })
        .collect::<BTreeMap<_, _>>();

    info!(
        component = "loader",
        event = "loader.aggregate.finish",
        measurements = measurements.len(),
        entities = series.len()
    );

    Ok(series)
}

pub fn load_daily_series(path: &Path) -> Result<BTreeMap<String, DailySeries>, LoadError> {
    let measurements = read_measurements_csv(path)?;
    if measurements.is_empty() {
        return Err(LoadError::EmptyInput {
            source_name: path.display().to_string(),
        });
    }
    aggregate_daily(&measurements)
}

/// Mean of every raw measurement per entity, highest first.
pub fn city_mean_table(measurements: &[Measurement]) -> Vec<CityMean> {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for measurement in measurements {
        let slot = sums
            .entry(normalize_entity(Some(&measurement.entity)))
            .or_insert((0.0, 0));
        slot.0 += measurement.value;
        slot.1 += 1;
    }

    let mut table: Vec<CityMean> = sums
        .into_iter()
        .map(|(city, (sum, count))| CityMean {
            city,
            mean_value: sum / count as f64,
            measurements: count,
        })
        .collect();
    table.sort_by(|a, b| {
        b.mean_value
            .total_cmp(&a.mean_value)
            .then_with(|| a.city.cmp(&b.city))
    });
    table
}

fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|header| header.trim().eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::new(
            NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            NaiveTime::parse_from_str(time, "%H:%M:%S").unwrap(),
        )
    }

    #[test]
    fn parse_timestamp_accepts_pandas_and_iso_shapes() {
        assert_eq!(
            parse_timestamp("2025-01-05 13:00:00.123456"),
            Some(at("2025-01-05", "13:00:00") + chrono::Duration::microseconds(123_456))
        );
        assert_eq!(
            parse_timestamp("2025-01-05T13:00:00"),
            Some(at("2025-01-05", "13:00:00"))
        );
        assert_eq!(
            parse_timestamp("2025-01-05"),
            Some(at("2025-01-05", "00:00:00"))
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn offset_timestamps_keep_their_local_calendar_day() {
        let parsed = parse_timestamp("2025-01-05T23:30:00+05:30").unwrap();
        assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2025, 1, 5).unwrap());
    }

    #[test]
    fn reader_coalesces_missing_city_and_skips_empty_values() {
        let csv = "city,location,value,unit,timestamp\n\
                   Delhi,Delhi_Central,80.5,ug,2025-01-01 01:00:00\n\
                   ,Nowhere,12,ug,2025-01-01 02:00:00\n\
                   Delhi,Delhi_Central,,ug,2025-01-01 03:00:00\n";

        let rows = read_measurements(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entity, "Delhi");
        assert_eq!(rows[1].entity, UNKNOWN_ENTITY);
    }

    #[test]
    fn reader_drops_nan_tokens_and_non_finite_values() {
        let csv = "city,value,timestamp\n\
                   Delhi,70,2025-01-15 01:00:00\n\
                   Delhi,NaN,2025-01-15 13:00:00\n\
                   Delhi,NA,2025-01-15 14:00:00\n\
                   Delhi,n/a,2025-01-15 15:00:00\n\
                   Delhi,inf,2025-01-15 16:00:00\n\
                   Delhi,-Infinity,2025-01-15 17:00:00\n\
                   Delhi,90,2025-01-15 23:00:00\n";

        let rows = read_measurements(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);

        let series = aggregate_daily(&rows).unwrap();
        assert_eq!(series["Delhi"].points[0].value, 80.0);
    }

    #[test]
    fn reader_reports_missing_columns_and_bad_numbers() {
        let err = read_measurements("city,value\nDelhi,1\n".as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            LoadError::MissingColumn {
                column: TIMESTAMP_COLUMN
            }
        ));

        let err = read_measurements("city,timestamp,value\nDelhi,2025-01-01,abc\n".as_bytes())
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::ParseField {
                row: 1,
                field: VALUE_COLUMN,
                ..
            }
        ));
    }

    #[test]
    fn aggregate_daily_averages_same_day_measurements() {
        let rows = vec![
            Measurement::new(Some("Pune"), at("2025-01-01", "01:00:00"), 10.0),
            Measurement::new(Some("Pune"), at("2025-01-01", "23:00:00"), 20.0),
            Measurement::new(Some("Pune"), at("2025-01-03", "12:00:00"), 40.0),
            Measurement::new(None, at("2025-01-01", "12:00:00"), 5.0),
        ];

        let daily = aggregate_daily(&rows).unwrap();
        assert_eq!(daily.len(), 2);

        let pune = &daily["Pune"];
        assert_eq!(pune.observed_days(), 2);
        assert_eq!(pune.points[0].value, 15.0);
        assert_eq!(pune.points[1].value, 40.0);
        assert!(daily.contains_key(UNKNOWN_ENTITY));
    }

    #[test]
    fn aggregate_daily_rejects_empty_input() {
        assert!(matches!(
            aggregate_daily(&[]).unwrap_err(),
            LoadError::EmptyInput { .. }
        ));
    }

    #[test]
    fn city_mean_table_sorts_descending() {
        let rows = vec![
            Measurement::new(Some("Pune"), at("2025-01-01", "01:00:00"), 10.0),
            Measurement::new(Some("Patna"), at("2025-01-01", "01:00:00"), 90.0),
            Measurement::new(Some("Pune"), at("2025-01-02", "01:00:00"), 30.0),
        ];

        let table = city_mean_table(&rows);
        assert_eq!(table[0].city, "Patna");
        assert_eq!(table[1].city, "Pune");
        assert_eq!(table[1].mean_value, 20.0);
        assert_eq!(table[1].measurements, 2);
    }
}
