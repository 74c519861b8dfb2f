//! Per-entity result tables: deterministic paths, atomic overwrite, and a
//! sha256 fingerprint of every written file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

use crate::decompose::{Decomposition, TrendRow};
use crate::forecast::{Forecast, ForecastRow};
use crate::health::HealthObservation;

pub const HEALTH_JOIN_FILE: &str = "health_pm25_joined.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Trend,
    Forecast,
    Components,
    HealthJoin,
}

impl TableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trend => "trend",
            Self::Forecast => "forecast",
            Self::Components => "components",
            Self::HealthJoin => "health_join",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenTable {
    pub kind: TableKind,
    pub path: PathBuf,
    pub rows: usize,
    pub sha256: String,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("output directory {path} is not usable: {source}")]
    OutputDir {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid output path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Serialize)]
struct TrendRecord<'a> {
    date: NaiveDate,
    trend: f64,
    city: &'a str,
}

#[derive(Debug, Serialize)]
struct ForecastRecord<'a> {
    ds: NaiveDate,
    trend: f64,
    yhat_lower: f64,
    yhat_upper: f64,
    trend_lower: f64,
    trend_upper: f64,
    weekly: f64,
    additive_terms: f64,
    yhat: f64,
    city: &'a str,
}

#[derive(Debug, Serialize)]
struct ComponentRecord<'a> {
    date: NaiveDate,
    observed: f64,
    trend: Option<f64>,
    seasonal: f64,
    residual: Option<f64>,
    city: &'a str,
}

/// Whitespace and path separators become underscores so every entity maps
/// to one file name inside the output directory.
pub fn sanitize_entity(entity: &str) -> String {
    entity
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '/' || c == '\\' {
                '_'
            } else {
                c
            }
        })
        .collect()
}

pub fn trend_table_path(dir: &Path, entity: &str) -> PathBuf {
    dir.join(format!("trend_{}.csv", sanitize_entity(entity)))
}

pub fn forecast_table_path(dir: &Path, entity: &str) -> PathBuf {
    dir.join(format!("forecast_{}.csv", sanitize_entity(entity)))
}

pub fn components_table_path(dir: &Path, entity: &str) -> PathBuf {
    dir.join(format!("decompose_{}.csv", sanitize_entity(entity)))
}

pub fn ensure_output_dir(dir: &Path) -> Result<(), WriteError> {
    fs::create_dir_all(dir).map_err(|source| WriteError::OutputDir {
        path: dir.display().to_string(),
        source,
    })
}

/// Writes `date,trend,city` for the rows where the trend is defined.
pub fn write_trend_table(dir: &Path, decomposition: &Decomposition) -> Result<WrittenTable, WriteError> {
    let rows = decomposition.trend_rows();
    let records = rows.iter().map(|row| TrendRecord {
        date: row.date,
        trend: row.trend,
        city: &decomposition.entity,
    });
    let path = trend_table_path(dir, &decomposition.entity);
    write_table(TableKind::Trend, &path, records)
}

pub fn write_components_table(
    dir: &Path,
    decomposition: &Decomposition,
) -> Result<WrittenTable, WriteError> {
    let records = decomposition
        .component_rows()
        .into_iter()
        .map(|row| ComponentRecord {
            date: row.date,
            observed: row.observed,
            trend: row.trend,
            seasonal: row.seasonal,
            residual: row.residual,
            city: &decomposition.entity,
        });
    let path = components_table_path(dir, &decomposition.entity);
    write_table(TableKind::Components, &path, records)
}

pub fn write_forecast_table(dir: &Path, forecast: &Forecast) -> Result<WrittenTable, WriteError> {
    let records = forecast.rows.iter().map(|row| ForecastRecord {
        ds: row.ds,
        trend: row.trend,
        yhat_lower: row.yhat_lower,
        yhat_upper: row.yhat_upper,
        trend_lower: row.trend_lower,
        trend_upper: row.trend_upper,
        weekly: row.weekly,
        additive_terms: row.additive_terms,
        yhat: row.yhat,
        city: &forecast.entity,
    });
    let path = forecast_table_path(dir, &forecast.entity);
    write_table(TableKind::Forecast, &path, records)
}

pub fn write_health_join(
    dir: &Path,
    observations: &[HealthObservation],
) -> Result<WrittenTable, WriteError> {
    write_table(TableKind::HealthJoin, &dir.join(HEALTH_JOIN_FILE), observations.iter())
}

pub fn read_trend_table(path: &Path) -> Result<Vec<TrendRow>, WriteError> {
    read_table(path)
}

pub fn read_forecast_table(path: &Path) -> Result<Vec<ForecastRow>, WriteError> {
    read_table(path)
}

fn read_table<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, WriteError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

fn write_table<I, T>(kind: TableKind, path: &Path, records: I) -> Result<WrittenTable, WriteError>
where
    I: IntoIterator<Item = T>,
    T: Serialize,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut rows = 0usize;
    for record in records {
        writer.serialize(record)?;
        rows += 1;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| WriteError::Io(err.into_error()))?;

    write_atomic(path, &bytes)?;
    let sha256 = sha256_hex(&bytes);
    info!(
        component = "writer",
        event = "writer.table.written",
        kind = kind.as_str(),
        path = %path.display(),
        rows,
        sha256 = %sha256
    );

    Ok(WrittenTable {
        kind,
        path: path.to_path_buf(),
        rows,
        sha256,
    })
}

/// Each call stages into its own uniquely named temp file beside `path`, so
/// concurrent writers never share a staging file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    if path.file_name().is_none() {
        return Err(WriteError::InvalidPath(path.display().to_string()));
    }
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::decompose_weekly;
    use crate::gap_fill::FilledSeries;

    fn decomposition(entity: &str) -> Decomposition {
        let values: Vec<f64> = (0..21).map(|d| 50.0 + (d % 7) as f64).collect();
        decompose_weekly(&FilledSeries {
            entity: entity.to_string(),
            start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            observed_days: values.len(),
            values,
            filled_ranges: Vec::new(),
        })
        .unwrap()
    }

    #[test]
    fn sanitize_replaces_whitespace_and_separators() {
        assert_eq!(sanitize_entity("New Delhi"), "New_Delhi");
        assert_eq!(sanitize_entity("a/b\\c\td"), "a_b_c_d");
        assert_eq!(
            trend_table_path(Path::new("out"), "Navi Mumbai"),
            Path::new("out").join("trend_Navi_Mumbai.csv")
        );
    }

    #[test]
    fn trend_table_has_header_and_defined_rows_only() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_trend_table(dir.path(), &decomposition("New Delhi")).unwrap();

        assert_eq!(written.rows, 15);
        assert_eq!(written.path, dir.path().join("trend_New_Delhi.csv"));
        let text = fs::read_to_string(&written.path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("date,trend,city"));
        assert!(lines.next().unwrap().starts_with("2025-01-04,"));
        assert!(text.lines().skip(1).all(|line| line.ends_with(",New Delhi")));
        assert!(!dir.path().join("trend_New_Delhi.csv.tmp").exists());
    }

    #[test]
    fn rewriting_produces_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_trend_table(dir.path(), &decomposition("Agra")).unwrap();
        let bytes = fs::read(&first.path).unwrap();
        let second = write_trend_table(dir.path(), &decomposition("Agra")).unwrap();

        assert_eq!(first.sha256, second.sha256);
        assert_eq!(fs::read(&second.path).unwrap(), bytes);
        assert_eq!(first.sha256.len(), 64);
    }

    #[test]
    fn concurrent_writes_to_one_path_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let source = decomposition("Agra");

        let results: Vec<Result<WrittenTable, WriteError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| write_trend_table(dir.path(), &source)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.iter().all(Result::is_ok));
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["trend_Agra.csv".to_string()]);
    }

    #[test]
    fn components_leave_undefined_trend_cells_empty() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_components_table(dir.path(), &decomposition("Agra")).unwrap();
        let text = fs::read_to_string(&written.path).unwrap();

        assert_eq!(written.rows, 21);
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("date,observed,trend,seasonal,residual,city")
        );
        let first = lines.next().unwrap();
        assert!(first.starts_with("2025-01-01,50.0,,"), "{first}");
    }

    #[test]
    fn trend_table_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let source = decomposition("Agra");
        let written = write_trend_table(dir.path(), &source).unwrap();

        let rows = read_trend_table(&written.path).unwrap();
        assert_eq!(rows, source.trend_rows());
    }
}
