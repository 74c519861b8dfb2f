//! Country-year health and exposure records, and the join that feeds the
//! mortality-association analysis.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const DEATH_RATE_FILE: &str = "air_pollution_death_rate.csv";
pub const PM25_FILE: &str = "country_pm25.csv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeathRateRecord {
    pub country: String,
    pub year: i32,
    pub death_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pm25Record {
    pub country: String,
    pub year: i32,
    pub pm25: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthObservation {
    pub country: String,
    pub year: i32,
    pub death_rate: f64,
    pub pm25: f64,
}

#[derive(Debug, Error)]
pub enum HealthDataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("no (country, year) pairs with positive values in both inputs")]
    EmptyJoin,
}

pub fn read_death_rates_csv(path: &Path) -> Result<Vec<DeathRateRecord>, HealthDataError> {
    read_records(fs::File::open(path)?)
}

pub fn read_pm25_csv(path: &Path) -> Result<Vec<Pm25Record>, HealthDataError> {
    read_records(fs::File::open(path)?)
}

pub fn read_records<R: Read, T: for<'de> Deserialize<'de>>(
    input: R,
) -> Result<Vec<T>, HealthDataError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Inner join on `(country, year)`. Pairs where either value is non-finite
/// or not strictly positive are dropped since the consumer works in logs.
/// Duplicate keys keep the last record. Output is sorted by key.
pub fn join_country_year(
    death_rates: &[DeathRateRecord],
    pm25: &[Pm25Record],
) -> Vec<HealthObservation> {
    let exposure: BTreeMap<(&str, i32), f64> = pm25
        .iter()
        .map(|row| ((row.country.as_str(), row.year), row.pm25))
        .collect();
    let outcomes: BTreeMap<(&str, i32), f64> = death_rates
        .iter()
        .map(|row| ((row.country.as_str(), row.year), row.death_rate))
        .collect();

    let joined: Vec<HealthObservation> = outcomes
        .into_iter()
        .filter_map(|((country, year), death_rate)| {
            let pm25 = *exposure.get(&(country, year))?;
            (is_usable(death_rate) && is_usable(pm25)).then(|| HealthObservation {
                country: country.to_string(),
                year,
                death_rate,
                pm25,
            })
        })
        .collect();

    debug!(
        component = "health",
        event = "health.join.finish",
        death_rate_rows = death_rates.len(),
        pm25_rows = pm25.len(),
        joined = joined.len()
    );
    joined
}

/// Reads both inputs from `dir` and joins them; an empty join is an error.
pub fn load_health_join(dir: &Path) -> Result<Vec<HealthObservation>, HealthDataError> {
    let death_rates = read_death_rates_csv(&dir.join(DEATH_RATE_FILE))?;
    let pm25 = read_pm25_csv(&dir.join(PM25_FILE))?;
    let joined = join_country_year(&death_rates, &pm25);
    if joined.is_empty() {
        return Err(HealthDataError::EmptyJoin);
    }
    info!(
        component = "health",
        event = "health.load.finish",
        dir = %dir.display(),
        observations = joined.len()
    );
    Ok(joined)
}

fn is_usable(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
