//! Seeded sample data: hourly city PM2.5 readings and country-year health
//! records, written in the same shapes the pipeline consumes.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::health::{DeathRateRecord, Pm25Record, DEATH_RATE_FILE, PM25_FILE};

const READING_FLOOR: f64 = 10.0;
const WEEKDAY_FACTOR: f64 = 1.2;
const WEEKEND_FACTOR: f64 = 0.8;
const RUSH_HOUR_FACTOR: f64 = 1.3;
const UNIT: &str = "µg/m³";

const FIRST_YEAR: i32 = 2000;
const LAST_YEAR: i32 = 2019;
const DEATH_RATE_TREND: f64 = 0.015;
const DEATH_RATE_NOISE: f64 = 0.10;
const DEATH_RATE_FLOOR: f64 = 1.0;
const PM25_TREND: f64 = 0.02;
const PM25_NOISE: f64 = 0.15;
const PM25_FLOOR: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CityProfile {
    pub name: &'static str,
    pub base_pm25: f64,
    pub variation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountryProfile {
    pub name: &'static str,
    pub death_rate: f64,
    pub pm25: f64,
}

const fn city(name: &'static str, base_pm25: f64, variation: f64) -> CityProfile {
    CityProfile {
        name,
        base_pm25,
        variation,
    }
}

const fn country(name: &'static str, death_rate: f64, pm25: f64) -> CountryProfile {
    CountryProfile {
        name,
        death_rate,
        pm25,
    }
}

pub const CITY_PROFILES: [CityProfile; 20] = [
    city("Delhi", 80.0, 40.0),
    city("Mumbai", 60.0, 25.0),
    city("Kolkata", 55.0, 30.0),
    city("Chennai", 45.0, 20.0),
    city("Bangalore", 35.0, 15.0),
    city("Hyderabad", 50.0, 25.0),
    city("Pune", 40.0, 20.0),
    city("Ahmedabad", 65.0, 35.0),
    city("Jaipur", 70.0, 30.0),
    city("Lucknow", 75.0, 35.0),
    city("Kanpur", 85.0, 40.0),
    city("Nagpur", 45.0, 20.0),
    city("Indore", 55.0, 25.0),
    city("Bhopal", 50.0, 25.0),
    city("Patna", 90.0, 45.0),
    city("Vadodara", 60.0, 30.0),
    city("Ludhiana", 75.0, 35.0),
    city("Agra", 80.0, 40.0),
    city("Nashik", 45.0, 20.0),
    city("Faridabad", 85.0, 40.0),
];

/// Death rates are per 100k population; PM2.5 is a long-term mean in µg/m³.
pub const COUNTRY_PROFILES: [CountryProfile; 30] = [
    country("India", 98.5, 65.5),
    country("China", 89.2, 58.2),
    country("Pakistan", 95.8, 62.8),
    country("Bangladesh", 102.3, 68.3),
    country("Indonesia", 67.4, 45.4),
    country("Nigeria", 45.6, 38.6),
    country("United States", 12.8, 18.8),
    country("Brazil", 23.4, 25.4),
    country("Russia", 35.7, 28.7),
    country("Japan", 8.9, 15.9),
    country("Germany", 15.2, 22.2),
    country("United Kingdom", 11.7, 18.7),
    country("France", 13.8, 20.8),
    country("Italy", 18.9, 25.9),
    country("Spain", 16.3, 23.3),
    country("Canada", 9.2, 16.2),
    country("Australia", 7.8, 14.8),
    country("South Korea", 22.1, 29.1),
    country("Mexico", 28.7, 32.7),
    country("South Africa", 42.3, 35.3),
    country("Egypt", 78.9, 55.9),
    country("Turkey", 34.5, 38.5),
    country("Thailand", 45.6, 42.6),
    country("Vietnam", 52.1, 48.1),
    country("Philippines", 38.9, 35.9),
    country("Iran", 65.4, 52.4),
    country("Saudi Arabia", 29.8, 35.8),
    country("Argentina", 19.7, 22.7),
    country("Colombia", 25.3, 28.3),
    country("Poland", 41.2, 38.2),
];

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    /// Hourly readings cover `[end - days, end]`.
    pub days: u32,
    pub end: NaiveDateTime,
    pub seed: u64,
    pub missing_probability: f64,
    pub country: String,
}

impl SyntheticConfig {
    pub fn ending_at(end: NaiveDateTime) -> Self {
        Self {
            days: 30,
            end,
            seed: 42,
            missing_probability: 0.05,
            country: "IN".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticMeasurement {
    pub city: String,
    pub location: String,
    pub value: f64,
    pub unit: String,
    pub country: String,
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Error)]
pub enum SyntheticError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid synthetic config: {0}")]
    InvalidConfig(String),
}

pub fn generate_measurements(
    config: &SyntheticConfig,
) -> Result<Vec<SyntheticMeasurement>, SyntheticError> {
    if !(0.0..=1.0).contains(&config.missing_probability) {
        return Err(SyntheticError::InvalidConfig(format!(
            "missing_probability {} outside [0, 1]",
            config.missing_probability
        )));
    }
    let noise = CITY_PROFILES
        .iter()
        .map(|profile| normal(profile.variation))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut rows = Vec::new();
    let mut at = config.end - Duration::days(i64::from(config.days));
    while at <= config.end {
        let weekly = if at.weekday().num_days_from_monday() < 5 {
            WEEKDAY_FACTOR
        } else {
            WEEKEND_FACTOR
        };
        let hour = at.hour();
        let daily = if (6..=9).contains(&hour) || (18..=21).contains(&hour) {
            RUSH_HOUR_FACTOR
        } else {
            1.0
        };

        for (profile, noise) in CITY_PROFILES.iter().zip(&noise) {
            let raw = profile.base_pm25 * weekly * daily + noise.sample(&mut rng);
            let value = round_one_decimal(raw.max(READING_FLOOR));
            if rng.gen::<f64>() > config.missing_probability {
                rows.push(SyntheticMeasurement {
                    city: profile.name.to_string(),
                    location: format!("{}_Central", profile.name),
                    value,
                    unit: UNIT.to_string(),
                    country: config.country.clone(),
                    timestamp: at,
                });
            }
        }
        at += Duration::hours(1);
    }
    Ok(rows)
}

pub fn measurements_file_name(country: &str, date: NaiveDate) -> String {
    format!("openaq_pm25_{country}_{}.csv", date.format("%Y-%m-%d"))
}

pub fn write_measurements_csv(
    dir: &Path,
    country: &str,
    date: NaiveDate,
    rows: &[SyntheticMeasurement],
) -> Result<PathBuf, SyntheticError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(measurements_file_name(country, date));
    write_csv(&path, rows)?;
    info!(
        component = "synthetic",
        event = "synthetic.measurements.written",
        path = %path.display(),
        rows = rows.len()
    );
    Ok(path)
}

pub fn generate_death_rates(seed: u64) -> Result<Vec<DeathRateRecord>, SyntheticError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows = Vec::with_capacity(COUNTRY_PROFILES.len() * 20);
    for year in FIRST_YEAR..=LAST_YEAR {
        for profile in &COUNTRY_PROFILES {
            let death_rate = trended_sample(
                &mut rng,
                profile.death_rate,
                year,
                DEATH_RATE_TREND,
                DEATH_RATE_NOISE,
                DEATH_RATE_FLOOR,
            )?;
            rows.push(DeathRateRecord {
                country: profile.name.to_string(),
                year,
                death_rate,
            });
        }
    }
    Ok(rows)
}

pub fn generate_country_pm25(seed: u64) -> Result<Vec<Pm25Record>, SyntheticError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows = Vec::with_capacity(COUNTRY_PROFILES.len() * 20);
    for year in FIRST_YEAR..=LAST_YEAR {
        for profile in &COUNTRY_PROFILES {
            let pm25 = trended_sample(
                &mut rng,
                profile.pm25,
                year,
                PM25_TREND,
                PM25_NOISE,
                PM25_FLOOR,
            )?;
            rows.push(Pm25Record {
                country: profile.name.to_string(),
                year,
                pm25,
            });
        }
    }
    Ok(rows)
}

/// Writes both health inputs into `dir`; exposure uses `seed + 1` so the two
/// noise streams are independent.
pub fn write_health_samples(dir: &Path, seed: u64) -> Result<Vec<PathBuf>, SyntheticError> {
    fs::create_dir_all(dir)?;
    let death_path = dir.join(DEATH_RATE_FILE);
    let pm25_path = dir.join(PM25_FILE);
    write_csv(&death_path, &generate_death_rates(seed)?)?;
    write_csv(&pm25_path, &generate_country_pm25(seed.wrapping_add(1))?)?;
    info!(
        component = "synthetic",
        event = "synthetic.health.written",
        dir = %dir.display(),
        countries = COUNTRY_PROFILES.len()
    );
    Ok(vec![death_path, pm25_path])
}

fn trended_sample(
    rng: &mut StdRng,
    base: f64,
    year: i32,
    annual_decline: f64,
    noise_fraction: f64,
    floor: f64,
) -> Result<f64, SyntheticError> {
    let trend = 1.0 - f64::from(year - FIRST_YEAR) * annual_decline;
    let noise = normal(base * noise_fraction)?.sample(rng);
    Ok(round_one_decimal((base * trend + noise).max(floor)))
}

fn normal(std_dev: f64) -> Result<Normal<f64>, SyntheticError> {
    Normal::new(0.0, std_dev).map_err(|err| SyntheticError::InvalidConfig(err.to_string()))
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), SyntheticError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(days: u32, missing_probability: f64) -> SyntheticConfig {
        SyntheticConfig {
            days,
            missing_probability,
            ..SyntheticConfig::ending_at(
                NaiveDate::from_ymd_opt(2025, 2, 2)
                    .unwrap()
                    .and_hms_opt(12, 0, 0)
                    .unwrap(),
            )
        }
    }

    #[test]
    fn same_seed_generates_same_rows() {
        let a = generate_measurements(&config(3, 0.05)).unwrap();
        let b = generate_measurements(&config(3, 0.05)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn every_hour_and_city_present_without_dropout() {
        let rows = generate_measurements(&config(2, 0.0)).unwrap();
        assert_eq!(rows.len(), 20 * (2 * 24 + 1));
        assert!(rows.iter().all(|row| row.value >= READING_FLOOR));
        assert!(rows
            .iter()
            .all(|row| ((row.value * 10.0).round() - row.value * 10.0).abs() < 1e-9));
    }

    #[test]
    fn weekdays_run_higher_than_weekends() {
        let rows = generate_measurements(&config(28, 0.0)).unwrap();
        let mean = |weekend: bool| {
            let values: Vec<f64> = rows
                .iter()
                .filter(|row| row.city == "Delhi")
                .filter(|row| (row.timestamp.weekday().num_days_from_monday() >= 5) == weekend)
                .map(|row| row.value)
                .collect();
            values.iter().sum::<f64>() / values.len() as f64
        };
        assert!(mean(false) > mean(true) + 15.0);
    }

    #[test]
    fn rejects_out_of_range_missing_probability() {
        assert!(matches!(
            generate_measurements(&config(1, 1.5)),
            Err(SyntheticError::InvalidConfig(_))
        ));
    }

    #[test]
    fn measurement_file_uses_dated_name_and_loader_columns() {
        let dir = tempfile::tempdir().unwrap();
        let rows = generate_measurements(&config(1, 0.0)).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 2, 2).unwrap();

        let path = write_measurements_csv(dir.path(), "IN", date, &rows).unwrap();
        assert_eq!(path, dir.path().join("openaq_pm25_IN_2025-02-02.csv"));
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text.lines().next(),
            Some("city,location,value,unit,country,timestamp")
        );
        assert!(text.lines().nth(1).unwrap().ends_with(",2025-02-01 12:00:00"));
    }

    #[test]
    fn health_samples_cover_every_country_year_above_floor() {
        let deaths = generate_death_rates(7).unwrap();
        let pm25 = generate_country_pm25(8).unwrap();

        assert_eq!(deaths.len(), 30 * 20);
        assert_eq!(pm25.len(), 30 * 20);
        assert!(deaths.iter().all(|row| row.death_rate >= DEATH_RATE_FLOOR));
        assert!(pm25.iter().all(|row| row.pm25 >= PM25_FLOOR));
        assert_eq!(deaths[0].year, FIRST_YEAR);
        assert_eq!(deaths.last().unwrap().year, LAST_YEAR);
    }
}
