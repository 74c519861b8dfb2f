//! AQH core crate: PM2.5 trend decomposition and forecasting per city.
//!
//! Current implemented scope:
//! - latest dated input selection and measurement loading
//! - per-city daily aggregation, calendar reindexing and gap interpolation
//! - weekly additive decomposition and 30-day forecasts, fanned out per city
//! - per-city result tables, country-year health join, dashboard routes
//! - seeded synthetic inputs

mod config;
mod dashboard;
mod decompose;
mod forecast;
mod gap_fill;
mod health;
mod linalg;
mod measurements;
mod observability;
mod pipeline;
mod synthetic;
mod writer;

pub use config::{
    pipeline_config_from_env, pipeline_config_from_lookup, DatedFileSelector, PipelineConfig,
    DEFAULT_INPUT_EXTENSION, DEFAULT_INPUT_PREFIX,
};
pub use dashboard::{
    dashboard_router, render_dashboard_html, snapshot_from_tables, CityDetail, CitySummaryRow,
    DashboardSnapshot, DashboardSnapshotSource, InMemorySnapshotSource, TableDirSnapshotSource,
    DASHBOARD_HEADERS,
};
pub use decompose::{
    centered_moving_average, decompose_additive, decompose_weekly, ComponentRow, Decomposition,
    DecompositionError, TrendRow, WEEKLY_PERIOD,
};
pub use forecast::{
    Forecast, ForecastRow, ModelFitError, SeriesForecaster, WeeklyAdditiveForecaster,
    FORECAST_HORIZON_DAYS,
};
pub use gap_fill::{
    fill_daily_gaps, interpolate_linear, reindex_to_calendar, FilledSeries, SeriesError,
    MIN_OBSERVED_DAYS,
};
pub use health::{
    join_country_year, load_health_join, read_death_rates_csv, read_pm25_csv, DeathRateRecord,
    HealthDataError, HealthObservation, Pm25Record, DEATH_RATE_FILE, PM25_FILE,
};
pub use linalg::solve_penalized_least_squares;
pub use measurements::{
    aggregate_daily, city_mean_table, load_daily_series, normalize_entity, parse_timestamp,
    read_measurements, read_measurements_csv, CityMean, DailyPoint, DailySeries, LoadError,
    Measurement, UNKNOWN_ENTITY,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_run_summary, log_source_selected,
    logging_config_from_env, logging_config_from_lookup, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use pipeline::{
    decompose_entities, forecast_entities, run_decomposition, run_forecast, run_health_join,
    select_input, CancellationToken, PipelineError, SkipReason, SkippedEntity, Stage,
    StageSummary,
};
pub use synthetic::{
    generate_country_pm25, generate_death_rates, generate_measurements, measurements_file_name,
    write_health_samples, write_measurements_csv, CityProfile, CountryProfile, SyntheticConfig,
    SyntheticError, SyntheticMeasurement, CITY_PROFILES, COUNTRY_PROFILES,
};
pub use writer::{
    components_table_path, ensure_output_dir, forecast_table_path, read_forecast_table,
    read_trend_table, sanitize_entity, trend_table_path, write_components_table,
    write_forecast_table, write_health_join, write_trend_table, TableKind, WriteError,
    WrittenTable, HEALTH_JOIN_FILE,
};
