use aqh::{
    generate_measurements, init_logging, log_app_start, logging_config_from_env,
    pipeline_config_from_env, write_health_samples, write_measurements_csv, SyntheticConfig,
};
use chrono::{Timelike, Utc};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("synthetic_data", &logging_cfg);

    let pipeline_cfg = pipeline_config_from_env();
    let now = Utc::now().naive_utc();
    let end = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);

    let mut cfg = SyntheticConfig::ending_at(end);
    if let Some(days) = env_parse::<u32>("AQH_SYNTHETIC_DAYS") {
        cfg.days = days;
    }
    if let Some(seed) = env_parse::<u64>("AQH_SYNTHETIC_SEED") {
        cfg.seed = seed;
    }

    let rows = generate_measurements(&cfg)?;
    let measurements_path =
        write_measurements_csv(&pipeline_cfg.input_dir, &cfg.country, end.date(), &rows)?;
    let health_paths = write_health_samples(&pipeline_cfg.health_dir, cfg.seed)?;

    println!(
        "Synthetic data written | measurements={} rows={} days={} seed={}",
        measurements_path.display(),
        rows.len(),
        cfg.days,
        cfg.seed
    );
    for path in health_paths {
        println!("Health sample written | {}", path.display());
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}
