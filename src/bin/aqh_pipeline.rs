use aqh::{
    init_logging, log_app_start, log_run_summary, logging_config_from_env,
    pipeline_config_from_env, run_decomposition, run_forecast, run_health_join, CancellationToken,
    StageSummary, WeeklyAdditiveForecaster,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Decompose,
    Forecast,
    Health,
    All,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("aqh_pipeline", &logging_cfg);

    let command = parse_command(std::env::args().nth(1).as_deref())?;
    let cfg = pipeline_config_from_env();
    let cancel = CancellationToken::new();

    println!(
        "Pipeline start | command={:?} input_dir={} output_dir={} pattern={}",
        command,
        cfg.input_dir.display(),
        cfg.output_dir.display(),
        cfg.selector.pattern()
    );

    if matches!(command, Command::Decompose | Command::All) {
        report(&run_decomposition(&cfg, &cancel)?);
    }
    if matches!(command, Command::Forecast | Command::All) {
        report(&run_forecast(&cfg, &WeeklyAdditiveForecaster, &cancel)?);
    }
    if matches!(command, Command::Health | Command::All) {
        report(&run_health_join(&cfg)?);
    }
    Ok(())
}

fn report(summary: &StageSummary) {
    log_run_summary(summary);
    print!("{}", summary.render());
}

fn parse_command(raw: Option<&str>) -> Result<Command, String> {
    match raw.map(str::trim) {
        None | Some("all") => Ok(Command::All),
        Some("decompose") => Ok(Command::Decompose),
        Some("forecast") => Ok(Command::Forecast),
        Some("health") => Ok(Command::Health),
        Some(other) => Err(format!(
            "unknown command '{other}'; expected decompose, forecast, health or all"
        )),
    }
}
