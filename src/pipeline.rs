//! Stage orchestration: input selection, per-entity fan-out over rayon, and
//! the end-of-run summary.
//!
//! Each entity is processed independently. An entity that is too short or
//! whose model fails is recorded as skipped and never aborts the batch; only
//! a missing input, an empty dataset, or an unusable output directory does.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::decompose::{decompose_weekly, DecompositionError};
use crate::forecast::{ModelFitError, SeriesForecaster};
use crate::gap_fill::{fill_daily_gaps, SeriesError};
use crate::health::{load_health_join, HealthDataError};
use crate::measurements::{load_daily_series, DailySeries, LoadError};
use crate::writer::{
    ensure_output_dir, sanitize_entity, write_components_table, write_forecast_table, write_health_join,
    write_trend_table, WriteError, WrittenTable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decompose,
    Forecast,
    HealthJoin,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decompose => "decompose",
            Self::Forecast => "forecast",
            Self::HealthJoin => "health_join",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientData { observed: usize, required: usize },
    Decomposition { message: String },
    ModelFit { message: String },
    Write { message: String },
    OutputNameCollision { output_name: String },
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData { observed, required } => write!(
                f,
                "insufficient data: {observed} observed days, at least {required} required"
            ),
            Self::Decomposition { message } => write!(f, "decomposition failed: {message}"),
            Self::ModelFit { message } => write!(f, "model fit failed: {message}"),
            Self::Write { message } => write!(f, "write failed: {message}"),
            Self::OutputNameCollision { output_name } => write!(
                f,
                "output name '{output_name}' is shared with another entity"
            ),
            Self::Cancelled => f.write_str("cancelled before processing"),
        }
    }
}

impl From<SeriesError> for SkipReason {
    fn from(err: SeriesError) -> Self {
        match err {
            SeriesError::InsufficientData {
                observed, required, ..
            } => Self::InsufficientData { observed, required },
        }
    }
}

impl From<DecompositionError> for SkipReason {
    fn from(err: DecompositionError) -> Self {
        match err {
            DecompositionError::InsufficientData { observed, required } => {
                Self::InsufficientData { observed, required }
            }
            other => Self::Decomposition {
                message: other.to_string(),
            },
        }
    }
}

impl From<ModelFitError> for SkipReason {
    fn from(err: ModelFitError) -> Self {
        match err {
            ModelFitError::InsufficientData { observed, required } => {
                Self::InsufficientData { observed, required }
            }
            other => Self::ModelFit {
                message: other.to_string(),
            },
        }
    }
}

impl From<WriteError> for SkipReason {
    fn from(err: WriteError) -> Self {
        Self::Write {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedEntity {
    pub entity: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub input_path: PathBuf,
    pub entities: usize,
    pub produced: Vec<WrittenTable>,
    pub skipped: Vec<SkippedEntity>,
}

impl StageSummary {
    pub fn render(&self) -> String {
        let mut out = format!(
            "{}: {} entities from {}, {} tables written, {} skipped\n",
            self.stage.as_str(),
            self.entities,
            self.input_path.display(),
            self.produced.len(),
            self.skipped.len()
        );
        for table in &self.produced {
            out.push_str(&format!(
                "  wrote {} {} ({} rows)\n",
                table.kind.as_str(),
                table.path.display(),
                table.rows
            ));
        }
        for skipped in &self.skipped {
            out.push_str(&format!("  skipped {}: {}\n", skipped.entity, skipped.reason));
        }
        out
    }
}

/// Checked between entities only; an entity that already started finishes.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no input file matching {pattern} in {dir}; generate or fetch input data first")]
    NoInputFile { dir: String, pattern: String },
    #[error("input scan failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Health(#[from] HealthDataError),
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug)]
enum EntityOutcome {
    Produced(Vec<WrittenTable>),
    Skipped(SkippedEntity),
}

pub fn select_input(config: &PipelineConfig) -> Result<PathBuf, PipelineError> {
    config
        .selector
        .select_latest(&config.input_dir)?
        .ok_or_else(|| PipelineError::NoInputFile {
            dir: config.input_dir.display().to_string(),
            pattern: config.selector.pattern(),
        })
}

/// Loads the latest input and writes one trend table per entity.
pub fn run_decomposition(
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<StageSummary, PipelineError> {
    let input_path = select_input(config)?;
    let series = load_daily_series(&input_path)?;
    ensure_output_dir(&config.output_dir)?;
    log_stage_start(Stage::Decompose, &input_path, series.len(), None);

    let outcomes = with_worker_pool(config.workers, || {
        decompose_entities(&series, &config.output_dir, cancel)
    })?;
    Ok(summarize(Stage::Decompose, input_path, series.len(), outcomes))
}

/// Loads the latest input and writes one forecast table per entity.
pub fn run_forecast(
    config: &PipelineConfig,
    forecaster: &dyn SeriesForecaster,
    cancel: &CancellationToken,
) -> Result<StageSummary, PipelineError> {
    let input_path = select_input(config)?;
    let series = load_daily_series(&input_path)?;
    ensure_output_dir(&config.output_dir)?;
    log_stage_start(
        Stage::Forecast,
        &input_path,
        series.len(),
        Some(forecaster.name()),
    );

    let outcomes = with_worker_pool(config.workers, || {
        forecast_entities(&series, forecaster, &config.output_dir, cancel)
    })?;
    Ok(summarize(Stage::Forecast, input_path, series.len(), outcomes))
}

pub fn run_health_join(config: &PipelineConfig) -> Result<StageSummary, PipelineError> {
    let observations = load_health_join(&config.health_dir)?;
    ensure_output_dir(&config.output_dir)?;
    log_stage_start(
        Stage::HealthJoin,
        &config.health_dir,
        observations.len(),
        None,
    );

    let written = write_health_join(&config.output_dir, &observations)?;
    Ok(StageSummary {
        stage: Stage::HealthJoin,
        input_path: config.health_dir.clone(),
        entities: observations.len(),
        produced: vec![written],
        skipped: Vec::new(),
    })
}

/// Fans out over entities in the caller's rayon pool. Results come back in
/// entity order regardless of scheduling.
pub fn decompose_entities(
    series: &BTreeMap<String, DailySeries>,
    output_dir: &Path,
    cancel: &CancellationToken,
) -> (Vec<WrittenTable>, Vec<SkippedEntity>) {
    let collisions = output_name_collisions(series);
    let outcomes: Vec<EntityOutcome> = series
        .par_iter()
        .map(|(entity, daily)| {
            if let Some(reason) = precheck(entity, &collisions, cancel) {
                return skipped(entity, reason);
            }
            match decompose_one(daily, output_dir) {
                Ok(tables) => EntityOutcome::Produced(tables),
                Err(reason) => skipped(entity, reason),
            }
        })
        .collect();
    split_outcomes(Stage::Decompose, outcomes)
}

pub fn forecast_entities(
    series: &BTreeMap<String, DailySeries>,
    forecaster: &dyn SeriesForecaster,
    output_dir: &Path,
    cancel: &CancellationToken,
) -> (Vec<WrittenTable>, Vec<SkippedEntity>) {
    let collisions = output_name_collisions(series);
    let outcomes: Vec<EntityOutcome> = series
        .par_iter()
        .map(|(entity, daily)| {
            if let Some(reason) = precheck(entity, &collisions, cancel) {
                return skipped(entity, reason);
            }
            match forecast_one(daily, forecaster, output_dir) {
                Ok(table) => EntityOutcome::Produced(vec![table]),
                Err(reason) => skipped(entity, reason),
            }
        })
        .collect();
    split_outcomes(Stage::Forecast, outcomes)
}

/// Entities whose sanitized output name is shared with another entity.
/// Every member of a colliding group is skipped, so the outcome never
/// depends on scheduling.
fn output_name_collisions(series: &BTreeMap<String, DailySeries>) -> BTreeMap<&str, String> {
    let mut by_name: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for entity in series.keys() {
        by_name
            .entry(sanitize_entity(entity))
            .or_default()
            .push(entity.as_str());
    }
    by_name
        .into_iter()
        .filter(|(_, entities)| entities.len() > 1)
        .flat_map(|(name, entities)| {
            entities
                .into_iter()
                .map(move |entity| (entity, name.clone()))
        })
        .collect()
}

fn precheck(
    entity: &str,
    collisions: &BTreeMap<&str, String>,
    cancel: &CancellationToken,
) -> Option<SkipReason> {
    if let Some(output_name) = collisions.get(entity) {
        return Some(SkipReason::OutputNameCollision {
            output_name: output_name.clone(),
        });
    }
    cancel.is_cancelled().then_some(SkipReason::Cancelled)
}

fn decompose_one(daily: &DailySeries, output_dir: &Path) -> Result<Vec<WrittenTable>, SkipReason> {
    let filled = fill_daily_gaps(daily)?;
    let decomposition = decompose_weekly(&filled)?;
    let trend = write_trend_table(output_dir, &decomposition)?;

    let mut tables = vec![trend];
    match write_components_table(output_dir, &decomposition) {
        Ok(components) => tables.push(components),
        Err(err) => warn!(
            component = "pipeline",
            event = "pipeline.entity.components_failed",
            entity = %daily.entity,
            error = %err
        ),
    }
    Ok(tables)
}

fn forecast_one(
    daily: &DailySeries,
    forecaster: &dyn SeriesForecaster,
    output_dir: &Path,
) -> Result<WrittenTable, SkipReason> {
    let filled = fill_daily_gaps(daily)?;
    let forecast = forecaster.forecast(&filled)?;
    Ok(write_forecast_table(output_dir, &forecast)?)
}

fn skipped(entity: &str, reason: SkipReason) -> EntityOutcome {
    EntityOutcome::Skipped(SkippedEntity {
        entity: entity.to_string(),
        reason,
    })
}

/// Skip events are emitted here, on the calling thread, in entity order.
fn split_outcomes(
    stage: Stage,
    outcomes: Vec<EntityOutcome>,
) -> (Vec<WrittenTable>, Vec<SkippedEntity>) {
    let mut produced = Vec::new();
    let mut skipped = Vec::new();
    for outcome in outcomes {
        match outcome {
            EntityOutcome::Produced(tables) => produced.extend(tables),
            EntityOutcome::Skipped(entity) => {
                log_entity_skipped(stage, &entity);
                skipped.push(entity);
            }
        }
    }
    (produced, skipped)
}

fn log_entity_skipped(stage: Stage, skipped: &SkippedEntity) {
    match &skipped.reason {
        SkipReason::InsufficientData { .. } | SkipReason::Cancelled => info!(
            component = "pipeline",
            event = "pipeline.entity.skipped",
            stage = stage.as_str(),
            entity = %skipped.entity,
            reason = %skipped.reason
        ),
        _ => warn!(
            component = "pipeline",
            event = "pipeline.entity.skipped",
            stage = stage.as_str(),
            entity = %skipped.entity,
            reason = %skipped.reason
        ),
    }
}

fn summarize(
    stage: Stage,
    input_path: PathBuf,
    entities: usize,
    (produced, skipped): (Vec<WrittenTable>, Vec<SkippedEntity>),
) -> StageSummary {
    StageSummary {
        stage,
        input_path,
        entities,
        produced,
        skipped,
    }
}

fn with_worker_pool<T, F>(workers: Option<usize>, op: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    match workers {
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()?;
            Ok(pool.install(op))
        }
        None => Ok(op()),
    }
}

fn log_stage_start(stage: Stage, input_path: &Path, entities: usize, model: Option<&str>) {
    match model {
        Some(model) => info!(
            component = "pipeline",
            event = "pipeline.stage.start",
            stage = stage.as_str(),
            input = %input_path.display(),
            entities,
            model
        ),
        None => info!(
            component = "pipeline",
            event = "pipeline.stage.start",
            stage = stage.as_str(),
            input = %input_path.display(),
            entities
        ),
    }
}
