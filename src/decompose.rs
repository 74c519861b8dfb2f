//! Additive seasonal decomposition with a centered moving-average trend.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::gap_fill::FilledSeries;

/// Daily samples, weekly cycle.
pub const WEEKLY_PERIOD: usize = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRow {
    pub date: NaiveDate,
    pub trend: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRow {
    pub date: NaiveDate,
    pub observed: f64,
    pub trend: Option<f64>,
    pub seasonal: f64,
    pub residual: Option<f64>,
}

/// `observed = trend + seasonal + residual` wherever `trend` is defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub entity: String,
    pub period: usize,
    pub start: NaiveDate,
    pub observed: Vec<f64>,
    pub trend: Vec<Option<f64>>,
    pub seasonal: Vec<f64>,
    pub residual: Vec<Option<f64>>,
}

impl Decomposition {
    pub fn date_at(&self, index: usize) -> NaiveDate {
        self.start + chrono::Days::new(index as u64)
    }

    /// Rows with a defined trend only; edge rows are dropped, never zero-filled.
    pub fn trend_rows(&self) -> Vec<TrendRow> {
        self.trend
            .iter()
            .enumerate()
            .filter_map(|(idx, trend)| {
                trend.map(|trend| TrendRow {
                    date: self.date_at(idx),
                    trend,
                })
            })
            .collect()
    }

    pub fn component_rows(&self) -> Vec<ComponentRow> {
        (0..self.observed.len())
            .map(|idx| ComponentRow {
                date: self.date_at(idx),
                observed: self.observed[idx],
                trend: self.trend[idx],
                seasonal: self.seasonal[idx],
                residual: self.residual[idx],
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecompositionError {
    #[error("{observed} points available, at least {required} (two full periods) required")]
    InsufficientData { observed: usize, required: usize },
    #[error("period must be at least 2, got {0}")]
    InvalidPeriod(usize),
    #[error("non-finite observation on {date}")]
    NonFiniteInput { date: NaiveDate },
}

pub fn decompose_weekly(series: &FilledSeries) -> Result<Decomposition, DecompositionError> {
    decompose_additive(series, WEEKLY_PERIOD)
}

pub fn decompose_additive(
    series: &FilledSeries,
    period: usize,
) -> Result<Decomposition, DecompositionError> {
    if period < 2 {
        return Err(DecompositionError::InvalidPeriod(period));
    }
    let n = series.len();
    if n < 2 * period {
        return Err(DecompositionError::InsufficientData {
            observed: n,
            required: 2 * period,
        });
    }
    if let Some(idx) = series.values.iter().position(|v| !v.is_finite()) {
        return Err(DecompositionError::NonFiniteInput {
            date: series.date_at(idx),
        });
    }

    let observed = series.values.clone();
    let trend = centered_moving_average(&observed, period);

    let mut phase_sums = vec![0.0; period];
    let mut phase_counts = vec![0usize; period];
    for (idx, (value, trend)) in observed.iter().zip(&trend).enumerate() {
        if let Some(trend) = trend {
            phase_sums[idx % period] += value - trend;
            phase_counts[idx % period] += 1;
        }
    }
    let mut phase_means: Vec<f64> = phase_sums
        .iter()
        .zip(&phase_counts)
        .map(|(sum, &count)| if count > 0 { sum / count as f64 } else { 0.0 })
        .collect();
    let center = phase_means.iter().sum::<f64>() / period as f64;
    for mean in &mut phase_means {
        *mean -= center;
    }

    let seasonal: Vec<f64> = (0..n).map(|idx| phase_means[idx % period]).collect();
    let residual = observed
        .iter()
        .zip(&trend)
        .zip(&seasonal)
        .map(|((value, trend), seasonal)| trend.map(|trend| value - trend - seasonal))
        .collect();

    debug!(
        component = "decompose",
        event = "decompose.entity.finish",
        entity = %series.entity,
        period,
        points = n,
        trend_points = trend.iter().filter(|t| t.is_some()).count()
    );

    Ok(Decomposition {
        entity: series.entity.clone(),
        period,
        start: series.start,
        observed,
        trend,
        seasonal,
        residual,
    })
}

/// Two-sided moving average of width `period`. Even periods use the
/// `2 x period` filter with half weights on both ends so the window stays
/// centered. The first and last `period / 2` positions have no value.
pub fn centered_moving_average(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let half = period / 2;
    let weights: Vec<f64> = if period % 2 == 1 {
        vec![1.0 / period as f64; period]
    } else {
        let mut w = vec![1.0 / period as f64; period + 1];
        w[0] = 0.5 / period as f64;
        w[period] = 0.5 / period as f64;
        w
    };

    let n = values.len();
    (0..n)
        .map(|idx| {
            if idx < half || idx + half >= n {
                return None;
            }
            let window = &values[idx - half..=idx + half];
            Some(window.iter().zip(&weights).map(|(v, w)| v * w).sum())
        })
        .collect()
}
