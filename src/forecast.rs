//! Per-entity additive forecaster: piecewise-linear trend plus weekly Fourier
//! seasonality, with simulated prediction intervals.
//!
//! The model configuration is fixed: additive seasonality, weekly terms only
//! (yearly and daily cycles cannot be estimated from a few weeks of daily
//! means), a 30-day horizon, and a seeded simulation so repeated runs on the
//! same input produce identical tables.

use std::f64::consts::PI;

use chrono::{Days, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal, Poisson};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::gap_fill::{FilledSeries, MIN_OBSERVED_DAYS};
use crate::linalg::solve_penalized_least_squares;

pub const FORECAST_HORIZON_DAYS: usize = 30;

const WEEKLY_PERIOD_DAYS: f64 = 7.0;
const WEEKLY_FOURIER_ORDER: usize = 3;
const MAX_CHANGEPOINTS: usize = 25;
const CHANGEPOINT_RANGE: f64 = 0.8;
const CHANGEPOINT_PRIOR_SCALE: f64 = 0.05;
const SEASONALITY_PRIOR_SCALE: f64 = 10.0;
const TREND_PRIOR_SCALE: f64 = 5.0;
const INTERVAL_WIDTH: f64 = 0.8;
const UNCERTAINTY_SAMPLES: usize = 1_000;
const UNCERTAINTY_SEED: u64 = 20_240_101;
const FIT_ROUNDS: usize = 4;
const SIGMA_FLOOR: f64 = 1e-3;
const EXCLUDED_PENALTY: f64 = 1e6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRow {
    pub ds: NaiveDate,
    pub trend: f64,
    pub yhat_lower: f64,
    pub yhat_upper: f64,
    pub trend_lower: f64,
    pub trend_upper: f64,
    pub weekly: f64,
    pub additive_terms: f64,
    pub yhat: f64,
}

/// Rows span the fitted history followed by `horizon` future days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub entity: String,
    pub history_len: usize,
    pub horizon: usize,
    pub rows: Vec<ForecastRow>,
}

impl Forecast {
    pub fn future_rows(&self) -> &[ForecastRow] {
        &self.rows[self.history_len.min(self.rows.len())..]
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelFitError {
    #[error("{observed} observed days, at least {required} required")]
    InsufficientData { observed: usize, required: usize },
    #[error("non-finite observation on {date}")]
    NonFiniteInput { date: NaiveDate },
    #[error("normal equations are singular")]
    SingularSystem,
    #[error("non-finite {0} estimate")]
    NonFiniteEstimate(&'static str),
    #[error("uncertainty simulation failed: {0}")]
    Uncertainty(String),
}

/// Seam for per-entity model fitting; implementations must not share
/// mutable state between calls.
pub trait SeriesForecaster: Send + Sync {
    fn name(&self) -> &'static str;
    fn forecast(&self, series: &FilledSeries) -> Result<Forecast, ModelFitError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WeeklyAdditiveForecaster;

impl SeriesForecaster for WeeklyAdditiveForecaster {
    fn name(&self) -> &'static str {
        "weekly_additive"
    }

    fn forecast(&self, series: &FilledSeries) -> Result<Forecast, ModelFitError> {
        let model = FittedModel::fit(series)?;
        let rows = model.predict(series.start, series.len() + FORECAST_HORIZON_DAYS)?;
        debug!(
            component = "forecast",
            event = "forecast.entity.finish",
            entity = %series.entity,
            history_len = series.len(),
            changepoints = model.changepoints.len(),
            sigma_obs = model.sigma_obs
        );
        Ok(Forecast {
            entity: series.entity.clone(),
            history_len: series.len(),
            horizon: FORECAST_HORIZON_DAYS,
            rows,
        })
    }
}

#[derive(Debug, Clone)]
struct FittedModel {
    t_span_days: f64,
    y_scale: f64,
    k: f64,
    m: f64,
    changepoints: Vec<f64>,
    deltas: Vec<f64>,
    beta: Vec<f64>,
    sigma_obs: f64,
}

impl FittedModel {
    fn fit(series: &FilledSeries) -> Result<Self, ModelFitError> {
        if series.observed_days < MIN_OBSERVED_DAYS || series.len() < 2 {
            return Err(ModelFitError::InsufficientData {
                observed: series.observed_days,
                required: MIN_OBSERVED_DAYS,
            });
        }
        if let Some(idx) = series.values.iter().position(|v| !v.is_finite()) {
            return Err(ModelFitError::NonFiniteInput {
                date: series.date_at(idx),
            });
        }

        let n = series.len();
        let t_span_days = (n - 1) as f64;
        let y_scale = match series.values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())) {
            scale if scale > 0.0 => scale,
            _ => 1.0,
        };
        let y: Vec<f64> = series.values.iter().map(|v| v / y_scale).collect();
        let t: Vec<f64> = (0..n).map(|idx| idx as f64 / t_span_days).collect();
        let changepoints = select_changepoints(&t);

        let x: Vec<Vec<f64>> = (0..n)
            .map(|idx| design_row(t[idx], series.date_at(idx), &changepoints))
            .collect();

        let n_cp = changepoints.len();
        let mut sigma = {
            let penalties = penalties(SIGMA_FLOOR, n_cp, Some(EXCLUDED_PENALTY));
            let coef = solve_penalized_least_squares(&x, &y, &penalties)
                .ok_or(ModelFitError::SingularSystem)?;
            residual_sigma(&x, &y, &coef)
        };

        let mut coef = Vec::new();
        for _ in 0..FIT_ROUNDS {
            let penalties = penalties(sigma, n_cp, None);
            coef = solve_penalized_least_squares(&x, &y, &penalties)
                .ok_or(ModelFitError::SingularSystem)?;
            sigma = residual_sigma(&x, &y, &coef);
        }
        if !sigma.is_finite() {
            return Err(ModelFitError::NonFiniteEstimate("sigma_obs"));
        }

        let m = coef[0];
        let k = coef[1];
        let deltas = coef[2..2 + n_cp].to_vec();
        let beta = coef[2 + n_cp..].to_vec();
        if !(m.is_finite() && k.is_finite()) {
            return Err(ModelFitError::NonFiniteEstimate("trend"));
        }

        Ok(Self {
            t_span_days,
            y_scale,
            k,
            m,
            changepoints,
            deltas,
            beta,
            sigma_obs: sigma,
        })
    }

    fn predict(&self, start: NaiveDate, len: usize) -> Result<Vec<ForecastRow>, ModelFitError> {
        let t: Vec<f64> = (0..len).map(|idx| idx as f64 / self.t_span_days).collect();
        let trend: Vec<f64> = t
            .iter()
            .map(|&ti| piecewise_linear(self.k, self.m, &self.changepoints, &self.deltas, ti))
            .collect();
        let weekly: Vec<f64> = (0..len)
            .map(|idx| {
                fourier_terms(start + Days::new(idx as u64))
                    .iter()
                    .zip(&self.beta)
                    .map(|(x, b)| x * b)
                    .sum()
            })
            .collect();

        let (trend_samples, yhat_samples) = self.simulate(&t, &trend, &weekly)?;
        let lower_q = (1.0 - INTERVAL_WIDTH) / 2.0 * 100.0;
        let upper_q = (1.0 + INTERVAL_WIDTH) / 2.0 * 100.0;

        let rows = (0..len)
            .map(|idx| {
                let mut trend_draws = trend_samples[idx].clone();
                let mut yhat_draws = yhat_samples[idx].clone();
                trend_draws.sort_by(f64::total_cmp);
                yhat_draws.sort_by(f64::total_cmp);

                ForecastRow {
                    ds: start + Days::new(idx as u64),
                    trend: trend[idx] * self.y_scale,
                    yhat_lower: percentile(&yhat_draws, lower_q),
                    yhat_upper: percentile(&yhat_draws, upper_q),
                    trend_lower: percentile(&trend_draws, lower_q),
                    trend_upper: percentile(&trend_draws, upper_q),
                    weekly: weekly[idx] * self.y_scale,
                    additive_terms: weekly[idx] * self.y_scale,
                    yhat: (trend[idx] + weekly[idx]) * self.y_scale,
                }
            })
            .collect();
        Ok(rows)
    }

    /// Future trend paths gain new changepoints at the historical rate with
    /// Laplace-distributed rate changes; observation noise is Gaussian.
    /// Returned matrices are indexed `[row][sample]` in data units.
    #[allow(clippy::type_complexity)]
    fn simulate(
        &self,
        t: &[f64],
        trend: &[f64],
        weekly: &[f64],
    ) -> Result<(Vec<Vec<f64>>, Vec<Vec<f64>>), ModelFitError> {
        let mut rng = StdRng::seed_from_u64(UNCERTAINTY_SEED);
        let noise = Normal::new(0.0, self.sigma_obs)
            .map_err(|err| ModelFitError::Uncertainty(err.to_string()))?;

        let t_max = t.iter().copied().fold(1.0_f64, f64::max);
        let future_span = t_max - 1.0;
        let change_rate = self.changepoints.len() as f64 * future_span;
        let laplace_scale =
            self.deltas.iter().map(|d| d.abs()).sum::<f64>() / self.deltas.len().max(1) as f64
                + 1e-8;
        let change_count = if change_rate > 0.0 {
            Some(
                Poisson::new(change_rate)
                    .map_err(|err| ModelFitError::Uncertainty(err.to_string()))?,
            )
        } else {
            None
        };
        let change_size = Exp::new(1.0 / laplace_scale)
            .map_err(|err| ModelFitError::Uncertainty(err.to_string()))?;

        let len = t.len();
        let mut trend_samples = vec![Vec::with_capacity(UNCERTAINTY_SAMPLES); len];
        let mut yhat_samples = vec![Vec::with_capacity(UNCERTAINTY_SAMPLES); len];
        let mut new_changes: Vec<(f64, f64)> = Vec::new();

        for _ in 0..UNCERTAINTY_SAMPLES {
            new_changes.clear();
            if let Some(count_dist) = &change_count {
                let count: f64 = count_dist.sample(&mut rng);
                for _ in 0..count as usize {
                    let at = 1.0 + rng.gen::<f64>() * future_span;
                    let delta = change_size.sample(&mut rng) - change_size.sample(&mut rng);
                    new_changes.push((at, delta));
                }
            }

            for idx in 0..len {
                let extra: f64 = new_changes
                    .iter()
                    .filter(|(at, _)| t[idx] >= *at)
                    .map(|(at, delta)| delta * (t[idx] - at))
                    .sum();
                let trend_draw = trend[idx] + extra;
                let obs_noise = noise.sample(&mut rng);
                trend_samples[idx].push(trend_draw * self.y_scale);
                yhat_samples[idx].push((trend_draw + weekly[idx] + obs_noise) * self.y_scale);
            }
        }

        Ok((trend_samples, yhat_samples))
    }
}

/// Evenly spaced over the first `CHANGEPOINT_RANGE` of the history, never at
/// the very first point.
fn select_changepoints(t: &[f64]) -> Vec<f64> {
    let hist_size = (t.len() as f64 * CHANGEPOINT_RANGE).floor() as usize;
    let count = MAX_CHANGEPOINTS.min(hist_size.saturating_sub(1));
    if count == 0 {
        return Vec::new();
    }
    let last = (hist_size - 1) as f64;
    (1..=count)
        .map(|j| {
            let idx = (j as f64 * last / count as f64).round() as usize;
            t[idx.min(t.len() - 1)]
        })
        .collect()
}

fn design_row(t: f64, date: NaiveDate, changepoints: &[f64]) -> Vec<f64> {
    let mut row = Vec::with_capacity(2 + changepoints.len() + 2 * WEEKLY_FOURIER_ORDER);
    row.push(1.0);
    row.push(t);
    row.extend(changepoints.iter().map(|&s| (t - s).max(0.0)));
    row.extend(fourier_terms(date));
    row
}

/// Phase is anchored on the Unix epoch so a weekday always maps to the same
/// angle regardless of where the series starts.
fn fourier_terms(date: NaiveDate) -> Vec<f64> {
    let days = (date - NaiveDate::default()).num_days() as f64;
    let mut terms = Vec::with_capacity(2 * WEEKLY_FOURIER_ORDER);
    for order in 1..=WEEKLY_FOURIER_ORDER {
        let angle = 2.0 * PI * order as f64 * days / WEEKLY_PERIOD_DAYS;
        terms.push(angle.sin());
        terms.push(angle.cos());
    }
    terms
}

fn piecewise_linear(k: f64, m: f64, changepoints: &[f64], deltas: &[f64], t: f64) -> f64 {
    let bends: f64 = changepoints
        .iter()
        .zip(deltas)
        .filter(|(s, _)| t >= **s)
        .map(|(s, d)| d * (t - s))
        .sum();
    k * t + m + bends
}

/// Gaussian priors expressed as ridge penalties `sigma² / scale²`.
fn penalties(sigma: f64, n_changepoints: usize, changepoint_override: Option<f64>) -> Vec<f64> {
    let var = sigma.max(SIGMA_FLOOR).powi(2);
    let mut out = vec![var / TREND_PRIOR_SCALE.powi(2); 2];
    let cp_penalty =
        changepoint_override.unwrap_or(var / CHANGEPOINT_PRIOR_SCALE.powi(2));
    out.extend(std::iter::repeat(cp_penalty).take(n_changepoints));
    out.extend(
        std::iter::repeat(var / SEASONALITY_PRIOR_SCALE.powi(2)).take(2 * WEEKLY_FOURIER_ORDER),
    );
    out
}

fn residual_sigma(x: &[Vec<f64>], y: &[f64], coef: &[f64]) -> f64 {
    let sse: f64 = x
        .iter()
        .zip(y)
        .map(|(row, target)| {
            let fitted: f64 = row.iter().zip(coef).map(|(a, b)| a * b).sum();
            (target - fitted).powi(2)
        })
        .sum();
    (sse / y.len().max(1) as f64).sqrt().max(SIGMA_FLOOR)
}

/// Linear interpolation between closest ranks; `sorted` must be ascending.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn series(values: Vec<f64>) -> FilledSeries {
        FilledSeries {
            entity: "Delhi".to_string(),
            // Monday.
            start: NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            observed_days: values.len(),
            values,
            filled_ranges: Vec::new(),
        }
    }

    fn weekly_pattern(days: usize) -> Vec<f64> {
        let start = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        (0..days)
            .map(|d| {
                let date = start + Days::new(d as u64);
                if date.weekday().number_from_monday() <= 5 {
                    80.0
                } else {
                    64.0
                }
            })
            .collect()
    }

    #[test]
    fn output_spans_history_plus_horizon() {
        let input = series(weekly_pattern(30));
        let forecast = WeeklyAdditiveForecaster.forecast(&input).unwrap();

        assert_eq!(forecast.rows.len(), 30 + FORECAST_HORIZON_DAYS);
        assert_eq!(forecast.rows[0].ds, input.start);
        assert_eq!(
            forecast.rows.last().unwrap().ds,
            input.end() + Days::new(FORECAST_HORIZON_DAYS as u64)
        );
        assert_eq!(forecast.future_rows().len(), FORECAST_HORIZON_DAYS);
        assert_eq!(forecast.future_rows()[0].ds, input.end() + Days::new(1));
    }

    #[test]
    fn fitted_values_track_a_clean_weekly_cycle() {
        let values = weekly_pattern(28);
        let forecast = WeeklyAdditiveForecaster.forecast(&series(values.clone())).unwrap();

        for (row, observed) in forecast.rows.iter().zip(&values) {
            assert!((row.yhat - observed).abs() < 1.0, "{row:?} vs {observed}");
        }
        let future_weekday = &forecast.future_rows()[0];
        assert!((future_weekday.yhat - 80.0).abs() < 2.0);
    }

    #[test]
    fn intervals_bracket_point_forecast() {
        let mut values = weekly_pattern(35);
        for (idx, value) in values.iter_mut().enumerate() {
            *value += ((idx * 7919) % 13) as f64 - 6.0;
        }
        let forecast = WeeklyAdditiveForecaster.forecast(&series(values)).unwrap();

        for row in &forecast.rows {
            assert!(row.yhat_lower <= row.yhat && row.yhat <= row.yhat_upper, "{row:?}");
            assert!(row.trend_lower <= row.trend_upper);
        }
    }

    #[test]
    fn repeated_fits_are_identical() {
        let input = series(weekly_pattern(21));
        let a = WeeklyAdditiveForecaster.forecast(&input).unwrap();
        let b = WeeklyAdditiveForecaster.forecast(&input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_finite_history_is_a_fit_error() {
        let mut values = weekly_pattern(20);
        values[3] = f64::NAN;
        let err = WeeklyAdditiveForecaster.forecast(&series(values)).unwrap_err();
        assert_eq!(
            err,
            ModelFitError::NonFiniteInput {
                date: NaiveDate::from_ymd_opt(2025, 1, 9).unwrap(),
            }
        );
    }

    #[test]
    fn short_history_is_rejected() {
        let err = WeeklyAdditiveForecaster
            .forecast(&series(weekly_pattern(10)))
            .unwrap_err();
        assert_eq!(
            err,
            ModelFitError::InsufficientData {
                observed: 10,
                required: MIN_OBSERVED_DAYS,
            }
        );
    }

    #[test]
    fn changepoints_stay_inside_the_first_eighty_percent() {
        let t: Vec<f64> = (0..30).map(|i| i as f64 / 29.0).collect();
        let cps = select_changepoints(&t);
        assert_eq!(cps.len(), 23);
        assert!(cps.iter().all(|&s| s > 0.0 && s <= t[23]));
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 50.0), 3.0);
        assert!((percentile(&sorted, 10.0) - 1.4).abs() < 1e-12);
    }
}
