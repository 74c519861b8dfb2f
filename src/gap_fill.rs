//! Calendar reindexing and linear gap interpolation for one entity.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::measurements::DailySeries;

/// Entities observed on fewer distinct days are left out of both the
/// decomposition and the forecast.
pub const MIN_OBSERVED_DAYS: usize = 14;

/// A daily series with one value for every calendar day from `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledSeries {
    pub entity: String,
    pub start: NaiveDate,
    pub values: Vec<f64>,
    pub observed_days: usize,
    /// Inclusive `(first, last)` date ranges that were interpolated.
    pub filled_ranges: Vec<(NaiveDate, NaiveDate)>,
}

impl FilledSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn end(&self) -> NaiveDate {
        self.date_at(self.values.len().saturating_sub(1))
    }

    pub fn date_at(&self, index: usize) -> NaiveDate {
        self.start + Days::new(index as u64)
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        (0..self.values.len()).map(|idx| self.date_at(idx))
    }

    pub fn interpolated_days(&self) -> usize {
        self.len() - self.observed_days
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeriesError {
    #[error("{entity}: {observed} observed days, at least {required} required")]
    InsufficientData {
        entity: String,
        observed: usize,
        required: usize,
    },
}

/// Applies the minimum-length policy, then reindexes onto a contiguous
/// calendar and interpolates the missing days.
pub fn fill_daily_gaps(series: &DailySeries) -> Result<FilledSeries, SeriesError> {
    let observed = series.observed_days();
    if observed < MIN_OBSERVED_DAYS {
        return Err(SeriesError::InsufficientData {
            entity: series.entity.clone(),
            observed,
            required: MIN_OBSERVED_DAYS,
        });
    }

    let (start, slots) = reindex_to_calendar(series);
    let filled_ranges = missing_ranges(start, &slots);
    let values = interpolate_linear(&slots);

    debug!(
        component = "gap_fill",
        event = "gap_fill.entity.filled",
        entity = %series.entity,
        observed_days = observed,
        calendar_days = values.len(),
        filled_ranges = filled_ranges.len()
    );

    Ok(FilledSeries {
        entity: series.entity.clone(),
        start,
        values,
        observed_days: observed,
        filled_ranges,
    })
}

/// One slot per calendar day between the first and last observation; days
/// without an observation are `None`. `series.points` must be non-empty.
pub fn reindex_to_calendar(series: &DailySeries) -> (NaiveDate, Vec<Option<f64>>) {
    let Some(start) = series.first_date() else {
        return (NaiveDate::MIN, Vec::new());
    };
    let end = series.last_date().unwrap_or(start);
    let span = (end - start).num_days().max(0) as usize + 1;

    let mut slots = vec![None; span];
    for point in &series.points {
        let offset = (point.date - start).num_days();
        if let Ok(offset) = usize::try_from(offset) {
            if offset < span {
                slots[offset] = Some(point.value);
            }
        }
    }
    (start, slots)
}

/// Fills interior gaps on the straight line between the nearest known
/// neighbours. Leading gaps take the first known value and trailing gaps the
/// last one; an all-empty input yields NaN.
pub fn interpolate_linear(slots: &[Option<f64>]) -> Vec<f64> {
    let known: Vec<(usize, f64)> = slots
        .iter()
        .enumerate()
        .filter_map(|(idx, slot)| slot.map(|value| (idx, value)))
        .collect();

    let Some(&(first_idx, first_value)) = known.first() else {
        return vec![f64::NAN; slots.len()];
    };
    let &(last_idx, last_value) = known.last().unwrap_or(&(first_idx, first_value));

    let mut out = vec![0.0; slots.len()];
    for value in out.iter_mut().take(first_idx) {
        *value = first_value;
    }
    for value in out.iter_mut().skip(last_idx + 1) {
        *value = last_value;
    }
    for pair in known.windows(2) {
        let (left_idx, left) = pair[0];
        let (right_idx, right) = pair[1];
        let width = (right_idx - left_idx) as f64;
        for idx in left_idx..=right_idx {
            let frac = (idx - left_idx) as f64 / width;
            out[idx] = left + (right - left) * frac;
        }
    }
    if known.len() == 1 {
        out[first_idx] = first_value;
    }
    out
}

fn missing_ranges(start: NaiveDate, slots: &[Option<f64>]) -> Vec<(NaiveDate, NaiveDate)> {
    let mut ranges = Vec::new();
    let mut open: Option<usize> = None;
    for (idx, slot) in slots.iter().enumerate() {
        match (slot, open) {
            (None, None) => open = Some(idx),
            (Some(_), Some(from)) => {
                ranges.push((start + Days::new(from as u64), start + Days::new(idx as u64 - 1)));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(from) = open {
        ranges.push((
            start + Days::new(from as u64),
            start + Days::new(slots.len() as u64 - 1),
        ));
    }
    ranges
}
