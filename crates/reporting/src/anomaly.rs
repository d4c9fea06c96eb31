//! Anomaly detection on daily conversion series. Flags days whose rate
//! strays from a trailing rolling mean by more than a fixed threshold.
//!
//! The window counts observations, not calendar days: gaps in the date
//! sequence are not filled, and the current day is part of its own window.

use std::collections::VecDeque;

use funnel_core::config::AnomalyConfig;
use funnel_core::types::{AnomalyFlag, AnomalyRow, DailyConversion, Transition};
use funnel_core::{AnalyticsError, AnalyticsResult};
use tracing::debug;

pub const DEFAULT_WINDOW: usize = 7;
pub const DEFAULT_THRESHOLD: f64 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyDetector {
    window: usize,
    threshold: f64,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl AnomalyDetector {
    pub fn new(window: usize, threshold: f64) -> AnalyticsResult<Self> {
        if window == 0 {
            return Err(AnalyticsError::Config(
                "rolling window must hold at least one observation".into(),
            ));
        }
        if threshold.is_nan() || threshold < 0.0 {
            return Err(AnalyticsError::Config(format!(
                "anomaly threshold must be non-negative, got {threshold}"
            )));
        }
        Ok(Self { window, threshold })
    }

    pub fn from_config(config: &AnomalyConfig) -> AnalyticsResult<Self> {
        Self::new(config.window, config.threshold)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score every row of `series`. Transitions are handled independently and
    /// emitted in order of first appearance, each sorted by date.
    pub fn detect(&self, series: &[DailyConversion]) -> Vec<AnomalyRow> {
        let mut by_transition: Vec<(Transition, Vec<&DailyConversion>)> = Vec::new();
        for row in series {
            let transition = row.transition();
            match by_transition.iter_mut().find(|(t, _)| *t == transition) {
                Some((_, rows)) => rows.push(row),
                None => by_transition.push((transition, vec![row])),
            }
        }

        let mut scored = Vec::with_capacity(series.len());
        for (transition, mut rows) in by_transition {
            rows.sort_by_key(|r| r.date);
            let before = scored.len();
            self.score_series(&rows, &mut scored);
            let flagged = scored[before..].iter().filter(|r| r.is_anomaly).count();
            debug!(
                transition = %transition,
                days = rows.len(),
                flagged,
                "Scored conversion series"
            );
        }
        scored
    }

    fn score_series(&self, rows: &[&DailyConversion], out: &mut Vec<AnomalyRow>) {
        let mut window: VecDeque<f64> = VecDeque::with_capacity(self.window);
        for row in rows {
            if window.len() == self.window {
                window.pop_front();
            }
            window.push_back(row.conversion_rate);

            let rolling_avg = window.iter().sum::<f64>() / window.len() as f64;
            let deviation = row.conversion_rate - rolling_avg;
            let flag = self.classify(deviation);

            out.push(AnomalyRow {
                daily: (*row).clone(),
                rolling_avg,
                deviation,
                is_anomaly: flag.is_flagged(),
                flag,
            });
        }
    }

    fn classify(&self, deviation: f64) -> AnomalyFlag {
        if deviation > self.threshold {
            AnomalyFlag::Spike
        } else if deviation < -self.threshold {
            AnomalyFlag::Drop
        } else {
            AnomalyFlag::None
        }
    }
}
