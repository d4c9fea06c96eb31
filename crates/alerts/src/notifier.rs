//! Alert notifier. Scans analytics output for conditions worth surfacing
//! and delivers one message per hit through an [`AlertSink`].

use std::fmt;
use std::sync::Arc;

use funnel_core::config::AlertConfig;
use funnel_core::types::{AbTestRow, AnomalyRow, FunnelRow};
use funnel_core::AnalyticsResult;
use funnel_reporting::AnalysisReport;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::sink::AlertSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Funnel,
    AbTest,
    Anomaly,
}

impl AlertKind {
    /// Tag written in front of the message by text sinks.
    pub fn prefix(self) -> &'static str {
        match self {
            AlertKind::Funnel => "FUNNEL",
            AlertKind::AbTest => "ABTEST",
            AlertKind::Anomaly => "ANOMALY",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    /// Alert when a transition's drop-off rate is strictly above this.
    pub drop_off_pct: f64,
    /// Alert when a significance test's p-value is strictly below this.
    pub p_value: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            drop_off_pct: 15.0,
            p_value: 0.05,
        }
    }
}

impl AlertThresholds {
    pub fn from_config(config: &AlertConfig) -> Self {
        Self {
            drop_off_pct: config.drop_off_threshold_pct,
            p_value: config.p_value_threshold,
        }
    }
}

/// Number of alerts delivered per kind in one report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub funnel: usize,
    pub ab_test: usize,
    pub anomalies: usize,
}

impl AlertSummary {
    pub fn total(&self) -> usize {
        self.funnel + self.ab_test + self.anomalies
    }
}

// ─── Rendering ──────────────────────────────────────────────────────────────

pub fn funnel_drop_alerts(rows: &[FunnelRow], threshold_pct: f64) -> Vec<Alert> {
    rows.iter()
        .filter(|row| row.drop_off_rate_pct > threshold_pct)
        .map(|row| {
            let segment = if row.group.is_empty() {
                String::new()
            } else {
                let labels: Vec<String> =
                    row.group.iter().map(|(k, v)| format!("{k}={v}")).collect();
                format!(" [{}]", labels.join(", "))
            };
            Alert {
                kind: AlertKind::Funnel,
                message: format!(
                    "Drop detected: {} → {}{}\nUsers at step: {}, Converted: {}\nDrop-off Rate: {:?}%",
                    row.from_step,
                    row.to_step,
                    segment,
                    row.users_at_from_step,
                    row.users_at_to_step,
                    row.drop_off_rate_pct
                ),
            }
        })
        .collect()
}

/// Only significance-test rows are considered; a missing p-value never alerts.
pub fn ab_test_alerts(rows: &[AbTestRow], p_threshold: f64) -> Vec<Alert> {
    rows.iter()
        .filter_map(AbTestRow::as_significance_test)
        .filter_map(|test| {
            let p = test.p_value.filter(|p| *p < p_threshold)?;
            Some(Alert {
                kind: AlertKind::AbTest,
                message: format!(
                    "A/B Test Significant Difference ({} → {}, {} vs {}):\np-value = {}",
                    test.from_step, test.to_step, test.control_group, test.treatment_group, p
                ),
            })
        })
        .collect()
}

pub fn anomaly_alerts(rows: &[AnomalyRow]) -> Vec<Alert> {
    rows.iter()
        .filter(|row| row.is_anomaly)
        .map(|row| Alert {
            kind: AlertKind::Anomaly,
            message: format!(
                "Anomaly Detected on {} ({} → {}):\nConversion: {:?}% | Rolling Avg: {:.2}%\nDeviation: {:.2} ({})",
                row.daily.date.format("%Y-%m-%d"),
                row.daily.from_step,
                row.daily.to_step,
                row.daily.conversion_rate,
                row.rolling_avg,
                row.deviation,
                row.flag
            ),
        })
        .collect()
}

// ─── Delivery ───────────────────────────────────────────────────────────────

pub struct AlertNotifier {
    sink: Arc<dyn AlertSink>,
    thresholds: AlertThresholds,
}

impl AlertNotifier {
    pub fn new(sink: Arc<dyn AlertSink>, thresholds: AlertThresholds) -> Self {
        Self { sink, thresholds }
    }

    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds
    }

    pub fn notify_funnel(&self, rows: &[FunnelRow]) -> AnalyticsResult<usize> {
        self.dispatch(funnel_drop_alerts(rows, self.thresholds.drop_off_pct))
    }

    pub fn notify_ab_test(&self, rows: &[AbTestRow]) -> AnalyticsResult<usize> {
        self.dispatch(ab_test_alerts(rows, self.thresholds.p_value))
    }

    pub fn notify_anomalies(&self, rows: &[AnomalyRow]) -> AnalyticsResult<usize> {
        self.dispatch(anomaly_alerts(rows))
    }

    /// Checks the overall funnel, grouped funnel, A/B results and anomalies of
    /// one report. Stops at the first delivery failure.
    pub fn notify_report(&self, report: &AnalysisReport) -> AnalyticsResult<AlertSummary> {
        let summary = AlertSummary {
            funnel: self.notify_funnel(&report.funnel)?
                + self.notify_funnel(&report.grouped_funnel)?,
            ab_test: self.notify_ab_test(&report.ab_test)?,
            anomalies: self.notify_anomalies(&report.anomalies)?,
        };
        info!(
            run_id = %report.run_id,
            funnel = summary.funnel,
            ab_test = summary.ab_test,
            anomalies = summary.anomalies,
            "Alerts dispatched"
        );
        Ok(summary)
    }

    fn dispatch(&self, alerts: Vec<Alert>) -> AnalyticsResult<usize> {
        for alert in &alerts {
            if let Err(e) = self.sink.deliver(alert) {
                warn!(kind = alert.kind.prefix(), error = %e, "Alert delivery failed");
                metrics::counter!("alerts.failed", "kind" => alert.kind.prefix()).increment(1);
                return Err(e);
            }
            metrics::counter!("alerts.delivered", "kind" => alert.kind.prefix()).increment(1);
        }
        Ok(alerts.len())
    }
}
