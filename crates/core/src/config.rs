use std::path::Path;

use serde::Deserialize;

use crate::error::{AnalyticsError, AnalyticsResult};

/// Root application configuration. Loaded from an optional config file and
/// environment variables with the prefix `FUNNEL_WATCH__`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub funnel: FunnelConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunnelConfig {
    /// Ordered funnel step names.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Metadata columns to partition the grouped funnel by.
    #[serde(default)]
    pub group_by: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_experiment_enabled")]
    pub enabled: bool,
    #[serde(default = "default_group_column")]
    pub group_column: String,
    #[serde(default = "default_control_group")]
    pub control_group: String,
    #[serde(default = "default_treatment_group")]
    pub treatment_group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    /// Number of most recent observations in the rolling baseline.
    #[serde(default = "default_anomaly_window")]
    pub window: usize,
    /// Deviation (percentage points) beyond which a day is flagged.
    #[serde(default = "default_anomaly_threshold")]
    pub threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_alerts_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_drop_off_threshold_pct")]
    pub drop_off_threshold_pct: f64,
    #[serde(default = "default_p_value_threshold")]
    pub p_value_threshold: f64,
}

// Default functions
fn default_experiment_enabled() -> bool {
    true
}
fn default_group_column() -> String {
    "ab_group".to_string()
}
fn default_control_group() -> String {
    "A".to_string()
}
fn default_treatment_group() -> String {
    "B".to_string()
}
fn default_anomaly_window() -> usize {
    7
}
fn default_anomaly_threshold() -> f64 {
    12.0
}
fn default_alerts_enabled() -> bool {
    true
}
fn default_log_dir() -> String {
    "alerts".to_string()
}
fn default_drop_off_threshold_pct() -> f64 {
    15.0
}
fn default_p_value_threshold() -> f64 {
    0.05
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            enabled: default_experiment_enabled(),
            group_column: default_group_column(),
            control_group: default_control_group(),
            treatment_group: default_treatment_group(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window: default_anomaly_window(),
            threshold: default_anomaly_threshold(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: default_alerts_enabled(),
            log_dir: default_log_dir(),
            drop_off_threshold_pct: default_drop_off_threshold_pct(),
            p_value_threshold: default_p_value_threshold(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file, then environment
    /// variables (which take precedence).
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FUNNEL_WATCH")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("funnel.steps")
                .with_list_parse_key("funnel.group_by"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject settings the analytics engine cannot run with.
    pub fn validate(&self) -> AnalyticsResult<()> {
        if self.anomaly.window == 0 {
            return Err(AnalyticsError::Config(
                "anomaly.window must be at least 1".into(),
            ));
        }
        if self.anomaly.threshold.is_nan() || self.anomaly.threshold < 0.0 {
            return Err(AnalyticsError::Config(format!(
                "anomaly.threshold must be non-negative, got {}",
                self.anomaly.threshold
            )));
        }
        if self.alerts.drop_off_threshold_pct.is_nan() || self.alerts.drop_off_threshold_pct < 0.0 {
            return Err(AnalyticsError::Config(format!(
                "alerts.drop_off_threshold_pct must be non-negative, got {}",
                self.alerts.drop_off_threshold_pct
            )));
        }
        let p = self.alerts.p_value_threshold;
        if !(p > 0.0 && p <= 1.0) {
            return Err(AnalyticsError::Config(format!(
                "alerts.p_value_threshold must be in (0, 1], got {p}"
            )));
        }
        if self.experiment.control_group == self.experiment.treatment_group {
            return Err(AnalyticsError::Config(format!(
                "experiment groups must differ, both are {:?}",
                self.experiment.control_group
            )));
        }
        Ok(())
    }
}
