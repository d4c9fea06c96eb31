//! Report pipeline. Runs every funnel analysis over one event table and
//! collects the results into a single [`AnalysisReport`].
//!
//! Each run recomputes everything from the supplied table; nothing is
//! carried between runs.

use chrono::{DateTime, Utc};
use funnel_core::config::AppConfig;
use funnel_core::ingest::EventTable;
use funnel_core::types::{AbTestRow, AnomalyRow, DailyConversion, FunnelDefinition, FunnelRow};
use funnel_core::AnalyticsResult;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::anomaly::AnomalyDetector;
use crate::daily::daily_conversion;
use crate::funnel::{conversion_rows, grouped_conversion_rows};
use crate::normalize::normalize;
use crate::significance::AbTester;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub funnel_steps: Vec<String>,
    pub funnel: Vec<FunnelRow>,
    pub group_by: Vec<String>,
    pub grouped_funnel: Vec<FunnelRow>,
    /// Empty when the experiment is disabled or the log has no group column.
    pub ab_test: Vec<AbTestRow>,
    pub daily: Vec<DailyConversion>,
    pub anomalies: Vec<AnomalyRow>,
}

impl AnalysisReport {
    pub fn flagged_anomalies(&self) -> impl Iterator<Item = &AnomalyRow> {
        self.anomalies.iter().filter(|a| a.is_anomaly)
    }
}

pub struct ReportPipeline {
    funnel: FunnelDefinition,
    group_by: Vec<String>,
    ab_tester: Option<AbTester>,
    detector: AnomalyDetector,
}

impl ReportPipeline {
    pub fn new(funnel: FunnelDefinition) -> Self {
        Self {
            funnel,
            group_by: Vec::new(),
            ab_tester: None,
            detector: AnomalyDetector::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> AnalyticsResult<Self> {
        config.validate()?;
        let funnel = FunnelDefinition::new(config.funnel.steps.clone())?;
        let mut pipeline = Self::new(funnel)
            .with_group_by(config.funnel.group_by.clone())
            .with_detector(AnomalyDetector::from_config(&config.anomaly)?);
        if config.experiment.enabled {
            pipeline = pipeline.with_ab_tester(AbTester::from_config(&config.experiment));
        }
        Ok(pipeline)
    }

    pub fn with_group_by(mut self, group_by: Vec<String>) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn with_ab_tester(mut self, tester: AbTester) -> Self {
        self.ab_tester = Some(tester);
        self
    }

    pub fn with_detector(mut self, detector: AnomalyDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn funnel(&self) -> &FunnelDefinition {
        &self.funnel
    }

    pub fn run(&self, events: &EventTable) -> AnalyticsResult<AnalysisReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("analysis_run", run_id = %run_id);
        let _enter = span.enter();

        let ab_tester = self.ab_tester.as_ref().filter(|tester| {
            let present = events.has_column(tester.group_column());
            if !present {
                warn!(
                    column = tester.group_column(),
                    "Experiment group column not in event log, skipping A/B test"
                );
            }
            present
        });

        let mut columns = self.group_by.clone();
        if let Some(tester) = ab_tester {
            if !columns.iter().any(|c| c == tester.group_column()) {
                columns.push(tester.group_column().to_string());
            }
        }
        let table = normalize(events, &self.funnel, &columns)?;

        let funnel = conversion_rows(&table);
        let grouped_funnel = if self.group_by.is_empty() {
            Vec::new()
        } else {
            grouped_conversion_rows(&table, &self.group_by)
        };
        let ab_test = ab_tester.map(|t| t.evaluate(&table)).unwrap_or_default();
        let daily = daily_conversion(events, &self.funnel);
        let anomalies = self.detector.detect(&daily);

        let report = AnalysisReport {
            run_id,
            generated_at: Utc::now(),
            funnel_steps: self.funnel.steps().to_vec(),
            funnel,
            group_by: self.group_by.clone(),
            grouped_funnel,
            ab_test,
            daily,
            anomalies,
        };

        info!(
            events = events.len(),
            users = table.users().len(),
            transitions = report.funnel.len(),
            grouped_rows = report.grouped_funnel.len(),
            ab_rows = report.ab_test.len(),
            days = report.daily.len() / report.funnel.len().max(1),
            anomalies = report.flagged_anomalies().count(),
            "Analysis run complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use funnel_core::types::EventRecord;
    use funnel_core::AnalyticsError;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 4, day)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn config(steps: &[&str]) -> AppConfig {
        let mut config = AppConfig::default();
        config.funnel.steps = steps.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn test_from_config_rejects_short_funnel() {
        let err = ReportPipeline::from_config(&config(&["signup"])).err().unwrap();
        assert!(matches!(err, AnalyticsError::InvalidFunnel(_)));
    }

    #[test]
    fn test_skips_ab_without_group_column() {
        let events = EventTable::from_events(vec![
            EventRecord::new("u1", "signup", at(1)),
            EventRecord::new("u1", "activate", at(1)),
        ]);
        let pipeline = ReportPipeline::from_config(&config(&["signup", "activate"])).unwrap();
        let report = pipeline.run(&events).unwrap();
        assert!(report.ab_test.is_empty());
        assert_eq!(report.funnel.len(), 1);
        assert_eq!(report.funnel[0].conversion_rate_pct, 100.0);
        assert_eq!(report.daily.len(), 1);
        assert_eq!(report.anomalies.len(), 1);
    }

    #[test]
    fn test_missing_group_by_column_is_fatal() {
        let events = EventTable::from_events(vec![EventRecord::new("u1", "signup", at(1))]);
        let mut config = config(&["signup", "activate"]);
        config.funnel.group_by = vec!["plan_tier".into()];
        let pipeline = ReportPipeline::from_config(&config).unwrap();
        assert!(matches!(
            pipeline.run(&events),
            Err(AnalyticsError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_group_by_and_experiment_share_column() {
        let events = EventTable::from_events(vec![
            EventRecord::new("u1", "signup", at(1)).with_attribute("ab_group", "A"),
            EventRecord::new("u2", "signup", at(1)).with_attribute("ab_group", "B"),
            EventRecord::new("u2", "activate", at(1)).with_attribute("ab_group", "B"),
        ]);
        let mut config = config(&["signup", "activate"]);
        config.funnel.group_by = vec!["ab_group".into()];
        let report = ReportPipeline::from_config(&config).unwrap().run(&events).unwrap();

        assert_eq!(report.grouped_funnel.len(), 2);
        assert_eq!(report.ab_test.len(), 3);
        let test = report.ab_test[2].as_significance_test().unwrap();
        assert_eq!(test.users_at_from_step, 2);
        assert_eq!(test.users_converted, 1);
    }
}
