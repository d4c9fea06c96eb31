//! A/B significance testing: per-group conversion on every funnel transition
//! plus a pooled two-proportion z-test between two designated groups.
//!
//! The p-value is reported, not judged: callers compare it against their own
//! threshold.

use funnel_core::config::ExperimentConfig;
use funnel_core::ingest::EventTable;
use funnel_core::types::{
    percentage, round_to, AbTestRow, FunnelDefinition, GroupConversion, SignificanceTest,
};
use funnel_core::AnalyticsResult;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::normalize::{count_reached, normalize, UserJourney, UserStepTable};

/// The two group labels compared by the significance test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonGroups {
    pub control: String,
    pub treatment: String,
}

impl Default for ComparisonGroups {
    fn default() -> Self {
        Self {
            control: "A".into(),
            treatment: "B".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZTest {
    pub z_statistic: f64,
    /// Two-sided.
    pub p_value: f64,
}

pub struct AbTester {
    group_column: String,
    groups: ComparisonGroups,
}

impl AbTester {
    pub fn new(group_column: impl Into<String>, groups: ComparisonGroups) -> Self {
        Self {
            group_column: group_column.into(),
            groups,
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(
            config.group_column.clone(),
            ComparisonGroups {
                control: config.control_group.clone(),
                treatment: config.treatment_group.clone(),
            },
        )
    }

    pub fn group_column(&self) -> &str {
        &self.group_column
    }

    pub fn groups(&self) -> &ComparisonGroups {
        &self.groups
    }

    pub fn run(
        &self,
        events: &EventTable,
        funnel: &FunnelDefinition,
    ) -> AnalyticsResult<Vec<AbTestRow>> {
        let columns = [self.group_column.clone()];
        let table = normalize(events, funnel, &columns)?;
        Ok(self.evaluate(&table))
    }

    /// Per transition: one row per group (ascending label order), followed
    /// by the significance-test row. The table must carry the group column.
    pub fn evaluate(&self, table: &UserStepTable) -> Vec<AbTestRow> {
        let columns = [self.group_column.clone()];
        let groups: Vec<(String, Vec<&UserJourney>)> = table
            .partition(&columns)
            .into_iter()
            .filter_map(|(mut key, users)| key.remove(&self.group_column).map(|g| (g, users)))
            .collect();

        let mut rows = Vec::new();
        for (from_idx, pair) in table.steps().windows(2).enumerate() {
            let to_idx = from_idx + 1;
            let (from_step, to_step) = (&pair[0], &pair[1]);

            let mut control = (0u64, 0u64);
            let mut treatment = (0u64, 0u64);
            for (group, users) in &groups {
                let total = count_reached(users.iter().copied(), from_idx);
                let converted = count_reached(users.iter().copied(), to_idx);
                if *group == self.groups.control {
                    control = (converted, total);
                } else if *group == self.groups.treatment {
                    treatment = (converted, total);
                }
                rows.push(AbTestRow::Group(GroupConversion {
                    group: group.clone(),
                    from_step: from_step.clone(),
                    to_step: to_step.clone(),
                    users_at_from_step: total,
                    users_converted: converted,
                    conversion_rate_pct: round_to(percentage(converted, total), 2),
                }));
            }

            let test = two_proportion_z_test(control.0, control.1, treatment.0, treatment.1);
            debug!(
                from_step = %from_step,
                to_step = %to_step,
                control = ?control,
                treatment = ?treatment,
                p_value = ?test.map(|t| t.p_value),
                "Two-proportion z-test"
            );
            rows.push(AbTestRow::SignificanceTest(SignificanceTest {
                control_group: self.groups.control.clone(),
                treatment_group: self.groups.treatment.clone(),
                from_step: from_step.clone(),
                to_step: to_step.clone(),
                users_at_from_step: control.1 + treatment.1,
                users_converted: control.0 + treatment.0,
                p_value: test.map(|t| round_to(t.p_value, 4)),
            }));
        }
        rows
    }
}

/// Pooled two-proportion z-test of `x1/n1` against `x2/n2`.
///
/// Returns `None` when either sample is empty, or when the pooled variance
/// is undefined because conversions exceed the sample. Identical all-or-none
/// proportions give `z = 0, p = 1`.
pub fn two_proportion_z_test(x1: u64, n1: u64, x2: u64, n2: u64) -> Option<ZTest> {
    if n1 == 0 || n2 == 0 {
        return None;
    }
    let p1 = x1 as f64 / n1 as f64;
    let p2 = x2 as f64 / n2 as f64;
    let p = (x1 + x2) as f64 / (n1 + n2) as f64;
    let variance = p * (1.0 - p) * (1.0 / n1 as f64 + 1.0 / n2 as f64);
    if variance < 0.0 || !variance.is_finite() {
        return None;
    }
    if variance == 0.0 {
        return Some(ZTest {
            z_statistic: 0.0,
            p_value: 1.0,
        });
    }
    let z = (p1 - p2) / variance.sqrt();
    Some(ZTest {
        z_statistic: z,
        p_value: (2.0 * normal_upper_tail(z.abs())).min(1.0),
    })
}

/// P(Z > z) for z >= 0 (Abramowitz & Stegun 26.2.17, |error| < 7.5e-8).
fn normal_upper_tail(z: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let density = 0.398_942_280_401_432_7 * (-z * z / 2.0).exp();
    density
        * (t * (0.319_381_530
            + t * (-0.356_563_782 + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429)))))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use funnel_core::types::{EventRecord, SIGNIFICANCE_TEST_LABEL};

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn arm(group: &str, in_step: usize, converted: usize) -> Vec<EventRecord> {
        let mut events = Vec::new();
        for i in 0..in_step {
            let user = format!("{group}-{i}");
            events.push(EventRecord::new(&user, "signup", ts()).with_attribute("ab_group", group));
            if i < converted {
                events.push(EventRecord::new(&user, "activate", ts()).with_attribute("ab_group", group));
            }
        }
        events
    }

    fn funnel() -> FunnelDefinition {
        FunnelDefinition::new(["signup", "activate"]).unwrap()
    }

    #[test]
    fn test_z_test_known_value() {
        let test = two_proportion_z_test(40, 100, 60, 100).unwrap();
        assert!((test.z_statistic + 2.828_427).abs() < 1e-5);
        assert!((test.p_value - 0.004_678).abs() < 1e-5);
    }

    #[test]
    fn test_z_test_empty_sample() {
        assert!(two_proportion_z_test(0, 0, 5, 10).is_none());
        assert!(two_proportion_z_test(5, 10, 0, 0).is_none());
    }

    #[test]
    fn test_z_test_degenerate_variance() {
        let test = two_proportion_z_test(10, 10, 20, 20).unwrap();
        assert_eq!(test.p_value, 1.0);
        let test = two_proportion_z_test(0, 10, 0, 20).unwrap();
        assert_eq!(test.z_statistic, 0.0);
    }

    #[test]
    fn test_equal_rates_not_significant() {
        let test = two_proportion_z_test(30, 100, 30, 100).unwrap();
        assert!((test.p_value - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ab_forty_vs_sixty() {
        let mut events = arm("A", 100, 40);
        events.extend(arm("B", 100, 60));
        let table = EventTable::from_events(events);
        let rows = AbTester::new("ab_group", ComparisonGroups::default())
            .run(&table, &funnel())
            .unwrap();

        assert_eq!(rows.len(), 3);
        match (&rows[0], &rows[1]) {
            (AbTestRow::Group(a), AbTestRow::Group(b)) => {
                assert_eq!(a.group, "A");
                assert_eq!(a.conversion_rate_pct, 40.0);
                assert_eq!(b.group, "B");
                assert_eq!(b.conversion_rate_pct, 60.0);
            }
            other => panic!("unexpected rows: {other:?}"),
        }

        let test = rows[2].as_significance_test().unwrap();
        assert_eq!(rows[2].group(), SIGNIFICANCE_TEST_LABEL);
        assert_eq!(test.users_at_from_step, 200);
        assert_eq!(test.users_converted, 100);
        assert_eq!(test.p_value, Some(0.0047));
    }

    #[test]
    fn test_result_table_labels_test_row() {
        let mut events = arm("A", 100, 40);
        events.extend(arm("B", 100, 60));
        let rows = AbTester::new("ab_group", ComparisonGroups::default())
            .run(&EventTable::from_events(events), &funnel())
            .unwrap();

        let json = serde_json::to_value(&rows).unwrap();
        assert_eq!(json[0]["group"], "A");
        assert_eq!(json[1]["group"], "B");
        assert_eq!(json[2]["group"], "significance-test");
        assert_eq!(json[2]["from_step"], "signup");
        assert_eq!(json[2]["users_at_from_step"], 200);
        assert_eq!(json[2]["users_converted"], 100);
        assert_eq!(json[2]["p_value"], 0.0047);
    }

    #[test]
    fn test_missing_treatment_group_gives_null_p_value() {
        let mut events = arm("A", 20, 5);
        events.extend(arm("C", 10, 5));
        let table = EventTable::from_events(events);
        let rows = AbTester::new("ab_group", ComparisonGroups::default())
            .run(&table, &funnel())
            .unwrap();

        // A, C, then the test row.
        assert_eq!(rows.len(), 3);
        let test = rows[2].as_significance_test().unwrap();
        assert_eq!(test.p_value, None);
        assert_eq!(test.users_at_from_step, 20);
        assert_eq!(test.users_converted, 5);
    }

    #[test]
    fn test_custom_comparison_groups() {
        let mut events = arm("control", 50, 10);
        events.extend(arm("variant", 50, 25));
        let table = EventTable::from_events(events);
        let tester = AbTester::new(
            "ab_group",
            ComparisonGroups {
                control: "control".into(),
                treatment: "variant".into(),
            },
        );
        let rows = tester.run(&table, &funnel()).unwrap();
        let test = rows[2].as_significance_test().unwrap();
        assert_eq!(test.control_group, "control");
        assert!(test.p_value.unwrap() < 0.05);
    }

    #[test]
    fn test_group_counts_sum_to_overall() {
        let mut events = arm("A", 30, 12);
        events.extend(arm("B", 25, 20));
        events.extend(arm("C", 5, 1));
        let table = EventTable::from_events(events);
        let rows = AbTester::new("ab_group", ComparisonGroups::default())
            .run(&table, &funnel())
            .unwrap();

        let (total, converted) = rows
            .iter()
            .filter_map(|r| match r {
                AbTestRow::Group(g) => Some((g.users_at_from_step, g.users_converted)),
                AbTestRow::SignificanceTest(_) => None,
            })
            .fold((0, 0), |acc, (t, c)| (acc.0 + t, acc.1 + c));

        let overall = crate::funnel::FunnelAnalyzer::new(funnel())
            .analyze(&table)
            .unwrap();
        assert_eq!(total, overall[0].users_at_from_step);
        assert_eq!(converted, overall[0].users_at_to_step);
    }
}
