//! Funnel analysis: step-to-step user counts with conversion and drop-off
//! rates, overall or partitioned by grouping columns.
//!
//! Counting is by presence: a user counts toward a step if they ever reached
//! it, regardless of when they reached the previous one.

use funnel_core::ingest::EventTable;
use funnel_core::types::{percentage, round_to, FunnelDefinition, FunnelRow, GroupKey};
use funnel_core::AnalyticsResult;
use tracing::debug;

use crate::normalize::{count_reached, normalize, UserJourney, UserStepTable};

pub struct FunnelAnalyzer {
    funnel: FunnelDefinition,
}

impl FunnelAnalyzer {
    pub fn new(funnel: FunnelDefinition) -> Self {
        Self { funnel }
    }

    pub fn funnel(&self) -> &FunnelDefinition {
        &self.funnel
    }

    /// One row per transition across all users.
    pub fn analyze(&self, events: &EventTable) -> AnalyticsResult<Vec<FunnelRow>> {
        let table = normalize(events, &self.funnel, &[])?;
        Ok(conversion_rows(&table))
    }

    /// One row per transition per distinct combination of `group_by` values.
    pub fn analyze_grouped(
        &self,
        events: &EventTable,
        group_by: &[String],
    ) -> AnalyticsResult<Vec<FunnelRow>> {
        let table = normalize(events, &self.funnel, group_by)?;
        Ok(grouped_conversion_rows(&table, group_by))
    }
}

/// Ungrouped funnel over an already-normalized table.
pub fn conversion_rows(table: &UserStepTable) -> Vec<FunnelRow> {
    transition_rows(table.steps(), table.users(), &GroupKey::new())
}

/// Grouped funnel over an already-normalized table. Groups appear in
/// ascending order of their key values.
pub fn grouped_conversion_rows(table: &UserStepTable, group_by: &[String]) -> Vec<FunnelRow> {
    let groups = table.partition(group_by);
    debug!(groups = groups.len(), group_by = ?group_by, "Computing grouped funnel");
    groups
        .into_iter()
        .flat_map(|(key, users)| transition_rows(table.steps(), users, &key))
        .collect()
}

fn transition_rows<'a, I>(steps: &[String], users: I, group: &GroupKey) -> Vec<FunnelRow>
where
    I: IntoIterator<Item = &'a UserJourney>,
    I::IntoIter: Clone,
{
    let users = users.into_iter();
    let reached: Vec<u64> = (0..steps.len())
        .map(|step| count_reached(users.clone(), step))
        .collect();

    steps
        .windows(2)
        .zip(reached.windows(2))
        .map(|(pair, counts)| {
            let (from_count, to_count) = (counts[0], counts[1]);
            let conversion = percentage(to_count, from_count);
            // Both rates are zero when nobody reached the from-step.
            let drop_off = if from_count > 0 { 100.0 - conversion } else { 0.0 };
            FunnelRow {
                from_step: pair[0].clone(),
                to_step: pair[1].clone(),
                users_at_from_step: from_count,
                users_at_to_step: to_count,
                conversion_rate_pct: round_to(conversion, 2),
                drop_off_rate_pct: round_to(drop_off, 2),
                group: group.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use funnel_core::types::EventRecord;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn signup_activate(signups: usize, activations: usize, tier: &str, offset: usize) -> Vec<EventRecord> {
        let mut events = Vec::new();
        for i in 0..signups {
            let user = format!("{tier}-{}", i + offset);
            events.push(EventRecord::new(&user, "signup", ts()).with_attribute("plan_tier", tier));
            if i < activations {
                events.push(EventRecord::new(&user, "activate", ts()).with_attribute("plan_tier", tier));
            }
        }
        events
    }

    fn analyzer() -> FunnelAnalyzer {
        FunnelAnalyzer::new(FunnelDefinition::new(["signup", "activate"]).unwrap())
    }

    #[test]
    fn test_ten_signups_three_activations() {
        let events = EventTable::from_events(signup_activate(10, 3, "free", 0));
        let rows = analyzer().analyze(&events).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].users_at_from_step, 10);
        assert_eq!(rows[0].users_at_to_step, 3);
        assert_eq!(rows[0].conversion_rate_pct, 30.0);
        assert_eq!(rows[0].drop_off_rate_pct, 70.0);
        assert!(rows[0].group.is_empty());
    }

    #[test]
    fn test_duplicate_events_counted_once() {
        let mut events = signup_activate(4, 1, "free", 0);
        events.extend(signup_activate(4, 1, "free", 0));
        let rows = analyzer().analyze(&EventTable::from_events(events)).unwrap();
        assert_eq!(rows[0].users_at_from_step, 4);
        assert_eq!(rows[0].conversion_rate_pct, 25.0);
    }

    #[test]
    fn test_zero_from_count() {
        let funnel = FunnelDefinition::new(["signup", "activate", "purchase"]).unwrap();
        let events = EventTable::from_events(signup_activate(5, 0, "free", 0));
        let rows = FunnelAnalyzer::new(funnel).analyze(&events).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].users_at_from_step, 0);
        assert_eq!(rows[1].conversion_rate_pct, 0.0);
        assert_eq!(rows[1].drop_off_rate_pct, 0.0);
    }

    #[test]
    fn test_presence_counting_ignores_order() {
        // Activation without signup still counts toward the to-step.
        let events = EventTable::from_events(vec![
            EventRecord::new("u1", "signup", ts()),
            EventRecord::new("u2", "activate", ts()),
        ]);
        let rows = analyzer().analyze(&events).unwrap();
        assert_eq!(rows[0].users_at_from_step, 1);
        assert_eq!(rows[0].users_at_to_step, 1);
        assert_eq!(rows[0].conversion_rate_pct, 100.0);
    }

    #[test]
    fn test_grouped_by_plan_tier() {
        let mut events = signup_activate(4, 1, "pro", 0);
        events.extend(signup_activate(3, 2, "free", 100));
        let table = EventTable::from_events(events);
        let rows = analyzer()
            .analyze_grouped(&table, &["plan_tier".to_string()])
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].group["plan_tier"], "free");
        assert_eq!(rows[0].conversion_rate_pct, 66.67);
        assert_eq!(rows[0].drop_off_rate_pct, 33.33);
        assert_eq!(rows[1].group["plan_tier"], "pro");
        assert_eq!(rows[1].conversion_rate_pct, 25.0);
    }

    #[test]
    fn test_rates_sum_to_hundred() {
        let mut events = signup_activate(7, 2, "pro", 0);
        events.extend(signup_activate(9, 5, "free", 100));
        let table = EventTable::from_events(events);
        let rows = analyzer()
            .analyze_grouped(&table, &["plan_tier".to_string()])
            .unwrap();
        for row in rows {
            assert!((row.conversion_rate_pct + row.drop_off_rate_pct - 100.0).abs() < 0.011);
        }
    }

    #[test]
    fn test_grouped_without_columns_matches_overall() {
        let events = EventTable::from_events(signup_activate(6, 4, "pro", 0));
        let pivot = normalize(&events, analyzer().funnel(), &[]).unwrap();
        assert_eq!(grouped_conversion_rows(&pivot, &[]), conversion_rows(&pivot));
    }
}
