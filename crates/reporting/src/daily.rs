//! Daily conversion series: per-date step activity for each transition.
//!
//! Each step is counted on the date its (deduplicated) event happened, so a
//! day's rate compares that day's from-step volume with that day's to-step
//! volume rather than following individual users across days.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use funnel_core::ingest::EventTable;
use funnel_core::types::{percentage, round_to, DailyConversion, FunnelDefinition};
use tracing::debug;

use crate::normalize::deduplicate;

/// Build the series for every transition, covering every date present in the
/// deduplicated event log (funnel steps or not). Rows are grouped by
/// transition in funnel order, dates ascending within each.
pub fn daily_conversion(events: &EventTable, funnel: &FunnelDefinition) -> Vec<DailyConversion> {
    let deduped = deduplicate(events.events());

    let dates: BTreeSet<NaiveDate> = deduped.iter().map(|e| e.event_date()).collect();

    let mut users_by_step_date: HashMap<(&str, NaiveDate), HashSet<&str>> = HashMap::new();
    for event in deduped.iter().filter(|e| funnel.contains(&e.event_name)) {
        users_by_step_date
            .entry((event.event_name.as_str(), event.event_date()))
            .or_default()
            .insert(event.user_id.as_str());
    }
    let distinct_users = |step: &str, date: NaiveDate| -> u64 {
        users_by_step_date
            .get(&(step, date))
            .map_or(0, |users| users.len() as u64)
    };

    let mut rows = Vec::with_capacity(dates.len() * funnel.len().saturating_sub(1));
    for transition in funnel.transitions() {
        for &date in &dates {
            let users_from = distinct_users(&transition.from_step, date);
            let users_to = distinct_users(&transition.to_step, date);
            rows.push(DailyConversion {
                date,
                from_step: transition.from_step.clone(),
                to_step: transition.to_step.clone(),
                users_from,
                users_to,
                conversion_rate: round_to(percentage(users_to, users_from), 2),
            });
        }
    }

    debug!(dates = dates.len(), rows = rows.len(), "Built daily conversion series");
    rows
}
