//! Event table normalization. Collapses raw events to one row per
//! (user, step) and pivots them into a user × step table.
//!
//! Deduplication keeps the earliest `event_timestamp` for each
//! (user_id, event_name) pair, breaking ties by input order. A user's value
//! for a grouping column comes from their earliest funnel event that carries
//! one, with the same tie-break.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use funnel_core::ingest::EventTable;
use funnel_core::types::{EventRecord, FunnelDefinition, GroupKey};
use funnel_core::AnalyticsResult;
use tracing::{debug, warn};

/// One user's progress through the funnel.
#[derive(Debug, Clone, PartialEq)]
pub struct UserJourney {
    pub user_id: String,
    /// Timestamp the user reached each step, indexed like the funnel steps.
    pub reached: Vec<Option<NaiveDateTime>>,
    pub attributes: GroupKey,
}

impl UserJourney {
    pub fn reached_step(&self, step: usize) -> bool {
        self.reached.get(step).is_some_and(Option::is_some)
    }

    /// Values for `columns` in order, or `None` if any is missing.
    fn group_values(&self, columns: &[String]) -> Option<Vec<String>> {
        columns
            .iter()
            .map(|c| self.attributes.get(c).cloned())
            .collect()
    }
}

/// Pivoted funnel table: one row per user (sorted by user id), one column per
/// funnel step.
#[derive(Debug, Clone, PartialEq)]
pub struct UserStepTable {
    steps: Vec<String>,
    users: Vec<UserJourney>,
}

impl UserStepTable {
    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn users(&self) -> &[UserJourney] {
        &self.users
    }

    /// Split users by their values for `columns`, in ascending key order.
    /// Users missing any of the columns are left out. With no columns, all
    /// users form a single group with an empty key.
    pub fn partition(&self, columns: &[String]) -> Vec<(GroupKey, Vec<&UserJourney>)> {
        let mut groups: BTreeMap<Vec<String>, Vec<&UserJourney>> = BTreeMap::new();
        let mut skipped = 0usize;
        for user in &self.users {
            match user.group_values(columns) {
                Some(values) => groups.entry(values).or_default().push(user),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(
                skipped,
                columns = ?columns,
                "Users without grouping values left out of grouped results"
            );
        }

        groups
            .into_iter()
            .map(|(values, users)| {
                let key = columns.iter().cloned().zip(values).collect();
                (key, users)
            })
            .collect()
    }
}

/// Number of users in `users` who reached `step`.
pub fn count_reached<'a, I>(users: I, step: usize) -> u64
where
    I: IntoIterator<Item = &'a UserJourney>,
{
    users.into_iter().filter(|u| u.reached_step(step)).count() as u64
}

/// Keep one event per (user_id, event_name): the earliest by timestamp, ties
/// broken by position. Survivors are returned in input order.
pub fn deduplicate(events: &[EventRecord]) -> Vec<&EventRecord> {
    let mut keep: HashMap<(&str, &str), usize> = HashMap::new();
    for (idx, event) in events.iter().enumerate() {
        keep.entry((event.user_id.as_str(), event.event_name.as_str()))
            .and_modify(|kept| {
                if event.event_timestamp < events[*kept].event_timestamp {
                    *kept = idx;
                }
            })
            .or_insert(idx);
    }

    let mut indices: Vec<usize> = keep.into_values().collect();
    indices.sort_unstable();
    indices.into_iter().map(|i| &events[i]).collect()
}

struct PendingUser<'a> {
    reached: Vec<Option<NaiveDateTime>>,
    // column -> (timestamp, value) of the earliest event carrying it
    attributes: BTreeMap<&'a str, (NaiveDateTime, &'a str)>,
    conflicting: bool,
}

/// Filter to funnel events, deduplicate, and pivot into a [`UserStepTable`]
/// carrying the `group_by` metadata per user.
pub fn normalize(
    table: &EventTable,
    funnel: &FunnelDefinition,
    group_by: &[String],
) -> AnalyticsResult<UserStepTable> {
    table.require_columns(group_by)?;

    let mut pending: BTreeMap<&str, PendingUser<'_>> = BTreeMap::new();
    let mut funnel_events = 0usize;

    for event in deduplicate(table.events()) {
        let Some(step) = funnel.position(&event.event_name) else {
            continue;
        };
        funnel_events += 1;

        let user = pending
            .entry(event.user_id.as_str())
            .or_insert_with(|| PendingUser {
                reached: vec![None; funnel.len()],
                attributes: BTreeMap::new(),
                conflicting: false,
            });
        user.reached[step] = Some(event.event_timestamp);

        for column in group_by {
            let Some(value) = event.attribute(column) else {
                continue;
            };
            match user.attributes.get_mut(column.as_str()) {
                Some((ts, current)) => {
                    if *current != value {
                        user.conflicting = true;
                    }
                    if event.event_timestamp < *ts {
                        *ts = event.event_timestamp;
                        *current = value;
                    }
                }
                None => {
                    user.attributes
                        .insert(column.as_str(), (event.event_timestamp, value));
                }
            }
        }
    }

    let conflicting = pending.values().filter(|u| u.conflicting).count();
    if conflicting > 0 {
        debug!(
            users = conflicting,
            "Conflicting grouping values resolved by earliest event"
        );
    }

    let users: Vec<UserJourney> = pending
        .into_iter()
        .map(|(user_id, user)| UserJourney {
            user_id: user_id.to_string(),
            reached: user.reached,
            attributes: user
                .attributes
                .into_iter()
                .map(|(column, (_, value))| (column.to_string(), value.to_string()))
                .collect(),
        })
        .collect();

    debug!(
        events = table.len(),
        funnel_events,
        users = users.len(),
        "Normalized event table"
    );

    Ok(UserStepTable {
        steps: funnel.steps().to_vec(),
        users,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use funnel_core::AnalyticsError;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn funnel() -> FunnelDefinition {
        FunnelDefinition::new(["signup", "activate", "purchase"]).unwrap()
    }

    #[test]
    fn test_dedup_keeps_earliest() {
        let events = vec![
            EventRecord::new("u1", "signup", at(2, 9)),
            EventRecord::new("u1", "signup", at(1, 9)),
            EventRecord::new("u1", "activate", at(2, 10)),
        ];
        let deduped = deduplicate(&events);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].event_timestamp, at(1, 9));
        assert_eq!(deduped[1].event_name, "activate");
    }

    #[test]
    fn test_dedup_tie_keeps_first_in_input() {
        let events = vec![
            EventRecord::new("u1", "signup", at(1, 9)).with_attribute("ab_group", "A"),
            EventRecord::new("u1", "signup", at(1, 9)).with_attribute("ab_group", "B"),
        ];
        let deduped = deduplicate(&events);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].attribute("ab_group"), Some("A"));
    }

    #[test]
    fn test_pivot_filters_non_funnel_events() {
        let table = EventTable::from_events(vec![
            EventRecord::new("u2", "signup", at(1, 9)),
            EventRecord::new("u1", "signup", at(1, 8)),
            EventRecord::new("u1", "page_view", at(1, 8)),
            EventRecord::new("u1", "purchase", at(3, 8)),
            EventRecord::new("u3", "page_view", at(1, 8)),
        ]);
        let pivot = normalize(&table, &funnel(), &[]).unwrap();

        let ids: Vec<&str> = pivot.users().iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);
        assert_eq!(pivot.users()[0].reached, vec![Some(at(1, 8)), None, Some(at(3, 8))]);
        assert_eq!(count_reached(pivot.users(), 0), 2);
        assert_eq!(count_reached(pivot.users(), 1), 0);
    }

    #[test]
    fn test_conflicting_metadata_uses_earliest_event() {
        let table = EventTable::from_events(vec![
            EventRecord::new("u1", "activate", at(2, 9)).with_attribute("plan_tier", "pro"),
            EventRecord::new("u1", "signup", at(1, 9)).with_attribute("plan_tier", "free"),
        ]);
        let group_by = vec!["plan_tier".to_string()];
        let pivot = normalize(&table, &funnel(), &group_by).unwrap();
        assert_eq!(pivot.users()[0].attributes["plan_tier"], "free");
    }

    #[test]
    fn test_missing_group_column_is_fatal() {
        let table = EventTable::from_events(vec![EventRecord::new("u1", "signup", at(1, 9))]);
        let err = normalize(&table, &funnel(), &["country".to_string()]).unwrap_err();
        assert!(matches!(err, AnalyticsError::MissingColumn(c) if c == "country"));
    }

    #[test]
    fn test_partition_sorted_and_skips_missing() {
        let table = EventTable::from_events(vec![
            EventRecord::new("u1", "signup", at(1, 9)).with_attribute("ab_group", "B"),
            EventRecord::new("u2", "signup", at(1, 9)).with_attribute("ab_group", "A"),
            EventRecord::new("u3", "signup", at(1, 9)),
        ]);
        let group_by = vec!["ab_group".to_string()];
        let pivot = normalize(&table, &funnel(), &group_by).unwrap();
        let groups = pivot.partition(&group_by);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0["ab_group"], "A");
        assert_eq!(groups[1].1[0].user_id, "u1");

        let everyone = pivot.partition(&[]);
        assert_eq!(everyone.len(), 1);
        assert!(everyone[0].0.is_empty());
        assert_eq!(everyone[0].1.len(), 3);
    }
}
