//! Feature adoption: early adoption after signup, time to first use, and
//! how usage breadth correlates with retention.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use funnel_core::types::{percentage, round_to, FeatureUsage};
use serde::{Deserialize, Serialize};

pub const ADOPTION_WINDOW_HOURS: f64 = 24.0;
pub const RETENTION_MIN_ACTIVE_DAYS: u64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureAdoption {
    pub feature_name: String,
    pub users_used: u64,
    #[serde(rename = "adoption_rate_%")]
    pub adoption_rate_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeToFirstUse {
    pub feature_name: String,
    pub avg_hours_to_first_use: f64,
    pub median_hours_to_first_use: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEngagement {
    pub user_id: String,
    pub unique_features_used: u64,
    pub active_days: u64,
    pub total_events: u64,
    pub retained: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionCorrelation {
    pub metric: String,
    /// Pearson correlation with `retained`; `None` when either side is constant.
    pub correlation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionAnalysis {
    pub users: Vec<UserEngagement>,
    pub correlations: Vec<RetentionCorrelation>,
}

/// Share of all users who used each feature within `window_hours` of signup.
/// Usage before signup counts as within the window.
pub fn adoption_within(usages: &[FeatureUsage], window_hours: f64) -> Vec<FeatureAdoption> {
    let total_users = usages
        .iter()
        .map(|u| u.user_id.as_str())
        .collect::<HashSet<_>>()
        .len() as u64;

    let mut adopters: BTreeMap<&str, HashSet<&str>> = BTreeMap::new();
    for usage in usages.iter().filter(|u| u.hours_since_signup() <= window_hours) {
        adopters
            .entry(usage.feature_name.as_str())
            .or_default()
            .insert(usage.user_id.as_str());
    }

    adopters
        .into_iter()
        .map(|(feature, users)| {
            let users_used = users.len() as u64;
            FeatureAdoption {
                feature_name: feature.to_string(),
                users_used,
                adoption_rate_pct: round_to(percentage(users_used, total_users), 2),
            }
        })
        .collect()
}

/// Mean and median hours from signup to each user's first use of a feature.
pub fn time_to_first_use(usages: &[FeatureUsage]) -> Vec<TimeToFirstUse> {
    let mut first_use: HashMap<(&str, &str), &FeatureUsage> = HashMap::new();
    for usage in usages {
        first_use
            .entry((usage.user_id.as_str(), usage.feature_name.as_str()))
            .and_modify(|kept| {
                if usage.usage_timestamp < kept.usage_timestamp {
                    *kept = usage;
                }
            })
            .or_insert(usage);
    }

    let mut hours_by_feature: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for ((_, feature), usage) in first_use {
        hours_by_feature
            .entry(feature)
            .or_default()
            .push(usage.hours_since_signup());
    }

    hours_by_feature
        .into_iter()
        .map(|(feature, mut hours)| {
            hours.sort_by(f64::total_cmp);
            let mean = hours.iter().sum::<f64>() / hours.len() as f64;
            TimeToFirstUse {
                feature_name: feature.to_string(),
                avg_hours_to_first_use: round_to(mean, 2),
                median_hours_to_first_use: round_to(median(&hours), 2),
            }
        })
        .collect()
}

/// Per-user engagement and its correlation with retention, where a user is
/// retained after `min_active_days` distinct days of usage.
pub fn usage_retention(usages: &[FeatureUsage], min_active_days: u64) -> RetentionAnalysis {
    #[derive(Default)]
    struct Tally<'a> {
        features: HashSet<&'a str>,
        days: HashSet<NaiveDate>,
        events: u64,
    }

    let mut tallies: BTreeMap<&str, Tally<'_>> = BTreeMap::new();
    for usage in usages {
        let tally = tallies.entry(usage.user_id.as_str()).or_default();
        tally.features.insert(usage.feature_name.as_str());
        tally.days.insert(usage.usage_timestamp.date());
        tally.events += 1;
    }

    let users: Vec<UserEngagement> = tallies
        .into_iter()
        .map(|(user_id, tally)| {
            let active_days = tally.days.len() as u64;
            UserEngagement {
                user_id: user_id.to_string(),
                unique_features_used: tally.features.len() as u64,
                active_days,
                total_events: tally.events,
                retained: active_days >= min_active_days,
            }
        })
        .collect();

    let retained: Vec<f64> = users.iter().map(|u| f64::from(u8::from(u.retained))).collect();
    let metrics: [(&str, fn(&UserEngagement) -> u64); 3] = [
        ("unique_features_used", |u: &UserEngagement| u.unique_features_used),
        ("total_events", |u: &UserEngagement| u.total_events),
        ("active_days", |u: &UserEngagement| u.active_days),
    ];

    let mut correlations: Vec<RetentionCorrelation> = metrics
        .iter()
        .map(|(name, metric)| {
            let values: Vec<f64> = users.iter().map(|u| metric(u) as f64).collect();
            RetentionCorrelation {
                metric: name.to_string(),
                correlation: pearson(&values, &retained),
            }
        })
        .collect();
    // Strongest positive first, undefined last.
    correlations.sort_by(|a, b| match (a.correlation, b.correlation) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    RetentionAnalysis {
        users,
        correlations,
    }
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len();
    if n < 2 || n != ys.len() {
        return None;
    }
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in xs.iter().zip(ys) {
        let (dx, dy) = (x - mean_x, y - mean_y);
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x * var_y).sqrt())
}
