//! Typed rows shared between the analytics engine and its consumers.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{AnalyticsError, AnalyticsResult};

/// Caller-supplied metadata columns (e.g. `ab_group`, `plan_tier`).
pub type Attributes = BTreeMap<String, String>;

/// Grouping-column values identifying one partition of a grouped result.
pub type GroupKey = BTreeMap<String, String>;

/// Label carried by the synthetic A/B row holding the significance test.
pub const SIGNIFICANCE_TEST_LABEL: &str = "significance-test";

// ─── Input ──────────────────────────────────────────────────────────────────

/// One raw event as logged by the product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub user_id: String,
    pub event_name: String,
    pub event_timestamp: NaiveDateTime,
    #[serde(default)]
    pub attributes: Attributes,
}

impl EventRecord {
    pub fn new(
        user_id: impl Into<String>,
        event_name: impl Into<String>,
        event_timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            event_name: event_name.into(),
            event_timestamp,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(column.into(), value.into());
        self
    }

    pub fn attribute(&self, column: &str) -> Option<&str> {
        self.attributes.get(column).map(String::as_str)
    }

    pub fn event_date(&self) -> NaiveDate {
        self.event_timestamp.date()
    }
}

/// One use of a product feature, with the user's signup time alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureUsage {
    pub user_id: String,
    pub feature_name: String,
    pub usage_timestamp: NaiveDateTime,
    pub signup_date: NaiveDateTime,
}

impl FeatureUsage {
    pub fn hours_since_signup(&self) -> f64 {
        (self.usage_timestamp - self.signup_date).num_milliseconds() as f64 / 3_600_000.0
    }
}

/// Ordered sequence of distinct funnel step names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct FunnelDefinition {
    steps: Vec<String>,
}

impl FunnelDefinition {
    /// Build a funnel, rejecting empty names, duplicates, and funnels with
    /// fewer than two steps.
    pub fn new<I, S>(steps: I) -> AnalyticsResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps: Vec<String> = steps.into_iter().map(Into::into).collect();
        if steps.len() < 2 {
            return Err(AnalyticsError::InvalidFunnel(format!(
                "a funnel needs at least two steps, got {}",
                steps.len()
            )));
        }
        let mut seen = HashSet::new();
        for step in &steps {
            if step.trim().is_empty() {
                return Err(AnalyticsError::InvalidFunnel("empty step name".into()));
            }
            if !seen.insert(step.as_str()) {
                return Err(AnalyticsError::InvalidFunnel(format!(
                    "step {step:?} appears more than once"
                )));
            }
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.steps.iter().any(|s| s == event_name)
    }

    pub fn position(&self, event_name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s == event_name)
    }

    /// Adjacent step pairs, in funnel order.
    pub fn transitions(&self) -> impl Iterator<Item = Transition> + '_ {
        self.steps.windows(2).map(|pair| Transition {
            from_step: pair[0].clone(),
            to_step: pair[1].clone(),
        })
    }
}

impl TryFrom<Vec<String>> for FunnelDefinition {
    type Error = AnalyticsError;

    fn try_from(steps: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(steps)
    }
}

impl From<FunnelDefinition> for Vec<String> {
    fn from(funnel: FunnelDefinition) -> Self {
        funnel.steps
    }
}

/// An adjacent pair of funnel steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Transition {
    pub from_step: String,
    pub to_step: String,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.from_step, self.to_step)
    }
}

// ─── Funnel rows ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelRow {
    pub from_step: String,
    pub to_step: String,
    pub users_at_from_step: u64,
    pub users_at_to_step: u64,
    #[serde(rename = "conversion_rate_%")]
    pub conversion_rate_pct: f64,
    #[serde(rename = "drop_off_rate_%")]
    pub drop_off_rate_pct: f64,
    /// Empty for the ungrouped funnel.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub group: GroupKey,
}

// ─── A/B rows ───────────────────────────────────────────────────────────────

/// Conversion counts for one experiment group on one transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConversion {
    pub group: String,
    pub from_step: String,
    pub to_step: String,
    pub users_at_from_step: u64,
    pub users_converted: u64,
    #[serde(rename = "conversion_rate_%")]
    pub conversion_rate_pct: f64,
}

/// Two-proportion z-test between the control and treatment groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceTest {
    pub control_group: String,
    pub treatment_group: String,
    pub from_step: String,
    pub to_step: String,
    /// Combined in-step total of both compared groups.
    pub users_at_from_step: u64,
    /// Combined conversions of both compared groups.
    pub users_converted: u64,
    /// `None` when either group had nobody at the from-step.
    pub p_value: Option<f64>,
}

/// One row of the A/B result table. Both kinds serialize with a `group`
/// field; the significance-test row carries [`SIGNIFICANCE_TEST_LABEL`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AbTestRow {
    Group(GroupConversion),
    SignificanceTest(SignificanceTest),
}

impl Serialize for AbTestRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct LabelledTest<'a> {
            group: &'static str,
            #[serde(flatten)]
            test: &'a SignificanceTest,
        }

        match self {
            AbTestRow::Group(g) => g.serialize(serializer),
            AbTestRow::SignificanceTest(test) => LabelledTest {
                group: SIGNIFICANCE_TEST_LABEL,
                test,
            }
            .serialize(serializer),
        }
    }
}

impl AbTestRow {
    /// Group label as it appears in the result table.
    pub fn group(&self) -> &str {
        match self {
            AbTestRow::Group(g) => &g.group,
            AbTestRow::SignificanceTest(_) => SIGNIFICANCE_TEST_LABEL,
        }
    }

    pub fn transition(&self) -> Transition {
        let (from_step, to_step) = match self {
            AbTestRow::Group(g) => (&g.from_step, &g.to_step),
            AbTestRow::SignificanceTest(t) => (&t.from_step, &t.to_step),
        };
        Transition {
            from_step: from_step.clone(),
            to_step: to_step.clone(),
        }
    }

    pub fn as_significance_test(&self) -> Option<&SignificanceTest> {
        match self {
            AbTestRow::SignificanceTest(t) => Some(t),
            AbTestRow::Group(_) => None,
        }
    }
}

// ─── Daily series & anomalies ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyConversion {
    pub date: NaiveDate,
    pub from_step: String,
    pub to_step: String,
    pub users_from: u64,
    pub users_to: u64,
    pub conversion_rate: f64,
}

impl DailyConversion {
    pub fn transition(&self) -> Transition {
        Transition {
            from_step: self.from_step.clone(),
            to_step: self.to_step.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyFlag {
    #[default]
    None,
    Spike,
    Drop,
}

impl AnomalyFlag {
    pub fn is_flagged(self) -> bool {
        self != AnomalyFlag::None
    }
}

impl fmt::Display for AnomalyFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyFlag::None => Ok(()),
            AnomalyFlag::Spike => f.write_str("Spike"),
            AnomalyFlag::Drop => f.write_str("Drop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRow {
    #[serde(flatten)]
    pub daily: DailyConversion,
    pub rolling_avg: f64,
    pub deviation: f64,
    pub is_anomaly: bool,
    pub flag: AnomalyFlag,
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// `numerator / denominator × 100`, or 0 when the denominator is 0.
pub fn percentage(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64 * 100.0
    } else {
        0.0
    }
}
