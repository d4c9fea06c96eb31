//! Synthetic event log generator for demos and smoke tests.

use std::io::Write;

use chrono::{Duration, NaiveDate};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const PLAN_TIERS: [(&str, f64); 3] = [("free", 0.6), ("pro", 0.3), ("enterprise", 0.1)];

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub users: usize,
    pub days: u32,
    pub start: NaiveDate,
    pub steps: Vec<String>,
    /// Chance of moving from one step to the next, control group.
    pub base_conversion: f64,
    /// Added to `base_conversion` for the treatment group.
    pub treatment_lift: f64,
    /// Chance that any event is logged twice.
    pub duplicate_rate: f64,
    pub seed: u64,
}

/// Writes a CSV event log and returns the number of data rows.
pub fn generate<W: Write>(writer: W, options: &GeneratorOptions) -> anyhow::Result<usize> {
    anyhow::ensure!(options.days > 0, "at least one day is required");
    anyhow::ensure!(options.steps.len() >= 2, "at least two funnel steps are required");
    anyhow::ensure!(
        (0.0..=1.0).contains(&options.duplicate_rate),
        "duplicate rate must be within [0, 1]"
    );
    anyhow::ensure!(
        options.base_conversion.is_finite() && options.treatment_lift.is_finite(),
        "conversion rate and treatment lift must be finite"
    );

    let mut rng = StdRng::seed_from_u64(options.seed);
    let tiers = WeightedIndex::new(PLAN_TIERS.iter().map(|(_, weight)| *weight))?;
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(["user_id", "event_name", "event_timestamp", "ab_group", "plan_tier"])?;

    let mut rows = 0;
    for user in 0..options.users {
        let user_id = format!("user_{user:05}");
        let group = if rng.gen_bool(0.5) { "A" } else { "B" };
        let tier = PLAN_TIERS[tiers.sample(&mut rng)].0;
        let p = match group {
            "B" => options.base_conversion + options.treatment_lift,
            _ => options.base_conversion,
        }
        .clamp(0.0, 1.0);

        let day = rng.gen_range(0..options.days);
        let mut at = options.start.and_hms_opt(0, 0, 0).unwrap_or_default()
            + Duration::days(i64::from(day))
            + Duration::minutes(rng.gen_range(0..18 * 60));

        for (i, step) in options.steps.iter().enumerate() {
            if i > 0 {
                if !rng.gen_bool(p) {
                    break;
                }
                at += Duration::minutes(rng.gen_range(1..240));
            }
            let timestamp = at.format("%Y-%m-%d %H:%M:%S").to_string();
            let copies = if rng.gen_bool(options.duplicate_rate) { 2 } else { 1 };
            for _ in 0..copies {
                out.write_record([user_id.as_str(), step.as_str(), timestamp.as_str(), group, tier])?;
                rows += 1;
            }
        }
    }
    out.flush()?;
    Ok(rows)
}
