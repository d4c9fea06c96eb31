//! Funnel Watch: funnel conversion, A/B significance and daily anomaly
//! reports over a user event log.
//!
//! Results go to stdout as JSON; logs go to stderr.

mod generate;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use funnel_alerts::{AlertNotifier, AlertThresholds, FileSink};
use funnel_core::config::AppConfig;
use funnel_core::ingest::load_feature_usage;
use funnel_core::types::FunnelDefinition;
use funnel_core::EventTable;
use funnel_reporting::adoption::{
    adoption_within, time_to_first_use, usage_retention, RETENTION_MIN_ACTIVE_DAYS,
};
use funnel_reporting::{daily_conversion, AbTester, AnomalyDetector, FunnelAnalyzer, ReportPipeline};
use serde::Serialize;
use tracing::{info, warn};

use crate::generate::{generate, GeneratorOptions};

#[derive(Parser, Debug)]
#[command(name = "funnel-watch")]
#[command(about = "Funnel conversion, A/B testing and anomaly detection for event logs")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); environment variables override it
    #[arg(short, long, global = true, env = "FUNNEL_WATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every analysis and dispatch alerts
    Run {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        anomaly: AnomalyArgs,

        /// Skip the A/B test even if enabled in config
        #[arg(long, default_value_t = false)]
        no_experiment: bool,

        /// Do not write alerts
        #[arg(long, default_value_t = false)]
        no_alerts: bool,

        /// Alert log directory (overrides config)
        #[arg(long)]
        alert_dir: Option<PathBuf>,

        /// Drop-off percentage above which a transition alerts (overrides config)
        #[arg(long)]
        drop_off_threshold: Option<f64>,

        /// p-value below which an A/B result alerts (overrides config)
        #[arg(long)]
        p_value_threshold: Option<f64>,
    },

    /// Step-to-step conversion, optionally per segment
    Funnel {
        #[command(flatten)]
        input: InputArgs,
    },

    /// Per-group conversion and significance test between two groups
    AbTest {
        #[command(flatten)]
        input: InputArgs,

        /// Column holding the experiment group label (overrides config)
        #[arg(long)]
        group_column: Option<String>,

        /// Control group label (overrides config)
        #[arg(long)]
        control: Option<String>,

        /// Treatment group label (overrides config)
        #[arg(long)]
        treatment: Option<String>,
    },

    /// Daily conversion series per transition
    Daily {
        #[command(flatten)]
        input: InputArgs,
    },

    /// Daily conversion series scored against a rolling mean
    Anomalies {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        anomaly: AnomalyArgs,

        /// Only print flagged days
        #[arg(long, default_value_t = false)]
        flagged_only: bool,
    },

    /// Feature adoption analytics over a feature usage log
    Features {
        /// Feature usage CSV (user_id, feature_name, usage_timestamp, signup_date)
        #[arg(short, long)]
        usage: PathBuf,

        #[arg(long, value_enum, default_value_t = FeatureMetric::Adoption)]
        metric: FeatureMetric,

        /// Adoption window after signup, in hours
        #[arg(long, default_value_t = 24.0)]
        window_hours: f64,

        /// Distinct active days for a user to count as retained
        #[arg(long, default_value_t = RETENTION_MIN_ACTIVE_DAYS)]
        min_active_days: u64,

        #[arg(long, default_value_t = false)]
        pretty: bool,
    },

    /// Write a synthetic event log
    Generate {
        /// Output CSV (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long, default_value_t = 1000)]
        users: usize,

        #[arg(long, default_value_t = 30)]
        days: u32,

        /// First day of the log (YYYY-MM-DD)
        #[arg(long, default_value = "2024-01-01")]
        start: NaiveDate,

        /// Comma-separated funnel steps
        #[arg(long, value_delimiter = ',', default_value = "signup,activate,purchase")]
        steps: Vec<String>,

        #[arg(long, default_value_t = 0.45)]
        base_conversion: f64,

        #[arg(long, default_value_t = 0.05)]
        treatment_lift: f64,

        #[arg(long, default_value_t = 0.02)]
        duplicate_rate: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Event log CSV (user_id, event_name, event_timestamp, metadata...)
    #[arg(short, long)]
    events: PathBuf,

    /// Comma-separated funnel steps (overrides config)
    #[arg(long, value_delimiter = ',')]
    steps: Option<Vec<String>>,

    /// Comma-separated segment columns (overrides config)
    #[arg(long, value_delimiter = ',')]
    group_by: Option<Vec<String>>,

    /// Pretty-print JSON output
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

#[derive(Args, Debug)]
struct AnomalyArgs {
    /// Rolling window in observations (overrides config)
    #[arg(long)]
    window: Option<usize>,

    /// Deviation threshold in percentage points (overrides config)
    #[arg(long)]
    threshold: Option<f64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FeatureMetric {
    Adoption,
    TimeToFirstUse,
    Retention,
}

impl InputArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(steps) = &self.steps {
            config.funnel.steps = steps.clone();
        }
        if let Some(group_by) = &self.group_by {
            config.funnel.group_by = group_by.clone();
        }
    }
}

impl AnomalyArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(window) = self.window {
            config.anomaly.window = window;
        }
        if let Some(threshold) = self.threshold {
            config.anomaly.threshold = threshold;
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "funnel_watch=info,funnel_core=info,funnel_reporting=info,funnel_alerts=info".into()
            }),
        )
        .with_writer(io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("failed to load config from {}", path.display()),
        None => "failed to load config from environment".to_string(),
    })?;

    match cli.command {
        Commands::Run {
            input,
            anomaly,
            no_experiment,
            no_alerts,
            alert_dir,
            drop_off_threshold,
            p_value_threshold,
        } => {
            input.apply(&mut config);
            anomaly.apply(&mut config);
            if no_experiment {
                config.experiment.enabled = false;
            }
            if no_alerts {
                config.alerts.enabled = false;
            }
            if let Some(dir) = alert_dir {
                config.alerts.log_dir = dir.display().to_string();
            }
            if let Some(t) = drop_off_threshold {
                config.alerts.drop_off_threshold_pct = t;
            }
            if let Some(t) = p_value_threshold {
                config.alerts.p_value_threshold = t;
            }
            run_report(&config, &input)
        }
        Commands::Funnel { input } => {
            input.apply(&mut config);
            let (funnel, events) = prepare(&config, &input.events)?;
            let analyzer = FunnelAnalyzer::new(funnel);
            let rows = if config.funnel.group_by.is_empty() {
                analyzer.analyze(&events)?
            } else {
                analyzer.analyze_grouped(&events, &config.funnel.group_by)?
            };
            emit(&rows, input.pretty)
        }
        Commands::AbTest {
            input,
            group_column,
            control,
            treatment,
        } => {
            input.apply(&mut config);
            if let Some(column) = group_column {
                config.experiment.group_column = column;
            }
            if let Some(label) = control {
                config.experiment.control_group = label;
            }
            if let Some(label) = treatment {
                config.experiment.treatment_group = label;
            }
            let (funnel, events) = prepare(&config, &input.events)?;
            let rows = AbTester::from_config(&config.experiment).run(&events, &funnel)?;
            emit(&rows, input.pretty)
        }
        Commands::Daily { input } => {
            input.apply(&mut config);
            let (funnel, events) = prepare(&config, &input.events)?;
            emit(&daily_conversion(&events, &funnel), input.pretty)
        }
        Commands::Anomalies {
            input,
            anomaly,
            flagged_only,
        } => {
            input.apply(&mut config);
            anomaly.apply(&mut config);
            let (funnel, events) = prepare(&config, &input.events)?;
            let detector = AnomalyDetector::from_config(&config.anomaly)?;
            let mut rows = detector.detect(&daily_conversion(&events, &funnel));
            if flagged_only {
                rows.retain(|r| r.is_anomaly);
            }
            emit(&rows, input.pretty)
        }
        Commands::Features {
            usage,
            metric,
            window_hours,
            min_active_days,
            pretty,
        } => {
            let usages = load_feature_usage(&usage)
                .with_context(|| format!("failed to read feature usage from {}", usage.display()))?;
            match metric {
                FeatureMetric::Adoption => emit(&adoption_within(&usages, window_hours), pretty),
                FeatureMetric::TimeToFirstUse => emit(&time_to_first_use(&usages), pretty),
                FeatureMetric::Retention => {
                    emit(&usage_retention(&usages, min_active_days), pretty)
                }
            }
        }
        Commands::Generate {
            output,
            users,
            days,
            start,
            steps,
            base_conversion,
            treatment_lift,
            duplicate_rate,
            seed,
        } => {
            let options = GeneratorOptions {
                users,
                days,
                start,
                steps,
                base_conversion,
                treatment_lift,
                duplicate_rate,
                seed,
            };
            let rows = match &output {
                Some(path) => {
                    let file = File::create(path)
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    generate(BufWriter::new(file), &options)?
                }
                None => generate(io::stdout().lock(), &options)?,
            };
            info!(rows, users, days, seed, "Synthetic event log written");
            Ok(())
        }
    }
}

fn prepare(config: &AppConfig, events: &Path) -> anyhow::Result<(FunnelDefinition, EventTable)> {
    config.validate().context("invalid configuration")?;
    let funnel = FunnelDefinition::new(config.funnel.steps.clone())
        .context("funnel steps must be set via --steps, config file or FUNNEL_WATCH__FUNNEL__STEPS")?;
    let table = EventTable::load_csv(events)
        .with_context(|| format!("failed to read event log from {}", events.display()))?;
    Ok((funnel, table))
}

fn run_report(config: &AppConfig, input: &InputArgs) -> anyhow::Result<()> {
    let (_, events) = prepare(config, &input.events)?;
    let pipeline = ReportPipeline::from_config(config)?;
    let report = pipeline.run(&events)?;

    if config.alerts.enabled {
        let sink = FileSink::new(&config.alerts.log_dir)
            .with_context(|| format!("failed to open alert log dir {}", config.alerts.log_dir))?;
        let notifier = AlertNotifier::new(Arc::new(sink), AlertThresholds::from_config(&config.alerts));
        match notifier.notify_report(&report) {
            Ok(summary) => info!(alerts = summary.total(), "Alerts written"),
            Err(e) => warn!(error = %e, "Alert delivery failed; report still emitted"),
        }
    }

    emit(&report, input.pretty)
}

fn emit<T: Serialize + ?Sized>(value: &T, pretty: bool) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    if pretty {
        serde_json::to_writer_pretty(&mut out, value)?;
    } else {
        serde_json::to_writer(&mut out, value)?;
    }
    writeln!(out)?;
    Ok(())
}
