//! Funnel analytics engine: event normalization, funnel conversion (overall
//! and grouped), A/B significance testing, daily conversion series, rolling
//! anomaly detection, and feature adoption.

pub mod adoption;
pub mod anomaly;
pub mod daily;
pub mod funnel;
pub mod normalize;
pub mod pipeline;
pub mod significance;

pub use anomaly::AnomalyDetector;
pub use daily::daily_conversion;
pub use funnel::FunnelAnalyzer;
pub use normalize::{normalize, UserStepTable};
pub use pipeline::{AnalysisReport, ReportPipeline};
pub use significance::{two_proportion_z_test, AbTester, ComparisonGroups};
