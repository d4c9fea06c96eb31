//! Notification layer. Turns analytics output into human-readable alerts
//! and hands them to a pluggable sink.

pub mod notifier;
pub mod sink;

pub use notifier::{Alert, AlertKind, AlertNotifier, AlertSummary, AlertThresholds};
pub use sink::{AlertSink, CaptureSink, FileSink, NoOpSink};
