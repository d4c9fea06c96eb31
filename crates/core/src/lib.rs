//! Shared foundation for funnel analytics: error taxonomy, configuration,
//! typed event and result rows, and CSV ingest.

pub mod config;
pub mod error;
pub mod ingest;
pub mod types;

pub use config::AppConfig;
pub use error::{AnalyticsError, AnalyticsResult};
pub use ingest::EventTable;
pub use types::*;
