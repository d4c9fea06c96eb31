//! Alert sinks. The notifier accepts an `Arc<dyn AlertSink>`; the destination
//! (log directory, chat channel, ...) is configured on the sink itself.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local, NaiveDate};
use funnel_core::{AnalyticsError, AnalyticsResult};
use tracing::info;

use crate::notifier::{Alert, AlertKind};

pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &Alert) -> AnalyticsResult<()>;
}

/// Discards every alert.
pub struct NoOpSink;

impl AlertSink for NoOpSink {
    fn deliver(&self, _alert: &Alert) -> AnalyticsResult<()> {
        Ok(())
    }
}

/// In-memory sink that captures alerts for testing.
#[derive(Default)]
pub struct CaptureSink {
    alerts: Mutex<Vec<Alert>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn count_kind(&self, kind: AlertKind) -> usize {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|a| a.kind == kind)
            .count()
    }
}

impl AlertSink for CaptureSink {
    fn deliver(&self, alert: &Alert) -> AnalyticsResult<()> {
        self.alerts
            .lock()
            .map_err(|_| AnalyticsError::AlertDelivery("capture sink mutex poisoned".into()))?
            .push(alert.clone());
        Ok(())
    }
}

/// Appends alerts to one file per local calendar day,
/// `<log_dir>/alerts_<YYYY-mm-dd>.txt`, one `[timestamp] [KIND] message`
/// entry per alert.
pub struct FileSink {
    log_dir: PathBuf,
}

impl FileSink {
    /// Creates `log_dir` if it does not exist.
    pub fn new(log_dir: impl Into<PathBuf>) -> AnalyticsResult<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;
        Ok(Self { log_dir })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn log_path(&self, date: NaiveDate) -> PathBuf {
        self.log_dir
            .join(format!("alerts_{}.txt", date.format("%Y-%m-%d")))
    }

    /// Append `alert` to the file for the calendar day of `now`.
    pub fn deliver_at(&self, alert: &Alert, now: DateTime<Local>) -> AnalyticsResult<()> {
        let path = self.log_path(now.date_naive());
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(
            file,
            "[{}] [{}] {}",
            now.format("%Y-%m-%d %H:%M:%S"),
            alert.kind.prefix(),
            alert.message
        )?;
        info!(path = %path.display(), kind = alert.kind.prefix(), "Alert logged");
        Ok(())
    }
}

impl AlertSink for FileSink {
    fn deliver(&self, alert: &Alert) -> AnalyticsResult<()> {
        self.deliver_at(alert, Local::now())
    }
}
