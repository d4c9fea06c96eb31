use thiserror::Error;

pub type AnalyticsResult<T> = Result<T, AnalyticsError>;

#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid funnel definition: {0}")]
    InvalidFunnel(String),

    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Unparseable timestamp in row {row}, column {column}: {value:?}")]
    InvalidTimestamp {
        row: usize,
        column: String,
        value: String,
    },

    #[error("Invalid record in row {row}: {reason}")]
    InvalidRecord { row: usize, reason: String },

    #[error("Alert delivery error: {0}")]
    AlertDelivery(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AnalyticsError {
    fn from(err: config::ConfigError) -> Self {
        AnalyticsError::Config(err.to_string())
    }
}
