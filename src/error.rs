//! Error types for the rebalancing simulator.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for the simulator.
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Optimization error: {0}")]
    Optimization(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("No data loaded")]
    NoData,

    #[error("Simulation cancelled")]
    Cancelled,

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Stable classification of an error, stored alongside skipped rebalances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    InsufficientData,
    ConstraintViolation,
    Optimization,
    Data,
    Cancelled,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::InsufficientData => "insufficient_data",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::Optimization => "optimization",
            ErrorKind::Data => "data",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
        };
        f.write_str(label)
    }
}

impl SimulationError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SimulationError::Config(_) | SimulationError::Toml(_) => ErrorKind::Configuration,
            SimulationError::InsufficientData(_) => ErrorKind::InsufficientData,
            SimulationError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            SimulationError::Optimization(_) => ErrorKind::Optimization,
            SimulationError::Data(_)
            | SimulationError::NoData
            | SimulationError::Csv(_)
            | SimulationError::DateParse(_) => ErrorKind::Data,
            SimulationError::Cancelled => ErrorKind::Cancelled,
            SimulationError::Io(_) | SimulationError::Json(_) => ErrorKind::Io,
        }
    }

    /// Whether a failure is an expected outcome of a rebalance attempt.
    ///
    /// Other kinds point at bad input or a broken collaborator; the loop still
    /// records them as skips but logs them at error level.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InsufficientData | ErrorKind::ConstraintViolation | ErrorKind::Optimization
        )
    }
}

/// Result type alias for simulator operations.
pub type Result<T> = std::result::Result<T, SimulationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classes() {
        assert!(SimulationError::InsufficientData("x".into()).is_recoverable());
        assert!(SimulationError::Optimization("x".into()).is_recoverable());
        assert!(SimulationError::ConstraintViolation("x".into()).is_recoverable());
        assert!(!SimulationError::Config("x".into()).is_recoverable());
        assert!(!SimulationError::NoData.is_recoverable());
        assert!(!SimulationError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(
            SimulationError::InsufficientData("short".into()).kind().to_string(),
            "insufficient_data"
        );
        assert_eq!(ErrorKind::Optimization.to_string(), "optimization");
    }
}
