//! Error taxonomy. A `thiserror`-derived enum replacing ad hoc
//! `Box<dyn Error>`, with a crate-wide `Result` alias defined against a
//! single error type.

use crate::scheduler::WindowError;
use std::fmt;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("permission denied")]
    PermissionDenied,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("aborted: {0}")]
    Aborted(#[from] ScheduleError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("canceled")]
    Canceled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("frequency plan error: {0}")]
    FrequencyPlan(#[from] gs_core::frequency_plan::FrequencyPlanError),
    #[error("decode error: {0}")]
    Decode(String),
}

/// One rejected path, carrying the per-Rx-window causes that rejected it,
/// two levels deep: which path, and within it, which window and why.
#[derive(Debug)]
pub struct PathError {
    pub gateway: crate::message::GatewayIdentity,
    pub windows: Vec<(&'static str, WindowError)>,
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path {} rejected:", self.gateway)?;
        for (window, err) in &self.windows {
            write!(f, " {window}={err}")?;
        }
        Ok(())
    }
}

/// Umbrella error for "all scheduler paths failed".
#[derive(Debug)]
pub struct ScheduleError {
    pub path_errors: Vec<PathError>,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no path admitted ({} path(s) tried)", self.path_errors.len())?;
        for pe in &self.path_errors {
            write!(f, "; {pe}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ScheduleError {}
