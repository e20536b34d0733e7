//! When a job runs: fixed interval or cron expression.

use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Schedule {
    Every(Duration),
    Cron {
        expr: String,
        schedule: Box<cron::Schedule>,
    },
}

/// Parse a cron expression. The `cron` crate wants seconds and year fields; the usual
/// 5-field form (min hour dom month dow) is padded to "0 <expr> *".
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let expr = expr.trim();
    expr.parse::<cron::Schedule>()
        .or_else(|_| format!("0 {} *", expr).parse::<cron::Schedule>())
        .map_err(|e| GatewayError::Config(format!("invalid cron expression '{}': {}", expr, e)))
}

impl Schedule {
    pub fn every(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(GatewayError::Config("interval must be > 0".to_string()));
        }
        Ok(Schedule::Every(interval))
    }

    pub fn cron(expr: &str) -> Result<Self> {
        Ok(Schedule::Cron {
            expr: expr.trim().to_string(),
            schedule: Box::new(parse_cron(expr)?),
        })
    }

    /// First run strictly after `after`. None when a cron expression has no future runs.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
            Schedule::Cron { schedule, .. } => schedule.after(&after).next(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Schedule::Every(d) => format!("every {:?}", d),
            Schedule::Cron { expr, .. } => format!("cron '{}'", expr),
        }
    }
}
