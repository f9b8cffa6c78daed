use std::fmt;

use chrono::{DateTime, Duration, Utc};
use croner::Cron;

use crate::slots::ScheduleSlot;

#[derive(Debug, thiserror::Error)]
#[error("invalid cron expression `{expression}`: {message}")]
pub struct TriggerError {
    pub expression: String,
    pub message: String,
}

/// When a job fires. Cron expressions are evaluated in UTC.
pub enum Trigger {
    Cron { expression: String, schedule: Cron },
    Once(DateTime<Utc>),
}

impl Trigger {
    /// Parses standard five field crontab text
    pub fn cron(expression: &str) -> Result<Self, TriggerError> {
        let schedule = Cron::new(expression.trim())
            .parse()
            .map_err(|e| TriggerError {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self::Cron {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn weekly(slot: &ScheduleSlot) -> Result<Self, TriggerError> {
        Self::cron(&slot.cron_expression())
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once(at)
    }

    /// One shot trigger `secs` seconds from `now`
    pub fn after(now: DateTime<Utc>, secs: u32) -> Self {
        Self::once(now + Duration::seconds(i64::from(secs)))
    }

    /// First fire time once the scheduler starts at `now`. A one shot trigger
    /// already in the past fires right away.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once(at) => Some(*at),
            Self::Cron { .. } => self.next_after(now),
        }
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once(at) => (*at > after).then_some(*at),
            Self::Cron { schedule, .. } => schedule.find_next_occurrence(&after, false).ok(),
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expression, .. } => f.debug_tuple("Cron").field(expression).finish(),
            Self::Once(at) => f.debug_tuple("Once").field(at).finish(),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expression, .. } => write!(f, "cron[{expression}]"),
            Self::Once(at) => write!(f, "once[{}]", at.to_rfc3339()),
        }
    }
}
