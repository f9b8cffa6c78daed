use std::fmt;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};

use crate::config::AllocatorConfig;

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("no schedule slot left, assignment beyond {} is not supported", .end.format("%a %H:%M"))]
    CapacityExceeded { end: DateTime<Utc> },
    #[error("slot offset must be at least one minute")]
    InvalidOffset,
}

/// A recurring weekly trigger time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleSlot {
    pub day: Weekday,
    pub hour: u32,
    pub minute: u32,
}

impl ScheduleSlot {
    fn at(instant: DateTime<Utc>) -> Self {
        Self {
            day: instant.weekday(),
            hour: instant.hour(),
            minute: instant.minute(),
        }
    }

    /// `mon`, `tue`, ..
    pub fn day_name(&self) -> String {
        self.day.to_string().to_lowercase()
    }

    pub fn hour_padded(&self) -> String {
        format!("{:02}", self.hour)
    }

    pub fn minute_padded(&self) -> String {
        format!("{:02}", self.minute)
    }

    /// Five field crontab text firing weekly at this slot, e.g. `30 03 * * MON`
    pub fn cron_expression(&self) -> String {
        format!(
            "{:02} {:02} * * {}",
            self.minute,
            self.hour,
            self.day.to_string().to_uppercase()
        )
    }
}

impl fmt::Display for ScheduleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.day_name(),
            self.hour_padded(),
            self.minute_padded()
        )
    }
}

/// Hands out slots one at a time, stepping a cursor from the epoch by a fixed
/// offset and skipping candidates outside crawl hours or inside the blackout.
/// A single pass over the window is supported.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    config: AllocatorConfig,
    offset: Duration,
    cursor: Option<DateTime<Utc>>,
}

impl SlotAllocator {
    pub fn new(config: AllocatorConfig) -> Result<Self, SlotError> {
        if config.offset_minutes == 0 {
            return Err(SlotError::InvalidOffset);
        }
        Ok(Self {
            offset: Duration::minutes(i64::from(config.offset_minutes)),
            config,
            cursor: None,
        })
    }

    fn is_valid(&self, candidate: DateTime<Utc>) -> bool {
        let hour = candidate.hour();
        if hour < self.config.epoch.hour() || hour > self.config.end.hour() {
            return false;
        }
        !self.config.blackout.covers(candidate.weekday(), hour)
    }

    pub fn next_slot(&mut self) -> Result<ScheduleSlot, SlotError> {
        let mut candidate = match self.cursor {
            None => self.config.epoch,
            Some(last) => last + self.offset,
        };
        loop {
            if candidate > self.config.end {
                return Err(SlotError::CapacityExceeded {
                    end: self.config.end,
                });
            }
            if self.is_valid(candidate) {
                break;
            }
            candidate = candidate + self.offset;
        }

        self.cursor = Some(candidate);
        Ok(ScheduleSlot::at(candidate))
    }

    /// How many slots a fresh allocator over the same window yields
    pub fn capacity(&self) -> usize {
        let mut fresh = Self {
            config: self.config.clone(),
            offset: self.offset,
            cursor: None,
        };
        let mut count = 0;
        while fresh.next_slot().is_ok() {
            count += 1;
        }
        count
    }
}
