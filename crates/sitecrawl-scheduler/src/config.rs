use std::cmp;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub worker: WorkerCommand,

    #[serde(default)]
    pub allocator: AllocatorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker: WorkerCommand::default(),
            allocator: AllocatorConfig::default(),
        }
    }
}

fn default_max_workers() -> usize {
    cmp::max(1, num_cpus::get().saturating_sub(2))
}

/// How the external crawl worker is launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCommand {
    #[serde(default = "default_program")]
    pub program: String,

    /// Placed before the spider name
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    #[serde(default = "default_static_spider")]
    pub static_spider: String,

    #[serde(default = "default_dynamic_spider")]
    pub dynamic_spider: String,

    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            static_spider: default_static_spider(),
            dynamic_spider: default_dynamic_spider(),
            workdir: None,
        }
    }
}

fn default_program() -> String {
    String::from("scrapy")
}

fn default_args() -> Vec<String> {
    vec![String::from("crawl")]
}

fn default_static_spider() -> String {
    String::from("domain_spider")
}

fn default_dynamic_spider() -> String {
    String::from("domain_spider_js")
}

/// One pass over a weekly window. Open crawl hours run from the epoch's hour to the
/// end's hour, both inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorConfig {
    #[serde(default = "default_epoch")]
    pub epoch: DateTime<Utc>,

    #[serde(default = "default_end")]
    pub end: DateTime<Utc>,

    #[serde(default = "default_offset_minutes")]
    pub offset_minutes: u32,

    #[serde(default)]
    pub blackout: Blackout,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            epoch: default_epoch(),
            end: default_end(),
            offset_minutes: default_offset_minutes(),
            blackout: Blackout::default(),
        }
    }
}

fn default_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 12, 2, 3, 30, 0).unwrap()
}

fn default_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 12, 6, 21, 30, 0).unwrap()
}

fn default_offset_minutes() -> u32 {
    120
}

/// Weekly maintenance window, hours inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blackout {
    pub weekday: Weekday,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for Blackout {
    fn default() -> Self {
        Self {
            weekday: Weekday::Wed,
            start_hour: 15,
            end_hour: 20,
        }
    }
}

impl Blackout {
    pub fn covers(&self, weekday: Weekday, hour: u32) -> bool {
        weekday == self.weekday && hour >= self.start_hour && hour <= self.end_hour
    }
}
