mod config;
mod scheduler;
mod sites;
mod slots;
mod trigger;
mod worker;

pub use config::{AllocatorConfig, Blackout, SchedulerConfig, WorkerCommand};
pub use scheduler::{Clock, RunSummary, ScheduledJob, Scheduler, SchedulerError, SystemClock};
pub use sites::{CrawlSite, CrawlSites, RegistryError};
pub use slots::{ScheduleSlot, SlotAllocator, SlotError};
pub use trigger::{Trigger, TriggerError};
pub use worker::{CrawlWorker, ProcessWorker, WorkerArgs, WorkerExit};

pub use anyhow;
