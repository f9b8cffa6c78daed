use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::{self, JoinError, JoinSet};

use crate::config::WorkerCommand;
use crate::sites::CrawlSite;
use crate::slots::ScheduleSlot;
use crate::trigger::{Trigger, TriggerError};
use crate::worker::{CrawlWorker, WorkerArgs};

/// Longest nap between two looks at the clock when nothing is due
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("a job with id `{0}` is already scheduled")]
    DuplicateJob(String),
    #[error("site `{site}` has no schedule")]
    Unscheduled { site: String },
    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

/// A site bound to a trigger and the worker arguments it runs with
#[derive(Debug)]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub args: WorkerArgs,
}

impl ScheduledJob {
    pub fn from_site(site: &CrawlSite, trigger: Trigger, command: &WorkerCommand) -> Self {
        Self {
            id: site.job_id(),
            name: site.name.clone(),
            trigger,
            args: WorkerArgs::from_site(site, command),
        }
    }

    /// Recurring job from the site's own cron expression
    pub fn scheduled(site: &CrawlSite, command: &WorkerCommand) -> Result<Self, SchedulerError> {
        let expression = site
            .schedule
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SchedulerError::Unscheduled {
                site: site.name.clone(),
            })?;
        Ok(Self::from_site(site, Trigger::cron(expression)?, command))
    }

    /// Weekly job firing at `slot`
    pub fn from_slot(
        site: &CrawlSite,
        slot: &ScheduleSlot,
        command: &WorkerCommand,
    ) -> Result<Self, SchedulerError> {
        Ok(Self::from_site(site, Trigger::weekly(slot)?, command))
    }

    /// One shot run `offset` seconds from now, whatever the site's schedule
    pub fn benchmark(site: &CrawlSite, offset: u32, command: &WorkerCommand) -> Self {
        let name = format!("benchmark - {}", site.name);
        Self {
            id: name.clone(),
            name,
            trigger: Trigger::after(Utc::now(), offset),
            args: WorkerArgs::from_site(site, command),
        }
    }

    /// Runs the worker to completion, `true` when it exited cleanly
    pub fn execute(&self, worker: &dyn CrawlWorker) -> bool {
        log::info!("Starting crawl job {} with args {}", self.id, self.args);
        match worker.run(&self.args) {
            Ok(exit) if exit.success() => {
                log::info!("Crawl job {} completed with {exit}", self.id);
                true
            }
            Ok(exit) => {
                log::error!("Crawl job {} failed with {exit}", self.id);
                false
            }
            Err(e) => {
                log::error!("Crawl job {} couldn't run: {e:#}", self.id);
                false
            }
        }
    }
}

/// Where the scheduler reads the time from
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// How long to sleep before the clock reads `at`
    fn until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fire {
    Dispatch,
    /// Pool is full, runs once a slot frees
    Queued,
    /// Already waiting for a slot, the miss collapses into that run
    Coalesced,
    /// Still running, this occurrence is skipped
    AlreadyRunning,
}

/// Pool bookkeeping: at most `capacity` jobs running, at most one pending
/// entry and one running instance per job.
#[derive(Debug)]
struct Dispatcher {
    capacity: usize,
    running: HashSet<usize>,
    pending: VecDeque<usize>,
}

impl Dispatcher {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            running: HashSet::new(),
            pending: VecDeque::new(),
        }
    }

    fn fire(&mut self, job: usize) -> Fire {
        if self.running.contains(&job) {
            Fire::AlreadyRunning
        } else if self.pending.contains(&job) {
            Fire::Coalesced
        } else if self.running.len() < self.capacity {
            self.running.insert(job);
            Fire::Dispatch
        } else {
            self.pending.push_back(job);
            Fire::Queued
        }
    }

    /// Frees the job's slot and hands back the next pending job, if any
    fn complete(&mut self, job: usize) -> Option<usize> {
        self.running.remove(&job);
        if self.running.len() >= self.capacity {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.running.insert(next);
        Some(next)
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub coalesced: usize,
    pub skipped: usize,
}

/// Fires jobs on their triggers into a bounded pool of blocking worker slots.
pub struct Scheduler {
    max_workers: usize,
    worker: Arc<dyn CrawlWorker>,
    clock: Arc<dyn Clock>,
    jobs: Vec<Arc<ScheduledJob>>,
}

impl Scheduler {
    pub fn new(max_workers: usize, worker: Arc<dyn CrawlWorker>) -> Self {
        Self {
            max_workers: max_workers.max(1),
            worker,
            clock: Arc::new(SystemClock),
            jobs: vec![],
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn add_job(&mut self, job: ScheduledJob) -> Result<(), SchedulerError> {
        if self.jobs.iter().any(|j| j.id == job.id) {
            return Err(SchedulerError::DuplicateJob(job.id));
        }
        self.jobs.push(Arc::new(job));
        Ok(())
    }

    /// Runs until `shutdown` resolves, or until nothing is running and no job
    /// can fire again. In-flight jobs are always awaited before returning.
    pub async fn run<F>(self, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        log::info!(
            "Starting scheduler with {} jobs and {} workers",
            self.jobs.len(),
            self.max_workers
        );

        let now = self.clock.now();
        let mut next_fire = self
            .jobs
            .iter()
            .map(|job| {
                let at = job.trigger.first_fire(now);
                match at {
                    Some(at) => log::info!("Added job {} ({}), next run at {at}", job.id, job.trigger),
                    None => log::warn!("Job {} ({}) will never run", job.id, job.trigger),
                }
                at
            })
            .collect::<Vec<_>>();

        let mut pool = Pool {
            jobs: &self.jobs,
            worker: &self.worker,
            dispatcher: Dispatcher::new(self.max_workers),
            running: JoinSet::new(),
            tasks: HashMap::new(),
            summary: RunSummary::default(),
        };

        tokio::pin!(shutdown);
        loop {
            let now = self.clock.now();
            for (idx, at) in next_fire.iter_mut().enumerate() {
                if matches!(at, Some(at) if *at <= now) {
                    pool.fire(idx);
                    *at = self.jobs[idx].trigger.next_after(now);
                }
            }

            let upcoming = next_fire.iter().flatten().min().copied();
            if upcoming.is_none() && pool.is_idle() {
                log::info!("No job left to run");
                break;
            }
            let wait = upcoming
                .map(|at| self.clock.until(at))
                .unwrap_or(IDLE_WAIT)
                .min(IDLE_WAIT);

            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down scheduler");
                    break;
                }
                Some(done) = pool.running.join_next() => pool.finished(done),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if !pool.dispatcher.pending.is_empty() {
            log::warn!(
                "Dropping {} jobs waiting for a worker",
                pool.dispatcher.pending.len()
            );
            pool.dispatcher.pending.clear();
        }
        while let Some(done) = pool.running.join_next().await {
            pool.finished(done);
        }

        let summary = pool.summary;
        log::info!(
            "Scheduler stopped: {} dispatched, {} succeeded, {} failed, {} coalesced, {} skipped",
            summary.dispatched,
            summary.succeeded,
            summary.failed,
            summary.coalesced,
            summary.skipped
        );
        summary
    }
}

struct Pool<'a> {
    jobs: &'a [Arc<ScheduledJob>],
    worker: &'a Arc<dyn CrawlWorker>,
    dispatcher: Dispatcher,
    running: JoinSet<(usize, bool)>,
    /// Job index of every task still in `running`
    tasks: HashMap<task::Id, usize>,
    summary: RunSummary,
}

impl Pool<'_> {
    fn fire(&mut self, idx: usize) {
        let jobs = self.jobs;
        let id = &jobs[idx].id;
        match self.dispatcher.fire(idx) {
            Fire::Dispatch => self.spawn(idx),
            Fire::Queued => log::info!("All workers busy, job {id} waits for a free slot"),
            Fire::Coalesced => {
                self.summary.coalesced += 1;
                log::debug!("Job {id} already waiting, missed run coalesced");
            }
            Fire::AlreadyRunning => {
                self.summary.skipped += 1;
                log::warn!("Job {id} is still running, skipping this run");
            }
        }
    }

    fn spawn(&mut self, idx: usize) {
        self.summary.dispatched += 1;
        let job = Arc::clone(&self.jobs[idx]);
        let worker = Arc::clone(self.worker);
        log::info!("Dispatching job {}", job.id);
        let handle = self
            .running
            .spawn_blocking(move || (idx, job.execute(worker.as_ref())));
        self.tasks.insert(handle.id(), idx);
    }

    fn finished(&mut self, done: Result<(usize, bool), JoinError>) {
        let (idx, ok) = match done {
            Ok((idx, ok)) => {
                self.tasks.retain(|_, running| *running != idx);
                (idx, ok)
            }
            Err(e) => match self.tasks.remove(&e.id()) {
                Some(idx) => {
                    if e.is_panic() {
                        log::error!("Crawl job {} panicked", self.jobs[idx].id);
                    } else {
                        log::error!("Crawl job {} was cancelled", self.jobs[idx].id);
                    }
                    (idx, false)
                }
                None => {
                    log::error!("Worker slot lost: {e}");
                    return;
                }
            },
        };

        if ok {
            self.summary.succeeded += 1;
        } else {
            self.summary.failed += 1;
        }
        if let Some(next) = self.dispatcher.complete(idx) {
            self.spawn(next);
        }
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.dispatcher.is_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_pool_coalesces_repeat_fires() {
        let mut dispatcher = Dispatcher::new(1);

        assert_eq!(dispatcher.fire(0), Fire::Dispatch);
        assert_eq!(dispatcher.fire(1), Fire::Queued);
        assert_eq!(dispatcher.fire(1), Fire::Coalesced);

        assert_eq!(dispatcher.complete(0), Some(1));
        assert_eq!(dispatcher.complete(1), None);
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn running_job_is_not_stacked() {
        let mut dispatcher = Dispatcher::new(4);

        assert_eq!(dispatcher.fire(0), Fire::Dispatch);
        assert_eq!(dispatcher.fire(0), Fire::AlreadyRunning);
        assert_eq!(dispatcher.complete(0), None);
        assert_eq!(dispatcher.fire(0), Fire::Dispatch);
    }

    #[test]
    fn pending_jobs_run_in_fire_order() {
        let mut dispatcher = Dispatcher::new(1);

        dispatcher.fire(0);
        dispatcher.fire(2);
        dispatcher.fire(1);

        assert_eq!(dispatcher.complete(0), Some(2));
        assert_eq!(dispatcher.complete(2), Some(1));
        assert_eq!(dispatcher.complete(1), None);
    }
}
