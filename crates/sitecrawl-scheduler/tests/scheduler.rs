use std::collections::HashMap;
use std::future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use sitecrawl_scheduler::{
    AllocatorConfig, Clock, CrawlSite, CrawlSites, CrawlWorker, ScheduledJob, Scheduler,
    SchedulerError, SlotAllocator, Trigger, WorkerArgs, WorkerCommand, WorkerExit,
};
use tokio::sync::Notify;

#[derive(Default)]
struct RecordingWorker {
    calls: Mutex<Vec<WorkerArgs>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    busy: Duration,
    exit_code: i32,
}

impl CrawlWorker for RecordingWorker {
    fn run(&self, args: &WorkerArgs) -> anyhow::Result<WorkerExit> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.calls.lock().unwrap().push(args.clone());
        thread::sleep(self.busy);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(WorkerExit::Code(self.exit_code))
    }
}

fn site(name: &str, domain: &str) -> CrawlSite {
    CrawlSite {
        name: name.to_string(),
        allow_query_string: false,
        allowed_domains: domain.to_string(),
        handle_javascript: false,
        starting_urls: format!("https://{domain}"),
        schedule: None,
        output_target: "csv".parse().unwrap(),
    }
}

#[test]
fn scheduled_site_runs_once_at_its_slot() {
    let sites = CrawlSites::from_json(
        r#"[
        {"name": "A", "allow_query_string": false, "allowed_domains": "a.com",
         "handle_javascript": false, "starting_urls": "https://a.com",
         "schedule": "0 0 * * *", "output_target": "csv"},
        {"name": "B", "allow_query_string": false, "allowed_domains": "b.com",
         "handle_javascript": false, "starting_urls": "https://b.com",
         "schedule": "", "output_target": "csv"}
    ]"#,
    )
    .unwrap();

    let scheduled = sites.scheduled().collect::<Vec<_>>();
    assert_eq!(scheduled.len(), 1);
    let a = scheduled[0];
    assert_eq!(a.name, "A");

    let mut allocator = SlotAllocator::new(AllocatorConfig::default()).unwrap();
    let slot = allocator.next_slot().unwrap();
    assert_eq!(
        (slot.day_name(), slot.hour_padded(), slot.minute_padded()),
        (String::from("mon"), String::from("03"), String::from("30"))
    );

    let command = WorkerCommand::default();
    let job = ScheduledJob::from_slot(a, &slot, &command).unwrap();
    let sunday = Utc.with_ymd_and_hms(2025, 3, 2, 10, 0, 0).unwrap();
    assert_eq!(
        job.trigger.next_after(sunday),
        Some(Utc.with_ymd_and_hms(2025, 3, 3, 3, 30, 0).unwrap())
    );

    let worker = RecordingWorker::default();
    assert!(job.execute(&worker));

    let calls = worker.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], WorkerArgs::from_site(a, &command));
    assert_eq!(calls[0].spider, "domain_spider");
    assert_eq!(calls[0].allowed_domains, "a.com");
}

#[test]
fn site_schedule_becomes_cron_trigger() {
    let mut a = site("A", "a.com");
    let command = WorkerCommand::default();
    assert!(matches!(
        ScheduledJob::scheduled(&a, &command),
        Err(SchedulerError::Unscheduled { .. })
    ));

    a.schedule = Some(String::from("not cron"));
    assert!(matches!(
        ScheduledJob::scheduled(&a, &command),
        Err(SchedulerError::Trigger(_))
    ));

    a.schedule = Some(String::from("30 03 * * MON"));
    let job = ScheduledJob::scheduled(&a, &command).unwrap();
    assert_eq!(job.id, "a");
}

#[test]
fn duplicate_job_ids_are_rejected() {
    let worker = Arc::new(RecordingWorker::default());
    let mut scheduler = Scheduler::new(2, worker);
    let command = WorkerCommand::default();

    let first = ScheduledJob::benchmark(&site("A", "a.com"), 0, &command);
    let second = ScheduledJob::benchmark(&site("A", "other.com"), 0, &command);
    assert_eq!(first.id, "benchmark - A");

    scheduler.add_job(first).unwrap();
    assert!(matches!(
        scheduler.add_job(second),
        Err(SchedulerError::DuplicateJob(id)) if id == "benchmark - A"
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_ceiling_is_respected() {
    let worker = Arc::new(RecordingWorker {
        busy: Duration::from_millis(50),
        ..Default::default()
    });
    let mut scheduler = Scheduler::new(2, worker.clone());
    let command = WorkerCommand::default();
    for i in 0..5 {
        let site = site(&format!("Site {i}"), &format!("s{i}.gov"));
        scheduler
            .add_job(ScheduledJob::benchmark(&site, 0, &command))
            .unwrap();
    }

    let summary = scheduler.run(future::pending::<()>()).await;

    assert_eq!(summary.dispatched, 5);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.failed, 0);
    assert_eq!(worker.calls.lock().unwrap().len(), 5);
    assert!(worker.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_worker_does_not_stop_others() {
    let worker = Arc::new(RecordingWorker {
        exit_code: 1,
        ..Default::default()
    });
    let mut scheduler = Scheduler::new(1, worker.clone());
    let command = WorkerCommand::default();
    scheduler
        .add_job(ScheduledJob::benchmark(&site("A", "a.com"), 0, &command))
        .unwrap();
    scheduler
        .add_job(ScheduledJob::benchmark(&site("B", "b.com"), 0, &command))
        .unwrap();

    let summary = scheduler.run(future::pending::<()>()).await;

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(worker.calls.lock().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_waits_for_running_jobs() {
    let worker = Arc::new(RecordingWorker {
        busy: Duration::from_millis(100),
        ..Default::default()
    });
    let mut scheduler = Scheduler::new(1, worker.clone());
    let command = WorkerCommand::default();
    scheduler
        .add_job(ScheduledJob::benchmark(&site("A", "a.com"), 0, &command))
        .unwrap();
    scheduler
        .add_job(ScheduledJob::benchmark(&site("B", "b.com"), 3_600, &command))
        .unwrap();

    let shutdown = tokio::time::sleep(Duration::from_millis(20));
    let summary = scheduler.run(shutdown).await;

    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(worker.active.load(Ordering::SeqCst), 0);
}

/// Runs `scale` times faster than the wall clock, starting at `base`
struct FastClock {
    base: DateTime<Utc>,
    start: Instant,
    scale: u32,
}

impl Clock for FastClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.start.elapsed() * self.scale).unwrap()
    }

    fn until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.now())
            .to_std()
            .map(|d| d / self.scale)
            .unwrap_or(Duration::ZERO)
    }
}

/// Busy for a per-domain wall clock duration, notifies once `last` is done
struct TimedWorker {
    busy: HashMap<&'static str, Duration>,
    calls: Mutex<Vec<String>>,
    last: &'static str,
    done: Arc<Notify>,
}

impl CrawlWorker for TimedWorker {
    fn run(&self, args: &WorkerArgs) -> anyhow::Result<WorkerExit> {
        self.calls.lock().unwrap().push(args.allowed_domains.clone());
        thread::sleep(self.busy[args.allowed_domains.as_str()]);
        if args.allowed_domains == self.last {
            self.done.notify_one();
        }
        Ok(WorkerExit::Code(0))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn recurring_job_coalesces_while_pool_is_saturated() {
    // one clock second every 2ms, jobs on the minute fire every 120ms
    let base = Utc.with_ymd_and_hms(2025, 3, 3, 3, 29, 45).unwrap();
    let clock = FastClock {
        base,
        start: Instant::now(),
        scale: 500,
    };
    let done = Arc::new(Notify::new());
    let worker = Arc::new(TimedWorker {
        busy: HashMap::from([
            ("long.gov", Duration::from_millis(210)),
            ("weekly.gov", Duration::from_millis(120)),
        ]),
        calls: Mutex::new(vec![]),
        last: "weekly.gov",
        done: done.clone(),
    });
    let command = WorkerCommand::default();

    let mut scheduler = Scheduler::new(1, worker.clone()).with_clock(Arc::new(clock));
    scheduler
        .add_job(ScheduledJob::from_site(
            &site("Long", "long.gov"),
            Trigger::once(base),
            &command,
        ))
        .unwrap();
    scheduler
        .add_job(ScheduledJob::from_site(
            &site("Weekly", "weekly.gov"),
            Trigger::cron("* * * * *").unwrap(),
            &command,
        ))
        .unwrap();

    // long: 0-210ms, weekly fires at 30ms (queued), 150ms (coalesced)
    // then runs 210-330ms and its 270ms fire is skipped
    let summary = scheduler.run(async move { done.notified().await }).await;

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.coalesced, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(
        *worker.calls.lock().unwrap(),
        vec![String::from("long.gov"), String::from("weekly.gov")]
    );
}

struct PanickingWorker {
    calls: AtomicUsize,
}

impl CrawlWorker for PanickingWorker {
    fn run(&self, args: &WorkerArgs) -> anyhow::Result<WorkerExit> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if args.allowed_domains == "a.com" {
            panic!("worker crashed");
        }
        Ok(WorkerExit::Code(0))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_worker_frees_its_slot() {
    let worker = Arc::new(PanickingWorker {
        calls: AtomicUsize::new(0),
    });
    let mut scheduler = Scheduler::new(1, worker.clone());
    let command = WorkerCommand::default();
    scheduler
        .add_job(ScheduledJob::benchmark(&site("A", "a.com"), 0, &command))
        .unwrap();
    scheduler
        .add_job(ScheduledJob::benchmark(&site("B", "b.com"), 0, &command))
        .unwrap();

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        scheduler.run(future::pending::<()>()),
    )
    .await
    .unwrap();

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
}
