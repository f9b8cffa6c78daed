use std::fs::{self, File};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, io};

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use sitecrawl_pipeline::{
    CrawlRecord, DedupKey, Delivery, LinkRules, OnError, OutputTarget, Pipeline, PipelineConfig,
    ScopeFilter,
};
use sitecrawl_scheduler::{
    CrawlSite, CrawlSites, ProcessWorker, ScheduledJob, Scheduler, SchedulerConfig, SlotAllocator,
};
use tokio::runtime;

/// Recurring crawl scheduler and delivery pipeline
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    #[command(name = "schedule")]
    Schedule(ScheduleArgs),
    #[command(name = "benchmark")]
    Benchmark(BenchmarkArgs),
    #[command(name = "assign-slots")]
    AssignSlots(AssignSlotsArgs),
    #[command(name = "deliver")]
    Deliver(DeliverArgs),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let file = File::open(path).with_context(|| format!("Couldn't open {path:?}"))?;
                serde_yaml::from_reader(file).with_context(|| format!("Invalid config {path:?}"))
            }
            None => Ok(Self::default()),
        }
    }
}

/// Run every scheduled site on its weekly trigger until interrupted
#[derive(Debug, clap::Args)]
pub struct ScheduleArgs {
    /// JSON file listing the crawl sites
    #[arg(env = "SITECRAWL_SITES_FILE", long, short)]
    pub sites: PathBuf,
    /// Optional yaml configuration file
    #[arg(env = "SITECRAWL_CONFIG", long)]
    pub config: Option<PathBuf>,
    /// Override the maximum number of crawl jobs running at once
    #[arg(env = "SITECRAWL_MAX_WORKERS", long)]
    pub max_workers: Option<usize>,
    /// When quiet no logs are outputted
    #[arg(long, short)]
    pub quiet: bool,
}

impl TryFrom<&ScheduleArgs> for SchedulerConfig {
    type Error = anyhow::Error;

    fn try_from(args: &ScheduleArgs) -> Result<Self, Self::Error> {
        let mut conf = AppConfig::load(args.config.as_deref())?.scheduler;
        if let Some(max_workers) = args.max_workers {
            conf.max_workers = max_workers;
        }
        Ok(conf)
    }
}

pub fn schedule(args: ScheduleArgs) -> anyhow::Result<()> {
    let conf = SchedulerConfig::try_from(&args)?;
    let sites = CrawlSites::from_file(&args.sites)?;

    let mut scheduler = Scheduler::new(
        conf.max_workers,
        Arc::new(ProcessWorker::new(conf.worker.clone())),
    );
    for site in sites.scheduled() {
        scheduler.add_job(ScheduledJob::scheduled(site, &conf.worker)?)?;
    }

    run_scheduler(scheduler)
}

/// Run crawl jobs once, shortly after start, ignoring any schedule
#[derive(Debug, clap::Args)]
#[command(group = clap::ArgGroup::new("input").required(true))]
pub struct BenchmarkArgs {
    /// JSON file listing the crawl sites
    #[arg(group = "input", long, short)]
    pub sites: Option<PathBuf>,
    /// Domains allowed to crawl
    #[arg(group = "input", long, short, requires = "urls")]
    pub domains: Option<String>,
    /// URLs used to start the crawl
    #[arg(long, short, requires = "domains")]
    pub urls: Option<String>,
    /// The site needs javascript rendering
    #[arg(long, conflicts_with = "sites")]
    pub js: bool,
    /// Keep URLs with a query string
    #[arg(long, conflicts_with = "sites")]
    pub query_string: bool,
    #[arg(value_enum, long, default_value = "csv", conflicts_with = "sites")]
    pub output_target: OutputTarget,
    /// Seconds to wait before the jobs start
    #[arg(long, short, default_value_t = 5)]
    pub offset: u32,
    /// Optional yaml configuration file
    #[arg(env = "SITECRAWL_CONFIG", long)]
    pub config: Option<PathBuf>,
    /// Override the maximum number of crawl jobs running at once
    #[arg(env = "SITECRAWL_MAX_WORKERS", long)]
    pub max_workers: Option<usize>,
    /// When quiet no logs are outputted
    #[arg(long, short)]
    pub quiet: bool,
}

pub fn benchmark(args: BenchmarkArgs) -> anyhow::Result<()> {
    let mut conf = AppConfig::load(args.config.as_deref())?.scheduler;
    if let Some(max_workers) = args.max_workers {
        conf.max_workers = max_workers;
    }

    let sites = match (&args.sites, &args.domains, &args.urls) {
        (Some(path), _, _) => CrawlSites::from_file(path)?,
        (None, Some(domains), Some(urls)) => CrawlSites::from_sites(vec![CrawlSite {
            name: String::from("benchmark"),
            allow_query_string: args.query_string,
            allowed_domains: domains.clone(),
            handle_javascript: args.js,
            starting_urls: urls.clone(),
            schedule: None,
            output_target: args.output_target,
        }])?,
        _ => anyhow::bail!("Missing `sites` or `domains` and `urls`"),
    };

    log::info!(
        "Starting benchmark of {} sites in {} seconds",
        sites.len(),
        args.offset
    );
    let mut scheduler = Scheduler::new(
        conf.max_workers,
        Arc::new(ProcessWorker::new(conf.worker.clone())),
    );
    for site in &sites {
        scheduler.add_job(ScheduledJob::benchmark(site, args.offset, &conf.worker))?;
    }

    run_scheduler(scheduler)
}

fn run_scheduler(scheduler: Scheduler) -> anyhow::Result<()> {
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let summary = rt.block_on(scheduler.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Couldn't listen for SIGINT got: {e}");
            std::future::pending::<()>().await;
        }
    }));
    if summary.failed > 0 {
        log::warn!("{} crawl jobs failed", summary.failed);
    }
    Ok(())
}

/// Give every site a weekly slot and write the updated site list
#[derive(Debug, clap::Args)]
pub struct AssignSlotsArgs {
    /// JSON file listing the crawl sites
    #[arg(env = "SITECRAWL_SITES_FILE", long, short)]
    pub sites: PathBuf,
    /// Where to write the updated sites, stdout when absent
    #[arg(long, short)]
    pub output: Option<PathBuf>,
    /// Optional yaml configuration file
    #[arg(env = "SITECRAWL_CONFIG", long)]
    pub config: Option<PathBuf>,
}

pub fn assign_slots(args: AssignSlotsArgs) -> anyhow::Result<()> {
    let conf = AppConfig::load(args.config.as_deref())?.scheduler;
    let mut sites = CrawlSites::from_file(&args.sites)?;
    let mut allocator = SlotAllocator::new(conf.allocator)?;

    let capacity = allocator.capacity();
    let slots = sites
        .assign_slots(&mut allocator)
        .with_context(|| format!("{} sites for {capacity} slots", sites.len()))?;
    for (site, slot) in sites.iter().zip(&slots) {
        log::info!("{} -> {slot}", site.name);
    }

    let json = sites.to_json_pretty()?;
    match args.output {
        Some(path) => {
            fs::write(&path, json + "\n").with_context(|| format!("Couldn't write {path:?}"))?
        }
        None => println!("{json}"),
    }
    Ok(())
}

/// Push crawl records read from stdin through one delivery pipeline
///
/// Each line is either a JSON record `{"url": .., "html_content": ..}` or a bare URL.
#[derive(Debug, clap::Args)]
pub struct DeliverArgs {
    /// Comma separated `host[/path]` entries records must fall within
    #[arg(long)]
    pub scope: String,
    #[arg(value_enum, long)]
    pub output_target: OutputTarget,
    /// Keep URLs with a query string
    #[arg(long)]
    pub allow_query_string: bool,
    #[arg(value_enum, long)]
    pub dedup_key: Option<DedupKey>,
    /// Optional yaml configuration file
    #[arg(env = "SITECRAWL_CONFIG", long)]
    pub config: Option<PathBuf>,
    /// Override output directory of the csv sink
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Override endpoint receiving URL batches
    #[arg(env = "SPIDER_URLS_API", long)]
    pub endpoint_url: Option<String>,
    /// Override endpoint failure handling strategy
    #[arg(value_enum, long)]
    pub on_post_error: Option<OnError>,
    /// Override comma separated search index hosts
    #[arg(env = "ES_HOSTS", long)]
    pub es_hosts: Option<String>,
    #[arg(env = "SPIDER_ES_INDEX_NAME", long)]
    pub index_name: Option<String>,
    #[arg(env = "SPIDER_ES_INDEX_ALIAS", long)]
    pub index_alias: Option<String>,
    #[arg(env = "ES_USER", long, hide_env_values = true)]
    pub es_user: Option<String>,
    #[arg(env = "ES_PASSWORD", long, hide_env_values = true)]
    pub es_password: Option<String>,
    /// When quiet no logs are outputted
    #[arg(long, short)]
    pub quiet: bool,
}

impl TryFrom<&DeliverArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: &DeliverArgs) -> Result<Self, Self::Error> {
        let mut conf = AppConfig::load(args.config.as_deref())?.pipeline;
        if let Some(dedup_key) = args.dedup_key {
            conf.dedup_key = dedup_key;
        }
        if let Some(output_dir) = &args.output_dir {
            conf.file.directory = output_dir.clone();
        }
        if let Some(url) = &args.endpoint_url {
            conf.endpoint.url = Some(url.to_string());
        }
        if let Some(on_post_error) = args.on_post_error {
            conf.endpoint.on_error = on_post_error;
        }
        if let Some(hosts) = &args.es_hosts {
            conf.index.hosts = hosts.to_string();
        }
        if let Some(index_name) = &args.index_name {
            conf.index.index_name = index_name.to_string();
        }
        if let Some(alias) = &args.index_alias {
            conf.index.alias = alias.to_string();
        }
        if let Some(user) = &args.es_user {
            conf.index.username = user.to_string();
        }
        if let Some(password) = &args.es_password {
            conf.index.password = password.to_string();
        }
        Ok(conf)
    }
}

fn parse_record(line: &str) -> anyhow::Result<CrawlRecord> {
    if line.starts_with('{') {
        Ok(serde_json::from_str(line)?)
    } else {
        Ok(CrawlRecord::new(line))
    }
}

pub fn deliver(args: DeliverArgs) -> anyhow::Result<()> {
    let conf = PipelineConfig::try_from(&args)?;
    let rules = LinkRules::with_scope(ScopeFilter::new(&args.scope), args.allow_query_string);
    for rejected in rules.scope().rejected() {
        log::warn!("{rejected}");
    }
    let mut pipeline = Pipeline::open(args.output_target, &conf)?;

    let mut out_of_scope = 0;
    let mut failed = 0;
    for (n, line) in io::stdin().lock().lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = match parse_record(line) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Skipping line {} got: {e}", n + 1);
                continue;
            }
        };
        if let Err(reason) = rules.check(&record.url) {
            log::debug!("Skipping {}: {reason}", record.url);
            out_of_scope += 1;
            continue;
        }
        let url = record.url.clone();
        match pipeline.process(record) {
            Ok(Delivery::Delivered) => {}
            Ok(Delivery::Dropped(reason)) => log::debug!("Record dropped: {reason}"),
            // endpoint failures end the job, other sinks log and move on
            Err(e) if args.output_target == OutputTarget::Endpoint => return Err(e.into()),
            Err(e) => {
                log::error!("Couldn't deliver {url} got: {e}");
                failed += 1;
            }
        }
    }

    let stats = pipeline.close()?;
    log::info!(
        "Delivered {} records, {} duplicates, {} invalid, {out_of_scope} out of scope, {failed} failed",
        stats.delivered,
        stats.duplicates,
        stats.rejected
    );
    Ok(())
}

fn init_logs(quiet: bool) {
    if !quiet {
        if env::var_os("RUST_LOG").is_none() {
            env::set_var(
                "RUST_LOG",
                "sitecrawl_scheduler=info,sitecrawl_pipeline=info,sitecrawl=info",
            );
        }
        env_logger::init();
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.cmd {
        SubCommand::Schedule(args) => {
            init_logs(args.quiet);
            schedule(args)
        }
        SubCommand::Benchmark(args) => {
            init_logs(args.quiet);
            benchmark(args)
        }
        SubCommand::AssignSlots(args) => {
            init_logs(false);
            assign_slots(args)
        }
        SubCommand::Deliver(args) => {
            init_logs(args.quiet);
            deliver(args)
        }
    }
}
