use std::fmt;
use std::process::Command;

use anyhow::Context;
use sitecrawl_pipeline::OutputTarget;

use crate::config::WorkerCommand;
use crate::sites::CrawlSite;

/// Everything the crawl worker needs for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub spider: String,
    pub allow_query_string: bool,
    pub allowed_domains: String,
    pub start_urls: String,
    pub output_target: OutputTarget,
}

impl WorkerArgs {
    pub fn from_site(site: &CrawlSite, command: &WorkerCommand) -> Self {
        Self {
            spider: site.spider(command).to_string(),
            allow_query_string: site.allow_query_string,
            allowed_domains: site.allowed_domains.clone(),
            start_urls: site.starting_urls.clone(),
            output_target: site.output_target,
        }
    }

    /// Spider arguments as `-a key=value` pairs
    pub fn cli_args(&self) -> Vec<String> {
        [
            format!("allow_query_string={}", self.allow_query_string),
            format!("allowed_domains={}", self.allowed_domains),
            format!("start_urls={}", self.start_urls),
            format!("output_target={}", self.output_target),
        ]
        .into_iter()
        .flat_map(|arg| [String::from("-a"), arg])
        .collect()
    }
}

impl fmt::Display for WorkerArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spider={}, allow_query_string={}, allowed_domains={}, start_urls={}, output_target={}",
            self.spider,
            self.allow_query_string,
            self.allowed_domains,
            self.start_urls,
            self.output_target
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    /// Terminated by a signal
    Signal,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal => f.write_str("signal"),
        }
    }
}

/// Runs one crawl job to completion. Only the exit status is observed.
pub trait CrawlWorker: Send + Sync {
    fn run(&self, args: &WorkerArgs) -> anyhow::Result<WorkerExit>;
}

/// Launches the configured program as a child process and waits for it
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    command: WorkerCommand,
}

impl ProcessWorker {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    pub fn command(&self, args: &WorkerArgs) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .arg(&args.spider)
            .args(args.cli_args());
        if let Some(workdir) = &self.command.workdir {
            cmd.current_dir(workdir);
        }
        cmd
    }
}

impl CrawlWorker for ProcessWorker {
    fn run(&self, args: &WorkerArgs) -> anyhow::Result<WorkerExit> {
        let status = self
            .command(args)
            .status()
            .with_context(|| format!("Couldn't spawn `{}`", self.command.program))?;
        Ok(status.code().map_or(WorkerExit::Signal, WorkerExit::Code))
    }
}
