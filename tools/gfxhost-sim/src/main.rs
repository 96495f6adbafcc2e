#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use gfxhost_cdma::opcodes;
use gfxhost_cdma::HostGeneration;
use gfxhost_channel::{
    simulated_host, ChannelStatsSnapshot, Gather, Host, HostConfig, JobBuilder,
};
use gfxhost_syncpt::Fence;
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "gfxhost-sim",
    about = "Run a synthetic multi-threaded submission workload against simulated channels."
)]
struct Args {
    /// Host configuration JSON (defaults to GFXHOST_* environment variables)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the hardware generation (v1 or v2)
    #[arg(long, value_name = "GEN")]
    generation: Option<HostGeneration>,

    /// Number of submitting threads
    #[arg(long, default_value_t = 4)]
    threads: u32,

    /// Jobs submitted by each thread
    #[arg(long, default_value_t = 100)]
    jobs: u32,

    /// Gathers per job; each gather performs one syncpoint increment
    #[arg(long, default_value_t = 2)]
    gathers: u32,

    /// Mark every Nth job as serializing (0 disables)
    #[arg(long, default_value_t = 4)]
    serialize_every: u32,

    /// Make every Nth job wait for the latest job of the next thread (0 disables)
    #[arg(long, default_value_t = 3)]
    cross_fence_every: u32,

    /// Submit every Nth job as a null kickoff (0 disables)
    #[arg(long, default_value_t = 0)]
    null_kickoff_every: u32,

    /// How long to wait for the workload to drain
    #[arg(long, value_name = "MS", default_value_t = 10_000)]
    timeout_ms: u64,

    /// Print the summary as pretty JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pretty: bool,
}

#[derive(Debug, Serialize)]
struct SyncptSummary {
    id: u32,
    name: Option<String>,
    current: u32,
    max: u32,
}

#[derive(Debug, Serialize)]
struct Summary {
    generation: HostGeneration,
    threads: u32,
    jobs: u64,
    completed: u64,
    failures: Vec<String>,
    elapsed_ms: u64,
    channels: BTreeMap<String, ChannelStatsSnapshot>,
    syncpts: Vec<SyncptSummary>,
}

fn every(n: u32, i: u32) -> bool {
    n != 0 && i % n == n - 1
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let summary = run(&args)?;
    let json = if args.pretty {
        serde_json::to_string_pretty(&summary)?
    } else {
        serde_json::to_string(&summary)?
    };
    println!("{json}");

    if !summary.failures.is_empty() {
        bail!("{} submission(s) failed", summary.failures.len());
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<HostConfig> {
    let mut config = match &args.config {
        Some(path) => HostConfig::from_path(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => HostConfig::from_env().context("load config from environment")?,
    };
    if let Some(generation) = args.generation {
        config.generation = generation;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> anyhow::Result<Summary> {
    if args.threads == 0 || args.gathers == 0 {
        bail!("--threads and --gathers must be non-zero");
    }

    let config = load_config(args)?;
    let generation = config.generation;
    let (host, engines) = simulated_host(config).context("build simulated host")?;
    let host = Arc::new(host);
    let workers = engines
        .iter()
        .map(|engine| engine.spawn_worker())
        .collect::<Result<Vec<_>, _>>()
        .context("spawn simulator workers")?;

    tracing::info!(
        threads = args.threads,
        jobs = args.jobs,
        channels = host.channels().len(),
        ?generation,
        "starting workload"
    );

    let latest: Arc<Mutex<Vec<Option<Fence>>>> =
        Arc::new(Mutex::new(vec![None; args.threads as usize]));
    let completed = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let handles = (0..args.threads)
        .map(|t| {
            let syncpt_id = host
                .alloc_syncpt(&format!("worker{t}"), false)
                .with_context(|| format!("allocate syncpoint for worker {t}"))?;
            let ctx = WorkerCtx {
                index: t,
                syncpt_id,
                host: host.clone(),
                latest: latest.clone(),
                completed: completed.clone(),
            };
            let args = WorkerArgs::from(args);
            thread::Builder::new()
                .name(format!("worker{t}"))
                .spawn(move || ctx.run(&args))
                .context("spawn worker thread")
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut failures = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(report) => failures.extend(report),
            Err(_) => failures.push("worker thread panicked".to_owned()),
        }
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    if let Err(err) = host.flush(timeout) {
        failures.push(format!("flush: {err}"));
    }
    // Completion callbacks run on the simulator threads; joining them settles the count.
    drop(workers);
    for engine in &engines {
        if let Some(fault) = engine.fault() {
            failures.push(format!("{}: {fault}", engine.name()));
        }
    }

    Ok(Summary {
        generation,
        threads: args.threads,
        jobs: u64::from(args.threads) * u64::from(args.jobs),
        completed: completed.load(Ordering::SeqCst),
        failures,
        elapsed_ms: started.elapsed().as_millis() as u64,
        channels: host.stats(),
        syncpts: syncpt_summary(&host),
    })
}

fn syncpt_summary(host: &Host) -> Vec<SyncptSummary> {
    host.registry()
        .iter()
        .filter(|sp| sp.is_assigned() || sp.read_max() != 0)
        .map(|sp| SyncptSummary {
            id: sp.id(),
            name: sp.name(),
            current: sp.read_current(),
            max: sp.read_max(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct WorkerArgs {
    threads: u32,
    jobs: u32,
    gathers: u32,
    serialize_every: u32,
    cross_fence_every: u32,
    null_kickoff_every: u32,
    timeout: Duration,
}

impl From<&Args> for WorkerArgs {
    fn from(args: &Args) -> Self {
        Self {
            threads: args.threads,
            jobs: args.jobs,
            gathers: args.gathers,
            serialize_every: args.serialize_every,
            cross_fence_every: args.cross_fence_every,
            null_kickoff_every: args.null_kickoff_every,
            timeout: Duration::from_millis(args.timeout_ms),
        }
    }
}

struct WorkerCtx {
    index: u32,
    syncpt_id: u32,
    host: Arc<Host>,
    latest: Arc<Mutex<Vec<Option<Fence>>>>,
    completed: Arc<AtomicU64>,
}

impl WorkerCtx {
    /// Submits the worker's jobs and returns a description of every failure.
    fn run(self, args: &WorkerArgs) -> Vec<String> {
        let mut failures = Vec::new();
        let channel_id = self.index % self.host.channels().len() as u32;
        let class_id = match self.host.channel(channel_id) {
            Ok(channel) => channel.class_id(),
            Err(err) => return vec![err.to_string()],
        };

        let buffer = match self.host.memory().alloc_with(&[
            opcodes::setclass(class_id, 0x20, 0b1),
            self.index,
            opcodes::imm_incr_syncpt(opcodes::COND_OP_DONE, self.syncpt_id),
        ]) {
            Ok(buffer) => buffer,
            Err(err) => return vec![format!("worker{}: {err}", self.index)],
        };

        let mut last = None;
        for i in 0..args.jobs {
            let null_kickoff = every(args.null_kickoff_every, i);
            if null_kickoff {
                // CPU increments would otherwise complete jobs the engine has not run yet.
                if let Err(msg) = self.wait(last, args.timeout) {
                    failures.push(msg);
                }
            }

            let mut builder = JobBuilder::new()
                .incr(self.syncpt_id, args.gathers)
                .serialize(every(args.serialize_every, i))
                .null_kickoff(null_kickoff);

            let neighbour = (self.index + 1) % args.threads;
            let cross = every(args.cross_fence_every, i)
                .then(|| self.latest.lock().ok().and_then(|l| l[neighbour as usize]))
                .flatten();
            for g in 0..args.gathers {
                let mut gather = Gather::new(&buffer, 0, 3);
                if g == 0 {
                    if let Some(fence) = cross {
                        gather = gather.after(fence);
                    }
                }
                builder = builder.gather_with(gather);
            }

            let completed = self.completed.clone();
            let job = builder
                .on_complete(move |_| {
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .build();

            match self.host.submit(channel_id, job) {
                Ok(receipt) => {
                    for warning in &receipt.warnings {
                        failures.push(format!("worker{} job {i}: {warning:?}", self.index));
                    }
                    last = receipt.fence(self.syncpt_id);
                    if let Ok(mut latest) = self.latest.lock() {
                        latest[self.index as usize] = last;
                    }
                }
                Err(err) => failures.push(format!("worker{} job {i}: {err}", self.index)),
            }
        }

        if let Err(msg) = self.wait(last, args.timeout) {
            failures.push(msg);
        }
        tracing::debug!(worker = self.index, jobs = args.jobs, "worker finished");
        failures
    }

    fn wait(&self, fence: Option<Fence>, timeout: Duration) -> Result<(), String> {
        let Some(fence) = fence else {
            return Ok(());
        };
        match self.host.wait(fence.id, fence.thresh, timeout) {
            Ok(outcome) if outcome.is_ready() => Ok(()),
            Ok(_) => Err(format!(
                "worker{}: timed out waiting for syncpoint {} to reach {}",
                self.index, fence.id, fence.thresh
            )),
            Err(err) => Err(format!("worker{}: {err}", self.index)),
        }
    }
}
