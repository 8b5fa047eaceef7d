//! Command line entry point: run a job manifest to completion.

use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conveyor::{
    ChainStatus, Dispatcher, ExponentialRetryScheduler, Job, JobId, JobQueue, JobState, JobStore,
    Lifecycle, Manifest, ProcessExecutor, StatsCollector,
};

#[derive(Parser)]
#[command(name = "conveyor", version, about = "Dependency-aware job queue runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute every job in a manifest and wait for the graph to resolve.
    Run {
        /// Path to the YAML manifest.
        #[arg(short, long)]
        manifest: PathBuf,
    },
    /// Parse and validate a manifest without running it.
    Validate {
        /// Path to the YAML manifest.
        #[arg(short, long)]
        manifest: PathBuf,
    },
    /// List the job lifecycle states.
    States,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { manifest } => run_manifest(&manifest).await,
        Command::Validate { manifest } => validate_manifest(&manifest),
        Command::States => {
            for state in JobState::all() {
                println!("{state}");
            }
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn validate_manifest(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = Manifest::from_file(path)?;
    println!("{}: {} jobs, manifest is valid", path.display(), manifest.jobs.len());
    Ok(())
}

async fn run_manifest(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = Manifest::from_file(path)?;
    let config = manifest.engine.clone();

    let store = Arc::new(conveyor::InMemoryStore::new());
    let queue = JobQueue::new(Arc::clone(&store));
    let collector = Arc::new(
        StatsCollector::new(store.clone()).with_interval(config.stats_interval),
    );
    let executor = Arc::new(ProcessExecutor::new().with_stats(Arc::clone(&collector)));

    // Resolve manifest names to job identifiers in declaration order.
    let mut ids: HashMap<String, JobId> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for entry in &manifest.jobs {
        let mut job = Job::new(&entry.command)
            .with_args(entry.args.iter().cloned())
            .with_max_retries(entry.max_retries.unwrap_or(config.default_max_retries));
        if let Some(secs) = entry.max_runtime_secs {
            job = job.with_max_runtime(Duration::from_secs(secs));
        }
        for entity in &entry.related_entities {
            job = job.with_related_entity(entity);
        }
        for dep in &entry.depends_on {
            // Validation guarantees the referenced name was submitted already.
            if let Some(dep_id) = ids.get(dep) {
                job = job.with_dependency(*dep_id);
            }
        }

        let id = queue.submit(job).await?;
        tracing::info!(name = %entry.name, job_id = %id, "Submitted manifest job");
        ids.insert(entry.name.clone(), id);
        order.push(entry.name.clone());
    }

    let retry = Arc::new(
        ExponentialRetryScheduler::new(config.retry_base.max(1))
            .with_max_delay(config.max_retry_delay),
    );
    let lifecycle = Lifecycle::new(Arc::clone(&store), retry.clone());
    let dispatcher =
        Dispatcher::with_retry_scheduler(Arc::clone(&store), executor, config.clone(), retry);
    let (handle, join) = dispatcher.start();

    let outcome = tokio::select! {
        result = wait_for_resolution(&store, &lifecycle, &ids) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupt received, shutting down");
            Err("interrupted".into())
        }
    };

    handle.shutdown().await?;
    join.await?;

    print_summary(&store, &ids, &order).await?;
    outcome
}

/// Poll until every submitted chain has resolved one way or the other.
async fn wait_for_resolution(
    store: &Arc<conveyor::InMemoryStore>,
    lifecycle: &Lifecycle<conveyor::InMemoryStore>,
    ids: &HashMap<String, JobId>,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let mut all_resolved = true;
        for id in ids.values() {
            let job = store.get_job(id).await?;
            if lifecycle.chain_resolution(&job).await? == ChainStatus::InFlight {
                all_resolved = false;
                break;
            }
        }
        if all_resolved {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn print_summary(
    store: &Arc<conveyor::InMemoryStore>,
    ids: &HashMap<String, JobId>,
    order: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    for name in order {
        let Some(id) = ids.get(name) else { continue };

        // Report the deepest record in the retry chain.
        let mut job = store.get_job(id).await?;
        let mut attempts = 1usize;
        while let Some(next) = store.retry_jobs(&job.id).await?.into_iter().last() {
            job = next;
            attempts += 1;
        }
        println!("{name}: {} ({} attempt{})", job.state, attempts, if attempts == 1 { "" } else { "s" });
    }
    Ok(())
}
