#![doc = include_str!("../README.md")]

mod config;
mod telemetry;
mod workload;

use anyhow::{anyhow, bail};
use clap::Parser;
use config::{BenchConfig, CliArgs};
use ework::Pool;
use serde_json::json;
use std::{sync::Arc, time::Instant};
use telemetry::init_telemetry;
use workload::{CsvSummary, generate_csv, init_worker, parse_csv, parse_job};

// Workers allocate heavily while parsing; mimalloc keeps that from
// serializing on the system allocator.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = BenchConfig::try_from(args)?;

    init_telemetry()?;

    let document: Arc<str> = generate_csv(config.rows, config.columns).into();
    tracing::info!(
        "Generated {} rows x {} columns ({} bytes), parsing {} times",
        config.rows,
        config.columns,
        document.len(),
        config.jobs
    );

    let baseline = if config.skip_sequential {
        None
    } else {
        Some(run_sequential(&config, &document)?)
    };

    let pooled = run_pool(&config, &document).await?;

    if let Some(baseline) = baseline {
        if baseline != pooled {
            bail!("Pool result {pooled:?} does not match inline result {baseline:?}");
        }
        tracing::info!("Pool and inline results match");
    }

    Ok(())
}

fn run_sequential(config: &BenchConfig, document: &str) -> anyhow::Result<CsvSummary> {
    let started = Instant::now();
    let mut summary = None;
    for _ in 0..config.jobs {
        summary = Some(parse_csv(document, Some(config.columns))?);
    }
    let elapsed = started.elapsed();

    tracing::info!(
        "Inline: {} jobs in {elapsed:?} ({:?} per job)",
        config.jobs,
        elapsed / u32::try_from(config.jobs).unwrap_or(u32::MAX)
    );

    summary.ok_or_else(|| anyhow!("no jobs ran"))
}

async fn run_pool(config: &BenchConfig, document: &Arc<str>) -> anyhow::Result<CsvSummary> {
    let options = config
        .pool_options()
        .init(init_worker)
        .init_data(json!({ "columns": config.columns }));

    let started = Instant::now();
    let pool = Pool::new(|doc: Arc<str>| parse_job(&doc), options)?;
    pool.ready().await?;
    tracing::info!(
        "Pool ready with {} workers after {:?}",
        pool.workers(),
        started.elapsed()
    );

    let started = Instant::now();
    let results = pool
        .map((0..config.jobs).map(|_| Arc::clone(document)))
        .await;
    let elapsed = started.elapsed();
    pool.terminate().await;

    let results = results.map_err(|e| {
        if e.is_terminal() {
            anyhow!("Worker pool went away during the run: {e}")
        } else {
            anyhow!("A parse job failed: {e}")
        }
    })?;
    tracing::info!(
        "Pool: {} jobs in {elapsed:?} ({:?} per job)",
        config.jobs,
        elapsed / u32::try_from(config.jobs).unwrap_or(u32::MAX)
    );

    let Some(first) = results.first().copied() else {
        bail!("no jobs ran");
    };
    if results.iter().any(|summary| *summary != first) {
        bail!("Workers disagree on the parse result");
    }
    Ok(first)
}
