use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use ework::PoolOptions;

/// Runtime configuration for the `ework-bench` binary.
///
/// All values are parsed from CLI arguments or environment variables. The
/// pool-sizing options map one to one onto [`PoolOptions`]; the rest shape the
/// synthetic workload.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ework-bench",
    version,
    about = "Compare inline CSV parsing against an ework worker pool"
)]
pub struct CliArgs {
    /// Exact number of pool workers. Overrides `max_workers` and
    /// `min_free_threads` when set.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS")]
    pub num_workers: Option<usize>,

    /// Upper bound for the CPU-derived worker count.
    ///
    /// Environment variable: `MAX_WORKERS`
    #[arg(long, env = "MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Logical CPUs left free when deriving the worker count.
    ///
    /// Environment variable: `MIN_FREE_THREADS`
    #[arg(long, env = "MIN_FREE_THREADS", default_value_t = ework::DEFAULT_MIN_FREE_THREADS)]
    pub min_free_threads: usize,

    /// Number of times the document is parsed, both inline and in the pool.
    ///
    /// Environment variable: `BENCH_JOBS`
    #[arg(long, env = "BENCH_JOBS", default_value_t = 50)]
    pub jobs: usize,

    /// Data rows in the generated document.
    ///
    /// Environment variable: `BENCH_ROWS`
    #[arg(long, env = "BENCH_ROWS", default_value_t = 20_000)]
    pub rows: usize,

    /// Columns per row in the generated document.
    ///
    /// Environment variable: `BENCH_COLUMNS`
    #[arg(long, env = "BENCH_COLUMNS", default_value_t = 8)]
    pub columns: usize,

    /// How long to wait for the workers when the pool shuts down.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_MS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_MS", default_value_t = 3_000)]
    pub shutdown_timeout_ms: u64,

    /// Only run the pool, skipping the inline baseline.
    #[arg(long, default_value_t = false)]
    pub skip_sequential: bool,
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub num_workers: Option<usize>,
    pub max_workers: Option<usize>,
    pub min_free_threads: usize,
    pub jobs: usize,
    pub rows: usize,
    pub columns: usize,
    pub shutdown_timeout: Duration,
    pub skip_sequential: bool,
}

impl TryFrom<CliArgs> for BenchConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == Some(0) {
            bail!("NUM_WORKERS must be greater than 0");
        }
        if args.max_workers == Some(0) {
            bail!("MAX_WORKERS must be greater than 0");
        }
        if args.jobs == 0 {
            bail!("BENCH_JOBS must be greater than 0");
        }
        if args.rows == 0 {
            bail!("BENCH_ROWS must be greater than 0");
        }
        if args.columns == 0 {
            bail!("BENCH_COLUMNS must be greater than 0");
        }

        Ok(Self {
            num_workers: args.num_workers,
            max_workers: args.max_workers,
            min_free_threads: args.min_free_threads,
            jobs: args.jobs,
            rows: args.rows,
            columns: args.columns,
            shutdown_timeout: Duration::from_millis(args.shutdown_timeout_ms),
            skip_sequential: args.skip_sequential,
        })
    }
}

impl BenchConfig {
    /// Pool options for this run, without the init routine.
    pub fn pool_options(&self) -> PoolOptions {
        let mut options = PoolOptions::new()
            .min_free_threads(self.min_free_threads)
            .shutdown_timeout(self.shutdown_timeout)
            .name("ework-bench");
        if let Some(num_workers) = self.num_workers {
            options = options.num_workers(num_workers);
        }
        if let Some(max_workers) = self.max_workers {
            options = options.max_workers(max_workers);
        }
        options
    }
}
