//! Construction options for a [`Pool`](crate::Pool).
//!
//! Options are built either through the typed builder methods on
//! [`PoolOptions`] or from a JSON document via [`PoolOptions::from_json`],
//! which accepts the camelCase option names used by configuration files.
//!
//! All validation happens synchronously in [`PoolOptions::worker_count`],
//! before any worker thread exists.

use crate::error::{Error, Result};
use core::{fmt, time::Duration};
use serde_json::Value;
use std::sync::Arc;

/// Data handed to every invocation of the init routine.
pub type InitData = Value;

pub(crate) type InitFn =
    Arc<dyn Fn(Option<&InitData>) -> core::result::Result<(), String> + Send + Sync>;

/// Workers kept free for the rest of the process when the count is derived
/// from the CPU count.
pub const DEFAULT_MIN_FREE_THREADS: usize = 1;

/// How long `terminate` waits for the worker threads to acknowledge shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Prefix for worker and controller thread names.
pub const DEFAULT_THREAD_NAME: &str = "ework";

/// Options controlling how many workers a pool runs and how each one is
/// prepared before it receives work.
///
/// When `num_workers` is set it is the exact worker count. Otherwise the count
/// is `max(1, min(max_workers, cpus - min_free_threads))`, where `max_workers`
/// defaults to the logical CPU count.
#[derive(Clone)]
pub struct PoolOptions {
    pub(crate) num_workers: Option<usize>,
    pub(crate) max_workers: Option<usize>,
    pub(crate) min_free_threads: usize,
    pub(crate) init: Option<InitFn>,
    pub(crate) init_data: Option<InitData>,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) name: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            num_workers: None,
            max_workers: None,
            min_free_threads: DEFAULT_MIN_FREE_THREADS,
            init: None,
            init_data: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("num_workers", &self.num_workers)
            .field("max_workers", &self.max_workers)
            .field("min_free_threads", &self.min_free_threads)
            .field("init", &self.init.is_some())
            .field("init_data", &self.init_data)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("name", &self.name)
            .finish()
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the exact number of workers, overriding `max_workers` and
    /// `min_free_threads`.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    /// Caps the CPU-derived worker count.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Number of logical CPUs left unclaimed by the CPU-derived worker count.
    pub fn min_free_threads(mut self, min_free_threads: usize) -> Self {
        self.min_free_threads = min_free_threads;
        self
    }

    /// Registers a routine that runs once on every worker thread before that
    /// worker becomes eligible for jobs.
    ///
    /// State the routine sets up on its thread (for example in a
    /// `thread_local!`) is visible to every job later run by the same worker.
    pub fn init<F, E>(mut self, init: F) -> Self
    where
        F: Fn(Option<&InitData>) -> core::result::Result<(), E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        self.init = Some(Arc::new(move |data| init(data).map_err(|e| e.to_string())));
        self
    }

    /// Data passed to every invocation of the init routine.
    pub fn init_data(mut self, data: InitData) -> Self {
        self.init_data = Some(data);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Prefix used when naming worker and controller threads.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builds options from a JSON object.
    ///
    /// Recognized keys are `numWorkers`, `maxWorkers`, `minFreeThreads`,
    /// `initData`, `shutdownTimeoutMs` and `name`. An `init` key is always
    /// rejected since a routine cannot be expressed as data; register it with
    /// [`PoolOptions::init`] instead.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `value` is not an object or has unknown keys.
    /// - [`Error::Range`] if a count is not a positive (or, for
    ///   `minFreeThreads`, non-negative) integer.
    /// - [`Error::Type`] for `init`, or a `name` that is not a string.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Some(map) = value.as_object() else {
            return Err(Error::Config {
                reason: "options must be an object".to_string(),
            });
        };

        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "numWorkers" => options.num_workers = Some(positive_integer(key, value)?),
                "maxWorkers" => options.max_workers = Some(positive_integer(key, value)?),
                "minFreeThreads" => options.min_free_threads = non_negative_integer(key, value)?,
                "initData" => options.init_data = Some(value.clone()),
                "shutdownTimeoutMs" => {
                    options.shutdown_timeout =
                        Duration::from_millis(non_negative_integer(key, value)? as u64);
                }
                "name" => {
                    options.name = value
                        .as_str()
                        .ok_or_else(|| Error::Type {
                            reason: "options.name must be a string".to_string(),
                        })?
                        .to_string();
                }
                "init" => {
                    return Err(Error::Type {
                        reason: "options.init must be a function".to_string(),
                    });
                }
                other => {
                    return Err(Error::Config {
                        reason: format!("unknown option `{other}`"),
                    });
                }
            }
        }

        Ok(options)
    }

    /// Validates the options and returns the number of workers to spawn on
    /// this machine.
    pub fn worker_count(&self) -> Result<usize> {
        self.worker_count_for(num_cpus::get())
    }

    pub(crate) fn worker_count_for(&self, cpus: usize) -> Result<usize> {
        if self.num_workers == Some(0) {
            return Err(Error::Range {
                reason: "options.numWorkers must be a positive integer".to_string(),
            });
        }
        if self.max_workers == Some(0) {
            return Err(Error::Range {
                reason: "options.maxWorkers must be a positive integer".to_string(),
            });
        }

        if let Some(num_workers) = self.num_workers {
            return Ok(num_workers);
        }

        let max_workers = self.max_workers.unwrap_or(cpus);
        Ok(max_workers
            .min(cpus.saturating_sub(self.min_free_threads))
            .max(1))
    }
}

fn positive_integer(key: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .filter(|n| *n > 0)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| Error::Range {
            reason: format!("options.{key} must be a positive integer"),
        })
}

fn non_negative_integer(key: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| Error::Range {
            reason: format!("options.{key} must be a positive integer or 0"),
        })
}
