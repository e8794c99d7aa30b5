use std::path::PathBuf;

use crate::error::{EtudeError, EtudeResult};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory request paths are appended to (default: ./html)
    pub doc_root: PathBuf,

    /// Worker pool thread count (default: number of CPUs)
    pub workers: usize,

    /// Connection arena capacity. The connection after this many live ones
    /// receives the busy message (default: 4096)
    pub max_connections: usize,

    /// Bounded task queue depth between the reactor and the workers (default: 10000)
    pub queue_depth: usize,

    /// Readiness events collected per wait call (default: 10000)
    pub max_events: usize,

    /// listen(2) backlog (default: 1024)
    pub backlog: i32,

    /// Pin worker threads to CPU cores (default: false)
    pub pin_workers: bool,

    /// Seconds between metrics log lines, 0 disables them (default: 30)
    pub metrics_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            doc_root: PathBuf::from("./html"),
            workers: num_cpus::get().max(1),
            max_connections: 4096,
            queue_depth: 10_000,
            max_events: 10_000,
            backlog: 1024,
            pin_workers: false,
            metrics_interval_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> EtudeResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Missing keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> EtudeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        Ok(Config {
            doc_root: lookup("ETUDE_DOC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.doc_root),
            workers: parse_or(&lookup, "ETUDE_WORKERS", defaults.workers)?.max(1),
            max_connections: parse_or(&lookup, "ETUDE_MAX_CONNECTIONS", defaults.max_connections)?
                .max(1),
            queue_depth: parse_or(&lookup, "ETUDE_QUEUE_DEPTH", defaults.queue_depth)?.max(1),
            max_events: parse_or(&lookup, "ETUDE_MAX_EVENTS", defaults.max_events)?.max(1),
            backlog: parse_or(&lookup, "ETUDE_BACKLOG", defaults.backlog)?,
            pin_workers: lookup("ETUDE_PIN_WORKERS")
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(defaults.pin_workers),
            metrics_interval_secs: parse_or(
                &lookup,
                "ETUDE_METRICS_INTERVAL",
                defaults.metrics_interval_secs,
            )?,
        })
    }

    pub fn doc_root(mut self, doc_root: impl Into<PathBuf>) -> Self {
        self.doc_root = doc_root.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.max(1);
        self
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> EtudeResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| EtudeError::Config { key, value }),
    }
}
