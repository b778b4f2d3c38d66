use crate::error::LoaderError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the loader. Every field has a default so a config file only needs to name the
/// values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Budget in seconds used by `AsyncLoader::tick_default`
    pub time_limit_per_tick: f32,
    /// Budget in seconds for running deferred PostLoad on the main context, capped by the tick budget
    pub finalize_time_limit: f32,
    /// Eagerly enqueue hard dependencies reported by the dependency index
    pub preload_dependencies: bool,
    /// Minimum number of bytes requested from disk by a single uncompressed read
    pub minimum_read_size: u64,
    /// Run the scheduler on a dedicated loading thread. When false, loading is time-sliced on
    /// whatever thread calls `tick`.
    pub multithreaded: bool,
    /// Number of IO worker threads. Zero services reads inline while an archive polls.
    pub io_worker_count: usize,
    /// How long the loading thread waits for new requests when it had nothing to do
    pub idle_wait_ms: u64,
    pub warn_if_time_limit_exceeded: bool,
    pub time_limit_exceeded_multiplier: f32,
    /// Seconds
    pub time_limit_exceeded_min_time: f32,
    /// The finalize pass checks its budget once every this many packages
    pub finalize_time_check_interval: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            time_limit_per_tick: 0.005,
            finalize_time_limit: 0.002,
            preload_dependencies: false,
            minimum_read_size: 32 * 1024,
            multithreaded: true,
            io_worker_count: 2,
            idle_wait_ms: 30,
            warn_if_time_limit_exceeded: false,
            time_limit_exceeded_multiplier: 1.5,
            time_limit_exceeded_min_time: 0.005,
            finalize_time_check_interval: 20,
        }
    }
}

impl LoaderConfig {
    /// Defaults for platforms without threads: time-sliced scheduling and inline IO.
    pub fn single_threaded() -> Self {
        LoaderConfig {
            multithreaded: false,
            io_worker_count: 0,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, LoaderError> {
        let config: LoaderConfig = serde_json::from_str(json)?;
        Ok(config.validated())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, LoaderError> {
        profiling::scope!("LoaderConfig::load_from_file");
        let json_str = std::fs::read_to_string(path)?;
        log::info!("Loaded loader config from {:?}", path);
        Self::from_json_str(&json_str)
    }

    fn validated(mut self) -> Self {
        if self.finalize_time_check_interval == 0 {
            log::warn!("finalize_time_check_interval must be at least 1, using 1");
            self.finalize_time_check_interval = 1;
        }
        if self.minimum_read_size == 0 {
            log::warn!("minimum_read_size must be nonzero, using 1");
            self.minimum_read_size = 1;
        }
        self
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs_f32(self.time_limit_per_tick.max(0.0))
    }

    pub fn finalize_time_limit(&self) -> Duration {
        Duration::from_secs_f32(self.finalize_time_limit.max(0.0))
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn time_limit_exceeded_min_time(&self) -> Duration {
        Duration::from_secs_f32(self.time_limit_exceeded_min_time.max(0.0))
    }
}
