//! Runtime configuration.
//!
//! Options mirror the knobs the runtime exposes at job launch: pool sizes,
//! memory fractions, aggregation thresholds and scheduling rates. A handful
//! of environment variables override behavior at startup (see
//! [`Config::freeze_requested`] and the local-rank lookup used for affinity).

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Environment variable that pauses the process at startup to await a
/// debugger attach.
pub const ENV_FREEZE: &str = "MYRIAD_FREEZE";
/// Environment variable that pauses the process on a fatal signal instead of
/// exiting immediately.
pub const ENV_FREEZE_ON_ERROR: &str = "MYRIAD_FREEZE_ON_ERROR";
/// Launcher-supplied local rank, used for CPU affinity.
pub const ENV_LOCAL_RANK: &str = "MYRIAD_LOCAL_RANK";

/// Options controlling a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of cores (one kernel thread each) in the job.
    pub cores: usize,
    /// Cores per locale; cores in the same locale share one memory budget.
    pub cores_per_locale: usize,
    /// Size of the per-core worker pool spawned at activation.
    pub starting_workers: usize,
    /// Hard cap on live workers per core; spawns beyond it wait for a worker
    /// to retire.
    pub max_workers: usize,
    /// Stack size for each worker context, in bytes.
    pub stack_size: usize,
    /// Pin each core thread to the CPU matching its local rank.
    pub set_affinity: bool,
    /// Per-node physical memory in bytes; autodetected when `None`.
    pub node_memsize: Option<u64>,
    /// Fraction of node memory given to the locale-shared heap.
    pub locale_shared_fraction: f64,
    /// Fraction of the locale-shared heap given to the user.
    pub locale_user_heap_fraction: f64,
    /// Fraction of the locale-shared heap given to the global heap.
    pub global_heap_fraction: f64,
    /// Explicit global heap size in bytes; auto-sized from the locale share
    /// when `None`.
    pub global_heap_bytes: Option<u64>,
    /// Round per-core global heap bytes up to 1 GiB hugepage multiples.
    pub global_memory_use_hugepages: bool,
    /// Upper bound on the shared-message-pool footprint, in bytes.
    pub shared_pool_max_size: usize,
    /// Maximum concurrent asynchronous IO operations per node.
    pub io_blocks_per_node: usize,
    /// Size of each asynchronous IO buffer, in MiB.
    pub io_blocksize_mb: usize,
    /// Iteration count below which loop decomposition stops splitting.
    pub loop_threshold: i64,
    /// Maximum tasks transferred by one steal.
    pub steal_batch: usize,
    /// Victims tried per steal round before the thief parks.
    pub steal_retries: usize,
    /// Restrict stealing to cores in the thief's locale.
    pub steal_locale_only: bool,
    /// Per-destination aggregation buffer size in bytes; crossing it flushes.
    pub aggregator_buffer_size: usize,
    /// Age bound in microseconds after which a non-empty buffer is flushed.
    pub aggregator_flush_us: u64,
    /// Ordinary yields between activations of the periodic workers.
    pub periodic_interval: u64,
    /// Number of symmetric global completion events available to the job.
    pub gce_slots: usize,
    /// Install SIGUSR2/SIGSEGV handlers at init (Unix only).
    pub install_signal_handlers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cores: 2,
            cores_per_locale: 0, // 0 = all cores in one locale
            starting_workers: 64,
            max_workers: 4096,
            stack_size: 256 * 1024,
            set_affinity: false,
            node_memsize: None,
            locale_shared_fraction: 0.5,
            locale_user_heap_fraction: 0.25,
            global_heap_fraction: 0.25,
            global_heap_bytes: None,
            global_memory_use_hugepages: false,
            shared_pool_max_size: 4 << 20,
            io_blocks_per_node: 4,
            io_blocksize_mb: 4,
            loop_threshold: 1,
            steal_batch: 16,
            steal_retries: 3,
            steal_locale_only: false,
            aggregator_buffer_size: 64 << 10,
            aggregator_flush_us: 100,
            periodic_interval: 16,
            gce_slots: 8,
            install_signal_handlers: true,
        }
    }
}

impl Config {
    /// Configuration with the given core count and defaults elsewhere.
    pub fn with_cores(cores: usize) -> Self {
        Config {
            cores,
            ..Config::default()
        }
    }

    pub fn starting_workers(mut self, n: usize) -> Self {
        self.starting_workers = n;
        self
    }

    pub fn loop_threshold(mut self, iters: i64) -> Self {
        self.loop_threshold = iters;
        self
    }

    pub fn cores_per_locale(mut self, n: usize) -> Self {
        self.cores_per_locale = n;
        self
    }

    pub fn set_affinity(mut self, pin: bool) -> Self {
        self.set_affinity = pin;
        self
    }

    /// Resolved cores-per-locale (the `0` default means one locale).
    pub(crate) fn locale_cores(&self) -> usize {
        if self.cores_per_locale == 0 {
            self.cores
        } else {
            self.cores_per_locale
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.cores == 0 {
            return Err(Error::Config("cores must be at least 1".into()));
        }
        if self.cores_per_locale != 0 && self.cores % self.cores_per_locale != 0 {
            return Err(Error::Config(format!(
                "cores ({}) must be a multiple of cores_per_locale ({})",
                self.cores, self.cores_per_locale
            )));
        }
        for (name, frac) in [
            ("locale_shared_fraction", self.locale_shared_fraction),
            ("locale_user_heap_fraction", self.locale_user_heap_fraction),
            ("global_heap_fraction", self.global_heap_fraction),
        ] {
            if !(0.0..=1.0).contains(&frac) {
                return Err(Error::Config(format!("{name} must be within [0, 1], got {frac}")));
            }
        }
        if self.locale_user_heap_fraction + self.global_heap_fraction >= 1.0 {
            return Err(Error::Config(
                "user heap and global heap fractions must leave room for runtime components".into(),
            ));
        }
        if self.starting_workers == 0 || self.starting_workers > self.max_workers {
            return Err(Error::Config(format!(
                "starting_workers ({}) must be in 1..=max_workers ({})",
                self.starting_workers, self.max_workers
            )));
        }
        if self.loop_threshold < 1 {
            return Err(Error::Config("loop_threshold must be at least 1".into()));
        }
        if self.steal_batch == 0 {
            return Err(Error::Config("steal_batch must be at least 1".into()));
        }
        if self.aggregator_buffer_size < 1 << 10 {
            return Err(Error::Config(
                "aggregator_buffer_size must be at least 1 KiB".into(),
            ));
        }
        if self.gce_slots == 0 {
            return Err(Error::Config("gce_slots must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether `MYRIAD_FREEZE` asks for a startup pause.
    pub(crate) fn freeze_requested() -> bool {
        env_truthy(ENV_FREEZE)
    }

    /// Whether `MYRIAD_FREEZE_ON_ERROR` asks for a pause on fatal signals.
    pub(crate) fn freeze_on_error() -> bool {
        env_truthy(ENV_FREEZE_ON_ERROR)
    }

    /// Local rank supplied by the launcher, if any. Falls back to
    /// `SLURM_LOCALID` for cluster launchers that export it.
    pub(crate) fn local_rank() -> Option<usize> {
        std::env::var(ENV_LOCAL_RANK)
            .or_else(|_| std::env::var("SLURM_LOCALID"))
            .ok()
            .and_then(|v| v.trim().parse().ok())
    }
}

fn env_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_cores_rejected() {
        let cfg = Config::with_cores(0);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_locale_division() {
        let cfg = Config::with_cores(4).cores_per_locale(3);
        assert!(cfg.validate().is_err());
        let cfg = Config::with_cores(4).cores_per_locale(2);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.locale_cores(), 2);
    }

    #[test]
    fn test_fraction_bounds() {
        let mut cfg = Config::default();
        cfg.global_heap_fraction = 1.5;
        assert!(cfg.validate().is_err());
        let mut cfg = Config::default();
        cfg.locale_user_heap_fraction = 0.6;
        cfg.global_heap_fraction = 0.5;
        assert!(cfg.validate().is_err());
    }
}
