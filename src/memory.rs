//! Locale-shared memory budget and footprint negotiation.
//!
//! At init every heavyweight component reports an estimated footprint; if the
//! sum exceeds the per-core share of the locale-shared heap, each component is
//! asked in turn to shrink into a slice of what remains. A component pushed
//! below its floor fails init fatally.

use tracing::debug;

use crate::config::Config;
use crate::error::Error;
use crate::task::Task;

const PAGE: u64 = 1 << 12;
const HUGEPAGE: u64 = 1 << 30;

/// Smallest useful per-destination aggregation buffer.
const AGGREGATOR_FLOOR: usize = 4 << 10;
/// Smallest useful spare-buffer pool.
const POOL_FLOOR: usize = 64 << 10;
/// Smallest inbox headroom the communicator will accept.
const COMMUNICATOR_FLOOR: usize = 16 << 10;
/// Reserve for one deque's worth of tasks.
const TASK_RESERVE: usize = 1 << 16;

/// Sizes resolved during init; immutable afterwards.
#[derive(Debug, Clone)]
pub(crate) struct MemoryPlan {
    pub node_bytes: u64,
    pub locale_shared_bytes: u64,
    pub user_heap_bytes: u64,
    pub global_heap_per_core: u64,
    pub global_heap_total: u64,
    /// Adjusted per-destination aggregation buffer size.
    pub aggregator_buffer: usize,
    /// Adjusted shared-message-pool bound.
    pub pool_bytes: usize,
    /// Inbox headroom granted to the communicator.
    pub communicator_bytes: usize,
    /// Task-queue reservation granted to the task manager.
    pub task_bytes: usize,
}

/// Detect per-node physical memory, honoring the override.
fn node_memsize(cfg: &Config) -> u64 {
    if let Some(bytes) = cfg.node_memsize {
        return bytes;
    }
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let bytes = sys.total_memory();
    debug!(bytes, "estimated node memory size");
    bytes
}

/// Decide the global heap size. An explicit size wins; otherwise the heap is
/// auto-sized from the locale share, rounded down to page granularity and, in
/// hugepage mode, up to whole 1 GiB pages per core (minimum one).
fn global_heap_init(cfg: &Config, locale_shared: u64) -> (u64, u64) {
    let locale_cores = cfg.locale_cores() as u64;
    if let Some(bytes) = cfg.global_heap_bytes {
        return (bytes / locale_cores.max(1), bytes);
    }
    let sz = (locale_shared as f64 * cfg.global_heap_fraction) as u64;
    let mut bytes_per_core = (sz / locale_cores) & !(PAGE - 1);
    if cfg.global_memory_use_hugepages {
        let pages_per_core = bytes_per_core / HUGEPAGE;
        bytes_per_core = if pages_per_core == 0 {
            debug!("allocating one 1 GiB hugepage per core anyway");
            HUGEPAGE
        } else {
            pages_per_core * HUGEPAGE
        };
    }
    (bytes_per_core, bytes_per_core * cfg.cores as u64)
}

/// One negotiable component: its requested size, its floor, and the
/// denominator of the slice of the remaining budget it is offered when
/// shrinking.
struct Component {
    name: &'static str,
    requested: usize,
    floor: usize,
    share_div: usize,
}

pub(crate) fn plan(cfg: &Config) -> Result<MemoryPlan, Error> {
    let node_bytes = node_memsize(cfg);
    let locale_shared_bytes = (node_bytes as f64 * cfg.locale_shared_fraction) as u64;
    let user_heap_bytes = (locale_shared_bytes as f64 * cfg.locale_user_heap_fraction) as u64;
    let (global_heap_per_core, global_heap_total) = global_heap_init(cfg, locale_shared_bytes);

    let locale_cores = cfg.locale_cores() as u64;
    let global_per_locale = global_heap_per_core * locale_cores;
    let reserved = user_heap_bytes.saturating_add(global_per_locale);
    if reserved >= locale_shared_bytes {
        return Err(Error::Footprint {
            component: "locale-shared heap",
            requested: reserved as usize,
            available: locale_shared_bytes as usize,
        });
    }
    let budget = ((locale_shared_bytes - reserved) / locale_cores) as usize;

    // Requested footprints, derived from configuration the way each component
    // will actually allocate.
    let io_bytes = cfg.io_blocks_per_node * cfg.io_blocksize_mb * (1 << 20) / cfg.locale_cores();
    let mut comp = [
        Component {
            name: "shared message pool",
            requested: cfg.shared_pool_max_size,
            floor: POOL_FLOOR,
            share_div: 4,
        },
        Component {
            name: "communicator",
            requested: cfg.aggregator_buffer_size * 4 + io_bytes,
            floor: COMMUNICATOR_FLOOR,
            share_div: 3,
        },
        Component {
            name: "aggregator",
            requested: cfg.aggregator_buffer_size * cfg.cores,
            floor: AGGREGATOR_FLOOR * cfg.cores,
            share_div: 2,
        },
        Component {
            name: "task manager",
            requested: TASK_RESERVE * std::mem::size_of::<Task>(),
            floor: 1024 * std::mem::size_of::<Task>(),
            share_div: 1,
        },
    ];

    let total: usize = comp.iter().map(|c| c.requested).sum();
    if total > budget {
        // Shrink each component into a slice of what remains, in order.
        let mut remaining = budget;
        for c in comp.iter_mut() {
            let offer = remaining / c.share_div;
            if c.requested > offer {
                if offer < c.floor {
                    return Err(Error::Footprint {
                        component: c.name,
                        requested: c.floor,
                        available: offer,
                    });
                }
                debug!(component = c.name, from = c.requested, to = offer, "shrinking footprint");
                c.requested = offer;
            }
            remaining -= c.requested;
        }
    }

    Ok(MemoryPlan {
        node_bytes,
        locale_shared_bytes,
        user_heap_bytes,
        global_heap_per_core,
        global_heap_total,
        pool_bytes: comp[0].requested,
        communicator_bytes: comp[1].requested,
        aggregator_buffer: comp[2].requested / cfg.cores,
        task_bytes: comp[3].requested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with_node(bytes: u64) -> Config {
        let mut cfg = Config::with_cores(2);
        cfg.node_memsize = Some(bytes);
        cfg
    }

    #[test]
    fn test_plan_comfortable() {
        let plan = plan(&cfg_with_node(8 << 30)).unwrap();
        assert_eq!(plan.node_bytes, 8 << 30);
        assert!(plan.aggregator_buffer >= AGGREGATOR_FLOOR);
        assert!(plan.global_heap_per_core > 0);
        // Auto-sized heap is page aligned.
        assert_eq!(plan.global_heap_per_core % PAGE, 0);
    }

    #[test]
    fn test_plan_explicit_heap() {
        let mut cfg = cfg_with_node(8 << 30);
        cfg.global_heap_bytes = Some(1 << 30);
        let plan = plan(&cfg).unwrap();
        assert_eq!(plan.global_heap_total, 1 << 30);
    }

    #[test]
    fn test_plan_shrinks_when_tight() {
        // Small node: components must shrink below their requests.
        let mut cfg = cfg_with_node(64 << 20);
        cfg.shared_pool_max_size = 32 << 20;
        let plan = plan(&cfg).unwrap();
        assert!(plan.pool_bytes < 32 << 20);
    }

    #[test]
    fn test_plan_fails_when_impossible() {
        let mut cfg = cfg_with_node(1 << 20);
        cfg.locale_user_heap_fraction = 0.9;
        cfg.global_heap_fraction = 0.05;
        assert!(plan(&cfg).is_err());
    }

    #[test]
    fn test_hugepage_rounding() {
        let mut cfg = cfg_with_node(8 << 30);
        cfg.global_memory_use_hugepages = true;
        let plan = plan(&cfg).unwrap();
        assert_eq!(plan.global_heap_per_core % HUGEPAGE, 0);
        assert!(plan.global_heap_per_core >= HUGEPAGE);
    }
}
