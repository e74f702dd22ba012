//! Runtime lifecycle: init, activation, the user main, and shutdown.
//!
//! A job is a set of core threads joined by the fabric. Each core thread
//! builds its state, enters an activation barrier, spawns the polling worker
//! and the task-executor pool, and runs the master loop until the shutdown
//! broadcast. The user body runs on rank 0 only; when it returns, tasking is
//! terminated collectively, a final barrier drains the fabric, and the done
//! flag is broadcast.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::aggregator::Aggregator;
use crate::communicator::Communicator;
use crate::config::Config;
use crate::error::Error;
use crate::gce::GceState;
use crate::memory::{self, MemoryPlan};
use crate::metrics::{Metrics, RunStats};
use crate::scheduler::Scheduler;
use crate::signal;
use crate::task::TaskManager;
use crate::transport::{Core, Ctrl, Fabric};

/// Everything one core owns. Single-thread-confined; workers reach it
/// through the thread-local installed at core bring-up.
pub(crate) struct CoreState {
    pub(crate) core: Core,
    pub(crate) cores: usize,
    pub(crate) locale: usize,
    pub(crate) locale_rank: usize,
    pub(crate) locales: usize,
    pub(crate) locale_cores: usize,
    pub(crate) loop_threshold: i64,
    pub(crate) done: Cell<bool>,
    pub(crate) metrics: Rc<Metrics>,
    pub(crate) sched: Scheduler,
    pub(crate) tasks: TaskManager,
    pub(crate) comm: Communicator,
    pub(crate) gces: Vec<GceState>,
}

thread_local! {
    static CORE: RefCell<Option<Rc<CoreState>>> = const { RefCell::new(None) };
}

/// The calling thread's core state. Panics off the runtime.
pub(crate) fn core() -> Rc<CoreState> {
    CORE.with(|c| c.borrow().clone())
        .expect("not running on a runtime core")
}

pub(crate) fn try_core() -> Option<Rc<CoreState>> {
    CORE.with(|c| c.borrow().clone())
}

/// A configured job, ready to launch.
pub struct Runtime {
    cfg: Config,
    plan: MemoryPlan,
}

impl Runtime {
    /// Validate options, negotiate component footprints against the
    /// locale-shared budget, and install signal handlers. Fatal misfits
    /// surface here.
    pub fn new(cfg: Config) -> Result<Self, Error> {
        cfg.validate()?;
        let plan = memory::plan(&cfg)?;
        debug!(
            node = plan.node_bytes,
            locale_shared = plan.locale_shared_bytes,
            global_heap = plan.global_heap_total,
            aggregator_buffer = plan.aggregator_buffer,
            "memory plan resolved"
        );
        if cfg.install_signal_handlers {
            signal::install();
        }
        if Config::freeze_requested() {
            signal::freeze_for_debugger();
        }
        Ok(Runtime { cfg, plan })
    }

    /// Run `body` on rank 0 with the whole job active, then shut down.
    /// Returns the merged per-core counters.
    pub fn launch<F>(self, body: F) -> Result<RunStats, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let cfg = Arc::new(self.cfg);
        let plan = self.plan;
        let mut fabric = Fabric::new(cfg.cores);
        let sink: Arc<Mutex<Vec<crate::metrics::MetricsSnapshot>>> =
            Arc::new(Mutex::new(Vec::with_capacity(cfg.cores)));

        let mut body_slot = Some(body);
        let mut handles = Vec::with_capacity(cfg.cores);
        for c in 0..cfg.cores {
            let endpoint = fabric.endpoint(c);
            let cfg = Arc::clone(&cfg);
            let plan = plan.clone();
            let sink = Arc::clone(&sink);
            let body = body_slot.take().filter(|_| c == 0);
            let handle = thread::Builder::new()
                .name(format!("core-{c}"))
                .spawn(move || core_main(c, &cfg, &plan, endpoint, body, &sink))
                .map_err(|e| Error::Config(format!("failed to spawn core thread: {e}")))?;
            handles.push(handle);
        }

        let mut panic_msg = None;
        for handle in handles {
            if let Err(payload) = handle.join() {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".into());
                panic_msg = Some(msg);
            }
        }
        if let Some(msg) = panic_msg {
            return Err(Error::WorkerPanic(msg));
        }

        let mut per_core = sink.lock().unwrap_or_else(|p| p.into_inner()).clone();
        per_core.sort_by_key(|m| m.core);
        let stats = RunStats { per_core };
        info!(
            tasks = stats.tasks_executed(),
            messages = stats.messages_delivered(),
            stolen = stats.tasks_stolen(),
            "job complete"
        );
        Ok(stats)
    }
}

/// Validate, launch and finalize in one call.
pub fn run<F>(cfg: Config, body: F) -> Result<RunStats, Error>
where
    F: FnOnce() + Send + 'static,
{
    Runtime::new(cfg)?.launch(body)
}

fn core_main<F>(
    c: Core,
    cfg: &Config,
    plan: &MemoryPlan,
    endpoint: crate::transport::Endpoint,
    body: Option<F>,
    sink: &Mutex<Vec<crate::metrics::MetricsSnapshot>>,
) where
    F: FnOnce() + Send + 'static,
{
    if cfg.set_affinity {
        pin_to_local_rank(c, cfg);
    }

    let metrics = Rc::new(Metrics::default());
    let sched = Scheduler::new(
        cfg.periodic_interval,
        Duration::from_micros(cfg.aggregator_flush_us.max(50)),
        cfg.starting_workers,
        cfg.max_workers,
        cfg.stack_size,
        Rc::clone(&metrics),
    );
    let locale_cores = cfg.locale_cores();
    let neighbors: Vec<Core> = (0..cfg.cores)
        .filter(|&n| n != c)
        .filter(|&n| !cfg.steal_locale_only || n / locale_cores == c / locale_cores)
        .collect();
    let tasks = TaskManager::new(
        cfg.cores,
        neighbors,
        cfg.steal_batch,
        cfg.steal_retries,
        Rc::clone(&metrics),
    );
    let aggregator = Aggregator::new(
        cfg.cores,
        plan.aggregator_buffer,
        Duration::from_micros(cfg.aggregator_flush_us),
        plan.pool_bytes,
        Rc::clone(&metrics),
    );
    let comm = Communicator::new(endpoint, aggregator, Rc::clone(&metrics));
    let gces = (0..cfg.gce_slots)
        .map(|i| GceState::new(i, cfg.cores))
        .collect();
    let state = Rc::new(CoreState {
        core: c,
        cores: cfg.cores,
        locale: c / locale_cores,
        locale_rank: c % locale_cores,
        locales: cfg.cores / locale_cores,
        locale_cores,
        loop_threshold: cfg.loop_threshold,
        done: Cell::new(false),
        metrics: Rc::clone(&metrics),
        sched,
        tasks,
        comm,
        gces,
    });
    CORE.with(|slot| *slot.borrow_mut() = Some(Rc::clone(&state)));
    trace!(core = c, "core activated");

    // Collective activation barrier before any user communication.
    state.comm.barrier(&state);

    state.sched.spawn_periodic(poller_loop);
    state.tasks.set_executors(cfg.starting_workers);
    for _ in 0..cfg.starting_workers {
        state.sched.spawn(TaskManager::executor_loop);
    }
    if let Some(body) = body {
        state.sched.spawn(move || {
            body();
            end_tasks();
        });
    }

    state.sched.run_master(&state);

    sink.lock()
        .unwrap_or_else(|p| p.into_inner())
        .push(metrics.snapshot(c));
    CORE.with(|slot| *slot.borrow_mut() = None);
    trace!(core = c, "core thread exiting");
}

/// Body of the polling worker: the one place that drives transport receive
/// for the scheduler, plus the aggregator age check and an occasional kick
/// for idle thieves.
fn poller_loop() {
    let core = core();
    while !core.done.get() {
        core.comm.poll(&core);
        core.comm.tick();
        core.tasks.steal_kick(&core);
        if signal::take_dump_request() {
            dump_state(&core);
        }
        core.sched.yield_periodic();
    }
    trace!(core = core.core, "polling worker exiting");
}

fn dump_state(core: &CoreState) {
    info!("{}", core.sched);
    info!("{}", core.tasks);
    info!(pooled = core.comm.pooled_buffers(), "{}", core.metrics.snapshot(core.core));
}

/// Rank 0, after the user body: terminate tasking everywhere and wait for
/// the collective confirmation.
fn end_tasks() {
    let core = core();
    debug_assert_eq!(core.core, 0);
    debug!("user main returned; signaling task termination");
    for dst in 0..core.cores {
        core.comm.send_immediate(dst, || {
            let c = crate::runtime::core();
            c.tasks.signal_termination(&c);
        });
    }
    core.comm.flush_all();
    core.tasks.wait_tasks_done(&core);
}

/// Runs on every core when the terminate broadcast lands: enter the final
/// collective barrier, then rank 0 sets the done flag everywhere.
pub(crate) fn spawn_finalizer(core: &CoreState) {
    core.sched.spawn(|| {
        let c = crate::runtime::core();
        c.comm.barrier(&c);
        if c.core == 0 {
            c.comm.broadcast_ctrl(Ctrl::Shutdown);
        }
    });
}

fn pin_to_local_rank(c: Core, cfg: &Config) {
    let base = Config::local_rank().unwrap_or(0) * cfg.locale_cores();
    if let Some(ids) = core_affinity::get_core_ids() {
        if !ids.is_empty() {
            let id = ids[(base + c) % ids.len()];
            core_affinity::set_for_current(id);
            debug!(core = c, cpu = id.id, "pinned core thread");
        }
    }
}
