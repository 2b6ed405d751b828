//! Ingestion and dispatch engine.
//!
//! One ingest thread pulls token batches from the bridge into the current
//! pool buffer and, once the fill threshold is crossed (or a flush is
//! forced), publishes the buffer to every worker queue in one critical
//! section. Worker threads drain exactly their own queues, run the worker
//! tick outside the lock, and drop the buffer reference afterwards. The
//! bounded pool is the only backpressure mechanism: when ingest wraps onto
//! a buffer that still has readers it stalls until the workers catch up.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::bridge::{MmioRegs, TraceBridge, TraceInfo};
use crate::config::Config;
use crate::pool::{BufferPool, TraceBuffer};
use crate::token::TOKEN_BYTES;
use crate::worker::{self, TraceWorker};

/// Counters accumulated by the ingest side, reported at teardown.
#[derive(Debug, Default, Clone)]
pub struct IngestStats {
    /// Tokens pulled from the bridge.
    pub total_tokens: u64,
    /// Buffers published to the worker queues.
    pub buffers_published: u64,
    /// Times ingest had to stall for workers to drain a wrapped buffer.
    pub backpressure_stalls: u64,
    /// Wall time spent inside ingest ticks.
    pub tick_time: Duration,
    /// References still outstanding after the drain; zero on a clean run.
    pub leaked_refs: usize,
}

struct QueueState {
    queues: Vec<VecDeque<Arc<TraceBuffer>>>,
    exit: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

/// Fans published buffers out to the worker thread pool.
pub struct Dispatcher {
    pool: BufferPool,
    threshold: usize,
    subscribers: usize,
    shared: Arc<Shared>,
    threads: Vec<thread::JoinHandle<()>>,
    stats: IngestStats,
}

impl Dispatcher {
    /// Builds the configured workers and spawns the thread pool.
    pub fn new(cfg: &Config, info: &TraceInfo) -> Result<Self> {
        let mut workers = Vec::with_capacity(cfg.workers.len());
        for (index, entry) in cfg.workers.iter().enumerate() {
            // Decorrelate per-worker sampling dither under a fixed seed.
            let seed = cfg.rng_seed.map(|s| s.wrapping_add(index as u64));
            let built = worker::build(&entry.name, &entry.args, info, seed)
                .with_context(|| format!("building worker {} ({})", index, entry.name))?;
            workers.push(built);
        }

        Ok(Self::with_workers(
            cfg.buffers.depth,
            cfg.buffers.token_capacity,
            cfg.buffers.threshold(),
            cfg.trace_threads,
            workers,
        ))
    }

    /// Lower-level constructor taking already-built workers.
    pub fn with_workers(
        depth: usize,
        token_capacity: usize,
        threshold: usize,
        trace_threads: usize,
        workers: Vec<Box<dyn TraceWorker>>,
    ) -> Self {
        let subscribers = workers.len();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queues: (0..subscribers).map(|_| VecDeque::new()).collect(),
                exit: false,
            }),
            cond: Condvar::new(),
        });

        // One thread per worker unless trace_threads reduces the pool, in
        // which case workers are multiplexed round-robin.
        let thread_count = match trace_threads {
            0 => subscribers,
            n => n.min(subscribers),
        };

        let mut assignments: Vec<Vec<(usize, Box<dyn TraceWorker>)>> =
            (0..thread_count).map(|_| Vec::new()).collect();
        for (queue, built) in workers.into_iter().enumerate() {
            assignments[queue % thread_count].push((queue, built));
        }

        let mut threads = Vec::with_capacity(thread_count);
        for (index, assigned) in assignments.into_iter().enumerate() {
            let names: Vec<&str> = assigned.iter().map(|(_, w)| w.name()).collect();
            debug!(thread = index, workers = ?names, "spawning worker thread");

            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("trace-worker-{index}"))
                .spawn(move || run_workers(&shared, assigned))
                .expect("spawning worker thread");
            threads.push(handle);
        }

        Self {
            pool: BufferPool::new(depth, token_capacity),
            threshold,
            subscribers,
            shared,
            threads,
            stats: IngestStats::default(),
        }
    }

    /// Number of workers subscribed to every published buffer.
    pub fn subscribers(&self) -> usize {
        self.subscribers
    }

    /// Outstanding buffer references across the pool.
    pub fn outstanding_refs(&self) -> usize {
        self.pool.total_refs()
    }

    /// One ingest step: pull up to `max_tokens` into the fill buffer and
    /// publish it once the threshold is crossed. Returns the tokens pulled.
    pub fn ingest(&mut self, bridge: &mut dyn TraceBridge, max_tokens: usize) -> Result<usize> {
        let start = Instant::now();
        self.wait_fill_ready();

        let max = max_tokens.min(self.pool.space_left());
        let space = self.pool.fill_space();
        let pulled = bridge.pull(&mut space[..max * TOKEN_BYTES], max)?;

        self.pool.commit(pulled);
        self.stats.total_tokens += pulled as u64;

        if self.pool.fill_count() >= self.threshold {
            self.publish_current();
        }

        self.stats.tick_time += start.elapsed();
        Ok(pulled)
    }

    /// Publishes whatever is sitting in the fill buffer, threshold or not.
    pub fn flush(&mut self) {
        self.wait_fill_ready();
        self.publish_current();
    }

    /// Drains the queues, joins the worker threads and reports statistics.
    pub fn shutdown(mut self) -> IngestStats {
        self.flush();

        {
            let mut state = self.shared.state.lock().expect("work queue lock poisoned");
            state.exit = true;
        }
        self.shared.cond.notify_all();

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during drain");
            }
        }

        self.stats.leaked_refs = self.pool.total_refs();
        if self.stats.leaked_refs != 0 {
            warn!(refs = self.stats.leaked_refs, "buffers still referenced after drain");
        }

        info!(
            tokens = self.stats.total_tokens,
            buffers = self.stats.buffers_published,
            stalls = self.stats.backpressure_stalls,
            tick_time = ?self.stats.tick_time,
            "dispatch engine drained",
        );

        self.stats
    }

    /// Blocks until the fill target from `depth` rotations ago has been
    /// drained by every subscriber.
    fn wait_fill_ready(&mut self) {
        if self.pool.fill_ready() {
            return;
        }

        self.stats.backpressure_stalls += 1;
        let mut state = self.shared.state.lock().expect("work queue lock poisoned");
        while !self.pool.fill_ready() {
            // The timeout guards against a release racing past the check
            // above; releases normally signal the condvar under the lock.
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(state, Duration::from_micros(100))
                .expect("work queue lock poisoned");
            state = guard;
        }
    }

    fn publish_current(&mut self) {
        let Some(buffer) = self.pool.publish(self.subscribers) else {
            return;
        };
        self.stats.buffers_published += 1;

        // Enqueue-to-all under one critical section: every worker observes
        // published buffers in the same order.
        let mut state = self.shared.state.lock().expect("work queue lock poisoned");
        for queue in &mut state.queues {
            queue.push_back(Arc::clone(&buffer));
        }
        drop(state);
        self.shared.cond.notify_all();
    }
}

fn run_workers(shared: &Shared, mut assigned: Vec<(usize, Box<dyn TraceWorker>)>) {
    let mut next = 0;
    let mut state = shared.state.lock().expect("work queue lock poisoned");

    loop {
        let mut popped = None;
        for step in 0..assigned.len() {
            let slot = (next + step) % assigned.len();
            let queue = assigned[slot].0;
            if let Some(buffer) = state.queues[queue].pop_front() {
                popped = Some((slot, buffer));
                next = (slot + 1) % assigned.len();
                break;
            }
        }

        match popped {
            Some((slot, buffer)) => {
                drop(state);
                let worker = &mut assigned[slot].1;
                worker.tick(buffer.data(), buffer.tokens());

                state = shared.state.lock().expect("work queue lock poisoned");
                if buffer.release() {
                    // Last reader: the slot is free again, wake a possibly
                    // stalled ingest thread.
                    shared.cond.notify_all();
                }
            }
            None if state.exit => {
                drop(state);
                for (_, worker) in &mut assigned {
                    worker.finish();
                }
                return;
            }
            None => {
                state = shared.cond.wait(state).expect("work queue lock poisoned");
            }
        }
    }
}

/// A profiling session: bridge lifecycle around the dispatch engine.
pub struct Session<B: TraceBridge> {
    bridge: B,
    regs: MmioRegs,
    dispatcher: Dispatcher,
    pull_tokens: usize,
    poll_interval: Duration,
    trace_enabled: bool,
    trigger_selector: u64,
}

impl<B: TraceBridge> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl<B: TraceBridge> Session<B> {
    pub fn new(cfg: &Config, info: &TraceInfo, bridge: B, regs: MmioRegs) -> Result<Self> {
        Ok(Self {
            bridge,
            regs,
            dispatcher: Dispatcher::new(cfg, info)?,
            pull_tokens: cfg.bridge.pull_tokens,
            poll_interval: cfg.bridge.poll_interval,
            trace_enabled: false,
            trigger_selector: 0,
        })
    }

    /// Announces readiness to the bridge and latches the trigger setup.
    pub fn init(&mut self) -> Result<()> {
        self.bridge
            .mmio_write(self.regs.init_done, 1)
            .context("driving init-done")?;
        self.trace_enabled = self.bridge.mmio_read(self.regs.trace_enable)? != 0;
        self.trigger_selector = self.bridge.mmio_read(self.regs.trigger_selector)?;

        info!(
            enabled = self.trace_enabled,
            trigger = self.trigger_selector,
            workers = self.dispatcher.subscribers(),
            "trace session initialised",
        );
        Ok(())
    }

    /// One poll of the bridge. Returns the number of tokens ingested.
    pub fn tick(&mut self) -> Result<usize> {
        if !self.trace_enabled {
            return Ok(0);
        }
        self.dispatcher.ingest(&mut self.bridge, self.pull_tokens)
    }

    /// Runs init and ticks until the stream ends (replay sources) or data
    /// flow is disabled, yielding for the poll interval on underruns.
    pub fn run_to_end(&mut self) -> Result<()> {
        self.init()?;
        loop {
            let pulled = self.tick()?;
            if pulled == 0 {
                if !self.trace_enabled || self.bridge.stream_ended() {
                    return Ok(());
                }
                thread::sleep(self.poll_interval);
            }
        }
    }

    /// Flushes the partial buffer, drains all workers and tears down.
    pub fn finish(self) -> IngestStats {
        self.dispatcher.shutdown()
    }
}
