//! Worker pools executing granule composites: an in-process rayon pool and a
//! batch-queue backed cluster pool behind one interface.

use crate::core::compositor::GranuleComposite;
use crate::params::{ClusterConfig, NetworkConfig};
use crate::types::{MosaicError, MosaicResult};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub type JobId = u64;

/// What a granule unit hands back
pub type TaskResult = MosaicResult<Option<GranuleComposite>>;

/// One independent unit of work
pub struct GranuleTask {
    pub granule: String,
    pub run: Box<dyn FnOnce() -> TaskResult + Send + 'static>,
}

impl GranuleTask {
    pub fn new<F>(granule: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        Self {
            granule: granule.into(),
            run: Box::new(run),
        }
    }

    /// Run the unit, turning a panic into a `WorkerFailed` error
    pub fn execute(self) -> TaskResult {
        let granule = self.granule;
        let run = self.run;
        catch_unwind(AssertUnwindSafe(run)).unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(MosaicError::WorkerFailed(format!("granule {} panicked: {}", granule, message)))
        })
    }
}

/// A finished unit
#[derive(Debug)]
pub struct Completion {
    pub job: JobId,
    pub granule: String,
    pub result: TaskResult,
}

/// Completions of all units submitted before the stream was taken, in the
/// order they finish
pub struct CompletionStream {
    rx: Receiver<Completion>,
    remaining: usize,
}

impl CompletionStream {
    pub fn new(rx: Receiver<Completion>, remaining: usize) -> Self {
        Self { rx, remaining }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Iterator for CompletionStream {
    type Item = Completion;

    fn next(&mut self) -> Option<Completion> {
        if self.remaining == 0 {
            return None;
        }
        match self.rx.recv() {
            Ok(completion) => {
                self.remaining -= 1;
                Some(completion)
            }
            Err(_) => {
                log::error!("{} units never reported back", self.remaining);
                self.remaining = 0;
                None
            }
        }
    }
}

/// Submit units, then drain their completions as they finish
pub trait WorkerPool {
    fn worker_count(&self) -> usize;

    fn submit(&mut self, task: GranuleTask) -> MosaicResult<JobId>;

    /// Stream over everything submitted so far
    fn completions(&mut self) -> CompletionStream;

    /// Free resources held for a consumed unit
    fn release(&mut self, job: JobId);

    fn shutdown(&mut self);
}

/// Channel and bookkeeping shared by both pool backends
struct Outstanding {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    count: usize,
    next_job: JobId,
    active: HashSet<JobId>,
}

impl Outstanding {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            count: 0,
            next_job: 0,
            active: HashSet::new(),
        }
    }

    fn register(&mut self) -> JobId {
        let job = self.next_job;
        self.next_job += 1;
        self.count += 1;
        self.active.insert(job);
        job
    }

    /// Hand out the current receiver; later submissions use a fresh channel
    fn take_stream(&mut self) -> CompletionStream {
        let (tx, rx) = mpsc::channel();
        self.tx = tx;
        let rx = std::mem::replace(&mut self.rx, rx);
        CompletionStream::new(rx, std::mem::take(&mut self.count))
    }
}

/// In-process pool on a dedicated rayon thread pool
pub struct LocalPool {
    pool: rayon::ThreadPool,
    workers: usize,
    state: Outstanding,
}

impl LocalPool {
    pub fn new(workers: usize) -> MosaicResult<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("granule-worker-{}", i))
            .build()
            .map_err(|e| MosaicError::Processing(format!("Failed to start worker pool: {}", e)))?;
        log::info!("Local worker pool started with {} threads", workers);
        Ok(Self {
            pool,
            workers,
            state: Outstanding::new(),
        })
    }
}

impl WorkerPool for LocalPool {
    fn worker_count(&self) -> usize {
        self.workers
    }

    fn submit(&mut self, task: GranuleTask) -> MosaicResult<JobId> {
        let job = self.state.register();
        let tx = self.state.tx.clone();
        self.pool.spawn(move || {
            let granule = task.granule.clone();
            let result = task.execute();
            let _ = tx.send(Completion { job, granule, result });
        });
        Ok(job)
    }

    fn completions(&mut self) -> CompletionStream {
        self.state.take_stream()
    }

    fn release(&mut self, job: JobId) {
        self.state.active.remove(&job);
    }

    fn shutdown(&mut self) {
        if !self.state.active.is_empty() {
            log::debug!("Shutting down with {} unreleased units", self.state.active.len());
        }
        self.state.active.clear();
    }
}

/// Resources requested for every cluster node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub processes: usize,
    pub cores: usize,
    pub memory: String,
    pub walltime: String,
    pub account: Option<String>,
    pub queue: String,
    /// Worker spill directory
    pub scratch_dir: PathBuf,
    /// Environment exported on each node (proxy settings)
    pub environment: Vec<(String, String)>,
}

/// Multi-node batch scheduler holding remote worker processes
pub trait BatchQueue: Send {
    /// Request `nodes` nodes, each running `spec.processes` workers
    fn scale_up(&mut self, nodes: usize, spec: &NodeSpec) -> MosaicResult<()>;

    /// Addresses of workers currently connected
    fn ready_workers(&self) -> MosaicResult<Vec<String>>;

    /// Run `task` on `worker`, reporting through `done`
    fn dispatch(&mut self, worker: &str, job: JobId, task: GranuleTask, done: Sender<Completion>)
        -> MosaicResult<()>;

    /// Cancel or forget a consumed job
    fn release(&mut self, job: JobId);

    /// Tear down all nodes
    fn close(&mut self);
}

impl<Q: BatchQueue + ?Sized> BatchQueue for &mut Q {
    fn scale_up(&mut self, nodes: usize, spec: &NodeSpec) -> MosaicResult<()> {
        (**self).scale_up(nodes, spec)
    }

    fn ready_workers(&self) -> MosaicResult<Vec<String>> {
        (**self).ready_workers()
    }

    fn dispatch(&mut self, worker: &str, job: JobId, task: GranuleTask, done: Sender<Completion>) -> MosaicResult<()> {
        (**self).dispatch(worker, job, task, done)
    }

    fn release(&mut self, job: JobId) {
        (**self).release(job)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Node and process counts for a cluster run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSizing {
    pub nodes: usize,
    pub processes_per_node: usize,
    pub cores_per_node: usize,
}

impl ClusterSizing {
    pub const DEFAULT_NODES: usize = 5;
    pub const DEFAULT_PROCESSES: usize = 4;
    pub const MAX_LARGE_RUN_NODES: usize = 10;

    /// Explicit counts win; otherwise 5 nodes x 4 processes, resized for
    /// large fine-resolution runs
    pub fn resolve(config: &ClusterConfig, item_count: usize, granule_count: usize, resolution: f64) -> Self {
        let processes = config.processes_per_node.unwrap_or(Self::DEFAULT_PROCESSES).max(1);
        let nodes = config.nodes.unwrap_or_else(|| {
            if item_count >= 1000 && resolution <= 30.0 {
                (granule_count / processes).min(Self::MAX_LARGE_RUN_NODES)
            } else {
                Self::DEFAULT_NODES
            }
        });
        Self {
            nodes: nodes.max(1),
            processes_per_node: processes,
            cores_per_node: processes * 5,
        }
    }

    pub fn total_workers(&self) -> usize {
        self.nodes * self.processes_per_node
    }

    pub fn node_spec(&self, config: &ClusterConfig, network: &NetworkConfig) -> NodeSpec {
        NodeSpec {
            processes: self.processes_per_node,
            cores: self.cores_per_node,
            memory: config.memory.clone(),
            walltime: config.walltime.clone(),
            account: config.account.clone(),
            queue: config.queue.clone(),
            scratch_dir: scratch_dir(config),
            environment: network.worker_environment(),
        }
    }
}

/// Per-run spill directory: `<root>/mosaic_spill_<pid>_<millis>`
fn scratch_dir(config: &ClusterConfig) -> PathBuf {
    let root = config
        .scratch_dir
        .clone()
        .or_else(|| dirs::cache_dir().map(|d| d.join("eomosaic")))
        .unwrap_or_else(std::env::temp_dir);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    root.join(format!("mosaic_spill_{}_{}", std::process::id(), millis))
}

/// Pool over a batch queue; blocks in [`ClusterPool::start`] until the
/// requested workers are connected
pub struct ClusterPool<Q: BatchQueue> {
    queue: Q,
    workers: Vec<String>,
    next_worker: usize,
    state: Outstanding,
    closed: bool,
}

impl<Q: BatchQueue> ClusterPool<Q> {
    pub fn start(
        mut queue: Q,
        sizing: ClusterSizing,
        spec: &NodeSpec,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> MosaicResult<Self> {
        std::fs::create_dir_all(&spec.scratch_dir)?;
        log::info!(
            "Requesting {} nodes x {} processes ({} cores, {} memory each)",
            sizing.nodes,
            sizing.processes_per_node,
            spec.cores,
            spec.memory
        );
        queue.scale_up(sizing.nodes, spec)?;

        let required = sizing.total_workers();
        let started = Instant::now();
        let workers = loop {
            let ready = queue.ready_workers()?;
            if ready.len() >= required {
                break ready;
            }
            let waited = started.elapsed();
            if waited >= max_wait {
                queue.close();
                return Err(MosaicError::ClusterTimeout {
                    ready: ready.len(),
                    required,
                    waited_secs: waited.as_secs(),
                });
            }
            log::info!("Waiting for workers: {}/{} ready", ready.len(), required);
            std::thread::sleep(poll_interval);
        };

        log::info!("✅ Cluster ready with {} workers", workers.len());
        Ok(Self {
            queue,
            workers,
            next_worker: 0,
            state: Outstanding::new(),
            closed: false,
        })
    }
}

impl<Q: BatchQueue> WorkerPool for ClusterPool<Q> {
    fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn submit(&mut self, task: GranuleTask) -> MosaicResult<JobId> {
        if self.workers.is_empty() {
            return Err(MosaicError::Processing("Cluster pool has no workers".to_string()));
        }
        let worker = self.workers[self.next_worker % self.workers.len()].clone();
        self.next_worker += 1;

        let job = self.state.register();
        log::debug!("Dispatching granule {} to {}", task.granule, worker);
        if let Err(e) = self.queue.dispatch(&worker, job, task, self.state.tx.clone()) {
            self.state.count -= 1;
            self.state.active.remove(&job);
            return Err(e);
        }
        Ok(job)
    }

    fn completions(&mut self) -> CompletionStream {
        self.state.take_stream()
    }

    fn release(&mut self, job: JobId) {
        if self.state.active.remove(&job) {
            self.queue.release(job);
        }
    }

    fn shutdown(&mut self) {
        if !self.closed {
            self.queue.close();
            self.closed = true;
        }
    }
}

impl<Q: BatchQueue> Drop for ClusterPool<Q> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_pool_collects_all_completions() {
        let mut pool = LocalPool::new(3).unwrap();
        for i in 0..8 {
            pool.submit(GranuleTask::new(format!("G{}", i), || Ok(None))).unwrap();
        }
        let mut seen: Vec<String> = pool.completions().map(|c| c.granule).collect();
        seen.sort();
        assert_eq!(seen.len(), 8);
        assert_eq!(pool.completions().count(), 0);
    }

    #[test]
    fn test_panic_becomes_worker_failed() {
        let mut pool = LocalPool::new(2).unwrap();
        pool.submit(GranuleTask::new("boom", || panic!("corrupt block"))).unwrap();
        pool.submit(GranuleTask::new("fine", || Ok(None))).unwrap();
        let mut failed = 0;
        let mut ok = 0;
        for completion in pool.completions() {
            match completion.result {
                Err(MosaicError::WorkerFailed(msg)) => {
                    assert!(msg.contains("corrupt block"));
                    failed += 1;
                }
                Ok(None) => ok += 1,
                other => panic!("unexpected {:?}", other.map(|_| ())),
            }
            pool.release(completion.job);
        }
        assert_eq!((failed, ok), (1, 1));
    }

    #[test]
    fn test_cluster_sizing() {
        let config = ClusterConfig::default();
        let s = ClusterSizing::resolve(&config, 200, 12, 20.0);
        assert_eq!((s.nodes, s.processes_per_node, s.cores_per_node), (5, 4, 20));

        let s = ClusterSizing::resolve(&config, 1500, 30, 20.0);
        assert_eq!(s.nodes, 7);
        let s = ClusterSizing::resolve(&config, 5000, 200, 10.0);
        assert_eq!(s.nodes, 10);
        let s = ClusterSizing::resolve(&config, 1500, 2, 30.0);
        assert_eq!(s.nodes, 1);
        let s = ClusterSizing::resolve(&config, 1500, 30, 60.0);
        assert_eq!(s.nodes, 5);

        let explicit = ClusterConfig {
            nodes: Some(2),
            processes_per_node: Some(8),
            ..ClusterConfig::default()
        };
        assert_eq!(ClusterSizing::resolve(&explicit, 5000, 200, 10.0).total_workers(), 16);
    }
}
