//! Per-queue worker threads.
//!
//! Each receive queue gets one thread that owns a buffer pool, a graph
//! instance and the queue's drivers. A worker receives a batch, runs it
//! through the graph to completion and repeats until told to stop.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use tracing::{debug, error, info, trace};

use crate::arena::VecArena;
use crate::buffer::{BufferPool, PacketRef};
use crate::graph::{Graph, GraphStats, NodeIndex};

/// How long a worker waits for packets before checking for shutdown.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interface driver receive side.
pub trait RxQueue: Send {
    /// Receive up to `max` packets into buffers from `pool`, appending them
    /// to `batch`. Waits up to `timeout` for the first packet and returns
    /// the number received, zero on timeout.
    ///
    /// `BrokenPipe` means the queue is gone for good.
    fn recv_batch(
        &mut self,
        pool: &mut BufferPool,
        batch: &mut VecArena<PacketRef>,
        max: usize,
        timeout: Duration,
    ) -> io::Result<usize>;

    /// Packets discarded because the pool had no free buffer.
    fn no_buffer(&self) -> u64 {
        0
    }
}

/// Receives frames from a crossbeam channel. Used by tests and for
/// injecting packets from the control plane.
pub struct ChannelRx {
    rx: Receiver<Vec<u8>>,
    no_buffer: u64,
}

impl ChannelRx {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        ChannelRx { rx, no_buffer: 0 }
    }

    fn store(&mut self, pool: &mut BufferPool, batch: &mut VecArena<PacketRef>, frame: &[u8]) {
        match pool.alloc_with(frame) {
            Some(r) => batch.push(r),
            None => self.no_buffer += 1,
        }
    }
}

impl RxQueue for ChannelRx {
    fn recv_batch(
        &mut self,
        pool: &mut BufferPool,
        batch: &mut VecArena<PacketRef>,
        max: usize,
        timeout: Duration,
    ) -> io::Result<usize> {
        let start = batch.len();
        let first = match self.rx.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
        };
        self.store(pool, batch, &first);

        for _ in 1..max {
            match self.rx.try_recv() {
                Ok(frame) => self.store(pool, batch, &frame),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(batch.len() - start)
    }

    fn no_buffer(&self) -> u64 {
        self.no_buffer
    }
}

/// Configuration for a worker thread
pub struct WorkerConfig {
    /// Receive queue number, used in thread names and logs
    pub queue: usize,
    pub rx: Box<dyn RxQueue>,
    /// Graph instance owned by this worker
    pub graph: Graph,
    /// Node received batches enter at
    pub entry: NodeIndex,
    pub batch_size: usize,
    /// Buffers in the worker's pool
    pub pool_size: usize,
}

/// Counters a worker returns when it exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub queue: usize,
    pub rx_batches: u64,
    pub rx_packets: u64,
    pub rx_no_buffer: u64,
    pub graph: GraphStats,
}

impl WorkerStats {
    /// Add another worker's counters into these.
    pub fn merge(&mut self, other: &WorkerStats) {
        self.rx_batches += other.rx_batches;
        self.rx_packets += other.rx_packets;
        self.rx_no_buffer += other.rx_no_buffer;
        self.graph.merge(&other.graph);
    }
}

/// Handle to a running worker
pub struct WorkerHandle {
    thread: Option<JoinHandle<WorkerStats>>,
    shutdown: Arc<AtomicBool>,
    pub queue: usize,
}

impl WorkerHandle {
    /// Signal the worker to stop
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker to finish and collect its counters
    pub fn join(mut self) -> Result<WorkerStats, String> {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| format!("Worker {} panicked", self.queue)),
            None => Ok(WorkerStats {
                queue: self.queue,
                ..Default::default()
            }),
        }
    }

    /// Check if the worker is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a worker thread for one receive queue
pub fn spawn_worker(config: WorkerConfig) -> Result<WorkerHandle, String> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let queue = config.queue;

    let thread = thread::Builder::new()
        .name(format!("vnet-q{queue}"))
        .spawn(move || run_worker(config, &shutdown_clone))
        .map_err(|e| format!("Failed to spawn worker thread: {e}"))?;

    Ok(WorkerHandle {
        thread: Some(thread),
        shutdown,
        queue,
    })
}

fn run_worker(config: WorkerConfig, shutdown: &AtomicBool) -> WorkerStats {
    let WorkerConfig {
        queue,
        mut rx,
        mut graph,
        entry,
        batch_size,
        pool_size,
    } = config;

    let mut pool = BufferPool::new(pool_size);
    let mut batch = VecArena::with_capacity(batch_size);
    let mut stats = WorkerStats {
        queue,
        ..Default::default()
    };

    info!(queue, batch_size, pool_size, "Worker started");

    while !shutdown.load(Ordering::SeqCst) {
        batch.clear();
        let n = match rx.recv_batch(&mut pool, &mut batch, batch_size, POLL_INTERVAL) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(queue, "Receive queue closed");
                break;
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => {
                error!(queue, error = %e, "Receive failed, stopping worker");
                break;
            }
        };
        if n == 0 {
            continue;
        }
        stats.rx_batches += 1;
        stats.rx_packets += n as u64;
        trace!(queue, packets = n, "Batch received");

        if let Err(e) = graph.dispatch(entry, &batch, &mut pool) {
            error!(queue, error = %e, "Dispatch failed, stopping worker");
            for r in batch.drain_all() {
                pool.free(r);
            }
            break;
        }
    }

    stats.rx_no_buffer = rx.no_buffer();
    stats.graph = graph.stats();
    info!(queue, packets = stats.rx_packets, "Worker stopped");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Frame, GraphBuilder, Node, NodeContext};

    struct Sink;

    impl Node for Sink {
        fn process(&mut self, cx: &mut NodeContext<'_>, frame: &mut Frame<'_>) {
            for r in frame.refs() {
                cx.pool.free(*r);
            }
        }
    }

    fn sink_graph() -> (Graph, NodeIndex) {
        let mut b = GraphBuilder::new();
        let sink = b.register("sink", Box::new(Sink)).unwrap();
        (b.build().unwrap(), sink)
    }

    #[test]
    fn test_channel_rx_batches() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut rx = ChannelRx::new(rx);
        let mut pool = BufferPool::new(4);
        let mut batch = VecArena::new();
        for i in 0..5u8 {
            tx.send(vec![i; 10]).unwrap();
        }

        let n = rx
            .recv_batch(&mut pool, &mut batch, 3, Duration::from_millis(10))
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(pool.data(&batch[2]), &[2u8; 10]);

        // One buffer left: one packet stored, one dropped.
        let n = rx
            .recv_batch(&mut pool, &mut batch, 2, Duration::from_millis(10))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(rx.no_buffer(), 1);

        drop(tx);
        let err = rx
            .recv_batch(&mut pool, &mut batch, 2, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_worker_runs_until_queue_closes() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (graph, entry) = sink_graph();
        let handle = spawn_worker(WorkerConfig {
            queue: 3,
            rx: Box::new(ChannelRx::new(rx)),
            graph,
            entry,
            batch_size: 8,
            pool_size: 16,
        })
        .unwrap();

        for _ in 0..20 {
            tx.send(vec![0x45; 20]).unwrap();
        }
        drop(tx);

        let stats = handle.join().unwrap();
        assert_eq!(stats.queue, 3);
        assert_eq!(stats.rx_packets, 20);
        assert_eq!(stats.graph.packets("sink"), 20);
    }

    #[test]
    fn test_worker_stops_on_signal() {
        let (_tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let (graph, entry) = sink_graph();
        let handle = spawn_worker(WorkerConfig {
            queue: 0,
            rx: Box::new(ChannelRx::new(rx)),
            graph,
            entry,
            batch_size: 8,
            pool_size: 8,
        })
        .unwrap();

        assert!(handle.is_running());
        handle.stop();
        let stats = handle.join().unwrap();
        assert_eq!(stats.rx_packets, 0);
    }

    #[test]
    fn test_stats_merge() {
        let mut a = WorkerStats {
            rx_packets: 2,
            ..Default::default()
        };
        let b = WorkerStats {
            queue: 1,
            rx_packets: 3,
            rx_batches: 1,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.rx_packets, 5);
        assert_eq!(a.rx_batches, 1);
    }
}
