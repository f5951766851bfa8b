//! Node graph engine.
//!
//! Nodes are registered by name on a [`GraphBuilder`]. `build()` resolves each
//! node's next-node names to indices once; after that the topology is fixed
//! and the per-packet path never looks up a name.
//!
//! [`Graph::dispatch`] runs a batch to completion: the entry node chooses a
//! next slot for every packet, the engine regroups packets per target node
//! (stable, so packets bound for the same node keep their order) and keeps
//! running nodes with pending packets until everything has reached a terminal
//! node.

mod node;
mod sinks;
mod stats;

pub use node::{Frame, NextIndex, Node, NodeContext};
pub use sinks::{
    ChannelPunt, ERROR_NODE, ErrorNode, PUNT_NODE, PuntNode, PuntSink, PuntedPacket, TxDriver,
    TxNode, output_node_name,
};
pub use stats::{GraphStats, NodeReport, NodeStats};

use std::collections::{HashMap, VecDeque};
use std::fmt;

use thiserror::Error;
use tracing::{debug, trace};

use crate::arena::VecArena;
use crate::buffer::{BufferPool, PacketRef};

/// Index of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub u32);

impl NodeIndex {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Why a packet was sent to the `error` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DropReason(&'static str);

impl DropReason {
    /// Reason recorded when a node drops without saying why.
    pub const UNKNOWN: DropReason = DropReason::new("unknown");

    pub const fn new(name: &'static str) -> Self {
        DropReason(name)
    }

    pub fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Graph construction errors. All of them are fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {0:?} is already registered")]
    DuplicateNode(String),

    #[error("node {node:?} names unknown next node {next:?}")]
    UnresolvedNext { node: String, next: String },

    #[error("node {node:?} has default next slot {slot} but only {count} next nodes")]
    BadDefault {
        node: String,
        slot: usize,
        count: usize,
    },

    #[error("node {node:?} declares {count} next nodes, more than a slot can address")]
    TooManyNext { node: String, count: usize },

    #[error("unknown node index {0}")]
    UnknownNode(u32),
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Collects nodes before the topology is frozen.
#[derive(Default)]
pub struct GraphBuilder {
    names: VecArena<String>,
    nodes: Vec<Box<dyn Node>>,
    by_name: HashMap<String, NodeIndex>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node` under `name`, returning its stable index.
    pub fn register(&mut self, name: impl Into<String>, node: Box<dyn Node>) -> Result<NodeIndex> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(GraphError::DuplicateNode(name));
        }
        let index = NodeIndex(self.nodes.len() as u32);
        self.by_name.insert(name.clone(), index);
        self.names.push(name);
        self.nodes.push(node);
        Ok(index)
    }

    /// Index of an already registered node.
    pub fn lookup(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    /// Resolve every next-node name and freeze the topology.
    pub fn build(self) -> Result<Graph> {
        let count = self.nodes.len();
        let mut next_tables: VecArena<VecArena<NodeIndex>> = VecArena::with_capacity(count);
        let mut defaults: VecArena<NextIndex> = VecArena::with_capacity(count);

        for (name, node) in self.names.iter().zip(&self.nodes) {
            let next_names = node.next_nodes();
            if next_names.len() > usize::from(u16::MAX) {
                return Err(GraphError::TooManyNext {
                    node: name.clone(),
                    count: next_names.len(),
                });
            }

            let mut table = VecArena::with_capacity(next_names.len());
            for next in next_names {
                match self.by_name.get(&next) {
                    Some(&target) => table.push(target),
                    None => {
                        return Err(GraphError::UnresolvedNext {
                            node: name.clone(),
                            next,
                        });
                    }
                }
            }

            let default = node.default_next();
            if !table.is_empty() && default.index() >= table.len() {
                return Err(GraphError::BadDefault {
                    node: name.clone(),
                    slot: default.index(),
                    count: table.len(),
                });
            }

            next_tables.push(table);
            defaults.push(default);
        }

        let mut pending = VecArena::with_capacity(count);
        pending.resize(count);
        let mut queued = VecArena::with_capacity(count);
        queued.resize(count);
        let mut stats = VecArena::with_capacity(count);
        stats.resize(count);

        debug!(nodes = count, "Node graph built");

        Ok(Graph {
            names: self.names,
            by_name: self.by_name,
            next_tables,
            defaults,
            nodes: self.nodes,
            pending,
            current: VecArena::new(),
            next: VecArena::new(),
            ready: VecDeque::with_capacity(count),
            queued,
            stats,
        })
    }
}

/// A built node graph. Owned by one worker.
pub struct Graph {
    names: VecArena<String>,
    by_name: HashMap<String, NodeIndex>,
    next_tables: VecArena<VecArena<NodeIndex>>,
    defaults: VecArena<NextIndex>,

    nodes: Vec<Box<dyn Node>>,

    /// Packets waiting for each node.
    pending: VecArena<VecArena<PacketRef>>,
    /// Frame being processed; swapped with the node's pending arena.
    current: VecArena<PacketRef>,
    next: VecArena<NextIndex>,
    ready: VecDeque<NodeIndex>,
    queued: VecArena<bool>,

    stats: VecArena<NodeStats>,
}

impl Graph {
    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, node: NodeIndex) -> Option<&str> {
        self.names.get(node.index()).map(String::as_str)
    }

    /// Node that slot `slot` of `node` resolves to.
    pub fn next_node(&self, node: NodeIndex, slot: NextIndex) -> Option<NodeIndex> {
        self.next_tables
            .get(node.index())
            .and_then(|t| t.get(slot.index()))
            .copied()
    }

    /// Whether `node` is a terminal sink.
    pub fn is_terminal(&self, node: NodeIndex) -> bool {
        self.next_tables
            .get(node.index())
            .is_some_and(|t| t.is_empty())
    }

    /// Run `batch` through the graph starting at `entry`.
    ///
    /// Returns once every packet has reached a terminal node. On error no
    /// packet has been touched and the caller still owns the buffers.
    pub fn dispatch(
        &mut self,
        entry: NodeIndex,
        batch: &[PacketRef],
        pool: &mut BufferPool,
    ) -> Result<()> {
        let Some(pending) = self.pending.get_mut(entry.index()) else {
            return Err(GraphError::UnknownNode(entry.0));
        };
        if batch.is_empty() {
            return Ok(());
        }
        pending.extend_from_slice(batch);
        self.schedule(entry);

        trace!(entry = entry.0, packets = batch.len(), "Dispatching batch");

        while let Some(node) = self.ready.pop_front() {
            self.queued[node.index()] = false;
            std::mem::swap(&mut self.current, &mut self.pending[node.index()]);
            self.run_node(node, pool);
            self.current.clear();
        }
        Ok(())
    }

    fn schedule(&mut self, node: NodeIndex) {
        let queued = &mut self.queued[node.index()];
        if !*queued {
            *queued = true;
            self.ready.push_back(node);
        }
    }

    /// Process `self.current` with `node` and regroup the packets by target.
    fn run_node(&mut self, node: NodeIndex, pool: &mut BufferPool) {
        let i = node.index();
        let n = self.current.len();
        if n == 0 {
            return;
        }
        self.stats[i].record(n);

        self.next.clear();
        self.next.resize_init(n, self.defaults[i]);
        {
            let mut cx = NodeContext::new(pool, node);
            let mut frame = Frame::new(&mut self.current[..n], &mut self.next[..n]);
            self.nodes[i].process(&mut cx, &mut frame);
        }

        let table = &self.next_tables[i];
        if table.is_empty() {
            return;
        }

        // Stable partition: walk in input order, append to each target.
        for k in 0..n {
            let r = self.current[k];
            let slot = self.next[k];
            let Some(&target) = table.get(slot.index()) else {
                trace!(node = %self.names[i], slot = slot.0, "Invalid next slot, freeing packet");
                self.stats[i].invalid_next += 1;
                pool.free(r);
                continue;
            };
            self.pending[target.index()].push(r);
            let queued = &mut self.queued[target.index()];
            if !*queued {
                *queued = true;
                self.ready.push_back(target);
            }
        }
    }

    /// Snapshot of every node's counters.
    pub fn stats(&self) -> GraphStats {
        let mut out = GraphStats::default();
        for (i, name) in self.names.iter().enumerate() {
            out.nodes.insert(
                name.clone(),
                NodeReport {
                    stats: self.stats[i],
                    counters: self.nodes[i].counters().into_iter().collect(),
                },
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Terminal node that frees what it receives.
    struct Sink;

    impl Node for Sink {
        fn process(&mut self, cx: &mut NodeContext<'_>, frame: &mut Frame<'_>) {
            for r in frame.refs() {
                cx.pool.free(*r);
            }
        }
    }

    /// Sends everything to its first next node.
    struct Pass(Vec<String>);

    impl Node for Pass {
        fn next_nodes(&self) -> Vec<String> {
            self.0.clone()
        }

        fn process(&mut self, _cx: &mut NodeContext<'_>, _frame: &mut Frame<'_>) {}
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut b = GraphBuilder::new();
        b.register("sink", Box::new(Sink)).unwrap();
        let err = b.register("sink", Box::new(Sink)).unwrap_err();
        assert_eq!(err, GraphError::DuplicateNode("sink".into()));
    }

    #[test]
    fn test_unresolved_next_rejected() {
        let mut b = GraphBuilder::new();
        b.register("a", Box::new(Pass(vec!["nowhere".into()])))
            .unwrap();
        match b.build() {
            Err(GraphError::UnresolvedNext { node, next }) => {
                assert_eq!(node, "a");
                assert_eq!(next, "nowhere");
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn test_next_resolved_by_index() {
        let mut b = GraphBuilder::new();
        let a = b
            .register("a", Box::new(Pass(vec!["sink".into()])))
            .unwrap();
        let sink = b.register("sink", Box::new(Sink)).unwrap();
        let g = b.build().unwrap();

        assert_eq!(g.next_node(a, NextIndex(0)), Some(sink));
        assert_eq!(g.next_node(a, NextIndex(1)), None);
        assert!(g.is_terminal(sink));
        assert!(!g.is_terminal(a));
        assert_eq!(g.lookup("sink"), Some(sink));
        assert_eq!(g.name(a), Some("a"));
    }

    #[test]
    fn test_dispatch_counts_and_frees() {
        let mut pool = BufferPool::new(8);
        let mut b = GraphBuilder::new();
        let a = b
            .register("a", Box::new(Pass(vec!["sink".into()])))
            .unwrap();
        b.register("sink", Box::new(Sink)).unwrap();
        let mut g = b.build().unwrap();

        let batch: Vec<_> = (0..3).map(|i| pool.alloc_with(&[i]).unwrap()).collect();
        g.dispatch(a, &batch, &mut pool).unwrap();

        assert_eq!(pool.available(), 8);
        let stats = g.stats();
        assert_eq!(stats.packets("a"), 3);
        assert_eq!(stats.packets("sink"), 3);
        assert_eq!(stats.node("sink").unwrap().stats.calls, 1);
    }

    #[test]
    fn test_dispatch_unknown_entry() {
        let mut pool = BufferPool::new(1);
        let mut b = GraphBuilder::new();
        b.register("sink", Box::new(Sink)).unwrap();
        let mut g = b.build().unwrap();
        let r = pool.alloc().unwrap();
        assert_eq!(
            g.dispatch(NodeIndex(5), &[r], &mut pool),
            Err(GraphError::UnknownNode(5))
        );
    }
}
