//! Per-node statistics.
//!
//! Counters live in the worker's own graph instance and are never shared
//! between threads; the control plane only sees merged snapshots.

use std::collections::BTreeMap;
use std::fmt;

/// Counters maintained by the engine for every node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Number of frames the node processed.
    pub calls: u64,
    /// Number of packets the node processed.
    pub packets: u64,
    /// Packets whose next slot did not exist; they are freed.
    pub invalid_next: u64,
}

impl NodeStats {
    #[inline]
    pub(crate) fn record(&mut self, packets: usize) {
        self.calls += 1;
        self.packets += packets as u64;
    }

    fn merge(&mut self, other: &NodeStats) {
        self.calls += other.calls;
        self.packets += other.packets;
        self.invalid_next += other.invalid_next;
    }
}

/// Snapshot of one node's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeReport {
    pub stats: NodeStats,
    pub counters: BTreeMap<&'static str, u64>,
}

/// Snapshot of a graph's counters, keyed by node name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub nodes: BTreeMap<String, NodeReport>,
}

impl GraphStats {
    /// Add another snapshot (e.g. from another worker) into this one.
    pub fn merge(&mut self, other: &GraphStats) {
        for (name, report) in &other.nodes {
            let entry = self.nodes.entry(name.clone()).or_default();
            entry.stats.merge(&report.stats);
            for (counter, value) in &report.counters {
                *entry.counters.entry(counter).or_default() += value;
            }
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.get(name)
    }

    /// Packets processed by `name`, zero if the node is unknown.
    pub fn packets(&self, name: &str) -> u64 {
        self.node(name).map_or(0, |r| r.stats.packets)
    }

    /// Value of a node specific counter, zero if absent.
    pub fn counter(&self, name: &str, counter: &str) -> u64 {
        self.node(name)
            .and_then(|r| r.counters.get(counter).copied())
            .unwrap_or(0)
    }
}

impl fmt::Display for GraphStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<32} {:>12} {:>14}", "node", "calls", "packets")?;
        for (name, report) in &self.nodes {
            if report.stats.calls == 0 {
                continue;
            }
            writeln!(
                f,
                "{:<32} {:>12} {:>14}",
                name, report.stats.calls, report.stats.packets
            )?;
            for (counter, value) in &report.counters {
                writeln!(f, "  {counter:<30} {value:>27}")?;
            }
        }
        Ok(())
    }
}
