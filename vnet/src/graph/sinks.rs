//! Terminal nodes: drop, punt to the control plane, transmit.
//!
//! Every sink releases the buffers it receives back to the pool.

use std::collections::BTreeMap;
use std::io;

use crossbeam_channel::{Sender, TrySendError};
use tracing::trace;

use super::{DropReason, Frame, Node, NodeContext};

/// Name of the drop node.
pub const ERROR_NODE: &str = "error";

/// Name of the punt node.
pub const PUNT_NODE: &str = "punt";

/// Name of the transmit node for interface `iface`.
pub fn output_node_name(iface: &str) -> String {
    format!("{iface}-output")
}

/// Drops packets, counting them per [`DropReason`].
#[derive(Debug, Default)]
pub struct ErrorNode {
    drops: BTreeMap<&'static str, u64>,
}

impl ErrorNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops recorded for `reason`.
    pub fn count(&self, reason: DropReason) -> u64 {
        self.drops.get(reason.name()).copied().unwrap_or(0)
    }
}

impl Node for ErrorNode {
    fn process(&mut self, cx: &mut NodeContext<'_>, frame: &mut Frame<'_>) {
        for r in frame.refs() {
            let reason = cx.pool.drop_reason(r).unwrap_or(DropReason::UNKNOWN);
            trace!(buffer = r.buffer().0, %reason, "Dropping packet");
            *self.drops.entry(reason.name()).or_default() += 1;
            cx.pool.free(*r);
        }
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        self.drops.iter().map(|(k, v)| (*k, *v)).collect()
    }
}

/// Slow-path consumer of punted packets.
pub trait PuntSink: Send {
    /// Take a copy of `frame`. Must not block.
    fn punt(&mut self, frame: &[u8]);

    /// Packets the sink had to discard.
    fn dropped(&self) -> u64 {
        0
    }
}

/// A packet handed to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PuntedPacket {
    /// Receive queue the packet arrived on.
    pub queue: usize,
    pub data: Vec<u8>,
}

/// Punts into a bounded crossbeam channel; full channel means drop.
pub struct ChannelPunt {
    queue: usize,
    tx: Sender<PuntedPacket>,
    dropped: u64,
}

impl ChannelPunt {
    pub fn new(queue: usize, tx: Sender<PuntedPacket>) -> Self {
        ChannelPunt {
            queue,
            tx,
            dropped: 0,
        }
    }
}

impl PuntSink for ChannelPunt {
    fn punt(&mut self, frame: &[u8]) {
        let packet = PuntedPacket {
            queue: self.queue,
            data: frame.to_vec(),
        };
        match self.tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped += 1;
            }
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Hands packets to the control plane through a [`PuntSink`].
pub struct PuntNode {
    sink: Box<dyn PuntSink>,
    punted: u64,
}

impl PuntNode {
    pub fn new(sink: Box<dyn PuntSink>) -> Self {
        PuntNode { sink, punted: 0 }
    }
}

impl Node for PuntNode {
    fn process(&mut self, cx: &mut NodeContext<'_>, frame: &mut Frame<'_>) {
        for r in frame.refs() {
            self.sink.punt(cx.data(r));
            self.punted += 1;
            cx.pool.free(*r);
        }
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![("punted", self.punted), ("punt dropped", self.sink.dropped())]
    }
}

/// Interface driver transmit side.
pub trait TxDriver: Send {
    /// Send one raw frame. Must not block.
    fn transmit(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Transmits packets on one interface.
pub struct TxNode {
    driver: Box<dyn TxDriver>,
    tx_packets: u64,
    tx_errors: u64,
}

impl TxNode {
    pub fn new(driver: Box<dyn TxDriver>) -> Self {
        TxNode {
            driver,
            tx_packets: 0,
            tx_errors: 0,
        }
    }
}

impl Node for TxNode {
    fn process(&mut self, cx: &mut NodeContext<'_>, frame: &mut Frame<'_>) {
        for r in frame.refs() {
            match self.driver.transmit(cx.data(r)) {
                Ok(()) => self.tx_packets += 1,
                Err(e) => {
                    trace!(error = %e, "Transmit failed");
                    self.tx_errors += 1;
                }
            }
            cx.pool.free(*r);
        }
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![("tx packets", self.tx_packets), ("tx errors", self.tx_errors)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::graph::{GraphBuilder, NextIndex};
    use crossbeam_channel::bounded;

    /// Drops everything with a fixed reason.
    struct Dropper;

    impl Node for Dropper {
        fn next_nodes(&self) -> Vec<String> {
            vec![ERROR_NODE.into()]
        }

        fn process(&mut self, cx: &mut NodeContext<'_>, frame: &mut Frame<'_>) {
            for i in 0..frame.len() {
                frame.drop_packet(cx, i, NextIndex(0), DropReason::new("test reason"));
            }
        }
    }

    #[test]
    fn test_error_node_counts_reasons() {
        let mut pool = BufferPool::new(4);
        let mut b = GraphBuilder::new();
        let d = b.register("dropper", Box::new(Dropper)).unwrap();
        b.register(ERROR_NODE, Box::new(ErrorNode::new())).unwrap();
        let mut g = b.build().unwrap();

        let batch: Vec<_> = (0..2).map(|_| pool.alloc_with(&[0]).unwrap()).collect();
        g.dispatch(d, &batch, &mut pool).unwrap();

        assert_eq!(pool.available(), 4);
        assert_eq!(g.stats().counter(ERROR_NODE, "test reason"), 2);
    }

    #[test]
    fn test_channel_punt_drops_when_full() {
        let (tx, rx) = bounded(1);
        let mut punt = ChannelPunt::new(3, tx);
        punt.punt(&[1, 2]);
        punt.punt(&[3]);
        assert_eq!(punt.dropped(), 1);

        let p = rx.try_recv().unwrap();
        assert_eq!(p.queue, 3);
        assert_eq!(p.data, vec![1, 2]);
    }

    struct FailingDriver;

    impl TxDriver for FailingDriver {
        fn transmit(&mut self, _frame: &[u8]) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    #[test]
    fn test_tx_errors_counted_and_buffer_freed() {
        let mut pool = BufferPool::new(2);
        let mut b = GraphBuilder::new();
        let tx = b
            .register(output_node_name("tun0"), Box::new(TxNode::new(Box::new(FailingDriver))))
            .unwrap();
        let mut g = b.build().unwrap();

        let r = pool.alloc_with(&[1, 2, 3]).unwrap();
        g.dispatch(tx, &[r], &mut pool).unwrap();

        assert_eq!(pool.available(), 2);
        assert_eq!(g.stats().counter("tun0-output", "tx errors"), 1);
    }
}
