//! The node capability: process a frame and choose a next node per packet.

use crate::buffer::{BufferPool, PacketRef};

use super::{DropReason, NodeIndex};

/// Slot in a node's own next-node list.
///
/// Slot `i` refers to the `i`-th name returned by [`Node::next_nodes`]; the
/// graph maps it to a [`NodeIndex`] when it is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NextIndex(pub u16);

impl NextIndex {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A processing stage in the packet graph.
///
/// A node with no next nodes is terminal: the packets it receives never
/// leave it, so it must release their buffers.
pub trait Node: Send {
    /// Names of the nodes this node may redirect to, in slot order.
    fn next_nodes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Slot for packets the node does not explicitly redirect.
    fn default_next(&self) -> NextIndex {
        NextIndex(0)
    }

    /// Process one frame of packets.
    fn process(&mut self, cx: &mut NodeContext<'_>, frame: &mut Frame<'_>);

    /// Node specific counters, reported with the graph statistics.
    fn counters(&self) -> Vec<(&'static str, u64)> {
        Vec::new()
    }
}

/// Per-invocation context handed to a node.
pub struct NodeContext<'a> {
    pub pool: &'a mut BufferPool,
    node: NodeIndex,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(pool: &'a mut BufferPool, node: NodeIndex) -> Self {
        NodeContext { pool, node }
    }

    /// Index of the node being run.
    pub fn node(&self) -> NodeIndex {
        self.node
    }

    #[inline]
    pub fn data(&self, r: &PacketRef) -> &[u8] {
        self.pool.data(r)
    }

    #[inline]
    pub fn data_mut(&mut self, r: &PacketRef) -> &mut [u8] {
        self.pool.data_mut(r)
    }
}

/// The batch a node works on: input references plus one next slot each.
pub struct Frame<'a> {
    refs: &'a mut [PacketRef],
    next: &'a mut [NextIndex],
}

impl<'a> Frame<'a> {
    /// Build a frame. `next` must be as long as `refs`.
    pub fn new(refs: &'a mut [PacketRef], next: &'a mut [NextIndex]) -> Self {
        debug_assert_eq!(refs.len(), next.len());
        Frame { refs, next }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    #[inline]
    pub fn refs(&self) -> &[PacketRef] {
        self.refs
    }

    /// References are mutable so nodes can move the parse cursor.
    #[inline]
    pub fn refs_mut(&mut self) -> &mut [PacketRef] {
        self.refs
    }

    /// Send packet `i` to `next`.
    #[inline]
    pub fn redirect(&mut self, i: usize, next: NextIndex) {
        self.next[i] = next;
    }

    /// Send every packet in the frame to `next`.
    pub fn redirect_all(&mut self, next: NextIndex) {
        self.next.fill(next);
    }

    /// Drop packet `i` through the `error` slot, recording why.
    pub fn drop_packet(
        &mut self,
        cx: &mut NodeContext<'_>,
        i: usize,
        error: NextIndex,
        reason: DropReason,
    ) {
        cx.pool.set_drop_reason(&self.refs[i], reason);
        self.next[i] = error;
    }

    /// Slot currently chosen for packet `i`.
    #[inline]
    pub fn next_of(&self, i: usize) -> NextIndex {
        self.next[i]
    }
}
