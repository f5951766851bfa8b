//! IPv4 graph nodes: input, rewrite and unresolved-neighbor handling.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::graph::{
    DropReason, ERROR_NODE, Frame, GraphError, NextIndex, Node, NodeContext, PUNT_NODE,
    output_node_name,
};
use crate::wire::{IPV4_HEADER_LEN, Ipv4Header, PacketHeader, WireError, checksum};

use super::{Flow, Ip4Tables};

pub const INPUT_NODE: &str = "ip4-input";
pub const INPUT_VALID_CHECKSUM_NODE: &str = "ip4-input-valid-checksum";
pub const REWRITE_NODE: &str = "ip4-rewrite";
pub const ARP_NODE: &str = "ip4-arp";

pub const TRUNCATED: DropReason = DropReason::new("ip4 truncated");
pub const BAD_HEADER_LENGTH: DropReason = DropReason::new("ip4 bad header length");
pub const BAD_VERSION: DropReason = DropReason::new("ip4 bad version");
pub const BAD_CHECKSUM: DropReason = DropReason::new("ip4 bad checksum");
pub const LENGTH_MISMATCH: DropReason = DropReason::new("ip4 length mismatch");
pub const TTL_EXPIRED: DropReason = DropReason::new("ip4 ttl expired");

// Slots shared by every ip4 node.
const NEXT_DROP: NextIndex = NextIndex(0);
const NEXT_PUNT: NextIndex = NextIndex(1);

// Rewrite node: output interfaces follow the shared slots.
const REWRITE_FIRST_OUTPUT: u16 = 2;

// Input node slots.
const INPUT_NEXT_REWRITE: NextIndex = NextIndex(2);
const INPUT_NEXT_ARP: NextIndex = NextIndex(3);

fn parse_error_reason(e: &WireError) -> DropReason {
    match e {
        WireError::BadHeaderLength(_) => BAD_HEADER_LENGTH,
        WireError::BadVersion(_) => BAD_VERSION,
        _ => TRUNCATED,
    }
}

/// `ip4-input` and `ip4-input-valid-checksum`.
///
/// Validates the header, trims link padding to the IPv4 total length and
/// classifies: local destinations are punted, destinations with a known
/// neighbor go to `ip4-rewrite`, everything else to `ip4-arp`.
pub struct InputNode {
    tables: Arc<Ip4Tables>,
    verify_checksum: bool,
    local: u64,
    forward: u64,
    unresolved: u64,
}

impl InputNode {
    pub fn new(tables: Arc<Ip4Tables>) -> Self {
        InputNode {
            tables,
            verify_checksum: true,
            local: 0,
            forward: 0,
            unresolved: 0,
        }
    }

    /// Input for packets whose checksum the driver already checked.
    pub fn valid_checksum(tables: Arc<Ip4Tables>) -> Self {
        InputNode {
            verify_checksum: false,
            ..Self::new(tables)
        }
    }

    fn classify(&mut self, data: &[u8]) -> Result<(NextIndex, usize), DropReason> {
        let (h, payload) = Ipv4Header::parse(data).map_err(|e| parse_error_reason(&e))?;
        if self.verify_checksum && !Ipv4Header::verify_checksum(data) {
            return Err(BAD_CHECKSUM);
        }
        let total = h.total_len();
        if total < h.header_len() || total > data.len() {
            return Err(LENGTH_MISMATCH);
        }

        let payload = &payload[..total - h.header_len()];
        trace!(flow = %Flow::extract(&h, payload), "ip4 input");

        let next = if self.tables.is_local(h.dst) {
            self.local += 1;
            NEXT_PUNT
        } else if self.tables.neighbor(h.dst).is_some() {
            self.forward += 1;
            INPUT_NEXT_REWRITE
        } else {
            self.unresolved += 1;
            INPUT_NEXT_ARP
        };
        Ok((next, total))
    }
}

impl Node for InputNode {
    fn next_nodes(&self) -> Vec<String> {
        vec![
            ERROR_NODE.into(),
            PUNT_NODE.into(),
            REWRITE_NODE.into(),
            ARP_NODE.into(),
        ]
    }

    fn default_next(&self) -> NextIndex {
        NEXT_PUNT
    }

    fn process(&mut self, cx: &mut NodeContext<'_>, frame: &mut Frame<'_>) {
        for i in 0..frame.len() {
            let r = frame.refs()[i];
            match self.classify(cx.data(&r)) {
                Ok((next, total)) => {
                    frame.refs_mut()[i].truncate(total);
                    frame.redirect(i, next);
                }
                Err(reason) => frame.drop_packet(cx, i, NEXT_DROP, reason),
            }
        }
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("local", self.local),
            ("forward", self.forward),
            ("unresolved", self.unresolved),
        ]
    }
}

/// `ip4-rewrite`: decrement TTL, fix the checksum, pick the output node.
pub struct RewriteNode {
    tables: Arc<Ip4Tables>,
    /// Interface name to next slot.
    outputs: BTreeMap<String, NextIndex>,
}

/// Next slot of the `i`th output interface, if a slot can address it.
fn output_slot(i: usize) -> Option<NextIndex> {
    u16::try_from(i)
        .ok()?
        .checked_add(REWRITE_FIRST_OUTPUT)
        .map(NextIndex)
}

impl RewriteNode {
    /// Fails if there are more output interfaces than next slots.
    pub fn new(tables: Arc<Ip4Tables>) -> Result<Self, GraphError> {
        let interfaces = tables.interfaces();
        let count = interfaces.len() + usize::from(REWRITE_FIRST_OUTPUT);
        let outputs = interfaces
            .into_iter()
            .enumerate()
            .map(|(i, iface)| {
                let slot = output_slot(i).ok_or_else(|| GraphError::TooManyNext {
                    node: REWRITE_NODE.to_string(),
                    count,
                })?;
                Ok((iface.to_string(), slot))
            })
            .collect::<Result<_, GraphError>>()?;
        Ok(RewriteNode { tables, outputs })
    }

    fn rewrite(&self, data: &mut [u8]) -> Result<NextIndex, DropReason> {
        let (mut h, _) = Ipv4Header::parse(data).map_err(|e| parse_error_reason(&e))?;
        if h.ttl <= 1 {
            return Err(TTL_EXPIRED);
        }
        h.ttl -= 1;

        if h.header_len() == IPV4_HEADER_LEN {
            h.checksum = h.compute_checksum();
            data[..IPV4_HEADER_LEN].copy_from_slice(&h.to_bytes());
        } else {
            let len = h.header_len();
            data[8] = h.ttl;
            data[10..12].copy_from_slice(&[0, 0]);
            let sum = checksum(&data[..len]);
            data[10..12].copy_from_slice(&sum.to_wire());
        }

        let next = self
            .tables
            .neighbor(h.dst)
            .and_then(|iface| self.outputs.get(iface))
            .copied()
            .unwrap_or(NEXT_PUNT);
        Ok(next)
    }
}

impl Node for RewriteNode {
    fn next_nodes(&self) -> Vec<String> {
        let mut next = vec![ERROR_NODE.to_string(), PUNT_NODE.to_string()];
        next.extend(self.outputs.keys().map(|iface| output_node_name(iface)));
        next
    }

    fn default_next(&self) -> NextIndex {
        NEXT_PUNT
    }

    fn process(&mut self, cx: &mut NodeContext<'_>, frame: &mut Frame<'_>) {
        for i in 0..frame.len() {
            let r = frame.refs()[i];
            match self.rewrite(cx.data_mut(&r)) {
                Ok(next) => frame.redirect(i, next),
                Err(reason) => frame.drop_packet(cx, i, NEXT_DROP, reason),
            }
        }
    }
}

/// `ip4-arp`: destinations without a resolved neighbor go to the control
/// plane, which owns address resolution.
#[derive(Default)]
pub struct ArpNode {
    punted: u64,
}

impl Node for ArpNode {
    fn next_nodes(&self) -> Vec<String> {
        vec![ERROR_NODE.into(), PUNT_NODE.into()]
    }

    fn default_next(&self) -> NextIndex {
        NEXT_PUNT
    }

    fn process(&mut self, _cx: &mut NodeContext<'_>, frame: &mut Frame<'_>) {
        frame.redirect_all(NEXT_PUNT);
        self.punted += frame.len() as u64;
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![("punted", self.punted)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Address;

    fn tables() -> Arc<Ip4Tables> {
        let mut t = Ip4Tables::new();
        t.add_local(Address::new(10, 0, 0, 1));
        t.add_neighbor(Address::new(10, 0, 1, 2), "tun1");
        Arc::new(t)
    }

    /// IPv4 header with one word of options (NOP padding) and `ttl`.
    fn with_options(ttl: u8) -> Vec<u8> {
        let mut b = vec![0u8; 28];
        b[0] = 0x46;
        b[2..4].copy_from_slice(&28u16.to_be_bytes());
        b[8] = ttl;
        b[9] = 17;
        b[12..16].copy_from_slice(&[10, 0, 0, 7]);
        b[16..20].copy_from_slice(&[10, 0, 1, 2]);
        b[20..24].copy_from_slice(&[1, 1, 1, 0]);
        let sum = checksum(&b[..24]);
        b[10..12].copy_from_slice(&sum.to_wire());
        b
    }

    #[test]
    fn test_rewrite_header_with_options() {
        let node = RewriteNode::new(tables()).unwrap();
        let mut data = with_options(9);
        assert!(Ipv4Header::verify_checksum(&data));

        assert_eq!(node.rewrite(&mut data), Ok(NextIndex(2)));
        assert_eq!(data[8], 8);
        assert!(Ipv4Header::verify_checksum(&data));
        assert_eq!(&data[20..24], &[1, 1, 1, 0]);
    }

    #[test]
    fn test_output_slots_stop_at_slot_limit() {
        assert_eq!(output_slot(0), Some(NextIndex(2)));
        assert_eq!(output_slot(usize::from(u16::MAX) - 2), Some(NextIndex(u16::MAX)));
        assert_eq!(output_slot(usize::from(u16::MAX) - 1), None);
        assert_eq!(output_slot(usize::from(u16::MAX) + 5), None);
    }

    #[test]
    fn test_rewrite_ttl_one_expires() {
        let node = RewriteNode::new(tables()).unwrap();
        let mut data = with_options(1);
        assert_eq!(node.rewrite(&mut data), Err(TTL_EXPIRED));
        assert_eq!(data[8], 1, "expired packet left untouched");
    }

    #[test]
    fn test_classify_counts() {
        let mut input = InputNode::valid_checksum(tables());
        let mut data = with_options(9);
        // Checksum is not looked at on the valid-checksum path.
        data[10] ^= 0xff;
        assert_eq!(input.classify(&data), Ok((INPUT_NEXT_REWRITE, 28)));

        data[16..20].copy_from_slice(&[10, 0, 0, 1]);
        assert_eq!(input.classify(&data), Ok((NEXT_PUNT, 28)));
        assert_eq!((input.local, input.forward, input.unresolved), (1, 1, 0));

        let mut strict = InputNode::new(tables());
        assert_eq!(strict.classify(&data), Err(BAD_CHECKSUM));
    }

    #[test]
    fn test_classify_length_mismatch() {
        let mut input = InputNode::new(tables());
        let data = with_options(9);
        assert_eq!(input.classify(&data[..26]), Err(LENGTH_MISMATCH));
    }
}
