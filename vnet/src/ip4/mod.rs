//! IPv4 forwarding: flow extraction, lookup tables and graph nodes.

mod flow;
pub mod node;

pub use flow::Flow;
pub use node::{ArpNode, InputNode, RewriteNode};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::graph::{
    ERROR_NODE, ErrorNode, Graph, GraphBuilder, NodeIndex, PUNT_NODE, PuntNode, PuntSink,
    Result, TxDriver, TxNode, output_node_name,
};
use crate::wire::Address;

/// Addresses the dataplane forwards on. Built from configuration and shared
/// read-only between workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ip4Tables {
    locals: BTreeSet<Address>,
    /// Directly reachable destinations and the interface they sit behind.
    neighbors: BTreeMap<Address, String>,
}

impl Ip4Tables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses owned by this host; packets to them are punted.
    pub fn add_local(&mut self, addr: Address) {
        self.locals.insert(addr);
    }

    /// Record `addr` as reachable through `iface`. Returns the previous
    /// interface if the neighbor was already known.
    pub fn add_neighbor(&mut self, addr: Address, iface: impl Into<String>) -> Option<String> {
        self.neighbors.insert(addr, iface.into())
    }

    pub fn is_local(&self, addr: Address) -> bool {
        self.locals.contains(&addr)
    }

    pub fn neighbor(&self, addr: Address) -> Option<&str> {
        self.neighbors.get(&addr).map(String::as_str)
    }

    /// Interfaces neighbors are reachable through, sorted and unique.
    pub fn interfaces(&self) -> BTreeSet<&str> {
        self.neighbors.values().map(String::as_str).collect()
    }
}

/// Indices of the ip4 entry nodes in a built graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ip4Nodes {
    pub input: NodeIndex,
    pub input_valid_checksum: NodeIndex,
    pub rewrite: NodeIndex,
    pub arp: NodeIndex,
}

/// Register the ip4 nodes on `b`. The `error`, `punt` and `<iface>-output`
/// nodes they lead to must be registered before the graph is built.
pub fn register(b: &mut GraphBuilder, tables: &Arc<Ip4Tables>) -> Result<Ip4Nodes> {
    Ok(Ip4Nodes {
        input: b.register(node::INPUT_NODE, Box::new(InputNode::new(Arc::clone(tables))))?,
        input_valid_checksum: b.register(
            node::INPUT_VALID_CHECKSUM_NODE,
            Box::new(InputNode::valid_checksum(Arc::clone(tables))),
        )?,
        rewrite: b.register(
            node::REWRITE_NODE,
            Box::new(RewriteNode::new(Arc::clone(tables))?),
        )?,
        arp: b.register(node::ARP_NODE, Box::new(ArpNode::default()))?,
    })
}

/// Build a complete forwarding graph: sinks, ip4 nodes and one transmit node
/// per interface.
pub fn ip4_graph(
    tables: &Arc<Ip4Tables>,
    interfaces: Vec<(String, Box<dyn TxDriver>)>,
    punt: Box<dyn PuntSink>,
) -> Result<(Graph, Ip4Nodes)> {
    let mut b = GraphBuilder::new();
    b.register(ERROR_NODE, Box::new(ErrorNode::new()))?;
    b.register(PUNT_NODE, Box::new(PuntNode::new(punt)))?;
    for (iface, driver) in interfaces {
        b.register(output_node_name(&iface), Box::new(TxNode::new(driver)))?;
    }
    let nodes = register(&mut b, tables)?;
    Ok((b.build()?, nodes))
}
