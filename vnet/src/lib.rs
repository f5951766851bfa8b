//! vnet: a software packet dataplane.
//!
//! Batches of packet buffers are received from interfaces, walked through a
//! graph of processing nodes and handed to output interfaces or the control
//! plane.

pub mod arena;
pub mod buffer;
pub mod config;
pub mod graph;
pub mod ip4;
pub mod netlink;
pub mod pidfile;
pub mod store;
pub mod tun;
pub mod wire;
pub mod worker;
