//! Dataplane configuration file.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ip4::Ip4Tables;
use crate::netlink::FouPorts;
use crate::wire::Address;

/// Largest accepted receive batch.
pub const MAX_BATCH_SIZE: usize = 1024;

pub const DEFAULT_TUN_NAME: &str = "vnet0";
pub const DEFAULT_BATCH_SIZE: usize = 256;
pub const DEFAULT_PID_DIR: &str = "/run/vnet";
pub const DEFAULT_STORE_SERVICE: &str = "vnet";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("queue count must be at least 1")]
    NoQueues,

    #[error("batch size {0} out of range 1..={MAX_BATCH_SIZE}")]
    BadBatchSize(usize),

    #[error("neighbor {0} listed more than once")]
    DuplicateNeighbor(Address),

    #[error("neighbor {0} has no interface")]
    MissingInterface(Address),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A directly reachable address and the interface it sits behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub address: Address,
    pub interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    /// TUN device the workers attach their queues to.
    pub tun_name: String,
    /// Receive queues, one worker each.
    pub queues: usize,
    pub batch_size: usize,
    /// Addresses owned by this host.
    pub local_addresses: Vec<Address>,
    pub neighbors: Vec<Neighbor>,
    /// FOU receive ports to program at startup.
    pub fou_ports: FouPorts,
    /// Program `fou_ports` into the kernel instead of only reading them.
    pub program_fou: bool,
    /// Unix socket of the state store, if state should be published.
    pub store_socket: Option<PathBuf>,
    pub store_service: String,
    pub pid_dir: PathBuf,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        DataplaneConfig {
            tun_name: DEFAULT_TUN_NAME.to_string(),
            queues: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            local_addresses: Vec::new(),
            neighbors: Vec::new(),
            fou_ports: FouPorts::new(),
            program_fou: false,
            store_socket: None,
            store_service: DEFAULT_STORE_SERVICE.to_string(),
            pid_dir: PathBuf::from(DEFAULT_PID_DIR),
        }
    }
}

impl DataplaneConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DataplaneConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queues == 0 {
            return Err(ConfigError::NoQueues);
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::BadBatchSize(self.batch_size));
        }
        let mut seen = BTreeSet::new();
        for n in &self.neighbors {
            if n.interface.is_empty() {
                return Err(ConfigError::MissingInterface(n.address));
            }
            if !seen.insert(n.address) {
                return Err(ConfigError::DuplicateNeighbor(n.address));
            }
        }
        Ok(())
    }

    /// Forwarding tables for the configured addresses.
    pub fn ip4_tables(&self) -> Ip4Tables {
        let mut tables = Ip4Tables::new();
        for addr in &self.local_addresses {
            tables.add_local(*addr);
        }
        for n in &self.neighbors {
            tables.add_neighbor(n.address, n.interface.clone());
        }
        tables
    }
}
