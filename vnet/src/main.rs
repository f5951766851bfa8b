use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::vec;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::Receiver;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use vnet::buffer::POOL_SIZE;
use vnet::config::DataplaneConfig;
use vnet::graph::{ChannelPunt, PuntedPacket, TxDriver};
use vnet::ip4::{self, Flow, Ip4Tables};
use vnet::netlink::{FouMain, FouPorts, GenlSocket};
use vnet::pidfile::PidFile;
use vnet::store::{Rpc, SockfileClient, Store};
use vnet::tun::{self, TunQueue};
use vnet::wire::{Ipv4Header, PacketHeader};
use vnet::worker::{WorkerConfig, WorkerHandle, WorkerStats, spawn_worker};

/// Punted packets waiting for the control plane.
const PUNT_QUEUE_DEPTH: usize = 1024;

/// Store hash the daemon publishes its state under.
const STATE_KEY: &str = "vnet";

#[derive(Parser)]
#[command(name = "vnetd")]
#[command(about = "vnet software dataplane daemon")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TUN device to receive on
    #[arg(long)]
    tun: Option<String>,

    /// Receive queues (one worker thread each)
    #[arg(short, long)]
    queues: Option<usize>,

    /// Packets per receive batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Run directory for pid files
    #[arg(long)]
    pid_dir: Option<PathBuf>,

    /// Unix socket of the state store
    #[arg(long)]
    store_socket: Option<PathBuf>,

    /// Program the configured FOU ports into the kernel
    #[arg(long)]
    program_fou: bool,
}

impl Args {
    fn into_config(self) -> Result<DataplaneConfig> {
        let mut config = match &self.config {
            Some(path) => DataplaneConfig::load(path)?,
            None => DataplaneConfig::default(),
        };
        if let Some(tun) = self.tun {
            config.tun_name = tun;
        }
        if let Some(queues) = self.queues {
            config.queues = queues;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(pid_dir) = self.pid_dir {
            config.pid_dir = pid_dir;
        }
        if self.store_socket.is_some() {
            config.store_socket = self.store_socket;
        }
        config.program_fou |= self.program_fou;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vnet=info".parse()?))
        .init();

    let config = Args::parse().into_config()?;
    info!(
        tun = %config.tun_name,
        queues = config.queues,
        batch_size = config.batch_size,
        "Starting vnetd"
    );

    let _pid_file = PidFile::create(&config.pid_dir, "vnetd").context("Failed to write pid file")?;

    let fou_ports = setup_fou(&config);

    let tables = Arc::new(config.ip4_tables());
    let (punt_tx, punt_rx) = crossbeam_channel::bounded(PUNT_QUEUE_DEPTH);
    let punt_logger = thread::Builder::new()
        .name("vnet-punt".into())
        .spawn(move || log_punted(punt_rx))
        .context("Failed to spawn punt thread")?;

    let workers = start_workers(&config, &tables, punt_tx)?;

    if let Some(path) = &config.store_socket {
        let store = Rpc::new(SockfileClient::new(path, &config.store_service));
        if let Err(e) = publish_state(&store, &config, &fou_ports) {
            warn!(socket = %path.display(), error = %e, "Failed to publish state");
        }
    }

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }

    for w in &workers {
        w.stop();
    }
    let mut total = WorkerStats::default();
    for w in workers {
        let queue = w.queue;
        match w.join() {
            Ok(stats) => {
                debug!(queue, packets = stats.rx_packets, "Worker joined");
                total.merge(&stats);
            }
            Err(e) => error!(queue, error = %e, "Worker failed"),
        }
    }
    // Workers held the last punt senders.
    if punt_logger.join().is_err() {
        error!("Punt thread panicked");
    }

    info!(
        rx_packets = total.rx_packets,
        rx_batches = total.rx_batches,
        rx_no_buffer = total.rx_no_buffer,
        "Dataplane stopped"
    );
    info!("Node statistics:\n{}", total.graph);
    Ok(())
}

/// Read the kernel's FOU ports and, if asked to, add the configured ones.
/// Failures are logged; the dataplane runs without FOU.
fn setup_fou(config: &DataplaneConfig) -> FouPorts {
    let mut fou = FouMain::new();
    let mut socket = match GenlSocket::open() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Generic netlink unavailable, skipping FOU");
            return FouPorts::new();
        }
    };
    if let Err(e) = fou.sync(&mut socket) {
        warn!(error = %e, "Failed to read FOU ports");
        return FouPorts::new();
    }
    if config.program_fou {
        for port in config.fou_ports.iter() {
            if fou.ports().contains(port) {
                continue;
            }
            match fou.add(&mut socket, *port) {
                Ok(()) => info!(%port, "FOU port added"),
                Err(e) => warn!(%port, error = %e, "Failed to add FOU port"),
            }
        }
    }
    fou.ports().clone()
}

/// Open every interface and start one worker per receive queue.
fn start_workers(
    config: &DataplaneConfig,
    tables: &Arc<Ip4Tables>,
    punt_tx: crossbeam_channel::Sender<PuntedPacket>,
) -> Result<Vec<WorkerHandle>> {
    let rx_queues = tun::open(&config.tun_name, config.queues)
        .with_context(|| format!("Failed to open {}", config.tun_name))?;

    let mut outputs: BTreeMap<String, vec::IntoIter<TunQueue>> = BTreeMap::new();
    for iface in tables.interfaces() {
        let queues = if iface == config.tun_name {
            rx_queues
                .iter()
                .map(TunQueue::try_clone)
                .collect::<std::io::Result<Vec<_>>>()
                .with_context(|| format!("Failed to clone {iface} queues"))?
        } else {
            tun::open(iface, config.queues).with_context(|| format!("Failed to open {iface}"))?
        };
        outputs.insert(iface.to_string(), queues.into_iter());
    }

    let mut workers = Vec::with_capacity(config.queues);
    for (queue, rx) in rx_queues.into_iter().enumerate() {
        let drivers = next_queue_set(&mut outputs, &config.tun_name)?
            .into_iter()
            .map(|(iface, tx)| (iface, Box::new(tx) as Box<dyn TxDriver>))
            .collect();
        let punt = Box::new(ChannelPunt::new(queue, punt_tx.clone()));
        let (graph, nodes) =
            ip4::ip4_graph(tables, drivers, punt).context("Failed to build graph")?;

        let handle = spawn_worker(WorkerConfig {
            queue,
            rx: Box::new(rx),
            graph,
            entry: nodes.input,
            batch_size: config.batch_size,
            pool_size: POOL_SIZE,
        })
        .map_err(|e| anyhow!(e))?;
        workers.push(handle);
    }
    Ok(workers)
}

/// Take the next transmit queue of every interface, so that the worker on
/// receive queue `n` transmits on queue `n` of each interface.
fn next_queue_set<T>(
    outputs: &mut BTreeMap<String, vec::IntoIter<T>>,
    rx_name: &str,
) -> Result<Vec<(String, T)>> {
    outputs
        .iter_mut()
        .map(|(iface, queues)| {
            let tx = queues
                .next()
                .ok_or_else(|| anyhow!("{iface} has fewer queues than {rx_name}"))?;
            Ok((iface.clone(), tx))
        })
        .collect()
}

fn log_punted(rx: Receiver<PuntedPacket>) {
    for packet in rx.iter() {
        match Ipv4Header::parse(&packet.data) {
            Ok((h, payload)) => {
                debug!(queue = packet.queue, flow = %Flow::extract(&h, payload), "Punted packet")
            }
            Err(e) => debug!(queue = packet.queue, error = %e, "Punted non-IPv4 packet"),
        }
    }
}

fn publish_state<S: Store>(store: &S, config: &DataplaneConfig, fou: &FouPorts) -> Result<()> {
    store.hset(STATE_KEY, "tun.name", config.tun_name.as_bytes())?;
    store.hset(
        STATE_KEY,
        &format!("{}.queues", config.tun_name),
        config.queues.to_string().as_bytes(),
    )?;
    store.hset(STATE_KEY, "fou.ports", &serde_json::to_vec(fou)?)?;
    info!("State published");
    Ok(())
}
