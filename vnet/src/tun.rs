//! Multi-queue TUN interface driver.
//!
//! Every queue of a TUN device is its own file descriptor; each worker gets
//! one queue of every interface and uses it for both receive and transmit.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use nix::libc::{self, IFF_MULTI_QUEUE, IFF_NO_PI, IFF_TUN, IFNAMSIZ, c_char, c_short};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use thiserror::Error;
use tracing::{debug, info};

use crate::arena::VecArena;
use crate::buffer::{BufferPool, MAX_PACKET, PacketRef};
use crate::graph::TxDriver;
use crate::worker::RxQueue;

const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;

#[derive(Debug, Error)]
pub enum TunError {
    #[error("failed to open /dev/net/tun: {0}")]
    Open(io::Error),

    #[error("failed to attach queue {queue} of {name}: {source}")]
    Attach {
        name: String,
        queue: usize,
        source: io::Error,
    },

    #[error("interface name too long: {0} (max {max} chars)", max = IFNAMSIZ - 1)]
    NameTooLong(String),

    #[error("failed to set {0} up: {1}")]
    SetUp(String, io::Error),
}

pub type Result<T> = std::result::Result<T, TunError>;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

fn if_name(name: &str) -> Result<[c_char; IFNAMSIZ]> {
    if name.is_empty() || name.len() >= IFNAMSIZ {
        return Err(TunError::NameTooLong(name.to_string()));
    }
    let mut out = [0 as c_char; IFNAMSIZ];
    for (dst, byte) in out.iter_mut().zip(name.bytes()) {
        *dst = byte as c_char;
    }
    Ok(out)
}

/// Open `queues` queues of TUN device `name`, creating it if needed, and
/// bring the interface up.
pub fn open(name: &str, queues: usize) -> Result<Vec<TunQueue>> {
    let ifr_name = if_name(name)?;
    let mut out = Vec::with_capacity(queues);
    for queue in 0..queues {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(TunError::Open)?;

        let ifr = IfReq {
            ifr_name,
            ifr_flags: (IFF_TUN | IFF_NO_PI | IFF_MULTI_QUEUE) as c_short,
            _padding: [0; 22],
        };
        // SAFETY: TUNSETIFF reads a struct ifreq; IfReq has its layout.
        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
        if result < 0 {
            return Err(TunError::Attach {
                name: name.to_string(),
                queue,
                source: io::Error::last_os_error(),
            });
        }
        debug!(name, queue, "TUN queue attached");
        out.push(TunQueue {
            name: name.to_string(),
            queue,
            file,
            no_buffer: 0,
            scratch: Vec::new(),
        });
    }

    set_up(name)?;
    info!(name, queues, "TUN device ready");
    Ok(out)
}

/// Set the IFF_UP flag on interface `name`.
pub fn set_up(name: &str) -> Result<()> {
    let err = |e: io::Error| TunError::SetUp(name.to_string(), e);

    // SAFETY: plain socket(2) call; the fd is owned immediately.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(err(io::Error::last_os_error()));
    }
    // SAFETY: `raw` is a fresh, valid descriptor nobody else owns.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    ifr.ifr_name = if_name(name)?;

    // SAFETY: SIOCGIFFLAGS fills the flags of a properly sized ifreq.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as libc::Ioctl, &mut ifr) } < 0 {
        return Err(err(io::Error::last_os_error()));
    }
    // SAFETY: the flags member is the one SIOCGIFFLAGS just set.
    unsafe {
        ifr.ifr_ifru.ifru_flags |= libc::IFF_UP as c_short;
    }
    // SAFETY: as above.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as libc::Ioctl, &ifr) } < 0 {
        return Err(err(io::Error::last_os_error()));
    }
    debug!(name, "Interface set up");
    Ok(())
}

/// One queue of a TUN device.
pub struct TunQueue {
    name: String,
    queue: usize,
    file: File,
    no_buffer: u64,
    /// Packets read while the pool is empty land here and are discarded.
    scratch: Vec<u8>,
}

impl TunQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> usize {
        self.queue
    }

    /// Second handle on the same queue, for transmitting from a graph node.
    pub fn try_clone(&self) -> io::Result<TunQueue> {
        Ok(TunQueue {
            name: self.name.clone(),
            queue: self.queue,
            file: self.file.try_clone()?,
            no_buffer: 0,
            scratch: Vec::new(),
        })
    }

    /// Wait until the queue is readable. Returns false on timeout.
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(n) => Ok(n > 0),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn discard(&mut self) -> io::Result<bool> {
        self.scratch.resize(MAX_PACKET, 0);
        match self.file.read(&mut self.scratch) {
            Ok(_) => {
                self.no_buffer += 1;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl RxQueue for TunQueue {
    fn recv_batch(
        &mut self,
        pool: &mut BufferPool,
        batch: &mut VecArena<PacketRef>,
        max: usize,
        timeout: Duration,
    ) -> io::Result<usize> {
        if !self.wait(timeout)? {
            return Ok(0);
        }

        let mut received = 0;
        while received < max {
            let Some(mut r) = pool.alloc() else {
                if self.discard()? {
                    continue;
                }
                break;
            };
            let room = &mut pool.tail_room_mut(&r)[..MAX_PACKET];
            match self.file.read(room) {
                Ok(n) => {
                    pool.set_len(&mut r, n);
                    batch.push(r);
                    received += 1;
                }
                Err(e) => {
                    pool.free(r);
                    if e.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(received)
    }

    fn no_buffer(&self) -> u64 {
        self.no_buffer
    }
}

impl TxDriver for TunQueue {
    fn transmit(&mut self, frame: &[u8]) -> io::Result<()> {
        let n = self.file.write(frame)?;
        if n != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "short write on {} queue {}: {n} of {}",
                    self.name,
                    self.queue,
                    frame.len()
                ),
            ));
        }
        Ok(())
    }
}
