//! Kernel generic netlink socket.

use std::collections::HashMap;

use netlink_packet_generic::GenlMessage;
use netlink_packet_generic::ctrl::nlas::GenlCtrlAttrs;
use netlink_packet_generic::ctrl::{GenlCtrl, GenlCtrlCmd};
use netlink_sys::protocols::NETLINK_GENERIC;
use netlink_sys::{Socket, SocketAddr};
use nix::errno::Errno;
use tracing::{debug, trace};

use super::{
    GenlPayload, GenlTransport, NLM_F_ACK, NLM_F_REQUEST, NetlinkError, NetlinkMessage, Reply,
    Result, decode_message, request,
};

/// Fixed id of the generic netlink controller.
const GENL_ID_CTRL: u16 = 0x10;

/// `NETLINK_GENERIC` socket with family id caching.
pub struct GenlSocket {
    socket: Socket,
    seq: u32,
    families: HashMap<&'static str, u16>,
    /// Last datagram and how far into it replies have been consumed.
    rx: Vec<u8>,
    offset: usize,
}

impl GenlSocket {
    pub fn open() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_GENERIC)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        debug!("Generic netlink socket opened");
        Ok(GenlSocket {
            socket,
            seq: 0,
            families: HashMap::new(),
            rx: Vec::new(),
            offset: 0,
        })
    }

    fn send_message<F: GenlPayload>(
        &mut self,
        mut msg: NetlinkMessage<GenlMessage<F>>,
    ) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        msg.header.sequence_number = self.seq;
        let mut buf = vec![0; msg.buffer_len()];
        msg.serialize(&mut buf);
        self.socket.send(&buf, 0)?;

        self.rx.clear();
        self.offset = 0;
        trace!(
            family = F::family_name(),
            seq = self.seq,
            len = buf.len(),
            "Netlink request sent"
        );
        Ok(())
    }

    fn recv_reply<F: GenlPayload>(&mut self) -> Result<Reply<F>> {
        loop {
            if self.offset >= self.rx.len() {
                let (datagram, _) = self.socket.recv_from_full()?;
                self.rx = datagram;
                self.offset = 0;
                continue;
            }
            let (msg, used) = decode_message::<F>(&self.rx[self.offset..])?;
            self.offset += used;

            if msg.header.sequence_number != self.seq {
                debug!(
                    seq = msg.header.sequence_number,
                    expected = self.seq,
                    "Skipping stale netlink reply"
                );
                continue;
            }
            if let Some(reply) = Reply::from_message(msg) {
                return Ok(reply);
            }
        }
    }

    /// Ask the controller for the id of family `name`.
    fn resolve(&mut self, name: &'static str) -> Result<u16> {
        if let Some(&id) = self.families.get(name) {
            return Ok(id);
        }

        let ctrl = GenlCtrl {
            cmd: GenlCtrlCmd::GetFamily,
            nlas: vec![GenlCtrlAttrs::FamilyName(name.to_string())],
        };
        self.send_message(request(GENL_ID_CTRL, ctrl, NLM_F_REQUEST | NLM_F_ACK))?;

        let mut id = None;
        loop {
            match self.recv_reply::<GenlCtrl>()? {
                Reply::Message(m) => {
                    id = m.payload.nlas.iter().find_map(|nla| match nla {
                        GenlCtrlAttrs::FamilyId(id) => Some(*id),
                        _ => None,
                    });
                }
                Reply::Ack | Reply::Done => break,
                Reply::Error(errno) if errno == Errno::ENOENT as i32 => {
                    return Err(NetlinkError::FamilyNotFound(name.to_string()));
                }
                Reply::Error(errno) => return Err(NetlinkError::Kernel { errno }),
            }
        }
        let id = id.ok_or_else(|| NetlinkError::FamilyNotFound(name.to_string()))?;
        debug!(family = name, id, "Resolved generic netlink family");
        self.families.insert(name, id);
        Ok(id)
    }
}

impl<F: GenlPayload> GenlTransport<F> for GenlSocket {
    fn family_id(&mut self) -> Result<u16> {
        self.resolve(F::family_name())
    }

    fn send(&mut self, msg: NetlinkMessage<GenlMessage<F>>) -> Result<()> {
        self.send_message(msg)
    }

    fn recv(&mut self) -> Result<Reply<F>> {
        self.recv_reply()
    }
}
