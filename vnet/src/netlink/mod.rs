//! Generic netlink: request/reply transport and the FOU family.
//!
//! Framing comes from `netlink-packet-core` and `netlink-packet-generic`;
//! a family is a payload type implementing [`GenlPayload`]. A transport
//! ([`GenlTransport`]) moves messages; [`GenlSocket`] is the kernel one.

mod fou;
mod socket;

pub use fou::{
    AddressFamily, FouAttr, FouCmd, FouEncap, FouMain, FouMessage, FouPort, FouPorts, fou_attr,
};
pub use socket::GenlSocket;

pub use netlink_packet_core::{
    NLM_F_ACK, NLM_F_DUMP, NLM_F_MULTIPART as NLM_F_MULTI, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload,
};
pub use netlink_packet_generic::{GenlFamily, GenlHeader, GenlMessage};

use std::fmt;
use std::io;
use std::marker::PhantomData;

use netlink_packet_core::NetlinkBuffer;
use netlink_packet_utils::DecodeError;
use netlink_packet_utils::traits::{Emitable, ParseableParametrized};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("netlink I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed netlink message: {0}")]
    Decode(#[from] DecodeError),

    #[error("kernel rejected request: {}", io::Error::from_raw_os_error(*errno))]
    Kernel { errno: i32 },

    #[error("generic netlink family {0:?} not found")]
    FamilyNotFound(String),

    #[error("{family} reply lacks attribute {attr}")]
    MissingAttribute {
        family: &'static str,
        attr: &'static str,
    },

    #[error("{family} attribute {attr} has invalid value {value}")]
    InvalidAttribute {
        family: &'static str,
        attr: &'static str,
        value: u32,
    },
}

pub type Result<T> = std::result::Result<T, NetlinkError>;

/// Payload of a generic netlink family: what `GenlMessage` needs to emit
/// and parse it.
pub trait GenlPayload:
    GenlFamily + Emitable + ParseableParametrized<[u8], GenlHeader> + fmt::Debug
{
}

impl<F> GenlPayload for F where
    F: GenlFamily + Emitable + ParseableParametrized<[u8], GenlHeader> + fmt::Debug
{
}

/// A reply as the request/reply logic sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<F> {
    Message(GenlMessage<F>),
    /// End of a dump.
    Done,
    /// Positive acknowledgement (`NLMSG_ERROR` with code 0).
    Ack,
    /// Request failed with this errno.
    Error(i32),
}

impl<F> Reply<F> {
    /// Classify a received message. Noop and overrun messages yield `None`.
    pub fn from_message(msg: NetlinkMessage<GenlMessage<F>>) -> Option<Reply<F>> {
        match msg.payload {
            NetlinkPayload::InnerMessage(m) => Some(Reply::Message(m)),
            NetlinkPayload::Done(_) => Some(Reply::Done),
            NetlinkPayload::Error(e) => Some(match e.code {
                None => Reply::Ack,
                Some(code) => Reply::Error(-code.get()),
            }),
            _ => None,
        }
    }
}

/// Decode the netlink message at the front of `buf`. Returns it with the
/// number of bytes it occupies, padding included.
pub fn decode_message<F: GenlPayload>(
    buf: &[u8],
) -> Result<(NetlinkMessage<GenlMessage<F>>, usize)> {
    let len = NetlinkBuffer::new_checked(buf)?.length() as usize;
    let msg = NetlinkMessage::<GenlMessage<F>>::deserialize(&buf[..len])?;
    Ok((msg, align(len).min(buf.len())))
}

/// Round `len` up to netlink's 4-byte alignment.
pub const fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Moves generic netlink messages of family `F` to and from a peer.
pub trait GenlTransport<F: GenlPayload> {
    /// Numeric id of family `F`.
    fn family_id(&mut self) -> Result<u16>;

    /// Send a finalized request. The transport assigns the sequence number.
    fn send(&mut self, msg: NetlinkMessage<GenlMessage<F>>) -> Result<()>;

    /// Next reply to the last request.
    fn recv(&mut self) -> Result<Reply<F>>;
}

/// Build a finalized request carrying `payload`.
pub fn request<F: GenlPayload>(
    family_id: u16,
    payload: F,
    flags: u16,
) -> NetlinkMessage<GenlMessage<F>> {
    let mut genl = GenlMessage::from_payload(payload);
    genl.set_resolved_family_id(family_id);
    genl.finalize();
    let mut msg = NetlinkMessage::from(genl);
    msg.header.flags = flags;
    msg.finalize();
    msg
}

/// Send `payload` and wait for the acknowledgement.
pub fn request_ack<F, T>(t: &mut T, payload: F) -> Result<()>
where
    F: GenlPayload,
    T: GenlTransport<F> + ?Sized,
{
    let id = t.family_id()?;
    t.send(request(id, payload, NLM_F_REQUEST | NLM_F_ACK))?;
    loop {
        match t.recv()? {
            Reply::Ack | Reply::Done => return Ok(()),
            Reply::Error(errno) => return Err(NetlinkError::Kernel { errno }),
            Reply::Message(m) => {
                debug!(
                    family = F::family_name(),
                    cmd = m.header.cmd,
                    "Ignoring reply while waiting for ack"
                );
            }
        }
    }
}

/// Issue a dump request and iterate over the replies.
pub fn dump<F, T>(t: &mut T, payload: F) -> Result<Dump<'_, F, T>>
where
    F: GenlPayload,
    T: GenlTransport<F> + ?Sized,
{
    let id = t.family_id()?;
    t.send(request(id, payload, NLM_F_REQUEST | NLM_F_DUMP))?;
    Ok(Dump {
        transport: t,
        finished: false,
        _family: PhantomData,
    })
}

/// Replies of a dump, ending at the `Done` terminator. Restart by issuing a
/// new dump.
pub struct Dump<'t, F, T: ?Sized> {
    transport: &'t mut T,
    finished: bool,
    _family: PhantomData<F>,
}

impl<F, T> Iterator for Dump<'_, F, T>
where
    F: GenlPayload,
    T: GenlTransport<F> + ?Sized,
{
    type Item = Result<GenlMessage<F>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = match self.transport.recv() {
            Ok(Reply::Message(m)) => return Some(Ok(m)),
            Ok(Reply::Done) | Ok(Reply::Ack) => None,
            Ok(Reply::Error(errno)) => Some(Err(NetlinkError::Kernel { errno })),
            Err(e) => Some(Err(e)),
        };
        self.finished = true;
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOU_ID: u16 = 0x1a;

    fn serialize(msg: &NetlinkMessage<GenlMessage<FouMessage>>) -> Vec<u8> {
        let mut buf = vec![0; msg.buffer_len()];
        msg.serialize(&mut buf);
        buf
    }

    /// Header of a kernel control message (`NLMSG_DONE`, `NLMSG_ERROR`).
    fn control(kind: u16, flags: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((16 + payload.len()) as u32).to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.extend_from_slice(&flags.to_ne_bytes());
        out.extend_from_slice(&7u32.to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn error(errno: i32) -> Vec<u8> {
        let mut payload = (-errno).to_ne_bytes().to_vec();
        payload.resize(4 + 16, 0);
        control(2, 0, &payload)
    }

    #[test]
    fn test_request_layout() {
        let msg = request(
            FOU_ID,
            FouMessage::new(FouCmd::Add, vec![FouAttr::Af(2)]),
            NLM_F_REQUEST | NLM_F_ACK,
        );
        let bytes = serialize(&msg);

        // nlmsghdr + genlmsghdr + one padded u8 attribute
        assert_eq!(bytes.len(), 16 + 4 + 8);
        assert_eq!(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 28);
        assert_eq!(u16::from_ne_bytes([bytes[4], bytes[5]]), FOU_ID);
        assert_eq!(u16::from_ne_bytes([bytes[6], bytes[7]]), 0x5);
        assert_eq!(bytes[16], FouCmd::Add as u8);
        assert_eq!(bytes[17], 1);
    }

    #[test]
    fn test_datagram_of_message_and_done() {
        let msg = request(
            FOU_ID,
            FouMessage::new(FouCmd::Get, vec![FouAttr::Port(5555)]),
            NLM_F_MULTI,
        );
        let mut buf = serialize(&msg);
        buf.extend(control(3, NLM_F_MULTI, &0i32.to_ne_bytes()));

        let (first, used) = decode_message::<FouMessage>(&buf).unwrap();
        match Reply::from_message(first) {
            Some(Reply::Message(m)) => assert_eq!(m.payload.attrs, vec![FouAttr::Port(5555)]),
            other => panic!("unexpected: {other:?}"),
        }
        let (second, rest) = decode_message::<FouMessage>(&buf[used..]).unwrap();
        assert_eq!(Reply::from_message(second), Some(Reply::Done));
        assert_eq!(used + rest, buf.len());
    }

    #[test]
    fn test_error_and_ack_classified() {
        let (msg, _) = decode_message::<FouMessage>(&error(17)).unwrap();
        assert_eq!(Reply::from_message(msg), Some(Reply::Error(17)));
        let (msg, _) = decode_message::<FouMessage>(&error(0)).unwrap();
        assert_eq!(Reply::from_message(msg), Some(Reply::Ack));
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let buf = control(3, 0, &0i32.to_ne_bytes());
        assert!(matches!(
            decode_message::<FouMessage>(&buf[..18]),
            Err(NetlinkError::Decode(_))
        ));
    }
}
