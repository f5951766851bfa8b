//! Foo-over-UDP receive ports.
//!
//! `FouMain` keeps a mirror of the kernel's FOU port set. The mirror only
//! changes after the kernel confirms a change, so a failed request never
//! leaves it out of step with the kernel.

use std::collections::BTreeSet;
use std::fmt;

use netlink_packet_generic::{GenlFamily, GenlHeader};
use netlink_packet_utils::nla::{DefaultNla, Nla, NlaBuffer, NlasIterator};
use netlink_packet_utils::parsers::{parse_u8, parse_u16_be};
use netlink_packet_utils::traits::{Emitable, Parseable, ParseableParametrized};
use netlink_packet_utils::DecodeError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{GenlTransport, NetlinkError, Result, dump, request_ack};

const FOU_GENL_NAME: &str = "fou";
const FOU_GENL_VERSION: u8 = 1;

pub mod fou_attr {
    pub const UNSPEC: u16 = 0;
    /// UDP port, network byte order.
    pub const PORT: u16 = 1;
    pub const AF: u16 = 2;
    pub const IPPROTO: u16 = 3;
    pub const TYPE: u16 = 4;
    pub const REMCSUM_NOPARTIAL: u16 = 5;
}

/// FOU generic netlink commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FouCmd {
    Add = 1,
    Del = 2,
    Get = 3,
}

impl TryFrom<u8> for FouCmd {
    type Error = DecodeError;

    fn try_from(cmd: u8) -> std::result::Result<Self, DecodeError> {
        match cmd {
            1 => Ok(FouCmd::Add),
            2 => Ok(FouCmd::Del),
            3 => Ok(FouCmd::Get),
            cmd => Err(format!("unknown FOU command {cmd}").into()),
        }
    }
}

/// FOU attributes. Attributes this mirror does not use are kept as
/// [`DefaultNla`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FouAttr {
    /// UDP port, host order.
    Port(u16),
    Af(u8),
    IpProto(u8),
    Type(u8),
    RemcsumNopartial,
    Other(DefaultNla),
}

impl Nla for FouAttr {
    fn value_len(&self) -> usize {
        match self {
            FouAttr::Port(_) => 2,
            FouAttr::Af(_) | FouAttr::IpProto(_) | FouAttr::Type(_) => 1,
            FouAttr::RemcsumNopartial => 0,
            FouAttr::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            FouAttr::Port(_) => fou_attr::PORT,
            FouAttr::Af(_) => fou_attr::AF,
            FouAttr::IpProto(_) => fou_attr::IPPROTO,
            FouAttr::Type(_) => fou_attr::TYPE,
            FouAttr::RemcsumNopartial => fou_attr::REMCSUM_NOPARTIAL,
            FouAttr::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            FouAttr::Port(port) => buffer[..2].copy_from_slice(&port.to_be_bytes()),
            FouAttr::Af(v) | FouAttr::IpProto(v) | FouAttr::Type(v) => buffer[0] = *v,
            FouAttr::RemcsumNopartial => {}
            FouAttr::Other(nla) => nla.emit_value(buffer),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for FouAttr {
    fn parse(buf: &NlaBuffer<&'a T>) -> std::result::Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            fou_attr::PORT => FouAttr::Port(parse_u16_be(payload)?),
            fou_attr::AF => FouAttr::Af(parse_u8(payload)?),
            fou_attr::IPPROTO => FouAttr::IpProto(parse_u8(payload)?),
            fou_attr::TYPE => FouAttr::Type(parse_u8(payload)?),
            fou_attr::REMCSUM_NOPARTIAL => FouAttr::RemcsumNopartial,
            _ => FouAttr::Other(DefaultNla::parse(buf)?),
        })
    }
}

/// Payload of a FOU generic netlink message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FouMessage {
    pub cmd: FouCmd,
    pub attrs: Vec<FouAttr>,
}

impl FouMessage {
    pub fn new(cmd: FouCmd, attrs: Vec<FouAttr>) -> Self {
        FouMessage { cmd, attrs }
    }
}

impl GenlFamily for FouMessage {
    fn family_name() -> &'static str {
        FOU_GENL_NAME
    }

    fn command(&self) -> u8 {
        self.cmd as u8
    }

    fn version(&self) -> u8 {
        FOU_GENL_VERSION
    }
}

impl Emitable for FouMessage {
    fn buffer_len(&self) -> usize {
        self.attrs.as_slice().buffer_len()
    }

    fn emit(&self, buffer: &mut [u8]) {
        self.attrs.as_slice().emit(buffer)
    }
}

impl ParseableParametrized<[u8], GenlHeader> for FouMessage {
    fn parse_with_param(
        buf: &[u8],
        header: GenlHeader,
    ) -> std::result::Result<Self, DecodeError> {
        let attrs = NlasIterator::new(buf)
            .map(|nla| nla.and_then(|nla| FouAttr::parse(&nla)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(FouMessage {
            cmd: FouCmd::try_from(header.cmd)?,
            attrs,
        })
    }
}

/// Address family of a FOU socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn to_raw(self) -> u8 {
        match self {
            AddressFamily::Inet => 2,
            AddressFamily::Inet6 => 10,
        }
    }

    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            2 => Some(AddressFamily::Inet),
            10 => Some(AddressFamily::Inet6),
            _ => None,
        }
    }
}

/// FOU encapsulation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FouEncap {
    Unspec,
    /// Inner packet follows the UDP header directly.
    Direct,
    /// Generic UDP encapsulation header.
    Gue,
}

impl FouEncap {
    pub fn to_raw(self) -> u8 {
        match self {
            FouEncap::Unspec => 0,
            FouEncap::Direct => 1,
            FouEncap::Gue => 2,
        }
    }

    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(FouEncap::Unspec),
            1 => Some(FouEncap::Direct),
            2 => Some(FouEncap::Gue),
            _ => None,
        }
    }
}

/// One FOU receive port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FouPort {
    pub family: AddressFamily,
    pub encap: FouEncap,
    /// Protocol of the inner packet for direct encapsulation.
    #[serde(default)]
    pub ip_protocol: u8,
    #[serde(default)]
    pub remcsum_nopartial: bool,
    /// UDP port, host order.
    pub udp_port: u16,
}

impl FouPort {
    pub fn to_attrs(self) -> Vec<FouAttr> {
        let mut attrs = vec![
            FouAttr::Port(self.udp_port),
            FouAttr::Af(self.family.to_raw()),
            FouAttr::IpProto(self.ip_protocol),
            FouAttr::Type(self.encap.to_raw()),
        ];
        if self.remcsum_nopartial {
            attrs.push(FouAttr::RemcsumNopartial);
        }
        attrs
    }

    pub fn from_attrs(attrs: &[FouAttr]) -> Result<Self> {
        let missing = |attr| NetlinkError::MissingAttribute {
            family: FOU_GENL_NAME,
            attr,
        };
        let invalid = |attr, value: u8| NetlinkError::InvalidAttribute {
            family: FOU_GENL_NAME,
            attr,
            value: u32::from(value),
        };

        let (mut udp_port, mut af, mut encap) = (None, None, None);
        // Kernels omit IPPROTO for GUE ports.
        let mut ip_protocol = 0;
        let mut remcsum_nopartial = false;
        for attr in attrs {
            match attr {
                FouAttr::Port(p) => udp_port = Some(*p),
                FouAttr::Af(v) => af = Some(*v),
                FouAttr::IpProto(v) => ip_protocol = *v,
                FouAttr::Type(v) => encap = Some(*v),
                FouAttr::RemcsumNopartial => remcsum_nopartial = true,
                FouAttr::Other(_) => {}
            }
        }

        let af = af.ok_or_else(|| missing("AF"))?;
        let encap = encap.ok_or_else(|| missing("TYPE"))?;
        Ok(FouPort {
            family: AddressFamily::from_raw(af).ok_or_else(|| invalid("AF", af))?,
            encap: FouEncap::from_raw(encap).ok_or_else(|| invalid("TYPE", encap))?,
            ip_protocol,
            remcsum_nopartial,
            udp_port: udp_port.ok_or_else(|| missing("PORT"))?,
        })
    }
}

impl fmt::Display for FouPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} udp/{} proto {}",
            self.family, self.encap, self.udp_port, self.ip_protocol
        )?;
        if self.remcsum_nopartial {
            f.write_str(" remcsum-nopartial")?;
        }
        Ok(())
    }
}

/// Owned set of FOU ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FouPorts(BTreeSet<FouPort>);

impl FouPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the port was already present.
    pub fn insert(&mut self, port: FouPort) -> bool {
        self.0.insert(port)
    }

    /// Returns `false` if the port was not present.
    pub fn remove(&mut self, port: &FouPort) -> bool {
        self.0.remove(port)
    }

    pub fn contains(&self, port: &FouPort) -> bool {
        self.0.contains(port)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FouPort> {
        self.0.iter()
    }
}

impl FromIterator<FouPort> for FouPorts {
    fn from_iter<I: IntoIterator<Item = FouPort>>(iter: I) -> Self {
        FouPorts(iter.into_iter().collect())
    }
}

/// FOU configuration mirror.
#[derive(Debug, Default)]
pub struct FouMain {
    ports: FouPorts,
}

impl FouMain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ports(&self) -> &FouPorts {
        &self.ports
    }

    /// Replace the mirror with the kernel's current port set.
    ///
    /// The mirror is only replaced once the whole dump has been read.
    pub fn sync<T: GenlTransport<FouMessage> + ?Sized>(&mut self, t: &mut T) -> Result<()> {
        let mut ports = FouPorts::new();
        for msg in dump(t, FouMessage::new(FouCmd::Get, Vec::new()))? {
            ports.insert(FouPort::from_attrs(&msg?.payload.attrs)?);
        }
        info!(ports = ports.len(), "FOU ports synced from kernel");
        self.ports = ports;
        Ok(())
    }

    pub fn add<T: GenlTransport<FouMessage> + ?Sized>(
        &mut self,
        t: &mut T,
        port: FouPort,
    ) -> Result<()> {
        self.add_del(t, port, false)
    }

    pub fn del<T: GenlTransport<FouMessage> + ?Sized>(
        &mut self,
        t: &mut T,
        port: FouPort,
    ) -> Result<()> {
        self.add_del(t, port, true)
    }

    /// Add or delete `port` in the kernel; on success mirror the change.
    pub fn add_del<T: GenlTransport<FouMessage> + ?Sized>(
        &mut self,
        t: &mut T,
        port: FouPort,
        is_del: bool,
    ) -> Result<()> {
        let cmd = if is_del { FouCmd::Del } else { FouCmd::Add };
        request_ack(t, FouMessage::new(cmd, port.to_attrs()))?;
        if is_del {
            self.ports.remove(&port);
        } else {
            self.ports.insert(port);
        }
        debug!(%port, ?cmd, "FOU port updated");
        Ok(())
    }
}
