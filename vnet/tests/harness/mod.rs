//! Shared helpers for the integration tests.

#![allow(dead_code)]

pub mod packets;
pub mod store;

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use vnet::graph::{PuntSink, TxDriver};
use vnet::netlink::{
    FouMessage, GenlMessage, GenlTransport, NetlinkError, NetlinkMessage, NetlinkPayload, Reply,
};

/// Frames captured by a recording sink, shared with the test.
pub type Captured = Arc<Mutex<Vec<Vec<u8>>>>;

/// Transmit driver that keeps every frame it is given.
pub struct RecordingTx {
    frames: Captured,
}

impl RecordingTx {
    pub fn new() -> (Self, Captured) {
        let frames = Captured::default();
        (
            RecordingTx {
                frames: frames.clone(),
            },
            frames,
        )
    }
}

impl TxDriver for RecordingTx {
    fn transmit(&mut self, frame: &[u8]) -> io::Result<()> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

/// Punt sink that keeps every frame it is given.
pub struct RecordingPunt {
    frames: Captured,
}

impl RecordingPunt {
    pub fn new() -> (Self, Captured) {
        let frames = Captured::default();
        (
            RecordingPunt {
                frames: frames.clone(),
            },
            frames,
        )
    }
}

impl PuntSink for RecordingPunt {
    fn punt(&mut self, frame: &[u8]) {
        self.frames.lock().unwrap().push(frame.to_vec());
    }
}

/// FOU request as a scripted transport records it.
pub type FouRequest = NetlinkMessage<GenlMessage<FouMessage>>;

/// Generic netlink payload of a recorded request.
pub fn genl(req: &FouRequest) -> &GenlMessage<FouMessage> {
    match &req.payload {
        NetlinkPayload::InnerMessage(m) => m,
        other => panic!("not a generic netlink request: {other:?}"),
    }
}

/// Generic netlink transport that answers from a script.
///
/// Every request pops the next reply batch; the test sees what was sent in
/// `sent`.
pub struct ScriptedTransport {
    pub family_id: u16,
    pub sent: Vec<FouRequest>,
    script: VecDeque<Vec<Reply<FouMessage>>>,
    pending: VecDeque<Reply<FouMessage>>,
}

impl ScriptedTransport {
    pub fn new(family_id: u16) -> Self {
        ScriptedTransport {
            family_id,
            sent: Vec::new(),
            script: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    /// Queue the replies for the next request.
    pub fn then(mut self, replies: Vec<Reply<FouMessage>>) -> Self {
        self.script.push_back(replies);
        self
    }
}

impl GenlTransport<FouMessage> for ScriptedTransport {
    fn family_id(&mut self) -> Result<u16, NetlinkError> {
        Ok(self.family_id)
    }

    fn send(&mut self, msg: FouRequest) -> Result<(), NetlinkError> {
        self.sent.push(msg);
        self.pending = self.script.pop_front().unwrap_or_default().into();
        Ok(())
    }

    fn recv(&mut self) -> Result<Reply<FouMessage>, NetlinkError> {
        self.pending.pop_front().ok_or_else(|| {
            NetlinkError::Io(io::Error::new(io::ErrorKind::TimedOut, "script exhausted"))
        })
    }
}
