//! Test host and application.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::att::*;

use super::*;

pub(super) const CONN: ConnId = ConnId(1);

/// Creates an engine with a mock host.
pub(super) fn gatt(cfg: Config) -> Gatt<MockHost> {
    Gatt::new(MockHost::new(), cfg)
}

/// Host that records everything the engine asks of it.
#[derive(Debug)]
pub(super) struct MockHost {
    sent: Mutex<Vec<(ConnId, Vec<u8>)>>,
    running: BTreeSet<TimerId>,
    pub sec: LinkSec,
    pub enc_ok: bool,
    pub enc: Vec<(ConnId, SecAction)>,
    pub sig: Option<[u8; SIGNATURE_LEN]>,
    pub verify_ok: bool,
    pub verified: Vec<(ConnId, u32)>,
    pub mtu: Option<(ConnId, u16)>,
    pub disconnects: Vec<ConnId>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            sent: Mutex::default(),
            running: BTreeSet::new(),
            sec: LinkSec::default(),
            enc_ok: true,
            enc: Vec::new(),
            sig: None,
            verify_ok: true,
            verified: Vec::new(),
            mtu: None,
            disconnects: Vec::new(),
        }
    }

    /// Returns and clears all sent PDUs.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        let v = std::mem::take(&mut *self.sent.lock());
        v.into_iter().map(|(_, pdu)| pdu).collect()
    }

    /// Returns and clears PDUs sent to `conn`, keeping the rest.
    pub fn take_sent_to(&self, conn: ConnId) -> Vec<Vec<u8>> {
        let mut all = self.sent.lock();
        let (to, rest): (Vec<_>, Vec<_>) =
            (std::mem::take(&mut *all).into_iter()).partition(|(c, _)| *c == conn);
        *all = rest;
        to.into_iter().map(|(_, pdu)| pdu).collect()
    }

    /// Returns running timers.
    pub fn timers(&self) -> Vec<TimerId> {
        self.running.iter().copied().collect()
    }
}

impl Transport for MockHost {
    fn send(&mut self, conn: ConnId, pdu: &[u8]) -> Result<()> {
        self.sent.lock().push((conn, pdu.to_vec()));
        Ok(())
    }

    fn mtu_changed(&mut self, conn: ConnId, mtu: u16) {
        self.mtu = Some((conn, mtu));
    }

    fn disconnect(&mut self, conn: ConnId) {
        self.disconnects.push(conn);
    }
}

impl Security for MockHost {
    fn sec_flags(&mut self, _: ConnId) -> LinkSec {
        self.sec
    }

    fn request_encryption(&mut self, conn: ConnId, act: SecAction) -> bool {
        self.enc.push((conn, act));
        self.enc_ok
    }

    fn sign(&mut self, _: ConnId, _: &[u8]) -> Option<[u8; SIGNATURE_LEN]> {
        self.sig
    }

    fn verify(&mut self, conn: ConnId, _: &[u8], counter: u32, _: &[u8]) -> bool {
        self.verified.push((conn, counter));
        self.verify_ok
    }
}

impl Timer for MockHost {
    fn start(&mut self, id: TimerId, _: Duration) {
        self.running.insert(id);
    }

    fn stop(&mut self, id: TimerId) {
        self.running.remove(&id);
    }
}

/// Owned copy of a [`ServerReq`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) enum Req {
    Read {
        hdl: u16,
        off: u16,
        long: bool,
        rsp: bool,
    },
    Write {
        hdl: u16,
        off: u16,
        val: Vec<u8>,
        prep: bool,
        rsp: bool,
    },
    Exec(bool),
    Mtu(u16),
    Confirm(u16),
}

impl From<ServerReq<'_>> for Req {
    fn from(r: ServerReq) -> Self {
        match r {
            ServerReq::Read {
                hdl,
                off,
                is_long,
                needs_response,
            } => Self::Read {
                hdl: hdl.into(),
                off,
                long: is_long,
                rsp: needs_response,
            },
            ServerReq::Write {
                hdl,
                off,
                val,
                is_prepare,
                needs_response,
            } => Self::Write {
                hdl: hdl.into(),
                off,
                val: val.to_vec(),
                prep: is_prepare,
                rsp: needs_response,
            },
            ServerReq::ExecuteWrite { commit } => Self::Exec(commit),
            ServerReq::Mtu(mtu) => Self::Mtu(mtu),
            ServerReq::Confirm(hdl) => Self::Confirm(hdl.into()),
        }
    }
}

/// Application that records requests and events. Requests are answered from
/// a script of replies, or with [`Reply::Later`] when the script is empty.
#[derive(Debug, Default)]
pub(super) struct MockApp {
    reqs: Mutex<Vec<(TransId, Req)>>,
    events: Mutex<Vec<ClientEvent>>,
    script: Mutex<VecDeque<Reply>>,
}

impl MockApp {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Adds a reply to the script.
    pub fn reply(&self, r: Reply) {
        self.script.lock().push_back(r);
    }

    /// Returns and clears received requests.
    pub fn reqs(&self) -> Vec<(TransId, Req)> {
        std::mem::take(&mut *self.reqs.lock())
    }

    /// Returns and clears received client events.
    pub fn events(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl App for MockApp {
    fn server_request(&self, _: ConnId, trans: TransId, req: ServerReq) -> Reply {
        self.reqs.lock().push((trans, req.into()));
        self.script.lock().pop_front().unwrap_or(Reply::Later)
    }

    fn client_event(&self, _: ConnId, evt: ClientEvent) {
        self.events.lock().push(evt);
    }
}
