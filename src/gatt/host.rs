use std::fmt::Debug;
use std::time::Duration;

use crate::att::{ErrorCode, Handle, HandleRange, LinkSec, Uuid, SIGNATURE_LEN};

use super::*;

/// ATT bearer provided by the link layer.
pub trait Transport: Debug {
    /// Sends a PDU to the peer.
    fn send(&mut self, conn: ConnId, pdu: &[u8]) -> Result<()>;

    /// Informs the link layer that the ATT_MTU of the link has changed.
    fn mtu_changed(&mut self, conn: ConnId, mtu: u16) {
        let _ = (conn, mtu);
    }

    /// Disconnects the link after a protocol timeout.
    fn disconnect(&mut self, conn: ConnId);
}

/// Security manager interface.
pub trait Security: Debug {
    /// Returns the current security state of the link.
    fn sec_flags(&mut self, conn: ConnId) -> LinkSec;

    /// Starts a link encryption upgrade. The result must be reported via
    /// [`Gatt::on_encryption_complete`]. Returns `false` if the upgrade could
    /// not be started.
    fn request_encryption(&mut self, conn: ConnId, act: SecAction) -> bool;

    /// Signs `data` with the local signing key, returning the sign counter
    /// followed by the MAC.
    fn sign(&mut self, conn: ConnId, data: &[u8]) -> Option<[u8; SIGNATURE_LEN]>;

    /// Verifies a signature created by the peer.
    fn verify(&mut self, conn: ConnId, data: &[u8], counter: u32, sig: &[u8]) -> bool;
}

/// Timer service. Expiry is reported via [`Gatt::on_timeout`]. Starting a
/// running timer restarts it.
pub trait Timer: Debug {
    fn start(&mut self, id: TimerId, d: Duration);
    fn stop(&mut self, id: TimerId);
}

/// Host collaborators required by the GATT engine.
pub trait Host: Transport + Security + Timer {}

impl<T: Transport + Security + Timer> Host for T {}

/// Timer identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TimerId {
    /// Client response timeout.
    Rsp(ConnId),
    /// Server indication confirmation timeout.
    Conf(ConnId),
    /// Timeout for applications to acknowledge a received indication.
    IndAck(ConnId),
}

impl TimerId {
    /// Returns the link of the timer.
    #[inline]
    #[must_use]
    pub const fn conn(self) -> ConnId {
        match self {
            Self::Rsp(c) | Self::Conf(c) | Self::IndAck(c) => c,
        }
    }
}

/// Request delivered to the application that owns the target attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerReq<'a> {
    /// Read of an application-owned value, or a notification that a
    /// database-owned value was read when `needs_response` is `false`.
    Read {
        hdl: Handle,
        off: u16,
        is_long: bool,
        needs_response: bool,
    },
    /// Write or prepared write of `val` at `off`.
    Write {
        hdl: Handle,
        off: u16,
        val: &'a [u8],
        is_prepare: bool,
        needs_response: bool,
    },
    /// Execute (`commit == true`) or cancel previously prepared writes.
    ExecuteWrite { commit: bool },
    /// The ATT_MTU of the link has changed. Never answered.
    Mtu(u16),
    /// The peer confirmed an indication. Never answered.
    Confirm(Handle),
}

/// Application answer to a [`ServerReq`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    /// The request is complete. Read requests return the value, which is
    /// truncated to the MTU. The payload of other requests is ignored.
    Now(std::result::Result<Vec<u8>, ErrorCode>),
    /// The answer will be provided via [`Gatt::submit_response`].
    Later,
}

/// Event delivered to applications by the client procedures.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
    /// Discovered service.
    Service { range: HandleRange, uuid: Uuid },
    /// Discovered include declaration. The UUID is only known when it is a
    /// 16-bit UUID.
    Include {
        hdl: Handle,
        range: HandleRange,
        uuid: Option<Uuid>,
    },
    /// Discovered characteristic declaration.
    Characteristic {
        hdl: Handle,
        props: CharProps,
        vhdl: Handle,
        uuid: Uuid,
    },
    /// Discovered characteristic descriptor.
    Descriptor { hdl: Handle, uuid: Uuid },
    /// Discovery procedure completed.
    DiscoveryComplete(Result<()>),
    /// Read procedure completed. The handle is not known for Read Multiple.
    ReadComplete {
        hdl: Option<Handle>,
        result: Result<Vec<u8>>,
    },
    /// Write procedure completed.
    WriteComplete { hdl: Handle, result: Result<()> },
    /// Execute write completed.
    ExecuteComplete(Result<()>),
    /// MTU exchange completed with the new ATT_MTU.
    MtuComplete(Result<u16>),
    /// Handle value notification received.
    Notification { hdl: Handle, val: Vec<u8> },
    /// Handle value indication received. The confirmation is sent once all
    /// applications call [`Gatt::ack_indication`].
    Indication { hdl: Handle, val: Vec<u8> },
}

/// GATT application.
pub trait App: Debug + Send + Sync {
    /// Handles a request for an attribute owned by the application. Requests
    /// issued with [`TransId::NONE`] or `needs_response == false` may return
    /// [`Reply::Later`] without ever answering.
    fn server_request(&self, conn: ConnId, trans: TransId, req: ServerReq) -> Reply;

    /// Handles a client procedure event.
    fn client_event(&self, conn: ConnId, evt: ClientEvent) {
        let _ = (conn, evt);
    }
}
