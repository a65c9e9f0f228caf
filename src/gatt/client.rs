//! GATT client procedures ([Vol 3] Part G, Section 4).

use std::mem::take;

use structbuf::Unpacker;
use tracing::{debug, warn};

use crate::att::*;

use super::engine::Msg;
use super::*;

/// Client control block identifier.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub(super) struct ClcbId(u32);

/// Discovery procedure ([Vol 3] Part G, Sections 4.4 - 4.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiscType {
    /// Discover All Primary Services.
    AllServices,
    /// Discover Primary Service by Service UUID.
    ServicesByUuid(Uuid),
    /// Find Included Services.
    Includes,
    /// Discover All Characteristics of a Service.
    Characteristics,
    /// Discover All Characteristic Descriptors.
    Descriptors,
}

/// Read procedure ([Vol 3] Part G, Section 4.8).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadType {
    /// Read Characteristic Value, continued with Read Long Characteristic
    /// Values while the response fills the ATT_MTU.
    Handle(Handle),
    /// Read Long Characteristic Values starting at `off`.
    Partial { hdl: Handle, off: u16 },
    /// Read Using Characteristic UUID. Only the first value is returned.
    ByType { range: HandleRange, uuid: Uuid },
    /// Read Multiple Characteristic Values.
    Multiple(Vec<Handle>),
}

/// Write procedure ([Vol 3] Part G, Section 4.9).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteType {
    /// Write Without Response or Signed Write Without Response.
    NoResponse,
    /// Write Characteristic Value, or Write Long Characteristic Values if the
    /// value does not fit in one request.
    Write,
    /// A single prepared write of a Reliable Write. The application executes
    /// the queue with [`Gatt::execute_write`].
    Prepare,
}

/// Client procedure state.
#[derive(Debug)]
enum Proc {
    Discover {
        typ: DiscType,
        next: Handle,
        end: Handle,
    },
    Read {
        typ: ReadType,
        hdl: Option<Handle>,
        off: u16,
        val: Vec<u8>,
        blob: bool,
    },
    Write {
        typ: WriteType,
        hdl: Handle,
        off: u16,
        val: Vec<u8>,
        /// Number of bytes confirmed by the server.
        pos: usize,
        /// Length of the last prepared chunk.
        sent: usize,
        /// Reason for cancelling the prepare queue.
        cancel: Option<Error>,
    },
    Execute(bool),
    Mtu(u16),
}

/// Next action of a client procedure.
#[derive(Debug)]
enum Next {
    /// Send a request and wait for the response.
    Req(Opcode, Vec<u8>),
    /// Send a command and complete the procedure.
    Cmd(Vec<u8>, ClientEvent),
    /// Complete the procedure.
    Done(ClientEvent),
}

/// Client logical control block. One exists for every client procedure until
/// it completes.
#[derive(Debug)]
pub(super) struct Clcb {
    pub app: AppId,
    pub conn: ConnId,
    proc: Proc,
    auth: AuthReq,
    retry: u8,
    /// Request waiting for a response.
    req: Option<Opcode>,
    /// Write is signed instead of encrypting the link.
    sign: bool,
}

impl Clcb {
    /// Returns the completion event reporting `e`.
    pub fn fail_event(&self, e: Error) -> ClientEvent {
        match self.proc {
            Proc::Discover { .. } => ClientEvent::DiscoveryComplete(Err(e)),
            Proc::Read { hdl, .. } => ClientEvent::ReadComplete {
                hdl,
                result: Err(e),
            },
            Proc::Write { hdl, .. } => ClientEvent::WriteComplete {
                hdl,
                result: Err(e),
            },
            Proc::Execute(_) => ClientEvent::ExecuteComplete(Err(e)),
            Proc::Mtu(_) => ClientEvent::MtuComplete(Err(e)),
        }
    }

    /// Returns whether the procedure is subject to the discovery timeout.
    #[inline]
    const fn is_discovery(&self) -> bool {
        matches!(self.proc, Proc::Discover { .. })
    }

    /// Returns whether a response timeout should be retried.
    #[inline]
    const fn is_retryable(&self) -> bool {
        matches!(
            self.proc,
            Proc::Discover {
                typ: DiscType::AllServices,
                ..
            }
        )
    }

    /// Returns the next request of the procedure.
    fn next_req(&mut self, mtu: u16) -> Next {
        let r = match self.proc {
            Proc::Discover { typ, next, end } => Self::disc_req(typ, next, end, mtu),
            Proc::Read {
                ref typ,
                hdl,
                off,
                ref val,
                blob,
            } => match (blob, hdl) {
                (true, Some(hdl)) => {
                    let Some(off) = (usize::from(off) + val.len()).try_into().ok() else {
                        return Next::Done(ClientEvent::ReadComplete {
                            hdl: Some(hdl),
                            result: Ok(val.clone()),
                        });
                    };
                    Self::pdu(Opcode::ReadBlobReq, mtu, |w| {
                        w.handle(hdl)?.u16(off)?;
                        Ok(())
                    })
                }
                _ => Self::read_req(typ, mtu),
            },
            Proc::Write {
                typ,
                hdl,
                off,
                ref val,
                pos,
                ref mut sent,
                ref cancel,
            } => {
                let payload = usize::from(mtu) - 3;
                match typ {
                    WriteType::NoResponse if self.sign => {
                        let n = val.len().min(usize::from(mtu) - 3 - SIGNATURE_LEN);
                        return match Self::pdu(Opcode::SignedWriteCmd, mtu, |w| {
                            w.handle(hdl)?.put(&val[..n])?;
                            Ok(())
                        }) {
                            Ok((_, pdu)) => Next::Cmd(pdu, write_ok(hdl)),
                            Err(e) => Next::Done(self.fail_event(e)),
                        };
                    }
                    WriteType::NoResponse => {
                        let mut w = PduWriter::new(Opcode::WriteCmd, mtu);
                        if w.handle(hdl).is_ok() {
                            w.put_trunc(val);
                        }
                        return Next::Cmd(w.into_vec(), write_ok(hdl));
                    }
                    WriteType::Write if cancel.is_some() => Self::exec_req(false, mtu),
                    WriteType::Write if *sent == 0 && off == 0 && val.len() <= payload => {
                        Self::pdu(Opcode::WriteReq, mtu, |w| {
                            w.handle(hdl)?.put(val)?;
                            Ok(())
                        })
                    }
                    WriteType::Write if pos >= val.len() && *sent > 0 => Self::exec_req(true, mtu),
                    WriteType::Write | WriteType::Prepare => {
                        let chunk = &val[pos.min(val.len())..];
                        let chunk = &chunk[..chunk.len().min(usize::from(mtu) - 5)];
                        *sent = chunk.len().max(1);
                        let off = u16::try_from(usize::from(off) + pos).unwrap_or(u16::MAX);
                        Self::pdu(Opcode::PrepareWriteReq, mtu, |w| {
                            w.handle(hdl)?.u16(off)?.put(chunk)?;
                            Ok(())
                        })
                    }
                }
            }
            Proc::Execute(commit) => Self::exec_req(commit, mtu),
            Proc::Mtu(m) => Self::pdu(Opcode::ExchangeMtuReq, mtu, |w| {
                w.u16(m)?;
                Ok(())
            }),
        };
        match r {
            Ok((op, pdu)) => Next::Req(op, pdu),
            Err(e) => Next::Done(self.fail_event(e)),
        }
    }

    fn disc_req(typ: DiscType, next: Handle, end: Handle, mtu: u16) -> Result<(Opcode, Vec<u8>)> {
        match typ {
            DiscType::AllServices => Self::pdu(Opcode::ReadByGroupTypeReq, mtu, |w| {
                w.handle(next)?.handle(end)?.uuid(Uuid::PRIMARY_SERVICE)?;
                Ok(())
            }),
            DiscType::ServicesByUuid(u) => Self::pdu(Opcode::FindByTypeValueReq, mtu, |w| {
                w.handle(next)?.handle(end)?.u16(0x2800)?.uuid(u)?;
                Ok(())
            }),
            DiscType::Includes | DiscType::Characteristics => {
                let typ = if typ == DiscType::Includes {
                    Uuid::INCLUDE
                } else {
                    Uuid::CHARACTERISTIC
                };
                Self::pdu(Opcode::ReadByTypeReq, mtu, |w| {
                    w.handle(next)?.handle(end)?.uuid(typ)?;
                    Ok(())
                })
            }
            DiscType::Descriptors => Self::pdu(Opcode::FindInformationReq, mtu, |w| {
                w.handle(next)?.handle(end)?;
                Ok(())
            }),
        }
    }

    fn read_req(typ: &ReadType, mtu: u16) -> Result<(Opcode, Vec<u8>)> {
        match *typ {
            ReadType::Handle(hdl) => Self::pdu(Opcode::ReadReq, mtu, |w| {
                w.handle(hdl)?;
                Ok(())
            }),
            ReadType::Partial { hdl, off } => Self::pdu(Opcode::ReadBlobReq, mtu, |w| {
                w.handle(hdl)?.u16(off)?;
                Ok(())
            }),
            ReadType::ByType { range, uuid } => Self::pdu(Opcode::ReadByTypeReq, mtu, |w| {
                w.handle(range.start())?.handle(range.end())?.uuid(uuid)?;
                Ok(())
            }),
            ReadType::Multiple(ref hdls) => Self::pdu(Opcode::ReadMultipleReq, mtu, |w| {
                for &h in hdls {
                    w.handle(h)?;
                }
                Ok(())
            }),
        }
    }

    fn exec_req(commit: bool, mtu: u16) -> Result<(Opcode, Vec<u8>)> {
        Self::pdu(Opcode::ExecuteWriteReq, mtu, |w| {
            w.u8(u8::from(commit))?;
            Ok(())
        })
    }

    fn pdu(
        op: Opcode,
        mtu: u16,
        f: impl FnOnce(&mut PduWriter) -> std::result::Result<(), NoResources>,
    ) -> Result<(Opcode, Vec<u8>)> {
        let mut w = PduWriter::new(op, mtu);
        f(&mut w).map_err(|_| Error::NoResources)?;
        Ok((op, w.into_vec()))
    }

    /// Processes a successful response. Discovered items are added to `evts`.
    /// Returns the completion event or [`None`] if the procedure continues.
    fn on_rsp(
        &mut self,
        op: Opcode,
        p: &[u8],
        mtu: u16,
        max_len: usize,
        evts: &mut Vec<ClientEvent>,
    ) -> Option<ClientEvent> {
        let invalid = Error::Status(ErrorCode::InvalidPdu);
        match self.proc {
            Proc::Discover {
                typ,
                ref mut next,
                end,
            } => {
                let Some(last) = parse_disc(typ, op, p, evts) else {
                    return Some(ClientEvent::DiscoveryComplete(Err(invalid)));
                };
                if last < *next {
                    warn!("Discovery response did not advance past {next}");
                    return Some(ClientEvent::DiscoveryComplete(Err(invalid)));
                }
                match last.next() {
                    Some(h) if last < end => {
                        *next = h;
                        None
                    }
                    _ => Some(ClientEvent::DiscoveryComplete(Ok(()))),
                }
            }
            Proc::Read {
                ref mut hdl,
                ref mut val,
                ref mut blob,
                ..
            } => {
                let full = match op {
                    Opcode::ReadByTypeRsp => {
                        let Some((h, v)) = parse_first(p) else {
                            return Some(ClientEvent::ReadComplete {
                                hdl: *hdl,
                                result: Err(invalid),
                            });
                        };
                        *hdl = Some(h);
                        val.extend_from_slice(v);
                        v.len() == usize::from(mtu) - 4
                    }
                    Opcode::ReadMultipleRsp => {
                        val.extend_from_slice(p);
                        false
                    }
                    _ => {
                        val.extend_from_slice(p);
                        p.len() == usize::from(mtu) - 1
                    }
                };
                if full && val.len() < max_len && hdl.is_some() {
                    *blob = true;
                    return None;
                }
                val.truncate(max_len);
                Some(ClientEvent::ReadComplete {
                    hdl: *hdl,
                    result: Ok(take(val)),
                })
            }
            Proc::Write {
                typ,
                hdl,
                off,
                ref val,
                ref mut pos,
                sent,
                ref mut cancel,
            } => match op {
                Opcode::WriteRsp => Some(write_ok(hdl)),
                Opcode::PrepareWriteRsp => {
                    let end = (*pos + sent).min(val.len());
                    let want = &val[(*pos).min(end)..end];
                    let mut e = Unpacker::new(p);
                    let (eh, eoff) = (e.u16(), e.u16());
                    let ok = e.is_ok()
                        && eh == u16::from(hdl)
                        && usize::from(eoff) == usize::from(off) + *pos
                        && unpack_rest(&mut e) == want;
                    match (typ, ok) {
                        (WriteType::Prepare, true) => Some(write_ok(hdl)),
                        (WriteType::Prepare, false) => Some(ClientEvent::WriteComplete {
                            hdl,
                            result: Err(Error::Cancelled),
                        }),
                        (_, true) => {
                            *pos = end;
                            None
                        }
                        (_, false) => {
                            warn!("Prepared write echo mismatch for {hdl}");
                            *cancel = Some(Error::Cancelled);
                            None
                        }
                    }
                }
                _ => Some(ClientEvent::WriteComplete {
                    hdl,
                    result: cancel.take().map_or(Ok(()), Err),
                }),
            },
            Proc::Execute(_) => Some(ClientEvent::ExecuteComplete(Ok(()))),
            Proc::Mtu(m) => {
                let mut e = Unpacker::new(p);
                let server = e.u16();
                Some(ClientEvent::MtuComplete(if e.is_ok() {
                    Ok(m.min(server).max(DEFAULT_MTU))
                } else {
                    Err(invalid)
                }))
            }
        }
    }

    /// Processes an error response. Returns the completion event or [`None`]
    /// if the procedure continues.
    fn on_err(&mut self, e: ErrorRsp) -> Option<ClientEvent> {
        match self.proc {
            Proc::Discover { .. } if e.err == ErrorCode::AttributeNotFound => {
                Some(ClientEvent::DiscoveryComplete(Ok(())))
            }
            Proc::Read {
                hdl,
                ref mut val,
                blob: true,
                ..
            } if !val.is_empty()
                && matches!(e.err, ErrorCode::AttributeNotLong | ErrorCode::InvalidOffset) =>
            {
                Some(ClientEvent::ReadComplete {
                    hdl,
                    result: Ok(take(val)),
                })
            }
            Proc::Write {
                typ: WriteType::Write,
                ref mut cancel,
                sent,
                ..
            } if sent > 0 && cancel.is_none() && self.req == Some(Opcode::PrepareWriteReq) => {
                *cancel = Some(Error::Att(e));
                None
            }
            _ => Some(self.fail_event(Error::Att(e))),
        }
    }
}

impl<H: Host> Gatt<H> {
    /// Starts a discovery procedure within `range`. Discovered items are
    /// reported as [`ClientEvent`]s followed by
    /// [`ClientEvent::DiscoveryComplete`].
    pub fn discover(&mut self, conn: ConnId, app: AppId, typ: DiscType, range: HandleRange) -> Result<()> {
        let proc = Proc::Discover {
            typ,
            next: range.start(),
            end: range.end(),
        };
        self.submit(conn, app, AuthReq::None, proc)
    }

    /// Starts a read procedure. The result is reported as
    /// [`ClientEvent::ReadComplete`].
    pub fn read(&mut self, conn: ConnId, app: AppId, typ: ReadType, auth: AuthReq) -> Result<()> {
        let (hdl, off, blob) = match typ {
            ReadType::Handle(hdl) => (Some(hdl), 0, false),
            ReadType::Partial { hdl, off } => (Some(hdl), off, true),
            ReadType::ByType { .. } => (None, 0, false),
            ReadType::Multiple(ref hdls) => {
                if hdls.is_empty() || hdls.len() > self.cfg.max_read_multi_handles {
                    return Err(Error::InvalidParam);
                }
                (None, 0, false)
            }
        };
        let proc = Proc::Read {
            typ,
            hdl,
            off,
            val: Vec::new(),
            blob,
        };
        self.submit(conn, app, auth, proc)
    }

    /// Starts a write procedure. The result is reported as
    /// [`ClientEvent::WriteComplete`].
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        conn: ConnId,
        app: AppId,
        typ: WriteType,
        hdl: Handle,
        off: u16,
        val: &[u8],
        auth: AuthReq,
    ) -> Result<()> {
        if val.len() > MAX_VAL_LEN
            || usize::from(off) + val.len() > usize::from(u16::MAX)
            || (typ == WriteType::NoResponse && off != 0)
        {
            return Err(Error::InvalidParam);
        }
        let proc = Proc::Write {
            typ,
            hdl,
            off,
            val: val.to_vec(),
            pos: 0,
            sent: 0,
            cancel: None,
        };
        self.submit(conn, app, auth, proc)
    }

    /// Executes or cancels writes prepared with [`WriteType::Prepare`]. The
    /// result is reported as [`ClientEvent::ExecuteComplete`].
    pub fn execute_write(&mut self, conn: ConnId, app: AppId, commit: bool) -> Result<()> {
        self.submit(conn, app, AuthReq::None, Proc::Execute(commit))
    }

    /// Exchanges the ATT_MTU with the server. The result is reported as
    /// [`ClientEvent::MtuComplete`].
    pub fn configure_mtu(&mut self, conn: ConnId, app: AppId, mtu: u16) -> Result<()> {
        if mtu < DEFAULT_MTU {
            return Err(Error::InvalidParam);
        }
        let mtu = self.cfg.clamp_mtu(mtu);
        self.submit(conn, app, AuthReq::None, Proc::Mtu(mtu))
    }

    /// Acknowledges a received [`ClientEvent::Indication`]. The confirmation
    /// is sent once every application acknowledges it.
    pub fn ack_indication(&mut self, conn: ConnId, app: AppId) -> Result<()> {
        self.check_app(app)?;
        let t = self.links.get_mut(&conn).ok_or(Error::NotConnected)?;
        if t.ind_ack == 0 {
            return Err(Error::InvalidParam);
        }
        t.ind_ack -= 1;
        if t.ind_ack == 0 {
            self.host.stop(TimerId::IndAck(conn));
            self.send(conn, &[u8::from(Opcode::HandleValueCfm)]);
        }
        Ok(())
    }

    /// Handles a response, notification, or indication from the peer server.
    pub(super) fn client_pdu(&mut self, conn: ConnId, op: Opcode, pdu: &[u8]) {
        if matches!(op, Opcode::HandleValueNtf | Opcode::HandleValueInd) {
            return self.peer_value(conn, op, pdu);
        }
        let Some(id) = self.links.get(&conn).and_then(|t| t.cl_active) else {
            warn!("Unexpected {op} from {conn}");
            return;
        };
        let mtu = self.mtu(conn).unwrap_or(DEFAULT_MTU);
        let max_len = self.cfg.max_attr_len;
        let Some(c) = self.clcbs.get_mut(&id) else {
            return;
        };
        let Some(req) = c.req else {
            warn!("Unexpected {op} from {conn}");
            return;
        };
        let mut evts = Vec::new();
        let done = if op == Opcode::ErrorRsp {
            let Some(e) = ErrorRsp::from_pdu(pdu).filter(|e| e.req == u8::from(req)) else {
                warn!("Invalid error response from {conn}");
                return;
            };
            debug!("{e}");
            let done = c.on_err(e);
            c.req = None;
            done
        } else if req.rsp() == Some(op) {
            c.req = None;
            c.on_rsp(op, &pdu[1..], mtu, max_len, &mut evts)
        } else {
            warn!("Unexpected {op} from {conn} while waiting for a response to {req}");
            return;
        };
        self.host.stop(TimerId::Rsp(conn));
        let app = c.app;
        for evt in evts {
            self.app_event(conn, app, evt);
        }
        match done {
            Some(evt) => self.complete(id, evt),
            None => self.send_req(id),
        }
    }

    /// Resumes operations waiting on an encryption upgrade.
    pub(super) fn enc_complete(&mut self, conn: ConnId, ok: bool) {
        let Some(t) = self.links.get_mut(&conn) else {
            return;
        };
        let ids = t.sec.complete();
        let sec = self.link_sec(conn);
        debug!("Encryption of {conn} complete ({ok}), resuming {} operation(s)", ids.len());
        for id in ids {
            let Some(auth) = self.clcbs.get(&id).map(|c| c.auth) else {
                continue;
            };
            match resume_status(auth, ok, sec) {
                Ok(()) => self.enqueue(conn, id),
                Err(e) => {
                    if let Some(evt) = self.clcbs.get(&id).map(|c| c.fail_event(Error::Status(e))) {
                        self.complete(id, evt);
                    }
                }
            }
        }
    }

    /// Retries or fails the active operation after a response timeout
    /// ([Vol 3] Part F, Section 3.3.3).
    pub(super) fn rsp_timeout(&mut self, conn: ConnId) {
        let Some(id) = self.links.get(&conn).and_then(|t| t.cl_active) else {
            return;
        };
        let limit = self.cfg.retry_limit;
        let Some(c) = self.clcbs.get_mut(&id).filter(|c| c.req.is_some()) else {
            return;
        };
        if c.is_retryable() && c.retry < limit {
            c.retry += 1;
            warn!("Response timeout on {conn}, retry {}/{limit}", c.retry);
            c.req = None;
            return self.send_req(id);
        }
        warn!("Response timeout on {conn}");
        let evt = c.fail_event(Error::Timeout);
        self.host.disconnect(conn);
        self.complete(id, evt);
    }

    /// Sends the confirmation of a received indication that was not
    /// acknowledged in time.
    pub(super) fn ind_ack_timeout(&mut self, conn: ConnId) {
        let Some(t) = self.links.get_mut(&conn).filter(|t| t.ind_ack > 0) else {
            return;
        };
        warn!("Indication acknowledgment timeout on {conn}");
        t.ind_ack = 0;
        self.send(conn, &[u8::from(Opcode::HandleValueCfm)]);
    }

    /// Creates a new client operation and starts its security check.
    fn submit(&mut self, conn: ConnId, app: AppId, auth: AuthReq, proc: Proc) -> Result<()> {
        self.check_app(app)?;
        if !self.links.contains_key(&conn) {
            return Err(Error::NotConnected);
        }
        let mut id = self.last_clcb;
        loop {
            id = ClcbId(id.0.wrapping_add(1));
            if !self.clcbs.contains_key(&id) {
                break;
            }
        }
        self.last_clcb = id;
        let c = Clcb {
            app,
            conn,
            proc,
            auth,
            retry: 0,
            req: None,
            sign: false,
        };
        debug!("New client operation {id:?}: {:?}", c.proc);
        self.clcbs.insert(id, c);
        self.security_check(conn, id);
        self.run();
        Ok(())
    }

    /// Queues the operation for sending, or waits for an encryption upgrade.
    fn security_check(&mut self, conn: ConnId, id: ClcbId) {
        let Some(c) = self.clcbs.get(&id) else {
            return;
        };
        let auth = c.auth;
        let write_cmd = matches!(
            c.proc,
            Proc::Write {
                typ: WriteType::NoResponse,
                ..
            }
        );
        let sec = self.link_sec(conn);
        let Some(t) = self.links.get_mut(&conn) else {
            return;
        };
        let act = determine_required_action(sec, t.sec.is_upgrading(), auth, write_cmd);
        match act {
            SecAction::Ok | SecAction::SignData => {
                if let Some(c) = self.clcbs.get_mut(&id) {
                    c.sign = act == SecAction::SignData;
                }
                self.enqueue(conn, id);
            }
            _ => {
                debug!("Operation {id:?} on {conn} waiting for {act}");
                if t.sec.enqueue(act, id) && !self.host.request_encryption(conn, act) {
                    warn!("Failed to start encryption of {conn}");
                    self.inbox.push_back(Msg::EncComplete { conn, ok: false });
                }
            }
        }
    }

    /// Sends the operation or queues it behind the active one.
    fn enqueue(&mut self, conn: ConnId, id: ClcbId) {
        let Some(t) = self.links.get_mut(&conn) else {
            return;
        };
        if t.cl_active.is_some() {
            t.cl_queue.push_back(id);
            return;
        }
        t.cl_active = Some(id);
        self.send_req(id);
    }

    /// Sends the next request of an active operation.
    fn send_req(&mut self, id: ClcbId) {
        let Some(c) = self.clcbs.get_mut(&id) else {
            return;
        };
        let conn = c.conn;
        let mtu = self.links.get(&conn).map_or(DEFAULT_MTU, |t| t.mtu);
        let timeout = if c.is_discovery() {
            self.cfg.disc_rsp_timeout
        } else {
            self.cfg.rsp_timeout
        };
        match c.next_req(mtu) {
            Next::Req(op, pdu) => {
                c.req = Some(op);
                self.host.start(TimerId::Rsp(conn), timeout);
                if let Err(e) = self.host.send(conn, &pdu) {
                    warn!("Failed to send {op} to {conn}: {e}");
                    let evt = c.fail_event(Error::Transport);
                    self.host.stop(TimerId::Rsp(conn));
                    self.complete(id, evt);
                }
            }
            Next::Cmd(mut pdu, evt) => {
                if c.sign {
                    let Some(sig) = self.host.sign(conn, &pdu) else {
                        let e = Error::Status(ErrorCode::InsufficientAuthentication);
                        let evt = c.fail_event(e);
                        return self.complete(id, evt);
                    };
                    pdu.extend_from_slice(&sig);
                }
                let evt = match self.host.send(conn, &pdu) {
                    Ok(()) => evt,
                    Err(_) => c.fail_event(Error::Transport),
                };
                self.complete(id, evt);
            }
            Next::Done(evt) => self.complete(id, evt),
        }
    }

    /// Reports the completion of an operation and starts the next one.
    fn complete(&mut self, id: ClcbId, evt: ClientEvent) {
        let Some(c) = self.clcbs.remove(&id) else {
            return;
        };
        let conn = c.conn;
        debug!("Client operation {id:?} complete: {evt:?}");
        let mut next = None;
        if let Some(t) = self.links.get_mut(&conn) {
            if let ClientEvent::MtuComplete(Ok(mtu)) = evt {
                t.mtu = mtu;
                self.host.mtu_changed(conn, mtu);
            }
            if t.cl_active == Some(id) {
                t.cl_active = None;
                next = t.cl_queue.pop_front();
            }
            t.cl_queue.retain(|&q| q != id);
        }
        self.app_event(conn, c.app, evt);
        if let Some(next) = next {
            if let Some(t) = self.links.get_mut(&conn) {
                t.cl_active = Some(next);
            }
            self.send_req(next);
        }
    }

    /// Delivers a peer notification or indication to every application.
    fn peer_value(&mut self, conn: ConnId, op: Opcode, pdu: &[u8]) {
        let mut p = Unpacker::new(&pdu[1..]);
        let Some(hdl) = Handle::new(p.u16()).filter(|_| p.is_ok()) else {
            warn!("Invalid {op} from {conn}");
            return;
        };
        let val = unpack_rest(&mut p);
        let apps = self.user_apps();
        if op == Opcode::HandleValueInd {
            let Some(t) = self.links.get_mut(&conn) else {
                return;
            };
            if t.ind_ack > 0 {
                warn!("Indication from {conn} before the previous one was confirmed");
            }
            t.ind_ack = u16::try_from(apps.len()).unwrap_or(u16::MAX);
            if t.ind_ack == 0 {
                self.send(conn, &[u8::from(Opcode::HandleValueCfm)]);
            } else {
                self.host.start(TimerId::IndAck(conn), self.cfg.ind_ack_timeout);
            }
        }
        for app in apps {
            let val = val.to_vec();
            let evt = if op == Opcode::HandleValueInd {
                ClientEvent::Indication { hdl, val }
            } else {
                ClientEvent::Notification { hdl, val }
            };
            self.app_event(conn, app, evt);
        }
    }
}

#[inline]
const fn write_ok(hdl: Handle) -> ClientEvent {
    ClientEvent::WriteComplete { hdl, result: Ok(()) }
}

/// Parses a discovery response into events. Returns the last handle covered
/// by the response or [`None`] if the response is invalid.
fn parse_disc(typ: DiscType, op: Opcode, p: &[u8], evts: &mut Vec<ClientEvent>) -> Option<Handle> {
    let mut last = None;
    match (typ, op) {
        (DiscType::AllServices, Opcode::ReadByGroupTypeRsp) => {
            for mut e in entries(p, |n| n == 6 || n == 20)? {
                let range = HandleRange::from_raw(e.u16(), e.u16())?;
                let uuid = Uuid::from_le_bytes(unpack_rest(&mut e))?;
                evts.push(ClientEvent::Service { range, uuid });
                last = Some(range.end());
            }
        }
        (DiscType::ServicesByUuid(uuid), Opcode::FindByTypeValueRsp) => {
            if p.is_empty() || p.len() % 4 != 0 {
                return None;
            }
            for c in p.chunks_exact(4) {
                let mut e = Unpacker::new(c);
                let range = HandleRange::from_raw(e.u16(), e.u16())?;
                evts.push(ClientEvent::Service { range, uuid });
                last = Some(range.end());
            }
        }
        (DiscType::Includes, Opcode::ReadByTypeRsp) => {
            for mut e in entries(p, |n| n == 6 || n == 8)? {
                let hdl = Handle::new(e.u16())?;
                let range = HandleRange::from_raw(e.u16(), e.u16())?;
                let uuid = Uuid::from_le_bytes(unpack_rest(&mut e));
                evts.push(ClientEvent::Include { hdl, range, uuid });
                last = Some(hdl);
            }
        }
        (DiscType::Characteristics, Opcode::ReadByTypeRsp) => {
            for mut e in entries(p, |n| n == 7 || n == 21)? {
                let hdl = Handle::new(e.u16())?;
                let props = CharProps::from_bits_retain(e.u8());
                let vhdl = Handle::new(e.u16())?;
                let uuid = Uuid::from_le_bytes(unpack_rest(&mut e))?;
                evts.push(ClientEvent::Characteristic {
                    hdl,
                    props,
                    vhdl,
                    uuid,
                });
                last = Some(hdl);
            }
        }
        (DiscType::Descriptors, Opcode::FindInformationRsp) => {
            let (&fmt, p) = p.split_first()?;
            let n = match fmt {
                1 => 4,
                2 => 18,
                _ => return None,
            };
            if p.is_empty() || p.len() % n != 0 {
                return None;
            }
            for c in p.chunks_exact(n) {
                let mut e = Unpacker::new(c);
                let hdl = Handle::new(e.u16())?;
                let uuid = Uuid::from_le_bytes(unpack_rest(&mut e))?;
                evts.push(ClientEvent::Descriptor { hdl, uuid });
                last = Some(hdl);
            }
        }
        _ => return None,
    }
    last
}

/// Splits a response with a leading entry length into entry unpackers.
fn entries(p: &[u8], valid: impl Fn(usize) -> bool) -> Option<impl Iterator<Item = Unpacker<'_>>> {
    let (&n, p) = p.split_first()?;
    let n = usize::from(n);
    if !valid(n) || p.is_empty() || p.len() % n != 0 {
        return None;
    }
    Some(p.chunks_exact(n).map(Unpacker::new))
}

/// Returns the first handle/value pair of `ATT_READ_BY_TYPE_RSP`.
fn parse_first(p: &[u8]) -> Option<(Handle, &[u8])> {
    let (&n, p) = p.split_first()?;
    let e = p.get(..usize::from(n))?;
    let (h, v) = (e.get(..2)?, e.get(2..)?);
    Some((Handle::new(u16::from_le_bytes([h[0], h[1]]))?, v))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use matches::assert_matches;

    use super::super::testing::*;
    use super::*;

    fn h(v: u16) -> Handle {
        Handle::new(v).unwrap()
    }

    fn client(cfg: Config) -> (Gatt<MockHost>, Arc<MockApp>, AppId) {
        let mut g = gatt(cfg);
        let a = MockApp::new();
        let app = g.register_app(a.clone()).unwrap();
        g.on_connect(CONN);
        (g, a, app)
    }

    #[test]
    fn discover_services() {
        let (mut g, a, app) = client(Config::default());
        g.discover(CONN, app, DiscType::AllServices, HandleRange::ALL)
            .unwrap();
        assert_eq!(
            g.host().take_sent(),
            [vec![0x10, 1, 0, 0xFF, 0xFF, 0x00, 0x28]]
        );
        assert_eq!(g.host().timers(), [TimerId::Rsp(CONN)]);
        g.on_pdu(
            CONN,
            &[0x11, 6, 1, 0, 5, 0, 0x00, 0x18, 6, 0, 9, 0, 0x01, 0x18],
        );
        assert_eq!(
            a.events(),
            [
                ClientEvent::Service {
                    range: HandleRange::new(h(1), h(5)),
                    uuid: Uuid::Uuid16(0x1800)
                },
                ClientEvent::Service {
                    range: HandleRange::new(h(6), h(9)),
                    uuid: Uuid::Uuid16(0x1801)
                },
            ]
        );
        assert_eq!(
            g.host().take_sent(),
            [vec![0x10, 10, 0, 0xFF, 0xFF, 0x00, 0x28]]
        );
        g.on_pdu(CONN, &[0x01, 0x10, 10, 0, 0x0A]);
        assert_eq!(a.events(), [ClientEvent::DiscoveryComplete(Ok(()))]);
        assert!(g.host().timers().is_empty());

        // Last service ends the walk
        g.discover(CONN, app, DiscType::ServicesByUuid(Uuid::Uuid16(0x180F)), HandleRange::ALL)
            .unwrap();
        assert_eq!(
            g.host().take_sent(),
            [vec![0x06, 1, 0, 0xFF, 0xFF, 0x00, 0x28, 0x0F, 0x18]]
        );
        g.on_pdu(CONN, &[0x07, 0x10, 0, 0xFF, 0xFF]);
        assert_matches!(
            a.events().as_slice(),
            [ClientEvent::Service { .. }, ClientEvent::DiscoveryComplete(Ok(()))]
        );
        assert!(g.host().take_sent().is_empty());
    }

    #[test]
    fn discover_characteristics() {
        let (mut g, a, app) = client(Config::default());
        let r = HandleRange::new(h(1), h(5));
        g.discover(CONN, app, DiscType::Characteristics, r).unwrap();
        assert_eq!(g.host().take_sent(), [vec![0x08, 1, 0, 5, 0, 0x03, 0x28]]);
        g.on_pdu(CONN, &[0x09, 7, 2, 0, 0x0A, 3, 0, 0x19, 0x2A]);
        assert_eq!(
            a.events(),
            [ClientEvent::Characteristic {
                hdl: h(2),
                props: CharProps::READ | CharProps::WRITE,
                vhdl: h(3),
                uuid: Uuid::Uuid16(0x2A19)
            }]
        );
        assert_eq!(g.host().take_sent(), [vec![0x08, 3, 0, 5, 0, 0x03, 0x28]]);
        // Malformed entry length
        g.on_pdu(CONN, &[0x09, 5, 2, 0, 0x0A, 3, 0]);
        assert_eq!(
            a.events(),
            [ClientEvent::DiscoveryComplete(Err(Error::Status(ErrorCode::InvalidPdu)))]
        );

        g.discover(CONN, app, DiscType::Descriptors, HandleRange::new(h(4), h(5)))
            .unwrap();
        assert_eq!(g.host().take_sent(), [vec![0x04, 4, 0, 5, 0]]);
        g.on_pdu(CONN, &[0x05, 1, 4, 0, 0x02, 0x29, 5, 0, 0x01, 0x29]);
        assert_eq!(
            a.events(),
            [
                ClientEvent::Descriptor {
                    hdl: h(4),
                    uuid: Uuid::Uuid16(0x2902)
                },
                ClientEvent::Descriptor {
                    hdl: h(5),
                    uuid: Uuid::Uuid16(0x2901)
                },
                ClientEvent::DiscoveryComplete(Ok(())),
            ]
        );
    }

    #[test]
    fn long_read() {
        let (mut g, a, app) = client(Config::default());
        g.read(CONN, app, ReadType::Handle(h(3)), AuthReq::None)
            .unwrap();
        assert_eq!(g.host().take_sent(), [vec![0x0A, 3, 0]]);
        let mut rsp = vec![0x0B];
        rsp.extend_from_slice(&[1; 22]);
        g.on_pdu(CONN, &rsp);
        assert_eq!(g.host().take_sent(), [vec![0x0C, 3, 0, 22, 0]]);
        g.on_pdu(CONN, &[0x0D, 2, 2]);
        let mut want = vec![1; 22];
        want.extend_from_slice(&[2, 2]);
        assert_eq!(
            a.events(),
            [ClientEvent::ReadComplete {
                hdl: Some(h(3)),
                result: Ok(want)
            }]
        );

        // Attribute that is exactly one payload long
        g.read(CONN, app, ReadType::Handle(h(3)), AuthReq::None)
            .unwrap();
        g.on_pdu(CONN, &rsp);
        g.on_pdu(CONN, &[0x01, 0x0C, 3, 0, 0x0B]);
        assert_eq!(
            a.events(),
            [ClientEvent::ReadComplete {
                hdl: Some(h(3)),
                result: Ok(vec![1; 22])
            }]
        );

        g.read(CONN, app, ReadType::Handle(h(3)), AuthReq::None)
            .unwrap();
        g.on_pdu(CONN, &[0x01, 0x0A, 3, 0, 0x02]);
        assert_matches!(
            a.events().as_slice(),
            [ClientEvent::ReadComplete {
                result: Err(Error::Att(ErrorRsp {
                    err: ErrorCode::ReadNotPermitted,
                    ..
                })),
                ..
            }]
        );
    }

    #[test]
    fn read_by_type_and_multiple() {
        let (mut g, a, app) = client(Config::default());
        let r = ReadType::ByType {
            range: HandleRange::ALL,
            uuid: Uuid::Uuid16(0x2A00),
        };
        g.read(CONN, app, r, AuthReq::None).unwrap();
        assert_eq!(
            g.host().take_sent(),
            [vec![0x08, 1, 0, 0xFF, 0xFF, 0x00, 0x2A]]
        );
        let mut rsp = vec![0x09, 21, 3, 0];
        rsp.extend_from_slice(&[b'a'; 19]);
        g.on_pdu(CONN, &rsp);
        assert_eq!(g.host().take_sent(), [vec![0x0C, 3, 0, 19, 0]]);
        g.on_pdu(CONN, &[0x0D, b'b']);
        let mut want = vec![b'a'; 19];
        want.push(b'b');
        assert_eq!(
            a.events(),
            [ClientEvent::ReadComplete {
                hdl: Some(h(3)),
                result: Ok(want)
            }]
        );

        assert_eq!(
            g.read(CONN, app, ReadType::Multiple(Vec::new()), AuthReq::None),
            Err(Error::InvalidParam)
        );
        g.read(CONN, app, ReadType::Multiple(vec![h(3), h(5)]), AuthReq::None)
            .unwrap();
        assert_eq!(g.host().take_sent(), [vec![0x0E, 3, 0, 5, 0]]);
        g.on_pdu(CONN, &[0x0F, 1, 2, 3]);
        assert_eq!(
            a.events(),
            [ClientEvent::ReadComplete {
                hdl: None,
                result: Ok(vec![1, 2, 3])
            }]
        );
    }

    #[test]
    fn long_write() {
        let (mut g, a, app) = client(Config::default());
        let val: Vec<u8> = (0..30).collect();
        g.write(CONN, app, WriteType::Write, h(3), 0, &val, AuthReq::None)
            .unwrap();
        let mut p1 = vec![0x16, 3, 0, 0, 0];
        p1.extend_from_slice(&val[..18]);
        assert_eq!(g.host().take_sent(), [p1.clone()]);
        p1[0] = 0x17;
        g.on_pdu(CONN, &p1);
        let mut p2 = vec![0x16, 3, 0, 18, 0];
        p2.extend_from_slice(&val[18..]);
        assert_eq!(g.host().take_sent(), [p2.clone()]);
        p2[0] = 0x17;
        g.on_pdu(CONN, &p2);
        assert_eq!(g.host().take_sent(), [vec![0x18, 1]]);
        g.on_pdu(CONN, &[0x19]);
        assert_eq!(
            a.events(),
            [ClientEvent::WriteComplete {
                hdl: h(3),
                result: Ok(())
            }]
        );

        // Echo mismatch cancels the queue
        g.write(CONN, app, WriteType::Write, h(3), 0, &val, AuthReq::None)
            .unwrap();
        g.host().take_sent();
        g.on_pdu(CONN, &[0x17, 3, 0, 0, 0, 9]);
        assert_eq!(g.host().take_sent(), [vec![0x18, 0]]);
        g.on_pdu(CONN, &[0x19]);
        assert_eq!(
            a.events(),
            [ClientEvent::WriteComplete {
                hdl: h(3),
                result: Err(Error::Cancelled)
            }]
        );

        // Short values use a single request
        g.write(CONN, app, WriteType::Write, h(3), 0, &[1, 2], AuthReq::None)
            .unwrap();
        assert_eq!(g.host().take_sent(), [vec![0x12, 3, 0, 1, 2]]);
        g.on_pdu(CONN, &[0x13]);
        assert_eq!(a.events().len(), 1);

        g.write(CONN, app, WriteType::NoResponse, h(3), 0, &val, AuthReq::None)
            .unwrap();
        let sent = g.host().take_sent();
        assert_eq!((sent[0].len(), &sent[0][..3]), (23, &[0x52, 3, 0][..]));
        assert_matches!(a.events().as_slice(), [ClientEvent::WriteComplete { result: Ok(()), .. }]);
    }

    #[test]
    fn queued_operations() {
        let (mut g, a, app) = client(Config::default());
        g.read(CONN, app, ReadType::Handle(h(3)), AuthReq::None)
            .unwrap();
        g.execute_write(CONN, app, true).unwrap();
        assert_eq!(g.host().take_sent(), [vec![0x0A, 3, 0]]);
        // Response to the wrong request is ignored
        g.on_pdu(CONN, &[0x19]);
        g.on_pdu(CONN, &[0x0B, 1]);
        assert_eq!(g.host().take_sent(), [vec![0x18, 1]]);
        g.on_pdu(CONN, &[0x19]);
        assert_matches!(
            a.events().as_slice(),
            [
                ClientEvent::ReadComplete { result: Ok(_), .. },
                ClientEvent::ExecuteComplete(Ok(()))
            ]
        );

        g.read(CONN, app, ReadType::Handle(h(3)), AuthReq::None)
            .unwrap();
        g.configure_mtu(CONN, app, 200).unwrap();
        g.on_disconnect(CONN);
        assert_eq!(
            a.events(),
            [
                ClientEvent::ReadComplete {
                    hdl: Some(h(3)),
                    result: Err(Error::Disconnected)
                },
                ClientEvent::MtuComplete(Err(Error::Disconnected)),
            ]
        );
        assert_eq!(
            g.read(CONN, app, ReadType::Handle(h(3)), AuthReq::None),
            Err(Error::NotConnected)
        );
    }

    #[test]
    fn exchange_mtu() {
        let (mut g, a, app) = client(Config::default());
        g.configure_mtu(CONN, app, 100).unwrap();
        assert_eq!(g.host().take_sent(), [vec![0x02, 100, 0]]);
        g.on_pdu(CONN, &[0x03, 50, 0]);
        assert_eq!(a.events(), [ClientEvent::MtuComplete(Ok(50))]);
        assert_eq!(g.mtu(CONN), Some(50));
        assert_eq!(g.host().mtu, Some((CONN, 50)));
        assert_eq!(g.configure_mtu(CONN, app, 22), Err(Error::InvalidParam));
    }

    #[test]
    fn encryption_upgrade() {
        let (mut g, a, app) = client(Config::default());
        g.read(CONN, app, ReadType::Handle(h(3)), AuthReq::NoMitm)
            .unwrap();
        g.read(CONN, app, ReadType::Handle(h(4)), AuthReq::NoMitm)
            .unwrap();
        assert!(g.host().take_sent().is_empty());
        assert_eq!(g.host().enc, [(CONN, SecAction::EncryptNoMitm)]);

        g.host_mut().sec = LinkSec::new(SecFlags::KEY_KNOWN | SecFlags::ENCRYPTED, 16);
        g.on_encryption_complete(CONN, true);
        assert_eq!(g.host().take_sent(), [vec![0x0A, 3, 0]]);
        g.on_pdu(CONN, &[0x0B, 1]);
        assert_eq!(g.host().take_sent(), [vec![0x0A, 4, 0]]);
        a.events();

        // MITM is checked against the current key
        g.host_mut().sec = LinkSec::default();
        g.read(CONN, app, ReadType::Handle(h(3)), AuthReq::Mitm)
            .unwrap();
        g.host_mut().sec = LinkSec::new(SecFlags::KEY_KNOWN | SecFlags::ENCRYPTED, 16);
        g.on_encryption_complete(CONN, true);
        assert_eq!(
            a.events(),
            [ClientEvent::ReadComplete {
                hdl: Some(h(3)),
                result: Err(Error::Status(ErrorCode::InsufficientAuthentication))
            }]
        );

        g.host_mut().sec = LinkSec::default();
        g.host_mut().enc_ok = false;
        g.read(CONN, app, ReadType::Handle(h(3)), AuthReq::NoMitm)
            .unwrap();
        assert_eq!(
            a.events(),
            [ClientEvent::ReadComplete {
                hdl: Some(h(3)),
                result: Err(Error::Status(ErrorCode::InsufficientEncryption))
            }]
        );
    }

    #[test]
    fn signed_write() {
        let (mut g, a, app) = client(Config::default());
        g.host_mut().sec = LinkSec::new(SecFlags::KEY_KNOWN | SecFlags::SIGNING_KEY, 0);
        g.host_mut().sig = Some([9; SIGNATURE_LEN]);
        let auth = AuthReq::SignedNoMitm;
        g.write(CONN, app, WriteType::NoResponse, h(3), 0, &[1, 2], auth)
            .unwrap();
        let mut want = vec![0xD2, 3, 0, 1, 2];
        want.extend_from_slice(&[9; SIGNATURE_LEN]);
        assert_eq!(g.host().take_sent(), [want]);
        assert_matches!(a.events().as_slice(), [ClientEvent::WriteComplete { result: Ok(()), .. }]);

        g.host_mut().sig = None;
        g.write(CONN, app, WriteType::NoResponse, h(3), 0, &[1, 2], auth)
            .unwrap();
        assert!(g.host().take_sent().is_empty());
        assert_eq!(
            a.events(),
            [ClientEvent::WriteComplete {
                hdl: h(3),
                result: Err(Error::Status(ErrorCode::InsufficientAuthentication))
            }]
        );
    }

    #[test]
    fn timeout_retry() {
        let (mut g, a, app) = client(Config {
            retry_limit: 1,
            ..Config::default()
        });
        g.discover(CONN, app, DiscType::AllServices, HandleRange::ALL)
            .unwrap();
        let req = g.host().take_sent();
        g.on_timeout(TimerId::Rsp(CONN));
        assert_eq!(g.host().take_sent(), req);
        g.on_timeout(TimerId::Rsp(CONN));
        assert_eq!(g.host().disconnects, [CONN]);
        assert_eq!(a.events(), [ClientEvent::DiscoveryComplete(Err(Error::Timeout))]);

        g.read(CONN, app, ReadType::Handle(h(3)), AuthReq::None)
            .unwrap();
        g.on_timeout(TimerId::Rsp(CONN));
        assert_eq!(g.host().disconnects, [CONN, CONN]);
    }

    #[test]
    fn peer_values() {
        let (mut g, a, app) = client(Config::default());
        let b = MockApp::new();
        let app2 = g.register_app(b.clone()).unwrap();
        g.on_pdu(CONN, &[0x1B, 3, 0, 1]);
        let ntf = ClientEvent::Notification {
            hdl: h(3),
            val: vec![1],
        };
        assert_eq!((a.events(), b.events()), (vec![ntf.clone()], vec![ntf]));

        g.on_pdu(CONN, &[0x1D, 3, 0, 2]);
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
        g.ack_indication(CONN, app).unwrap();
        assert!(g.host().take_sent().is_empty());
        g.ack_indication(CONN, app2).unwrap();
        assert_eq!(g.host().take_sent(), [vec![0x1E]]);
        assert_eq!(g.ack_indication(CONN, app), Err(Error::InvalidParam));

        g.on_pdu(CONN, &[0x1D, 3, 0, 2]);
        g.on_timeout(TimerId::IndAck(CONN));
        assert_eq!(g.host().take_sent(), [vec![0x1E]]);
    }
}
