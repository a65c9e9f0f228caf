//! ATT server request dispatcher ([Vol 3] Part F, Section 3.4).

use smallvec::SmallVec;
use structbuf::Unpacker;
use tracing::{debug, warn};

use crate::att::*;

use super::tcb::{Cmd, CmdData, PrepEntry, ReadMulti};
use super::*;

/// Result of a request handler.
#[derive(Debug)]
enum Outcome {
    /// Response PDU to send.
    Rsp(Vec<u8>),
    /// Waiting on one or more applications.
    Pending,
    /// Nothing to send.
    Done,
}

impl<H: Host> Gatt<H> {
    /// Sends a notification of an attribute owned by `app`. The value is
    /// truncated to the ATT_MTU of the link.
    pub fn notify(&mut self, conn: ConnId, app: AppId, hdl: Handle, val: &[u8]) -> Result<()> {
        self.check_owner(app, hdl)?;
        let mtu = self.mtu(conn).ok_or(Error::NotConnected)?;
        let pdu = rsp::handle_value(Opcode::HandleValueNtf, hdl, val, mtu);
        self.host.send(conn, &pdu)
    }

    /// Sends an indication of an attribute owned by `app`, or queues it until
    /// the previous indication is confirmed. The owner receives
    /// [`ServerReq::Confirm`] when the peer confirms it.
    pub fn indicate(&mut self, conn: ConnId, app: AppId, hdl: Handle, val: &[u8]) -> Result<()> {
        self.check_owner(app, hdl)?;
        if !self.links.contains_key(&conn) {
            return Err(Error::NotConnected);
        }
        self.queue_indication(conn, hdl, val.to_vec());
        self.run();
        Ok(())
    }

    /// Handles a request, command, or confirmation from the peer client.
    pub(super) fn server_pdu(&mut self, conn: ConnId, op: Opcode, pdu: &[u8]) {
        let Some(t) = self.links.get_mut(&conn) else {
            return;
        };
        if pdu.len() > usize::from(t.mtu) {
            warn!("{op} from {conn} exceeds ATT_MTU ({} > {})", pdu.len(), t.mtu);
            if !op.is_unacked() {
                let e = ErrorRsp::new(op.into(), None, ErrorCode::InvalidPdu);
                self.send(conn, &e.to_pdu());
            }
            return;
        }
        let Some(trans) = t.enqueue(op, None) else {
            warn!("Discarded {op} from {conn} while another request is pending");
            return;
        };
        debug!("{op} from {conn} ({trans})");
        let p = &pdu[1..];
        let r = match op {
            Opcode::ExchangeMtuReq => self.exchange_mtu(conn, p),
            Opcode::FindInformationReq => self.find_information(conn, p),
            Opcode::FindByTypeValueReq => self.find_by_type_value(conn, p),
            Opcode::ReadByTypeReq => self.read_by_type(conn, trans, p),
            Opcode::ReadReq | Opcode::ReadBlobReq => self.read_req(conn, trans, op, p),
            Opcode::ReadMultipleReq => self.read_multiple(conn, trans, p),
            Opcode::ReadByGroupTypeReq => self.read_by_group_type(conn, p),
            Opcode::WriteReq | Opcode::WriteCmd | Opcode::SignedWriteCmd => {
                self.write_req(conn, trans, op, pdu)
            }
            Opcode::PrepareWriteReq => self.prepare_write(conn, trans, p),
            Opcode::ExecuteWriteReq => self.execute_write_req(conn, trans, p),
            Opcode::HandleValueCfm => Ok(self.confirm(conn)),
            _ => op.err(ErrorCode::RequestNotSupported),
        };
        self.finish(conn, op, trans, r);
    }

    /// Handles an application answer to a pending server command.
    pub(super) fn app_response(
        &mut self,
        conn: ConnId,
        app: AppId,
        trans: TransId,
        result: std::result::Result<Vec<u8>, ErrorCode>,
    ) {
        let Some(t) = self.links.get_mut(&conn) else {
            return;
        };
        let mtu = t.mtu;
        let Some(op) = t.cmd().filter(|c| c.trans == trans).map(|c| c.op) else {
            debug!("Ignored stale response {trans} from {app}");
            return;
        };
        let Some(mut all) = t.answer_cback(app) else {
            warn!("Unexpected response {trans} from {app}");
            return;
        };
        if op == Opcode::ReadMultipleReq {
            if let Some(Cmd {
                req: CmdData::Multi(m),
                ..
            }) = t.cmd_mut(trans)
            {
                if let Some(hdl) = m.next() {
                    m.push(hdl, result);
                }
            }
            let r = self.read_multi_next(conn, trans);
            return self.finish(conn, op, trans, r);
        }
        let mut prep_ok = false;
        if let Some(cmd) = t.cmd_mut(trans) {
            match result {
                Ok(v) => {
                    prep_ok = op == Opcode::PrepareWriteReq;
                    if cmd.status == Err(ErrorCode::AttributeNotFound) {
                        cmd.status = Ok(());
                    }
                    if cmd.rsp.is_none() {
                        cmd.rsp = success_rsp(cmd, v, mtu);
                    }
                }
                Err(e) => {
                    cmd.status = Err(e);
                    if op == Opcode::ExecuteWriteReq {
                        all = true;
                    }
                }
            }
        }
        if prep_ok {
            t.add_prep(app);
        }
        if !all {
            return;
        }
        let Some(cmd) = t.dequeue() else { return };
        let pdu = match (cmd.status, cmd.rsp) {
            (Ok(()), Some(pdu)) => pdu,
            (Ok(()), None) => ErrorRsp::new(op.into(), cmd.hdl, ErrorCode::UnlikelyError).to_pdu(),
            (Err(e), _) => ErrorRsp::new(op.into(), cmd.hdl, e).to_pdu(),
        };
        self.send(conn, &pdu);
    }

    /// Queues an indication and sends it if none is in flight.
    pub(super) fn queue_indication(&mut self, conn: ConnId, hdl: Handle, val: Vec<u8>) {
        if let Some(t) = self.links.get_mut(&conn) {
            t.ind_queue.push_back((hdl, val));
            self.send_next_indication(conn);
        }
    }

    /// Disconnects a link that failed to confirm an indication in time
    /// ([Vol 3] Part F, Section 3.3.3).
    pub(super) fn conf_timeout(&mut self, conn: ConnId) {
        if let Some(hdl) = self.links.get(&conn).and_then(|t| t.ind) {
            warn!("Indication of {hdl} to {conn} was not confirmed");
            self.host.disconnect(conn);
        }
    }

    /// Sends the response PDU of a handler and frees the command slot unless
    /// the handler is waiting on applications. Commands and confirmations
    /// never receive a response.
    fn finish(&mut self, conn: ConnId, op: Opcode, trans: TransId, r: RspResult<Outcome>) {
        let pdu = match r {
            Ok(Outcome::Pending) => return,
            Ok(Outcome::Rsp(pdu)) => Some(pdu),
            Ok(Outcome::Done) => None,
            Err(e) => {
                debug!("{e}");
                Some(e.to_pdu())
            }
        };
        if let Some(t) = self.links.get_mut(&conn) {
            if t.cmd().map_or(false, |c| c.trans == trans) {
                t.dequeue();
            }
        }
        match pdu {
            Some(pdu) if !op.is_unacked() => self.send(conn, &pdu),
            _ => {}
        }
    }

    /// Handles `ATT_EXCHANGE_MTU_REQ` ([Vol 3] Part F, Section 3.4.2.1).
    fn exchange_mtu(&mut self, conn: ConnId, p: &[u8]) -> RspResult<Outcome> {
        let op = Opcode::ExchangeMtuReq;
        let mut p = Unpacker::new(p);
        let client = p.u16();
        if !p.is_ok() {
            return op.err(ErrorCode::InvalidPdu);
        }
        let mut w = PduWriter::new(Opcode::ExchangeMtuRsp, DEFAULT_MTU);
        if w.u16(self.cfg.max_mtu).is_err() {
            return op.err(ErrorCode::UnlikelyError);
        }
        self.send(conn, w.as_ref());
        let mtu = self.cfg.clamp_mtu(client);
        if let Some(t) = self.links.get_mut(&conn) {
            t.mtu = mtu;
        }
        debug!("ATT_MTU for {conn} is {mtu}");
        self.host.mtu_changed(conn, mtu);
        for app in self.apps.keys().copied().collect::<Vec<_>>() {
            self.call_app(conn, app, TransId::NONE, ServerReq::Mtu(mtu));
        }
        Ok(Outcome::Done)
    }

    /// Handles `ATT_FIND_INFORMATION_REQ`.
    fn find_information(&mut self, conn: ConnId, p: &[u8]) -> RspResult<Outcome> {
        let op = Opcode::FindInformationReq;
        let range = unpack_range(op, &mut Unpacker::new(p))?;
        let mtu = self.link_mtu(conn);
        rsp::find_information(&self.db.lock(), range, mtu).map(Outcome::Rsp)
    }

    /// Handles `ATT_FIND_BY_TYPE_VALUE_REQ`.
    fn find_by_type_value(&mut self, conn: ConnId, p: &[u8]) -> RspResult<Outcome> {
        let op = Opcode::FindByTypeValueReq;
        let mut p = Unpacker::new(p);
        let range = unpack_range(op, &mut p)?;
        let typ = p.u16();
        if !p.is_ok() {
            return op.err(ErrorCode::InvalidPdu);
        }
        let val = unpack_rest(&mut p);
        let mtu = self.link_mtu(conn);
        rsp::find_by_type_value(&self.db.lock(), range, Uuid::Uuid16(typ), val, mtu)
            .map(Outcome::Rsp)
    }

    /// Handles `ATT_READ_BY_GROUP_TYPE_REQ`.
    fn read_by_group_type(&mut self, conn: ConnId, p: &[u8]) -> RspResult<Outcome> {
        let op = Opcode::ReadByGroupTypeReq;
        let mut p = Unpacker::new(p);
        let range = unpack_range(op, &mut p)?;
        let typ = unpack_uuid(op, &mut p)?;
        let mtu = self.link_mtu(conn);
        rsp::read_by_group_type(&self.db.lock(), range, typ, mtu).map(Outcome::Rsp)
    }

    /// Handles `ATT_READ_BY_TYPE_REQ`. An application-owned first match is
    /// returned as the only entry.
    fn read_by_type(&mut self, conn: ConnId, trans: TransId, p: &[u8]) -> RspResult<Outcome> {
        let op = Opcode::ReadByTypeReq;
        let mut p = Unpacker::new(p);
        let range = unpack_range(op, &mut p)?;
        let typ = unpack_uuid(op, &mut p)?;
        let (sec, mtu) = (self.link_sec(conn), self.link_mtu(conn));
        let r = (self.db.lock()).read_by_type(range, typ, usize::from(mtu) - 2, sec)?;
        match r {
            ByType::Entries(e) => rsp::read_by_type(&e, mtu)
                .map(Outcome::Rsp)
                .ok_or_else(|| ErrorRsp::new(op.into(), Some(range.start()), ErrorCode::UnlikelyError)),
            ByType::Pending(hdl) => {
                let app = self.owner(op, hdl)?;
                self.expect(conn, trans, app, hdl, CmdData::ByType(hdl));
                let req = ServerReq::Read {
                    hdl,
                    off: 0,
                    is_long: false,
                    needs_response: true,
                };
                self.call_app(conn, app, trans, req);
                Ok(Outcome::Pending)
            }
        }
    }

    /// Handles `ATT_READ_REQ` and `ATT_READ_BLOB_REQ`.
    fn read_req(&mut self, conn: ConnId, trans: TransId, op: Opcode, p: &[u8]) -> RspResult<Outcome> {
        let is_long = op == Opcode::ReadBlobReq;
        let mut p = Unpacker::new(p);
        let hdl = p.u16();
        let off = if is_long { p.u16() } else { 0 };
        if !p.is_ok() {
            return op.err(ErrorCode::InvalidPdu);
        }
        let hdl = Handle::new(hdl).ok_or_else(|| ErrorRsp::new(op.into(), None, ErrorCode::InvalidHandle))?;
        let (sec, mtu) = (self.link_sec(conn), self.link_mtu(conn));
        let (r, notice) = {
            let db = self.db.lock();
            let r = db.read(hdl, off, is_long, usize::from(mtu) - 1, sec);
            let notice = (db.attr(hdl)).map_or(false, |at| !at.is_decl() && !at.is_app());
            (r, notice.then(|| db.find_service(hdl).map(Service::app)).flatten())
        };
        match r.map_err(|e| ErrorRsp::new(op.into(), Some(hdl), e))? {
            Read::Value(v) => {
                if let Some(app) = notice {
                    let req = ServerReq::Read {
                        hdl,
                        off,
                        is_long,
                        needs_response: false,
                    };
                    self.call_app(conn, app, TransId::NONE, req);
                }
                let rop = if is_long {
                    Opcode::ReadBlobRsp
                } else {
                    Opcode::ReadRsp
                };
                Ok(Outcome::Rsp(rsp::value(rop, &v, mtu)))
            }
            Read::Pending => {
                let app = self.owner(op, hdl)?;
                self.expect(conn, trans, app, hdl, CmdData::None);
                let req = ServerReq::Read {
                    hdl,
                    off,
                    is_long,
                    needs_response: true,
                };
                self.call_app(conn, app, trans, req);
                Ok(Outcome::Pending)
            }
        }
    }

    /// Handles `ATT_READ_MULTIPLE_REQ`. Every handle is checked before any
    /// value is read.
    fn read_multiple(&mut self, conn: ConnId, trans: TransId, p: &[u8]) -> RspResult<Outcome> {
        let op = Opcode::ReadMultipleReq;
        if p.is_empty() {
            return op.err(ErrorCode::InvalidHandle);
        }
        if p.len() % 2 != 0 {
            return op.err(ErrorCode::InvalidPdu);
        }
        let mut hdls = SmallVec::<[Handle; 10]>::new();
        for c in p.chunks_exact(2) {
            let &[lo, hi] = c else { continue };
            let h = Handle::new(u16::from_le_bytes([lo, hi]))
                .ok_or_else(|| ErrorRsp::new(op.into(), None, ErrorCode::InvalidHandle))?;
            hdls.push(h);
        }
        if hdls.len() > self.cfg.max_read_multi_handles {
            warn!(
                "Read Multiple from {conn} truncated to {} handles",
                self.cfg.max_read_multi_handles
            );
            hdls.truncate(self.cfg.max_read_multi_handles);
        }
        let sec = self.link_sec(conn);
        {
            let db = self.db.lock();
            for &hdl in &hdls {
                let at = db.attr(hdl).map_or(Err(ErrorCode::InvalidHandle), Ok);
                if let Err(e) = at.and_then(|at| at.perm().check_read(sec)) {
                    return op.hdl_err(e, hdl);
                }
            }
        }
        if let Some(cmd) = self.links.get_mut(&conn).and_then(|t| t.cmd_mut(trans)) {
            cmd.req = CmdData::Multi(ReadMulti::new(hdls));
        }
        self.read_multi_next(conn, trans)
    }

    /// Reads values into the Read Multiple queue until an application-owned
    /// value is reached or the response is complete.
    fn read_multi_next(&mut self, conn: ConnId, trans: TransId) -> RspResult<Outcome> {
        loop {
            let sec = self.link_sec(conn);
            let Some(t) = self.links.get_mut(&conn) else {
                return Ok(Outcome::Done);
            };
            let mtu = t.mtu;
            let Some(Cmd {
                req: CmdData::Multi(m),
                hdl: cmd_hdl,
                ..
            }) = t.cmd_mut(trans)
            else {
                return Ok(Outcome::Done);
            };
            let Some(hdl) = m.next() else {
                return m.build(mtu).map(Outcome::Rsp);
            };
            *cmd_hdl = Some(hdl);
            let (r, app) = {
                let db = self.db.lock();
                let r = db.read(hdl, 0, false, usize::from(mtu) - 1, sec);
                (r, db.find_service(hdl).map(Service::app))
            };
            match (r, app) {
                (Ok(Read::Pending), Some(app)) => {
                    t.add_cback(app);
                    let req = ServerReq::Read {
                        hdl,
                        off: 0,
                        is_long: false,
                        needs_response: true,
                    };
                    self.call_app(conn, app, trans, req);
                    return Ok(Outcome::Pending);
                }
                (Ok(Read::Pending), None) => m.push(hdl, Err(ErrorCode::UnlikelyError)),
                (Ok(Read::Value(v)), _) => m.push(hdl, Ok(v)),
                (Err(e), _) => m.push(hdl, Err(e)),
            }
        }
    }

    /// Handles `ATT_WRITE_REQ`, `ATT_WRITE_CMD`, and `ATT_SIGNED_WRITE_CMD`.
    /// Invalid signatures are dropped.
    fn write_req(&mut self, conn: ConnId, trans: TransId, op: Opcode, pdu: &[u8]) -> RspResult<Outcome> {
        let mut p = Unpacker::new(&pdu[1..]);
        let hdl = p.u16();
        if !p.is_ok() {
            return op.err(ErrorCode::InvalidPdu);
        }
        let mut val = unpack_rest(&mut p);
        if op == Opcode::SignedWriteCmd {
            let Some(n) = val.len().checked_sub(SIGNATURE_LEN) else {
                warn!("Signed write from {conn} is too short");
                return Ok(Outcome::Done);
            };
            let (v, sig) = val.split_at(n);
            let &[c0, c1, c2, c3, ..] = sig else {
                return Ok(Outcome::Done);
            };
            let data = &pdu[..pdu.len() - SIGNATURE_LEN];
            let counter = u32::from_le_bytes([c0, c1, c2, c3]);
            if !self.host.verify(conn, data, counter, sig) {
                warn!("Dropped signed write from {conn} with an invalid signature");
                return Ok(Outcome::Done);
            }
            val = v;
        }
        let hdl = Handle::new(hdl).ok_or_else(|| ErrorRsp::new(op.into(), None, ErrorCode::InvalidHandle))?;
        let sec = self.link_sec(conn);
        let (r, app) = {
            let mut db = self.db.lock();
            let r = db.write(hdl, 0, val, op, sec);
            (r, db.find_service(hdl).map(Service::app))
        };
        let w = r.map_err(|e| ErrorRsp::new(op.into(), Some(hdl), e))?;
        let Some(app) = app else {
            return Ok(Outcome::Rsp(vec![Opcode::WriteRsp.into()]));
        };
        let needs_response = w == Write::App && op == Opcode::WriteReq;
        let req = ServerReq::Write {
            hdl,
            off: 0,
            val,
            is_prepare: false,
            needs_response,
        };
        if needs_response {
            self.expect(conn, trans, app, hdl, CmdData::None);
            self.call_app(conn, app, trans, req);
            return Ok(Outcome::Pending);
        }
        let trans = if w == Write::App { trans } else { TransId::NONE };
        self.call_app(conn, app, trans, req);
        Ok(Outcome::Rsp(vec![Opcode::WriteRsp.into()]))
    }

    /// Handles `ATT_PREPARE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.1).
    /// Database-owned values are queued even if the offset or length is
    /// invalid. The first such error is reported by the execute write.
    fn prepare_write(&mut self, conn: ConnId, trans: TransId, p: &[u8]) -> RspResult<Outcome> {
        let op = Opcode::PrepareWriteReq;
        let mut p = Unpacker::new(p);
        let (hdl, off) = (p.u16(), p.u16());
        if !p.is_ok() {
            return op.err(ErrorCode::InvalidPdu);
        }
        let val = unpack_rest(&mut p);
        let hdl = Handle::new(hdl).ok_or_else(|| ErrorRsp::new(op.into(), None, ErrorCode::InvalidHandle))?;
        let (sec, mtu) = (self.link_sec(conn), self.link_mtu(conn));
        let (max_len, app) = {
            let db = self.db.lock();
            let at = (db.check_write(hdl, op, off, val.len(), sec))
                .map_err(|e| ErrorRsp::new(op.into(), Some(hdl), e))?;
            (at.max_len(), db.find_service(hdl).map(Service::app))
        };
        let max_prep = self.cfg.max_prep_entries;
        let Some(t) = self.links.get_mut(&conn) else {
            return Ok(Outcome::Done);
        };
        if t.prep.len() >= max_prep {
            return op.hdl_err(ErrorCode::PrepareQueueFull, hdl);
        }
        if let Some(max) = max_len.map(usize::from) {
            let end = usize::from(off) + val.len();
            let err = if usize::from(off) > max {
                Some(ErrorCode::InvalidOffset)
            } else if end > max {
                Some(ErrorCode::InvalidAttributeValueLength)
            } else {
                None
            };
            let e = PrepEntry {
                hdl,
                off,
                val: val.to_vec(),
            };
            t.prep.push(e, err);
            return Ok(Outcome::Rsp(rsp::prepare_write(hdl, off, val, mtu)));
        }
        let app = app.ok_or_else(|| ErrorRsp::new(op.into(), Some(hdl), ErrorCode::UnlikelyError))?;
        let data = CmdData::Prepare {
            hdl,
            off,
            val: val.to_vec(),
        };
        self.expect(conn, trans, app, hdl, data);
        let req = ServerReq::Write {
            hdl,
            off,
            val,
            is_prepare: true,
            needs_response: true,
        };
        self.call_app(conn, app, trans, req);
        Ok(Outcome::Pending)
    }

    /// Handles `ATT_EXECUTE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.3).
    /// The response is sent before the queue is drained unless applications
    /// hold prepared writes of a commit.
    fn execute_write_req(&mut self, conn: ConnId, trans: TransId, p: &[u8]) -> RspResult<Outcome> {
        let op = Opcode::ExecuteWriteReq;
        let mut p = Unpacker::new(p);
        let commit = p.u8() & 1 != 0;
        if !p.is_ok() {
            return op.err(ErrorCode::InvalidPdu);
        }
        let Some(t) = self.links.get_mut(&conn) else {
            return Ok(Outcome::Done);
        };
        let (err, is_local) = (t.prep.err(), t.prep.is_local());
        let q = t.prep.drain();
        let apps = t.take_prep_apps();
        let valid = commit && err.is_none();
        let early = match err.filter(|_| commit) {
            Some(e) => Some(ErrorRsp::new(op.into(), None, e).to_pdu()),
            None if !commit || is_local => Some(vec![Opcode::ExecuteWriteRsp.into()]),
            None => None,
        };
        let sent = early.is_some();
        if let Some(pdu) = early {
            self.send(conn, &pdu);
        }
        if valid {
            let mut db = self.db.lock();
            let mut seen = SmallVec::<[Handle; 8]>::new();
            for e in q {
                let first = !seen.contains(&e.hdl);
                if first {
                    seen.push(e.hdl);
                }
                if let Err(err) = db.apply_prepared(e.hdl, e.off, &e.val, first) {
                    warn!("Failed to commit prepared write to {}: {err}", e.hdl);
                }
            }
        }
        if apps.is_empty() {
            return Ok(if sent {
                Outcome::Done
            } else {
                Outcome::Rsp(vec![Opcode::ExecuteWriteRsp.into()])
            });
        }
        let req = ServerReq::ExecuteWrite { commit: valid };
        if sent {
            for app in apps {
                self.call_app(conn, app, TransId::NONE, req);
            }
            return Ok(Outcome::Done);
        }
        if let Some(t) = self.links.get_mut(&conn) {
            for &app in &apps {
                t.add_cback(app);
            }
        }
        for app in apps {
            self.call_app(conn, app, trans, req);
        }
        Ok(Outcome::Pending)
    }

    /// Handles `ATT_HANDLE_VALUE_CFM` and sends the next queued indication.
    fn confirm(&mut self, conn: ConnId) -> Outcome {
        let Some(hdl) = self.links.get_mut(&conn).and_then(|t| t.ind.take()) else {
            warn!("Unexpected confirmation from {conn}");
            return Outcome::Done;
        };
        self.host.stop(TimerId::Conf(conn));
        let sc = self.builtin.as_ref().map(|b| b.svc.sc_handle());
        if sc != Some(hdl) {
            let app = self.db.lock().find_service(hdl).map(Service::app);
            if let Some(app) = app {
                self.call_app(conn, app, TransId::NONE, ServerReq::Confirm(hdl));
            }
        }
        self.send_next_indication(conn);
        Outcome::Done
    }

    fn send_next_indication(&mut self, conn: ConnId) {
        let Some(t) = self.links.get_mut(&conn) else {
            return;
        };
        if t.ind.is_some() {
            return;
        }
        let Some((hdl, val)) = t.ind_queue.pop_front() else {
            return;
        };
        t.ind = Some(hdl);
        let pdu = rsp::handle_value(Opcode::HandleValueInd, hdl, &val, t.mtu);
        self.host.start(TimerId::Conf(conn), self.cfg.rsp_timeout);
        self.send(conn, &pdu);
    }

    /// Records that the pending command waits on `app`.
    fn expect(&mut self, conn: ConnId, trans: TransId, app: AppId, hdl: Handle, req: CmdData) {
        if let Some(t) = self.links.get_mut(&conn) {
            if let Some(cmd) = t.cmd_mut(trans) {
                cmd.hdl = Some(hdl);
                cmd.req = req;
            }
            t.add_cback(app);
        }
    }

    /// Returns the application that owns `hdl`.
    fn owner(&self, op: Opcode, hdl: Handle) -> RspResult<AppId> {
        let app = self.db.lock().find_service(hdl).map(Service::app);
        app.ok_or_else(|| ErrorRsp::new(op.into(), Some(hdl), ErrorCode::InvalidHandle))
    }

    /// Returns an error if `hdl` is not in a started service owned by `app`.
    fn check_owner(&self, app: AppId, hdl: Handle) -> Result<()> {
        self.check_app(app)?;
        match self.db.lock().find_service(hdl) {
            Some(s) if s.app() == app => Ok(()),
            _ => Err(Error::InvalidParam),
        }
    }

    #[inline]
    fn link_mtu(&self, conn: ConnId) -> u16 {
        self.mtu(conn).unwrap_or(DEFAULT_MTU)
    }
}

/// Builds the success response of a command answered by an application.
fn success_rsp(cmd: &Cmd, mut v: Vec<u8>, mtu: u16) -> Option<Vec<u8>> {
    Some(match (cmd.op, &cmd.req) {
        (Opcode::ReadReq, _) => rsp::value(Opcode::ReadRsp, &v, mtu),
        (Opcode::ReadBlobReq, _) => rsp::value(Opcode::ReadBlobRsp, &v, mtu),
        (Opcode::ReadByTypeReq, &CmdData::ByType(hdl)) => {
            v.truncate(usize::from(mtu - 4).min(usize::from(u8::MAX) - 2));
            rsp::read_by_type(&[(hdl, v)], mtu)?
        }
        (Opcode::WriteReq, _) => vec![Opcode::WriteRsp.into()],
        (Opcode::PrepareWriteReq, CmdData::Prepare { hdl, off, val }) => {
            rsp::prepare_write(*hdl, *off, val, mtu)
        }
        (Opcode::ExecuteWriteReq, _) => vec![Opcode::ExecuteWriteRsp.into()],
        _ => return None,
    })
}

/// Unpacks a handle range. An invalid range is reported with the starting
/// handle ([Vol 3] Part F, Section 3.4.3.1).
fn unpack_range(op: Opcode, p: &mut Unpacker) -> RspResult<HandleRange> {
    let (start, end) = (p.u16(), p.u16());
    if !p.is_ok() {
        return op.err(ErrorCode::InvalidPdu);
    }
    HandleRange::from_raw(start, end)
        .ok_or_else(|| ErrorRsp::new(op.into(), Handle::new(start), ErrorCode::InvalidHandle))
}

/// Unpacks a 16- or 128-bit attribute type from the rest of the PDU.
fn unpack_uuid(op: Opcode, p: &mut Unpacker) -> RspResult<Uuid> {
    let v = unpack_rest(p);
    match v.len() {
        2 | 16 => Uuid::from_le_bytes(v).map_or_else(|| op.err(ErrorCode::InvalidPdu), Ok),
        _ => op.err(ErrorCode::InvalidPdu),
    }
}
