use std::collections::{BTreeMap, VecDeque};

use smallvec::SmallVec;

use crate::att::*;

use super::client::ClcbId;
use super::*;

type AttResult<T> = std::result::Result<T, ErrorCode>;

/// Server command occupying the transaction slot of a link.
#[derive(Debug)]
pub(super) struct Cmd {
    pub op: Opcode,
    pub hdl: Option<Handle>,
    pub trans: TransId,
    /// Aggregated application status.
    pub status: AttResult<()>,
    /// Response built from the first successful application answer.
    pub rsp: Option<Vec<u8>>,
    /// Request data needed to build the response.
    pub req: CmdData,
}

/// Request data of a command waiting on an application.
#[derive(Debug, Default)]
pub(super) enum CmdData {
    #[default]
    None,
    /// Read By Type with an application-owned first match.
    ByType(Handle),
    /// Prepared write to be echoed.
    Prepare { hdl: Handle, off: u16, val: Vec<u8> },
    /// Read Multiple aggregation.
    Multi(ReadMulti),
}

/// Read Multiple aggregation queue. Results are collected in request order.
#[derive(Debug, Default)]
pub(super) struct ReadMulti {
    hdls: SmallVec<[Handle; 10]>,
    vals: Vec<(Handle, AttResult<Vec<u8>>)>,
}

impl ReadMulti {
    /// Creates a queue for the requested handles.
    pub fn new(hdls: impl IntoIterator<Item = Handle>) -> Self {
        Self {
            hdls: hdls.into_iter().collect(),
            vals: Vec::new(),
        }
    }

    /// Returns the next handle to read.
    #[inline]
    pub fn next(&self) -> Option<Handle> {
        self.hdls.get(self.vals.len()).copied()
    }

    /// Adds the result of reading `hdl`.
    #[inline]
    pub fn push(&mut self, hdl: Handle, r: AttResult<Vec<u8>>) {
        self.vals.push((hdl, r));
    }

    /// Builds `ATT_READ_MULTIPLE_RSP` by walking the results in request order.
    /// Any missing, mismatched, or failed result aborts the response.
    pub fn build(&self, mtu: u16) -> RspResult<Vec<u8>> {
        let op = Opcode::ReadMultipleReq;
        for (i, &hdl) in self.hdls.iter().enumerate() {
            match self.vals.get(i) {
                Some((h, _)) if *h != hdl => {
                    return op.hdl_err(ErrorCode::AttributeNotFound, hdl);
                }
                Some((_, Err(e))) => return op.hdl_err(*e, hdl),
                None => return op.hdl_err(ErrorCode::AttributeNotFound, hdl),
                Some(_) => {}
            }
        }
        let vals = self.vals.iter().filter_map(|(_, v)| v.as_deref().ok());
        Ok(rsp::read_multiple(vals, mtu))
    }
}

/// Queued prepared write of a database-owned value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct PrepEntry {
    pub hdl: Handle,
    pub off: u16,
    pub val: Vec<u8>,
}

/// Prepare write queue ([Vol 3] Part F, Section 3.4.6.1). Only
/// database-owned values are queued. Application-owned values are counted
/// and kept by the application.
#[derive(Debug, Default)]
pub(super) struct PrepQueue {
    q: VecDeque<PrepEntry>,
    total: usize,
    err: Option<ErrorCode>,
}

impl PrepQueue {
    /// Returns the number of queued entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.q.len()
    }

    /// Queues an entry. The first validation error is kept for the execute
    /// write response.
    pub fn push(&mut self, e: PrepEntry, err: Option<ErrorCode>) {
        self.q.push_back(e);
        self.total += 1;
        if self.err.is_none() {
            self.err = err;
        }
    }

    /// Counts a write prepared by an application.
    #[inline]
    pub fn count_app(&mut self) {
        self.total += 1;
    }

    /// Returns the first recorded validation error.
    #[inline]
    pub const fn err(&self) -> Option<ErrorCode> {
        self.err
    }

    /// Returns whether every prepared write is in the queue.
    #[inline]
    pub fn is_local(&self) -> bool {
        self.total == self.q.len()
    }

    /// Removes all entries and resets the record.
    pub fn drain(&mut self) -> VecDeque<PrepEntry> {
        self.total = 0;
        self.err = None;
        std::mem::take(&mut self.q)
    }
}

/// Connection transaction block holding the ATT state of one link.
#[derive(Debug)]
pub(super) struct Tcb {
    pub conn: ConnId,
    pub mtu: u16,
    slot: Option<Cmd>,
    last_trans: TransId,
    pub prep: PrepQueue,
    /// Outstanding application callbacks of the current command.
    cback: BTreeMap<AppId, u16>,
    /// Prepared writes per application.
    prep_cnt: BTreeMap<AppId, u16>,
    /// Indication waiting for a confirmation from the peer.
    pub ind: Option<Handle>,
    /// Indications waiting for the current one to be confirmed.
    pub ind_queue: VecDeque<(Handle, Vec<u8>)>,
    pub sec: SecGate<ClcbId>,
    /// Client operation waiting for a response from the peer.
    pub cl_active: Option<ClcbId>,
    /// Client operations waiting for the active one.
    pub cl_queue: VecDeque<ClcbId>,
    /// Applications yet to acknowledge a received indication.
    pub ind_ack: u16,
}

impl Tcb {
    /// Creates the transaction block of a new link.
    pub fn new(conn: ConnId) -> Self {
        Self {
            conn,
            mtu: DEFAULT_MTU,
            slot: None,
            last_trans: TransId::NONE,
            prep: PrepQueue::default(),
            cback: BTreeMap::new(),
            prep_cnt: BTreeMap::new(),
            ind: None,
            ind_queue: VecDeque::new(),
            sec: SecGate::default(),
            cl_active: None,
            cl_queue: VecDeque::new(),
            ind_ack: 0,
        }
    }

    /// Issues a transaction id for `op`. Commands, MTU exchange, and
    /// confirmations never occupy the command slot. Returns [`None`] if the
    /// slot is occupied.
    pub fn enqueue(&mut self, op: Opcode, hdl: Option<Handle>) -> Option<TransId> {
        let occupies = !op.is_unacked() && op != Opcode::ExchangeMtuReq;
        if occupies && self.slot.is_some() {
            return None;
        }
        self.last_trans = self.last_trans.next();
        if occupies {
            self.slot = Some(Cmd {
                op,
                hdl,
                trans: self.last_trans,
                status: Err(ErrorCode::AttributeNotFound),
                rsp: None,
                req: CmdData::None,
            });
        }
        Some(self.last_trans)
    }

    /// Frees the command slot along with any buffered response.
    #[inline]
    pub fn dequeue(&mut self) -> Option<Cmd> {
        self.cback.clear();
        self.slot.take()
    }

    /// Returns the pending command.
    #[inline]
    pub fn cmd(&self) -> Option<&Cmd> {
        self.slot.as_ref()
    }

    /// Returns the pending command if its id matches `trans`.
    #[inline]
    pub fn cmd_mut(&mut self, trans: TransId) -> Option<&mut Cmd> {
        self.slot.as_mut().filter(|c| c.trans == trans)
    }

    /// Adds an outstanding callback for `app`.
    #[inline]
    pub fn add_cback(&mut self, app: AppId) {
        *self.cback.entry(app).or_default() += 1;
    }

    /// Records an answer from `app`. Returns [`None`] if no callback was
    /// outstanding for `app`, or whether all callbacks were answered.
    pub fn answer_cback(&mut self, app: AppId) -> Option<bool> {
        let n = self.cback.get_mut(&app).filter(|n| **n > 0)?;
        *n -= 1;
        if *n == 0 {
            self.cback.remove(&app);
        }
        Some(self.cback.is_empty())
    }

    /// Counts a successful prepared write for `app`.
    #[inline]
    pub fn add_prep(&mut self, app: AppId) {
        *self.prep_cnt.entry(app).or_default() += 1;
        self.prep.count_app();
    }

    /// Returns and resets applications with prepared writes.
    pub fn take_prep_apps(&mut self) -> Vec<AppId> {
        std::mem::take(&mut self.prep_cnt).into_keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(v: u16) -> Handle {
        Handle::new(v).unwrap()
    }

    #[test]
    fn slot() {
        let mut t = Tcb::new(ConnId(1));
        let id = t.enqueue(Opcode::ReadReq, Some(h(1))).unwrap();
        assert_eq!(id, TransId(1));
        assert_eq!(t.cmd().unwrap().status, Err(ErrorCode::AttributeNotFound));
        assert_eq!(t.enqueue(Opcode::WriteReq, Some(h(1))), None);
        for op in [
            Opcode::WriteCmd,
            Opcode::SignedWriteCmd,
            Opcode::ExchangeMtuReq,
            Opcode::HandleValueCfm,
        ] {
            assert!(t.enqueue(op, None).is_some());
        }
        assert_eq!(t.cmd().map(|c| c.trans), Some(id));
        assert!(t.cmd_mut(TransId(2)).is_none());
        assert_eq!(t.dequeue().map(|c| c.op), Some(Opcode::ReadReq));
        assert_eq!(t.enqueue(Opcode::WriteReq, None), Some(TransId(6)));
    }

    #[test]
    fn callbacks() {
        let mut t = Tcb::new(ConnId(1));
        let (a, b) = (AppId(1), AppId(2));
        t.add_cback(a);
        t.add_cback(b);
        assert_eq!(t.answer_cback(a), Some(false));
        assert_eq!(t.answer_cback(a), None);
        assert_eq!(t.answer_cback(b), Some(true));

        t.add_prep(b);
        t.add_prep(a);
        t.add_prep(b);
        assert!(!t.prep.is_local());
        assert_eq!(t.take_prep_apps(), [a, b]);
        assert!(t.take_prep_apps().is_empty());
    }

    #[test]
    fn prep_queue_first_error() {
        let mut q = PrepQueue::default();
        let e = |off| PrepEntry {
            hdl: h(3),
            off,
            val: vec![1],
        };
        q.push(e(0), None);
        q.push(e(9), Some(ErrorCode::InvalidOffset));
        q.push(e(1), Some(ErrorCode::InvalidAttributeValueLength));
        assert_eq!(q.len(), 3);
        assert_eq!(q.err(), Some(ErrorCode::InvalidOffset));
        assert!(q.is_local());
        let v: Vec<_> = q.drain().into_iter().map(|e| e.off).collect();
        assert_eq!(v, [0, 9, 1]);
        assert_eq!((q.len(), q.err()), (0, None));
    }

    #[test]
    fn read_multi() {
        let mut m = ReadMulti::new([h(1), h(2), h(3)]);
        assert_eq!(m.next(), Some(h(1)));
        m.push(h(1), Ok(vec![1; 10]));
        m.push(h(2), Ok(vec![2; 10]));
        assert_eq!(
            m.build(23),
            Opcode::ReadMultipleReq.hdl_err(ErrorCode::AttributeNotFound, h(3))
        );
        m.push(h(3), Ok(vec![3; 10]));
        let pdu = m.build(23).unwrap();
        assert_eq!(pdu.len(), 23);
        assert_eq!(&pdu[21..], &[3, 3]);

        let mut m = ReadMulti::new([h(1), h(2)]);
        m.push(h(2), Ok(vec![1]));
        m.push(h(1), Ok(vec![2]));
        assert_eq!(
            m.build(23),
            Opcode::ReadMultipleReq.hdl_err(ErrorCode::AttributeNotFound, h(1))
        );

        let mut m = ReadMulti::new([h(1), h(2)]);
        m.push(h(1), Ok(vec![1]));
        m.push(h(2), Err(ErrorCode::ReadNotPermitted));
        assert_eq!(
            m.build(23),
            Opcode::ReadMultipleReq.hdl_err(ErrorCode::ReadNotPermitted, h(2))
        );
    }
}
