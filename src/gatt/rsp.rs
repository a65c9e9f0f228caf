//! MTU-bounded response PDU builders shared by the server dispatcher.

use crate::att::*;

use super::*;

/// Writer for responses that carry a list of equal-sized entries after a
/// length or format byte. The first entry sets the byte and later entries that
/// don't match it end the list.
struct EntryWriter {
    w: PduWriter,
    fmt: Option<u8>,
}

impl EntryWriter {
    fn new(op: Opcode, mtu: u16) -> Self {
        let mut w = PduWriter::new(op, mtu);
        // Length or format placeholder. An MTU always has room for it.
        let r = w.u8(0);
        debug_assert!(r.is_ok());
        Self { w, fmt: None }
    }

    /// Appends an entry of `len` bytes with format `fmt`. Returns `false` if
    /// the entry does not match the established format or does not fit.
    fn push(
        &mut self,
        fmt: u8,
        len: usize,
        f: impl FnOnce(&mut PduWriter) -> std::result::Result<(), NoResources>,
    ) -> bool {
        if *self.fmt.get_or_insert(fmt) != fmt || self.w.remaining() < len {
            return false;
        }
        f(&mut self.w).is_ok()
    }

    /// Returns the PDU or [`None`] if no entries were written.
    fn finish(mut self) -> Option<Vec<u8>> {
        if self.w.len() <= 2 {
            return None;
        }
        self.w.set_u8(1, self.fmt?).ok()?;
        Some(self.w.into_vec())
    }
}

/// Returns the end handle reported for service `s`. The last service in the
/// database owns the rest of the handle space when it is primary.
fn group_end(db: &Db, s: &Service) -> Handle {
    let last = db.services().last().map(Service::handle);
    if s.is_primary() && last == Some(s.handle()) {
        Handle::MAX
    } else {
        s.range().end()
    }
}

/// Builds `ATT_READ_BY_GROUP_TYPE_RSP` ([Vol 3] Part F, Section 3.4.4.10).
pub(super) fn read_by_group_type(
    db: &Db,
    range: HandleRange,
    typ: Uuid,
    mtu: u16,
) -> RspResult<Vec<u8>> {
    let op = Opcode::ReadByGroupTypeReq;
    let primary = if typ == Uuid::PRIMARY_SERVICE {
        true
    } else if typ == Uuid::SECONDARY_SERVICE {
        false
    } else {
        return op.hdl_err(ErrorCode::UnsupportedGroupType, range.start());
    };
    let mut e = EntryWriter::new(Opcode::ReadByGroupTypeRsp, mtu);
    for s in (db.services()).filter(|s| s.is_primary() == primary && range.contains(&s.handle()))
    {
        let len = 4 + s.uuid().wire_len();
        #[allow(clippy::cast_possible_truncation)]
        let ok = e.push(len as u8, len, |w| {
            w.handle(s.handle())?.handle(group_end(db, s))?.uuid(s.uuid())?;
            Ok(())
        });
        if !ok {
            break;
        }
    }
    e.finish()
        .map_or_else(|| op.hdl_err(ErrorCode::AttributeNotFound, range.start()), Ok)
}

/// Builds `ATT_FIND_BY_TYPE_VALUE_RSP` for primary service discovery by UUID
/// ([Vol 3] Part F, Section 3.4.3.4).
pub(super) fn find_by_type_value(
    db: &Db,
    range: HandleRange,
    typ: Uuid,
    val: &[u8],
    mtu: u16,
) -> RspResult<Vec<u8>> {
    let op = Opcode::FindByTypeValueReq;
    let uuid = (typ == Uuid::PRIMARY_SERVICE)
        .then(|| Uuid::from_le_bytes(val))
        .flatten();
    let mut w = PduWriter::new(Opcode::FindByTypeValueRsp, mtu);
    if let Some(uuid) = uuid {
        for s in (db.services())
            .filter(|s| s.is_primary() && s.uuid() == uuid && range.contains(&s.handle()))
        {
            if w.remaining() < 4 {
                break;
            }
            let r = w.handle(s.handle()).and_then(|w| w.handle(group_end(db, s)));
            debug_assert!(r.is_ok(), "entry exceeded checked budget");
        }
    }
    if w.is_empty() {
        return op.hdl_err(ErrorCode::AttributeNotFound, range.start());
    }
    Ok(w.into_vec())
}

/// Builds `ATT_FIND_INFORMATION_RSP` ([Vol 3] Part F, Section 3.4.3.2).
pub(super) fn find_information(db: &Db, range: HandleRange, mtu: u16) -> RspResult<Vec<u8>> {
    let mut e = EntryWriter::new(Opcode::FindInformationRsp, mtu);
    for at in db.attrs(range) {
        let typ = at.typ();
        let fmt = if typ.is_16() { 1 } else { 2 };
        let ok = e.push(fmt, 2 + typ.wire_len(), |w| {
            w.handle(at.handle())?.uuid(typ)?;
            Ok(())
        });
        if !ok {
            break;
        }
    }
    (e.finish()).map_or_else(
        || Opcode::FindInformationReq.hdl_err(ErrorCode::AttributeNotFound, range.start()),
        Ok,
    )
}

/// Builds `ATT_READ_BY_TYPE_RSP` from database entries
/// ([Vol 3] Part F, Section 3.4.4.2).
pub(super) fn read_by_type(entries: &[(Handle, Vec<u8>)], mtu: u16) -> Option<Vec<u8>> {
    let mut e = EntryWriter::new(Opcode::ReadByTypeRsp, mtu);
    for (hdl, v) in entries {
        let len = 2 + v.len();
        #[allow(clippy::cast_possible_truncation)]
        let ok = e.push(len as u8, len, |w| {
            w.handle(*hdl)?.put(v)?;
            Ok(())
        });
        if !ok {
            break;
        }
    }
    e.finish()
}

/// Builds `ATT_READ_MULTIPLE_RSP`. The value that would overflow the MTU is
/// truncated and ends the response ([Vol 3] Part F, Section 3.4.4.8).
pub(super) fn read_multiple<'a>(vals: impl IntoIterator<Item = &'a [u8]>, mtu: u16) -> Vec<u8> {
    let mut w = PduWriter::new(Opcode::ReadMultipleRsp, mtu);
    for v in vals {
        if w.put_trunc(v) < v.len() {
            break;
        }
    }
    w.into_vec()
}

/// Builds a response carrying a single value, such as `ATT_READ_RSP`,
/// truncated to the MTU.
pub(super) fn value(op: Opcode, v: &[u8], mtu: u16) -> Vec<u8> {
    let mut w = PduWriter::new(op, mtu);
    w.put_trunc(v);
    w.into_vec()
}

/// Builds a PDU with a handle and a value truncated to the MTU, such as
/// `ATT_HANDLE_VALUE_NTF`.
pub(super) fn handle_value(op: Opcode, hdl: Handle, v: &[u8], mtu: u16) -> Vec<u8> {
    let mut w = PduWriter::new(op, mtu);
    if w.handle(hdl).is_ok() {
        w.put_trunc(v);
    }
    w.into_vec()
}

/// Builds `ATT_PREPARE_WRITE_RSP` echoing the request
/// ([Vol 3] Part F, Section 3.4.6.2).
pub(super) fn prepare_write(hdl: Handle, off: u16, v: &[u8], mtu: u16) -> Vec<u8> {
    let mut w = PduWriter::new(Opcode::PrepareWriteRsp, mtu);
    if w.handle(hdl).and_then(|w| w.u16(off)).is_ok() {
        w.put_trunc(v);
    }
    w.into_vec()
}
