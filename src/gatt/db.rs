use tracing::{debug, info, warn};

use crate::att::*;

use super::*;

/// Database lookup result used by the server path.
type AttResult<T> = std::result::Result<T, ErrorCode>;

/// Result of [`Db::read`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Read {
    /// Value served from the database.
    Value(Vec<u8>),
    /// Value is owned by the application, which must be asked for it.
    Pending,
}

/// Result of [`Db::write`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Write {
    /// Value was stored in the database.
    Done,
    /// Value is owned by the application, which must be given the write.
    App,
}

/// Result of [`Db::read_by_type`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ByType {
    /// Handle/value pairs of equal value length.
    Entries(Vec<(Handle, Vec<u8>)>),
    /// The first matching attribute is owned by the application.
    Pending(Handle),
}

/// Initial value storage of a new attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Storage<'a> {
    /// Reads and writes are forwarded to the owning application.
    App,
    /// Value is stored in the database and served without the application.
    Stack { max_len: u16, value: &'a [u8] },
}

/// Attribute value.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Value {
    Service(Uuid),
    Include {
        range: HandleRange,
        uuid: Uuid,
    },
    Char {
        props: CharProps,
        vhdl: Handle,
        uuid: Uuid,
    },
    Stack {
        max_len: u16,
        buf: Vec<u8>,
    },
    App,
}

impl Value {
    fn new(s: Storage) -> Result<Self> {
        match s {
            Storage::App => Ok(Self::App),
            Storage::Stack { max_len, value } => {
                let max = usize::from(max_len);
                if max == 0 || MAX_VAL_LEN < max || max < value.len() {
                    return Err(Error::InvalidParam);
                }
                Ok(Self::Stack {
                    max_len,
                    buf: value.to_vec(),
                })
            }
        }
    }
}

/// Database attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attr {
    hdl: Handle,
    typ: Uuid,
    perm: Perm,
    val: Value,
}

impl Attr {
    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the attribute type.
    #[inline(always)]
    #[must_use]
    pub const fn typ(&self) -> Uuid {
        self.typ
    }

    /// Returns the attribute permissions.
    #[inline(always)]
    #[must_use]
    pub const fn perm(&self) -> Perm {
        self.perm
    }

    /// Returns whether the value is owned by the application.
    #[inline]
    #[must_use]
    pub const fn is_app(&self) -> bool {
        matches!(self.val, Value::App)
    }

    /// Returns the maximum length of a database-owned value.
    #[inline]
    #[must_use]
    pub const fn max_len(&self) -> Option<u16> {
        match self.val {
            Value::Stack { max_len, .. } => Some(max_len),
            _ => None,
        }
    }

    /// Returns whether the attribute is a service, include, or characteristic
    /// declaration.
    #[inline]
    #[must_use]
    pub const fn is_decl(&self) -> bool {
        matches!(
            self.val,
            Value::Service(_) | Value::Include { .. } | Value::Char { .. }
        )
    }

    /// Returns whether the value can never be read with `ATT_READ_BLOB_REQ`.
    fn is_not_long(&self) -> bool {
        use Descriptor::*;
        self.is_decl()
            || matches!(
                Descriptor::of(self.typ),
                Some(
                    ExtendedProperties
                        | ClientConfiguration
                        | ServerConfiguration
                        | PresentationFormat
                )
            )
    }

    /// Returns the encoded value or [`None`] if the value is owned by the
    /// application.
    fn encode(&self) -> Option<Vec<u8>> {
        let mut v = Vec::with_capacity(20);
        match self.val {
            Value::Service(u) => v.extend_from_slice(&u.to_bytes()),
            Value::Include { range, uuid } => {
                v.extend_from_slice(&u16::from(range.start()).to_le_bytes());
                v.extend_from_slice(&u16::from(range.end()).to_le_bytes());
                if uuid.is_16() {
                    v.extend_from_slice(&uuid.to_bytes());
                }
            }
            Value::Char { props, vhdl, uuid } => {
                v.push(props.bits());
                v.extend_from_slice(&u16::from(vhdl).to_le_bytes());
                v.extend_from_slice(&uuid.to_bytes());
            }
            Value::Stack { ref buf, .. } => return Some(buf.clone()),
            Value::App => return None,
        }
        Some(v)
    }
}

/// Service registration record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Service {
    app: AppId,
    uuid: Uuid,
    primary: bool,
    range: HandleRange,
    attrs: Vec<Attr>,
    started: bool,
    seq: u32,
}

impl Service {
    /// Returns the owning application.
    #[inline(always)]
    #[must_use]
    pub const fn app(&self) -> AppId {
        self.app
    }

    /// Returns the service UUID.
    #[inline(always)]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns whether this is a primary service.
    #[inline(always)]
    #[must_use]
    pub const fn is_primary(&self) -> bool {
        self.primary
    }

    /// Returns the handle range reserved for the service.
    #[inline(always)]
    pub const fn range(&self) -> HandleRange {
        self.range
    }

    /// Returns the service declaration handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.range.start()
    }

    /// Returns whether the service is visible to peers.
    #[inline(always)]
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Returns service attributes in handle order.
    #[inline(always)]
    #[must_use]
    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    /// Returns the number of unused handles.
    fn free(&self) -> u16 {
        let last = self.attrs.last().map_or(self.range.start(), |at| at.hdl);
        u16::from(self.range.end()) - u16::from(last)
    }

    /// Appends a new attribute.
    fn push(&mut self, typ: Uuid, perm: Perm, val: Value) -> Result<Handle> {
        let hdl = (self.attrs.last())
            .and_then(|at| at.hdl.next())
            .filter(|&h| h <= self.range.end())
            .ok_or(Error::NoResources)?;
        self.attrs.push(Attr {
            hdl,
            typ,
            perm,
            val,
        });
        Ok(hdl)
    }

    fn attr(&self, hdl: Handle) -> Option<&Attr> {
        (self.attrs.binary_search_by_key(&hdl, |at| at.hdl).ok()).map(|i| &self.attrs[i])
    }

    fn attr_mut(&mut self, hdl: Handle) -> Option<&mut Attr> {
        (self.attrs.binary_search_by_key(&hdl, |at| at.hdl).ok()).map(|i| &mut self.attrs[i])
    }
}

/// GATT server attribute database shared by all links.
#[derive(Clone, Debug, Default)]
pub struct Db {
    /// Services sorted by handle.
    svcs: Vec<Service>,
    max_services: usize,
    seq: u32,
}

impl Db {
    /// Creates an empty database that holds at most `max_services` services.
    #[inline]
    #[must_use]
    pub const fn new(max_services: usize) -> Self {
        Self {
            svcs: Vec::new(),
            max_services,
            seq: 0,
        }
    }

    /// Creates a new service with `num` handles and returns the service
    /// declaration handle. Without an explicit `start`, the first gap in the
    /// handle space that fits the service is used.
    pub fn create_service(
        &mut self,
        app: AppId,
        uuid: Uuid,
        primary: bool,
        start: Option<Handle>,
        num: u16,
    ) -> Result<Handle> {
        if num == 0 {
            return Err(Error::InvalidParam);
        }
        if self.svcs.len() >= self.max_services {
            warn!("Service limit reached ({})", self.max_services);
            return Err(Error::NoResources);
        }
        let range = match start {
            Some(s) => {
                let r = HandleRange::new(s, s.add(num - 1).ok_or(Error::NoResources)?);
                if self.svcs.iter().any(|svc| svc.range.overlaps(r)) {
                    warn!("Service range {r:?} overlaps an existing service");
                    return Err(Error::NoResources);
                }
                r
            }
            None => self.alloc(num).ok_or(Error::NoResources)?,
        };
        let typ = if primary {
            Uuid::PRIMARY_SERVICE
        } else {
            Uuid::SECONDARY_SERVICE
        };
        self.seq = self.seq.wrapping_add(1);
        let i = self.svcs.partition_point(|s| s.range.start() < range.start());
        self.svcs.insert(
            i,
            Service {
                app,
                uuid,
                primary,
                range,
                attrs: vec![Attr {
                    hdl: range.start(),
                    typ,
                    perm: Perm::READ,
                    val: Value::Service(uuid),
                }],
                started: false,
                seq: self.seq,
            },
        );
        debug!("Created service {uuid} at {range:?} for {app}");
        Ok(range.start())
    }

    /// Adds an include declaration for service `incl` to service `svc` and
    /// returns the include handle. Includes must precede all characteristics.
    pub fn add_included_service(&mut self, svc: Handle, incl: Handle) -> Result<Handle> {
        let inc = self.service(incl).ok_or(Error::InvalidParam)?;
        let val = Value::Include {
            range: inc.range,
            uuid: inc.uuid,
        };
        let s = self.service_mut(svc)?;
        if (s.attrs.iter().skip(1)).any(|at| !matches!(at.val, Value::Include { .. })) {
            return Err(Error::InvalidParam);
        }
        s.push(Uuid::INCLUDE, Perm::READ, val)
    }

    /// Adds a characteristic declaration and value and returns the value
    /// handle.
    pub fn add_characteristic(
        &mut self,
        svc: Handle,
        uuid: Uuid,
        perm: Perm,
        props: CharProps,
        val: Storage,
    ) -> Result<Handle> {
        let val = Value::new(val)?;
        let s = self.service_mut(svc)?;
        if s.free() < 2 {
            return Err(Error::NoResources);
        }
        let decl = (s.attrs.last()).map_or(s.range.start(), |at| at.hdl);
        let vhdl = decl.add(2).ok_or(Error::NoResources)?;
        s.push(
            Uuid::CHARACTERISTIC,
            Perm::READ,
            Value::Char { props, vhdl, uuid },
        )?;
        s.push(uuid, perm, val)
    }

    /// Adds a characteristic descriptor and returns its handle.
    pub fn add_descriptor(
        &mut self,
        svc: Handle,
        uuid: Uuid,
        perm: Perm,
        val: Storage,
    ) -> Result<Handle> {
        let val = Value::new(val)?;
        self.service_mut(svc)?.push(uuid, perm, val)
    }

    /// Makes the service visible to peers.
    pub fn start_service(&mut self, svc: Handle) -> Result<HandleRange> {
        let s = self.service_mut(svc)?;
        s.started = true;
        debug!("Started service {} at {:?}", s.uuid, s.range);
        Ok(s.range)
    }

    /// Hides the service from peers.
    pub fn stop_service(&mut self, svc: Handle) -> Result<HandleRange> {
        let s = self.service_mut(svc)?;
        s.started = false;
        debug!("Stopped service {} at {:?}", s.uuid, s.range);
        Ok(s.range)
    }

    /// Removes the service and all of its attributes.
    pub fn delete_service(&mut self, svc: Handle) -> Result<Service> {
        let i = self.index(svc).ok_or(Error::InvalidParam)?;
        let s = self.svcs.remove(i);
        debug!("Deleted service {} at {:?}", s.uuid, s.range);
        Ok(s)
    }

    /// Removes all services owned by `app`.
    pub fn delete_app_services(&mut self, app: AppId) -> Vec<Service> {
        let (del, keep) = std::mem::take(&mut self.svcs)
            .into_iter()
            .partition(|s| s.app == app);
        self.svcs = keep;
        del
    }

    /// Returns a registered service by its declaration handle, whether it is
    /// started or not.
    #[must_use]
    pub fn service(&self, svc: Handle) -> Option<&Service> {
        self.index(svc).map(|i| &self.svcs[i])
    }

    /// Returns the started service containing `hdl`.
    #[must_use]
    pub fn find_service(&self, hdl: Handle) -> Option<&Service> {
        let i = self.svcs.partition_point(|s| s.range.start() <= hdl);
        let s = self.svcs.get(i.checked_sub(1)?)?;
        (s.started && s.range.contains(&hdl)).then_some(s)
    }

    /// Returns the attribute at `hdl` within a started service.
    #[inline]
    #[must_use]
    pub fn attr(&self, hdl: Handle) -> Option<&Attr> {
        self.find_service(hdl)?.attr(hdl)
    }

    /// Returns an iterator over started services in handle order.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.svcs.iter().filter(|s| s.started)
    }

    /// Returns an iterator over attributes of started services within `range`
    /// in handle order.
    pub fn attrs(&self, range: HandleRange) -> impl Iterator<Item = &Attr> {
        (self.services().filter(move |s| s.range.overlaps(range)))
            .flat_map(|s| s.attrs.iter())
            .filter(move |at| range.contains(&at.hdl))
    }

    /// Reads an attribute value after checking permissions. At most `budget`
    /// bytes starting at `off` are returned. Values owned by the application
    /// return [`Read::Pending`].
    pub fn read(
        &self,
        hdl: Handle,
        off: u16,
        is_long: bool,
        budget: usize,
        sec: LinkSec,
    ) -> AttResult<Read> {
        let at = self.attr(hdl).ok_or(ErrorCode::InvalidHandle)?;
        at.perm.check_read(sec)?;
        if is_long && at.is_not_long() {
            return Err(ErrorCode::AttributeNotLong);
        }
        let Some(v) = at.encode() else {
            return Ok(Read::Pending);
        };
        let off = usize::from(off);
        if off > v.len() {
            return Err(ErrorCode::InvalidOffset);
        }
        let end = v.len().min(off.saturating_add(budget));
        Ok(Read::Value(v[off..end].to_vec()))
    }

    /// Reads all attributes of type `typ` within `range` for an
    /// `ATT_READ_BY_TYPE_RSP` with `budget` bytes available for the
    /// handle/value pairs ([Vol 3] Part F, Section 3.4.4.1). The first entry
    /// determines the value length. The walk stops at the first entry with a
    /// different length, at the first application-owned value, or at the first
    /// permission error.
    pub fn read_by_type(
        &self,
        range: HandleRange,
        typ: Uuid,
        budget: usize,
        sec: LinkSec,
    ) -> RspResult<ByType> {
        let op = Opcode::ReadByTypeReq;
        let mut entries: Vec<(Handle, Vec<u8>)> = Vec::new();
        let mut used = 0;
        for at in self.attrs(range).filter(|at| at.typ == typ) {
            if let Err(e) = at.perm.check_read(sec) {
                if entries.is_empty() {
                    return op.hdl_err(e, at.hdl);
                }
                break;
            }
            let Some(mut v) = at.encode() else {
                if entries.is_empty() {
                    return Ok(ByType::Pending(at.hdl));
                }
                break;
            };
            match entries.first() {
                None => v.truncate(budget.saturating_sub(2).min(usize::from(u8::MAX) - 2)),
                Some((_, first)) if first.len() != v.len() => break,
                Some(_) => {}
            }
            if budget < used + 2 + v.len() {
                break;
            }
            used += 2 + v.len();
            entries.push((at.hdl, v));
        }
        if entries.is_empty() {
            return op.hdl_err(ErrorCode::AttributeNotFound, range.start());
        }
        Ok(ByType::Entries(entries))
    }

    /// Checks write permissions and value format rules for a write of `len`
    /// bytes at `off`.
    pub fn check_write(
        &self,
        hdl: Handle,
        op: Opcode,
        off: u16,
        len: usize,
        sec: LinkSec,
    ) -> AttResult<&Attr> {
        use ErrorCode::*;
        let at = self.attr(hdl).ok_or(InvalidHandle)?;
        at.perm.check_write(op, sec)?;
        if at.is_decl() {
            return Err(WriteNotPermitted);
        }
        if let Some(d) = Descriptor::of(at.typ) {
            if d.is_read_only() {
                return Err(WriteNotPermitted);
            }
            if d.is_config() {
                if op == Opcode::PrepareWriteReq {
                    return Err(RequestNotSupported);
                }
                if off != 0 || len != 2 {
                    return Err(InvalidAttributeValueLength);
                }
            }
        }
        Ok(at)
    }

    /// Writes an attribute value after checking permissions. The new value
    /// length is `off + val.len()`.
    pub fn write(
        &mut self,
        hdl: Handle,
        off: u16,
        val: &[u8],
        op: Opcode,
        sec: LinkSec,
    ) -> AttResult<Write> {
        self.check_write(hdl, op, off, val.len(), sec)?;
        self.store(hdl, off, val, false)
    }

    /// Stores a validated prepared write. The first entry for an attribute
    /// replaces the old value.
    pub(super) fn apply_prepared(
        &mut self,
        hdl: Handle,
        off: u16,
        val: &[u8],
        first: bool,
    ) -> AttResult<Write> {
        self.store(hdl, off, val, first)
    }

    /// Sets the value of a database-owned attribute.
    pub fn set_attribute_value(&mut self, hdl: Handle, val: &[u8]) -> Result<()> {
        let at = self.any_attr_mut(hdl).ok_or(Error::InvalidParam)?;
        match at.val {
            Value::Stack {
                max_len,
                ref mut buf,
            } if val.len() <= usize::from(max_len) => {
                buf.clear();
                buf.extend_from_slice(val);
                Ok(())
            }
            _ => Err(Error::InvalidParam),
        }
    }

    /// Returns the value of a database-owned attribute.
    pub fn attribute_value(&self, hdl: Handle) -> Result<&[u8]> {
        let s = self.svcs.iter().find(|s| s.range.contains(&hdl));
        match s.and_then(|s| s.attr(hdl)).map(|at| &at.val) {
            Some(Value::Stack { buf, .. }) => Ok(buf),
            _ => Err(Error::InvalidParam),
        }
    }

    /// Logs database contents in service declaration order.
    pub fn dump(&self) {
        let mut svcs: Vec<&Service> = self.svcs.iter().collect();
        svcs.sort_unstable_by_key(|s| s.seq);
        info!("GATT database:");
        for s in svcs {
            let kind = if s.primary { "" } else { "(Secondary) " };
            let state = if s.started { "" } else { " [stopped]" };
            info!(
                "[{:#06X}] {kind}Service <{}> ({}){state}",
                u16::from(s.range.start()),
                s.uuid,
                s.app
            );
            for at in &s.attrs[1..] {
                match at.val {
                    Value::Include { range, uuid } => {
                        info!("[{:#06X}] Include <{uuid}> {range:?}", u16::from(at.hdl));
                    }
                    Value::Char { props, vhdl, uuid } => {
                        info!(
                            "[{:#06X}] Characteristic <{uuid}> {props:?} value {vhdl}",
                            u16::from(at.hdl)
                        );
                    }
                    Value::Stack { ref buf, .. } => {
                        info!("[{:#06X}] <{}> {:02X?}", u16::from(at.hdl), at.typ, buf);
                    }
                    _ => info!("[{:#06X}] <{}> (app)", u16::from(at.hdl), at.typ),
                }
            }
        }
    }

    /// Copies `val` into a database-owned value at `off`.
    fn store(&mut self, hdl: Handle, off: u16, val: &[u8], reset: bool) -> AttResult<Write> {
        let s = self.svcs.iter_mut().find(|s| s.started && s.range.contains(&hdl));
        let at = s.and_then(|s| s.attr_mut(hdl)).ok_or(ErrorCode::InvalidHandle)?;
        let Value::Stack {
            max_len,
            ref mut buf,
        } = at.val
        else {
            return Ok(Write::App);
        };
        let (off, end) = (usize::from(off), usize::from(off) + val.len());
        if usize::from(max_len) < end {
            return Err(ErrorCode::InvalidAttributeValueLength);
        }
        if reset {
            buf.clear();
        }
        buf.resize(off, 0);
        buf.extend_from_slice(val);
        Ok(Write::Done)
    }

    /// Returns the first gap in the handle space that can hold `num` handles.
    fn alloc(&self, num: u16) -> Option<HandleRange> {
        let mut next = Handle::MIN;
        for s in &self.svcs {
            if u16::from(s.range.start()) - u16::from(next) >= num {
                break;
            }
            next = s.range.end().next()?;
        }
        Some(HandleRange::new(next, next.add(num - 1)?))
    }

    fn index(&self, svc: Handle) -> Option<usize> {
        self.svcs.binary_search_by_key(&svc, |s| s.range.start()).ok()
    }

    fn service_mut(&mut self, svc: Handle) -> Result<&mut Service> {
        let i = self.index(svc).ok_or(Error::InvalidParam)?;
        Ok(&mut self.svcs[i])
    }

    fn any_attr_mut(&mut self, hdl: Handle) -> Option<&mut Attr> {
        (self.svcs.iter_mut().find(|s| s.range.contains(&hdl)))?.attr_mut(hdl)
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;

    const APP: AppId = AppId(1);

    fn u(v: u16) -> Uuid {
        Uuid::Uuid16(v)
    }

    fn h(v: u16) -> Handle {
        Handle::new(v).unwrap()
    }

    fn stack(max_len: u16, value: &[u8]) -> Storage {
        Storage::Stack { max_len, value }
    }

    /// Creates a started service with one readable/writable characteristic and
    /// returns the database and the value handle.
    fn one_char(max_len: u16) -> (Db, Handle) {
        let mut db = Db::new(8);
        let s = db.create_service(APP, Uuid::Uuid16(0x180F), true, None, 4).unwrap();
        let v = (db.add_characteristic(
            s,
            Uuid::Uuid16(0x2A19),
            Perm::READ | Perm::WRITE,
            CharProps::READ | CharProps::WRITE,
            stack(max_len, &[1, 2, 3]),
        ))
        .unwrap();
        db.start_service(s).unwrap();
        (db, v)
    }

    #[test]
    fn alloc() {
        let mut db = Db::new(3);
        assert_eq!(db.create_service(APP, u(1), true, None, 0), Err(Error::InvalidParam));
        assert_eq!(db.create_service(APP, u(1), true, None, 5), Ok(h(1)));
        assert_eq!(db.create_service(APP, u(2), true, Some(h(11)), 5), Ok(h(11)));
        assert_eq!(
            db.create_service(APP, u(3), true, Some(h(15)), 2),
            Err(Error::NoResources)
        );
        // First gap that fits
        assert_eq!(db.create_service(APP, u(3), false, None, 5), Ok(h(6)));
        assert_eq!(db.create_service(APP, u(4), true, None, 1), Err(Error::NoResources));
        let starts: Vec<_> = db.svcs.iter().map(|s| u16::from(s.handle())).collect();
        assert_eq!(starts, [1, 6, 11]);

        let mut db = Db::new(8);
        assert_eq!(
            db.create_service(APP, u(1), true, Some(h(0xFFF0)), 0x20),
            Err(Error::NoResources)
        );
    }

    #[test]
    fn add_attrs() {
        let mut db = Db::new(8);
        let inc = db.create_service(APP, u(0x1800), false, None, 1).unwrap();
        let s = db.create_service(APP, u(0x180F), true, None, 5).unwrap();
        assert_eq!(db.add_included_service(s, inc), Ok(h(3)));
        let v = db.add_characteristic(s, u(0x2A19), Perm::READ, CharProps::READ, Storage::App);
        assert_eq!(v, Ok(h(5)));
        assert_eq!(db.add_included_service(s, inc), Err(Error::InvalidParam));
        let bad = db.add_descriptor(s, u(0x2901), Perm::READ, stack(2, &[1, 2, 3]));
        assert_eq!(bad, Err(Error::InvalidParam));
        assert_eq!(
            db.add_descriptor(s, u(0x2901), Perm::READ, stack(0, &[])),
            Err(Error::InvalidParam)
        );
        assert_eq!(
            db.add_descriptor(s, u(0x2902), Perm::READ, stack(2, &[0, 0])),
            Ok(h(6))
        );
        assert_eq!(
            db.add_descriptor(s, u(0x2901), Perm::READ, Storage::App),
            Err(Error::NoResources)
        );
        // Not enough room for declaration and value
        let s2 = db.create_service(APP, u(0x1810), true, None, 2).unwrap();
        assert_eq!(
            db.add_characteristic(s2, u(1), Perm::READ, CharProps::READ, Storage::App),
            Err(Error::NoResources)
        );
        assert_eq!(db.service(s2).unwrap().attrs().len(), 1);
    }

    #[test]
    fn visibility() {
        let mut db = Db::new(8);
        let s = db.create_service(APP, u(0x180F), true, None, 3).unwrap();
        assert!(db.find_service(s).is_none());
        assert_eq!(db.read(s, 0, false, 22, LinkSec::default()), Err(ErrorCode::InvalidHandle));
        db.start_service(s).unwrap();
        assert_eq!(db.find_service(h(3)).map(Service::handle), Some(s));
        assert!(db.find_service(h(4)).is_none());
        db.stop_service(s).unwrap();
        assert_eq!(db.services().count(), 0);
        db.create_service(AppId(2), u(1), true, None, 1).unwrap();
        assert_eq!(db.delete_app_services(APP).len(), 1);
        assert_eq!(db.delete_service(s), Err(Error::InvalidParam));
        assert_eq!(db.svcs.len(), 1);
    }

    #[test]
    fn read_decls() {
        let mut db = Db::new(8);
        let inc = db.create_service(APP, u(0x1800), false, None, 1).unwrap();
        let s = db.create_service(APP, u(0x180F), true, None, 4).unwrap();
        db.add_included_service(s, inc).unwrap();
        let v = (db.add_characteristic(s, u(0x2A19), Perm::READ, CharProps::READ, Storage::App))
            .unwrap();
        db.start_service(s).unwrap();
        db.dump();
        let sec = LinkSec::default();
        assert_eq!(db.read(s, 0, false, 22, sec), Ok(Read::Value(vec![0x0F, 0x18])));
        assert_eq!(
            db.read(h(3), 0, false, 22, sec),
            Ok(Read::Value(vec![1, 0, 1, 0, 0x00, 0x18]))
        );
        assert_eq!(
            db.read(h(4), 0, false, 22, sec),
            Ok(Read::Value(vec![0x02, 5, 0, 0x19, 0x2A]))
        );
        assert_eq!(db.read(h(4), 0, true, 22, sec), Err(ErrorCode::AttributeNotLong));
        assert_eq!(db.read(v, 0, false, 22, sec), Ok(Read::Pending));
    }

    #[test]
    fn read_write_round_trip() {
        let (mut db, v) = one_char(8);
        let sec = LinkSec::default();
        assert_eq!(db.read(v, 3, true, 22, sec), Ok(Read::Value(vec![])));
        assert_eq!(db.read(v, 4, true, 22, sec), Err(ErrorCode::InvalidOffset));
        assert_eq!(db.read(v, 1, true, 1, sec), Ok(Read::Value(vec![2])));

        for val in [&[][..], &[9], &[1, 2, 3, 4, 5, 6, 7, 8]] {
            assert_eq!(db.write(v, 0, val, Opcode::WriteReq, sec), Ok(Write::Done));
            assert_eq!(db.read(v, 0, false, 22, sec), Ok(Read::Value(val.to_vec())));
        }
        assert_eq!(
            db.write(v, 0, &[0; 9], Opcode::WriteReq, sec),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
        assert_eq!(
            db.write(h(2), 0, &[0], Opcode::WriteReq, sec),
            Err(ErrorCode::WriteNotPermitted)
        );
        assert_eq!(db.attribute_value(v), Ok(&[1, 2, 3, 4, 5, 6, 7, 8][..]));
        db.set_attribute_value(v, &[5]).unwrap();
        assert_eq!(db.attribute_value(v), Ok(&[5][..]));
        assert_eq!(db.set_attribute_value(h(2), &[5]), Err(Error::InvalidParam));
    }

    #[test]
    fn apply_prepared() {
        let (mut db, v) = one_char(8);
        assert_eq!(db.apply_prepared(v, 0, &[7, 7], true), Ok(Write::Done));
        assert_eq!(db.apply_prepared(v, 2, &[8, 8], false), Ok(Write::Done));
        assert_eq!(db.attribute_value(v), Ok(&[7, 7, 8, 8][..]));
        assert_eq!(db.apply_prepared(v, 0, &[1], true), Ok(Write::Done));
        assert_eq!(db.attribute_value(v), Ok(&[1][..]));
    }

    #[test]
    fn descriptor_rules() {
        let mut db = Db::new(8);
        let s = db.create_service(APP, u(0x180F), true, None, 5).unwrap();
        let rw = Perm::READ | Perm::WRITE;
        db.add_characteristic(s, u(1), rw, CharProps::READ, Storage::App).unwrap();
        let ccc = db.add_descriptor(s, u(0x2902), rw, stack(2, &[0, 0])).unwrap();
        let fmt = db.add_descriptor(s, u(0x2904), rw, stack(7, &[0; 7])).unwrap();
        db.start_service(s).unwrap();
        let sec = LinkSec::default();
        assert_eq!(
            db.write(ccc, 0, &[1], Opcode::WriteReq, sec),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
        assert_eq!(
            db.check_write(ccc, Opcode::PrepareWriteReq, 0, 2, sec).err(),
            Some(ErrorCode::RequestNotSupported)
        );
        assert_eq!(db.write(ccc, 0, &[1, 0], Opcode::WriteReq, sec), Ok(Write::Done));
        assert_eq!(
            db.write(fmt, 0, &[0; 7], Opcode::WriteReq, sec),
            Err(ErrorCode::WriteNotPermitted)
        );
        assert_eq!(db.read(ccc, 0, true, 22, sec), Err(ErrorCode::AttributeNotLong));
    }

    #[test]
    fn read_by_type() {
        let mut db = Db::new(8);
        let s = db.create_service(APP, u(0x180F), true, None, 10).unwrap();
        let typ = Uuid::Uuid16(0x2A19);
        let add = |db: &mut Db, perm, val| {
            db.add_characteristic(s, typ, perm, CharProps::READ, val).unwrap()
        };
        let a = add(&mut db, Perm::READ, stack(4, &[1, 1]));
        let b = add(&mut db, Perm::READ, stack(4, &[2, 2]));
        let c = add(&mut db, Perm::READ, stack(4, &[3, 3, 3]));
        let d = add(&mut db, Perm::READ, stack(4, &[4, 4]));
        db.start_service(s).unwrap();
        let sec = LinkSec::default();

        // Length mismatch ends the walk
        assert_eq!(
            db.read_by_type(HandleRange::ALL, typ, 21, sec),
            Ok(ByType::Entries(vec![(a, vec![1, 1]), (b, vec![2, 2])]))
        );
        let r = HandleRange::new(c, d);
        assert_eq!(
            db.read_by_type(r, typ, 21, sec),
            Ok(ByType::Entries(vec![(c, vec![3, 3, 3])]))
        );
        // Budget limit
        assert_eq!(
            db.read_by_type(HandleRange::ALL, typ, 7, sec),
            Ok(ByType::Entries(vec![(a, vec![1, 1])]))
        );
        // Declarations
        assert_matches!(
            db.read_by_type(HandleRange::ALL, Uuid::CHARACTERISTIC, 21, sec),
            Ok(ByType::Entries(v)) if v.len() == 3
        );
        assert_eq!(
            db.read_by_type(HandleRange::new(h(10), h(10)), typ, 21, sec),
            Opcode::ReadByTypeReq.hdl_err(ErrorCode::AttributeNotFound, h(10))
        );
    }

    #[test]
    fn read_by_type_pending() {
        let mut db = Db::new(8);
        let s = db.create_service(APP, u(0x180F), true, None, 10).unwrap();
        let typ = Uuid::Uuid16(0x2A19);
        let a = (db.add_characteristic(s, typ, Perm::READ, CharProps::READ, Storage::App))
            .unwrap();
        let b = (db.add_characteristic(s, typ, Perm::READ, CharProps::READ, stack(2, &[1, 2])))
            .unwrap();
        let c = (db.add_characteristic(s, typ, Perm::READ, CharProps::READ, Storage::App))
            .unwrap();
        let d = (db.add_characteristic(s, typ, Perm::READ_ENCRYPTED, CharProps::READ, Storage::App))
            .unwrap();
        db.start_service(s).unwrap();
        let sec = LinkSec::default();
        assert_eq!(db.read_by_type(HandleRange::ALL, typ, 21, sec), Ok(ByType::Pending(a)));
        assert_eq!(
            db.read_by_type(HandleRange::new(b, Handle::MAX), typ, 21, sec),
            Ok(ByType::Entries(vec![(b, vec![1, 2])]))
        );
        assert_eq!(
            db.read_by_type(HandleRange::new(c, Handle::MAX), typ, 21, sec),
            Ok(ByType::Pending(c))
        );
        assert_eq!(
            db.read_by_type(HandleRange::new(d, Handle::MAX), typ, 21, sec),
            Opcode::ReadByTypeReq.hdl_err(ErrorCode::InsufficientAuthentication, d)
        );
    }
}
