use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::att::*;

use super::*;

/// Generic Attribute service with the Service Changed characteristic
/// ([Vol 3] Part G, Section 7). Client configuration is kept per link.
#[derive(Debug)]
pub(super) struct GattService {
    sc: Handle,
    ccc: Handle,
    cfg: Mutex<BTreeMap<ConnId, Cccd>>,
}

impl GattService {
    /// Adds and starts the service.
    pub fn register(db: &mut Db, app: AppId) -> Result<Self> {
        let s = db.create_service(app, GATT_SERVICE, true, None, 4)?;
        let sc = db.add_characteristic(
            s,
            SERVICE_CHANGED,
            Perm::empty(),
            CharProps::INDICATE,
            Storage::Stack {
                max_len: 4,
                value: &[],
            },
        )?;
        let ccc = db.add_descriptor(
            s,
            Descriptor::ClientConfiguration.uuid(),
            Perm::READ | Perm::WRITE,
            Storage::App,
        )?;
        db.start_service(s)?;
        Ok(Self {
            sc,
            ccc,
            cfg: Mutex::new(BTreeMap::new()),
        })
    }

    /// Returns the Service Changed value handle.
    #[inline(always)]
    pub const fn sc_handle(&self) -> Handle {
        self.sc
    }

    /// Returns whether the peer enabled Service Changed indications.
    pub fn is_enabled(&self, conn: ConnId) -> bool {
        (self.cfg.lock().get(&conn)).map_or(false, |c| c.contains(Cccd::INDICATE))
    }

    /// Forgets the configuration of a disconnected link.
    pub fn drop_link(&self, conn: ConnId) {
        self.cfg.lock().remove(&conn);
    }

    /// Encodes the Service Changed value for `range`.
    pub fn value(range: HandleRange) -> [u8; 4] {
        let ([s0, s1], [e0, e1]) = (
            u16::from(range.start()).to_le_bytes(),
            u16::from(range.end()).to_le_bytes(),
        );
        [s0, s1, e0, e1]
    }
}

impl App for GattService {
    fn server_request(&self, conn: ConnId, _: TransId, req: ServerReq) -> Reply {
        match req {
            ServerReq::Read { hdl, .. } if hdl == self.ccc => {
                let v = self.cfg.lock().get(&conn).copied().unwrap_or_default();
                Reply::Now(Ok(v.bits().to_le_bytes().to_vec()))
            }
            ServerReq::Write { hdl, val, .. } if hdl == self.ccc => {
                let &[lo, hi] = val else {
                    return Reply::Now(Err(ErrorCode::InvalidAttributeValueLength));
                };
                let v = Cccd::from_bits_truncate(u16::from_le_bytes([lo, hi]));
                debug!("Service Changed configuration for {conn}: {v:?}");
                self.cfg.lock().insert(conn, v);
                Reply::Now(Ok(Vec::new()))
            }
            ServerReq::Mtu(_) | ServerReq::Confirm(_) => Reply::Later,
            _ => Reply::Now(Ok(Vec::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ccc_per_link() {
        let mut db = Db::new(4);
        let svc = GattService::register(&mut db, AppId(0)).unwrap();
        assert_eq!(u16::from(svc.sc_handle()), 3);
        let (a, b) = (ConnId(1), ConnId(2));
        let read = ServerReq::Read {
            hdl: svc.ccc,
            off: 0,
            is_long: false,
            needs_response: true,
        };
        assert_eq!(svc.server_request(a, TransId(1), read), Reply::Now(Ok(vec![0, 0])));
        let write = ServerReq::Write {
            hdl: svc.ccc,
            off: 0,
            val: &[2, 0],
            is_prepare: false,
            needs_response: true,
        };
        assert_eq!(svc.server_request(a, TransId(2), write), Reply::Now(Ok(vec![])));
        assert!(svc.is_enabled(a));
        assert!(!svc.is_enabled(b));
        assert_eq!(svc.server_request(a, TransId(3), read), Reply::Now(Ok(vec![2, 0])));
        svc.drop_link(a);
        assert!(!svc.is_enabled(a));
        let r = HandleRange::from_raw(0x0010, 0x0102).unwrap();
        assert_eq!(GattService::value(r), [0x10, 0, 0x02, 0x01]);
    }
}
