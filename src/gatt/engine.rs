use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::att::*;

use super::builtin::GattService;
use super::client::{Clcb, ClcbId};
use super::tcb::Tcb;
use super::*;

/// Input processed after the current entry point finishes its own work.
#[derive(Debug)]
pub(super) enum Msg {
    /// Application answer to a server request.
    AppRsp {
        conn: ConnId,
        app: AppId,
        trans: TransId,
        result: std::result::Result<Vec<u8>, ErrorCode>,
    },
    /// Link encryption upgrade completed.
    EncComplete { conn: ConnId, ok: bool },
    /// Timer expired.
    Timeout(TimerId),
}

/// Built-in GATT service registration.
#[derive(Debug)]
pub(super) struct Builtin {
    pub app: AppId,
    pub svc: Arc<GattService>,
}

/// GATT server and client engine.
///
/// The engine is driven by the host: inbound PDUs, security and timer events,
/// and application answers are delivered through its methods. Each call
/// processes the input and all work it triggers before returning. Application
/// callbacks are never invoked reentrantly; an immediate [`Reply::Now`] is
/// handled after the callback returns.
#[derive(Debug)]
pub struct Gatt<H: Host> {
    pub(super) cfg: Config,
    pub(super) host: H,
    pub(super) db: Arc<Mutex<Db>>,
    pub(super) apps: BTreeMap<AppId, Arc<dyn App>>,
    pub(super) builtin: Option<Builtin>,
    pub(super) links: BTreeMap<ConnId, Tcb>,
    pub(super) clcbs: BTreeMap<ClcbId, Clcb>,
    pub(super) last_clcb: ClcbId,
    pub(super) inbox: VecDeque<Msg>,
}

impl<H: Host> Gatt<H> {
    /// Creates a new engine with an empty database. The GATT service is added
    /// if enabled in the configuration.
    pub fn new(host: H, cfg: Config) -> Self {
        let db = Arc::new(Mutex::new(Db::new(cfg.max_services)));
        let mut g = Self {
            cfg,
            host,
            db,
            apps: BTreeMap::new(),
            builtin: None,
            links: BTreeMap::new(),
            clcbs: BTreeMap::new(),
            last_clcb: ClcbId::default(),
            inbox: VecDeque::new(),
        };
        if g.cfg.gatt_service {
            if let Err(e) = g.register_builtin() {
                error!("Failed to register GATT service: {e}");
            }
        }
        g
    }

    /// Returns the engine configuration.
    #[inline(always)]
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.cfg
    }

    /// Returns the host.
    #[inline(always)]
    #[must_use]
    pub const fn host(&self) -> &H {
        &self.host
    }

    /// Returns the host.
    #[inline(always)]
    #[must_use]
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Locks the attribute database. Services added or changed through the
    /// guard do not generate Service Changed indications.
    #[inline]
    pub fn db(&self) -> MutexGuard<'_, Db> {
        self.db.lock()
    }

    /// Returns the shared attribute database.
    #[inline]
    #[must_use]
    pub fn shared_db(&self) -> Arc<Mutex<Db>> {
        Arc::clone(&self.db)
    }

    /// Returns the ATT_MTU of a connected link.
    #[inline]
    #[must_use]
    pub fn mtu(&self, conn: ConnId) -> Option<u16> {
        self.links.get(&conn).map(|t| t.mtu)
    }

    /// Registers an application.
    pub fn register_app(&mut self, app: Arc<dyn App>) -> Result<AppId> {
        let id = self.alloc_app_id()?;
        self.apps.insert(id, app);
        debug!("Registered {id}");
        Ok(id)
    }

    /// Removes an application and all of its services.
    pub fn deregister_app(&mut self, app: AppId) -> Result<()> {
        if self.builtin.as_ref().map(|b| b.app) == Some(app) {
            return Err(Error::InvalidParam);
        }
        self.apps.remove(&app).ok_or(Error::UnknownApp)?;
        let del = self.db.lock().delete_app_services(app);
        for s in del.into_iter().filter(Service::is_started) {
            self.service_changed(s.range());
        }
        let queued: Vec<ClcbId> = (self.clcbs.iter())
            .filter(|(id, c)| c.app == app && !self.is_active(c.conn, **id))
            .map(|(&id, _)| id)
            .collect();
        for id in queued {
            if let Some(c) = self.clcbs.remove(&id) {
                if let Some(t) = self.links.get_mut(&c.conn) {
                    t.cl_queue.retain(|&q| q != id);
                    t.sec.remove(|&q| q == id);
                }
            }
        }
        debug!("Deregistered {app}");
        self.run();
        Ok(())
    }

    /// Creates a service owned by `app`. See [`Db::create_service`].
    pub fn create_service(
        &mut self,
        app: AppId,
        uuid: Uuid,
        primary: bool,
        start: Option<Handle>,
        num: u16,
    ) -> Result<Handle> {
        self.check_app(app)?;
        self.db.lock().create_service(app, uuid, primary, start, num)
    }

    /// Starts a service and indicates the change to configured peers.
    pub fn start_service(&mut self, svc: Handle) -> Result<()> {
        let r = self.db.lock().start_service(svc)?;
        self.service_changed(r);
        self.run();
        Ok(())
    }

    /// Stops a service and indicates the change to configured peers.
    pub fn stop_service(&mut self, svc: Handle) -> Result<()> {
        let r = self.db.lock().stop_service(svc)?;
        self.service_changed(r);
        self.run();
        Ok(())
    }

    /// Deletes a service and indicates the change to configured peers if the
    /// service was started.
    pub fn delete_service(&mut self, svc: Handle) -> Result<()> {
        let s = self.db.lock().delete_service(svc)?;
        if s.is_started() {
            self.service_changed(s.range());
        }
        self.run();
        Ok(())
    }

    /// Creates the state of a new link. A link that is already connected is
    /// torn down first, as if [`Gatt::on_disconnect`] was called.
    pub fn on_connect(&mut self, conn: ConnId) {
        if self.links.contains_key(&conn) {
            warn!("{conn} connected without a disconnect");
            self.on_disconnect(conn);
        }
        debug!("Connected {conn}");
        self.links.insert(conn, Tcb::new(conn));
    }

    /// Tears down the state of a disconnected link. Prepared writes are
    /// discarded and all client operations fail with
    /// [`Error::Disconnected`].
    pub fn on_disconnect(&mut self, conn: ConnId) {
        let Some(t) = self.links.remove(&conn) else {
            return;
        };
        debug!("Disconnected {conn}");
        for id in [TimerId::Rsp(conn), TimerId::Conf(conn), TimerId::IndAck(conn)] {
            self.host.stop(id);
        }
        drop(t);
        if let Some(b) = self.builtin.as_ref() {
            b.svc.drop_link(conn);
        }
        let ids: Vec<ClcbId> = (self.clcbs.iter())
            .filter_map(|(&id, c)| (c.conn == conn).then_some(id))
            .collect();
        for id in ids {
            if let Some(c) = self.clcbs.remove(&id) {
                self.app_event(conn, c.app, c.fail_event(Error::Disconnected));
            }
        }
        self.inbox.retain(|m| match *m {
            Msg::AppRsp { conn: c, .. } | Msg::EncComplete { conn: c, .. } => c != conn,
            Msg::Timeout(id) => id.conn() != conn,
        });
        self.run();
    }

    /// Handles an inbound PDU.
    pub fn on_pdu(&mut self, conn: ConnId, pdu: &[u8]) {
        let Some(&raw) = pdu.first() else {
            warn!("Empty PDU from {conn}");
            return;
        };
        if !self.links.contains_key(&conn) {
            warn!("PDU from unknown {conn}");
            return;
        }
        match Opcode::try_from(raw) {
            Ok(op) => match op.typ() {
                PduType::Rsp | PduType::Ntf | PduType::Ind => self.client_pdu(conn, op, pdu),
                PduType::Req | PduType::Cmd | PduType::Cfm => self.server_pdu(conn, op, pdu),
            },
            Err(_) if Opcode::is_cmd(raw) => warn!("Ignored unknown command {raw:#04X}"),
            Err(_) => {
                warn!("Unsupported request {raw:#04X} from {conn}");
                let e = ErrorRsp::new(raw, None, ErrorCode::RequestNotSupported);
                self.send(conn, &e.to_pdu());
            }
        }
        self.run();
    }

    /// Delivers a deferred application answer to a server request.
    pub fn submit_response(
        &mut self,
        conn: ConnId,
        app: AppId,
        trans: TransId,
        result: std::result::Result<Vec<u8>, ErrorCode>,
    ) -> Result<()> {
        self.check_app(app)?;
        if !self.links.contains_key(&conn) {
            return Err(Error::NotConnected);
        }
        self.inbox.push_back(Msg::AppRsp {
            conn,
            app,
            trans,
            result,
        });
        self.run();
        Ok(())
    }

    /// Handles completion of a link encryption upgrade.
    pub fn on_encryption_complete(&mut self, conn: ConnId, ok: bool) {
        self.inbox.push_back(Msg::EncComplete { conn, ok });
        self.run();
    }

    /// Handles timer expiry.
    pub fn on_timeout(&mut self, id: TimerId) {
        self.inbox.push_back(Msg::Timeout(id));
        self.run();
    }

    /// Processes queued messages until the inbox is empty.
    pub(super) fn run(&mut self) {
        while let Some(m) = self.inbox.pop_front() {
            match m {
                Msg::AppRsp {
                    conn,
                    app,
                    trans,
                    result,
                } => self.app_response(conn, app, trans, result),
                Msg::EncComplete { conn, ok } => self.enc_complete(conn, ok),
                Msg::Timeout(id) => match id {
                    TimerId::Rsp(conn) => self.rsp_timeout(conn),
                    TimerId::Conf(conn) => self.conf_timeout(conn),
                    TimerId::IndAck(conn) => self.ind_ack_timeout(conn),
                },
            }
        }
    }

    /// Sends a PDU to the peer.
    pub(super) fn send(&mut self, conn: ConnId, pdu: &[u8]) {
        if let Err(e) = self.host.send(conn, pdu) {
            warn!("Failed to send {:#04X} to {conn}: {e}", pdu.first().copied().unwrap_or(0));
        }
    }

    /// Returns the current link security state.
    #[inline]
    pub(super) fn link_sec(&mut self, conn: ConnId) -> LinkSec {
        self.host.sec_flags(conn)
    }

    /// Delivers a server request to an application. An immediate answer is
    /// queued as a message if the request expects one.
    pub(super) fn call_app(&mut self, conn: ConnId, app: AppId, trans: TransId, req: ServerReq) {
        let expects = trans != TransId::NONE
            && !matches!(
                req,
                ServerReq::Read {
                    needs_response: false,
                    ..
                } | ServerReq::Write {
                    needs_response: false,
                    ..
                } | ServerReq::Mtu(_)
                    | ServerReq::Confirm(_)
            );
        let Some(a) = self.apps.get(&app).cloned() else {
            warn!("Request for unknown {app}");
            if expects {
                self.inbox.push_back(Msg::AppRsp {
                    conn,
                    app,
                    trans,
                    result: Err(ErrorCode::UnlikelyError),
                });
            }
            return;
        };
        if let Reply::Now(result) = a.server_request(conn, trans, req) {
            if expects {
                self.inbox.push_back(Msg::AppRsp {
                    conn,
                    app,
                    trans,
                    result,
                });
            }
        }
    }

    /// Delivers a client event to an application.
    pub(super) fn app_event(&self, conn: ConnId, app: AppId, evt: ClientEvent) {
        match self.apps.get(&app) {
            Some(a) => a.client_event(conn, evt),
            None => debug!("Dropped {evt:?} for unknown {app}"),
        }
    }

    /// Returns the ids of registered applications, excluding the GATT service.
    pub(super) fn user_apps(&self) -> Vec<AppId> {
        let builtin = self.builtin.as_ref().map(|b| b.app);
        (self.apps.keys().copied())
            .filter(|&a| Some(a) != builtin)
            .collect()
    }

    /// Returns an error if `app` is not registered.
    #[inline]
    pub(super) fn check_app(&self, app: AppId) -> Result<()> {
        if self.apps.contains_key(&app) {
            Ok(())
        } else {
            Err(Error::UnknownApp)
        }
    }

    /// Indicates a database change to every link that enabled Service Changed
    /// indications.
    fn service_changed(&mut self, range: HandleRange) {
        let Some(b) = self.builtin.as_ref() else {
            return;
        };
        let (hdl, svc) = (b.svc.sc_handle(), Arc::clone(&b.svc));
        let val = GattService::value(range);
        let conns: Vec<ConnId> = (self.links.keys().copied())
            .filter(|&c| svc.is_enabled(c))
            .collect();
        for conn in conns {
            debug!("Service Changed {range:?} for {conn}");
            self.queue_indication(conn, hdl, val.to_vec());
        }
    }

    fn register_builtin(&mut self) -> Result<()> {
        let app = self.alloc_app_id()?;
        let svc = Arc::new(GattService::register(&mut self.db.lock(), app)?);
        self.apps.insert(app, Arc::clone(&svc) as Arc<dyn App>);
        self.builtin = Some(Builtin { app, svc });
        Ok(())
    }

    fn alloc_app_id(&self) -> Result<AppId> {
        if self.apps.len() >= self.cfg.max_apps {
            warn!("Application limit reached ({})", self.cfg.max_apps);
            return Err(Error::NoResources);
        }
        (1..=u8::MAX)
            .map(AppId)
            .find(|id| !self.apps.contains_key(id))
            .ok_or(Error::NoResources)
    }

    fn is_active(&self, conn: ConnId, id: ClcbId) -> bool {
        (self.links.get(&conn)).map_or(false, |t| t.cl_active == Some(id))
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::super::testing::*;
    use super::*;

    #[test]
    fn app_registry() {
        let mut g = gatt(Config {
            max_apps: 3,
            ..Config::default()
        });
        let a = g.register_app(MockApp::new()).unwrap();
        let b = g.register_app(MockApp::new()).unwrap();
        assert_ne!(a, b);
        assert_eq!(g.register_app(MockApp::new()), Err(Error::NoResources));
        let s = g.create_service(b, Uuid::Uuid16(0x180F), true, None, 3).unwrap();
        g.start_service(s).unwrap();
        g.deregister_app(b).unwrap();
        assert!(g.db().service(s).is_none());
        assert_eq!(g.deregister_app(b), Err(Error::UnknownApp));
        assert_eq!(
            g.create_service(b, Uuid::Uuid16(1), true, None, 1),
            Err(Error::UnknownApp)
        );
        let builtin = g.builtin.as_ref().unwrap().app;
        assert_eq!(g.deregister_app(builtin), Err(Error::InvalidParam));
    }

    #[test]
    fn unknown_request() {
        let mut g = gatt(Config::default());
        g.on_connect(CONN);
        g.on_pdu(CONN, &[0x20, 0x01, 0x00]);
        g.on_pdu(CONN, &[0x7F]);
        g.on_pdu(CONN, &[]);
        assert_eq!(g.host().take_sent(), [vec![0x01, 0x20, 0, 0, 0x06]]);
    }

    #[test]
    fn service_changed() {
        let mut g = gatt(Config::default());
        let app = g.register_app(MockApp::new()).unwrap();
        g.on_connect(CONN);
        g.on_connect(ConnId(2));
        // Enable indications on the first link only
        let ccc = 4;
        g.on_pdu(CONN, &[0x12, ccc, 0, 0x02, 0x00]);
        assert_eq!(g.host().take_sent(), [vec![0x13]]);

        let s = g.create_service(app, Uuid::Uuid16(0x180F), true, None, 3).unwrap();
        g.start_service(s).unwrap();
        assert_eq!(
            g.host().take_sent(),
            [vec![0x1D, 3, 0, 5, 0, 7, 0]]
        );
        assert_matches!(g.host().timers(), v if v.contains(&TimerId::Conf(CONN)));
        // Second change waits for the confirmation
        g.stop_service(s).unwrap();
        assert!(g.host().take_sent().is_empty());
        g.on_pdu(CONN, &[0x1E]);
        assert_eq!(
            g.host().take_sent(),
            [vec![0x1D, 3, 0, 5, 0, 7, 0]]
        );
        g.on_pdu(CONN, &[0x1E]);
        g.delete_service(s).unwrap();
        assert!(g.host().take_sent().is_empty());
        g.on_disconnect(CONN);
        assert!(g.mtu(CONN).is_none());
    }

    #[test]
    fn reconnect_tears_down() {
        let mut g = gatt(Config::default());
        let a = MockApp::new();
        let app = g.register_app(a.clone()).unwrap();
        g.on_connect(CONN);
        g.on_pdu(CONN, &[0x02, 100, 0]);
        g.discover(CONN, app, DiscType::AllServices, HandleRange::ALL)
            .unwrap();
        g.host().take_sent();
        g.on_connect(CONN);
        assert_eq!(a.events(), [ClientEvent::DiscoveryComplete(Err(Error::Disconnected))]);
        assert_eq!(g.mtu(CONN), Some(DEFAULT_MTU));
        assert!(g.host().timers().is_empty());
    }
}
