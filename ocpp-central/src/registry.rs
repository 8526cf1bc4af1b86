//! Connection registry
//!
//! [`CentralSystem`] is the handle test drivers hold. `serve` starts a
//! dedicated `central-system` thread running a current-thread tokio runtime;
//! the accept loop and every station's dispatch loop share it. Everything
//! else on the handle is synchronous and safe to call from any other thread.
//!
//! ```text
//!   caller threads                     central-system thread
//!  +----------------------+           +---------------------------+
//!  | wait_for_connection  |<-Condvar--| accept_loop               |
//!  | find_session         |<--Mutex---|   on_connect per station  |
//!  | Session operations   |--bridge-->|     Connection::run       |
//!  +----------------------+           +---------------------------+
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{error, info, warn};

use crate::bridge::CallBridge;
use crate::config::CentralSystemConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::accept_station;

const THREAD_NAME: &str = "central-system";

#[derive(Default)]
struct Registry {
    /// Live sessions in connection order
    sessions: Vec<Arc<Session>>,
    /// Id of the last registration not yet observed by a waiter
    connect_event: Option<String>,
}

struct Server {
    addr: String,
    port: u16,
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

struct Inner {
    config: CentralSystemConfig,
    registry: Mutex<Registry>,
    connected: Condvar,
    server: Mutex<Option<Server>>,
}

/// Central system stand-in; cheap to clone
#[derive(Clone)]
pub struct CentralSystem {
    inner: Arc<Inner>,
}

impl CentralSystem {
    pub fn new(config: CentralSystemConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry::default()),
                connected: Condvar::new(),
                server: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CentralSystemConfig {
        &self.inner.config
    }

    /// Start accepting charge points on `addr:port`
    ///
    /// Returns once the listener is bound, with the bound address (port 0
    /// picks a free port). The server runs until [`shutdown`](Self::shutdown).
    pub fn serve(&self, addr: &str, port: u16) -> Result<SocketAddr> {
        let mut server = self.inner.server.lock();
        if let Some(running) = server.as_ref() {
            return Err(Error::AlreadyRunning {
                addr: running.addr.clone(),
                port: running.port,
            });
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<io::Result<SocketAddr>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let system = self.clone();
        let bind_addr = addr.to_string();

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match TcpListener::bind((bind_addr.as_str(), port)).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let local_addr = listener.local_addr();
                    let bound = local_addr.is_ok();
                    let _ = ready_tx.send(local_addr);
                    if bound {
                        system.accept_loop(listener, shutdown_rx).await;
                    }
                });
            })?;

        let local_addr = match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                "central system thread exited before binding",
            )),
        };
        let local_addr = match local_addr {
            Ok(local_addr) => local_addr,
            Err(e) => {
                let _ = thread.join();
                return Err(e.into());
            }
        };

        info!("Central system listening on ws://{}", local_addr);
        *server = Some(Server {
            addr: addr.to_string(),
            port,
            local_addr,
            shutdown_tx,
            thread,
        });
        Ok(local_addr)
    }

    async fn accept_loop(&self, listener: TcpListener, mut shutdown_rx: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Central system shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let system = self.clone();
                        tokio::spawn(async move { system.on_connect(stream, peer).await });
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                }
            }
        }
    }

    async fn on_connect(&self, stream: TcpStream, peer: SocketAddr) {
        let config = &self.inner.config;

        let (mut ws, station_id) = match accept_station(stream, config).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let (connection, outgoing_rx) = Connection::new(station_id.clone(), config);
        let bridge = Arc::new(CallBridge::new(connection.clone(), Handle::current()));
        let session = Arc::new(
            Session::new(station_id.clone(), bridge)
                .with_heartbeat_interval(config.heartbeat_interval),
        );

        if let Err(e) = self.register(session.clone()) {
            warn!("Refusing connection from {}: {}", peer, e);
            let refusal = CloseFrame {
                code: CloseCode::Policy,
                reason: e.to_string().into(),
            };
            let _ = ws.close(Some(refusal)).await;
            return;
        }
        info!("Charge point {} connected from {}", station_id, peer);

        match connection.run(ws, &session, outgoing_rx).await {
            Ok(()) => info!("Charge point {} disconnected", station_id),
            Err(e) => error!("Connection to charge point {} lost: {}", station_id, e),
        }
        self.unregister(&session);
    }

    /// Add a session and signal waiters
    pub(crate) fn register(&self, session: Arc<Session>) -> Result<()> {
        let mut registry = self.inner.registry.lock();
        if registry.sessions.iter().any(|s| s.id() == session.id()) {
            return Err(Error::DuplicateSession(session.id().to_string()));
        }

        registry.connect_event = Some(session.id().to_string());
        registry.sessions.push(session);
        drop(registry);

        self.inner.connected.notify_all();
        Ok(())
    }

    /// Remove a session; an unobserved connect event for it is dropped too
    pub(crate) fn unregister(&self, session: &Arc<Session>) {
        let mut registry = self.inner.registry.lock();
        let before = registry.sessions.len();
        registry.sessions.retain(|s| !Arc::ptr_eq(s, session));

        let removed = registry.sessions.len() < before;
        if removed && registry.connect_event.as_deref() == Some(session.id()) {
            registry.connect_event = None;
        }
    }

    /// Block until a charge point connects and return its id
    ///
    /// Returns immediately if a connection arrived since the last call.
    pub fn wait_for_connection(&self) -> String {
        let mut registry = self.inner.registry.lock();
        loop {
            if let Some(id) = registry.connect_event.take() {
                return id;
            }
            self.inner.connected.wait(&mut registry);
        }
    }

    /// [`wait_for_connection`](Self::wait_for_connection) with a bound
    ///
    /// A timeout too large to represent waits without a deadline.
    pub fn wait_for_connection_timeout(&self, timeout: Duration) -> Result<String> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Ok(self.wait_for_connection());
        };

        let mut registry = self.inner.registry.lock();
        loop {
            if let Some(id) = registry.connect_event.take() {
                return Ok(id);
            }
            if self.inner.connected.wait_until(&mut registry, deadline).timed_out() {
                return registry
                    .connect_event
                    .take()
                    .ok_or_else(|| Error::Timeout("charge point connection".to_string()));
            }
        }
    }

    pub fn find_session(&self, id: &str) -> Result<Arc<Session>> {
        self.inner
            .registry
            .lock()
            .sessions
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn has_connections(&self) -> bool {
        !self.inner.registry.lock().sessions.is_empty()
    }

    /// Ids of live sessions in connection order
    pub fn session_ids(&self) -> Vec<String> {
        self.inner
            .registry
            .lock()
            .sessions
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.lock().as_ref().map(|s| s.local_addr)
    }

    pub fn is_serving(&self) -> bool {
        self.inner.server.lock().is_some()
    }

    /// Whether the server was started with exactly `addr` and `port`
    pub fn serving_on(&self, addr: &str, port: u16) -> bool {
        self.inner
            .server
            .lock()
            .as_ref()
            .is_some_and(|s| s.addr == addr && s.port == port)
    }

    /// Stop the server; every station connection is dropped
    pub fn shutdown(&self) -> Result<()> {
        let server = self.inner.server.lock().take().ok_or(Error::NotRunning)?;

        let _ = server.shutdown_tx.send(());
        if server.thread.join().is_err() {
            error!("Central system thread panicked");
        }

        // Connection tasks die with the runtime and never unregister.
        let mut registry = self.inner.registry.lock();
        registry.sessions.clear();
        registry.connect_event = None;

        info!("Central system on {} stopped", server.local_addr);
        Ok(())
    }
}

impl Default for CentralSystem {
    fn default() -> Self {
        Self::new(CentralSystemConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BlockingCall;
    use crate::ocpp::{Action, OcppError};
    use serde_json::Value;

    struct Offline;

    impl BlockingCall for Offline {
        fn blocking_call(&self, _action: Action, _payload: Value) -> Result<Value> {
            Err(Error::Protocol(OcppError::ConnectionClosed))
        }
    }

    fn session(id: &str) -> Arc<Session> {
        Arc::new(Session::new(id, Arc::new(Offline)))
    }

    #[test]
    fn test_find_session() {
        let system = CentralSystem::default();
        assert!(!system.has_connections());
        assert!(matches!(
            system.find_session("unknown-id").unwrap_err(),
            Error::NotFound(ref id) if id == "unknown-id"
        ));

        system.register(session("CP_1")).unwrap();
        assert!(system.has_connections());
        assert_eq!(system.find_session("CP_1").unwrap().id(), "CP_1");
    }

    #[test]
    fn test_duplicate_session_is_refused() {
        let system = CentralSystem::default();
        let first = session("CP_1");
        system.register(first.clone()).unwrap();

        let err = system.register(session("CP_1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateSession(ref id) if id == "CP_1"));
        assert!(Arc::ptr_eq(&system.find_session("CP_1").unwrap(), &first));
    }

    #[test]
    fn test_unregister_removes_only_that_session() {
        let system = CentralSystem::default();
        let first = session("CP_1");
        system.register(first.clone()).unwrap();
        system.register(session("CP_2")).unwrap();
        assert_eq!(system.session_ids(), vec!["CP_1", "CP_2"]);

        system.unregister(&first);
        assert_eq!(system.session_ids(), vec!["CP_2"]);
        assert!(system.find_session("CP_1").is_err());

        // A stale handle with the same id does not evict the new session.
        system.register(session("CP_1")).unwrap();
        system.unregister(&first);
        assert_eq!(system.session_ids(), vec!["CP_2", "CP_1"]);
    }

    #[test]
    fn test_wait_for_connection_returns_latest_and_then_blocks() {
        let system = CentralSystem::default();
        system.register(session("CP_1")).unwrap();
        system.register(session("CP_2")).unwrap();

        assert_eq!(system.wait_for_connection(), "CP_2");
        let err = system
            .wait_for_connection_timeout(Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_wait_for_connection_with_unbounded_timeout() {
        let system = CentralSystem::default();
        system.register(session("CP_1")).unwrap();
        assert_eq!(system.wait_for_connection_timeout(Duration::MAX).unwrap(), "CP_1");

        let waiter = {
            let system = system.clone();
            thread::spawn(move || system.wait_for_connection_timeout(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(50));
        system.register(session("CP_2")).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), "CP_2");
    }

    #[test]
    fn test_unobserved_connection_is_forgotten_on_disconnect() {
        let system = CentralSystem::default();
        let first = session("CP_1");
        system.register(first.clone()).unwrap();
        system.unregister(&first);

        let err = system
            .wait_for_connection_timeout(Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // An event naming a newer session survives a stale handle going away.
        system.register(session("CP_1")).unwrap();
        system.unregister(&first);
        assert_eq!(system.wait_for_connection_timeout(Duration::from_secs(1)).unwrap(), "CP_1");
    }

    #[test]
    fn test_wait_for_connection_wakes_on_register() {
        let system = CentralSystem::default();

        let waiter = {
            let system = system.clone();
            thread::spawn(move || system.wait_for_connection_timeout(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(50));
        system.register(session("CP_1")).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), "CP_1");
    }

    #[test]
    fn test_serve_and_shutdown() {
        let system = CentralSystem::default();
        assert!(matches!(system.shutdown().unwrap_err(), Error::NotRunning));

        let local_addr = system.serve("127.0.0.1", 0).unwrap();
        assert_ne!(local_addr.port(), 0);
        assert!(system.is_serving());
        assert!(system.serving_on("127.0.0.1", 0));
        assert_eq!(system.local_addr(), Some(local_addr));

        let err = system.serve("127.0.0.1", 0).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { port: 0, .. }));

        system.shutdown().unwrap();
        assert!(!system.is_serving());
        assert!(system.local_addr().is_none());
    }

    #[test]
    fn test_serve_reports_bind_errors() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let system = CentralSystem::default();
        assert!(matches!(system.serve("127.0.0.1", port).unwrap_err(), Error::Io(_)));
        assert!(!system.is_serving());
    }
}
