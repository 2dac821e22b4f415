//! The accepting side: bind, listen, accept in a loop, and keep a registry
//! of live sessions for broadcast and teardown. The TLS server reuses
//! everything here, inserting its handshake between accept and the pumps.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::handler::{shielded, ServerHandler};
use crate::session::Session;
use crate::settings::TcpSettings;

/// State shared between a server handle, its accept task, and its sessions.
/// Sessions hold this weakly; the server owns it.
pub(crate) struct ServerShared {
    pub(crate) settings: TcpSettings,
    pub(crate) handler: Arc<dyn ServerHandler>,
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    started: AtomicBool,
    endpoint: Mutex<Option<Endpoint>>,
    local_addr: Mutex<Option<SocketAddr>>,
    stopping: Notify,
    accept_task: AsyncMutex<Option<JoinHandle<()>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    peak_sessions: AtomicUsize,
}

impl ServerShared {
    pub(crate) fn new(settings: TcpSettings, handler: Arc<dyn ServerHandler>) -> Arc<ServerShared> {
        Arc::new(ServerShared {
            settings,
            handler,
            sessions: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            endpoint: Mutex::new(None),
            local_addr: Mutex::new(None),
            stopping: Notify::new(),
            accept_task: AsyncMutex::new(None),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            peak_sessions: AtomicUsize::new(0),
        })
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub(crate) fn bound_endpoint(&self) -> Option<Endpoint> {
        self.endpoint.lock().unwrap().clone()
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub(crate) fn peak_sessions(&self) -> usize {
        self.peak_sessions.load(Ordering::Relaxed)
    }

    pub(crate) fn credit_sent(&self, count: usize) {
        self.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn credit_received(&self, count: usize) {
        self.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Insert a session, refusing if the server stopped in the meantime.
    /// Registration and the stop path serialize on the registry lock, so a
    /// session is either seen by `stop`'s snapshot or never registered.
    fn register(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if !self.started.load(Ordering::SeqCst) {
            return false;
        }
        sessions.insert(session.id(), session.clone());
        self.peak_sessions
            .fetch_max(sessions.len(), Ordering::Relaxed);
        true
    }

    pub(crate) fn unregister(&self, id: Uuid) {
        self.sessions.lock().unwrap().remove(&id);
    }

    pub(crate) fn find_session(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn connected_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Clone the registry contents so no lock is held across callbacks.
    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Queue `data` on every registered session.
    pub(crate) fn multicast_async(&self, data: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        for session in self.snapshot() {
            session.send_async(data);
        }
        true
    }

    /// Write `data` directly on every registered session, one at a time.
    /// Sessions mid-disconnect or mid-send are skipped.
    pub(crate) async fn multicast(&self, data: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        for session in self.snapshot() {
            let _ = session.send(data).await;
        }
        true
    }

    pub(crate) async fn disconnect_all(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        for session in self.snapshot() {
            session.disconnect().await;
        }
        true
    }
}

/// Bind, apply the configured listener options, start listening, and spawn
/// the accept loop.
pub(crate) async fn start_server(
    shared: &Arc<ServerShared>,
    endpoint: &Endpoint,
    tls: Option<TlsAcceptor>,
) -> Result<SocketAddr, Error> {
    if shared.started.swap(true, Ordering::SeqCst) {
        return Err(Error::AlreadyStarted);
    }

    let bound = async {
        let addr = endpoint.resolve_one().await?;
        let listener = bind_listener(&shared.settings, addr)?;
        let local = listener.local_addr()?;
        Ok::<_, Error>((listener, local))
    }
    .await;
    let (listener, local) = match bound {
        Ok(bound) => bound,
        Err(error) => {
            shared.started.store(false, Ordering::SeqCst);
            return Err(error);
        }
    };

    *shared.endpoint.lock().unwrap() = Some(endpoint.clone());
    *shared.local_addr.lock().unwrap() = Some(local);
    info!("server listening on {}", local);
    shared.handler.on_started().await;

    let handle = tokio::spawn(accept_loop(shared.clone(), listener, tls));
    *shared.accept_task.lock().await = Some(handle);
    Ok(local)
}

/// Close the listener, then disconnect every session the server knows of.
/// Returns false if the server was not started.
pub(crate) async fn stop_server(shared: &Arc<ServerShared>) -> bool {
    if !shared.started.swap(false, Ordering::SeqCst) {
        return false;
    }
    shared.handler.on_stopping().await;

    // Wait for the accept task so the listening socket is certainly closed
    // (and the port free) before we report the server stopped.
    shared.stopping.notify_waiters();
    if let Some(handle) = shared.accept_task.lock().await.take() {
        let _ = handle.await;
    }

    for session in shared.snapshot() {
        session.disconnect().await;
    }
    *shared.local_addr.lock().unwrap() = None;

    info!("server stopped");
    shared.handler.on_stopped().await;
    true
}

pub(crate) fn bind_listener(
    settings: &TcpSettings,
    addr: SocketAddr,
) -> Result<TcpListener, Error> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if settings.reuse_address {
        socket.set_reuseaddr(true)?;
    }
    #[cfg(unix)]
    {
        if settings.reuse_port {
            socket.set_reuseport(true)?;
        }
    }
    {
        let raw = socket2::SockRef::from(&socket);
        if addr.is_ipv6() && settings.dual_mode {
            raw.set_only_v6(false)?;
        }
        if settings.receive_buffer_size > 0 {
            raw.set_recv_buffer_size(settings.receive_buffer_size)?;
        }
        if settings.send_buffer_size > 0 {
            raw.set_send_buffer_size(settings.send_buffer_size)?;
        }
    }
    socket.bind(addr)?;
    Ok(socket.listen(settings.accept_backlog)?)
}

/// Apply the per-connection options to a freshly accepted or connected
/// stream.
pub(crate) fn configure_stream(settings: &TcpSettings, stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(settings.no_delay)?;
    let raw = socket2::SockRef::from(stream);
    if settings.keep_alive {
        raw.set_keepalive(true)?;
    }
    if settings.receive_buffer_size > 0 {
        raw.set_recv_buffer_size(settings.receive_buffer_size)?;
    }
    if settings.send_buffer_size > 0 {
        raw.set_send_buffer_size(settings.send_buffer_size)?;
    }
    Ok(())
}

/// Exactly one accept outstanding while the server is started. Each
/// accepted connection is wired up on its own task so a slow TLS handshake
/// never stalls the listener; listener errors are surfaced and the loop
/// re-arms.
async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener, tls: Option<TlsAcceptor>) {
    let stopping = shared.stopping.notified();
    tokio::pin!(stopping);
    stopping.as_mut().enable();
    // A stop that raced this task's startup notified before the line above
    // could observe it.
    if !shared.is_started() {
        return;
    }

    loop {
        if !shared.is_started() {
            break;
        }
        let accepted = tokio::select! {
            _ = stopping.as_mut() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                let tls = tls.clone();
                tokio::spawn(accept_one(shared, stream, peer, tls));
            }
            Err(error) => {
                shared.handler.on_error(&error.into()).await;
            }
        }
    }
    // The listener drops here, releasing the port.
}

async fn accept_one(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
) {
    if let Err(error) = configure_stream(&shared.settings, &stream) {
        shared.handler.on_error(&error.into()).await;
        return;
    }
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(error) => {
            shared.handler.on_error(&error.into()).await;
            return;
        }
    };

    let session = Session::new(
        shared.handler.create_session(),
        Arc::downgrade(&shared),
        &shared.settings,
        peer,
        local,
    );
    if tls.is_none() {
        // Plain sessions may queue sends from `on_connected` onwards; TLS
        // sessions stay gated until their handshake completes.
        session.mark_handshaked();
    }
    if !shared.register(&session) {
        // Stopped while this connection was in flight; drop it silently.
        return;
    }
    debug!(session = %session.id(), %peer, "connection accepted");

    shared.handler.on_connecting(&session).await;
    if !shielded(session.handler().on_connected(&session)).await {
        session.report_and_disconnect(Error::CallbackPanic).await;
        return;
    }
    shared.handler.on_connected(&session).await;

    match tls {
        None => {
            session.start(stream.into()).await;
        }
        Some(acceptor) => {
            if !shielded(session.handler().on_handshaking(&session)).await {
                session.report_and_disconnect(Error::CallbackPanic).await;
                return;
            }
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    // The server may have stopped (disconnecting this
                    // session) while the handshake was in flight.
                    if !session.is_connected() {
                        return;
                    }
                    session.mark_handshaked();
                    if !shielded(session.handler().on_handshaked(&session)).await {
                        session.report_and_disconnect(Error::CallbackPanic).await;
                        return;
                    }
                    session.start(tls_stream.into()).await;
                }
                Err(error) => {
                    error!("TLS handshake error [{}]: {}", peer, error);
                    shielded(session.handler().on_error(&session, &Error::NotConnected)).await;
                    session.disconnect().await;
                }
            }
        }
    }
}

/// An asynchronous stream-socket server: accept loop, session registry,
/// broadcast, and a restartable start/stop lifecycle.
pub struct TcpServer {
    shared: Arc<ServerShared>,
}

impl TcpServer {
    pub fn new(settings: TcpSettings, handler: Arc<dyn ServerHandler>) -> TcpServer {
        TcpServer {
            shared: ServerShared::new(settings, handler),
        }
    }

    /// Bind to `endpoint` and begin accepting. Returns the bound address,
    /// which carries the actual port when the endpoint asked for port 0.
    pub async fn start(&self, endpoint: &Endpoint) -> Result<SocketAddr, Error> {
        start_server(&self.shared, endpoint, None).await
    }

    /// Close the listener and disconnect every session. Returns false if
    /// the server was not started.
    pub async fn stop(&self) -> bool {
        stop_server(&self.shared).await
    }

    /// Stop and start again on the previously bound endpoint.
    pub async fn restart(&self) -> Result<SocketAddr, Error> {
        let endpoint = self.shared.bound_endpoint().ok_or(Error::NotStarted)?;
        stop_server(&self.shared).await;
        let local = start_server(&self.shared, &endpoint, None).await?;
        self.shared.handler.on_restarted().await;
        Ok(local)
    }

    /// Queue `data` on every connected session. Returns false if the server
    /// is not started.
    pub fn multicast_async(&self, data: impl AsRef<[u8]>) -> bool {
        self.shared.multicast_async(data.as_ref())
    }

    /// Write `data` directly on every connected session, one at a time.
    pub async fn multicast(&self, data: impl AsRef<[u8]>) -> bool {
        self.shared.multicast(data.as_ref()).await
    }

    /// Disconnect every session without closing the listener.
    pub async fn disconnect_all(&self) -> bool {
        self.shared.disconnect_all().await
    }

    pub fn find_session(&self, id: Uuid) -> Option<Arc<Session>> {
        self.shared.find_session(id)
    }

    pub fn connected_sessions(&self) -> usize {
        self.shared.connected_sessions()
    }

    pub fn is_started(&self) -> bool {
        self.shared.is_started()
    }

    /// The bound address while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    /// Bytes sent across all sessions this server has owned.
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent()
    }

    /// Bytes received across all sessions this server has owned.
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received()
    }

    /// The most sessions ever connected at once.
    pub fn peak_sessions(&self) -> usize {
        self.shared.peak_sessions()
    }
}
