//! The outbound side: resolve, connect, and run the same session engine the
//! servers use. A client owns at most one live session and may reconnect
//! after a disconnect.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tokio::net::TcpStream;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::handler::{shielded, SessionHandler};
use crate::session::Session;
use crate::settings::TcpSettings;
use crate::tcp::server::configure_stream;

/// State shared by the TCP and TLS clients: the connect target, the handler
/// wired into each session, and the current session slot.
pub(crate) struct ClientCore {
    pub(crate) settings: TcpSettings,
    pub(crate) handler: Arc<dyn SessionHandler>,
    pub(crate) endpoint: Endpoint,
    session: Mutex<Option<Arc<Session>>>,
}

impl ClientCore {
    pub(crate) fn new(
        settings: TcpSettings,
        endpoint: Endpoint,
        handler: Arc<dyn SessionHandler>,
    ) -> ClientCore {
        ClientCore {
            settings,
            handler,
            endpoint,
            session: Mutex::new(None),
        }
    }

    pub(crate) fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap().clone()
    }

    pub(crate) fn set_session(&self, session: &Arc<Session>) {
        *self.session.lock().unwrap() = Some(session.clone());
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session()
            .map(|session| session.is_connected())
            .unwrap_or(false)
    }

    pub(crate) async fn disconnect(&self) -> bool {
        match self.session() {
            Some(session) => session.disconnect().await,
            None => false,
        }
    }

    pub(crate) fn send_async(&self, data: &[u8]) -> bool {
        self.session()
            .map(|session| session.send_async(data))
            .unwrap_or(false)
    }

    pub(crate) async fn send(&self, data: &[u8]) -> Result<usize, Error> {
        match self.session() {
            Some(session) => session.send(data).await,
            None => Err(Error::NotConnected),
        }
    }
}

/// Resolve the endpoint and attempt to connect to each of its addresses,
/// succeeding on the first. The resolution error is only reported when no
/// address works at all.
pub(crate) async fn connect_stream(
    settings: &TcpSettings,
    endpoint: &Endpoint,
) -> Result<TcpStream, Error> {
    let mut addresses = endpoint.resolve().await?;

    let mut connection_error = None;
    let stream = loop {
        if let Some(address) = addresses.next() {
            match TcpStream::connect(address).await {
                Ok(stream) => break stream,
                Err(error) => connection_error = Some(error),
            }
        } else {
            return Err(connection_error
                .unwrap_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("unknown host: {}", endpoint.host()),
                    )
                })
                .into());
        }
    };
    configure_stream(settings, &stream)?;
    Ok(stream)
}

/// An asynchronous stream-socket client.
pub struct TcpClient {
    core: ClientCore,
}

impl TcpClient {
    pub fn new(
        settings: TcpSettings,
        endpoint: Endpoint,
        handler: Arc<dyn SessionHandler>,
    ) -> TcpClient {
        TcpClient {
            core: ClientCore::new(settings, endpoint, handler),
        }
    }

    /// Connect to the configured endpoint and start the session engine.
    /// The returned session is also reachable through
    /// [`session`](TcpClient::session) until the next reconnect.
    pub async fn connect(&self) -> Result<Arc<Session>, Error> {
        if self.core.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        let stream = connect_stream(&self.core.settings, &self.core.endpoint).await?;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;

        let session = Session::new(
            self.core.handler.clone(),
            Weak::new(),
            &self.core.settings,
            peer,
            local,
        );
        session.mark_handshaked();
        self.core.set_session(&session);
        debug!(session = %session.id(), %peer, "client connected");

        if !shielded(session.handler().on_connected(&session)).await {
            session.report_and_disconnect(Error::CallbackPanic).await;
            return Err(Error::CallbackPanic);
        }
        session.start(stream.into()).await;
        Ok(session)
    }

    /// Disconnect the current session, if any. Returns true only when a
    /// connected session was torn down by this call.
    pub async fn disconnect(&self) -> bool {
        self.core.disconnect().await
    }

    /// Disconnect (if connected) and connect again.
    pub async fn reconnect(&self) -> Result<Arc<Session>, Error> {
        self.core.disconnect().await;
        self.connect().await
    }

    /// Queue `data` on the current session's send pipeline.
    pub fn send_async(&self, data: impl AsRef<[u8]>) -> bool {
        self.core.send_async(data.as_ref())
    }

    /// Write `data` directly on the current session; see [`Session::send`].
    pub async fn send(&self, data: impl AsRef<[u8]>) -> Result<usize, Error> {
        self.core.send(data.as_ref()).await
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// The current (possibly already disconnected) session.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.core.session()
    }

    /// The connect target.
    pub fn endpoint(&self) -> &Endpoint {
        &self.core.endpoint
    }

    /// The local address of the current session.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.session().map(|session| session.local_addr())
    }
}
