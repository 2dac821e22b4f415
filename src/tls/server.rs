//! The TLS-wrapped server. Accepting, session registry, broadcast, and the
//! start/stop lifecycle are the TCP server's; the difference is the
//! handshake run between accept and the session pumps, driven by the
//! prepared [`TlsServerConfig`].

use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::handler::ServerHandler;
use crate::session::Session;
use crate::settings::TcpSettings;
use crate::tcp::server::{start_server, stop_server, ServerShared};
use crate::tls::TlsServerConfig;

/// An asynchronous stream-socket server whose sessions carry TLS.
///
/// Sessions fire `on_connected` when accepted, `on_handshaked` once the TLS
/// handshake completes, and only then start receiving; a failed handshake
/// surfaces `on_error(NotConnected)` and disconnects the session.
pub struct TlsServer {
    shared: Arc<ServerShared>,
    config: TlsServerConfig,
}

impl TlsServer {
    pub fn new(
        settings: TcpSettings,
        config: TlsServerConfig,
        handler: Arc<dyn ServerHandler>,
    ) -> TlsServer {
        TlsServer {
            shared: ServerShared::new(settings, handler),
            config,
        }
    }

    /// Bind to `endpoint` and begin accepting. Returns the bound address.
    pub async fn start(&self, endpoint: &Endpoint) -> Result<SocketAddr, Error> {
        start_server(&self.shared, endpoint, Some(self.config.acceptor())).await
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
        let local = start_server(&self.shared, &endpoint, Some(self.config.acceptor())).await?;
        self.shared.handler.on_restarted().await;
        Ok(local)
    }

    /// Queue `data` on every connected (and handshaked) session.
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

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent()
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received()
    }

    pub fn peak_sessions(&self) -> usize {
        self.shared.peak_sessions()
    }
}
