//! The outbound TLS client: TCP connect, then the client side of the
//! handshake against the configured server name, then the shared session
//! engine.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio_rustls::webpki::DNSNameRef;
use tracing::{debug, error};

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::handler::{shielded, SessionHandler};
use crate::session::Session;
use crate::settings::TcpSettings;
use crate::tcp::client::{connect_stream, ClientCore};
use crate::tls::TlsClientConfig;

/// An asynchronous stream-socket client whose connection carries TLS.
pub struct TlsClient {
    core: ClientCore,
    config: TlsClientConfig,
    server_name: String,
}

impl TlsClient {
    /// Build a client targeting `endpoint`, validating the server
    /// certificate against the endpoint's host name.
    pub fn new(
        settings: TcpSettings,
        endpoint: Endpoint,
        config: TlsClientConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> TlsClient {
        let server_name = endpoint.host().to_string();
        TlsClient {
            core: ClientCore::new(settings, endpoint, handler),
            config,
            server_name,
        }
    }

    /// Validate the server certificate against `name` instead of the
    /// endpoint host, for targets addressed by IP.
    pub fn server_name(mut self, name: impl Into<String>) -> TlsClient {
        self.server_name = name.into();
        self
    }

    /// Connect, handshake, and start the session engine. On a handshake
    /// failure the session observes `on_error(NotConnected)` followed by
    /// its disconnect callbacks, and the error is returned to the caller.
    pub async fn connect(&self) -> Result<Arc<Session>, Error> {
        if self.core.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        let domain = DNSNameRef::try_from_ascii_str(&self.server_name)
            .map_err(|_| Error::InvalidServerName(self.server_name.clone()))?;

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
        self.core.set_session(&session);
        debug!(session = %session.id(), %peer, "client connected, handshaking");

        if !shielded(session.handler().on_connected(&session)).await {
            session.report_and_disconnect(Error::CallbackPanic).await;
            return Err(Error::CallbackPanic);
        }
        if !shielded(session.handler().on_handshaking(&session)).await {
            session.report_and_disconnect(Error::CallbackPanic).await;
            return Err(Error::CallbackPanic);
        }

        match self.config.connector().connect(domain, stream).await {
            Ok(tls_stream) => {
                session.mark_handshaked();
                if !shielded(session.handler().on_handshaked(&session)).await {
                    session.report_and_disconnect(Error::CallbackPanic).await;
                    return Err(Error::CallbackPanic);
                }
                session.start(tls_stream.into()).await;
                Ok(session)
            }
            Err(handshake_error) => {
                error!("TLS handshake error [{}]: {}", peer, handshake_error);
                shielded(
                    session
                        .handler()
                        .on_error(&session, &Error::NotConnected),
                )
                .await;
                session.disconnect().await;
                Err(Error::Handshake(handshake_error))
            }
        }
    }

    /// Disconnect the current session, if any.
    pub async fn disconnect(&self) -> bool {
        self.core.disconnect().await
    }

    /// Disconnect (if connected) and connect again, handshake included.
    pub async fn reconnect(&self) -> Result<Arc<Session>, Error> {
        self.core.disconnect().await;
        self.connect().await
    }

    /// Queue `data` on the current session's send pipeline. Returns false
    /// until the handshake has completed.
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

    pub fn is_handshaked(&self) -> bool {
        self.core
            .session()
            .map(|session| session.is_handshaked())
            .unwrap_or(false)
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
