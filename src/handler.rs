//! The handler capability surface. User code observes endpoint lifecycles by
//! implementing these traits; every method has a no-op default so a handler
//! implements only what it cares about. Handlers are injected at endpoint
//! construction and shared as trait objects behind `Arc`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::FutureExt;
use std::panic::AssertUnwindSafe;

use crate::error::Error;
use crate::session::Session;
use crate::udp::UdpEndpoint;

/// Callbacks observed by one stream session (server-side or client-side).
///
/// Callback ordering per session: `on_connected` strictly first;
/// `on_handshaking`/`on_handshaked` (TLS only) before any data callback;
/// `on_received` deliveries in wire order; `on_disconnected` strictly last.
/// `on_connected`, `on_handshaked`, and `on_disconnected` each fire exactly
/// once. The receive pump does not re-arm until `on_received` returns, so a
/// slow handler back-pressures the peer.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_connected(&self, _session: &Arc<Session>) {}

    /// TLS only: the handshake is about to run.
    async fn on_handshaking(&self, _session: &Arc<Session>) {}

    /// TLS only: the handshake completed and the session may carry data.
    async fn on_handshaked(&self, _session: &Arc<Session>) {}

    /// A read completed; `data` is valid only for the duration of the call.
    async fn on_received(&self, _session: &Arc<Session>, _data: &[u8]) {}

    /// A buffered write completed. `sent` is the size of the completed
    /// write; `pending` is what remains queued (still unsent plus mid-send).
    async fn on_sent(&self, _session: &Arc<Session>, _sent: usize, _pending: usize) {}

    /// The send pipeline just drained.
    async fn on_empty(&self, _session: &Arc<Session>) {}

    async fn on_disconnecting(&self, _session: &Arc<Session>) {}

    async fn on_disconnected(&self, _session: &Arc<Session>) {}

    /// A surfaced error. Expected disconnect kinds never reach this method;
    /// see [`Error::is_disconnect`].
    async fn on_error(&self, _session: &Arc<Session>, _error: &Error) {}
}

/// Callbacks observed by a TCP or TLS server, plus the session factory.
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// Produce the handler for a freshly accepted session. The default
    /// session ignores everything.
    fn create_session(&self) -> Arc<dyn SessionHandler> {
        Arc::new(NullHandler)
    }

    async fn on_started(&self) {}

    async fn on_stopping(&self) {}

    async fn on_stopped(&self) {}

    async fn on_restarted(&self) {}

    /// A connection was accepted and is about to be wired up.
    async fn on_connecting(&self, _session: &Arc<Session>) {}

    async fn on_connected(&self, _session: &Arc<Session>) {}

    async fn on_disconnected(&self, _session: &Arc<Session>) {}

    /// A listener-level error. The accept loop re-arms afterwards.
    async fn on_error(&self, _error: &Error) {}
}

/// Callbacks observed by a datagram endpoint.
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_started(&self, _endpoint: &Arc<UdpEndpoint>) {}

    async fn on_stopping(&self, _endpoint: &Arc<UdpEndpoint>) {}

    async fn on_stopped(&self, _endpoint: &Arc<UdpEndpoint>) {}

    async fn on_restarted(&self, _endpoint: &Arc<UdpEndpoint>) {}

    /// The single armed receive completed. The endpoint does not re-arm on
    /// its own; call `receive_async` again from here for a continuous flow.
    async fn on_received(&self, _endpoint: &Arc<UdpEndpoint>, _peer: SocketAddr, _data: &[u8]) {}

    /// The single armed send completed.
    async fn on_sent(&self, _endpoint: &Arc<UdpEndpoint>, _peer: SocketAddr, _sent: usize) {}

    async fn on_error(&self, _endpoint: &Arc<UdpEndpoint>, _error: &Error) {}
}

/// A handler that observes nothing. The default session factory returns one.
pub struct NullHandler;

impl SessionHandler for NullHandler {}
impl ServerHandler for NullHandler {}
impl DatagramHandler for NullHandler {}

/// Run one handler callback, containing any panic at the dispatch boundary.
/// Returns false if the callback panicked; callers treat that as a fatal
/// session error.
pub(crate) async fn shielded<F>(callback: F) -> bool
where
    F: std::future::Future<Output = ()>,
{
    AssertUnwindSafe(callback).catch_unwind().await.is_ok()
}
