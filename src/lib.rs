//! Asynchronous socket endpoints over three transports: plain TCP streams,
//! TLS-wrapped streams, and UDP datagrams (multicast included).
//!
//! The crate's core is the session engine in [`session`]: a continuous
//! receive pump and a double-buffered send pipeline with at most one socket
//! write outstanding per connection. Servers add an accept loop, a session
//! registry, and broadcast on top of it; clients add connect/reconnect; the
//! datagram endpoint keeps one armed receive and one armed send. User code
//! observes everything through the handler traits in [`handler`], whose
//! methods all default to no-ops.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hawser::{Endpoint, ServerHandler, Session, SessionHandler, TcpServer, TcpSettings};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl SessionHandler for Echo {
//!     async fn on_received(&self, session: &Arc<Session>, data: &[u8]) {
//!         session.send_async(data);
//!     }
//! }
//!
//! struct EchoServer;
//!
//! impl ServerHandler for EchoServer {
//!     fn create_session(&self) -> Arc<dyn SessionHandler> {
//!         Arc::new(Echo)
//!     }
//! }
//!
//! # async fn run() -> Result<(), hawser::Error> {
//! let server = TcpServer::new(TcpSettings::default(), Arc::new(EchoServer));
//! server.start(&Endpoint::new("0.0.0.0", 1111)).await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod session;
pub mod settings;
pub mod tcp;
pub mod tls;
pub mod udp;

mod io_stream;

pub use buffer::Buffer;
pub use endpoint::Endpoint;
pub use error::Error;
pub use handler::{DatagramHandler, NullHandler, ServerHandler, SessionHandler};
pub use session::Session;
pub use settings::{TcpSettings, UdpSettings};
pub use tcp::{TcpClient, TcpServer};
pub use tls::{TlsClient, TlsClientConfig, TlsServer, TlsServerConfig};
pub use udp::UdpEndpoint;
