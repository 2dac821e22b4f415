//! Stream endpoints wrapped in a TLS session, and the prepared
//! configuration objects handed to them. Certificate policy lives entirely
//! in these configs; the server and client only run the handshake and then
//! drive the same session engine as their plain-TCP counterparts.

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::{TlsAcceptor, TlsConnector};

pub use tokio_rustls::rustls;

use tokio_rustls::rustls::{
    Certificate, PrivateKey, ProtocolVersion, RootCertStore, ServerCertVerifier,
};

use crate::error::Error;

pub mod client;
pub mod pem;
pub mod server;

pub use client::TlsClient;
pub use server::TlsServer;

/// A prepared server-side TLS configuration: certificate chain, private
/// key, allowed protocol versions, and whether clients must present a
/// certificate. Cheap to clone and shared by every session of a server.
#[derive(Clone)]
pub struct TlsServerConfig {
    config: Arc<rustls::ServerConfig>,
}

impl TlsServerConfig {
    /// A server configuration that accepts any client (no client
    /// certificate required).
    pub fn new(
        certificate_chain: Vec<Certificate>,
        private_key: PrivateKey,
    ) -> Result<TlsServerConfig, Error> {
        let mut config = rustls::ServerConfig::new(rustls::NoClientAuth::new());
        config
            .set_single_cert(certificate_chain, private_key)
            .map_err(|error| Error::InvalidTlsMaterial(error.to_string()))?;
        Ok(TlsServerConfig {
            config: Arc::new(config),
        })
    }

    /// A server configuration that requires clients to present a
    /// certificate chaining to one of `client_roots`.
    pub fn with_client_auth(
        certificate_chain: Vec<Certificate>,
        private_key: PrivateKey,
        client_roots: RootCertStore,
    ) -> Result<TlsServerConfig, Error> {
        let verifier = rustls::AllowAnyAuthenticatedClient::new(client_roots);
        let mut config = rustls::ServerConfig::new(verifier);
        config
            .set_single_cert(certificate_chain, private_key)
            .map_err(|error| Error::InvalidTlsMaterial(error.to_string()))?;
        Ok(TlsServerConfig {
            config: Arc::new(config),
        })
    }

    /// Load the certificate chain and private key from PEM files.
    pub fn from_pem_files(
        certificate_chain: impl AsRef<Path>,
        private_key: impl AsRef<Path>,
    ) -> Result<TlsServerConfig, Error> {
        TlsServerConfig::new(
            pem::read_certificates(certificate_chain)?,
            pem::read_private_key(private_key)?,
        )
    }

    /// Restrict the protocol versions offered during the handshake.
    pub fn protocol_versions(mut self, versions: &[ProtocolVersion]) -> TlsServerConfig {
        let mut config = (*self.config).clone();
        config.versions = versions.to_vec();
        self.config = Arc::new(config);
        self
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }
}

impl From<Arc<rustls::ServerConfig>> for TlsServerConfig {
    fn from(config: Arc<rustls::ServerConfig>) -> TlsServerConfig {
        TlsServerConfig { config }
    }
}

impl From<rustls::ServerConfig> for TlsServerConfig {
    fn from(config: rustls::ServerConfig) -> TlsServerConfig {
        TlsServerConfig {
            config: Arc::new(config),
        }
    }
}

/// A prepared client-side TLS configuration: trust anchors, an optional
/// client certificate, allowed protocol versions, and an optional peer
/// validation override.
#[derive(Clone)]
pub struct TlsClientConfig {
    config: Arc<rustls::ClientConfig>,
}

impl TlsClientConfig {
    /// A client configuration trusting the bundled web PKI roots.
    pub fn new() -> TlsClientConfig {
        let mut config = rustls::ClientConfig::new();
        config
            .root_store
            .add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);
        TlsClientConfig {
            config: Arc::new(config),
        }
    }

    /// A client configuration trusting exactly `roots`.
    pub fn with_roots(roots: RootCertStore) -> TlsClientConfig {
        let mut config = rustls::ClientConfig::new();
        config.root_store = roots;
        TlsClientConfig {
            config: Arc::new(config),
        }
    }

    /// Additionally trust the single PEM certificate at `path`, typically a
    /// private CA.
    pub fn trust_certificate_file(self, path: impl AsRef<Path>) -> Result<TlsClientConfig, Error> {
        let certificate = pem::read_single_certificate(path)?;
        self.try_edit(|config| {
            config
                .root_store
                .add(&certificate)
                .map_err(|error| Error::InvalidTlsMaterial(error.to_string()))
        })
    }

    /// Present `certificate_chain` when the server asks for client
    /// authentication.
    pub fn client_certificate(
        self,
        certificate_chain: Vec<Certificate>,
        private_key: PrivateKey,
    ) -> Result<TlsClientConfig, Error> {
        self.try_edit(|config| {
            config
                .set_single_client_cert(certificate_chain, private_key)
                .map_err(|error| Error::InvalidTlsMaterial(error.to_string()))
        })
    }

    /// Restrict the protocol versions offered during the handshake.
    pub fn protocol_versions(self, versions: &[ProtocolVersion]) -> TlsClientConfig {
        self.edit(|config| config.versions = versions.to_vec())
    }

    /// Replace certificate validation with `verifier`. This discards the
    /// web PKI checks; only use verifiers that implement a comparable
    /// policy.
    pub fn peer_verifier(self, verifier: Arc<dyn ServerCertVerifier>) -> TlsClientConfig {
        self.edit(|config| {
            config.dangerous().set_certificate_verifier(verifier);
        })
    }

    fn edit(self, edit: impl FnOnce(&mut rustls::ClientConfig)) -> TlsClientConfig {
        let mut config = (*self.config).clone();
        edit(&mut config);
        TlsClientConfig {
            config: Arc::new(config),
        }
    }

    fn try_edit(
        self,
        edit: impl FnOnce(&mut rustls::ClientConfig) -> Result<(), Error>,
    ) -> Result<TlsClientConfig, Error> {
        let mut config = (*self.config).clone();
        edit(&mut config)?;
        Ok(TlsClientConfig {
            config: Arc::new(config),
        })
    }

    pub(crate) fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }
}

impl Default for TlsClientConfig {
    fn default() -> TlsClientConfig {
        TlsClientConfig::new()
    }
}

impl From<Arc<rustls::ClientConfig>> for TlsClientConfig {
    fn from(config: Arc<rustls::ClientConfig>) -> TlsClientConfig {
        TlsClientConfig { config }
    }
}

impl From<rustls::ClientConfig> for TlsClientConfig {
    fn from(config: rustls::ClientConfig) -> TlsClientConfig {
        TlsClientConfig {
            config: Arc::new(config),
        }
    }
}
