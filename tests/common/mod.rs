//! Shared scaffolding for the end-to-end tests: recording handlers that
//! capture every callback in order, and helpers for waiting on conditions
//! and loading the test certificates.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use hawser::{DatagramHandler, Error, ServerHandler, Session, SessionHandler, UdpEndpoint};

/// How a recording session handler reacts to received data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    /// Record only.
    Passive,
    /// Echo every payload back on the same session.
    Echo,
    /// Echo, but disconnect from inside `on_received` when the payload is
    /// the single byte `!`.
    SentinelDisconnect,
}

/// Every observable callback, in dispatch order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Handshaking,
    Handshaked,
    Received(Vec<u8>),
    Sent { sent: usize, pending: usize },
    Empty,
    Disconnecting,
    Disconnected,
    Error(String),
}

/// A session handler that records callbacks and optionally echoes.
pub struct Recorder {
    mode: Mode,
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new(mode: Mode) -> Arc<Recorder> {
        Arc::new(Recorder {
            mode,
            events: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// All payloads delivered to `on_received`, concatenated.
    pub fn received_bytes(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Received(data) => Some(data),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn contains(&self, event: &Event) -> bool {
        self.events().contains(event)
    }

    /// Wait until the recorded events satisfy `predicate`, panicking with
    /// the event log after five seconds.
    pub async fn wait_for<F>(&self, description: &str, predicate: F)
    where
        F: Fn(&[Event]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let events = self.events();
            if predicate(&events) {
                return;
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for {}; saw {:?}", description, events);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_event(&self, event: Event) {
        self.wait_for(&format!("{:?}", event), |events| events.contains(&event))
            .await;
    }

    /// Wait until the concatenated received payloads equal `expected`.
    pub async fn wait_for_bytes(&self, expected: &[u8]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let received = self.received_bytes();
            if received == expected {
                return;
            }
            if Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {} bytes; received {} bytes",
                    expected.len(),
                    received.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl SessionHandler for Recorder {
    async fn on_connected(&self, _session: &Arc<Session>) {
        self.push(Event::Connected);
    }

    async fn on_handshaking(&self, _session: &Arc<Session>) {
        self.push(Event::Handshaking);
    }

    async fn on_handshaked(&self, _session: &Arc<Session>) {
        self.push(Event::Handshaked);
    }

    async fn on_received(&self, session: &Arc<Session>, data: &[u8]) {
        self.push(Event::Received(data.to_vec()));
        match self.mode {
            Mode::Passive => {}
            Mode::Echo => {
                session.send_async(data);
            }
            Mode::SentinelDisconnect => {
                if data == b"!" {
                    session.disconnect().await;
                } else {
                    session.send_async(data);
                }
            }
        }
    }

    async fn on_sent(&self, _session: &Arc<Session>, sent: usize, pending: usize) {
        self.push(Event::Sent { sent, pending });
    }

    async fn on_empty(&self, _session: &Arc<Session>) {
        self.push(Event::Empty);
    }

    async fn on_disconnecting(&self, _session: &Arc<Session>) {
        self.push(Event::Disconnecting);
    }

    async fn on_disconnected(&self, _session: &Arc<Session>) {
        self.push(Event::Disconnected);
    }

    async fn on_error(&self, _session: &Arc<Session>, error: &Error) {
        self.push(Event::Error(format!("{:?}", error)));
    }
}

/// A server handler that hands every accepted session a fresh [`Recorder`]
/// and keeps hold of both the recorders and the session objects.
pub struct RecordingServer {
    mode: Mode,
    pub session_recorders: Mutex<Vec<Arc<Recorder>>>,
    pub sessions: Mutex<Vec<Arc<Session>>>,
}

impl RecordingServer {
    pub fn new(mode: Mode) -> Arc<RecordingServer> {
        Arc::new(RecordingServer {
            mode,
            session_recorders: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn recorder(&self, index: usize) -> Arc<Recorder> {
        self.session_recorders.lock().unwrap()[index].clone()
    }

    pub fn session(&self, index: usize) -> Arc<Session> {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub async fn wait_for_sessions(&self, count: usize) {
        wait_until("accepted session count", || {
            self.sessions.lock().unwrap().len() >= count
        })
        .await;
    }
}

#[async_trait]
impl ServerHandler for RecordingServer {
    fn create_session(&self) -> Arc<dyn SessionHandler> {
        let recorder = Recorder::new(self.mode);
        self.session_recorders.lock().unwrap().push(recorder.clone());
        recorder
    }

    async fn on_connected(&self, session: &Arc<Session>) {
        self.sessions.lock().unwrap().push(session.clone());
    }
}

/// A datagram handler that records receipts and optionally echoes each
/// datagram back to its sender, re-arming the receive either way.
pub struct DatagramRecorder {
    echo: bool,
    pub received: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    pub sent: Mutex<Vec<(SocketAddr, usize)>>,
    pub errors: Mutex<Vec<String>>,
}

impl DatagramRecorder {
    pub fn new(echo: bool) -> Arc<DatagramRecorder> {
        Arc::new(DatagramRecorder {
            echo,
            received: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub async fn wait_for_datagram(&self, expected: &[u8]) -> SocketAddr {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some((peer, _)) = self
                .received
                .lock()
                .unwrap()
                .iter()
                .find(|(_, data)| data == expected)
            {
                return *peer;
            }
            if Instant::now() >= deadline {
                panic!(
                    "timed out waiting for datagram {:?}; saw {:?}",
                    expected,
                    self.received.lock().unwrap()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl DatagramHandler for DatagramRecorder {
    async fn on_received(&self, endpoint: &Arc<UdpEndpoint>, peer: SocketAddr, data: &[u8]) {
        self.received.lock().unwrap().push((peer, data.to_vec()));
        if self.echo {
            endpoint.send_async(peer, data);
        } else {
            endpoint.receive_async();
        }
    }

    async fn on_sent(&self, endpoint: &Arc<UdpEndpoint>, peer: SocketAddr, sent: usize) {
        self.sent.lock().unwrap().push((peer, sent));
        // Echoing endpoints go straight back to listening.
        if self.echo {
            endpoint.receive_async();
        }
    }

    async fn on_error(&self, _endpoint: &Arc<UdpEndpoint>, error: &Error) {
        self.errors.lock().unwrap().push(format!("{:?}", error));
    }
}

/// Install a subscriber so `RUST_LOG=hawser=debug cargo test` shows the
/// crate's tracing output. Safe to call from every test; only the first
/// call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Poll `condition` every 10ms until it holds, panicking after five
/// seconds.
pub async fn wait_until<F>(description: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", description);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn certs_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/certs")
}

pub fn ca_cert_path() -> PathBuf {
    certs_dir().join("ca-cert.pem")
}

pub fn server_cert_path() -> PathBuf {
    certs_dir().join("server-cert.pem")
}

pub fn server_key_path() -> PathBuf {
    certs_dir().join("server-key.pem")
}

pub fn client_cert_path() -> PathBuf {
    certs_dir().join("client-cert.pem")
}

pub fn client_key_path() -> PathBuf {
    certs_dir().join("client-key.pem")
}
