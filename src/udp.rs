//! The datagram endpoint: one socket, one armed receive, one armed send.
//! Datagram traffic is request/response shaped, so completions do not
//! re-arm on their own; handlers call `receive_async` again when they want
//! the next datagram. Multicast here is the network-layer kind: group
//! membership plus TTL/loopback options, with the bound group doubling as
//! the default send target.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{error, info};

use crate::buffer::Buffer;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::handler::{shielded, DatagramHandler};
use crate::settings::UdpSettings;

/// What the endpoint was bound to, kept for `restart`.
#[derive(Clone)]
enum Binding {
    Plain(Endpoint),
    Multicast(Endpoint),
}

/// A datagram endpoint usable as either side of a UDP exchange.
pub struct UdpEndpoint {
    me: Weak<UdpEndpoint>,
    settings: UdpSettings,
    handler: Arc<dyn DatagramHandler>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    started: AtomicBool,
    receiving: AtomicBool,
    sending: AtomicBool,
    closing: Notify,
    binding: Mutex<Option<Binding>>,
    local_addr: Mutex<Option<SocketAddr>>,
    multicast_group: Mutex<Option<SocketAddr>>,
    /// The single receive slot; held by the armed receive for its duration.
    receive_slot: AsyncMutex<Buffer>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
}

impl UdpEndpoint {
    pub fn new(settings: UdpSettings, handler: Arc<dyn DatagramHandler>) -> Arc<UdpEndpoint> {
        let capacity = if settings.receive_buffer_size > 0 {
            settings.receive_buffer_size
        } else {
            8192
        };
        Arc::new_cyclic(|me| UdpEndpoint {
            me: me.clone(),
            settings,
            handler,
            socket: Mutex::new(None),
            started: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            closing: Notify::new(),
            binding: Mutex::new(None),
            local_addr: Mutex::new(None),
            multicast_group: Mutex::new(None),
            receive_slot: AsyncMutex::new(Buffer::with_capacity(capacity)),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
        })
    }

    /// Bind to `endpoint` and, when the multicast option is on, apply the
    /// multicast sender options. Returns the bound address.
    pub async fn start(&self, endpoint: &Endpoint) -> Result<SocketAddr, Error> {
        self.start_bound(Binding::Plain(endpoint.clone())).await
    }

    /// Bind to `group`'s port on the wildcard address and join the group,
    /// making the endpoint a member of (and default sender to) that group.
    pub async fn start_multicast(&self, group: &Endpoint) -> Result<SocketAddr, Error> {
        self.start_bound(Binding::Multicast(group.clone())).await
    }

    /// The endpoint as the `Arc` every callback receives.
    fn me(&self) -> Option<Arc<UdpEndpoint>> {
        self.me.upgrade()
    }

    async fn start_bound(&self, binding: Binding) -> Result<SocketAddr, Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let bound = self.bind(&binding).await;
        let local = match bound {
            Ok(local) => local,
            Err(error) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(error);
            }
        };
        *self.binding.lock().unwrap() = Some(binding);
        *self.local_addr.lock().unwrap() = Some(local);
        info!("datagram endpoint bound to {}", local);
        if let Some(me) = self.me() {
            self.handler.on_started(&me).await;
        }
        Ok(local)
    }

    async fn bind(&self, binding: &Binding) -> Result<SocketAddr, Error> {
        let (bind_addr, group) = match binding {
            Binding::Plain(endpoint) => (endpoint.resolve_one().await?, None),
            Binding::Multicast(endpoint) => {
                let group_ip = endpoint.ip().filter(|ip| ip.is_multicast()).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("not a multicast group address: {}", endpoint.host()),
                    )
                })?;
                let wildcard: IpAddr = match group_ip {
                    IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
                    IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
                };
                (
                    SocketAddr::new(wildcard, endpoint.port()),
                    Some(SocketAddr::new(group_ip, endpoint.port())),
                )
            }
        };

        let socket = bind_socket(&self.settings, bind_addr)?;
        let socket = UdpSocket::from_std(socket)?;
        let local = socket.local_addr()?;

        if let Some(group) = group {
            match group.ip() {
                IpAddr::V4(v4) => socket.join_multicast_v4(v4, Ipv4Addr::UNSPECIFIED)?,
                IpAddr::V6(v6) => socket.join_multicast_v6(&v6, 0)?,
            }
        }
        if self.settings.multicast || group.is_some() {
            apply_multicast_options(&socket, &self.settings, bind_addr.is_ipv4())?;
        }

        *self.multicast_group.lock().unwrap() = group;
        *self.socket.lock().unwrap() = Some(Arc::new(socket));
        Ok(local)
    }

    /// Drop the socket and cancel the armed receive and send. Returns false
    /// if the endpoint was not started.
    pub async fn stop(&self) -> bool {
        if !self.started.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(me) = self.me() {
            self.handler.on_stopping(&me).await;
        }
        self.closing.notify_waiters();
        *self.socket.lock().unwrap() = None;
        *self.local_addr.lock().unwrap() = None;
        *self.multicast_group.lock().unwrap() = None;
        info!("datagram endpoint stopped");
        if let Some(me) = self.me() {
            self.handler.on_stopped(&me).await;
        }
        true
    }

    /// Stop and bind again the same way.
    pub async fn restart(&self) -> Result<SocketAddr, Error> {
        let binding = self
            .binding
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotStarted)?;
        self.stop().await;
        let local = self.start_bound(binding).await?;
        if let Some(me) = self.me() {
            self.handler.on_restarted(&me).await;
        }
        Ok(local)
    }

    /// Arm the single receive. Returns false when the endpoint is stopped
    /// or a receive is already outstanding. The completion fires
    /// `on_received` with the sender's address and does not re-arm.
    pub fn receive_async(&self) -> bool {
        if !self.is_started() || self.receiving.swap(true, Ordering::SeqCst) {
            return false;
        }
        let (socket, endpoint) = match (self.socket(), self.me()) {
            (Some(socket), Some(me)) => (socket, me),
            _ => {
                self.receiving.store(false, Ordering::SeqCst);
                return false;
            }
        };
        tokio::spawn(async move {
            let closing = endpoint.closing.notified();
            tokio::pin!(closing);
            closing.as_mut().enable();
            if !endpoint.is_started() {
                endpoint.receiving.store(false, Ordering::SeqCst);
                return;
            }

            let mut buffer = endpoint.receive_slot.lock().await;
            let result = tokio::select! {
                _ = closing.as_mut() => {
                    endpoint.receiving.store(false, Ordering::SeqCst);
                    return;
                }
                result = socket.recv_from(buffer.space()) => result,
            };
            endpoint.receiving.store(false, Ordering::SeqCst);

            match result {
                Ok((count, peer)) => {
                    endpoint.datagrams_received.fetch_add(1, Ordering::Relaxed);
                    endpoint
                        .bytes_received
                        .fetch_add(count as u64, Ordering::Relaxed);
                    let filled = count == buffer.capacity();
                    let delivered = {
                        let data = &buffer.space()[..count];
                        shielded(endpoint.handler.on_received(&endpoint, peer, data)).await
                    };
                    if !delivered {
                        error!("datagram receive callback panicked");
                        shielded(endpoint.handler.on_error(&endpoint, &Error::CallbackPanic))
                            .await;
                    }
                    // A datagram that filled the slot was likely truncated;
                    // give the next one more room.
                    if filled {
                        let target = buffer.capacity() * 2;
                        let limit = endpoint.settings.receive_buffer_limit;
                        if limit == 0 || target <= limit {
                            buffer.reserve(target);
                        } else if buffer.capacity() < limit {
                            buffer.reserve(limit);
                        }
                    }
                }
                Err(error) => endpoint.report(error.into()).await,
            }
        });
        true
    }

    /// Arm the single send of `data` to `peer`. Returns false when the
    /// endpoint is stopped or a send is already outstanding. The completion
    /// fires `on_sent`.
    pub fn send_async(&self, peer: SocketAddr, data: impl AsRef<[u8]>) -> bool {
        if !self.is_started() || self.sending.swap(true, Ordering::SeqCst) {
            return false;
        }
        let (socket, endpoint) = match (self.socket(), self.me()) {
            (Some(socket), Some(me)) => (socket, me),
            _ => {
                self.sending.store(false, Ordering::SeqCst);
                return false;
            }
        };

        let payload = data.as_ref().to_vec();
        tokio::spawn(async move {
            let closing = endpoint.closing.notified();
            tokio::pin!(closing);
            closing.as_mut().enable();
            if !endpoint.is_started() {
                endpoint.sending.store(false, Ordering::SeqCst);
                return;
            }

            let result = tokio::select! {
                _ = closing.as_mut() => {
                    endpoint.sending.store(false, Ordering::SeqCst);
                    return;
                }
                result = socket.send_to(&payload, peer) => result,
            };
            endpoint.sending.store(false, Ordering::SeqCst);

            match result {
                Ok(count) => {
                    endpoint.credit_sent(count);
                    shielded(endpoint.handler.on_sent(&endpoint, peer, count)).await;
                }
                Err(error) => endpoint.report(error.into()).await,
            }
        });
        true
    }

    /// Send `data` to `peer` from the caller's task, returning the count
    /// the OS accepted. Errors propagate to the caller.
    pub async fn send(&self, peer: SocketAddr, data: impl AsRef<[u8]>) -> Result<usize, Error> {
        let socket = self.socket().ok_or(Error::NotStarted)?;
        let count = socket.send_to(data.as_ref(), peer).await?;
        self.credit_sent(count);
        Ok(count)
    }

    /// Queue a send to the bound multicast group. Returns false when the
    /// endpoint was not started with [`start_multicast`](UdpEndpoint::start_multicast).
    pub fn multicast_async(&self, data: impl AsRef<[u8]>) -> bool {
        match self.multicast_group() {
            Some(group) => self.send_async(group, data),
            None => false,
        }
    }

    /// Send directly to the bound multicast group.
    pub async fn multicast(&self, data: impl AsRef<[u8]>) -> Result<usize, Error> {
        let group = self.multicast_group().ok_or(Error::NotStarted)?;
        self.send(group, data).await
    }

    /// Join `group` on the bound socket.
    pub fn join_multicast_group(&self, group: IpAddr) -> Result<(), Error> {
        let socket = self.socket().ok_or(Error::NotStarted)?;
        match group {
            IpAddr::V4(v4) => socket.join_multicast_v4(v4, Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(v6) => socket.join_multicast_v6(&v6, 0)?,
        }
        Ok(())
    }

    /// Leave `group` on the bound socket.
    pub fn leave_multicast_group(&self, group: IpAddr) -> Result<(), Error> {
        let socket = self.socket().ok_or(Error::NotStarted)?;
        match group {
            IpAddr::V4(v4) => socket.leave_multicast_v4(v4, Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(v6) => socket.leave_multicast_v6(&v6, 0)?,
        }
        Ok(())
    }

    /// Apply (or reset) the multicast sender options on the bound socket.
    pub fn setup_multicast(&self, enabled: bool) -> Result<(), Error> {
        let socket = self.socket().ok_or(Error::NotStarted)?;
        let v4 = self
            .local_addr()
            .map(|addr| addr.is_ipv4())
            .unwrap_or(true);
        if enabled {
            apply_multicast_options(&socket, &self.settings, v4)?;
        } else if v4 {
            socket.set_multicast_ttl_v4(1)?;
            socket.set_multicast_loop_v4(true)?;
        } else {
            socket.set_multicast_loop_v6(true)?;
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// True while a receive is armed.
    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// True while a send is armed.
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// The group bound by `start_multicast`, if any.
    pub fn multicast_group(&self) -> Option<SocketAddr> {
        *self.multicast_group.lock().unwrap()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent.load(Ordering::Relaxed)
    }

    pub fn datagrams_received(&self) -> u64 {
        self.datagrams_received.load(Ordering::Relaxed)
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap().clone()
    }

    fn credit_sent(&self, count: usize) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    async fn report(&self, error: Error) {
        if error.is_disconnect() {
            return;
        }
        error!(%error, "datagram endpoint error");
        if let Some(me) = self.me() {
            shielded(self.handler.on_error(&me, &error)).await;
        }
    }
}

fn bind_socket(settings: &UdpSettings, addr: SocketAddr) -> Result<std::net::UdpSocket, Error> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if settings.reuse_address {
        socket.set_reuse_address(true)?;
    }
    if settings.receive_buffer_size > 0 {
        socket.set_recv_buffer_size(settings.receive_buffer_size)?;
    }
    if settings.send_buffer_size > 0 {
        socket.set_send_buffer_size(settings.send_buffer_size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn apply_multicast_options(
    socket: &UdpSocket,
    settings: &UdpSettings,
    v4: bool,
) -> Result<(), io::Error> {
    if v4 {
        socket.set_multicast_ttl_v4(settings.multicast_ttl)?;
        socket.set_multicast_loop_v4(settings.multicast_loopback)?;
    } else {
        socket.set_multicast_loop_v6(settings.multicast_loopback)?;
    }
    Ok(())
}
