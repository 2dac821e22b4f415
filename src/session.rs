//! One established stream connection and the engine that drives it: a
//! continuous receive pump and a double-buffered, single-writer send
//! pipeline. The same type serves sessions accepted by a TCP or TLS server
//! and the connection held by a TCP or TLS client; only the handshake phase
//! differs between transports.

use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, error};
use uuid::Uuid;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::handler::{shielded, SessionHandler};
use crate::io_stream::IoStream;
use crate::settings::TcpSettings;
use crate::tcp::server::ServerShared;

/// The per-session send state. Writers append into `main`; the send pump
/// swaps `main` and `flush` when `flush` is drained and hands `flush` to the
/// socket. Every field here is guarded by the one send lock.
struct SendPipeline {
    main: Buffer,
    flush: Buffer,
    flush_offset: usize,
    bytes_pending: usize,
    bytes_sending: usize,
    /// True while exactly one socket write is outstanding.
    sending: bool,
    /// Set once `on_empty` has fired for the current idle episode, cleared
    /// by the next append.
    idle_reported: bool,
}

impl SendPipeline {
    fn new(capacity: usize) -> SendPipeline {
        SendPipeline {
            main: Buffer::with_capacity(capacity),
            flush: Buffer::with_capacity(capacity),
            flush_offset: 0,
            bytes_pending: 0,
            bytes_sending: 0,
            sending: false,
            idle_reported: false,
        }
    }

    fn clear(&mut self) {
        self.main.clear();
        self.flush.clear();
        self.flush_offset = 0;
        self.bytes_pending = 0;
        self.bytes_sending = 0;
    }
}

/// What the send pump should do next, decided under the send lock.
enum SendStep {
    /// Nothing queued; fire `on_empty` if true.
    Idle(bool),
    /// Write `buffer[offset..]` to the socket. The buffer is moved out of
    /// the pipeline for the duration of the write and restored by
    /// [`Session::finish_send`].
    Write(Buffer, usize),
}

/// One accepted or initiated connection.
///
/// Cheap to share: all methods take `&self` and the session is handed to
/// handlers as `Arc<Session>`. Dropping every clone after
/// [`disconnect`](Session::disconnect) releases the socket.
pub struct Session {
    id: Uuid,
    me: Weak<Session>,
    server: Weak<ServerShared>,
    handler: Arc<dyn SessionHandler>,
    peer: SocketAddr,
    local: SocketAddr,

    connected: AtomicBool,
    handshaked: AtomicBool,
    receiving: AtomicBool,

    pipeline: Mutex<SendPipeline>,
    writer: AsyncMutex<Option<WriteHalf<IoStream>>>,
    /// Wakes the send pump when an append finds the pipeline idle.
    wakeup: Notify,
    /// Broadcast once on disconnect; both pumps select against it.
    closing: Notify,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    receive_capacity: usize,
    receive_limit: usize,
    send_limit: usize,
}

impl Session {
    pub(crate) fn new(
        handler: Arc<dyn SessionHandler>,
        server: Weak<ServerShared>,
        settings: &TcpSettings,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Arc<Session> {
        let send_capacity = if settings.send_buffer_size > 0 {
            settings.send_buffer_size
        } else {
            8192
        };
        let receive_capacity = if settings.receive_buffer_size > 0 {
            settings.receive_buffer_size
        } else {
            8192
        };
        Arc::new_cyclic(|me| Session {
            id: Uuid::new_v4(),
            me: me.clone(),
            server,
            handler,
            peer,
            local,
            connected: AtomicBool::new(true),
            handshaked: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            pipeline: Mutex::new(SendPipeline::new(send_capacity)),
            writer: AsyncMutex::new(None),
            wakeup: Notify::new(),
            closing: Notify::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            receive_capacity,
            receive_limit: settings.receive_buffer_limit,
            send_limit: settings.send_buffer_limit,
        })
    }

    /// The registry key assigned at creation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Our side of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// For TLS sessions, true once the handshake completed; plain TCP
    /// sessions are handshaked from the start.
    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::SeqCst)
    }

    /// True while a read is outstanding.
    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// True while a socket write is outstanding.
    pub fn is_sending(&self) -> bool {
        self.pipeline.lock().unwrap().sending
    }

    /// Total bytes handed to the OS on this session.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes delivered to `on_received`.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Bytes appended but not yet handed to a socket write.
    pub fn bytes_pending(&self) -> usize {
        self.pipeline.lock().unwrap().bytes_pending
    }

    /// Bytes inside the write currently outstanding.
    pub fn bytes_sending(&self) -> usize {
        self.pipeline.lock().unwrap().bytes_sending
    }

    pub(crate) fn mark_handshaked(&self) {
        self.handshaked.store(true, Ordering::SeqCst);
    }

    pub(crate) fn handler(&self) -> &Arc<dyn SessionHandler> {
        &self.handler
    }

    /// The session as the `Arc` every callback receives. The weak self
    /// reference only dies with the last `Arc`, at which point no method
    /// can be running.
    fn me(&self) -> Option<Arc<Session>> {
        self.me.upgrade()
    }

    /// Wire the session to its transport and start both pumps. Called once,
    /// after `on_connected` (and for TLS, after the handshake).
    pub(crate) async fn start(&self, io: IoStream) {
        let me = match self.me() {
            Some(me) => me,
            None => return,
        };
        let (reader, writer) = tokio::io::split(io);
        *self.writer.lock().await = Some(writer);
        tokio::spawn(send_pump(me.clone()));
        tokio::spawn(receive_pump(me, reader));
    }

    /// Append to the buffered send pipeline. Returns false when the session
    /// is not connected (or not handshaked), or when the append would pass
    /// the configured send buffer limit.
    ///
    /// Appends from any one task reach the wire in order; appends racing
    /// across tasks keep byte-level FIFO but may interleave between calls.
    pub fn send_async(&self, data: impl AsRef<[u8]>) -> bool {
        let data = data.as_ref();
        if !self.is_connected() || !self.is_handshaked() {
            return false;
        }
        if data.is_empty() {
            return true;
        }

        let mut pipeline = self.pipeline.lock().unwrap();
        if self.send_limit > 0 && pipeline.main.len() + data.len() > self.send_limit {
            drop(pipeline);
            self.spawn_error(Error::SendBufferLimit {
                limit: self.send_limit,
            });
            return false;
        }
        pipeline.main.append(data);
        pipeline.bytes_pending = pipeline.main.len();
        pipeline.idle_reported = false;
        // If a write is in flight the completion path re-swaps on its own;
        // only an idle pipeline needs the pump woken.
        let schedule = !pipeline.sending && pipeline.flush.is_empty();
        drop(pipeline);

        if schedule {
            self.wakeup.notify_one();
        }
        true
    }

    /// Write directly to the socket from the caller's task, bypassing the
    /// buffered pipeline, and return once the OS accepted every byte.
    /// Rejected with [`Error::SendInProgress`] while the pipeline holds
    /// undelivered bytes, so direct and buffered sends never interleave.
    pub async fn send(&self, data: impl AsRef<[u8]>) -> Result<usize, Error> {
        let data = data.as_ref();
        if !self.is_connected() || !self.is_handshaked() {
            return Err(Error::NotConnected);
        }
        {
            let pipeline = self.pipeline.lock().unwrap();
            if pipeline.sending || !pipeline.flush.is_empty() || !pipeline.main.is_empty() {
                return Err(Error::SendInProgress);
            }
        }

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;
        writer.write_all(data).await?;
        self.credit_sent(data.len());
        Ok(data.len())
    }

    /// Tear the session down. Idempotent; returns true only on the call
    /// that observed the session still connected. Fires `on_disconnecting`
    /// and `on_disconnected` exactly once, then unregisters from the owning
    /// server (if any).
    pub async fn disconnect(&self) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        debug!(session = %self.id, peer = %self.peer, "session disconnecting");
        self.handshaked.store(false, Ordering::SeqCst);
        let me = self.me();

        if let Some(me) = &me {
            shielded(self.handler.on_disconnecting(me)).await;
        }

        // Both pumps observe this and wind down; the send pump shuts the
        // socket down on its way out.
        self.closing.notify_waiters();
        self.pipeline.lock().unwrap().clear();

        if let Some(me) = &me {
            shielded(self.handler.on_disconnected(me)).await;
        }

        if let Some(server) = self.server.upgrade() {
            server.unregister(self.id);
            if let Some(me) = &me {
                shielded(server.handler.on_disconnected(me)).await;
            }
        }
        debug!(session = %self.id, "session disconnected");
        true
    }

    /// Surface a fatal session error (unless it is an expected disconnect
    /// kind) and drive the disconnect.
    pub(crate) async fn report_and_disconnect(&self, error: Error) {
        if !error.is_disconnect() && self.is_connected() {
            error!(session = %self.id, %error, "session error");
            if let Some(me) = self.me() {
                shielded(self.handler.on_error(&me, &error)).await;
            }
        }
        self.disconnect().await;
    }

    /// Dispatch `on_error` from a context that cannot await.
    fn spawn_error(&self, error: Error) {
        if let Some(session) = self.me.upgrade() {
            tokio::spawn(async move {
                shielded(session.handler.on_error(&session, &error)).await;
            });
        }
    }

    /// A user callback panicked: contain, surface, disconnect.
    async fn callback_panicked(&self) {
        error!(session = %self.id, "user callback panicked; disconnecting");
        if let Some(me) = self.me() {
            shielded(self.handler.on_error(&me, &Error::CallbackPanic)).await;
        }
        self.disconnect().await;
    }

    fn credit_sent(&self, count: usize) {
        self.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
        if let Some(server) = self.server.upgrade() {
            server.credit_sent(count);
        }
    }

    fn credit_received(&self, count: usize) {
        self.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
        if let Some(server) = self.server.upgrade() {
            server.credit_received(count);
        }
    }

    /// Decide the pump's next move under the send lock: swap the buffers if
    /// the flush side is drained, then either hand out the flush buffer or
    /// report idleness.
    fn next_send_step(&self) -> SendStep {
        let mut pipeline = self.pipeline.lock().unwrap();
        let pipeline = &mut *pipeline;
        if pipeline.sending {
            return SendStep::Idle(false);
        }
        if pipeline.flush.is_empty() {
            mem::swap(&mut pipeline.main, &mut pipeline.flush);
            pipeline.flush_offset = 0;
            pipeline.bytes_sending = pipeline.flush.len();
            pipeline.bytes_pending = 0;
        }
        if pipeline.flush.is_empty() {
            if pipeline.idle_reported {
                SendStep::Idle(false)
            } else {
                pipeline.idle_reported = true;
                SendStep::Idle(true)
            }
        } else {
            pipeline.sending = true;
            let offset = pipeline.flush_offset;
            SendStep::Write(mem::take(&mut pipeline.flush), offset)
        }
    }

    /// Book a completed write and restore the flush buffer. Returns the
    /// bytes still queued after this write, or None when the session
    /// disconnected mid-write (the flush remnant is discarded).
    fn finish_send(&self, mut buffer: Buffer, count: usize) -> Option<usize> {
        self.credit_sent(count);
        let mut pipeline = self.pipeline.lock().unwrap();
        pipeline.sending = false;
        if !self.is_connected() {
            return None;
        }
        pipeline.flush_offset += count;
        pipeline.bytes_sending = pipeline.bytes_sending.saturating_sub(count);
        if pipeline.flush_offset == buffer.len() {
            buffer.clear();
            pipeline.flush_offset = 0;
        }
        pipeline.flush = buffer;
        Some(pipeline.bytes_pending + pipeline.bytes_sending)
    }

    /// Abandon a write that never completed.
    fn abort_send(&self) {
        self.pipeline.lock().unwrap().sending = false;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// The session's writer task: exactly one socket write outstanding at any
/// instant. Waits for an append, drains the pipeline through repeated
/// swap-and-write rounds, and on the way out shuts the socket down.
async fn send_pump(session: Arc<Session>) {
    let closing = session.closing.notified();
    tokio::pin!(closing);
    closing.as_mut().enable();

    'pump: loop {
        // Drain rounds: each completed write re-checks the pipeline, so
        // bytes appended mid-write are picked up without another wakeup.
        loop {
            if !session.is_connected() {
                break 'pump;
            }
            match session.next_send_step() {
                SendStep::Idle(report) => {
                    if report {
                        if !shielded(session.handler.on_empty(&session)).await {
                            session.callback_panicked().await;
                            break 'pump;
                        }
                    }
                    break;
                }
                SendStep::Write(buffer, offset) => {
                    let result = {
                        let mut writer = session.writer.lock().await;
                        let writer = match writer.as_mut() {
                            Some(writer) => writer,
                            None => break 'pump,
                        };
                        tokio::select! {
                            _ = closing.as_mut() => {
                                session.abort_send();
                                break 'pump;
                            }
                            result = writer.write(&buffer.as_slice()[offset..]) => result,
                        }
                    };
                    match result {
                        Ok(0) => {
                            session.abort_send();
                            session.disconnect().await;
                            break 'pump;
                        }
                        Ok(count) => {
                            let pending = match session.finish_send(buffer, count) {
                                Some(pending) => pending,
                                None => break 'pump,
                            };
                            if !shielded(session.handler.on_sent(&session, count, pending)).await
                            {
                                session.callback_panicked().await;
                                break 'pump;
                            }
                        }
                        Err(error) => {
                            session.abort_send();
                            session.report_and_disconnect(error.into()).await;
                            break 'pump;
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = closing.as_mut() => break 'pump,
            _ = session.wakeup.notified() => {}
        }
    }

    // Orderly shutdown: flush the TLS close-notify / send the FIN. The read
    // half is released by the receive pump.
    if let Some(mut writer) = session.writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }
}

/// The session's reader task: exactly one read outstanding while connected.
/// Each completion dispatches `on_received` and only then re-arms, so a slow
/// handler back-pressures the peer. A read that fills the buffer doubles it
/// (up to the configured limit) before the next arm.
async fn receive_pump(session: Arc<Session>, mut reader: ReadHalf<IoStream>) {
    let closing = session.closing.notified();
    tokio::pin!(closing);
    closing.as_mut().enable();

    let mut buffer = Buffer::with_capacity(session.receive_capacity);
    loop {
        if !session.is_connected() {
            break;
        }
        session.receiving.store(true, Ordering::SeqCst);
        let result = tokio::select! {
            _ = closing.as_mut() => {
                session.receiving.store(false, Ordering::SeqCst);
                break;
            }
            result = reader.read(buffer.space()) => result,
        };
        session.receiving.store(false, Ordering::SeqCst);

        match result {
            // Peer performed an orderly close.
            Ok(0) => {
                session.disconnect().await;
                break;
            }
            Ok(count) => {
                session.credit_received(count);
                let filled = count == buffer.capacity();
                let delivered = {
                    let data = &buffer.space()[..count];
                    shielded(session.handler.on_received(&session, data)).await
                };
                if !delivered {
                    session.callback_panicked().await;
                    break;
                }
                if filled {
                    let target = buffer.capacity() * 2;
                    if session.receive_limit == 0 || target <= session.receive_limit {
                        buffer.reserve(target);
                    } else if buffer.capacity() < session.receive_limit {
                        buffer.reserve(session.receive_limit);
                    }
                }
            }
            Err(error) => {
                session.report_and_disconnect(error.into()).await;
                break;
            }
        }
    }
}
