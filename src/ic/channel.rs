//! The IC channel state machine and event loop (spec.md §4.5): `INIT →
//! CONNECTING → VERSION-WAIT → [TLS-HANDSHAKE] → READY → CLOSING →
//! WIPED`, with `ACCEPTED` entering at `VERSION-WAIT` for network
//! transports or straight to `READY` for Unix sockets (no version
//! exchange on Unix, spec.md §4.4).
//!
//! A channel owns a [`SendQueue`], a [`PendingTable`] and a [`TimerSet`]
//! but drives none of them concurrently with its own I/O: this is a
//! single-threaded cooperative loop per channel (spec.md §5), so
//! [`IcChannel::drive_once`] drains whatever is queued to send, then
//! waits for either the next inbound frame or the next timer deadline,
//! whichever comes first. A design that split reads and writes across
//! two tasks could overlap them, but nothing in the state machine
//! requires that, and keeping both on one `&mut self` avoids a second
//! synchronization layer between the queue/table/timer trio and the
//! socket.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, ToSocketAddrs, UnixStream};
use tracing::{debug, warn};

use crate::error::{IcError, IcStatus};
use crate::ic::frame::{
    decode_command, encode_command, Command, FrameHeader, Flags, Priority, SlotIdGenerator,
    StreamControl, HEADER_LEN,
};
use crate::ic::msg::{Continuation, OutMsg};
use crate::ic::pending::PendingTable;
use crate::ic::queue::SendQueue;
use crate::ic::timers::{watchdog_deadlines, TimerHandle, TimerKind, TimerSet};

/// Channel lifecycle states (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Connecting,
    VersionWait,
    TlsHandshake,
    Ready,
    Closing,
    Wiped,
}

/// How (and whether) a channel negotiates TLS during `[TLS-HANDSHAKE]`.
#[derive(Clone)]
pub enum TlsMode {
    Disabled,
    Client {
        connector: tokio_rustls::TlsConnector,
        server_name: rustls_pki_types::ServerName<'static>,
    },
    Server {
        acceptor: tokio_rustls::TlsAcceptor,
    },
}

/// Per-channel tunables (spec.md §4.5.3). Grounded in the shape of the
/// teacher's `TransportConfig`: a plain, `Clone`-able settings struct
/// passed in at construction rather than threaded argument-by-argument.
#[derive(Clone)]
pub struct ChannelConfig {
    pub version: u16,
    pub want_tls: bool,
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
    pub auto_reconn: bool,
    pub retry_delay: Duration,
    pub tls: TlsMode,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            version: 1,
            want_tls: false,
            soft_timeout: Duration::from_secs(30),
            hard_timeout: Duration::from_secs(90),
            auto_reconn: false,
            retry_delay: Duration::from_secs(1),
            tls: TlsMode::Disabled,
        }
    }
}

/// The transport half of a channel: a plain TCP or Unix stream, or
/// either wrapped in a completed TLS session. A hand-written
/// `AsyncRead`/`AsyncWrite` forwarding impl lets the event loop treat
/// all four the same way without a boxed trait object.
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, data),
            Transport::Unix(s) => Pin::new(s).poll_write(cx, data),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, data),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn io_err(e: io::Error) -> IcError {
    IcError::new(IcStatus::Abort, format!("transport I/O error: {e}"))
}

/// How to repeat the connect procedure on an auto-reconnecting channel
/// (spec.md §4.5.4). Only channels created via `connect_tcp`/
/// `connect_unix` carry one — an accepted (server-side) channel has no
/// address of its own to redial.
#[derive(Clone)]
enum ReconnectTarget {
    Tcp(std::net::SocketAddr),
    Unix(std::path::PathBuf),
}

/// One end of an IC multiplexed RPC connection.
pub struct IcChannel {
    state: ChannelState,
    transport: Option<Transport>,
    config: ChannelConfig,
    send_queue: SendQueue,
    pending: PendingTable,
    timers: TimerSet,
    slot_gen: SlotIdGenerator,
    peer_version: u16,
    watchdog: Option<(TimerHandle, TimerHandle, TimerHandle)>,
    /// Inbound queries the event loop has decoded but not yet handed to
    /// a dispatcher; drained by [`IcChannel::poll_inbound_query`].
    inbound_queries: std::collections::VecDeque<(FrameHeader, Vec<u8>)>,
    reconnect_target: Option<ReconnectTarget>,
}

impl IcChannel {
    fn new_with_transport(transport: Transport, config: ChannelConfig, state: ChannelState) -> Self {
        Self {
            state,
            transport: Some(transport),
            config,
            send_queue: SendQueue::new(),
            pending: PendingTable::new(),
            timers: TimerSet::new(),
            slot_gen: SlotIdGenerator::new(),
            peer_version: 0,
            watchdog: None,
            inbound_queries: std::collections::VecDeque::new(),
            reconnect_target: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Connects over TCP, immediately sending the mandatory first
    /// version message (spec.md §4.4 "This MUST be the very first
    /// message sent by both the server and the client").
    pub async fn connect_tcp(addr: impl ToSocketAddrs, config: ChannelConfig) -> Result<Self, IcError> {
        let resolved = tokio::net::lookup_host(addr)
            .await
            .map_err(io_err)?
            .next()
            .ok_or_else(|| IcError::new(IcStatus::Abort, "address resolved to no socket addresses"))?;
        let stream = TcpStream::connect(resolved).await.map_err(io_err)?;
        let mut channel = Self::new_with_transport(Transport::Tcp(stream), config, ChannelState::VersionWait);
        channel.reconnect_target = Some(ReconnectTarget::Tcp(resolved));
        channel.send_version_frame().await?;
        Ok(channel)
    }

    /// Accepts an already-established TCP connection, sending our own
    /// version message before the peer's has necessarily arrived.
    pub async fn accept_tcp(stream: TcpStream, config: ChannelConfig) -> Result<Self, IcError> {
        let mut channel = Self::new_with_transport(Transport::Tcp(stream), config, ChannelState::VersionWait);
        channel.send_version_frame().await?;
        Ok(channel)
    }

    /// Connects over a Unix domain socket. No version exchange happens
    /// here (spec.md §4.4): the channel is `READY` immediately.
    pub async fn connect_unix(path: impl AsRef<Path>, config: ChannelConfig) -> Result<Self, IcError> {
        let path_buf = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path_buf).await.map_err(io_err)?;
        let mut channel = Self::new_with_transport(Transport::Unix(stream), config, ChannelState::Ready);
        channel.reconnect_target = Some(ReconnectTarget::Unix(path_buf));
        channel.arm_watchdog();
        Ok(channel)
    }

    pub fn accept_unix(stream: UnixStream, config: ChannelConfig) -> Self {
        let mut channel = Self::new_with_transport(Transport::Unix(stream), config, ChannelState::Ready);
        channel.arm_watchdog();
        channel
    }

    async fn send_version_frame(&mut self) -> Result<(), IcError> {
        let command = encode_command(Command::StreamControl(StreamControl::Version(
            self.config.version,
            self.config.want_tls,
        )));
        let header = FrameHeader::new(Flags::empty(), 0, command, 0)?;
        self.write_frame_raw(&header, &[]).await
    }

    async fn write_frame_raw(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), IcError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| IcError::new(IcStatus::Abort, "channel has no transport"))?;
        transport.write_all(&header.encode()).await.map_err(io_err)?;
        transport.write_all(payload).await.map_err(io_err)?;
        transport.flush().await.map_err(io_err)?;
        Ok(())
    }

    async fn read_frame_raw(&mut self) -> Result<(FrameHeader, Vec<u8>), IcError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| IcError::new(IcStatus::Abort, "channel has no transport"))?;
        let mut hdr_bytes = [0u8; HEADER_LEN];
        transport.read_exact(&mut hdr_bytes).await.map_err(io_err)?;
        let header = FrameHeader::decode(&hdr_bytes)?;
        let mut payload = vec![0u8; header.data_length as usize];
        if !payload.is_empty() {
            transport.read_exact(&mut payload).await.map_err(io_err)?;
        }
        Ok((header, payload))
    }

    /// Enqueues a query and registers its continuation, returning the
    /// slot it was assigned (spec.md §4.5.1, §4.5.2).
    pub fn send_query(
        &mut self,
        interface: u16,
        rpc: u16,
        payload: Vec<u8>,
        priority: Priority,
        timeout: Option<Duration>,
        continuation: Continuation,
    ) -> Result<u32, IcError> {
        if self.state != ChannelState::Ready {
            return Err(IcError::new(IcStatus::Abort, "channel is not ready to send"));
        }
        let slot = self.slot_gen.next_id();
        let command = encode_command(Command::Query { interface, rpc });
        let flags = Flags::empty().with_priority(priority);
        self.send_queue.enqueue(OutMsg::new(slot, command, flags, payload, priority));
        self.pending.insert(slot, continuation);
        if let Some(delay) = timeout {
            self.timers.schedule_after(delay, TimerKind::MessageTimeout(slot));
        }
        Ok(slot)
    }

    /// Enqueues a reply to a previously received query.
    pub fn send_reply(&mut self, slot: u32, status: IcStatus, payload: Vec<u8>) -> Result<(), IcError> {
        let command = encode_command(Command::Reply(status));
        self.send_queue
            .enqueue(OutMsg::new(slot, command, Flags::empty(), payload, Priority::Normal));
        Ok(())
    }

    /// Cancels a query, whether still queued or already awaiting a
    /// reply (spec.md §4.5.5).
    pub fn cancel(&mut self, slot: u32) {
        self.send_queue.remove_by_slot(slot);
        self.pending.cancel(slot);
    }

    /// Pops the next fully-decoded inbound query, if any, for a
    /// dispatcher to handle.
    pub fn poll_inbound_query(&mut self) -> Option<(FrameHeader, Vec<u8>)> {
        self.inbound_queries.pop_front()
    }

    fn enqueue_nop(&mut self) {
        let command = encode_command(Command::StreamControl(StreamControl::Nop));
        self.send_queue
            .enqueue(OutMsg::new(0, command, Flags::empty(), Vec::new(), Priority::Low));
    }

    fn arm_watchdog(&mut self) {
        if let Some((soft, hard, keepalive)) = self.watchdog.take() {
            self.timers.cancel(soft);
            self.timers.cancel(hard);
            self.timers.cancel(keepalive);
        }
        let deadlines = watchdog_deadlines(Instant::now(), self.config.soft_timeout, self.config.hard_timeout);
        let soft = self.timers.schedule(deadlines[0].0, deadlines[0].1);
        let hard = self.timers.schedule(deadlines[1].0, deadlines[1].1);
        let keepalive = self.timers.schedule(deadlines[2].0, deadlines[2].1);
        self.watchdog = Some((soft, hard, keepalive));
    }

    async fn perform_tls_handshake(&mut self) -> Result<(), IcError> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| IcError::new(IcStatus::Abort, "channel has no transport"))?;
        let tcp = match transport {
            Transport::Tcp(s) => s,
            _ => return Err(IcError::new(IcStatus::Abort, "TLS handshake requires a TCP transport")),
        };
        let wrapped = match self.config.tls.clone() {
            TlsMode::Client { connector, server_name } => {
                let stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| IcError::new(IcStatus::Abort, format!("TLS handshake failed: {e}")))?;
                Transport::TlsClient(Box::new(stream))
            }
            TlsMode::Server { acceptor } => {
                let stream = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| IcError::new(IcStatus::Abort, format!("TLS handshake failed: {e}")))?;
                Transport::TlsServer(Box::new(stream))
            }
            TlsMode::Disabled => {
                return Err(IcError::new(
                    IcStatus::Abort,
                    "peer requested TLS but this channel has no TLS configuration",
                ))
            }
        };
        self.transport = Some(wrapped);
        Ok(())
    }

    async fn handle_incoming(&mut self, header: FrameHeader, payload: Vec<u8>) -> Result<(), IcError> {
        if self.state == ChannelState::Ready {
            self.arm_watchdog();
        }
        let command = decode_command(header.command)?;
        match command {
            Command::StreamControl(StreamControl::Version(peer_version, peer_wants_tls)) => {
                self.peer_version = peer_version;
                if self.state == ChannelState::VersionWait {
                    if peer_wants_tls || self.config.want_tls {
                        self.state = ChannelState::TlsHandshake;
                        self.perform_tls_handshake().await?;
                    }
                    self.state = ChannelState::Ready;
                    self.arm_watchdog();
                    debug!(peer_version, "IC channel ready");
                }
                Ok(())
            }
            Command::StreamControl(StreamControl::Bye) => self.begin_close(IcStatus::Abort, true).await,
            Command::StreamControl(StreamControl::Nop) => Ok(()),
            Command::Reply(status) => {
                self.pending.complete(header.slot, status, payload);
                Ok(())
            }
            Command::Query { .. } => {
                self.inbound_queries.push_back((header, payload));
                Ok(())
            }
        }
    }

    async fn fire_timers(&mut self) -> Result<(), IcError> {
        let now = Instant::now();
        for kind in self.timers.pop_due(now) {
            match kind {
                TimerKind::MessageTimeout(slot) => {
                    self.send_queue.remove_by_slot(slot);
                    self.pending.complete(slot, IcStatus::TimedOut, Vec::new());
                }
                TimerKind::WatchdogSoft => {
                    warn!("channel has had no activity for the soft timeout; peer may be unresponsive");
                }
                TimerKind::WatchdogHard => {
                    self.begin_close(IcStatus::Abort, true).await?;
                }
                TimerKind::WatchdogKeepalive => {
                    self.enqueue_nop();
                    self.arm_watchdog();
                }
                TimerKind::Reconnect => {
                    self.attempt_reconnect().await?;
                }
            }
        }
        Ok(())
    }

    async fn flush_send_queue(&mut self) -> Result<(), IcError> {
        while let Some(msg) = self.send_queue.pop_front() {
            if msg.canceled {
                continue;
            }
            let header = FrameHeader::new(msg.flags, msg.slot, msg.command, msg.payload.len() as u32)?;
            self.write_frame_raw(&header, &msg.payload).await?;
        }
        Ok(())
    }

    /// Runs one iteration of the event loop: drains whatever is queued
    /// to send, then waits for the next inbound frame or timer
    /// deadline, whichever comes first.
    ///
    /// While reconnecting (`transport` torn down, waiting on the
    /// `Reconnect` timer, spec.md §4.5.4) there is no socket to read
    /// from or flush to, so the loop only waits on timers.
    ///
    /// A transport I/O failure (`Abort`) transitions to `CLOSING`
    /// in-place rather than propagating, so a reconnect can be
    /// scheduled (spec.md §7 propagation policy: "channel I/O errors
    /// trigger transition to `CLOSING` ... and — if `auto_reconn` —
    /// schedule reconnect"). A protocol-level decode error still
    /// propagates as `Err`.
    pub async fn drive_once(&mut self) -> Result<(), IcError> {
        if self.transport.is_none() {
            let deadline = self.timers.next_deadline();
            sleep_until_opt(deadline).await;
            self.fire_timers().await?;
            return Ok(());
        }
        if let Err(e) = self.flush_send_queue().await {
            return self.close_or_propagate(e).await;
        }
        let deadline = self.timers.next_deadline();
        tokio::select! {
            frame = self.read_frame_raw() => {
                match frame {
                    Ok((header, payload)) => self.handle_incoming(header, payload).await?,
                    Err(e) => return self.close_or_propagate(e).await,
                }
            }
            _ = sleep_until_opt(deadline) => {
                self.fire_timers().await?;
            }
        }
        Ok(())
    }

    /// Transport I/O failures (`Abort`, from [`io_err`]) are routed
    /// through [`IcChannel::begin_close`] instead of bubbling; anything
    /// else (a malformed frame) is a protocol error and propagates.
    async fn close_or_propagate(&mut self, e: IcError) -> Result<(), IcError> {
        if e.status == IcStatus::Abort {
            self.begin_close(IcStatus::Abort, true).await
        } else {
            Err(e)
        }
    }

    /// Drives the loop until the channel closes, either on our own
    /// request or the peer's.
    pub async fn run_until_closed(&mut self) -> Result<(), IcError> {
        while !matches!(self.state, ChannelState::Closing | ChannelState::Wiped) {
            self.drive_once().await?;
        }
        Ok(())
    }

    /// Tears down the current transport and either wipes the channel
    /// for good or, if `auto_reconn` and this channel knows how to
    /// redial (`connect_tcp`/`connect_unix`, not an accepted server
    /// side), schedules a reconnect (spec.md §4.5.4).
    async fn begin_close(&mut self, status: IcStatus, allow_reconnect: bool) -> Result<(), IcError> {
        self.state = ChannelState::Closing;
        self.transport = None;
        self.cancel_watchdog();
        if allow_reconnect && self.config.auto_reconn && self.reconnect_target.is_some() {
            // msg_list (the send queue) is preserved; only pending is
            // drained, and with Disconnected rather than `status`.
            self.pending.drain_with(IcStatus::Disconnected);
            self.state = ChannelState::Connecting;
            self.schedule_reconnect();
        } else {
            self.pending.drain_with(status);
            self.state = ChannelState::Wiped;
        }
        Ok(())
    }

    fn cancel_watchdog(&mut self) {
        if let Some((soft, hard, keepalive)) = self.watchdog.take() {
            self.timers.cancel(soft);
            self.timers.cancel(hard);
            self.timers.cancel(keepalive);
        }
    }

    fn schedule_reconnect(&mut self) {
        self.timers.schedule_after(self.config.retry_delay, TimerKind::Reconnect);
    }

    async fn attempt_reconnect(&mut self) -> Result<(), IcError> {
        let target = match self.reconnect_target.clone() {
            Some(target) => target,
            None => return Ok(()),
        };
        let result = match target {
            ReconnectTarget::Tcp(addr) => TcpStream::connect(addr).await.map(Transport::Tcp),
            ReconnectTarget::Unix(ref path) => UnixStream::connect(path).await.map(Transport::Unix),
        };
        match result {
            Ok(transport) => {
                let is_unix = matches!(transport, Transport::Unix(_));
                self.transport = Some(transport);
                if is_unix {
                    self.state = ChannelState::Ready;
                    self.arm_watchdog();
                    debug!("IC channel reconnected");
                } else {
                    self.state = ChannelState::VersionWait;
                    self.send_version_frame().await?;
                }
            }
            Err(e) => {
                warn!(error = %e, "reconnect attempt failed, retrying");
                self.schedule_reconnect();
            }
        }
        Ok(())
    }

    /// Sends a `Bye` and tears the channel down (spec.md §4.5 "a
    /// channel that initiates close sends `Bye` before entering
    /// `CLOSING`"). An explicit close is final: it never schedules a
    /// reconnect even if `auto_reconn` is set.
    pub async fn close(&mut self) -> Result<(), IcError> {
        if self.state == ChannelState::Ready {
            let command = encode_command(Command::StreamControl(StreamControl::Bye));
            let header = FrameHeader::new(Flags::empty(), 0, command, 0)?;
            let _ = self.write_frame_raw(&header, &[]).await;
        }
        self.begin_close(IcStatus::Canceled, false).await
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn version_handshake_brings_both_sides_to_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = IcChannel::accept_tcp(stream, ChannelConfig::default()).await.unwrap();
            tokio::time::timeout(Duration::from_secs(2), channel.drive_once())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(channel.state(), ChannelState::Ready);
        });

        let mut client = IcChannel::connect_tcp(addr, ChannelConfig::default()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), client.drive_once())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.state(), ChannelState::Ready);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn query_reply_roundtrips_over_unix_socket() {
        let (client_stream, server_stream) = UnixStream::pair().unwrap();
        let mut server = IcChannel::accept_unix(server_stream, ChannelConfig::default());
        let mut client = IcChannel::accept_unix(client_stream, ChannelConfig::default());

        let captured = Arc::new(Mutex::new(None));
        let captured2 = captured.clone();
        client
            .send_query(
                1,
                2,
                b"hello".to_vec(),
                Priority::Normal,
                None,
                Box::new(move |status, payload| {
                    *captured2.lock().unwrap() = Some((status, payload));
                }),
            )
            .unwrap();

        // client -> server: deliver the query frame.
        client.flush_send_queue().await.unwrap();
        let (header, payload) = server.read_frame_raw().await.unwrap();
        assert_eq!(payload, b"hello");
        server.send_reply(header.slot, IcStatus::Ok, b"world".to_vec()).unwrap();

        // server -> client: deliver the reply frame.
        server.flush_send_queue().await.unwrap();
        let (reply_header, reply_payload) = client.read_frame_raw().await.unwrap();
        client.handle_incoming(reply_header, reply_payload).await.unwrap();

        let (status, payload) = captured.lock().unwrap().take().unwrap();
        assert_eq!(status, IcStatus::Ok);
        assert_eq!(payload, b"world");
    }

    #[tokio::test]
    async fn dropped_peer_schedules_reconnect_and_fails_pending_with_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut server = IcChannel::accept_tcp(stream, ChannelConfig::default()).await.unwrap();
            server.drive_once().await.unwrap();
            assert_eq!(server.state(), ChannelState::Ready);
            // Dropping here closes the socket out from under the client.
        });

        let config = ChannelConfig {
            auto_reconn: true,
            retry_delay: Duration::from_millis(20),
            ..ChannelConfig::default()
        };
        let mut client = IcChannel::connect_tcp(addr, config).await.unwrap();
        client.drive_once().await.unwrap();
        assert_eq!(client.state(), ChannelState::Ready);
        server.await.unwrap();

        let captured = Arc::new(Mutex::new(None));
        let captured2 = captured.clone();
        client
            .send_query(
                1,
                2,
                b"hi".to_vec(),
                Priority::Normal,
                None,
                Box::new(move |status, payload| {
                    *captured2.lock().unwrap() = Some((status, payload));
                }),
            )
            .unwrap();

        // The peer is gone; this drive_once should observe the I/O
        // failure, transition to reconnecting rather than propagating,
        // and fail the pending query with `Disconnected`.
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.state() == ChannelState::Ready {
                client.drive_once().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(client.state(), ChannelState::Connecting);
        assert_eq!(captured.lock().unwrap().take(), Some((IcStatus::Disconnected, Vec::new())));
    }

    #[tokio::test]
    async fn explicit_close_never_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = listener.accept().await.unwrap();
        });

        // auto_reconn is on and this channel has a reconnect target
        // (connect_tcp), yet an explicit close() must still wipe it.
        let config = ChannelConfig {
            auto_reconn: true,
            retry_delay: Duration::from_millis(20),
            ..ChannelConfig::default()
        };
        let mut client = IcChannel::connect_tcp(addr, config).await.unwrap();
        server.await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), ChannelState::Wiped);
    }
}
