//! One TCP session to one pool.
//!
//! A [`PoolConnection`] runs two loops for its pool slot:
//!
//! - the session loop: resolve, connect, handshake, stream lines until the
//!   session ends, back off, repeat;
//! - the reconnect timer: while armed, periodically asks the observer whether
//!   this pool should be connected.
//!
//! Everything else talks to the connection through a cheap, cloneable
//! [`ConnectionHandle`]. Handle methods only flip flags and wake the session
//! loop, so they are safe to call while holding the orchestrator lock.
//!
//! ```text
//! Disconnected -> Resolving -> Connecting -> Handshaking -> Streaming
//!      ^                                                        |
//!      +--------------------------------------------------------+
//! ```
//!
//! The connection reports `connected` only after the first line from the pool
//! parses, so a listener that accepts and immediately resets does not count as
//! a live pool.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{self, Instant};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::codec;
use super::framing::{Frame, StratumLines};
use super::messages::{StratumMessage, SubmitParams, request_id};
use crate::config::{DeviceIdentity, StratumEndpointConfig};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::PoolId;

/// Shares queued for submission while a session is busy writing.
const SUBMIT_QUEUE_DEPTH: usize = 64;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    Connecting,
    Handshaking,
    Streaming,
}

/// Timing parameters of a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTiming {
    /// Wait after a failed resolve, connect or session.
    pub backoff: Duration,

    /// Longest silence from the pool before the session is dropped.
    pub read_timeout: Duration,

    /// Period of the reconnect timer.
    pub reconnect_period: Duration,

    /// Poll period while stopped or unconfigured.
    pub idle_poll: Duration,
}

impl Default for ConnectionTiming {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            reconnect_period: Duration::from_secs(30),
            idle_poll: Duration::from_secs(10),
        }
    }
}

/// Everything a session needs to know about its pool, snapshotted at the
/// start of each connection attempt.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub endpoint: StratumEndpointConfig,
    pub keepalive: bool,
    pub suggested_difficulty: u32,
    pub device: DeviceIdentity,
}

/// Receiver of connection events, implemented by the orchestrator.
///
/// Calls are made from the connection's own task and must not block.
pub trait ConnectionObserver: Send + Sync {
    /// Configuration for the next connection attempt of `pool`.
    fn session_config(&self, pool: PoolId) -> SessionConfig;

    /// The pool sent its first parseable line of this session.
    fn connected(&self, pool: PoolId);

    /// A session that had signalled `connected` has ended.
    fn disconnected(&self, pool: PoolId);

    /// A decoded message, in receive order.
    fn dispatch(&self, pool: PoolId, message: StratumMessage);

    /// The pool's reconnect timer fired.
    fn reconnect_timer_fired(&self, pool: PoolId);
}

struct Shared {
    pool: PoolId,

    /// Administrative stop. Connections start stopped until `connect()`.
    stop: AtomicBool,

    /// Drop the current session and reconnect without backoff.
    reconnect: AtomicBool,

    connected: AtomicBool,

    /// Interrupts the session loop's waits.
    wake: Notify,

    timer_armed: watch::Sender<bool>,
    submit_tx: mpsc::Sender<SubmitParams>,

    pool_errors: AtomicU64,
    state: Mutex<ConnectionState>,
    resolved_ip: Mutex<Option<IpAddr>>,
}

/// Control surface of a [`PoolConnection`].
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn pool(&self) -> PoolId {
        self.shared.pool
    }

    /// Allow the connection to (re)connect.
    pub fn connect(&self) {
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Drop the session, if any, and stay disconnected until `connect()`.
    ///
    /// Idempotent. Takes effect at the next check of the session loop, which
    /// is immediate unless the loop is busy writing to the socket.
    pub fn disconnect(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Drop the session and reconnect at once with freshly loaded config.
    ///
    /// Not counted as a pool error.
    pub fn trigger_reconnect(&self) {
        self.shared.reconnect.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Arm the reconnect timer. Arming an armed timer keeps its phase.
    pub fn start_reconnect_timer(&self) {
        self.shared.timer_armed.send_if_modified(|armed| {
            let changed = !*armed;
            *armed = true;
            changed
        });
    }

    pub fn stop_reconnect_timer(&self) {
        self.shared.timer_armed.send_if_modified(|armed| {
            let changed = *armed;
            *armed = false;
            changed
        });
    }

    pub fn is_reconnect_timer_armed(&self) -> bool {
        *self.shared.timer_armed.borrow()
    }

    /// Whether the current session has signalled `connected`.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Sessions that ended for reasons other than a requested reconnect or
    /// stop.
    pub fn pool_errors(&self) -> u64 {
        self.shared.pool_errors.load(Ordering::Relaxed)
    }

    /// Address of the last successful resolution.
    pub fn resolved_ip(&self) -> Option<IpAddr> {
        *self.shared.resolved_ip.lock()
    }

    /// Queue a share for `mining.submit` on the current session.
    ///
    /// Fails when the pool is not connected or the queue is full; shares are
    /// never carried over into a later session.
    pub fn submit(&self, share: SubmitParams) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::SocketClosedByPeer);
        }
        self.shared.submit_tx.try_send(share).map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("submit queue: {e}"),
            ))
        })
    }

    fn set_state(&self, state: ConnectionState) {
        *self.shared.state.lock() = state;
    }

    #[cfg(test)]
    pub(crate) fn mark_connected(&self, connected: bool) {
        self.shared.connected.store(connected, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn reconnect_requested(&self) -> bool {
        self.shared.reconnect.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("pool", &self.shared.pool)
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Why a session ended.
enum SessionEnd {
    Stopped,
    Reconnect,
    Shutdown,
}

/// The session and reconnect-timer loops of one pool slot.
pub struct PoolConnection {
    handle: ConnectionHandle,
    submit_rx: mpsc::Receiver<SubmitParams>,
    observer: Arc<dyn ConnectionObserver>,
    timing: ConnectionTiming,
}

impl PoolConnection {
    pub fn new(
        pool: PoolId,
        observer: Arc<dyn ConnectionObserver>,
        timing: ConnectionTiming,
    ) -> (Self, ConnectionHandle) {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        let (timer_armed, _) = watch::channel(false);
        let handle = ConnectionHandle {
            shared: Arc::new(Shared {
                pool,
                stop: AtomicBool::new(true),
                reconnect: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                wake: Notify::new(),
                timer_armed,
                submit_tx,
                pool_errors: AtomicU64::new(0),
                state: Mutex::new(ConnectionState::Disconnected),
                resolved_ip: Mutex::new(None),
            }),
        };

        let connection = Self {
            handle: handle.clone(),
            submit_rx,
            observer,
            timing,
        };
        (connection, handle)
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let timer = reconnect_timer(
            self.handle.clone(),
            self.observer.clone(),
            self.timing.reconnect_period,
            shutdown.clone(),
        );
        tokio::join!(self.session_loop(&shutdown), timer);
    }

    async fn session_loop(&mut self, shutdown: &CancellationToken) {
        let pool = self.handle.pool();
        // The timer runs from the start; the strategy decides what it means
        self.handle.start_reconnect_timer();

        while !shutdown.is_cancelled() {
            let config = self.observer.session_config(pool);
            self.handle.shared.reconnect.store(false, Ordering::SeqCst);

            if !config.endpoint.is_configured() || self.handle.is_stopped() {
                self.handle.set_state(ConnectionState::Disconnected);
                self.idle(shutdown).await;
                continue;
            }

            let stream = match self.open(&config.endpoint, config.keepalive).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(pool = %pool, error = %e, "Pool connection failed");
                    self.handle.set_state(ConnectionState::Disconnected);
                    self.backoff(shutdown).await;
                    continue;
                }
            };

            self.handle.set_state(ConnectionState::Handshaking);
            let result = self.session(stream, &config, shutdown).await;

            // Shares queued for this session are meaningless on the next one
            while self.submit_rx.try_recv().is_ok() {}

            let was_connected = self.handle.shared.connected.swap(false, Ordering::SeqCst);
            self.handle.set_state(ConnectionState::Disconnected);

            let skip_backoff = match result {
                Ok(SessionEnd::Shutdown) => {
                    if was_connected {
                        self.observer.disconnected(pool);
                    }
                    break;
                }
                Ok(SessionEnd::Reconnect) => {
                    info!(pool = %pool, "Reconnect requested, shutting down session");
                    true
                }
                Ok(SessionEnd::Stopped) => {
                    info!(pool = %pool, "Disconnected on request");
                    false
                }
                Err(e) => {
                    self.handle.shared.pool_errors.fetch_add(1, Ordering::Relaxed);
                    error!(pool = %pool, error = %e, "Pool session ended");
                    false
                }
            };

            if was_connected {
                self.observer.disconnected(pool);
            }

            if !skip_backoff {
                self.backoff(shutdown).await;
            }
        }

        self.handle.set_state(ConnectionState::Disconnected);
        trace!(pool = %pool, "Session loop exited");
    }

    /// Resolve and connect, applying socket options.
    async fn open(&self, endpoint: &StratumEndpointConfig, keepalive: bool) -> Result<TcpStream> {
        let pool = self.handle.pool();
        if endpoint.tls {
            return Err(Error::TlsUnsupported {
                host: endpoint.host.clone(),
            });
        }

        self.handle.set_state(ConnectionState::Resolving);
        let addr = resolve(&endpoint.host, endpoint.port).await?;
        *self.handle.shared.resolved_ip.lock() = Some(addr.ip());
        info!(pool = %pool, url = %endpoint.url(), ip = %addr.ip(), "Connecting");

        self.handle.set_state(ConnectionState::Connecting);
        let stream = time::timeout(self.timing.read_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::SocketTimeout)?
            .map_err(|source| Error::SocketConnectFailed { addr, source })?;

        if let Err(e) = configure_socket(&stream, keepalive) {
            warn!(pool = %pool, error = %e, "Failed to configure socket options");
        }
        info!(pool = %pool, %addr, keepalive, "Connected");
        Ok(stream)
    }

    /// Handshake, then stream lines until the session ends.
    async fn session(
        &mut self,
        stream: TcpStream,
        config: &SessionConfig,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd> {
        let pool = self.handle.pool();
        let (reader, mut writer) = stream.into_split();
        let mut lines = FramedRead::new(reader, StratumLines::new());

        let endpoint = &config.endpoint;
        let mut setup = vec![
            codec::encode_subscribe(request_id::SUBSCRIBE, &config.device),
            codec::encode_configure(request_id::CONFIGURE),
            codec::encode_authorize(request_id::AUTHORIZE, &endpoint.user, &endpoint.password),
            codec::encode_suggest_difficulty(
                request_id::SUGGEST_DIFFICULTY,
                config.suggested_difficulty,
            ),
        ];
        if endpoint.extranonce_subscribe {
            setup.push(codec::encode_extranonce_subscribe(
                request_id::EXTRANONCE_SUBSCRIBE,
            ));
        }
        let mut next_id = setup.len() as u64 + 1;
        for line in &setup {
            self.write_line(&mut writer, line).await?;
        }

        let read_deadline = time::sleep(self.timing.read_timeout);
        tokio::pin!(read_deadline);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),

                _ = self.handle.shared.wake.notified() => {
                    if let Some(end) = self.requested_end() {
                        return Ok(end);
                    }
                }

                Some(share) = self.submit_rx.recv() => {
                    let line = codec::encode_submit(next_id, &endpoint.user, &share);
                    debug!(
                        pool = %pool,
                        id = next_id,
                        job_id = %share.job_id,
                        nonce = format!("{:08x}", share.nonce),
                        "Submitting share"
                    );
                    next_id += 1;
                    self.write_line(&mut writer, &line).await?;
                }

                _ = &mut read_deadline => return Err(Error::SocketTimeout),

                frame = lines.next() => {
                    let line = match frame {
                        None => return Err(Error::SocketClosedByPeer),
                        Some(Err(e)) => return Err(Error::Io(std::io::Error::other(e))),
                        Some(Ok(Frame::Overflow)) => {
                            warn!(pool = %pool, "Line exceeds receive buffer, discarding");
                            continue;
                        }
                        Some(Ok(Frame::Line(line))) => line,
                    };
                    read_deadline.as_mut().reset(Instant::now() + self.timing.read_timeout);

                    if line.trim().is_empty() {
                        continue;
                    }
                    debug!(pool = %pool, rx = %line);

                    let message = match codec::decode(&line) {
                        Ok(message) => Some(message),
                        Err(e) if e.is_connection_fatal() => return Err(e),
                        Err(e) => {
                            error!(pool = %pool, error = %e, "Dropping message");
                            None
                        }
                    };

                    if !self.handle.shared.connected.swap(true, Ordering::SeqCst) {
                        self.handle.set_state(ConnectionState::Streaming);
                        self.observer.connected(pool);
                    }

                    // The observer may have stopped us; nothing more gets through
                    if let Some(end) = self.requested_end() {
                        return Ok(end);
                    }

                    let Some(message) = message else { continue };

                    if endpoint.extranonce_subscribe
                        && matches!(
                            message,
                            StratumMessage::GenericResult { id: request_id::EXTRANONCE_SUBSCRIBE, .. }
                        )
                    {
                        if let StratumMessage::GenericResult { success, .. } = message {
                            info!(pool = %pool, success, "Extranonce subscription answered");
                        }
                        continue;
                    }

                    self.observer.dispatch(pool, message);
                }
            }
        }
    }

    fn requested_end(&self) -> Option<SessionEnd> {
        if self.handle.shared.reconnect.load(Ordering::SeqCst) {
            Some(SessionEnd::Reconnect)
        } else if self.handle.is_stopped() {
            Some(SessionEnd::Stopped)
        } else {
            None
        }
    }

    async fn write_line(&self, writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
        trace!(pool = %self.handle.pool(), tx = %line.trim_end());
        time::timeout(self.timing.read_timeout, writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| Error::SocketTimeout)??;
        Ok(())
    }

    /// Fixed wait after a failure; only shutdown cuts it short.
    async fn backoff(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = time::sleep(self.timing.backoff) => {}
            _ = shutdown.cancelled() => {}
        }
    }

    /// Wait while stopped or unconfigured; `connect()` or a reconnect request
    /// ends the wait early.
    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = time::sleep(self.timing.idle_poll) => {}
            _ = self.handle.shared.wake.notified() => {}
            _ = shutdown.cancelled() => {}
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            debug!(host, error = %e, "DNS lookup failed");
            Error::DnsResolutionFailed {
                host: host.to_string(),
            }
        })?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::DnsResolutionFailed {
            host: host.to_string(),
        })
}

/// Keepalive tuned to notice a dead pool well inside the read timeout.
fn configure_socket(stream: &TcpStream, keepalive: bool) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let socket = SockRef::from(stream);
    socket.set_keepalive(keepalive)?;
    if keepalive {
        let params = TcpKeepalive::new().with_time(Duration::from_secs(10));
        #[cfg(target_os = "linux")]
        let params = params
            .with_interval(Duration::from_secs(5))
            .with_retries(3);
        socket.set_tcp_keepalive(&params)?;
    }
    Ok(())
}

/// Periodically report to the observer while the timer is armed.
async fn reconnect_timer(
    handle: ConnectionHandle,
    observer: Arc<dyn ConnectionObserver>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let pool = handle.pool();
    let mut armed = handle.shared.timer_armed.subscribe();

    loop {
        if !*armed.borrow_and_update() {
            tokio::select! {
                changed = armed.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.cancelled() => return,
            }
            continue;
        }

        tokio::select! {
            _ = time::sleep(period) => {
                if *armed.borrow() {
                    trace!(pool = %pool, "Reconnect timer fired");
                    observer.reconnect_timer_fired(pool);
                }
            }
            changed = armed.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
