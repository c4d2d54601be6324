use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    broadcast::{OutboundSink, broadcast, send_private},
    config::StreamConfig,
    protocol::{self, RATE_LIMITED_NOTICE, read_line, read_nonblank_line},
    rate_limit::RateLimiter,
    registry::{ClientEntry, ClientRegistry},
    shutdown::{
        Shutdown, ShutdownSignal, drain_clients, release_late_client, termination_requested,
    },
};

/// Identity of one accepted TCP connection for its whole lifetime.
pub type ConnectionId = u64;

pub type StreamRegistry = ClientRegistry<ConnectionId, StreamSink>;
type StreamEntry = ClientEntry<ConnectionId, StreamSink>;

/// Write half of a client connection; the mutex keeps concurrent broadcasts
/// to the same client from interleaving.
pub struct StreamSink {
    writer: Mutex<OwnedWriteHalf>,
}

impl StreamSink {
    fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl OutboundSink for StreamSink {
    async fn deliver(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(error = ?err, "failed to shut down client writer");
        }
    }
}

/// TCP chat relay: one task per accepted connection, all sharing one registry.
pub struct StreamServer {
    listener: TcpListener,
    state: Arc<StreamState>,
}

impl StreamServer {
    pub fn new(listener: TcpListener, config: StreamConfig) -> Self {
        Self {
            listener,
            state: Arc::new(StreamState::new(config)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<StreamRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let StreamServer { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    drain_clients(&state.shutdown, &state.registry).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_terminated(self) -> Result<()> {
        self.run_until(termination_requested()).await
    }
}

fn handle_accept_result(result: io::Result<(TcpStream, SocketAddr)>, state: &Arc<StreamState>) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<StreamState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, &state).await {
            if state.shutdown.is_draining() {
                debug!(%peer, error = ?err, "connection closed during shutdown");
            } else {
                warn!(%peer, error = ?err, "client connection closed with error");
            }
        }
    });
}

struct StreamState {
    registry: Arc<StreamRegistry>,
    config: StreamConfig,
    shutdown: Shutdown,
    next_id: AtomicU64,
}

impl StreamState {
    fn new(config: StreamConfig) -> Self {
        Self {
            registry: Arc::new(ClientRegistry::new()),
            config,
            shutdown: Shutdown::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: &StreamState) -> Result<()> {
    let mut signal = state.shutdown.subscribe();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let max_len = state.config.max_line_len;
    let Some(display_name) = await_name(&mut reader, &mut signal, max_len).await? else {
        debug!(%peer, "connection closed before registration");
        return Ok(());
    };

    enable_keepalive(&writer, &state.config);
    let Some(entry) = register(state, writer, display_name).await? else {
        debug!(%peer, "registered after shutdown began");
        return Ok(());
    };
    info!(%peer, client = entry.display_name(), "client joined");

    let outcome = relay(state, &entry, &mut reader, &mut signal).await;
    close_session(state, &entry).await;
    outcome
}

/// The first non-blank line is the peer's self-declared `name@ip:port`.
async fn await_name(
    reader: &mut BufReader<OwnedReadHalf>,
    signal: &mut ShutdownSignal,
    max_len: usize,
) -> Result<Option<String>> {
    select! {
        _ = signal.recv() => Ok(None),
        name = read_nonblank_line(reader, max_len) => Ok(name?),
    }
}

fn enable_keepalive(writer: &OwnedWriteHalf, config: &StreamConfig) {
    let keepalive = TcpKeepalive::new().with_time(config.keepalive_idle);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let keepalive = keepalive.with_interval(config.keepalive_interval);

    let stream: &TcpStream = writer.as_ref();
    if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = ?err, "failed to enable tcp keep-alive");
    }
}

/// Returns `None` when shutdown began meanwhile; the client has then already
/// been told and closed.
async fn register(
    state: &StreamState,
    writer: OwnedWriteHalf,
    display_name: String,
) -> Result<Option<Arc<StreamEntry>>> {
    let id = state.next_id();
    let entry = state
        .registry
        .insert(ClientEntry::new(
            id,
            display_name,
            RateLimiter::new(state.config.rate_limit),
            StreamSink::new(writer),
        ))
        .await?;

    if release_late_client(&state.shutdown, &state.registry, &id).await {
        return Ok(None);
    }

    broadcast(
        &state.registry,
        &protocol::joined(entry.display_name()),
        Some(&id),
    )
    .await;
    Ok(Some(entry))
}

async fn relay(
    state: &StreamState,
    entry: &StreamEntry,
    reader: &mut BufReader<OwnedReadHalf>,
    signal: &mut ShutdownSignal,
) -> Result<()> {
    let max_len = state.config.max_line_len;
    loop {
        let line = select! {
            _ = signal.recv() => return Ok(()),
            line = read_line(reader, max_len) => line?,
        };

        match line {
            Some(text) => relay_line(state, entry, &text).await,
            None => return Ok(()),
        }
    }
}

async fn relay_line(state: &StreamState, entry: &StreamEntry, text: &str) {
    if text.trim().is_empty() {
        return;
    }

    if entry.try_admit() {
        broadcast(
            &state.registry,
            &protocol::chat_line(entry.display_name(), text),
            Some(entry.identity()),
        )
        .await;
    } else if let Err(err) = send_private(entry.sink(), RATE_LIMITED_NOTICE).await {
        debug!(client = entry.display_name(), error = ?err, "failed to send rate limit notice");
    }
}

async fn close_session(state: &StreamState, entry: &StreamEntry) {
    // While draining, the shutdown path notifies and closes every client.
    if state.shutdown.is_draining() {
        return;
    }

    let removed = state.registry.remove(entry.identity()).await;
    entry.sink().close().await;
    if removed.is_none() {
        return;
    }

    info!(client = entry.display_name(), "client disconnected");
    broadcast(
        &state.registry,
        &protocol::left(entry.display_name()),
        Some(entry.identity()),
    )
    .await;
}
