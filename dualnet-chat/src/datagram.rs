//! UDP chat relay.
//!
//! Datagrams carry no connection state, so peers are identified by source
//! address and must announce themselves with `REGISTER:<name>`. Liveness comes
//! from `HEARTBEAT` datagrams (any datagram counts) and a background reaper
//! that expires peers which have gone quiet. `BYE` leaves immediately.
//!
//! Three tasks run in total regardless of client count: the receive loop, the
//! reaper and whatever drives the shutdown future.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::UdpSocket,
    select,
    time::{Instant, interval_at, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    broadcast::{OutboundSink, broadcast, send_private},
    config::DatagramConfig,
    netutils,
    protocol::{self, DatagramCommand, RATE_LIMITED_NOTICE},
    rate_limit::RateLimiter,
    registry::{ClientEntry, ClientRegistry, RegistryError},
    shutdown::{Shutdown, drain_clients, termination_requested},
};

pub type DatagramRegistry = ClientRegistry<SocketAddr, DatagramSink>;
type DatagramEntry = ClientEntry<SocketAddr, DatagramSink>;

/// Destination address on the shared server socket. One `send_to` is one
/// datagram, so writes to the same peer cannot interleave.
pub struct DatagramSink {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
}

impl OutboundSink for DatagramSink {
    async fn deliver(&self, bytes: &[u8]) -> io::Result<()> {
        self.socket.send_to(bytes, self.addr).await.map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    Bye,
    Timeout,
}

pub struct DatagramServer {
    state: Arc<DatagramState>,
}

impl DatagramServer {
    pub fn new(socket: UdpSocket, config: DatagramConfig) -> Self {
        Self {
            state: Arc::new(DatagramState::new(socket, config)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.state.socket.local_addr()
    }

    pub fn registry(&self) -> Arc<DatagramRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let DatagramServer { state } = self;
        let reaper = tokio::spawn(run_reaper(Arc::clone(&state)));
        tokio::pin!(shutdown);

        let mut buf = vec![0u8; state.config.max_datagram_size];
        loop {
            // A bounded wait so a quiet socket never hides a shutdown request.
            let received = select! {
                _ = &mut shutdown => None,
                received = timeout(state.config.poll_interval, state.socket.recv_from(&mut buf)) => Some(received),
            };

            match received {
                None => {
                    drain_clients(&state.shutdown, &state.registry).await;
                    break;
                }
                Some(Err(_elapsed)) => continue,
                Some(Ok(Err(err))) => {
                    if !state.shutdown.is_draining() {
                        warn!(error = ?err, "failed to read datagram");
                    }
                }
                Some(Ok(Ok((len, peer)))) => {
                    let payload = String::from_utf8_lossy(&buf[..len]);
                    state.handle_datagram(peer, &payload).await;
                }
            }
        }

        if let Err(err) = reaper.await {
            warn!(error = ?err, "reaper task failed");
        }
        Ok(())
    }

    pub async fn run_until_terminated(self) -> Result<()> {
        self.run_until(termination_requested()).await
    }
}

struct DatagramState {
    socket: Arc<UdpSocket>,
    registry: Arc<DatagramRegistry>,
    config: DatagramConfig,
    shutdown: Shutdown,
}

impl DatagramState {
    fn new(socket: UdpSocket, config: DatagramConfig) -> Self {
        Self {
            socket: Arc::new(socket),
            registry: Arc::new(ClientRegistry::new()),
            config,
            shutdown: Shutdown::new(),
        }
    }

    fn sink_for(&self, addr: SocketAddr) -> DatagramSink {
        DatagramSink {
            socket: Arc::clone(&self.socket),
            addr,
        }
    }

    async fn handle_datagram(&self, peer: SocketAddr, payload: &str) {
        let command = DatagramCommand::parse(payload);
        let Some(entry) = self.registry.touch(&peer, Instant::now()).await else {
            match command {
                DatagramCommand::Register { name } if !name.is_empty() => {
                    self.register(peer, name).await;
                }
                _ => debug!(%peer, "ignoring datagram from unregistered peer"),
            }
            return;
        };

        match command {
            DatagramCommand::Heartbeat => {}
            DatagramCommand::Bye => self.disconnect(&peer, Departure::Bye).await,
            DatagramCommand::Register { .. } => {
                debug!(%peer, client = entry.display_name(), "repeated registration");
                self.reply(&entry, &protocol::welcome(entry.display_name()))
                    .await;
            }
            DatagramCommand::Chat { text } if text.is_empty() => {}
            DatagramCommand::Chat { text } => self.relay_chat(&entry, text).await,
        }
    }

    async fn register(&self, peer: SocketAddr, name: &str) {
        let display_name = netutils::display_name(name, netutils::display_addr(peer));
        let entry = ClientEntry::new(
            peer,
            display_name,
            RateLimiter::new(self.config.rate_limit),
            self.sink_for(peer),
        );

        let entry = match self.registry.insert(entry).await {
            Ok(entry) => entry,
            Err(RegistryError::DuplicateIdentity(identity)) => {
                warn!(%identity, "peer registered twice concurrently");
                return;
            }
        };

        info!(%peer, client = entry.display_name(), "client joined");
        broadcast(
            &self.registry,
            &protocol::joined(entry.display_name()),
            Some(&peer),
        )
        .await;
        self.reply(&entry, &protocol::welcome(entry.display_name()))
            .await;
    }

    async fn relay_chat(&self, entry: &DatagramEntry, text: &str) {
        if entry.try_admit() {
            broadcast(
                &self.registry,
                &protocol::chat_line(entry.display_name(), text),
                Some(entry.identity()),
            )
            .await;
        } else {
            self.reply(entry, RATE_LIMITED_NOTICE).await;
        }
    }

    async fn reply(&self, entry: &DatagramEntry, line: &str) {
        if let Err(err) = send_private(entry.sink(), line).await {
            debug!(client = entry.display_name(), error = ?err, "failed to send reply");
        }
    }

    async fn disconnect(&self, peer: &SocketAddr, departure: Departure) {
        if let Some(entry) = self.registry.remove(peer).await {
            self.announce_departure(&entry, departure).await;
        }
    }

    async fn announce_departure(&self, entry: &DatagramEntry, departure: Departure) {
        let notice = match departure {
            Departure::Bye => {
                info!(client = entry.display_name(), "client disconnected");
                protocol::left(entry.display_name())
            }
            Departure::Timeout => {
                info!(client = entry.display_name(), "client expired (inactive timeout)");
                protocol::left_timeout(entry.display_name())
            }
        };
        broadcast(&self.registry, &notice, Some(entry.identity())).await;
    }

    /// Expires every client silent for longer than the inactivity timeout.
    async fn reap_idle(&self, now: Instant) -> usize {
        let expired = self
            .registry
            .remove_idle(now, self.config.inactivity_timeout)
            .await;
        for entry in &expired {
            self.announce_departure(entry, Departure::Timeout).await;
        }
        expired.len()
    }
}

async fn run_reaper(state: Arc<DatagramState>) {
    let mut signal = state.shutdown.subscribe();
    let period = state.config.reap_interval;
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        select! {
            _ = signal.recv() => break,
            _ = ticker.tick() => {
                state.reap_idle(Instant::now()).await;
            }
        }
    }
}
