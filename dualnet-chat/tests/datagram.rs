use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use dualnet_chat::{
    config::DatagramConfig,
    datagram::{DatagramRegistry, DatagramServer},
    netutils,
    protocol::{self, RATE_LIMITED_NOTICE, SHUTDOWN_NOTICE},
};
use tokio::{
    net::UdpSocket,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

struct TestRelay {
    addr: SocketAddr,
    registry: Arc<DatagramRegistry>,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TestRelay {
    async fn start(config: DatagramConfig) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let server = DatagramServer::new(socket, config);
        let addr = server.local_addr()?;
        let registry = server.registry();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown_tx,
            server,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.server.await;
    }

    /// Registers `name` and consumes the private welcome.
    async fn join(&self, name: &str) -> Result<Peer> {
        let peer = Peer::connect(self.addr).await?;
        peer.send(&protocol::register(name)).await?;
        let display_name = peer.display_name(name)?;
        assert_eq!(peer.next_line().await?, protocol::welcome(&display_name));
        Ok(peer)
    }
}

struct Peer {
    socket: UdpSocket,
}

impl Peer {
    async fn connect(relay: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket.connect(relay).await?;
        Ok(Self { socket })
    }

    fn addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The name the relay derives for this peer from its source address.
    fn display_name(&self, name: &str) -> Result<String> {
        Ok(netutils::display_name(name, netutils::display_addr(self.addr()?)))
    }

    async fn send(&self, payload: &str) -> Result<()> {
        self.socket.send(payload.as_bytes()).await?;
        Ok(())
    }

    async fn next_line(&self) -> Result<String> {
        let mut buf = vec![0u8; 4096];
        let len = timeout(READ_TIMEOUT, self.socket.recv(&mut buf))
            .await
            .map_err(|_| anyhow!("timed out waiting for datagram"))??;
        let text = String::from_utf8(buf[..len].to_vec())?;
        text.strip_suffix('\n')
            .map(str::to_string)
            .ok_or_else(|| anyhow!("datagram not newline framed: {text:?}"))
    }

    async fn assert_silent(&self) {
        let mut buf = vec![0u8; 4096];
        let result = timeout(QUIET_PERIOD, self.socket.recv(&mut buf)).await;
        assert!(result.is_err(), "unexpected datagram: {result:?}");
    }
}

async fn wait_for_clients(registry: &DatagramRegistry, expected: usize) -> Result<()> {
    timeout(READ_TIMEOUT, async {
        while registry.len().await != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("registry never reached {expected} clients"))
}

#[tokio::test]
async fn registration_chat_and_presence() -> Result<()> {
    let relay = TestRelay::start(DatagramConfig::default()).await?;
    let alice = relay.join("alice").await?;
    let bob = relay.join("bob").await?;
    let alice_name = alice.display_name("alice")?;
    let bob_name = bob.display_name("bob")?;

    assert_eq!(alice.next_line().await?, protocol::joined(&bob_name));

    alice.send("hi bob").await?;
    assert_eq!(bob.next_line().await?, protocol::chat_line(&alice_name, "hi bob"));
    alice.assert_silent().await;
    assert_eq!(relay.registry.len().await, 2);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn heartbeat_is_never_broadcast() -> Result<()> {
    let relay = TestRelay::start(DatagramConfig::default()).await?;
    let alice = relay.join("alice").await?;
    let bob = relay.join("bob").await?;
    alice.next_line().await?;

    bob.send(protocol::HEARTBEAT).await?;
    alice.assert_silent().await;
    bob.assert_silent().await;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn unregistered_peers_are_ignored() -> Result<()> {
    let relay = TestRelay::start(DatagramConfig::default()).await?;
    let alice = relay.join("alice").await?;

    let stranger = Peer::connect(relay.addr).await?;
    stranger.send("let me in").await?;
    stranger.send(protocol::BYE).await?;

    alice.assert_silent().await;
    stranger.assert_silent().await;
    assert_eq!(relay.registry.len().await, 1);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn bye_leaves_without_waiting_for_reaper() -> Result<()> {
    let relay = TestRelay::start(DatagramConfig::default()).await?;
    let alice = relay.join("alice").await?;
    let bob = relay.join("bob").await?;
    let bob_name = bob.display_name("bob")?;
    alice.next_line().await?;

    bob.send(protocol::BYE).await?;

    assert_eq!(alice.next_line().await?, protocol::left(&bob_name));
    wait_for_clients(&relay.registry, 1).await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn same_name_from_two_addresses_are_distinct() -> Result<()> {
    let relay = TestRelay::start(DatagramConfig::default()).await?;
    let first = relay.join("twin").await?;
    let second = relay.join("twin").await?;

    assert_eq!(
        first.next_line().await?,
        protocol::joined(&second.display_name("twin")?)
    );
    assert_eq!(relay.registry.len().await, 2);

    // Registering again from a known address refreshes, it does not duplicate.
    second.send(&protocol::register("twin")).await?;
    assert_eq!(
        second.next_line().await?,
        protocol::welcome(&second.display_name("twin")?)
    );
    first.assert_silent().await;
    assert_eq!(relay.registry.len().await, 2);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn flooding_sender_is_throttled_privately() -> Result<()> {
    let relay = TestRelay::start(DatagramConfig::default()).await?;
    let alice = relay.join("alice").await?;
    let bob = relay.join("bob").await?;
    let alice_name = alice.display_name("alice")?;
    alice.next_line().await?;

    for text in ["one", "two", "three", "four", "five"] {
        alice.send(text).await?;
    }

    for text in ["one", "two", "three"] {
        assert_eq!(bob.next_line().await?, protocol::chat_line(&alice_name, text));
    }
    bob.assert_silent().await;
    assert_eq!(alice.next_line().await?, RATE_LIMITED_NOTICE);
    assert_eq!(alice.next_line().await?, RATE_LIMITED_NOTICE);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn silent_clients_are_reaped_and_active_ones_kept() -> Result<()> {
    let config = DatagramConfig {
        reap_interval: Duration::from_millis(50),
        inactivity_timeout: Duration::from_millis(400),
        poll_interval: Duration::from_millis(50),
        ..DatagramConfig::default()
    };
    let relay = TestRelay::start(config).await?;
    let quiet = relay.join("quiet").await?;
    let chatty = relay.join("chatty").await?;
    let quiet_name = quiet.display_name("quiet")?;
    quiet.next_line().await?;

    // Keep heartbeating well inside the timeout while `quiet` says nothing.
    let mut notice = None;
    for _ in 0..20 {
        chatty.send(protocol::HEARTBEAT).await?;
        let mut buf = vec![0u8; 4096];
        if let Ok(received) = timeout(Duration::from_millis(100), chatty.socket.recv(&mut buf)).await {
            let len = received?;
            notice = Some(String::from_utf8(buf[..len].to_vec())?);
            break;
        }
    }

    assert_eq!(
        notice.as_deref().map(|line| line.trim_end()),
        Some(protocol::left_timeout(&quiet_name).as_str())
    );
    wait_for_clients(&relay.registry, 1).await?;
    let survivor = relay.registry.snapshot().await;
    assert_eq!(survivor[0].display_name(), chatty.display_name("chatty")?);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_notifies_every_client() -> Result<()> {
    let relay = TestRelay::start(DatagramConfig::default()).await?;
    let alice = relay.join("alice").await?;
    let bob = relay.join("bob").await?;
    alice.next_line().await?;

    relay.stop().await;

    assert_eq!(alice.next_line().await?, SHUTDOWN_NOTICE);
    assert_eq!(bob.next_line().await?, SHUTDOWN_NOTICE);
    Ok(())
}
