//! Process-wide shutdown coordination.
//!
//! A [`Shutdown`] is created once per relay and cloned into every loop at
//! construction time. Triggering it flips the draining flag and wakes every
//! [`ShutdownSignal`], which each loop polls at its natural suspension point.

use std::{fmt::Debug, hash::Hash, sync::Arc};

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    broadcast::{OutboundSink, send_private},
    protocol::SHUTDOWN_NOTICE,
    registry::{ClientEntry, ClientRegistry},
};

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Marks the relay as draining. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// True once shutdown has begun; read errors seen afterwards are expected.
    pub fn is_draining(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered. Cancel safe.
    pub async fn recv(&mut self) {
        // The sender lives as long as any `Shutdown` clone; if all are gone
        // nobody can trigger anymore, so treat that as shutdown too.
        let _ = self.rx.wait_for(|draining| *draining).await;
    }
}

/// Starts draining, then tells every registered client the relay is going
/// away and closes its transport. Best effort: failed notices are ignored.
///
/// Entries are taken out of the registry, so a client that registers after
/// this point is left for [`release_late_client`].
///
/// Returns the number of clients that were notified.
pub async fn drain_clients<K, S>(shutdown: &Shutdown, registry: &ClientRegistry<K, S>) -> usize
where
    K: Eq + Hash + Clone + Debug,
    S: OutboundSink,
{
    shutdown.trigger();
    info!("server shutting down");

    let clients = registry.take_all().await;
    join_all(clients.iter().map(say_goodbye)).await;
    clients.len()
}

/// Called right after a registration. If draining already started, the
/// client is notified and closed here unless the drain already claimed it.
///
/// Returns true when the caller should stop serving the client.
pub async fn release_late_client<K, S>(
    shutdown: &Shutdown,
    registry: &ClientRegistry<K, S>,
    identity: &K,
) -> bool
where
    K: Eq + Hash + Clone + Debug,
    S: OutboundSink,
{
    if !shutdown.is_draining() {
        return false;
    }
    if let Some(entry) = registry.remove(identity).await {
        say_goodbye(&entry).await;
    }
    true
}

async fn say_goodbye<K, S: OutboundSink>(entry: &Arc<ClientEntry<K, S>>) {
    info!(client = entry.display_name(), "disconnecting");
    if let Err(err) = send_private(entry.sink(), SHUTDOWN_NOTICE).await {
        debug!(client = entry.display_name(), error = ?err, "shutdown notice not delivered");
    }
    entry.sink().close().await;
}

/// Waits for Ctrl-C or, on Unix, SIGTERM.
#[cfg(unix)]
pub async fn termination_requested() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = ?err, "failed to install SIGTERM handler");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
pub async fn termination_requested() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use std::io;

    use tokio::{sync::mpsc, time::timeout};

    use super::*;
    use crate::rate_limit::RateLimiter;

    struct ChannelSink(mpsc::UnboundedSender<Vec<u8>>);

    impl OutboundSink for ChannelSink {
        async fn deliver(&self, bytes: &[u8]) -> io::Result<()> {
            self.0
                .send(bytes.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver dropped"))
        }
    }

    async fn register(
        registry: &ClientRegistry<u64, ChannelSink>,
        id: u64,
    ) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .insert(ClientEntry::new(
                id,
                format!("user{id}"),
                RateLimiter::default(),
                ChannelSink(tx),
            ))
            .await
            .expect("insert");
        rx
    }

    fn notices(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<String> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn trigger_wakes_every_subscriber() {
        let shutdown = Shutdown::new();
        let mut first = shutdown.subscribe();
        let mut second = shutdown.clone().subscribe();
        assert!(!shutdown.is_draining());

        let waiter = tokio::spawn(async move { first.recv().await });
        shutdown.trigger();

        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("first subscriber woke")
            .expect("task joined");
        timeout(Duration::from_secs(1), second.recv())
            .await
            .expect("second subscriber woke");
        assert!(shutdown.is_draining());
    }

    #[tokio::test]
    async fn late_subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();

        let mut late = shutdown.subscribe();
        timeout(Duration::from_secs(1), late.recv())
            .await
            .expect("already draining");
    }

    #[tokio::test]
    async fn drain_notifies_each_client_once() {
        let shutdown = Shutdown::new();
        let registry = ClientRegistry::new();
        let mut first = register(&registry, 1).await;
        let mut second = register(&registry, 2).await;

        assert_eq!(drain_clients(&shutdown, &registry).await, 2);
        assert!(shutdown.is_draining());
        assert!(registry.is_empty().await);

        // The handler of an already drained client finds nothing left to do.
        assert!(release_late_client(&shutdown, &registry, &1).await);

        let goodbye = format!("{SHUTDOWN_NOTICE}\n");
        assert_eq!(notices(&mut first), [goodbye.clone()]);
        assert_eq!(notices(&mut second), [goodbye]);
    }

    #[tokio::test]
    async fn client_registered_after_drain_is_still_notified() {
        let shutdown = Shutdown::new();
        let registry = ClientRegistry::new();
        let mut early = register(&registry, 1).await;
        drain_clients(&shutdown, &registry).await;

        let mut late = register(&registry, 2).await;
        assert!(release_late_client(&shutdown, &registry, &2).await);

        assert!(registry.is_empty().await);
        assert_eq!(notices(&mut late), [format!("{SHUTDOWN_NOTICE}\n")]);
        assert_eq!(notices(&mut early).len(), 1);
    }

    #[tokio::test]
    async fn release_is_a_no_op_before_shutdown() {
        let shutdown = Shutdown::new();
        let registry = ClientRegistry::new();
        let mut client = register(&registry, 1).await;

        assert!(!release_late_client(&shutdown, &registry, &1).await);
        assert_eq!(registry.len().await, 1);
        assert!(notices(&mut client).is_empty());
    }
}
