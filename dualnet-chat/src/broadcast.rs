use std::{fmt::Debug, future::Future, hash::Hash, io};

use futures::future::join_all;
use tracing::debug;

use crate::{protocol::frame, registry::ClientRegistry};

/// Something that can carry bytes to exactly one peer.
///
/// Implementations serialize their own writes, so two broadcasts racing for
/// the same recipient never interleave within a line.
pub trait OutboundSink: Send + Sync {
    fn deliver(&self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Releases the underlying transport, if there is one to release.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Sends `line` (newline-framed) to every registered client except `exclude`.
///
/// Recipients are taken from a snapshot so the registry is not locked while
/// writes are in flight. A failed delivery is logged and does not stop the rest.
pub async fn broadcast<K, S>(
    registry: &ClientRegistry<K, S>,
    line: &str,
    exclude: Option<&K>,
) -> BroadcastReport
where
    K: Eq + Hash + Clone + Debug,
    S: OutboundSink,
{
    let bytes = frame(line);
    let recipients: Vec<_> = registry
        .snapshot()
        .await
        .into_iter()
        .filter(|entry| Some(entry.identity()) != exclude)
        .collect();

    let results = join_all(recipients.iter().map(|entry| {
        let bytes = &bytes;
        async move {
            let result = entry.sink().deliver(bytes).await;
            if let Err(err) = &result {
                debug!(recipient = entry.display_name(), error = ?err, "failed to deliver message");
            }
            result
        }
    }))
    .await;

    let failed = results.iter().filter(|result| result.is_err()).count();
    BroadcastReport {
        delivered: results.len() - failed,
        failed,
    }
}

/// Sends `line` to a single client, outside of any broadcast.
pub async fn send_private<S: OutboundSink>(sink: &S, line: &str) -> io::Result<()> {
    sink.deliver(&frame(line)).await
}
