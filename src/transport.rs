pub use callwire_tokio_transport::{
    TokioWebSocketTransportFactory, Transport, TransportEvent, TransportFactory,
};

use crate::relay::RelayHub;
use async_trait::async_trait;
use bytes::Bytes;
use cwcore::types::{PeerId, SessionId};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const MEMORY_CHANNEL_CAPACITY: usize = 64;

pub type TransportHalf = (Arc<dyn Transport>, mpsc::Receiver<TransportEvent>);

/// One end of an in-process duplex pipe created by [`memory_pair`].
pub struct MemoryTransport {
    peer: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl MemoryTransport {
    fn peer_sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.peer.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        let tx = self
            .peer_sender()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;
        tx.send(TransportEvent::DataReceived(Bytes::copy_from_slice(data)))
            .await
            .map_err(|_| anyhow::anyhow!("Peer hung up"))
    }

    async fn disconnect(&self) {
        let tx = self.peer.lock().ok().and_then(|mut guard| guard.take());
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Disconnected).await;
        }
    }
}

/// Two connected in-process transports. Frames sent on one half arrive as
/// `DataReceived` on the other half's receiver.
pub fn memory_pair() -> (TransportHalf, TransportHalf) {
    let (a_tx, a_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
    let a: Arc<dyn Transport> = Arc::new(MemoryTransport {
        peer: Mutex::new(Some(b_tx)),
    });
    let b: Arc<dyn Transport> = Arc::new(MemoryTransport {
        peer: Mutex::new(Some(a_tx)),
    });
    ((a, a_rx), (b, b_rx))
}

/// Dials an in-process [`RelayHub`] as one participant of a session.
pub struct RelayConnector {
    hub: RelayHub,
    session_id: SessionId,
    peer_id: PeerId,
}

impl RelayConnector {
    pub fn new(hub: RelayHub, session_id: SessionId, peer_id: PeerId) -> Self {
        Self {
            hub,
            session_id,
            peer_id,
        }
    }
}

#[async_trait]
impl TransportFactory for RelayConnector {
    async fn create_transport(&self) -> Result<TransportHalf, anyhow::Error> {
        let (client, (server, server_events)) = memory_pair();
        self.hub.accept(
            self.session_id.clone(),
            self.peer_id.clone(),
            server,
            server_events,
        );
        Ok(client)
    }
}

/// A connection that opens but whose remote end never answers, so the key
/// exchange can only time out.
pub struct StalledConnector;

struct StalledTransport {
    _events: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for StalledTransport {
    async fn send(&self, _data: &[u8]) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn disconnect(&self) {}
}

#[async_trait]
impl TransportFactory for StalledConnector {
    async fn create_transport(&self) -> Result<TransportHalf, anyhow::Error> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(TransportEvent::Connected).await;
        Ok((Arc::new(StalledTransport { _events: tx }), rx))
    }
}

/// A connector whose dial always fails.
pub struct UnreachableConnector;

#[async_trait]
impl TransportFactory for UnreachableConnector {
    async fn create_transport(&self) -> Result<TransportHalf, anyhow::Error> {
        Err(anyhow::anyhow!("relay unreachable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_delivers_both_ways() {
        let ((a, mut a_rx), (b, mut b_rx)) = memory_pair();
        a.send(b"ping").await.unwrap();
        b.send(b"pong").await.unwrap();
        assert!(matches!(b_rx.recv().await, Some(TransportEvent::DataReceived(d)) if d.as_ref() == b"ping"));
        assert!(matches!(a_rx.recv().await, Some(TransportEvent::DataReceived(d)) if d.as_ref() == b"pong"));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_peer_and_closes_sender() {
        let ((a, _a_rx), (_b, mut b_rx)) = memory_pair();
        a.disconnect().await;
        assert!(matches!(b_rx.recv().await, Some(TransportEvent::Disconnected)));
        assert!(a.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_connector_only_reports_connected() {
        let (transport, mut rx) = StalledConnector.create_transport().await.unwrap();
        transport.send(b"req").await.unwrap();
        assert!(matches!(rx.recv().await, Some(TransportEvent::Connected)));
        assert!(rx.try_recv().is_err());
    }
}
