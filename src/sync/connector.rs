//! Transport boundary
//!
//! Replicators never await. They push outgoing deltas into an unbounded
//! [`OutboundQueue`]; a task drains the matching [`OutboundReceiver`] into a
//! [`Connector`] or [`RepositoryConnector`]. Delivery is fire-and-forget with
//! respect to the local event chain: a failed send is logged and dropped.
//!
//! [`InMemoryHub`] is an in-process transport for tests and demos. It carries
//! CBOR-encoded deltas between endpoints, one inbox per participant.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::delta::codec::{self, CodecError};
use crate::delta::Delta;
use crate::ids::{NodeId, ParticipationId};

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Connection closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// A delta waiting to leave, with the partitions it touches.
#[derive(Clone, Debug)]
pub struct Outbound {
    pub delta: Delta,
    /// Empty for client-originated commands.
    pub affected: Vec<NodeId>,
}

/// Sending half of the outbound queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl OutboundQueue {
    /// Enqueue a delta. Returns false if the receiving side is gone.
    pub fn push(&self, delta: Delta, affected: Vec<NodeId>) -> bool {
        match self.tx.send(Outbound { delta, affected }) {
            Ok(()) => true,
            Err(_) => {
                warn!("outbound queue closed, dropping delta");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of the outbound queue.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl OutboundReceiver {
    /// Wait for the next outgoing delta. `None` once every queue handle is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Everything queued right now, without waiting.
    pub fn try_drain(&mut self) -> Vec<Outbound> {
        let mut drained = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            drained.push(item);
        }
        drained
    }
}

pub fn outbound_queue() -> (OutboundQueue, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutboundQueue { tx }, OutboundReceiver { rx })
}

/// Sends to the one remote participant a replicator talks to.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn send_to_peer(&self, delta: Delta) -> Result<(), ConnectorError>;
}

/// Repository-side fan-out.
#[async_trait]
pub trait RepositoryConnector: Send + Sync {
    async fn send_to_all(
        &self,
        delta: Delta,
        affected_partitions: Vec<NodeId>,
    ) -> Result<(), ConnectorError>;
}

/// Forward queued deltas to `connector` until the queue closes. Returns the
/// number sent successfully.
pub async fn pump_to_peer<C: Connector + ?Sized>(
    outbound: &mut OutboundReceiver,
    connector: &C,
) -> usize {
    let mut sent = 0;
    while let Some(item) = outbound.recv().await {
        sent += send_one(connector, item).await;
    }
    sent
}

/// Forward only what is already queued.
pub async fn flush_to_peer<C: Connector + ?Sized>(
    outbound: &mut OutboundReceiver,
    connector: &C,
) -> usize {
    let mut sent = 0;
    for item in outbound.try_drain() {
        sent += send_one(connector, item).await;
    }
    sent
}

async fn send_one<C: Connector + ?Sized>(connector: &C, item: Outbound) -> usize {
    match connector.send_to_peer(item.delta).await {
        Ok(()) => 1,
        Err(e) => {
            warn!("send to peer failed: {}", e);
            0
        }
    }
}

pub async fn pump_to_all<C: RepositoryConnector + ?Sized>(
    outbound: &mut OutboundReceiver,
    connector: &C,
) -> usize {
    let mut sent = 0;
    while let Some(item) = outbound.recv().await {
        sent += broadcast_one(connector, item).await;
    }
    sent
}

pub async fn flush_to_all<C: RepositoryConnector + ?Sized>(
    outbound: &mut OutboundReceiver,
    connector: &C,
) -> usize {
    let mut sent = 0;
    for item in outbound.try_drain() {
        sent += broadcast_one(connector, item).await;
    }
    sent
}

async fn broadcast_one<C: RepositoryConnector + ?Sized>(connector: &C, item: Outbound) -> usize {
    match connector.send_to_all(item.delta, item.affected).await {
        Ok(()) => 1,
        Err(e) => {
            warn!("send to all failed: {}", e);
            0
        }
    }
}

/// In-process message hub. Every participant gets an inbox of encoded deltas.
pub struct InMemoryHub {
    inboxes: Mutex<HashMap<ParticipationId, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl InMemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a participant. Its peer, if any, is where `send_to_peer` goes.
    pub async fn join(
        self: &Arc<Self>,
        participation: impl Into<ParticipationId>,
        peer: Option<ParticipationId>,
    ) -> HubEndpoint {
        let participation = participation.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(participation.clone(), tx);
        debug!("hub: {} joined", participation);
        HubEndpoint {
            participation,
            peer,
            hub: Arc::clone(self),
            inbox: Mutex::new(rx),
        }
    }

    pub async fn participants(&self) -> usize {
        self.inboxes.lock().await.len()
    }

    async fn deliver(&self, to: &ParticipationId, bytes: Vec<u8>) -> Result<(), ConnectorError> {
        let inboxes = self.inboxes.lock().await;
        let inbox = inboxes
            .get(to)
            .ok_or_else(|| ConnectorError::Transport(format!("{} is not on the hub", to)))?;
        inbox.send(bytes).map_err(|_| ConnectorError::Closed)
    }

    async fn leave(&self, participation: &ParticipationId) {
        self.inboxes.lock().await.remove(participation);
    }
}

/// One participant's view of an [`InMemoryHub`].
pub struct HubEndpoint {
    participation: ParticipationId,
    peer: Option<ParticipationId>,
    hub: Arc<InMemoryHub>,
    inbox: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl HubEndpoint {
    pub fn participation(&self) -> &ParticipationId {
        &self.participation
    }

    /// Wait for the next delta addressed to this participant.
    pub async fn recv(&self) -> Result<Delta, ConnectorError> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(bytes) => Ok(codec::from_cbor(&bytes)?),
            None => Err(ConnectorError::Closed),
        }
    }

    /// Everything already delivered, without waiting.
    pub async fn try_recv_all(&self) -> Result<Vec<Delta>, ConnectorError> {
        let mut inbox = self.inbox.lock().await;
        let mut received = Vec::new();
        while let Ok(bytes) = inbox.try_recv() {
            received.push(codec::from_cbor(&bytes)?);
        }
        Ok(received)
    }

    pub async fn disconnect(&self) {
        self.hub.leave(&self.participation).await;
    }
}

#[async_trait]
impl Connector for HubEndpoint {
    async fn send_to_peer(&self, delta: Delta) -> Result<(), ConnectorError> {
        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| ConnectorError::Transport(format!("{} has no peer", self.participation)))?;
        let bytes = codec::to_cbor(&delta)?;
        self.hub.deliver(peer, bytes).await
    }
}

#[async_trait]
impl RepositoryConnector for HubEndpoint {
    async fn send_to_all(
        &self,
        delta: Delta,
        affected_partitions: Vec<NodeId>,
    ) -> Result<(), ConnectorError> {
        let bytes = codec::to_cbor(&delta)?;
        let targets: Vec<_> = self
            .hub
            .inboxes
            .lock()
            .await
            .iter()
            .filter(|(p, _)| **p != self.participation)
            .map(|(p, tx)| (p.clone(), tx.clone()))
            .collect();
        debug!(
            "hub: {} fans out to {} participants ({} partitions)",
            self.participation,
            targets.len(),
            affected_partitions.len()
        );
        for (participant, tx) in targets {
            if tx.send(bytes.clone()).is_err() {
                warn!("hub: inbox of {} is closed", participant);
            }
        }
        Ok(())
    }
}
