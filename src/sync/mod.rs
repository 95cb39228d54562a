//! Replication between one repository and its clients
//!
//! # Roles
//!
//! - **Client** ([`EventReplicator`]): turns local events into commands for the
//!   repository, and applies the repository's events to the local forest.
//! - **Repository** ([`RepositoryReplicator`]): owns the authoritative state,
//!   validates client commands, and announces accepted changes as sequenced
//!   events to every client.
//!
//! Only commands travel towards the owner of the state; only events travel
//! away from it.
//!
//! # Echo suppression
//!
//! Applying a remote event makes the local forest raise its own event for the
//! same change. While the remote event is applied, its id is marked in a
//! [`SuppressionSet`] and pinned on the forest's event id source, so the local
//! event carries the remote id and the outbound echo filter drops it. The mark
//! is held by a [`SuppressionGuard`] and cleared on every exit path.
//!
//! # Ordering
//!
//! Repository events carry a per-source sequence number. A [`Sequencer`]
//! applies them in order, buffering early arrivals and dropping duplicates.

mod applier;
mod config;
mod connector;
mod replicator;
mod repository;
mod sequencer;
mod suppression;

pub use applier::{EventApplier, PartitionApplier};
pub use config::SyncConfig;
pub use connector::{
    flush_to_all, flush_to_peer, outbound_queue, pump_to_all, pump_to_peer, Connector,
    ConnectorError, HubEndpoint, InMemoryHub, Outbound, OutboundQueue, OutboundReceiver,
    RepositoryConnector,
};
pub use replicator::{EventReplicator, ReplicatorStats};
pub use repository::{Bootstrap, RepositoryReplicator};
pub use sequencer::{Admission, Sequencer};
pub use suppression::{SuppressionGuard, SuppressionSet};

use thiserror::Error;

use crate::ids::ParticipationId;
use crate::model::ModelError;
use crate::processor::ProcessorError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Reorder buffer for {peer} is full ({capacity} events)")]
    ReorderBufferFull {
        peer: ParticipationId,
        capacity: usize,
    },

    #[error("Unexpected delta: {0}")]
    UnexpectedDelta(String),

    #[error("Replicator has been disposed")]
    Disposed,

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}
