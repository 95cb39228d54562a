//! Partition forest model
//!
//! Plain node data in a participant-local [`SharedNodeMap`], grouped into
//! partitions. A [`Forest`] and its [`Partition`]s are the commander side:
//! every mutation they perform is announced once through their publishers.

mod apply;
mod chunk;
mod forest;
mod language;
mod node;
mod node_map;
mod partition;
pub mod cloner;

pub use chunk::{Chunk, ChunkIndex, NodeSource};
pub use cloner::{Cloned, Cloner, ExternalReferences, IdMode};
pub use forest::{Forest, ForestPublisher, ObserverId};
pub use language::{ClassifierSpec, FeatureKind, FeatureSpec, Language};
pub use node::{Node, ReferenceTarget, Slot};
pub use node_map::SharedNodeMap;
pub use partition::{Partition, PartitionPublisher};

use thiserror::Error;

use crate::ids::{MetaPointer, NodeId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Node {0} already exists")]
    DuplicateNode(NodeId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Index {index} out of bounds for {feature} of {node} (len {len})")]
    IndexOutOfBounds {
        node: NodeId,
        feature: String,
        index: usize,
        len: usize,
    },

    #[error("Feature {feature} of {classifier} {reason}")]
    FeatureMismatch {
        classifier: MetaPointer,
        feature: MetaPointer,
        reason: String,
    },

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("{0} is not a partition of this forest")]
    UnknownPartition(NodeId),

    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),
}
