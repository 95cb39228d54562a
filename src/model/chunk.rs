//! Self-contained subtrees carried inside deltas

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

use super::{ModelError, Node};

/// Anything that can resolve a node id to node data.
pub trait NodeSource {
    fn node(&self, id: &NodeId) -> Option<&Node>;
}

/// A closed subtree: one root plus all of its descendants.
///
/// The root is the single node whose parent is absent or lies outside the chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub nodes: Vec<Node>,
}

impl Chunk {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn single(node: Node) -> Self {
        Self { nodes: vec![node] }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|n| &n.id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }

    /// Single lookup by scanning; use [`Chunk::index`] for repeated ones.
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn index(&self) -> ChunkIndex<'_> {
        ChunkIndex {
            nodes: self.nodes.iter().map(|n| (&n.id, n)).collect(),
        }
    }

    /// Check that the chunk is one closed subtree and return its root.
    pub fn root(&self) -> Result<&Node, ModelError> {
        let mut ids: HashMap<&NodeId, &Node> = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if ids.insert(&node.id, node).is_some() {
                return Err(ModelError::MalformedChunk(format!(
                    "node {} appears twice",
                    node.id
                )));
            }
        }

        let mut roots = self
            .nodes
            .iter()
            .filter(|n| n.parent.as_ref().map_or(true, |p| !ids.contains_key(p)));
        let root = roots
            .next()
            .ok_or_else(|| ModelError::MalformedChunk("no root node".into()))?;
        if let Some(other) = roots.next() {
            return Err(ModelError::MalformedChunk(format!(
                "two roots: {} and {}",
                root.id, other.id
            )));
        }

        for node in &self.nodes {
            for owned in node.owned_nodes() {
                match ids.get(owned) {
                    Some(child) if child.parent.as_ref() == Some(&node.id) => {}
                    Some(_) => {
                        return Err(ModelError::MalformedChunk(format!(
                            "{} lists {} but is not its parent",
                            node.id, owned
                        )))
                    }
                    None => {
                        return Err(ModelError::MalformedChunk(format!(
                            "{} owns {} which is missing",
                            node.id, owned
                        )))
                    }
                }
            }
            if let Some(parent) = node.parent.as_ref().filter(|_| node.id != root.id) {
                let listed = ids
                    .get(parent)
                    .map_or(false, |p| p.owned_nodes().any(|c| c == &node.id));
                if !listed {
                    return Err(ModelError::MalformedChunk(format!(
                        "{} is not listed by its parent {}",
                        node.id, parent
                    )));
                }
            }
        }
        Ok(root)
    }
}

/// A chunk's nodes keyed by id.
pub struct ChunkIndex<'a> {
    nodes: HashMap<&'a NodeId, &'a Node>,
}

impl NodeSource for ChunkIndex<'_> {
    fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id).copied()
    }
}
