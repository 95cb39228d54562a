//! Deep copies of subtrees
//!
//! Copies a set of roots and everything they contain. Containment and
//! reference edges inside the copied set are rewritten through an old → new
//! id map. References leaving the set follow [`ExternalReferences`].

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ids::{fresh_node_id, NodeId};

use super::{Chunk, ModelError, Node, NodeSource};

/// How cloned nodes are identified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdMode {
    /// Every clone gets a newly minted id.
    Fresh,
    /// Clones keep the original ids. Used to hydrate a peer's subtree into a
    /// store that must resolve later deltas by those same ids.
    Preserve,
}

/// What happens to references pointing outside the cloned set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalReferences {
    /// Keep pointing at the original external node.
    #[default]
    Preserve,
    /// Clear the target; the resolve info is kept.
    Drop,
}

/// Result of a clone.
#[derive(Clone, Debug)]
pub struct Cloned {
    /// Ids of the cloned roots, in the order the roots were given.
    pub roots: Vec<NodeId>,
    /// Cloned nodes, roots first within each subtree. Roots have no parent.
    pub nodes: Vec<Node>,
    /// Original id → clone id.
    pub mapping: HashMap<NodeId, NodeId>,
}

impl Cloned {
    /// The single cloned subtree as a chunk.
    pub fn into_chunk(self) -> Chunk {
        Chunk::new(self.nodes)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Cloner {
    id_mode: IdMode,
    external: ExternalReferences,
}

impl Cloner {
    pub fn new(id_mode: IdMode, external: ExternalReferences) -> Self {
        Self { id_mode, external }
    }

    /// Identity-preserving clone that keeps external references.
    pub fn same_id() -> Self {
        Self::new(IdMode::Preserve, ExternalReferences::Preserve)
    }

    pub fn id_mode(&self) -> IdMode {
        self.id_mode
    }

    pub fn clone_nodes<S: NodeSource + ?Sized>(
        &self,
        source: &S,
        roots: &[NodeId],
    ) -> Result<Cloned, ModelError> {
        let root_set: HashSet<&NodeId> = roots.iter().collect();

        // Collect the cloned set in depth-first pre-order.
        let mut order: Vec<&Node> = Vec::new();
        let mut seen: HashSet<&NodeId> = HashSet::new();
        for root in roots {
            let mut stack = vec![root];
            while let Some(id) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }
                let node = source
                    .node(id)
                    .ok_or_else(|| ModelError::UnknownNode(id.clone()))?;
                order.push(node);
                let owned: Vec<&NodeId> = node.owned_nodes().collect();
                stack.extend(owned.into_iter().rev());
            }
        }

        let mapping: HashMap<NodeId, NodeId> = order
            .iter()
            .map(|n| {
                let new_id = match self.id_mode {
                    IdMode::Fresh => fresh_node_id(),
                    IdMode::Preserve => n.id.clone(),
                };
                (n.id.clone(), new_id)
            })
            .collect();
        let map = |id: &NodeId| mapping.get(id).cloned().unwrap_or_else(|| id.clone());

        let mut nodes = Vec::with_capacity(order.len());
        for original in &order {
            let mut copy = Node::new(map(&original.id), original.classifier.clone());
            copy.properties = original.properties.clone();
            copy.parent = if root_set.contains(&original.id) {
                None
            } else {
                original.parent.as_ref().map(&map)
            };
            copy.containments = original
                .containments
                .iter()
                .map(|(k, children)| (k.clone(), children.iter().map(&map).collect()))
                .collect();
            copy.annotations = original.annotations.iter().map(&map).collect();
            copy.references = original
                .references
                .iter()
                .map(|(k, entries)| {
                    let entries = entries
                        .iter()
                        .map(|entry| {
                            let mut entry = entry.clone();
                            entry.target = match entry.target.take() {
                                Some(t) if mapping.contains_key(&t) => Some(map(&t)),
                                Some(t) => match self.external {
                                    ExternalReferences::Preserve => Some(t),
                                    ExternalReferences::Drop => None,
                                },
                                None => None,
                            };
                            entry
                        })
                        .collect();
                    (k.clone(), entries)
                })
                .collect();
            nodes.push(copy);
        }

        Ok(Cloned {
            roots: roots.iter().map(&map).collect(),
            nodes,
            mapping,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MetaPointer;
    use crate::model::ReferenceTarget;

    fn mp(key: &str) -> MetaPointer {
        MetaPointer::new("shapes", "1", key)
    }

    /// group g contains circles a and b; a refers to b and to an outside node x.
    fn sample() -> Chunk {
        Chunk::new(vec![
            Node::new("g", mp("Group"))
                .with_child(mp("shapes"), "a")
                .with_child(mp("shapes"), "b")
                .with_property(mp("name"), "group"),
            Node::new("a", mp("Circle"))
                .with_parent("g")
                .with_property(mp("radius"), "1")
                .with_reference(mp("peer"), ReferenceTarget::labelled("b", "B"))
                .with_reference(mp("peer"), ReferenceTarget::labelled("x", "X")),
            Node::new("b", mp("Circle"))
                .with_parent("g")
                .with_property(mp("radius"), "2"),
        ])
    }

    #[test]
    fn test_same_id_clone_preserves_ids() {
        let source = sample();
        let cloned = Cloner::same_id()
            .clone_nodes(&source.index(), &["g".into()])
            .unwrap();

        assert_eq!(cloned.roots, vec![NodeId::from("g")]);
        let ids: Vec<_> = cloned.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["g", "a", "b"]);
        for node in &cloned.nodes {
            assert_eq!(Some(node), source.node(&node.id));
        }
    }

    #[test]
    fn test_fresh_clone_rewrites_internal_edges() {
        let source = sample();
        let cloned = Cloner::new(IdMode::Fresh, ExternalReferences::Preserve)
            .clone_nodes(&source.index(), &["g".into()])
            .unwrap();

        let copy = Chunk::new(cloned.nodes.clone());
        for original in &source.nodes {
            let new_id = &cloned.mapping[&original.id];
            assert_ne!(new_id, &original.id);
            let clone = copy.node(new_id).unwrap();
            assert_eq!(clone.properties, original.properties);
            assert_eq!(clone.classifier, original.classifier);
        }

        let g = copy.node(&cloned.roots[0]).unwrap();
        assert_eq!(g.parent, None);
        let children = g.children(&mp("shapes"));
        assert_eq!(children[0], cloned.mapping[&NodeId::from("a")]);
        assert_eq!(children[1], cloned.mapping[&NodeId::from("b")]);

        let a = copy.node(&children[0]).unwrap();
        assert_eq!(a.parent.as_ref(), Some(&cloned.roots[0]));
        let peers = a.entries(&mp("peer"));
        assert_eq!(peers[0].target.as_ref(), Some(&children[1]));
        assert_eq!(peers[1].target, Some(NodeId::from("x")));
        assert!(copy.root().is_ok());
    }

    #[test]
    fn test_external_references_can_be_dropped() {
        let source = sample();
        let cloned = Cloner::new(IdMode::Preserve, ExternalReferences::Drop)
            .clone_nodes(&source.index(), &["a".into()])
            .unwrap();

        let a = &cloned.nodes[0];
        assert_eq!(a.parent, None);
        // b is outside the cloned set now
        assert_eq!(a.entries(&mp("peer"))[0], ReferenceTarget::dangling("B"));
        assert_eq!(a.entries(&mp("peer"))[1], ReferenceTarget::dangling("X"));
    }

    #[test]
    fn test_unknown_root_fails() {
        let err = Cloner::same_id()
            .clone_nodes(&sample().index(), &["nope".into()])
            .unwrap_err();
        assert_eq!(err, ModelError::UnknownNode("nope".into()));
    }
}
