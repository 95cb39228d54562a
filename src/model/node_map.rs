//! Participant-local node store

use std::collections::HashMap;
use std::rc::Rc;

use sha2::{Digest, Sha256};

use crate::ids::NodeId;

use super::{Chunk, Cloner, Language, ModelError, Node, NodeSource};

/// `NodeId → Node` for every node one participant holds, across all partitions.
///
/// Incoming deltas are resolved against this map; an id may appear at most
/// once. Mutations go through [`SharedNodeMap::apply`].
#[derive(Clone, Debug, Default)]
pub struct SharedNodeMap {
    pub(super) nodes: HashMap<NodeId, Node>,
    pub(super) language: Option<Rc<Language>>,
}

impl SharedNodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map whose mutations are checked against `language`.
    pub fn with_language(language: Language) -> Self {
        Self {
            nodes: HashMap::new(),
            language: Some(Rc::new(language)),
        }
    }

    pub fn language(&self) -> Option<&Language> {
        self.language.as_deref()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub(crate) fn require(&self, id: &NodeId) -> Result<&Node, ModelError> {
        self.nodes
            .get(id)
            .ok_or_else(|| ModelError::UnknownNode(id.clone()))
    }

    /// Root of the partition `id` belongs to.
    pub fn partition_of(&self, id: &NodeId) -> Option<NodeId> {
        let mut current = self.nodes.get(id)?;
        // A parent chain longer than the map means a cycle.
        for _ in 0..=self.nodes.len() {
            match &current.parent {
                None => return Some(current.id.clone()),
                Some(parent) => current = self.nodes.get(parent)?,
            }
        }
        None
    }

    /// Is `ancestor` equal to `node` or above it in the containment tree?
    pub fn is_ancestor_or_self(&self, ancestor: &NodeId, node: &NodeId) -> bool {
        let mut current = Some(node);
        for _ in 0..=self.nodes.len() {
            match current {
                Some(id) if id == ancestor => return true,
                Some(id) => current = self.nodes.get(id).and_then(|n| n.parent.as_ref()),
                None => return false,
            }
        }
        false
    }

    /// `root` and everything it owns, depth-first pre-order.
    pub fn subtree_ids(&self, root: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                let owned: Vec<NodeId> = node.owned_nodes().cloned().collect();
                stack.extend(owned.into_iter().rev());
                out.push(id);
            }
        }
        out
    }

    /// A detached same-id copy of the subtree under `root`.
    pub fn extract(&self, root: &NodeId) -> Result<Chunk, ModelError> {
        Ok(Cloner::same_id().clone_nodes(self, &[root.clone()])?.into_chunk())
    }

    /// Check that `chunk` is a closed subtree none of whose ids are taken.
    pub(crate) fn check_new_subtree(&self, chunk: &Chunk) -> Result<NodeId, ModelError> {
        let root = chunk.root()?.id.clone();
        if let Some(taken) = chunk.ids().find(|id| self.nodes.contains_key(*id)) {
            return Err(ModelError::DuplicateNode(taken.clone()));
        }
        Ok(root)
    }

    /// Insert a checked subtree, hanging its root under `parent`. Returns the
    /// subtree as stored.
    pub(crate) fn insert_subtree(&mut self, chunk: &Chunk, parent: Option<&NodeId>) -> Chunk {
        let root = chunk.root().map(|n| n.id.clone()).ok();
        let mut stored = Vec::with_capacity(chunk.len());
        for node in &chunk.nodes {
            let mut node = node.clone();
            if Some(&node.id) == root.as_ref() {
                node.parent = parent.cloned();
            }
            node.compact();
            stored.push(node.clone());
            self.nodes.insert(node.id.clone(), node);
        }
        // keep the root first so receivers can read it off directly
        if let Some(pos) = stored.iter().position(|n| Some(&n.id) == root.as_ref()) {
            let r = stored.remove(pos);
            stored.insert(0, r);
        }
        Chunk::new(stored)
    }

    /// Remove `root` and everything it owns. The parent's list is left alone.
    pub(crate) fn remove_subtree(&mut self, root: &NodeId) -> Chunk {
        let removed = self
            .subtree_ids(root)
            .into_iter()
            .filter_map(|id| self.nodes.remove(&id))
            .collect();
        Chunk::new(removed)
    }

    pub(crate) fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Canonical SHA-256 over the sorted node set. Equal digests mean equal
    /// content, regardless of insertion history.
    pub fn digest(&self) -> String {
        let mut ids: Vec<&NodeId> = self.nodes.keys().collect();
        ids.sort();
        let mut hasher = Sha256::new();
        for id in ids {
            let node = &self.nodes[id];
            // Node serialization is infallible: string keys and plain values only.
            if let Ok(bytes) = serde_json::to_vec(node) {
                hasher.update(&bytes);
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

impl NodeSource for SharedNodeMap {
    fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MetaPointer;

    fn mp(key: &str) -> MetaPointer {
        MetaPointer::new("shapes", "1", key)
    }

    fn map_with_tree() -> SharedNodeMap {
        let mut map = SharedNodeMap::new();
        let chunk = Chunk::new(vec![
            Node::new("doc", mp("Document"))
                .with_child(mp("shapes"), "g")
                .with_annotation("note"),
            Node::new("g", mp("Group"))
                .with_parent("doc")
                .with_child(mp("shapes"), "c"),
            Node::new("c", mp("Circle")).with_parent("g"),
            Node::new("note", mp("Note")).with_parent("doc"),
        ]);
        map.check_new_subtree(&chunk).unwrap();
        map.insert_subtree(&chunk, None);
        map
    }

    #[test]
    fn test_partition_of_and_ancestry() {
        let map = map_with_tree();
        assert_eq!(map.partition_of(&"c".into()), Some(NodeId::from("doc")));
        assert_eq!(map.partition_of(&"doc".into()), Some(NodeId::from("doc")));
        assert_eq!(map.partition_of(&"zzz".into()), None);

        assert!(map.is_ancestor_or_self(&"g".into(), &"c".into()));
        assert!(map.is_ancestor_or_self(&"c".into(), &"c".into()));
        assert!(!map.is_ancestor_or_self(&"c".into(), &"g".into()));
    }

    #[test]
    fn test_subtree_order_and_removal() {
        let mut map = map_with_tree();
        let ids: Vec<_> = map
            .subtree_ids(&"doc".into())
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(ids, vec!["doc", "g", "c", "note"]);

        let removed = map.remove_subtree(&"g".into());
        assert_eq!(removed.len(), 2);
        assert_eq!(removed.root().unwrap().id.as_str(), "g");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_duplicate_ids_are_refused() {
        let map = map_with_tree();
        let clash = Chunk::single(Node::new("c", mp("Circle")));
        assert_eq!(
            map.check_new_subtree(&clash),
            Err(ModelError::DuplicateNode("c".into()))
        );
    }

    #[test]
    fn test_digest_ignores_insertion_order() {
        let a = map_with_tree();
        let mut b = SharedNodeMap::new();
        let mut nodes = a.extract(&"doc".into()).unwrap().nodes;
        nodes.reverse();
        b.insert_subtree(&Chunk::new(nodes), None);

        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), SharedNodeMap::new().digest());
    }
}
