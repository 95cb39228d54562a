//! Plain node data
//!
//! Nodes live in a [`SharedNodeMap`](super::SharedNodeMap) arena and point at
//! each other by [`NodeId`]; there are no owning pointers between nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{MetaPointer, NodeId};

/// One entry of a reference feature.
///
/// The resolved target and the cached label change independently; either may
/// be missing, and the target may name a node that does not exist locally.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceTarget {
    pub target: Option<NodeId>,
    pub resolve_info: Option<String>,
}

impl ReferenceTarget {
    pub fn to(target: impl Into<NodeId>) -> Self {
        Self {
            target: Some(target.into()),
            resolve_info: None,
        }
    }

    pub fn labelled(target: impl Into<NodeId>, resolve_info: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            resolve_info: Some(resolve_info.into()),
        }
    }

    pub fn dangling(resolve_info: impl Into<String>) -> Self {
        Self {
            target: None,
            resolve_info: Some(resolve_info.into()),
        }
    }
}

/// Where a child sits inside its parent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    Containment(MetaPointer),
    Annotation,
}

/// A node of the forest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub classifier: MetaPointer,
    #[serde(default, with = "as_pairs")]
    pub properties: BTreeMap<MetaPointer, String>,
    #[serde(default, with = "as_pairs")]
    pub containments: BTreeMap<MetaPointer, Vec<NodeId>>,
    #[serde(default, with = "as_pairs")]
    pub references: BTreeMap<MetaPointer, Vec<ReferenceTarget>>,
    #[serde(default)]
    pub annotations: Vec<NodeId>,
    #[serde(default)]
    pub parent: Option<NodeId>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, classifier: MetaPointer) -> Self {
        Self {
            id: id.into(),
            classifier,
            properties: BTreeMap::new(),
            containments: BTreeMap::new(),
            references: BTreeMap::new(),
            annotations: Vec::new(),
            parent: None,
        }
    }

    pub fn with_property(mut self, property: MetaPointer, value: impl Into<String>) -> Self {
        self.properties.insert(property, value.into());
        self
    }

    pub fn with_child(mut self, containment: MetaPointer, child: impl Into<NodeId>) -> Self {
        self.containments.entry(containment).or_default().push(child.into());
        self
    }

    pub fn with_annotation(mut self, annotation: impl Into<NodeId>) -> Self {
        self.annotations.push(annotation.into());
        self
    }

    pub fn with_reference(mut self, reference: MetaPointer, entry: ReferenceTarget) -> Self {
        self.references.entry(reference).or_default().push(entry);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<NodeId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn property(&self, property: &MetaPointer) -> Option<&str> {
        self.properties.get(property).map(String::as_str)
    }

    pub fn children(&self, containment: &MetaPointer) -> &[NodeId] {
        self.containments
            .get(containment)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entries(&self, reference: &MetaPointer) -> &[ReferenceTarget] {
        self.references
            .get(reference)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Contained children and annotations, in feature order then annotation order.
    pub fn owned_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.containments
            .values()
            .flatten()
            .chain(self.annotations.iter())
    }

    /// The slot and index at which `child` sits in this node.
    pub fn locate(&self, child: &NodeId) -> Option<(Slot, usize)> {
        for (containment, children) in &self.containments {
            if let Some(index) = children.iter().position(|c| c == child) {
                return Some((Slot::Containment(containment.clone()), index));
            }
        }
        self.annotations
            .iter()
            .position(|a| a == child)
            .map(|index| (Slot::Annotation, index))
    }

    pub(crate) fn slot_mut(&mut self, slot: &Slot) -> &mut Vec<NodeId> {
        match slot {
            Slot::Containment(containment) => {
                self.containments.entry(containment.clone()).or_default()
            }
            Slot::Annotation => &mut self.annotations,
        }
    }

    pub(crate) fn slot(&self, slot: &Slot) -> &[NodeId] {
        match slot {
            Slot::Containment(containment) => self.children(containment),
            Slot::Annotation => &self.annotations,
        }
    }

    /// Drop empty feature lists so equal content compares equal.
    pub(crate) fn compact(&mut self) {
        self.containments.retain(|_, v| !v.is_empty());
        self.references.retain(|_, v| !v.is_empty());
    }
}

/// Maps with structured keys are carried as lists of pairs so they survive
/// JSON encoding.
mod as_pairs {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize,
        V: Serialize,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
    {
        let pairs: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp(key: &str) -> MetaPointer {
        MetaPointer::new("shapes", "1", key)
    }

    #[test]
    fn test_locate_children_and_annotations() {
        let node = Node::new("root", mp("Root"))
            .with_child(mp("items"), "a")
            .with_child(mp("items"), "b")
            .with_annotation("note");

        assert_eq!(
            node.locate(&"b".into()),
            Some((Slot::Containment(mp("items")), 1))
        );
        assert_eq!(node.locate(&"note".into()), Some((Slot::Annotation, 0)));
        assert_eq!(node.locate(&"zzz".into()), None);

        let owned: Vec<_> = node.owned_nodes().map(|n| n.as_str()).collect();
        assert_eq!(owned, vec!["a", "b", "note"]);
    }

    #[test]
    fn test_json_keeps_structured_keys() {
        let node = Node::new("n", mp("Circle"))
            .with_property(mp("radius"), "3")
            .with_reference(mp("ref"), ReferenceTarget::dangling("somewhere"));

        let json = serde_json::to_string(&node).unwrap();
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
