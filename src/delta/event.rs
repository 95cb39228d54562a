//! Events: announced facts, carrying old values

use serde::{Deserialize, Serialize};

use crate::ids::{CommandId, EventId, MetaPointer, NodeId, ParticipationId, SequenceNumber};
use crate::model::{Chunk, ModelError, ReferenceTarget};

use super::{AnnotationSlot, ChildSlot, CommandChange, EntrySlot, ProtocolMessage, Shape};

/// One atomic change that happened.
///
/// Removed subtrees travel whole so that a receiver can drop every node of
/// them from its node map; moves carry both the old and the new position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventChange {
    PartitionAdded {
        new_partition: Chunk,
    },
    PartitionDeleted {
        deleted_partition: Chunk,
    },
    ClassifierChanged {
        node: NodeId,
        old_classifier: MetaPointer,
        new_classifier: MetaPointer,
    },
    PropertyAdded {
        node: NodeId,
        property: MetaPointer,
        new_value: String,
    },
    PropertyDeleted {
        node: NodeId,
        property: MetaPointer,
        old_value: String,
    },
    PropertyChanged {
        node: NodeId,
        property: MetaPointer,
        old_value: String,
        new_value: String,
    },
    ChildAdded {
        at: ChildSlot,
        new_child: Chunk,
    },
    ChildDeleted {
        at: ChildSlot,
        deleted_child: Chunk,
    },
    ChildReplaced {
        at: ChildSlot,
        replaced_child: Chunk,
        new_child: Chunk,
    },
    ChildMovedFromOtherContainment {
        from: ChildSlot,
        to: ChildSlot,
        moved_child: NodeId,
    },
    ChildMovedFromOtherContainmentInSameParent {
        from: ChildSlot,
        to: ChildSlot,
        moved_child: NodeId,
    },
    ChildMovedInSameContainment {
        from: ChildSlot,
        new_index: usize,
        moved_child: NodeId,
    },
    ChildMovedAndReplacedFromOtherContainment {
        from: ChildSlot,
        to: ChildSlot,
        moved_child: NodeId,
        replaced_child: Chunk,
    },
    ChildMovedAndReplacedFromOtherContainmentInSameParent {
        from: ChildSlot,
        to: ChildSlot,
        moved_child: NodeId,
        replaced_child: Chunk,
    },
    ChildMovedAndReplacedInSameContainment {
        from: ChildSlot,
        new_index: usize,
        moved_child: NodeId,
        replaced_child: Chunk,
    },
    AnnotationAdded {
        at: AnnotationSlot,
        new_annotation: Chunk,
    },
    AnnotationDeleted {
        at: AnnotationSlot,
        deleted_annotation: Chunk,
    },
    AnnotationReplaced {
        at: AnnotationSlot,
        replaced_annotation: Chunk,
        new_annotation: Chunk,
    },
    AnnotationMovedFromOtherParent {
        from: AnnotationSlot,
        to: AnnotationSlot,
        moved_annotation: NodeId,
    },
    AnnotationMovedInSameParent {
        from: AnnotationSlot,
        new_index: usize,
        moved_annotation: NodeId,
    },
    AnnotationMovedAndReplacedFromOtherParent {
        from: AnnotationSlot,
        to: AnnotationSlot,
        moved_annotation: NodeId,
        replaced_annotation: Chunk,
    },
    AnnotationMovedAndReplacedInSameParent {
        from: AnnotationSlot,
        new_index: usize,
        moved_annotation: NodeId,
        replaced_annotation: Chunk,
    },
    ReferenceAdded {
        at: EntrySlot,
        new_entry: ReferenceTarget,
    },
    ReferenceDeleted {
        at: EntrySlot,
        deleted_entry: ReferenceTarget,
    },
    ReferenceChanged {
        at: EntrySlot,
        old_entry: ReferenceTarget,
        new_entry: ReferenceTarget,
    },
    EntryMovedFromOtherReference {
        from: EntrySlot,
        to: EntrySlot,
        moved_entry: ReferenceTarget,
    },
    EntryMovedFromOtherReferenceInSameParent {
        from: EntrySlot,
        to: EntrySlot,
        moved_entry: ReferenceTarget,
    },
    EntryMovedInSameReference {
        from: EntrySlot,
        new_index: usize,
        moved_entry: ReferenceTarget,
    },
    EntryMovedAndReplacedFromOtherReference {
        from: EntrySlot,
        to: EntrySlot,
        moved_entry: ReferenceTarget,
        replaced_entry: ReferenceTarget,
    },
    EntryMovedAndReplacedFromOtherReferenceInSameParent {
        from: EntrySlot,
        to: EntrySlot,
        moved_entry: ReferenceTarget,
        replaced_entry: ReferenceTarget,
    },
    EntryMovedAndReplacedInSameReference {
        from: EntrySlot,
        new_index: usize,
        moved_entry: ReferenceTarget,
        replaced_entry: ReferenceTarget,
    },
    ReferenceResolveInfoAdded {
        at: EntrySlot,
        new_resolve_info: String,
    },
    ReferenceResolveInfoDeleted {
        at: EntrySlot,
        deleted_resolve_info: String,
    },
    ReferenceResolveInfoChanged {
        at: EntrySlot,
        old_resolve_info: String,
        new_resolve_info: String,
    },
    ReferenceTargetAdded {
        at: EntrySlot,
        new_target: NodeId,
    },
    ReferenceTargetDeleted {
        at: EntrySlot,
        deleted_target: NodeId,
    },
    ReferenceTargetChanged {
        at: EntrySlot,
        old_target: NodeId,
        new_target: NodeId,
    },
}

/// Chunks extracted from a node map list their root first; malformed ones fall
/// back to that.
fn root_id(chunk: &Chunk) -> Result<NodeId, ModelError> {
    match chunk.root() {
        Ok(root) => Ok(root.id.clone()),
        Err(e) => chunk.nodes.first().map(|n| n.id.clone()).ok_or(e),
    }
}

impl EventChange {
    pub fn shape(&self) -> Shape {
        use EventChange::*;
        match self {
            PartitionAdded { .. } => Shape::AddPartition,
            PartitionDeleted { .. } => Shape::DeletePartition,
            ClassifierChanged { .. } => Shape::ChangeClassifier,
            PropertyAdded { .. } => Shape::AddProperty,
            PropertyDeleted { .. } => Shape::DeleteProperty,
            PropertyChanged { .. } => Shape::ChangeProperty,
            ChildAdded { .. } => Shape::AddChild,
            ChildDeleted { .. } => Shape::DeleteChild,
            ChildReplaced { .. } => Shape::ReplaceChild,
            ChildMovedFromOtherContainment { .. } => Shape::MoveChildFromOtherContainment,
            ChildMovedFromOtherContainmentInSameParent { .. } => {
                Shape::MoveChildFromOtherContainmentInSameParent
            }
            ChildMovedInSameContainment { .. } => Shape::MoveChildInSameContainment,
            ChildMovedAndReplacedFromOtherContainment { .. } => {
                Shape::MoveAndReplaceChildFromOtherContainment
            }
            ChildMovedAndReplacedFromOtherContainmentInSameParent { .. } => {
                Shape::MoveAndReplaceChildFromOtherContainmentInSameParent
            }
            ChildMovedAndReplacedInSameContainment { .. } => {
                Shape::MoveAndReplaceChildInSameContainment
            }
            AnnotationAdded { .. } => Shape::AddAnnotation,
            AnnotationDeleted { .. } => Shape::DeleteAnnotation,
            AnnotationReplaced { .. } => Shape::ReplaceAnnotation,
            AnnotationMovedFromOtherParent { .. } => Shape::MoveAnnotationFromOtherParent,
            AnnotationMovedInSameParent { .. } => Shape::MoveAnnotationInSameParent,
            AnnotationMovedAndReplacedFromOtherParent { .. } => {
                Shape::MoveAndReplaceAnnotationFromOtherParent
            }
            AnnotationMovedAndReplacedInSameParent { .. } => {
                Shape::MoveAndReplaceAnnotationInSameParent
            }
            ReferenceAdded { .. } => Shape::AddReference,
            ReferenceDeleted { .. } => Shape::DeleteReference,
            ReferenceChanged { .. } => Shape::ChangeReference,
            EntryMovedFromOtherReference { .. } => Shape::MoveEntryFromOtherReference,
            EntryMovedFromOtherReferenceInSameParent { .. } => {
                Shape::MoveEntryFromOtherReferenceInSameParent
            }
            EntryMovedInSameReference { .. } => Shape::MoveEntryInSameReference,
            EntryMovedAndReplacedFromOtherReference { .. } => {
                Shape::MoveAndReplaceEntryFromOtherReference
            }
            EntryMovedAndReplacedFromOtherReferenceInSameParent { .. } => {
                Shape::MoveAndReplaceEntryFromOtherReferenceInSameParent
            }
            EntryMovedAndReplacedInSameReference { .. } => {
                Shape::MoveAndReplaceEntryInSameReference
            }
            ReferenceResolveInfoAdded { .. } => Shape::AddReferenceResolveInfo,
            ReferenceResolveInfoDeleted { .. } => Shape::DeleteReferenceResolveInfo,
            ReferenceResolveInfoChanged { .. } => Shape::ChangeReferenceResolveInfo,
            ReferenceTargetAdded { .. } => Shape::AddReferenceTarget,
            ReferenceTargetDeleted { .. } => Shape::DeleteReferenceTarget,
            ReferenceTargetChanged { .. } => Shape::ChangeReferenceTarget,
        }
    }

    /// The command that, applied to the pre-event state, produces this event.
    ///
    /// Fails only for a deletion or replacement whose chunk holds no nodes.
    pub fn to_command(&self) -> Result<CommandChange, ModelError> {
        use EventChange::*;
        let command = match self.clone() {
            PartitionAdded { new_partition } => CommandChange::AddPartition { new_partition },
            PartitionDeleted { deleted_partition } => CommandChange::DeletePartition {
                deleted_partition: root_id(&deleted_partition)?,
            },
            ClassifierChanged {
                node,
                new_classifier,
                ..
            } => CommandChange::ChangeClassifier {
                node,
                new_classifier,
            },
            PropertyAdded {
                node,
                property,
                new_value,
            } => CommandChange::AddProperty {
                node,
                property,
                new_value,
            },
            PropertyDeleted { node, property, .. } => {
                CommandChange::DeleteProperty { node, property }
            }
            PropertyChanged {
                node,
                property,
                new_value,
                ..
            } => CommandChange::ChangeProperty {
                node,
                property,
                new_value,
            },
            ChildAdded { at, new_child } => CommandChange::AddChild { at, new_child },
            ChildDeleted { at, deleted_child } => CommandChange::DeleteChild {
                at,
                deleted_child: root_id(&deleted_child)?,
            },
            ChildReplaced {
                at,
                replaced_child,
                new_child,
            } => CommandChange::ReplaceChild {
                at,
                replaced_child: root_id(&replaced_child)?,
                new_child,
            },
            ChildMovedFromOtherContainment {
                to, moved_child, ..
            } => CommandChange::MoveChildFromOtherContainment { to, moved_child },
            ChildMovedFromOtherContainmentInSameParent {
                to, moved_child, ..
            } => CommandChange::MoveChildFromOtherContainmentInSameParent { to, moved_child },
            ChildMovedInSameContainment {
                new_index,
                moved_child,
                ..
            } => CommandChange::MoveChildInSameContainment {
                new_index,
                moved_child,
            },
            ChildMovedAndReplacedFromOtherContainment {
                to,
                moved_child,
                replaced_child,
                ..
            } => CommandChange::MoveAndReplaceChildFromOtherContainment {
                to,
                moved_child,
                replaced_child: root_id(&replaced_child)?,
            },
            ChildMovedAndReplacedFromOtherContainmentInSameParent {
                to,
                moved_child,
                replaced_child,
                ..
            } => CommandChange::MoveAndReplaceChildFromOtherContainmentInSameParent {
                to,
                moved_child,
                replaced_child: root_id(&replaced_child)?,
            },
            ChildMovedAndReplacedInSameContainment {
                new_index,
                moved_child,
                replaced_child,
                ..
            } => CommandChange::MoveAndReplaceChildInSameContainment {
                new_index,
                moved_child,
                replaced_child: root_id(&replaced_child)?,
            },
            AnnotationAdded { at, new_annotation } => {
                CommandChange::AddAnnotation { at, new_annotation }
            }
            AnnotationDeleted {
                at,
                deleted_annotation,
            } => CommandChange::DeleteAnnotation {
                at,
                deleted_annotation: root_id(&deleted_annotation)?,
            },
            AnnotationReplaced {
                at,
                replaced_annotation,
                new_annotation,
            } => CommandChange::ReplaceAnnotation {
                at,
                replaced_annotation: root_id(&replaced_annotation)?,
                new_annotation,
            },
            AnnotationMovedFromOtherParent {
                to,
                moved_annotation,
                ..
            } => CommandChange::MoveAnnotationFromOtherParent {
                to,
                moved_annotation,
            },
            AnnotationMovedInSameParent {
                new_index,
                moved_annotation,
                ..
            } => CommandChange::MoveAnnotationInSameParent {
                new_index,
                moved_annotation,
            },
            AnnotationMovedAndReplacedFromOtherParent {
                to,
                moved_annotation,
                replaced_annotation,
                ..
            } => CommandChange::MoveAndReplaceAnnotationFromOtherParent {
                to,
                moved_annotation,
                replaced_annotation: root_id(&replaced_annotation)?,
            },
            AnnotationMovedAndReplacedInSameParent {
                new_index,
                moved_annotation,
                replaced_annotation,
                ..
            } => CommandChange::MoveAndReplaceAnnotationInSameParent {
                new_index,
                moved_annotation,
                replaced_annotation: root_id(&replaced_annotation)?,
            },
            ReferenceAdded { at, new_entry } => CommandChange::AddReference { at, new_entry },
            ReferenceDeleted { at, deleted_entry } => {
                CommandChange::DeleteReference { at, deleted_entry }
            }
            ReferenceChanged {
                at,
                old_entry,
                new_entry,
            } => CommandChange::ChangeReference {
                at,
                old_entry,
                new_entry,
            },
            EntryMovedFromOtherReference {
                from,
                to,
                moved_entry,
            } => CommandChange::MoveEntryFromOtherReference {
                from,
                to,
                moved_entry,
            },
            EntryMovedFromOtherReferenceInSameParent {
                from,
                to,
                moved_entry,
            } => CommandChange::MoveEntryFromOtherReferenceInSameParent {
                from,
                to,
                moved_entry,
            },
            EntryMovedInSameReference {
                from,
                new_index,
                moved_entry,
            } => CommandChange::MoveEntryInSameReference {
                from,
                new_index,
                moved_entry,
            },
            EntryMovedAndReplacedFromOtherReference {
                from,
                to,
                moved_entry,
                replaced_entry,
            } => CommandChange::MoveAndReplaceEntryFromOtherReference {
                from,
                to,
                moved_entry,
                replaced_entry,
            },
            EntryMovedAndReplacedFromOtherReferenceInSameParent {
                from,
                to,
                moved_entry,
                replaced_entry,
            } => CommandChange::MoveAndReplaceEntryFromOtherReferenceInSameParent {
                from,
                to,
                moved_entry,
                replaced_entry,
            },
            EntryMovedAndReplacedInSameReference {
                from,
                new_index,
                moved_entry,
                replaced_entry,
            } => CommandChange::MoveAndReplaceEntryInSameReference {
                from,
                new_index,
                moved_entry,
                replaced_entry,
            },
            ReferenceResolveInfoAdded {
                at,
                new_resolve_info,
            } => CommandChange::AddReferenceResolveInfo {
                at,
                new_resolve_info,
            },
            ReferenceResolveInfoDeleted {
                at,
                deleted_resolve_info,
            } => CommandChange::DeleteReferenceResolveInfo {
                at,
                deleted_resolve_info,
            },
            ReferenceResolveInfoChanged {
                at,
                old_resolve_info,
                new_resolve_info,
            } => CommandChange::ChangeReferenceResolveInfo {
                at,
                old_resolve_info,
                new_resolve_info,
            },
            ReferenceTargetAdded { at, new_target } => {
                CommandChange::AddReferenceTarget { at, new_target }
            }
            ReferenceTargetDeleted { at, deleted_target } => {
                CommandChange::DeleteReferenceTarget { at, deleted_target }
            }
            ReferenceTargetChanged {
                at,
                old_target,
                new_target,
            } => CommandChange::ChangeReferenceTarget {
                at,
                old_target,
                new_target,
            },
        };
        Ok(command)
    }

    /// Partition roots this change touches, given a lookup from node to partition.
    ///
    /// Partition-level changes report their own root.
    pub fn affected_partitions<F>(&self, partition_of: F) -> Vec<NodeId>
    where
        F: Fn(&NodeId) -> Option<NodeId>,
    {
        use EventChange::*;
        let mut out: Vec<NodeId> = Vec::new();
        let mut push = |id: Option<NodeId>| {
            if let Some(id) = id {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
        };
        match self {
            PartitionAdded { new_partition: c } | PartitionDeleted { deleted_partition: c } => {
                push(root_id(c).ok())
            }
            ChildMovedFromOtherContainment { from, to, .. }
            | ChildMovedAndReplacedFromOtherContainment { from, to, .. } => {
                push(partition_of(&from.parent));
                push(partition_of(&to.parent));
            }
            AnnotationMovedFromOtherParent { from, to, .. }
            | AnnotationMovedAndReplacedFromOtherParent { from, to, .. } => {
                push(partition_of(&from.parent));
                push(partition_of(&to.parent));
            }
            EntryMovedFromOtherReference { from, to, .. }
            | EntryMovedAndReplacedFromOtherReference { from, to, .. } => {
                push(partition_of(&from.parent));
                push(partition_of(&to.parent));
            }
            other => {
                if let Ok(command) = other.to_command() {
                    if let Some(anchor) = command.anchor() {
                        push(partition_of(anchor));
                    }
                }
            }
        }
        out
    }
}

/// Which command caused an event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandOrigin {
    pub participation: ParticipationId,
    pub command_id: CommandId,
}

impl CommandOrigin {
    pub fn new(participation: ParticipationId, command_id: CommandId) -> Self {
        Self {
            participation,
            command_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventBody {
    Atomic(EventChange),
    Composite(Vec<EventChange>),
}

/// An event as raised locally or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    /// Stamped by the repository when the event is sent out.
    #[serde(default)]
    pub sequence: Option<SequenceNumber>,
    #[serde(default)]
    pub origin: Vec<CommandOrigin>,
    pub body: EventBody,
    #[serde(default)]
    pub messages: Vec<ProtocolMessage>,
}

impl Event {
    pub fn atomic(event_id: EventId, change: EventChange) -> Self {
        Self {
            event_id,
            sequence: None,
            origin: Vec::new(),
            body: EventBody::Atomic(change),
            messages: Vec::new(),
        }
    }

    pub fn composite(event_id: EventId, changes: Vec<EventChange>) -> Self {
        Self {
            event_id,
            sequence: None,
            origin: Vec::new(),
            body: EventBody::Composite(changes),
            messages: Vec::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: SequenceNumber) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_origin(mut self, origin: CommandOrigin) -> Self {
        self.origin.push(origin);
        self
    }

    pub fn with_message(mut self, message: ProtocolMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn shape(&self) -> Shape {
        match &self.body {
            EventBody::Atomic(change) => change.shape(),
            EventBody::Composite(_) => Shape::Composite,
        }
    }

    pub fn changes(&self) -> &[EventChange] {
        match &self.body {
            EventBody::Atomic(change) => std::slice::from_ref(change),
            EventBody::Composite(changes) => changes,
        }
    }

    /// Was this event caused by a command `participation` issued?
    pub fn originates_from(&self, participation: &ParticipationId) -> bool {
        self.origin.iter().any(|o| &o.participation == participation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;

    fn mp(key: &str) -> MetaPointer {
        MetaPointer::new("shapes", "1", key)
    }

    #[test]
    fn test_deleted_child_translates_to_root_id() {
        let change = EventChange::ChildDeleted {
            at: ChildSlot::new("g", mp("shapes"), 0),
            deleted_child: Chunk::new(vec![
                Node::new("c", mp("Circle"))
                    .with_parent("g")
                    .with_child(mp("center"), "p"),
                Node::new("p", mp("Point")).with_parent("c"),
            ]),
        };

        assert_eq!(change.shape(), Shape::DeleteChild);
        assert_eq!(
            change.to_command().unwrap(),
            CommandChange::DeleteChild {
                at: ChildSlot::new("g", mp("shapes"), 0),
                deleted_child: "c".into(),
            }
        );
    }

    #[test]
    fn test_empty_deleted_chunk_has_no_command() {
        let change = EventChange::PartitionDeleted {
            deleted_partition: Chunk::new(Vec::new()),
        };
        assert!(matches!(
            change.to_command(),
            Err(ModelError::MalformedChunk(_))
        ));
        assert!(change.affected_partitions(|n| Some(n.clone())).is_empty());
    }

    #[test]
    fn test_cross_partition_move_touches_both() {
        let change = EventChange::ChildMovedFromOtherContainment {
            from: ChildSlot::new("a1", mp("items"), 0),
            to: ChildSlot::new("b1", mp("items"), 0),
            moved_child: "m".into(),
        };
        let partitions =
            change.affected_partitions(|n| Some(NodeId::new(&n.as_str()[..1])));
        assert_eq!(partitions, vec![NodeId::from("a"), NodeId::from("b")]);
    }

    #[test]
    fn test_composite_event_shape() {
        let event = Event::composite(
            "repo-evt-3".into(),
            vec![EventChange::PropertyAdded {
                node: "n".into(),
                property: mp("name"),
                new_value: "x".into(),
            }],
        )
        .with_sequence(3)
        .with_origin(CommandOrigin::new("client".into(), "client-cmd-0".into()));

        assert_eq!(event.shape(), Shape::Composite);
        assert_eq!(event.changes().len(), 1);
        assert!(event.originates_from(&"client".into()));
        assert!(!event.originates_from(&"other".into()));
    }
}
