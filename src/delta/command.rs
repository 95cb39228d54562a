//! Commands: requests to change the forest

use serde::{Deserialize, Serialize};

use crate::ids::{CommandId, MetaPointer, NodeId, ParticipationId};
use crate::model::{Chunk, ReferenceTarget};

use super::{AnnotationSlot, ChildSlot, EntrySlot, ProtocolMessage, Shape};

/// One atomic edit request.
///
/// Entries of reference features have no identity of their own, so commands
/// touching an entry carry the entry content they expect to find.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommandChange {
    AddPartition {
        new_partition: Chunk,
    },
    DeletePartition {
        deleted_partition: NodeId,
    },
    ChangeClassifier {
        node: NodeId,
        new_classifier: MetaPointer,
    },
    AddProperty {
        node: NodeId,
        property: MetaPointer,
        new_value: String,
    },
    DeleteProperty {
        node: NodeId,
        property: MetaPointer,
    },
    ChangeProperty {
        node: NodeId,
        property: MetaPointer,
        new_value: String,
    },
    AddChild {
        at: ChildSlot,
        new_child: Chunk,
    },
    DeleteChild {
        at: ChildSlot,
        deleted_child: NodeId,
    },
    ReplaceChild {
        at: ChildSlot,
        replaced_child: NodeId,
        new_child: Chunk,
    },
    MoveChildFromOtherContainment {
        to: ChildSlot,
        moved_child: NodeId,
    },
    MoveChildFromOtherContainmentInSameParent {
        to: ChildSlot,
        moved_child: NodeId,
    },
    MoveChildInSameContainment {
        new_index: usize,
        moved_child: NodeId,
    },
    MoveAndReplaceChildFromOtherContainment {
        to: ChildSlot,
        moved_child: NodeId,
        replaced_child: NodeId,
    },
    MoveAndReplaceChildFromOtherContainmentInSameParent {
        to: ChildSlot,
        moved_child: NodeId,
        replaced_child: NodeId,
    },
    MoveAndReplaceChildInSameContainment {
        new_index: usize,
        moved_child: NodeId,
        replaced_child: NodeId,
    },
    AddAnnotation {
        at: AnnotationSlot,
        new_annotation: Chunk,
    },
    DeleteAnnotation {
        at: AnnotationSlot,
        deleted_annotation: NodeId,
    },
    ReplaceAnnotation {
        at: AnnotationSlot,
        replaced_annotation: NodeId,
        new_annotation: Chunk,
    },
    MoveAnnotationFromOtherParent {
        to: AnnotationSlot,
        moved_annotation: NodeId,
    },
    MoveAnnotationInSameParent {
        new_index: usize,
        moved_annotation: NodeId,
    },
    MoveAndReplaceAnnotationFromOtherParent {
        to: AnnotationSlot,
        moved_annotation: NodeId,
        replaced_annotation: NodeId,
    },
    MoveAndReplaceAnnotationInSameParent {
        new_index: usize,
        moved_annotation: NodeId,
        replaced_annotation: NodeId,
    },
    AddReference {
        at: EntrySlot,
        new_entry: ReferenceTarget,
    },
    DeleteReference {
        at: EntrySlot,
        deleted_entry: ReferenceTarget,
    },
    ChangeReference {
        at: EntrySlot,
        old_entry: ReferenceTarget,
        new_entry: ReferenceTarget,
    },
    MoveEntryFromOtherReference {
        from: EntrySlot,
        to: EntrySlot,
        moved_entry: ReferenceTarget,
    },
    MoveEntryFromOtherReferenceInSameParent {
        from: EntrySlot,
        to: EntrySlot,
        moved_entry: ReferenceTarget,
    },
    MoveEntryInSameReference {
        from: EntrySlot,
        new_index: usize,
        moved_entry: ReferenceTarget,
    },
    MoveAndReplaceEntryFromOtherReference {
        from: EntrySlot,
        to: EntrySlot,
        moved_entry: ReferenceTarget,
        replaced_entry: ReferenceTarget,
    },
    MoveAndReplaceEntryFromOtherReferenceInSameParent {
        from: EntrySlot,
        to: EntrySlot,
        moved_entry: ReferenceTarget,
        replaced_entry: ReferenceTarget,
    },
    MoveAndReplaceEntryInSameReference {
        from: EntrySlot,
        new_index: usize,
        moved_entry: ReferenceTarget,
        replaced_entry: ReferenceTarget,
    },
    AddReferenceResolveInfo {
        at: EntrySlot,
        new_resolve_info: String,
    },
    DeleteReferenceResolveInfo {
        at: EntrySlot,
        deleted_resolve_info: String,
    },
    ChangeReferenceResolveInfo {
        at: EntrySlot,
        old_resolve_info: String,
        new_resolve_info: String,
    },
    AddReferenceTarget {
        at: EntrySlot,
        new_target: NodeId,
    },
    DeleteReferenceTarget {
        at: EntrySlot,
        deleted_target: NodeId,
    },
    ChangeReferenceTarget {
        at: EntrySlot,
        old_target: NodeId,
        new_target: NodeId,
    },
}

impl CommandChange {
    pub fn shape(&self) -> Shape {
        use CommandChange::*;
        match self {
            AddPartition { .. } => Shape::AddPartition,
            DeletePartition { .. } => Shape::DeletePartition,
            ChangeClassifier { .. } => Shape::ChangeClassifier,
            AddProperty { .. } => Shape::AddProperty,
            DeleteProperty { .. } => Shape::DeleteProperty,
            ChangeProperty { .. } => Shape::ChangeProperty,
            AddChild { .. } => Shape::AddChild,
            DeleteChild { .. } => Shape::DeleteChild,
            ReplaceChild { .. } => Shape::ReplaceChild,
            MoveChildFromOtherContainment { .. } => Shape::MoveChildFromOtherContainment,
            MoveChildFromOtherContainmentInSameParent { .. } => {
                Shape::MoveChildFromOtherContainmentInSameParent
            }
            MoveChildInSameContainment { .. } => Shape::MoveChildInSameContainment,
            MoveAndReplaceChildFromOtherContainment { .. } => {
                Shape::MoveAndReplaceChildFromOtherContainment
            }
            MoveAndReplaceChildFromOtherContainmentInSameParent { .. } => {
                Shape::MoveAndReplaceChildFromOtherContainmentInSameParent
            }
            MoveAndReplaceChildInSameContainment { .. } => {
                Shape::MoveAndReplaceChildInSameContainment
            }
            AddAnnotation { .. } => Shape::AddAnnotation,
            DeleteAnnotation { .. } => Shape::DeleteAnnotation,
            ReplaceAnnotation { .. } => Shape::ReplaceAnnotation,
            MoveAnnotationFromOtherParent { .. } => Shape::MoveAnnotationFromOtherParent,
            MoveAnnotationInSameParent { .. } => Shape::MoveAnnotationInSameParent,
            MoveAndReplaceAnnotationFromOtherParent { .. } => {
                Shape::MoveAndReplaceAnnotationFromOtherParent
            }
            MoveAndReplaceAnnotationInSameParent { .. } => {
                Shape::MoveAndReplaceAnnotationInSameParent
            }
            AddReference { .. } => Shape::AddReference,
            DeleteReference { .. } => Shape::DeleteReference,
            ChangeReference { .. } => Shape::ChangeReference,
            MoveEntryFromOtherReference { .. } => Shape::MoveEntryFromOtherReference,
            MoveEntryFromOtherReferenceInSameParent { .. } => {
                Shape::MoveEntryFromOtherReferenceInSameParent
            }
            MoveEntryInSameReference { .. } => Shape::MoveEntryInSameReference,
            MoveAndReplaceEntryFromOtherReference { .. } => {
                Shape::MoveAndReplaceEntryFromOtherReference
            }
            MoveAndReplaceEntryFromOtherReferenceInSameParent { .. } => {
                Shape::MoveAndReplaceEntryFromOtherReferenceInSameParent
            }
            MoveAndReplaceEntryInSameReference { .. } => Shape::MoveAndReplaceEntryInSameReference,
            AddReferenceResolveInfo { .. } => Shape::AddReferenceResolveInfo,
            DeleteReferenceResolveInfo { .. } => Shape::DeleteReferenceResolveInfo,
            ChangeReferenceResolveInfo { .. } => Shape::ChangeReferenceResolveInfo,
            AddReferenceTarget { .. } => Shape::AddReferenceTarget,
            DeleteReferenceTarget { .. } => Shape::DeleteReferenceTarget,
            ChangeReferenceTarget { .. } => Shape::ChangeReferenceTarget,
        }
    }

    /// Partition-level changes are handled by the forest, not by a partition.
    pub fn is_forest_level(&self) -> bool {
        matches!(
            self,
            CommandChange::AddPartition { .. } | CommandChange::DeletePartition { .. }
        )
    }

    /// A node that must already exist for this change to apply; used to find
    /// the owning partition. `None` for partition-level changes.
    pub fn anchor(&self) -> Option<&NodeId> {
        use CommandChange::*;
        match self {
            AddPartition { .. } | DeletePartition { .. } => None,
            ChangeClassifier { node, .. }
            | AddProperty { node, .. }
            | DeleteProperty { node, .. }
            | ChangeProperty { node, .. } => Some(node),
            AddChild { at, .. } | DeleteChild { at, .. } | ReplaceChild { at, .. } => {
                Some(&at.parent)
            }
            MoveChildFromOtherContainment { to, .. }
            | MoveChildFromOtherContainmentInSameParent { to, .. }
            | MoveAndReplaceChildFromOtherContainment { to, .. }
            | MoveAndReplaceChildFromOtherContainmentInSameParent { to, .. } => Some(&to.parent),
            MoveChildInSameContainment { moved_child, .. }
            | MoveAndReplaceChildInSameContainment { moved_child, .. } => Some(moved_child),
            AddAnnotation { at, .. }
            | DeleteAnnotation { at, .. }
            | ReplaceAnnotation { at, .. } => Some(&at.parent),
            MoveAnnotationFromOtherParent { to, .. }
            | MoveAndReplaceAnnotationFromOtherParent { to, .. } => Some(&to.parent),
            MoveAnnotationInSameParent {
                moved_annotation, ..
            }
            | MoveAndReplaceAnnotationInSameParent {
                moved_annotation, ..
            } => Some(moved_annotation),
            AddReference { at, .. }
            | DeleteReference { at, .. }
            | ChangeReference { at, .. }
            | AddReferenceResolveInfo { at, .. }
            | DeleteReferenceResolveInfo { at, .. }
            | ChangeReferenceResolveInfo { at, .. }
            | AddReferenceTarget { at, .. }
            | DeleteReferenceTarget { at, .. }
            | ChangeReferenceTarget { at, .. } => Some(&at.parent),
            MoveEntryFromOtherReference { to, .. }
            | MoveEntryFromOtherReferenceInSameParent { to, .. }
            | MoveAndReplaceEntryFromOtherReference { to, .. }
            | MoveAndReplaceEntryFromOtherReferenceInSameParent { to, .. } => Some(&to.parent),
            MoveEntryInSameReference { from, .. }
            | MoveAndReplaceEntryInSameReference { from, .. } => Some(&from.parent),
        }
    }
}

/// One atomic command with its id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicCommand {
    pub command_id: CommandId,
    pub change: CommandChange,
}

impl AtomicCommand {
    pub fn new(command_id: CommandId, change: CommandChange) -> Self {
        Self { command_id, change }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandBody {
    Atomic(AtomicCommand),
    /// Applied all-or-none. Has no command id of its own.
    Composite(Vec<AtomicCommand>),
}

/// A command as sent over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Who issued the command.
    pub participation: ParticipationId,
    pub body: CommandBody,
    #[serde(default)]
    pub messages: Vec<ProtocolMessage>,
}

impl Command {
    pub fn atomic(participation: ParticipationId, command_id: CommandId, change: CommandChange) -> Self {
        Self {
            participation,
            body: CommandBody::Atomic(AtomicCommand::new(command_id, change)),
            messages: Vec::new(),
        }
    }

    pub fn composite(participation: ParticipationId, parts: Vec<AtomicCommand>) -> Self {
        Self {
            participation,
            body: CommandBody::Composite(parts),
            messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: ProtocolMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn shape(&self) -> Shape {
        match &self.body {
            CommandBody::Atomic(a) => a.change.shape(),
            CommandBody::Composite(_) => Shape::Composite,
        }
    }

    /// The atomic parts, in order.
    pub fn parts(&self) -> &[AtomicCommand] {
        match &self.body {
            CommandBody::Atomic(a) => std::slice::from_ref(a),
            CommandBody::Composite(parts) => parts,
        }
    }

    pub fn command_ids(&self) -> impl Iterator<Item = &CommandId> {
        self.parts().iter().map(|p| &p.command_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp(key: &str) -> MetaPointer {
        MetaPointer::new("shapes", "1", key)
    }

    #[test]
    fn test_composite_has_no_own_id() {
        let command = Command::composite(
            "client".into(),
            vec![
                AtomicCommand::new(
                    "c1".into(),
                    CommandChange::AddProperty {
                        node: "n".into(),
                        property: mp("name"),
                        new_value: "x".into(),
                    },
                ),
                AtomicCommand::new(
                    "c2".into(),
                    CommandChange::DeleteProperty {
                        node: "n".into(),
                        property: mp("name"),
                    },
                ),
            ],
        );

        assert_eq!(command.shape(), Shape::Composite);
        let ids: Vec<_> = command.command_ids().map(|c| c.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_anchor_of_moves_is_the_destination() {
        let change = CommandChange::MoveChildFromOtherContainment {
            to: ChildSlot::new("target", mp("items"), 0),
            moved_child: "m".into(),
        };
        assert_eq!(change.anchor(), Some(&NodeId::from("target")));
        assert!(!change.is_forest_level());
        assert!(CommandChange::DeletePartition {
            deleted_partition: "p".into()
        }
        .is_forest_level());
    }
}
