//! Delta vocabulary
//!
//! The closed set of atomic tree edits, each available as a [`Command`]
//! (intent, sent towards the owner of the state) and as an [`Event`] (fact,
//! announced by the owner). Both directions share one [`Shape`] per edit.
//!
//! # Kinds and selectors
//!
//! Every delta has a concrete [`DeltaKind`]: direction plus shape. The
//! processor graph filters on [`DeltaSelector`]s, which expand to concrete
//! kinds through the explicit tables in this module. There is no runtime
//! type scanning: adding a shape means adding it to [`Shape::ALL`].

mod command;
mod event;
pub mod codec;

pub use command::{AtomicCommand, Command, CommandBody, CommandChange};
pub use event::{CommandOrigin, Event, EventBody, EventChange};

use serde::{Deserialize, Serialize};

use crate::ids::{MetaPointer, NodeId};
use crate::processor::{KindSelector, Message};

/// Position of a child inside a containment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildSlot {
    pub parent: NodeId,
    pub containment: MetaPointer,
    pub index: usize,
}

impl ChildSlot {
    pub fn new(parent: impl Into<NodeId>, containment: MetaPointer, index: usize) -> Self {
        Self {
            parent: parent.into(),
            containment,
            index,
        }
    }
}

/// Position inside a node's annotation list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnotationSlot {
    pub parent: NodeId,
    pub index: usize,
}

impl AnnotationSlot {
    pub fn new(parent: impl Into<NodeId>, index: usize) -> Self {
        Self {
            parent: parent.into(),
            index,
        }
    }
}

/// Position of an entry inside a reference feature.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntrySlot {
    pub parent: NodeId,
    pub reference: MetaPointer,
    pub index: usize,
}

impl EntrySlot {
    pub fn new(parent: impl Into<NodeId>, reference: MetaPointer, index: usize) -> Self {
        Self {
            parent: parent.into(),
            reference,
            index,
        }
    }
}

/// Diagnostic message attached to a delta.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub data: Vec<(String, String)>,
}

impl ProtocolMessage {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.push((key.into(), value.into()));
        self
    }
}

/// Edit shapes, shared by commands and events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Shape {
    AddPartition,
    DeletePartition,
    ChangeClassifier,
    AddProperty,
    DeleteProperty,
    ChangeProperty,
    AddChild,
    DeleteChild,
    ReplaceChild,
    MoveChildFromOtherContainment,
    MoveChildFromOtherContainmentInSameParent,
    MoveChildInSameContainment,
    MoveAndReplaceChildFromOtherContainment,
    MoveAndReplaceChildFromOtherContainmentInSameParent,
    MoveAndReplaceChildInSameContainment,
    AddAnnotation,
    DeleteAnnotation,
    ReplaceAnnotation,
    MoveAnnotationFromOtherParent,
    MoveAnnotationInSameParent,
    MoveAndReplaceAnnotationFromOtherParent,
    MoveAndReplaceAnnotationInSameParent,
    AddReference,
    DeleteReference,
    ChangeReference,
    MoveEntryFromOtherReference,
    MoveEntryFromOtherReferenceInSameParent,
    MoveEntryInSameReference,
    MoveAndReplaceEntryFromOtherReference,
    MoveAndReplaceEntryFromOtherReferenceInSameParent,
    MoveAndReplaceEntryInSameReference,
    AddReferenceResolveInfo,
    DeleteReferenceResolveInfo,
    ChangeReferenceResolveInfo,
    AddReferenceTarget,
    DeleteReferenceTarget,
    ChangeReferenceTarget,
    Composite,
}

/// Groups of shapes, by what they edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    Partition,
    Classifier,
    Property,
    Child,
    Annotation,
    Reference,
    Composite,
}

impl Shape {
    pub const ALL: [Shape; 38] = [
        Shape::AddPartition,
        Shape::DeletePartition,
        Shape::ChangeClassifier,
        Shape::AddProperty,
        Shape::DeleteProperty,
        Shape::ChangeProperty,
        Shape::AddChild,
        Shape::DeleteChild,
        Shape::ReplaceChild,
        Shape::MoveChildFromOtherContainment,
        Shape::MoveChildFromOtherContainmentInSameParent,
        Shape::MoveChildInSameContainment,
        Shape::MoveAndReplaceChildFromOtherContainment,
        Shape::MoveAndReplaceChildFromOtherContainmentInSameParent,
        Shape::MoveAndReplaceChildInSameContainment,
        Shape::AddAnnotation,
        Shape::DeleteAnnotation,
        Shape::ReplaceAnnotation,
        Shape::MoveAnnotationFromOtherParent,
        Shape::MoveAnnotationInSameParent,
        Shape::MoveAndReplaceAnnotationFromOtherParent,
        Shape::MoveAndReplaceAnnotationInSameParent,
        Shape::AddReference,
        Shape::DeleteReference,
        Shape::ChangeReference,
        Shape::MoveEntryFromOtherReference,
        Shape::MoveEntryFromOtherReferenceInSameParent,
        Shape::MoveEntryInSameReference,
        Shape::MoveAndReplaceEntryFromOtherReference,
        Shape::MoveAndReplaceEntryFromOtherReferenceInSameParent,
        Shape::MoveAndReplaceEntryInSameReference,
        Shape::AddReferenceResolveInfo,
        Shape::DeleteReferenceResolveInfo,
        Shape::ChangeReferenceResolveInfo,
        Shape::AddReferenceTarget,
        Shape::DeleteReferenceTarget,
        Shape::ChangeReferenceTarget,
        Shape::Composite,
    ];

    pub fn family(self) -> Family {
        use Shape::*;
        match self {
            AddPartition | DeletePartition => Family::Partition,
            ChangeClassifier => Family::Classifier,
            AddProperty | DeleteProperty | ChangeProperty => Family::Property,
            AddChild
            | DeleteChild
            | ReplaceChild
            | MoveChildFromOtherContainment
            | MoveChildFromOtherContainmentInSameParent
            | MoveChildInSameContainment
            | MoveAndReplaceChildFromOtherContainment
            | MoveAndReplaceChildFromOtherContainmentInSameParent
            | MoveAndReplaceChildInSameContainment => Family::Child,
            AddAnnotation
            | DeleteAnnotation
            | ReplaceAnnotation
            | MoveAnnotationFromOtherParent
            | MoveAnnotationInSameParent
            | MoveAndReplaceAnnotationFromOtherParent
            | MoveAndReplaceAnnotationInSameParent => Family::Annotation,
            Composite => Family::Composite,
            _ => Family::Reference,
        }
    }
}

/// Direction of a delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Command,
    Event,
}

/// Concrete kind of a delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeltaKind {
    pub direction: Direction,
    pub shape: Shape,
}

impl DeltaKind {
    pub const fn command(shape: Shape) -> Self {
        Self {
            direction: Direction::Command,
            shape,
        }
    }

    pub const fn event(shape: Shape) -> Self {
        Self {
            direction: Direction::Event,
            shape,
        }
    }
}

/// A category of delta kinds a subscriber asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeltaSelector {
    All,
    Commands,
    Events,
    CommandFamily(Family),
    EventFamily(Family),
    Exactly(DeltaKind),
}

impl KindSelector<DeltaKind> for DeltaSelector {
    fn all() -> Self {
        DeltaSelector::All
    }

    fn expand(&self) -> Vec<DeltaKind> {
        let pick = |direction: Direction, keep: &dyn Fn(Shape) -> bool| -> Vec<DeltaKind> {
            Shape::ALL
                .iter()
                .copied()
                .filter(|s| keep(*s))
                .map(|shape| DeltaKind { direction, shape })
                .collect()
        };
        match self {
            DeltaSelector::All => {
                let mut kinds = pick(Direction::Command, &|_| true);
                kinds.extend(pick(Direction::Event, &|_| true));
                kinds
            }
            DeltaSelector::Commands => pick(Direction::Command, &|_| true),
            DeltaSelector::Events => pick(Direction::Event, &|_| true),
            DeltaSelector::CommandFamily(f) => pick(Direction::Command, &|s| s.family() == *f),
            DeltaSelector::EventFamily(f) => pick(Direction::Event, &|s| s.family() == *f),
            DeltaSelector::Exactly(kind) => vec![*kind],
        }
    }
}

/// Unit of exchange between participants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    Command(Command),
    Event(Event),
}

impl Delta {
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Delta::Event(e) => Some(e),
            Delta::Command(_) => None,
        }
    }

    pub fn as_command(&self) -> Option<&Command> {
        match self {
            Delta::Command(c) => Some(c),
            Delta::Event(_) => None,
        }
    }
}

impl Message for Delta {
    type Kind = DeltaKind;
    type Selector = DeltaSelector;

    fn kind(&self) -> DeltaKind {
        match self {
            Delta::Command(c) => DeltaKind::command(c.shape()),
            Delta::Event(e) => DeltaKind::event(e.shape()),
        }
    }
}
