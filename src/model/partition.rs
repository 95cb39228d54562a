//! Partition: one root node and its containment subtree
//!
//! [`Partition`] is the commander for node-level edits. Every edit goes
//! through [`Partition::execute`], which validates it against the shared node
//! map, applies it, and raises exactly one event on the [`PartitionPublisher`].

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use crate::delta::{
    AnnotationSlot, ChildSlot, CommandChange, Delta, DeltaKind, EntrySlot, Event, Shape,
};
use crate::ids::{EventIdSource, MetaPointer, NodeId};
use crate::processor::{Outbox, Processor};

use super::{Chunk, ModelError, Node, ReferenceTarget, SharedNodeMap, Slot};

/// Publisher side of a partition.
pub struct PartitionPublisher {
    name: String,
    outbox: Outbox<Delta>,
}

impl PartitionPublisher {
    fn new(root: &NodeId) -> Self {
        Self {
            name: format!("partition[{}]", root),
            outbox: Outbox::new(),
        }
    }

    pub fn can_raise(&self, shape: Shape) -> bool {
        self.outbox.can_receive(&[DeltaKind::event(shape)])
    }
}

impl Processor<Delta> for PartitionPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbox(&self) -> &Outbox<Delta> {
        &self.outbox
    }

    fn receive(&self, message: &Delta) {
        self.outbox.send(message);
    }
}

/// Handle to a partition of a [`Forest`](super::Forest).
#[derive(Clone)]
pub struct Partition {
    root: NodeId,
    map: Rc<RefCell<SharedNodeMap>>,
    event_ids: Rc<EventIdSource>,
    publisher: Rc<PartitionPublisher>,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition").field("root", &self.root).finish_non_exhaustive()
    }
}

impl Partition {
    pub(super) fn new(
        root: NodeId,
        map: Rc<RefCell<SharedNodeMap>>,
        event_ids: Rc<EventIdSource>,
    ) -> Self {
        Self {
            publisher: Rc::new(PartitionPublisher::new(&root)),
            root,
            map,
            event_ids,
        }
    }

    pub fn root(&self) -> &NodeId {
        &self.root
    }

    pub fn publisher(&self) -> &Rc<PartitionPublisher> {
        &self.publisher
    }

    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.map.borrow().get(id).cloned()
    }

    /// Does `id` belong to this partition?
    pub fn holds(&self, id: &NodeId) -> bool {
        self.map.borrow().partition_of(id).as_ref() == Some(&self.root)
    }

    /// Snapshot of the whole partition, root first.
    pub fn snapshot(&self) -> Result<Chunk, ModelError> {
        self.map.borrow().extract(&self.root)
    }

    /// Validate, apply and announce one node-level change.
    pub fn execute(&self, change: &CommandChange) -> Result<(), ModelError> {
        let anchor = change.anchor().ok_or_else(|| {
            ModelError::InvalidMutation("partition-level changes go through the forest".into())
        })?;
        if !self.holds(anchor) {
            return Err(ModelError::InvalidMutation(format!(
                "{} is not in partition {}",
                anchor, self.root
            )));
        }

        let applied = self.map.borrow_mut().apply(change)?;
        trace!("{}: {:?}", self.publisher.name, applied.shape());

        if self.publisher.can_raise(applied.shape()) {
            let event = Event::atomic(self.event_ids.next_id(), applied);
            self.publisher.outbox.send(&Delta::Event(event));
        }
        Ok(())
    }

    // --- convenience operations ---

    fn position(&self, id: &NodeId) -> Result<(NodeId, Slot, usize), ModelError> {
        let map = self.map.borrow();
        let node = map.require(id)?;
        let parent = node
            .parent
            .clone()
            .ok_or_else(|| ModelError::InvalidMutation(format!("{} has no parent", id)))?;
        let (slot, index) = map.require(&parent)?.locate(id).ok_or_else(|| {
            ModelError::InvalidMutation(format!("{} is not listed by {}", id, parent))
        })?;
        Ok((parent, slot, index))
    }

    fn entry(&self, at: &EntrySlot) -> Result<ReferenceTarget, ModelError> {
        let map = self.map.borrow();
        let entries = map.require(&at.parent)?.entries(&at.reference);
        entries
            .get(at.index)
            .cloned()
            .ok_or_else(|| ModelError::IndexOutOfBounds {
                node: at.parent.clone(),
                feature: at.reference.to_string(),
                index: at.index,
                len: entries.len(),
            })
    }

    /// Set, change or clear a property, whichever applies. Setting the current
    /// value raises nothing.
    pub fn set_property(
        &self,
        node: &NodeId,
        property: &MetaPointer,
        value: Option<&str>,
    ) -> Result<(), ModelError> {
        let current = self
            .map
            .borrow()
            .require(node)?
            .property(property)
            .map(str::to_string);
        let change = match (current, value) {
            (None, None) => return Ok(()),
            (Some(old), Some(new)) if old == new => return Ok(()),
            (None, Some(new)) => CommandChange::AddProperty {
                node: node.clone(),
                property: property.clone(),
                new_value: new.to_string(),
            },
            (Some(_), Some(new)) => CommandChange::ChangeProperty {
                node: node.clone(),
                property: property.clone(),
                new_value: new.to_string(),
            },
            (Some(_), None) => CommandChange::DeleteProperty {
                node: node.clone(),
                property: property.clone(),
            },
        };
        self.execute(&change)
    }

    pub fn change_classifier(&self, node: &NodeId, classifier: MetaPointer) -> Result<(), ModelError> {
        self.execute(&CommandChange::ChangeClassifier {
            node: node.clone(),
            new_classifier: classifier,
        })
    }

    pub fn add_child(
        &self,
        parent: &NodeId,
        containment: &MetaPointer,
        index: usize,
        child: Chunk,
    ) -> Result<(), ModelError> {
        self.execute(&CommandChange::AddChild {
            at: ChildSlot::new(parent.clone(), containment.clone(), index),
            new_child: child,
        })
    }

    pub fn delete_child(&self, child: &NodeId) -> Result<(), ModelError> {
        match self.position(child)? {
            (parent, Slot::Containment(containment), index) => {
                self.execute(&CommandChange::DeleteChild {
                    at: ChildSlot::new(parent, containment, index),
                    deleted_child: child.clone(),
                })
            }
            (_, Slot::Annotation, _) => Err(ModelError::InvalidMutation(format!(
                "{} is an annotation",
                child
            ))),
        }
    }

    pub fn replace_child(&self, replaced: &NodeId, child: Chunk) -> Result<(), ModelError> {
        match self.position(replaced)? {
            (parent, Slot::Containment(containment), index) => {
                self.execute(&CommandChange::ReplaceChild {
                    at: ChildSlot::new(parent, containment, index),
                    replaced_child: replaced.clone(),
                    new_child: child,
                })
            }
            (_, Slot::Annotation, _) => Err(ModelError::InvalidMutation(format!(
                "{} is an annotation",
                replaced
            ))),
        }
    }

    /// Move a child to `index` of `containment` under `parent`, using the move
    /// variant that matches where the child is now.
    pub fn move_child(
        &self,
        child: &NodeId,
        parent: &NodeId,
        containment: &MetaPointer,
        index: usize,
    ) -> Result<(), ModelError> {
        let (old_parent, old_slot, _) = self.position(child)?;
        let to = ChildSlot::new(parent.clone(), containment.clone(), index);
        let change = if &old_parent != parent {
            CommandChange::MoveChildFromOtherContainment {
                to,
                moved_child: child.clone(),
            }
        } else if old_slot != Slot::Containment(containment.clone()) {
            CommandChange::MoveChildFromOtherContainmentInSameParent {
                to,
                moved_child: child.clone(),
            }
        } else {
            CommandChange::MoveChildInSameContainment {
                new_index: index,
                moved_child: child.clone(),
            }
        };
        self.execute(&change)
    }

    /// Move `child` onto the position of `replaced`, deleting `replaced`.
    pub fn move_and_replace_child(&self, child: &NodeId, replaced: &NodeId) -> Result<(), ModelError> {
        let (old_parent, old_slot, _) = self.position(child)?;
        let (parent, slot, index) = self.position(replaced)?;
        let containment = match &slot {
            Slot::Containment(c) => c.clone(),
            Slot::Annotation => {
                return Err(ModelError::InvalidMutation(format!(
                    "{} is an annotation",
                    replaced
                )))
            }
        };
        let moved_child = child.clone();
        let replaced_child = replaced.clone();
        let change = if old_parent != parent {
            CommandChange::MoveAndReplaceChildFromOtherContainment {
                to: ChildSlot::new(parent, containment, index),
                moved_child,
                replaced_child,
            }
        } else if old_slot != slot {
            CommandChange::MoveAndReplaceChildFromOtherContainmentInSameParent {
                to: ChildSlot::new(parent, containment, index),
                moved_child,
                replaced_child,
            }
        } else {
            CommandChange::MoveAndReplaceChildInSameContainment {
                new_index: index,
                moved_child,
                replaced_child,
            }
        };
        self.execute(&change)
    }

    pub fn add_annotation(&self, parent: &NodeId, index: usize, annotation: Chunk) -> Result<(), ModelError> {
        self.execute(&CommandChange::AddAnnotation {
            at: AnnotationSlot::new(parent.clone(), index),
            new_annotation: annotation,
        })
    }

    fn annotation_position(&self, id: &NodeId) -> Result<(NodeId, usize), ModelError> {
        match self.position(id)? {
            (parent, Slot::Annotation, index) => Ok((parent, index)),
            _ => Err(ModelError::InvalidMutation(format!(
                "{} is not an annotation",
                id
            ))),
        }
    }

    pub fn delete_annotation(&self, annotation: &NodeId) -> Result<(), ModelError> {
        let (parent, index) = self.annotation_position(annotation)?;
        self.execute(&CommandChange::DeleteAnnotation {
            at: AnnotationSlot::new(parent, index),
            deleted_annotation: annotation.clone(),
        })
    }

    pub fn replace_annotation(&self, replaced: &NodeId, annotation: Chunk) -> Result<(), ModelError> {
        let (parent, index) = self.annotation_position(replaced)?;
        self.execute(&CommandChange::ReplaceAnnotation {
            at: AnnotationSlot::new(parent, index),
            replaced_annotation: replaced.clone(),
            new_annotation: annotation,
        })
    }

    pub fn move_annotation(&self, annotation: &NodeId, parent: &NodeId, index: usize) -> Result<(), ModelError> {
        let (old_parent, _) = self.annotation_position(annotation)?;
        let change = if &old_parent == parent {
            CommandChange::MoveAnnotationInSameParent {
                new_index: index,
                moved_annotation: annotation.clone(),
            }
        } else {
            CommandChange::MoveAnnotationFromOtherParent {
                to: AnnotationSlot::new(parent.clone(), index),
                moved_annotation: annotation.clone(),
            }
        };
        self.execute(&change)
    }

    pub fn move_and_replace_annotation(
        &self,
        annotation: &NodeId,
        replaced: &NodeId,
    ) -> Result<(), ModelError> {
        let (old_parent, _) = self.annotation_position(annotation)?;
        let (parent, index) = self.annotation_position(replaced)?;
        let change = if old_parent == parent {
            CommandChange::MoveAndReplaceAnnotationInSameParent {
                new_index: index,
                moved_annotation: annotation.clone(),
                replaced_annotation: replaced.clone(),
            }
        } else {
            CommandChange::MoveAndReplaceAnnotationFromOtherParent {
                to: AnnotationSlot::new(parent, index),
                moved_annotation: annotation.clone(),
                replaced_annotation: replaced.clone(),
            }
        };
        self.execute(&change)
    }

    pub fn add_reference(&self, at: EntrySlot, entry: ReferenceTarget) -> Result<(), ModelError> {
        self.execute(&CommandChange::AddReference {
            at,
            new_entry: entry,
        })
    }

    pub fn delete_reference(&self, at: EntrySlot) -> Result<(), ModelError> {
        let deleted_entry = self.entry(&at)?;
        self.execute(&CommandChange::DeleteReference { at, deleted_entry })
    }

    pub fn change_reference(&self, at: EntrySlot, entry: ReferenceTarget) -> Result<(), ModelError> {
        let old_entry = self.entry(&at)?;
        if old_entry == entry {
            return Ok(());
        }
        self.execute(&CommandChange::ChangeReference {
            at,
            old_entry,
            new_entry: entry,
        })
    }

    /// Move the entry at `from` to `to`, picking the variant from the two slots.
    pub fn move_entry(&self, from: EntrySlot, to: EntrySlot) -> Result<(), ModelError> {
        let moved_entry = self.entry(&from)?;
        let change = if from.parent != to.parent {
            CommandChange::MoveEntryFromOtherReference {
                from,
                to,
                moved_entry,
            }
        } else if from.reference != to.reference {
            CommandChange::MoveEntryFromOtherReferenceInSameParent {
                from,
                to,
                moved_entry,
            }
        } else {
            CommandChange::MoveEntryInSameReference {
                from,
                new_index: to.index,
                moved_entry,
            }
        };
        self.execute(&change)
    }

    /// Move the entry at `from` over the entry at `to`.
    pub fn move_and_replace_entry(&self, from: EntrySlot, to: EntrySlot) -> Result<(), ModelError> {
        let moved_entry = self.entry(&from)?;
        let replaced_entry = self.entry(&to)?;
        let change = if from.parent != to.parent {
            CommandChange::MoveAndReplaceEntryFromOtherReference {
                from,
                to,
                moved_entry,
                replaced_entry,
            }
        } else if from.reference != to.reference {
            CommandChange::MoveAndReplaceEntryFromOtherReferenceInSameParent {
                from,
                to,
                moved_entry,
                replaced_entry,
            }
        } else {
            CommandChange::MoveAndReplaceEntryInSameReference {
                from,
                new_index: to.index,
                moved_entry,
                replaced_entry,
            }
        };
        self.execute(&change)
    }

    /// Set, change or clear the resolved target of an entry.
    pub fn set_reference_target(&self, at: EntrySlot, target: Option<NodeId>) -> Result<(), ModelError> {
        let current = self.entry(&at)?.target;
        let change = match (current, target) {
            (None, None) => return Ok(()),
            (Some(old), Some(new)) if old == new => return Ok(()),
            (None, Some(new_target)) => CommandChange::AddReferenceTarget { at, new_target },
            (Some(old_target), Some(new_target)) => CommandChange::ChangeReferenceTarget {
                at,
                old_target,
                new_target,
            },
            (Some(deleted_target), None) => {
                CommandChange::DeleteReferenceTarget { at, deleted_target }
            }
        };
        self.execute(&change)
    }

    /// Set, change or clear the cached label of an entry.
    pub fn set_resolve_info(&self, at: EntrySlot, info: Option<&str>) -> Result<(), ModelError> {
        let current = self.entry(&at)?.resolve_info;
        let change = match (current, info) {
            (None, None) => return Ok(()),
            (Some(old), Some(new)) if old == new => return Ok(()),
            (None, Some(new)) => CommandChange::AddReferenceResolveInfo {
                at,
                new_resolve_info: new.to_string(),
            },
            (Some(old_resolve_info), Some(new)) => CommandChange::ChangeReferenceResolveInfo {
                at,
                old_resolve_info,
                new_resolve_info: new.to_string(),
            },
            (Some(deleted_resolve_info), None) => CommandChange::DeleteReferenceResolveInfo {
                at,
                deleted_resolve_info,
            },
        };
        self.execute(&change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaSelector, EventChange};
    use crate::model::Forest;
    use crate::processor::Handler;

    fn mp(key: &str) -> MetaPointer {
        MetaPointer::new("shapes", "1", key)
    }

    fn setup() -> (Forest, Partition, Rc<RefCell<Vec<Event>>>) {
        let forest = Forest::new("client");
        let partition = forest
            .add_partition(Chunk::new(vec![
                Node::new("doc", mp("Document"))
                    .with_child(mp("shapes"), "a")
                    .with_child(mp("shapes"), "b"),
                Node::new("a", mp("Circle")).with_parent("doc"),
                Node::new("b", mp("Circle")).with_parent("doc"),
            ]))
            .unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        {
            let events = Rc::clone(&events);
            partition.publisher().subscribe(
                Rc::new(Handler::new("log", move |d: &Delta| {
                    if let Some(e) = d.as_event() {
                        events.borrow_mut().push(e.clone());
                    }
                })),
                DeltaSelector::Events,
            );
        }
        (forest, partition, events)
    }

    #[test]
    fn test_each_edit_raises_one_event() {
        let (_forest, partition, events) = setup();
        let a: NodeId = "a".into();

        partition.set_property(&a, &mp("radius"), Some("1")).unwrap();
        partition.set_property(&a, &mp("radius"), Some("1")).unwrap();
        partition.set_property(&a, &mp("radius"), Some("2")).unwrap();
        partition.set_property(&a, &mp("radius"), None).unwrap();

        let shapes: Vec<Shape> = events.borrow().iter().map(|e| e.shape()).collect();
        assert_eq!(
            shapes,
            vec![Shape::AddProperty, Shape::ChangeProperty, Shape::DeleteProperty]
        );
        let ids: Vec<String> = events.borrow().iter().map(|e| e.event_id.to_string()).collect();
        assert_eq!(ids, vec!["client-evt-0", "client-evt-1", "client-evt-2"]);
    }

    #[test]
    fn test_move_child_picks_variant() {
        let (_forest, partition, events) = setup();
        let a: NodeId = "a".into();
        let doc: NodeId = "doc".into();

        partition.move_child(&a, &doc, &mp("shapes"), 1).unwrap();
        partition.move_child(&a, &doc, &mp("extra"), 0).unwrap();
        partition.move_child(&a, &"b".into(), &mp("inner"), 0).unwrap();

        let shapes: Vec<Shape> = events.borrow().iter().map(|e| e.shape()).collect();
        assert_eq!(
            shapes,
            vec![
                Shape::MoveChildInSameContainment,
                Shape::MoveChildFromOtherContainmentInSameParent,
                Shape::MoveChildFromOtherContainment,
            ]
        );
        assert_eq!(partition.node(&a).unwrap().parent, Some(NodeId::from("b")));
    }

    #[test]
    fn test_rejected_edit_raises_nothing() {
        let (_forest, partition, events) = setup();
        let err = partition.delete_child(&"doc".into()).unwrap_err();
        assert!(matches!(err, ModelError::InvalidMutation(_)));
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn test_foreign_anchor_is_refused() {
        let (forest, partition, _events) = setup();
        forest
            .add_partition(Chunk::single(Node::new("other", mp("Document"))))
            .unwrap();
        let err = partition
            .set_property(&"other".into(), &mp("name"), Some("x"))
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidMutation(_)));
    }

    #[test]
    fn test_reference_helpers() {
        let (_forest, partition, events) = setup();
        let at = EntrySlot::new("a", mp("peer"), 0);
        partition.add_reference(at.clone(), ReferenceTarget::to("b")).unwrap();
        partition.set_resolve_info(at.clone(), Some("B")).unwrap();
        partition.set_reference_target(at.clone(), None).unwrap();

        assert_eq!(
            partition.node(&"a".into()).unwrap().entries(&mp("peer")),
            &[ReferenceTarget::dangling("B")]
        );
        let last = events.borrow().last().cloned().unwrap();
        assert_eq!(
            last.changes(),
            &[EventChange::ReferenceTargetDeleted {
                at,
                deleted_target: "b".into(),
            }]
        );
    }
}
