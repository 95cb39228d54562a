//! Applying commands to the node map
//!
//! Every change is validated in full before the map is touched, so a failed
//! command leaves no trace. The returned event carries the old values.

use std::mem::discriminant;

use crate::delta::{AnnotationSlot, ChildSlot, CommandChange, EntrySlot, EventChange};
use crate::ids::{MetaPointer, NodeId};

use super::{Chunk, FeatureKind, ModelError, Node, ReferenceTarget, SharedNodeMap, Slot};

/// A position in a parent's containment or annotation list.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Place {
    parent: NodeId,
    slot: Slot,
    index: usize,
}

impl From<&ChildSlot> for Place {
    fn from(at: &ChildSlot) -> Self {
        Place {
            parent: at.parent.clone(),
            slot: Slot::Containment(at.containment.clone()),
            index: at.index,
        }
    }
}

impl From<&AnnotationSlot> for Place {
    fn from(at: &AnnotationSlot) -> Self {
        Place {
            parent: at.parent.clone(),
            slot: Slot::Annotation,
            index: at.index,
        }
    }
}

impl Place {
    fn child_slot(&self) -> Result<ChildSlot, ModelError> {
        match &self.slot {
            Slot::Containment(c) => Ok(ChildSlot::new(self.parent.clone(), c.clone(), self.index)),
            Slot::Annotation => Err(invalid(format!(
                "annotation of {} used as a child slot",
                self.parent
            ))),
        }
    }

    fn annotation_slot(&self) -> AnnotationSlot {
        AnnotationSlot::new(self.parent.clone(), self.index)
    }
}

/// Where a moved node goes.
enum Dest<'a> {
    /// Into another list. `same_parent` picks the variant: another feature of
    /// the same parent, or a different parent.
    Other { to: &'a Place, same_parent: bool },
    /// Another index of the list it is in now.
    Same { index: usize, annotation: bool },
}

/// Where a moved reference entry goes.
enum EntryDest<'a> {
    Other { to: &'a EntrySlot, same_parent: bool },
    Same { index: usize },
}

fn slot_name(slot: &Slot) -> String {
    match slot {
        Slot::Containment(c) => c.to_string(),
        Slot::Annotation => "annotations".to_string(),
    }
}

fn out_of_bounds(node: &NodeId, feature: String, index: usize, len: usize) -> ModelError {
    ModelError::IndexOutOfBounds {
        node: node.clone(),
        feature,
        index,
        len,
    }
}

fn invalid(message: String) -> ModelError {
    ModelError::InvalidMutation(message)
}

/// Final index of a node moved onto the position of one that was removed from
/// the same list.
fn landing_index(same_list: bool, from: usize, to: usize) -> usize {
    if same_list && from < to {
        to - 1
    } else {
        to
    }
}

impl SharedNodeMap {
    /// Validate and apply one atomic change.
    pub fn apply(&mut self, change: &CommandChange) -> Result<EventChange, ModelError> {
        use CommandChange as C;
        use EventChange as E;

        match change {
            C::AddPartition { new_partition } => {
                self.check_new_subtree(new_partition)?;
                let stored = self.insert_subtree(new_partition, None);
                Ok(E::PartitionAdded {
                    new_partition: stored,
                })
            }
            C::DeletePartition { deleted_partition } => {
                let root = self.require(deleted_partition)?;
                if let Some(parent) = &root.parent {
                    return Err(invalid(format!(
                        "{} is contained by {}, not a partition",
                        deleted_partition, parent
                    )));
                }
                Ok(E::PartitionDeleted {
                    deleted_partition: self.remove_subtree(deleted_partition),
                })
            }
            C::ChangeClassifier {
                node,
                new_classifier,
            } => {
                let n = self.require(node)?;
                self.check_classifier(n, new_classifier)?;
                let old_classifier = n.classifier.clone();
                if let Some(n) = self.node_mut(node) {
                    n.classifier = new_classifier.clone();
                }
                Ok(E::ClassifierChanged {
                    node: node.clone(),
                    old_classifier,
                    new_classifier: new_classifier.clone(),
                })
            }

            C::AddProperty {
                node,
                property,
                new_value,
            } => {
                let n = self.require(node)?;
                self.check_feature(n, property, FeatureKind::Property, 1)?;
                if n.properties.contains_key(property) {
                    return Err(invalid(format!("{} already has {}", node, property)));
                }
                self.set_property(node, property, Some(new_value.clone()));
                Ok(E::PropertyAdded {
                    node: node.clone(),
                    property: property.clone(),
                    new_value: new_value.clone(),
                })
            }
            C::DeleteProperty { node, property } => {
                let old_value = self.property_value(node, property)?;
                self.set_property(node, property, None);
                Ok(E::PropertyDeleted {
                    node: node.clone(),
                    property: property.clone(),
                    old_value,
                })
            }
            C::ChangeProperty {
                node,
                property,
                new_value,
            } => {
                let old_value = self.property_value(node, property)?;
                self.set_property(node, property, Some(new_value.clone()));
                Ok(E::PropertyChanged {
                    node: node.clone(),
                    property: property.clone(),
                    old_value,
                    new_value: new_value.clone(),
                })
            }

            C::AddChild { at, new_child } => Ok(E::ChildAdded {
                at: at.clone(),
                new_child: self.add_owned(&at.into(), new_child)?,
            }),
            C::DeleteChild { at, deleted_child } => Ok(E::ChildDeleted {
                at: at.clone(),
                deleted_child: self.delete_owned(&at.into(), deleted_child)?,
            }),
            C::ReplaceChild {
                at,
                replaced_child,
                new_child,
            } => {
                let (old, new) = self.replace_owned(&at.into(), replaced_child, new_child)?;
                Ok(E::ChildReplaced {
                    at: at.clone(),
                    replaced_child: old,
                    new_child: new,
                })
            }
            C::MoveChildFromOtherContainment { to, moved_child } => {
                let to = Place::from(to);
                let from = self.move_owned(moved_child, Dest::Other { to: &to, same_parent: false })?;
                Ok(E::ChildMovedFromOtherContainment {
                    from: from.child_slot()?,
                    to: to.child_slot()?,
                    moved_child: moved_child.clone(),
                })
            }
            C::MoveChildFromOtherContainmentInSameParent { to, moved_child } => {
                let to = Place::from(to);
                let from = self.move_owned(moved_child, Dest::Other { to: &to, same_parent: true })?;
                Ok(E::ChildMovedFromOtherContainmentInSameParent {
                    from: from.child_slot()?,
                    to: to.child_slot()?,
                    moved_child: moved_child.clone(),
                })
            }
            C::MoveChildInSameContainment {
                new_index,
                moved_child,
            } => {
                let dest = Dest::Same {
                    index: *new_index,
                    annotation: false,
                };
                let from = self.move_owned(moved_child, dest)?;
                Ok(E::ChildMovedInSameContainment {
                    from: from.child_slot()?,
                    new_index: *new_index,
                    moved_child: moved_child.clone(),
                })
            }
            C::MoveAndReplaceChildFromOtherContainment {
                to,
                moved_child,
                replaced_child,
            } => {
                let to = Place::from(to);
                let dest = Dest::Other { to: &to, same_parent: false };
                let (from, old) = self.move_and_replace_owned(moved_child, dest, replaced_child)?;
                Ok(E::ChildMovedAndReplacedFromOtherContainment {
                    from: from.child_slot()?,
                    to: to.child_slot()?,
                    moved_child: moved_child.clone(),
                    replaced_child: old,
                })
            }
            C::MoveAndReplaceChildFromOtherContainmentInSameParent {
                to,
                moved_child,
                replaced_child,
            } => {
                let to = Place::from(to);
                let dest = Dest::Other { to: &to, same_parent: true };
                let (from, old) = self.move_and_replace_owned(moved_child, dest, replaced_child)?;
                Ok(E::ChildMovedAndReplacedFromOtherContainmentInSameParent {
                    from: from.child_slot()?,
                    to: to.child_slot()?,
                    moved_child: moved_child.clone(),
                    replaced_child: old,
                })
            }
            C::MoveAndReplaceChildInSameContainment {
                new_index,
                moved_child,
                replaced_child,
            } => {
                let dest = Dest::Same {
                    index: *new_index,
                    annotation: false,
                };
                let (from, old) = self.move_and_replace_owned(moved_child, dest, replaced_child)?;
                Ok(E::ChildMovedAndReplacedInSameContainment {
                    from: from.child_slot()?,
                    new_index: *new_index,
                    moved_child: moved_child.clone(),
                    replaced_child: old,
                })
            }

            C::AddAnnotation { at, new_annotation } => Ok(E::AnnotationAdded {
                at: at.clone(),
                new_annotation: self.add_owned(&at.into(), new_annotation)?,
            }),
            C::DeleteAnnotation {
                at,
                deleted_annotation,
            } => Ok(E::AnnotationDeleted {
                at: at.clone(),
                deleted_annotation: self.delete_owned(&at.into(), deleted_annotation)?,
            }),
            C::ReplaceAnnotation {
                at,
                replaced_annotation,
                new_annotation,
            } => {
                let (old, new) =
                    self.replace_owned(&at.into(), replaced_annotation, new_annotation)?;
                Ok(E::AnnotationReplaced {
                    at: at.clone(),
                    replaced_annotation: old,
                    new_annotation: new,
                })
            }
            C::MoveAnnotationFromOtherParent {
                to,
                moved_annotation,
            } => {
                let to = Place::from(to);
                let dest = Dest::Other { to: &to, same_parent: false };
                let from = self.move_owned(moved_annotation, dest)?;
                Ok(E::AnnotationMovedFromOtherParent {
                    from: from.annotation_slot(),
                    to: to.annotation_slot(),
                    moved_annotation: moved_annotation.clone(),
                })
            }
            C::MoveAnnotationInSameParent {
                new_index,
                moved_annotation,
            } => {
                let dest = Dest::Same {
                    index: *new_index,
                    annotation: true,
                };
                let from = self.move_owned(moved_annotation, dest)?;
                Ok(E::AnnotationMovedInSameParent {
                    from: from.annotation_slot(),
                    new_index: *new_index,
                    moved_annotation: moved_annotation.clone(),
                })
            }
            C::MoveAndReplaceAnnotationFromOtherParent {
                to,
                moved_annotation,
                replaced_annotation,
            } => {
                let to = Place::from(to);
                let dest = Dest::Other { to: &to, same_parent: false };
                let (from, old) =
                    self.move_and_replace_owned(moved_annotation, dest, replaced_annotation)?;
                Ok(E::AnnotationMovedAndReplacedFromOtherParent {
                    from: from.annotation_slot(),
                    to: to.annotation_slot(),
                    moved_annotation: moved_annotation.clone(),
                    replaced_annotation: old,
                })
            }
            C::MoveAndReplaceAnnotationInSameParent {
                new_index,
                moved_annotation,
                replaced_annotation,
            } => {
                let dest = Dest::Same {
                    index: *new_index,
                    annotation: true,
                };
                let (from, old) =
                    self.move_and_replace_owned(moved_annotation, dest, replaced_annotation)?;
                Ok(E::AnnotationMovedAndReplacedInSameParent {
                    from: from.annotation_slot(),
                    new_index: *new_index,
                    moved_annotation: moved_annotation.clone(),
                    replaced_annotation: old,
                })
            }

            C::AddReference { at, new_entry } => {
                let node = self.require(&at.parent)?;
                let len = node.entries(&at.reference).len();
                if at.index > len {
                    return Err(out_of_bounds(&at.parent, at.reference.to_string(), at.index, len));
                }
                self.check_feature(node, &at.reference, FeatureKind::Reference, len + 1)?;
                if let Some(entries) = self.entries_mut(&at.parent, &at.reference) {
                    entries.insert(at.index, new_entry.clone());
                }
                Ok(E::ReferenceAdded {
                    at: at.clone(),
                    new_entry: new_entry.clone(),
                })
            }
            C::DeleteReference { at, deleted_entry } => {
                self.expect_entry(at, deleted_entry)?;
                if let Some(entries) = self.entries_mut(&at.parent, &at.reference) {
                    entries.remove(at.index);
                }
                self.compact(&at.parent);
                Ok(E::ReferenceDeleted {
                    at: at.clone(),
                    deleted_entry: deleted_entry.clone(),
                })
            }
            C::ChangeReference {
                at,
                old_entry,
                new_entry,
            } => {
                self.expect_entry(at, old_entry)?;
                self.update_entry(at, |e| *e = new_entry.clone());
                Ok(E::ReferenceChanged {
                    at: at.clone(),
                    old_entry: old_entry.clone(),
                    new_entry: new_entry.clone(),
                })
            }
            C::MoveEntryFromOtherReference {
                from,
                to,
                moved_entry,
            } => {
                let dest = EntryDest::Other { to, same_parent: false };
                self.move_entry(from, dest, moved_entry, None)?;
                Ok(E::EntryMovedFromOtherReference {
                    from: from.clone(),
                    to: to.clone(),
                    moved_entry: moved_entry.clone(),
                })
            }
            C::MoveEntryFromOtherReferenceInSameParent {
                from,
                to,
                moved_entry,
            } => {
                let dest = EntryDest::Other { to, same_parent: true };
                self.move_entry(from, dest, moved_entry, None)?;
                Ok(E::EntryMovedFromOtherReferenceInSameParent {
                    from: from.clone(),
                    to: to.clone(),
                    moved_entry: moved_entry.clone(),
                })
            }
            C::MoveEntryInSameReference {
                from,
                new_index,
                moved_entry,
            } => {
                let dest = EntryDest::Same { index: *new_index };
                self.move_entry(from, dest, moved_entry, None)?;
                Ok(E::EntryMovedInSameReference {
                    from: from.clone(),
                    new_index: *new_index,
                    moved_entry: moved_entry.clone(),
                })
            }
            C::MoveAndReplaceEntryFromOtherReference {
                from,
                to,
                moved_entry,
                replaced_entry,
            } => {
                let dest = EntryDest::Other { to, same_parent: false };
                self.move_entry(from, dest, moved_entry, Some(replaced_entry))?;
                Ok(E::EntryMovedAndReplacedFromOtherReference {
                    from: from.clone(),
                    to: to.clone(),
                    moved_entry: moved_entry.clone(),
                    replaced_entry: replaced_entry.clone(),
                })
            }
            C::MoveAndReplaceEntryFromOtherReferenceInSameParent {
                from,
                to,
                moved_entry,
                replaced_entry,
            } => {
                let dest = EntryDest::Other { to, same_parent: true };
                self.move_entry(from, dest, moved_entry, Some(replaced_entry))?;
                Ok(E::EntryMovedAndReplacedFromOtherReferenceInSameParent {
                    from: from.clone(),
                    to: to.clone(),
                    moved_entry: moved_entry.clone(),
                    replaced_entry: replaced_entry.clone(),
                })
            }
            C::MoveAndReplaceEntryInSameReference {
                from,
                new_index,
                moved_entry,
                replaced_entry,
            } => {
                let dest = EntryDest::Same { index: *new_index };
                self.move_entry(from, dest, moved_entry, Some(replaced_entry))?;
                Ok(E::EntryMovedAndReplacedInSameReference {
                    from: from.clone(),
                    new_index: *new_index,
                    moved_entry: moved_entry.clone(),
                    replaced_entry: replaced_entry.clone(),
                })
            }

            C::AddReferenceResolveInfo {
                at,
                new_resolve_info,
            } => {
                let entry = self.entry_at(at)?;
                if let Some(existing) = &entry.resolve_info {
                    return Err(invalid(format!("entry already labelled {:?}", existing)));
                }
                self.update_entry(at, |e| e.resolve_info = Some(new_resolve_info.clone()));
                Ok(E::ReferenceResolveInfoAdded {
                    at: at.clone(),
                    new_resolve_info: new_resolve_info.clone(),
                })
            }
            C::DeleteReferenceResolveInfo {
                at,
                deleted_resolve_info,
            } => {
                self.expect_resolve_info(at, deleted_resolve_info)?;
                self.update_entry(at, |e| e.resolve_info = None);
                Ok(E::ReferenceResolveInfoDeleted {
                    at: at.clone(),
                    deleted_resolve_info: deleted_resolve_info.clone(),
                })
            }
            C::ChangeReferenceResolveInfo {
                at,
                old_resolve_info,
                new_resolve_info,
            } => {
                self.expect_resolve_info(at, old_resolve_info)?;
                self.update_entry(at, |e| e.resolve_info = Some(new_resolve_info.clone()));
                Ok(E::ReferenceResolveInfoChanged {
                    at: at.clone(),
                    old_resolve_info: old_resolve_info.clone(),
                    new_resolve_info: new_resolve_info.clone(),
                })
            }
            C::AddReferenceTarget { at, new_target } => {
                let entry = self.entry_at(at)?;
                if let Some(existing) = &entry.target {
                    return Err(invalid(format!("entry already targets {}", existing)));
                }
                self.update_entry(at, |e| e.target = Some(new_target.clone()));
                Ok(E::ReferenceTargetAdded {
                    at: at.clone(),
                    new_target: new_target.clone(),
                })
            }
            C::DeleteReferenceTarget { at, deleted_target } => {
                self.expect_target(at, deleted_target)?;
                self.update_entry(at, |e| e.target = None);
                Ok(E::ReferenceTargetDeleted {
                    at: at.clone(),
                    deleted_target: deleted_target.clone(),
                })
            }
            C::ChangeReferenceTarget {
                at,
                old_target,
                new_target,
            } => {
                self.expect_target(at, old_target)?;
                self.update_entry(at, |e| e.target = Some(new_target.clone()));
                Ok(E::ReferenceTargetChanged {
                    at: at.clone(),
                    old_target: old_target.clone(),
                    new_target: new_target.clone(),
                })
            }
        }
    }

    // --- language checks ---

    /// Check `feature` against the language, with `len` values after the change.
    fn check_feature(
        &self,
        node: &Node,
        feature: &MetaPointer,
        kind: FeatureKind,
        len: usize,
    ) -> Result<(), ModelError> {
        let language = match &self.language {
            Some(language) => language,
            None => return Ok(()),
        };
        match language.check(&node.classifier, feature, kind)? {
            Some(spec) if !spec.multiple && len > 1 => Err(ModelError::FeatureMismatch {
                classifier: node.classifier.clone(),
                feature: feature.clone(),
                reason: "holds at most one value".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Every feature the node holds must be declared by `classifier`.
    fn check_classifier(&self, node: &Node, classifier: &MetaPointer) -> Result<(), ModelError> {
        if self.language.is_none() {
            return Ok(());
        }
        let retyped = Node {
            classifier: classifier.clone(),
            ..node.clone()
        };
        for property in node.properties.keys() {
            self.check_feature(&retyped, property, FeatureKind::Property, 1)?;
        }
        for (containment, children) in &node.containments {
            self.check_feature(&retyped, containment, FeatureKind::Containment, children.len())?;
        }
        for (reference, entries) in &node.references {
            self.check_feature(&retyped, reference, FeatureKind::Reference, entries.len())?;
        }
        Ok(())
    }

    fn check_slot(&self, node: &Node, slot: &Slot, len: usize) -> Result<(), ModelError> {
        match slot {
            Slot::Containment(c) => self.check_feature(node, c, FeatureKind::Containment, len),
            Slot::Annotation => Ok(()),
        }
    }

    // --- properties ---

    fn property_value(&self, node: &NodeId, property: &MetaPointer) -> Result<String, ModelError> {
        let n = self.require(node)?;
        self.check_feature(n, property, FeatureKind::Property, 1)?;
        n.property(property)
            .map(str::to_string)
            .ok_or_else(|| invalid(format!("{} has no {}", node, property)))
    }

    fn set_property(&mut self, node: &NodeId, property: &MetaPointer, value: Option<String>) {
        if let Some(n) = self.node_mut(node) {
            match value {
                Some(v) => n.properties.insert(property.clone(), v),
                None => n.properties.remove(property),
            };
        }
    }

    // --- children and annotations ---

    fn compact(&mut self, id: &NodeId) {
        if let Some(n) = self.node_mut(id) {
            n.compact();
        }
    }

    fn owned_at(&self, place: &Place) -> Result<&NodeId, ModelError> {
        let list = self.require(&place.parent)?.slot(&place.slot);
        list.get(place.index).ok_or_else(|| {
            out_of_bounds(&place.parent, slot_name(&place.slot), place.index, list.len())
        })
    }

    fn expect_owned(&self, place: &Place, expected: &NodeId) -> Result<(), ModelError> {
        let current = self.owned_at(place)?;
        if current != expected {
            return Err(invalid(format!(
                "{} of {} holds {} at {}, not {}",
                slot_name(&place.slot),
                place.parent,
                current,
                place.index,
                expected
            )));
        }
        Ok(())
    }

    fn add_owned(&mut self, place: &Place, chunk: &Chunk) -> Result<Chunk, ModelError> {
        let parent = self.require(&place.parent)?;
        let len = parent.slot(&place.slot).len();
        if place.index > len {
            return Err(out_of_bounds(&place.parent, slot_name(&place.slot), place.index, len));
        }
        self.check_slot(parent, &place.slot, len + 1)?;
        let root = self.check_new_subtree(chunk)?;

        let stored = self.insert_subtree(chunk, Some(&place.parent));
        if let Some(parent) = self.node_mut(&place.parent) {
            parent.slot_mut(&place.slot).insert(place.index, root);
        }
        Ok(stored)
    }

    fn delete_owned(&mut self, place: &Place, expected: &NodeId) -> Result<Chunk, ModelError> {
        self.expect_owned(place, expected)?;

        if let Some(parent) = self.node_mut(&place.parent) {
            parent.slot_mut(&place.slot).remove(place.index);
            parent.compact();
        }
        Ok(self.remove_subtree(expected))
    }

    fn replace_owned(
        &mut self,
        place: &Place,
        expected: &NodeId,
        chunk: &Chunk,
    ) -> Result<(Chunk, Chunk), ModelError> {
        self.expect_owned(place, expected)?;
        let root = self.check_new_subtree(chunk)?;

        let old = self.remove_subtree(expected);
        let new = self.insert_subtree(chunk, Some(&place.parent));
        if let Some(parent) = self.node_mut(&place.parent) {
            parent.slot_mut(&place.slot)[place.index] = root;
        }
        Ok((old, new))
    }

    /// Current position of a contained node.
    fn locate_owned(&self, moved: &NodeId) -> Result<Place, ModelError> {
        let node = self.require(moved)?;
        let parent = node
            .parent
            .clone()
            .ok_or_else(|| invalid(format!("{} is a partition root", moved)))?;
        let (slot, index) = self
            .require(&parent)?
            .locate(moved)
            .ok_or_else(|| invalid(format!("{} is not listed by its parent {}", moved, parent)))?;
        Ok(Place {
            parent,
            slot,
            index,
        })
    }

    /// Check the move variant against the node's current position and resolve
    /// the destination.
    fn resolve_dest(&self, moved: &NodeId, from: &Place, dest: Dest<'_>) -> Result<Place, ModelError> {
        let to = match dest {
            Dest::Other { to, same_parent } => {
                if discriminant(&from.slot) != discriminant(&to.slot) {
                    return Err(invalid(format!(
                        "{} sits in {}, cannot move to {}",
                        moved,
                        slot_name(&from.slot),
                        slot_name(&to.slot)
                    )));
                }
                if same_parent && (from.parent != to.parent || from.slot == to.slot) {
                    return Err(invalid(format!(
                        "{} is not in another feature of {}",
                        moved, to.parent
                    )));
                }
                if !same_parent && from.parent == to.parent {
                    return Err(invalid(format!("{} is already under {}", moved, to.parent)));
                }
                to.clone()
            }
            Dest::Same { index, annotation } => {
                if matches!(from.slot, Slot::Annotation) != annotation {
                    return Err(invalid(format!(
                        "{} sits in {}",
                        moved,
                        slot_name(&from.slot)
                    )));
                }
                Place {
                    parent: from.parent.clone(),
                    slot: from.slot.clone(),
                    index,
                }
            }
        };
        self.require(&to.parent)?;
        if self.is_ancestor_or_self(moved, &to.parent) {
            return Err(invalid(format!(
                "moving {} under {} would create a cycle",
                moved, to.parent
            )));
        }
        Ok(to)
    }

    fn move_owned(&mut self, moved: &NodeId, dest: Dest<'_>) -> Result<Place, ModelError> {
        let from = self.locate_owned(moved)?;
        let to = self.resolve_dest(moved, &from, dest)?;
        let same_list = from.parent == to.parent && from.slot == to.slot;
        let target = self.require(&to.parent)?;
        let len = target.slot(&to.slot).len();
        if same_list {
            if to.index >= len {
                return Err(out_of_bounds(&to.parent, slot_name(&to.slot), to.index, len));
            }
        } else {
            if to.index > len {
                return Err(out_of_bounds(&to.parent, slot_name(&to.slot), to.index, len));
            }
            self.check_slot(target, &to.slot, len + 1)?;
        }

        if let Some(parent) = self.node_mut(&from.parent) {
            parent.slot_mut(&from.slot).remove(from.index);
            parent.compact();
        }
        if let Some(parent) = self.node_mut(&to.parent) {
            parent.slot_mut(&to.slot).insert(to.index, moved.clone());
        }
        if let Some(node) = self.node_mut(moved) {
            node.parent = Some(to.parent.clone());
        }
        Ok(from)
    }

    fn move_and_replace_owned(
        &mut self,
        moved: &NodeId,
        dest: Dest<'_>,
        replaced: &NodeId,
    ) -> Result<(Place, Chunk), ModelError> {
        let from = self.locate_owned(moved)?;
        let to = self.resolve_dest(moved, &from, dest)?;
        self.expect_owned(&to, replaced)?;
        if self.is_ancestor_or_self(replaced, moved) {
            return Err(invalid(format!(
                "{} cannot replace {}, it lies inside it",
                moved, replaced
            )));
        }
        let same_list = from.parent == to.parent && from.slot == to.slot;

        if let Some(parent) = self.node_mut(&to.parent) {
            parent.slot_mut(&to.slot).remove(to.index);
        }
        let old = self.remove_subtree(replaced);
        if let Some(parent) = self.node_mut(&from.parent) {
            let list = parent.slot_mut(&from.slot);
            if let Some(pos) = list.iter().position(|id| id == moved) {
                list.remove(pos);
            }
            parent.compact();
        }
        let landing = landing_index(same_list, from.index, to.index);
        if let Some(parent) = self.node_mut(&to.parent) {
            parent.slot_mut(&to.slot).insert(landing, moved.clone());
        }
        if let Some(node) = self.node_mut(moved) {
            node.parent = Some(to.parent.clone());
        }
        Ok((from, old))
    }

    // --- reference entries ---

    fn entry_at(&self, at: &EntrySlot) -> Result<&ReferenceTarget, ModelError> {
        let entries = self.require(&at.parent)?.entries(&at.reference);
        entries.get(at.index).ok_or_else(|| {
            out_of_bounds(&at.parent, at.reference.to_string(), at.index, entries.len())
        })
    }

    fn expect_entry(&self, at: &EntrySlot, expected: &ReferenceTarget) -> Result<(), ModelError> {
        let current = self.entry_at(at)?;
        if current != expected {
            return Err(invalid(format!(
                "{} of {} at {} is {:?}, not {:?}",
                at.reference, at.parent, at.index, current, expected
            )));
        }
        Ok(())
    }

    fn expect_resolve_info(&self, at: &EntrySlot, expected: &str) -> Result<(), ModelError> {
        match &self.entry_at(at)?.resolve_info {
            Some(info) if info == expected => Ok(()),
            other => Err(invalid(format!(
                "resolve info is {:?}, not {:?}",
                other, expected
            ))),
        }
    }

    fn expect_target(&self, at: &EntrySlot, expected: &NodeId) -> Result<(), ModelError> {
        match &self.entry_at(at)?.target {
            Some(target) if target == expected => Ok(()),
            other => Err(invalid(format!("target is {:?}, not {}", other, expected))),
        }
    }

    fn entries_mut(
        &mut self,
        parent: &NodeId,
        reference: &MetaPointer,
    ) -> Option<&mut Vec<ReferenceTarget>> {
        self.node_mut(parent)
            .map(|n| n.references.entry(reference.clone()).or_default())
    }

    fn update_entry(&mut self, at: &EntrySlot, update: impl FnOnce(&mut ReferenceTarget)) {
        if let Some(entry) = self
            .entries_mut(&at.parent, &at.reference)
            .and_then(|entries| entries.get_mut(at.index))
        {
            update(entry);
        }
    }

    fn move_entry(
        &mut self,
        from: &EntrySlot,
        dest: EntryDest<'_>,
        moved: &ReferenceTarget,
        replaced: Option<&ReferenceTarget>,
    ) -> Result<EntrySlot, ModelError> {
        self.expect_entry(from, moved)?;
        let to = match dest {
            EntryDest::Other { to, same_parent } => {
                if same_parent && (from.parent != to.parent || from.reference == to.reference) {
                    return Err(invalid(format!(
                        "entry is not in another reference of {}",
                        to.parent
                    )));
                }
                if !same_parent && from.parent == to.parent {
                    return Err(invalid(format!("entry is already in {}", to.parent)));
                }
                to.clone()
            }
            EntryDest::Same { index } => EntrySlot::new(from.parent.clone(), from.reference.clone(), index),
        };
        let same_list = from.parent == to.parent && from.reference == to.reference;
        let target = self.require(&to.parent)?;
        let len = target.entries(&to.reference).len();

        match replaced {
            Some(replaced) => {
                if same_list && to.index == from.index {
                    return Err(invalid("an entry cannot replace itself".into()));
                }
                self.expect_entry(&to, replaced)?;
                if let Some(entries) = self.entries_mut(&to.parent, &to.reference) {
                    entries.remove(to.index);
                }
                let from_index = if same_list && to.index < from.index {
                    from.index - 1
                } else {
                    from.index
                };
                if let Some(entries) = self.entries_mut(&from.parent, &from.reference) {
                    entries.remove(from_index);
                }
                let landing = landing_index(same_list, from.index, to.index);
                if let Some(entries) = self.entries_mut(&to.parent, &to.reference) {
                    entries.insert(landing, moved.clone());
                }
            }
            None => {
                if same_list && to.index >= len {
                    return Err(out_of_bounds(&to.parent, to.reference.to_string(), to.index, len));
                }
                if !same_list {
                    if to.index > len {
                        return Err(out_of_bounds(&to.parent, to.reference.to_string(), to.index, len));
                    }
                    self.check_feature(target, &to.reference, FeatureKind::Reference, len + 1)?;
                }
                if let Some(entries) = self.entries_mut(&from.parent, &from.reference) {
                    entries.remove(from.index);
                }
                if let Some(entries) = self.entries_mut(&to.parent, &to.reference) {
                    entries.insert(to.index, moved.clone());
                }
            }
        }
        self.compact(&from.parent);
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassifierSpec, FeatureSpec, Language};

    fn mp(key: &str) -> MetaPointer {
        MetaPointer::new("shapes", "1", key)
    }

    fn ids(map: &SharedNodeMap, parent: &str, feature: &str) -> Vec<String> {
        map.get(&parent.into())
            .unwrap()
            .children(&mp(feature))
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    /// doc { shapes: [a, b, c], extra: [] }, other { shapes: [d] }
    fn forest() -> SharedNodeMap {
        let mut map = SharedNodeMap::new();
        map.apply(&CommandChange::AddPartition {
            new_partition: Chunk::new(vec![
                Node::new("doc", mp("Document"))
                    .with_child(mp("shapes"), "a")
                    .with_child(mp("shapes"), "b")
                    .with_child(mp("shapes"), "c"),
                Node::new("a", mp("Circle")).with_parent("doc"),
                Node::new("b", mp("Circle"))
                    .with_parent("doc")
                    .with_child(mp("center"), "b-center"),
                Node::new("b-center", mp("Point")).with_parent("b"),
                Node::new("c", mp("Circle")).with_parent("doc"),
            ]),
        })
        .unwrap();
        map.apply(&CommandChange::AddPartition {
            new_partition: Chunk::new(vec![
                Node::new("other", mp("Document")).with_child(mp("shapes"), "d"),
                Node::new("d", mp("Circle")).with_parent("other"),
            ]),
        })
        .unwrap();
        map
    }

    #[test]
    fn test_property_lifecycle() {
        let mut map = forest();
        let node: NodeId = "a".into();
        map.apply(&CommandChange::AddProperty {
            node: node.clone(),
            property: mp("radius"),
            new_value: "1".into(),
        })
        .unwrap();

        let changed = map
            .apply(&CommandChange::ChangeProperty {
                node: node.clone(),
                property: mp("radius"),
                new_value: "2".into(),
            })
            .unwrap();
        assert_eq!(
            changed,
            EventChange::PropertyChanged {
                node: node.clone(),
                property: mp("radius"),
                old_value: "1".into(),
                new_value: "2".into(),
            }
        );

        let again = map.apply(&CommandChange::AddProperty {
            node: node.clone(),
            property: mp("radius"),
            new_value: "3".into(),
        });
        assert!(matches!(again, Err(ModelError::InvalidMutation(_))));

        map.apply(&CommandChange::DeleteProperty {
            node: node.clone(),
            property: mp("radius"),
        })
        .unwrap();
        assert_eq!(map.get(&node).unwrap().property(&mp("radius")), None);
    }

    #[test]
    fn test_delete_child_removes_subtree() {
        let mut map = forest();
        let event = map
            .apply(&CommandChange::DeleteChild {
                at: ChildSlot::new("doc", mp("shapes"), 1),
                deleted_child: "b".into(),
            })
            .unwrap();

        match event {
            EventChange::ChildDeleted { deleted_child, .. } => {
                assert_eq!(deleted_child.len(), 2);
                assert_eq!(deleted_child.nodes[0].id.as_str(), "b");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!map.contains(&"b-center".into()));
        assert_eq!(ids(&map, "doc", "shapes"), vec!["a", "c"]);
    }

    #[test]
    fn test_wrong_expected_child_changes_nothing() {
        let mut map = forest();
        let before = map.digest();
        let err = map
            .apply(&CommandChange::DeleteChild {
                at: ChildSlot::new("doc", mp("shapes"), 0),
                deleted_child: "b".into(),
            })
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidMutation(_)));

        let err = map
            .apply(&CommandChange::AddChild {
                at: ChildSlot::new("doc", mp("shapes"), 9),
                new_child: Chunk::single(Node::new("z", mp("Circle"))),
            })
            .unwrap_err();
        assert!(matches!(err, ModelError::IndexOutOfBounds { len: 3, .. }));
        assert_eq!(map.digest(), before);
    }

    #[test]
    fn test_move_variants_are_strict() {
        let mut map = forest();
        // d lives under another parent: the in-same-parent variant is wrong
        let err = map.apply(&CommandChange::MoveChildFromOtherContainmentInSameParent {
            to: ChildSlot::new("doc", mp("extra"), 0),
            moved_child: "d".into(),
        });
        assert!(err.is_err());

        map.apply(&CommandChange::MoveChildFromOtherContainment {
            to: ChildSlot::new("doc", mp("shapes"), 0),
            moved_child: "d".into(),
        })
        .unwrap();
        assert_eq!(ids(&map, "doc", "shapes"), vec!["d", "a", "b", "c"]);
        assert_eq!(ids(&map, "other", "shapes"), Vec::<String>::new());
        assert_eq!(map.partition_of(&"d".into()), Some(NodeId::from("doc")));

        let event = map
            .apply(&CommandChange::MoveChildFromOtherContainmentInSameParent {
                to: ChildSlot::new("doc", mp("extra"), 0),
                moved_child: "a".into(),
            })
            .unwrap();
        assert_eq!(
            event,
            EventChange::ChildMovedFromOtherContainmentInSameParent {
                from: ChildSlot::new("doc", mp("shapes"), 1),
                to: ChildSlot::new("doc", mp("extra"), 0),
                moved_child: "a".into(),
            }
        );
    }

    #[test]
    fn test_move_in_same_containment() {
        let mut map = forest();
        map.apply(&CommandChange::MoveChildInSameContainment {
            new_index: 2,
            moved_child: "a".into(),
        })
        .unwrap();
        assert_eq!(ids(&map, "doc", "shapes"), vec!["b", "c", "a"]);

        let err = map.apply(&CommandChange::MoveChildInSameContainment {
            new_index: 3,
            moved_child: "a".into(),
        });
        assert!(matches!(err, Err(ModelError::IndexOutOfBounds { .. })));
    }

    #[test]
    fn test_move_and_replace_in_same_containment() {
        let mut map = forest();
        let event = map
            .apply(&CommandChange::MoveAndReplaceChildInSameContainment {
                new_index: 2,
                moved_child: "a".into(),
                replaced_child: "c".into(),
            })
            .unwrap();
        assert_eq!(ids(&map, "doc", "shapes"), vec!["b", "a"]);
        assert!(!map.contains(&"c".into()));
        assert!(matches!(
            event,
            EventChange::ChildMovedAndReplacedInSameContainment { new_index: 2, .. }
        ));

        // backwards
        map.apply(&CommandChange::MoveAndReplaceChildInSameContainment {
            new_index: 0,
            moved_child: "a".into(),
            replaced_child: "b".into(),
        })
        .unwrap();
        assert_eq!(ids(&map, "doc", "shapes"), vec!["a"]);
        assert!(!map.contains(&"b-center".into()));
    }

    #[test]
    fn test_cycles_are_refused() {
        let mut map = forest();
        let err = map.apply(&CommandChange::MoveChildFromOtherContainment {
            to: ChildSlot::new("b-center", mp("shapes"), 0),
            moved_child: "b".into(),
        });
        assert!(matches!(err, Err(ModelError::InvalidMutation(_))));
    }

    #[test]
    fn test_annotations_move_between_parents() {
        let mut map = forest();
        map.apply(&CommandChange::AddAnnotation {
            at: AnnotationSlot::new("a", 0),
            new_annotation: Chunk::single(Node::new("note", mp("Note"))),
        })
        .unwrap();
        assert_eq!(
            map.get(&"note".into()).unwrap().parent,
            Some(NodeId::from("a"))
        );

        let event = map
            .apply(&CommandChange::MoveAnnotationFromOtherParent {
                to: AnnotationSlot::new("d", 0),
                moved_annotation: "note".into(),
            })
            .unwrap();
        assert_eq!(
            event,
            EventChange::AnnotationMovedFromOtherParent {
                from: AnnotationSlot::new("a", 0),
                to: AnnotationSlot::new("d", 0),
                moved_annotation: "note".into(),
            }
        );
        assert!(map.get(&"a".into()).unwrap().annotations.is_empty());

        // annotations are not children
        let err = map.apply(&CommandChange::MoveChildFromOtherContainment {
            to: ChildSlot::new("a", mp("shapes"), 0),
            moved_child: "note".into(),
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_reference_halves_change_independently() {
        let mut map = forest();
        let at = EntrySlot::new("a", mp("peer"), 0);
        map.apply(&CommandChange::AddReference {
            at: at.clone(),
            new_entry: ReferenceTarget::to("b"),
        })
        .unwrap();
        map.apply(&CommandChange::AddReferenceResolveInfo {
            at: at.clone(),
            new_resolve_info: "B".into(),
        })
        .unwrap();
        map.apply(&CommandChange::ChangeReferenceTarget {
            at: at.clone(),
            old_target: "b".into(),
            new_target: "c".into(),
        })
        .unwrap();
        assert_eq!(
            map.get(&"a".into()).unwrap().entries(&mp("peer")),
            &[ReferenceTarget::labelled("c", "B")]
        );

        map.apply(&CommandChange::DeleteReferenceTarget {
            at: at.clone(),
            deleted_target: "c".into(),
        })
        .unwrap();
        let err = map.apply(&CommandChange::DeleteReferenceTarget {
            at: at.clone(),
            deleted_target: "c".into(),
        });
        assert!(err.is_err());
        assert_eq!(
            map.get(&"a".into()).unwrap().entries(&mp("peer")),
            &[ReferenceTarget::dangling("B")]
        );
    }

    #[test]
    fn test_entry_moves() {
        let mut map = forest();
        for (i, target) in ["b", "c", "d"].iter().enumerate() {
            map.apply(&CommandChange::AddReference {
                at: EntrySlot::new("a", mp("peers"), i),
                new_entry: ReferenceTarget::to(*target),
            })
            .unwrap();
        }

        map.apply(&CommandChange::MoveEntryInSameReference {
            from: EntrySlot::new("a", mp("peers"), 0),
            new_index: 2,
            moved_entry: ReferenceTarget::to("b"),
        })
        .unwrap();
        let entries = |map: &SharedNodeMap, node: &str, r: &str| -> Vec<ReferenceTarget> {
            map.get(&node.into()).unwrap().entries(&mp(r)).to_vec()
        };
        assert_eq!(
            entries(&map, "a", "peers"),
            vec![
                ReferenceTarget::to("c"),
                ReferenceTarget::to("d"),
                ReferenceTarget::to("b")
            ]
        );

        map.apply(&CommandChange::MoveAndReplaceEntryInSameReference {
            from: EntrySlot::new("a", mp("peers"), 2),
            new_index: 0,
            moved_entry: ReferenceTarget::to("b"),
            replaced_entry: ReferenceTarget::to("c"),
        })
        .unwrap();
        assert_eq!(
            entries(&map, "a", "peers"),
            vec![ReferenceTarget::to("b"), ReferenceTarget::to("d")]
        );

        map.apply(&CommandChange::MoveEntryFromOtherReferenceInSameParent {
            from: EntrySlot::new("a", mp("peers"), 1),
            to: EntrySlot::new("a", mp("best"), 0),
            moved_entry: ReferenceTarget::to("d"),
        })
        .unwrap();
        map.apply(&CommandChange::MoveEntryFromOtherReference {
            from: EntrySlot::new("a", mp("best"), 0),
            to: EntrySlot::new("c", mp("best"), 0),
            moved_entry: ReferenceTarget::to("d"),
        })
        .unwrap();
        assert_eq!(entries(&map, "a", "peers"), vec![ReferenceTarget::to("b")]);
        assert!(entries(&map, "a", "best").is_empty());
        assert_eq!(entries(&map, "c", "best"), vec![ReferenceTarget::to("d")]);
    }

    #[test]
    fn test_language_limits_multiplicity() {
        let language = Language::new().with(
            ClassifierSpec::new(mp("Circle"))
                .with(FeatureSpec::single_containment(mp("center")))
                .with(FeatureSpec::property(mp("radius"))),
        );
        let mut map = SharedNodeMap::with_language(language);
        map.apply(&CommandChange::AddPartition {
            new_partition: Chunk::single(Node::new("c", mp("Circle"))),
        })
        .unwrap();

        let add = |index: usize, id: &str| CommandChange::AddChild {
            at: ChildSlot::new("c", mp("center"), index),
            new_child: Chunk::single(Node::new(id, mp("Point"))),
        };
        map.apply(&add(0, "p1")).unwrap();
        assert!(matches!(
            map.apply(&add(1, "p2")),
            Err(ModelError::FeatureMismatch { .. })
        ));
        assert!(matches!(
            map.apply(&CommandChange::AddProperty {
                node: "c".into(),
                property: mp("center"),
                new_value: "x".into(),
            }),
            Err(ModelError::FeatureMismatch { .. })
        ));
    }

    #[test]
    fn test_classifier_change_checks_held_features() {
        let language = Language::new()
            .with(ClassifierSpec::new(mp("Circle")).with(FeatureSpec::property(mp("radius"))))
            .with(ClassifierSpec::new(mp("Square")).with(FeatureSpec::property(mp("side"))))
            .with(
                ClassifierSpec::new(mp("Disc"))
                    .with(FeatureSpec::property(mp("radius")))
                    .with(FeatureSpec::property(mp("colour"))),
            );
        let mut map = SharedNodeMap::with_language(language);
        map.apply(&CommandChange::AddPartition {
            new_partition: Chunk::single(
                Node::new("c", mp("Circle")).with_property(mp("radius"), "2"),
            ),
        })
        .unwrap();

        let retype = |classifier: &str| CommandChange::ChangeClassifier {
            node: "c".into(),
            new_classifier: mp(classifier),
        };
        assert!(matches!(
            map.apply(&retype("Square")),
            Err(ModelError::FeatureMismatch { .. })
        ));
        assert_eq!(map.get(&"c".into()).unwrap().classifier, mp("Circle"));

        map.apply(&retype("Disc")).unwrap();
        map.apply(&retype("Unregistered")).unwrap();
        assert_eq!(map.get(&"c".into()).unwrap().classifier, mp("Unregistered"));
    }

    #[test]
    fn test_partition_delete_requires_root() {
        let mut map = forest();
        assert!(map
            .apply(&CommandChange::DeletePartition {
                deleted_partition: "a".into()
            })
            .is_err());
        let event = map
            .apply(&CommandChange::DeletePartition {
                deleted_partition: "other".into(),
            })
            .unwrap();
        match event {
            EventChange::PartitionDeleted { deleted_partition } => {
                assert_eq!(deleted_partition.len(), 2)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!map.contains(&"d".into()));
    }
}
