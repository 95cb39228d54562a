//! Applies incoming events to a local forest
//!
//! Holds one [`PartitionApplier`] per partition and keeps that roster in step
//! with the forest through its typed observers. Does no outbound replication,
//! so it also serves read-only mirrors.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use log::debug;

use crate::delta::{CommandChange, Event, EventChange};
use crate::ids::NodeId;
use crate::model::{Chunk, Cloner, Forest, IdMode, ModelError, ObserverId, Partition};

use super::SyncConfig;

/// Copies a peer's subtree with its ids intact.
fn hydrate(cloner: &Cloner, chunk: &Chunk) -> Result<Chunk, ModelError> {
    let root = chunk.root()?.id.clone();
    Ok(cloner.clone_nodes(&chunk.index(), &[root])?.into_chunk())
}

/// The command that replays `change` locally, its subtrees hydrated.
fn replay_command(cloner: &Cloner, change: &EventChange) -> Result<CommandChange, ModelError> {
    let command = match change.to_command()? {
        CommandChange::AddPartition { new_partition } => CommandChange::AddPartition {
            new_partition: hydrate(cloner, &new_partition)?,
        },
        CommandChange::AddChild { at, new_child } => CommandChange::AddChild {
            at,
            new_child: hydrate(cloner, &new_child)?,
        },
        CommandChange::ReplaceChild {
            at,
            replaced_child,
            new_child,
        } => CommandChange::ReplaceChild {
            at,
            replaced_child,
            new_child: hydrate(cloner, &new_child)?,
        },
        CommandChange::AddAnnotation { at, new_annotation } => CommandChange::AddAnnotation {
            at,
            new_annotation: hydrate(cloner, &new_annotation)?,
        },
        CommandChange::ReplaceAnnotation {
            at,
            replaced_annotation,
            new_annotation,
        } => CommandChange::ReplaceAnnotation {
            at,
            replaced_annotation,
            new_annotation: hydrate(cloner, &new_annotation)?,
        },
        other => other,
    };
    Ok(command)
}

/// Applies node-level events to one partition.
pub struct PartitionApplier {
    partition: Partition,
    cloner: Cloner,
}

impl PartitionApplier {
    fn new(partition: Partition, cloner: Cloner) -> Self {
        Self { partition, cloner }
    }

    pub fn root(&self) -> &NodeId {
        self.partition.root()
    }

    pub fn apply(&self, change: &EventChange) -> Result<(), ModelError> {
        self.execute(&replay_command(&self.cloner, change)?)
    }

    fn execute(&self, command: &CommandChange) -> Result<(), ModelError> {
        self.partition.execute(command)
    }
}

struct ApplierInner {
    forest: Forest,
    cloner: Cloner,
    appliers: RefCell<Vec<Rc<PartitionApplier>>>,
    observers: RefCell<Vec<ObserverId>>,
    disposed: Cell<bool>,
}

impl ApplierInner {
    fn register(&self, partition: &Partition) {
        debug!("applier: tracking partition {}", partition.root());
        self.appliers
            .borrow_mut()
            .push(Rc::new(PartitionApplier::new(partition.clone(), self.cloner)));
    }

    fn unregister(&self, root: &NodeId) {
        debug!("applier: dropping partition {}", root);
        self.appliers.borrow_mut().retain(|a| a.root() != root);
    }

    fn applier_for(&self, root: &NodeId) -> Option<Rc<PartitionApplier>> {
        self.appliers
            .borrow()
            .iter()
            .find(|a| a.root() == root)
            .cloned()
    }
}

/// Mirrors incoming events into a forest.
pub struct EventApplier {
    inner: Rc<ApplierInner>,
}

impl EventApplier {
    pub fn new(forest: &Forest, config: &SyncConfig) -> Self {
        let inner = Rc::new(ApplierInner {
            forest: forest.clone(),
            cloner: Cloner::new(IdMode::Preserve, config.hydration_references),
            appliers: RefCell::new(Vec::new()),
            observers: RefCell::new(Vec::new()),
            disposed: Cell::new(false),
        });
        for partition in forest.partitions() {
            inner.register(&partition);
        }

        let publisher = forest.publisher();
        let weak: Weak<ApplierInner> = Rc::downgrade(&inner);
        let added = publisher.on_new_partition(move |partition| {
            if let Some(inner) = weak.upgrade() {
                inner.register(partition);
            }
        });
        let weak: Weak<ApplierInner> = Rc::downgrade(&inner);
        let deleted = publisher.on_partition_deleted(move |root| {
            if let Some(inner) = weak.upgrade() {
                inner.unregister(root);
            }
        });
        inner.observers.borrow_mut().extend([added, deleted]);

        Self { inner }
    }

    pub fn forest(&self) -> &Forest {
        &self.inner.forest
    }

    /// Roots of the partitions currently tracked.
    pub fn roots(&self) -> Vec<NodeId> {
        self.inner
            .appliers
            .borrow()
            .iter()
            .map(|a| a.root().clone())
            .collect()
    }

    /// Apply every change of `event` in order.
    ///
    /// A composite event is first replayed on a scratch copy of the node map
    /// and leaves the forest untouched if any of its changes fails.
    pub fn apply(&self, event: &Event) -> Result<(), ModelError> {
        let commands = event
            .changes()
            .iter()
            .map(|change| replay_command(&self.inner.cloner, change))
            .collect::<Result<Vec<_>, _>>()?;
        if commands.len() > 1 {
            let mut scratch = self.inner.forest.nodes().clone();
            for command in &commands {
                scratch.apply(command)?;
            }
        }
        for command in &commands {
            self.execute(command)?;
        }
        Ok(())
    }

    /// Execute one already-hydrated command against the forest.
    pub fn execute(&self, command: &CommandChange) -> Result<(), ModelError> {
        let forest = &self.inner.forest;
        match command {
            CommandChange::AddPartition { new_partition } => {
                forest.add_partition(new_partition.clone())?;
                Ok(())
            }
            CommandChange::DeletePartition { deleted_partition } => {
                forest.delete_partition(deleted_partition)
            }
            other => {
                let anchor = other
                    .anchor()
                    .ok_or_else(|| ModelError::InvalidMutation("change has no anchor".into()))?;
                let root = forest
                    .nodes()
                    .partition_of(anchor)
                    .ok_or_else(|| ModelError::UnknownNode(anchor.clone()))?;
                let applier = self
                    .inner
                    .applier_for(&root)
                    .ok_or_else(|| ModelError::UnknownPartition(root.clone()))?;
                applier.execute(other)
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Unregister from the forest and drop every partition applier. Safe to
    /// call more than once.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        let publisher = self.inner.forest.publisher();
        for id in self.inner.observers.borrow_mut().drain(..) {
            publisher.remove_observer(id);
        }
        self.inner.appliers.borrow_mut().clear();
    }
}

impl Drop for EventApplier {
    fn drop(&mut self) {
        self.dispose();
    }
}
