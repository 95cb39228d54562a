//! Forest: the set of partitions one participant holds
//!
//! [`Forest`] is the commander for partition-level changes; [`ForestPublisher`]
//! announces them. Each announcement goes to two audiences whose relative
//! order is fixed:
//!
//! * a new partition reaches the typed `on_new_partition` observers first, then
//!   the generic [`Outbox`] sink;
//! * a deleted partition reaches the generic sink first, then the typed
//!   `on_partition_deleted` observers.
//!
//! Replication relies on this: by the time the generic sink forwards a new
//! partition, observers have already wired themselves to its publisher; and a
//! deletion is forwarded while those wires are still in place.

use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::delta::{CommandChange, Delta, DeltaKind, Event, Shape};
use crate::ids::{EventIdSource, NodeId, ParticipationId};
use crate::processor::{Outbox, Processor};

use super::{Chunk, ModelError, Node, Partition, SharedNodeMap};

/// Handle returned when registering a typed observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type NewPartitionObserver = Rc<dyn Fn(&Partition)>;
type PartitionDeletedObserver = Rc<dyn Fn(&NodeId)>;

/// Publisher side of a forest.
pub struct ForestPublisher {
    outbox: Outbox<Delta>,
    new_partition: RefCell<Vec<(ObserverId, NewPartitionObserver)>>,
    partition_deleted: RefCell<Vec<(ObserverId, PartitionDeletedObserver)>>,
}

impl ForestPublisher {
    fn new() -> Self {
        Self {
            outbox: Outbox::new(),
            new_partition: RefCell::new(Vec::new()),
            partition_deleted: RefCell::new(Vec::new()),
        }
    }

    pub fn on_new_partition(&self, observer: impl Fn(&Partition) + 'static) -> ObserverId {
        let id = ObserverId::next();
        self.new_partition.borrow_mut().push((id, Rc::new(observer)));
        id
    }

    pub fn on_partition_deleted(&self, observer: impl Fn(&NodeId) + 'static) -> ObserverId {
        let id = ObserverId::next();
        self.partition_deleted.borrow_mut().push((id, Rc::new(observer)));
        id
    }

    /// Unregister a typed observer. Unknown ids are ignored.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut removed = false;
        self.new_partition.borrow_mut().retain(|(o, _)| {
            let keep = *o != id;
            removed |= !keep;
            keep
        });
        self.partition_deleted.borrow_mut().retain(|(o, _)| {
            let keep = *o != id;
            removed |= !keep;
            keep
        });
        removed
    }

    pub fn can_raise(&self, kind: DeltaKind) -> bool {
        self.outbox.can_receive(&[kind])
    }

    pub fn can_raise_add_partition(&self) -> bool {
        !self.new_partition.borrow().is_empty() || self.can_raise(DeltaKind::event(Shape::AddPartition))
    }

    pub fn can_raise_delete_partition(&self) -> bool {
        !self.partition_deleted.borrow().is_empty()
            || self.can_raise(DeltaKind::event(Shape::DeletePartition))
    }

    fn raise_new_partition(&self, partition: &Partition, event: impl FnOnce() -> Event) {
        let observers: Vec<NewPartitionObserver> = self
            .new_partition
            .borrow()
            .iter()
            .map(|(_, o)| Rc::clone(o))
            .collect();
        for observer in observers {
            observer(partition);
        }
        if self.can_raise(DeltaKind::event(Shape::AddPartition)) {
            self.outbox.send(&Delta::Event(event()));
        }
    }

    fn raise_partition_deleted(&self, root: &NodeId, event: impl FnOnce() -> Event) {
        if self.can_raise(DeltaKind::event(Shape::DeletePartition)) {
            self.outbox.send(&Delta::Event(event()));
        }
        let observers: Vec<PartitionDeletedObserver> = self
            .partition_deleted
            .borrow()
            .iter()
            .map(|(_, o)| Rc::clone(o))
            .collect();
        for observer in observers {
            observer(root);
        }
    }
}

impl Processor<Delta> for ForestPublisher {
    fn name(&self) -> &str {
        "forest"
    }

    fn outbox(&self) -> &Outbox<Delta> {
        &self.outbox
    }

    fn receive(&self, message: &Delta) {
        self.outbox.send(message);
    }
}

struct ForestInner {
    participation: ParticipationId,
    map: Rc<RefCell<SharedNodeMap>>,
    event_ids: Rc<EventIdSource>,
    publisher: Rc<ForestPublisher>,
    partitions: RefCell<Vec<Partition>>,
}

/// Cheap-to-clone handle to a participant's forest.
#[derive(Clone)]
pub struct Forest {
    inner: Rc<ForestInner>,
}

impl Forest {
    pub fn new(participation: impl Into<ParticipationId>) -> Self {
        Self::with_map(participation, SharedNodeMap::new())
    }

    /// A forest over an existing (usually empty, language-checked) node map.
    pub fn with_map(participation: impl Into<ParticipationId>, map: SharedNodeMap) -> Self {
        let participation = participation.into();
        Self {
            inner: Rc::new(ForestInner {
                event_ids: Rc::new(EventIdSource::new(participation.clone())),
                participation,
                map: Rc::new(RefCell::new(map)),
                publisher: Rc::new(ForestPublisher::new()),
                partitions: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn participation(&self) -> &ParticipationId {
        &self.inner.participation
    }

    pub fn event_ids(&self) -> &Rc<EventIdSource> {
        &self.inner.event_ids
    }

    pub fn publisher(&self) -> &Rc<ForestPublisher> {
        &self.inner.publisher
    }

    /// Read access to the node map. Do not hold it across a mutation.
    pub fn nodes(&self) -> Ref<'_, SharedNodeMap> {
        self.inner.map.borrow()
    }

    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.inner.map.borrow().get(id).cloned()
    }

    pub fn digest(&self) -> String {
        self.inner.map.borrow().digest()
    }

    pub fn partitions(&self) -> Vec<Partition> {
        self.inner.partitions.borrow().clone()
    }

    pub fn partition(&self, root: &NodeId) -> Option<Partition> {
        self.inner
            .partitions
            .borrow()
            .iter()
            .find(|p| p.root() == root)
            .cloned()
    }

    /// The partition holding `node`.
    pub fn partition_of(&self, node: &NodeId) -> Option<Partition> {
        let root = self.inner.map.borrow().partition_of(node)?;
        self.partition(&root)
    }

    pub fn can_raise_add_partition(&self) -> bool {
        self.inner.publisher.can_raise_add_partition()
    }

    pub fn can_raise_delete_partition(&self) -> bool {
        self.inner.publisher.can_raise_delete_partition()
    }

    /// Register `chunk` as a new partition. Fails without side effects if any
    /// of its ids is already taken.
    pub fn add_partition(&self, chunk: Chunk) -> Result<Partition, ModelError> {
        let root = chunk.root()?.id.clone();
        let change = self.inner.map.borrow_mut().apply(&CommandChange::AddPartition {
            new_partition: chunk,
        })?;
        debug!("{}: partition {} added", self.inner.participation, root);

        let partition = Partition::new(
            root,
            Rc::clone(&self.inner.map),
            Rc::clone(&self.inner.event_ids),
        );
        self.inner.partitions.borrow_mut().push(partition.clone());

        let event_ids = &self.inner.event_ids;
        self.inner
            .publisher
            .raise_new_partition(&partition, || Event::atomic(event_ids.next_id(), change));
        Ok(partition)
    }

    pub fn delete_partition(&self, root: &NodeId) -> Result<(), ModelError> {
        if self.partition(root).is_none() {
            return Err(ModelError::UnknownPartition(root.clone()));
        }
        let change = self.inner.map.borrow_mut().apply(&CommandChange::DeletePartition {
            deleted_partition: root.clone(),
        })?;
        self.inner
            .partitions
            .borrow_mut()
            .retain(|p| p.root() != root);
        debug!("{}: partition {} deleted", self.inner.participation, root);

        let event_ids = &self.inner.event_ids;
        self.inner
            .publisher
            .raise_partition_deleted(root, || Event::atomic(event_ids.next_id(), change));
        Ok(())
    }

    /// Run any atomic change, routing node-level ones to the partition that
    /// holds their anchor node.
    pub fn execute(&self, change: &CommandChange) -> Result<(), ModelError> {
        match change {
            CommandChange::AddPartition { new_partition } => {
                self.add_partition(new_partition.clone()).map(|_| ())
            }
            CommandChange::DeletePartition { deleted_partition } => {
                self.delete_partition(deleted_partition)
            }
            other => {
                let anchor = other
                    .anchor()
                    .ok_or_else(|| ModelError::InvalidMutation("change has no anchor".into()))?;
                let partition = self
                    .partition_of(anchor)
                    .ok_or_else(|| ModelError::UnknownNode(anchor.clone()))?;
                partition.execute(other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaSelector;
    use crate::ids::MetaPointer;
    use crate::processor::{Handler, Message};

    fn mp(key: &str) -> MetaPointer {
        MetaPointer::new("shapes", "1", key)
    }

    fn doc(id: &str) -> Chunk {
        Chunk::single(Node::new(id, mp("Document")))
    }

    fn record_generic(forest: &Forest, log: &Rc<RefCell<Vec<String>>>) {
        let log = Rc::clone(log);
        forest.publisher().subscribe(
            Rc::new(Handler::new("generic", move |d: &Delta| {
                log.borrow_mut().push(format!("generic:{:?}", d.kind().shape));
            })),
            DeltaSelector::EventFamily(crate::delta::Family::Partition),
        );
    }

    #[test]
    fn test_new_partition_notifies_typed_first() {
        let forest = Forest::new("client");
        let log = Rc::new(RefCell::new(Vec::new()));
        record_generic(&forest, &log);
        {
            let log = Rc::clone(&log);
            forest.publisher().on_new_partition(move |p| {
                log.borrow_mut().push(format!("typed:{}", p.root()));
            });
        }

        forest.add_partition(doc("d1")).unwrap();
        assert_eq!(*log.borrow(), vec!["typed:d1", "generic:AddPartition"]);
    }

    #[test]
    fn test_deleted_partition_notifies_generic_first() {
        let forest = Forest::new("client");
        forest.add_partition(doc("d1")).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        record_generic(&forest, &log);
        {
            let log = Rc::clone(&log);
            forest.publisher().on_partition_deleted(move |root| {
                log.borrow_mut().push(format!("typed:{}", root));
            });
        }

        forest.delete_partition(&"d1".into()).unwrap();
        assert_eq!(*log.borrow(), vec!["generic:DeletePartition", "typed:d1"]);
        assert!(forest.partitions().is_empty());
        assert!(forest.nodes().is_empty());
    }

    #[test]
    fn test_duplicate_partition_fails_alone() {
        let forest = Forest::new("client");
        let first = forest
            .add_partition(Chunk::single(
                Node::new("d1", mp("Document")).with_property(mp("name"), "first"),
            ))
            .unwrap();

        let err = forest.add_partition(doc("d1")).unwrap_err();
        assert_eq!(err, ModelError::DuplicateNode("d1".into()));
        assert_eq!(forest.partitions().len(), 1);
        assert_eq!(
            first.node(&"d1".into()).unwrap().property(&mp("name")),
            Some("first")
        );
    }

    #[test]
    fn test_can_raise_follows_observers() {
        let forest = Forest::new("client");
        assert!(!forest.can_raise_add_partition());
        assert!(!forest.can_raise_delete_partition());

        let id = forest.publisher().on_new_partition(|_| {});
        assert!(forest.can_raise_add_partition());
        assert!(!forest.can_raise_delete_partition());

        assert!(forest.publisher().remove_observer(id));
        assert!(!forest.publisher().remove_observer(id));
        assert!(!forest.can_raise_add_partition());

        // nothing listens, so no event id is spent
        forest.add_partition(doc("d1")).unwrap();
        assert_eq!(forest.event_ids().next_id().as_str(), "client-evt-0");
    }

    #[test]
    fn test_unknown_partition_delete() {
        let forest = Forest::new("client");
        assert_eq!(
            forest.delete_partition(&"nope".into()),
            Err(ModelError::UnknownPartition("nope".into()))
        );
    }
}
