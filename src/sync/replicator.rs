//! Client-side replicator
//!
//! Local events flow through an echo filter and a command translator into the
//! outbound queue. Events from the repository are sequenced, then applied
//! through an [`EventApplier`] under a [`SuppressionGuard`].

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use log::{debug, trace, warn};
use serde::Serialize;

use crate::delta::{
    AtomicCommand, Command, CommandChange, Delta, DeltaSelector, Event, EventBody, EventChange,
};
use crate::ids::{CommandId, CommandIdMinter, NodeId, ParticipationId, SequenceNumber};
use crate::model::{Forest, ModelError, ObserverId, Partition};
use crate::processor::{Handler, Outbox, Pipeline, Processor};

use super::{
    Admission, Bootstrap, EventApplier, OutboundQueue, Sequencer, SuppressionSet, SyncConfig,
    SyncError,
};

/// Running counters, mostly for tests and diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplicatorStats {
    /// Remote events applied to the local forest.
    pub applied: u64,
    /// Remote events recognised as confirmations of our own commands.
    pub acknowledged: u64,
    /// Confirmations that had to correct the local forest because a peer's
    /// event touched the same nodes while the command was in flight.
    pub reconciled: u64,
    pub duplicates: u64,
    pub buffered: u64,
    /// Remote events that failed to apply.
    pub failed: u64,
    /// Commands handed to the outbound queue.
    pub sent: u64,
    /// Local echoes of remote events dropped before translation.
    pub suppressed: u64,
}

type SharedStats = Rc<RefCell<ReplicatorStats>>;

/// Nodes whose state a change depends on: the anchor, plus the source parent
/// of a move.
fn touched_nodes(change: &EventChange) -> Vec<NodeId> {
    use EventChange::*;
    match change {
        PartitionAdded { new_partition: c } | PartitionDeleted { deleted_partition: c } => {
            c.root().map(|n| vec![n.id.clone()]).unwrap_or_default()
        }
        ChildMovedFromOtherContainment { from, to, .. }
        | ChildMovedFromOtherContainmentInSameParent { from, to, .. }
        | ChildMovedAndReplacedFromOtherContainment { from, to, .. }
        | ChildMovedAndReplacedFromOtherContainmentInSameParent { from, to, .. } => {
            vec![from.parent.clone(), to.parent.clone()]
        }
        ChildMovedInSameContainment { from, .. }
        | ChildMovedAndReplacedInSameContainment { from, .. } => vec![from.parent.clone()],
        AnnotationMovedFromOtherParent { from, to, .. }
        | AnnotationMovedAndReplacedFromOtherParent { from, to, .. } => {
            vec![from.parent.clone(), to.parent.clone()]
        }
        AnnotationMovedInSameParent { from, .. }
        | AnnotationMovedAndReplacedInSameParent { from, .. } => vec![from.parent.clone()],
        EntryMovedFromOtherReference { from, to, .. }
        | EntryMovedFromOtherReferenceInSameParent { from, to, .. }
        | EntryMovedAndReplacedFromOtherReference { from, to, .. }
        | EntryMovedAndReplacedFromOtherReferenceInSameParent { from, to, .. } => {
            vec![from.parent.clone(), to.parent.clone()]
        }
        other => other
            .to_command()
            .ok()
            .and_then(|command| command.anchor().cloned())
            .into_iter()
            .collect(),
    }
}

/// Commands sent but not yet confirmed, with the nodes each one touches.
///
/// A pending command becomes contested when a peer's event touching one of
/// its nodes is applied before the confirmation arrives.
#[derive(Debug, Default)]
struct PendingCommands {
    touched: HashMap<CommandId, Vec<NodeId>>,
    contested: HashSet<CommandId>,
}

impl PendingCommands {
    fn record(&mut self, command_id: CommandId, change: &EventChange) {
        self.touched.insert(command_id, touched_nodes(change));
    }

    fn overlapping(&self, event: &Event) -> Vec<CommandId> {
        if self.touched.is_empty() {
            return Vec::new();
        }
        let nodes: HashSet<NodeId> = event.changes().iter().flat_map(touched_nodes).collect();
        self.touched
            .iter()
            .filter(|(_, touched)| touched.iter().any(|n| nodes.contains(n)))
            .map(|(command_id, _)| command_id.clone())
            .collect()
    }

    fn touches(&self, event: &Event) -> bool {
        !self.overlapping(event).is_empty()
    }

    fn contest(&mut self, event: &Event) {
        let overlapping = self.overlapping(event);
        self.contested.extend(overlapping);
    }

    /// Remove a confirmed command. `Some(contested)` if it was pending.
    fn confirm(&mut self, command_id: &CommandId) -> Option<bool> {
        self.touched.remove(command_id)?;
        Some(self.contested.remove(command_id))
    }

    fn len(&self) -> usize {
        self.touched.len()
    }
}

/// What an own confirmation found.
enum Confirmation {
    NotOurs,
    Settled,
    Contested,
}

enum Applied {
    Cleanly,
    Reconciled,
}

/// Changes whose event fully states the resulting value.
fn sets_value(change: &EventChange) -> bool {
    matches!(
        change,
        EventChange::PropertyAdded { .. }
            | EventChange::PropertyChanged { .. }
            | EventChange::PropertyDeleted { .. }
            | EventChange::ClassifierChanged { .. }
    )
}

/// Drops local events that echo a remote event being applied.
struct EchoFilter {
    outbox: Outbox<Delta>,
    suppression: SuppressionSet,
    stats: SharedStats,
}

impl Processor<Delta> for EchoFilter {
    fn name(&self) -> &str {
        "echo-filter"
    }

    fn outbox(&self) -> &Outbox<Delta> {
        &self.outbox
    }

    fn receive(&self, message: &Delta) {
        if let Delta::Event(event) = message {
            if self.suppression.contains(&event.event_id) {
                trace!("echo of {} suppressed", event.event_id);
                self.stats.borrow_mut().suppressed += 1;
                return;
            }
        }
        self.outbox.send(message);
    }
}

/// Turns a local event into the command that asks the repository for it.
struct CommandTranslator {
    outbox: Outbox<Delta>,
    minter: CommandIdMinter,
    pending: Option<Rc<RefCell<PendingCommands>>>,
}

impl CommandTranslator {
    fn part(&self, change: &EventChange) -> Result<AtomicCommand, ModelError> {
        let part = AtomicCommand::new(self.minter.mint(), change.to_command()?);
        if let Some(pending) = &self.pending {
            pending.borrow_mut().record(part.command_id.clone(), change);
        }
        Ok(part)
    }

    fn translate(&self, event: &Event) -> Result<Command, ModelError> {
        let participation = self.minter.participation().clone();
        let mut command = match &event.body {
            EventBody::Atomic(change) => {
                let part = self.part(change)?;
                Command::atomic(participation, part.command_id, part.change)
            }
            EventBody::Composite(changes) => Command::composite(
                participation,
                changes
                    .iter()
                    .map(|change| self.part(change))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };
        command.messages = event.messages.clone();
        Ok(command)
    }
}

impl Processor<Delta> for CommandTranslator {
    fn name(&self) -> &str {
        "command-translator"
    }

    fn outbox(&self) -> &Outbox<Delta> {
        &self.outbox
    }

    fn receive(&self, message: &Delta) {
        if let Delta::Event(event) = message {
            match self.translate(event) {
                Ok(command) => {
                    trace!("{:?} -> {:?}", event.shape(), command.shape());
                    self.outbox.send(&Delta::Command(command));
                }
                Err(e) => warn!("cannot translate {}: {}", event.event_id, e),
            }
        }
    }
}

/// Keeps one receiver subscribed to the events of every live partition.
pub(super) struct Wiring {
    receiver: Rc<dyn Processor<Delta>>,
    partitions: RefCell<Vec<Partition>>,
}

impl Wiring {
    /// Subscribe `receiver` to the forest and its partitions, now and as they
    /// come and go. Returns the observer handles to remove on disposal.
    pub(super) fn attach(
        forest: &Forest,
        receiver: Rc<dyn Processor<Delta>>,
    ) -> (Rc<Self>, Vec<ObserverId>) {
        let wiring = Rc::new(Self {
            receiver,
            partitions: RefCell::new(Vec::new()),
        });
        forest
            .publisher()
            .subscribe(Rc::clone(&wiring.receiver), DeltaSelector::Events);
        for partition in forest.partitions() {
            wiring.wire(&partition);
        }

        let weak: Weak<Wiring> = Rc::downgrade(&wiring);
        let added = forest.publisher().on_new_partition(move |partition| {
            if let Some(wiring) = weak.upgrade() {
                wiring.wire(partition);
            }
        });
        let weak: Weak<Wiring> = Rc::downgrade(&wiring);
        let deleted = forest.publisher().on_partition_deleted(move |root| {
            if let Some(wiring) = weak.upgrade() {
                wiring.unwire(root);
            }
        });
        (wiring, vec![added, deleted])
    }

    /// Undo [`Wiring::attach`].
    pub(super) fn detach(&self, forest: &Forest, observers: &[ObserverId]) {
        let publisher = forest.publisher();
        for id in observers {
            publisher.remove_observer(*id);
        }
        publisher.unsubscribe(self.receiver.id());
        let partitions: Vec<Partition> = self.partitions.borrow_mut().drain(..).collect();
        for partition in partitions {
            partition.publisher().unsubscribe(self.receiver.id());
        }
    }

    fn wire(&self, partition: &Partition) {
        trace!("replicator: wiring {}", partition.root());
        partition
            .publisher()
            .subscribe(Rc::clone(&self.receiver), DeltaSelector::Events);
        self.partitions.borrow_mut().push(partition.clone());
    }

    fn unwire(&self, root: &NodeId) {
        let removed: Vec<Partition> = {
            let mut partitions = self.partitions.borrow_mut();
            let (gone, kept): (Vec<_>, Vec<_>) =
                partitions.drain(..).partition(|p| p.root() == root);
            *partitions = kept;
            gone
        };
        for partition in removed {
            partition.publisher().unsubscribe(self.receiver.id());
        }
    }
}

/// Two-way replication between a local forest and one repository.
pub struct EventReplicator {
    forest: Forest,
    peer: ParticipationId,
    config: SyncConfig,
    applier: EventApplier,
    wiring: Rc<Wiring>,
    observers: Vec<ObserverId>,
    suppression: SuppressionSet,
    sequencer: RefCell<Sequencer<Event>>,
    pending: Rc<RefCell<PendingCommands>>,
    stats: SharedStats,
    disposed: Cell<bool>,
}

impl EventReplicator {
    pub fn new(
        forest: &Forest,
        peer: impl Into<ParticipationId>,
        config: SyncConfig,
        outbound: OutboundQueue,
    ) -> Result<Self, SyncError> {
        let peer = peer.into();
        let stats = SharedStats::default();
        let suppression = SuppressionSet::new();
        let pending = Rc::new(RefCell::new(PendingCommands::default()));

        let filter: Rc<dyn Processor<Delta>> = Rc::new(EchoFilter {
            outbox: Outbox::new(),
            suppression: suppression.clone(),
            stats: Rc::clone(&stats),
        });
        let translator: Rc<dyn Processor<Delta>> = Rc::new(CommandTranslator {
            outbox: Outbox::new(),
            minter: CommandIdMinter::new(forest.participation().clone()),
            pending: config
                .acknowledge_own_commands
                .then(|| Rc::clone(&pending)),
        });
        let pipeline: Rc<dyn Processor<Delta>> = Rc::new(Pipeline::new(vec![filter, translator])?);

        let sink_stats = Rc::clone(&stats);
        let sink = Rc::new(Handler::new("outbound", move |delta: &Delta| {
            if outbound.push(delta.clone(), Vec::new()) {
                sink_stats.borrow_mut().sent += 1;
            }
        }));
        pipeline.subscribe(sink, DeltaSelector::Commands);

        let applier = EventApplier::new(forest, &config);
        let (wiring, observers) = Wiring::attach(forest, pipeline);

        debug!(
            "{}: replicating {} partitions with {}",
            forest.participation(),
            forest.partitions().len(),
            peer
        );
        Ok(Self {
            forest: forest.clone(),
            peer,
            sequencer: RefCell::new(Sequencer::new(config.reorder_capacity)),
            config,
            applier,
            wiring,
            observers,
            suppression,
            pending,
            stats,
            disposed: Cell::new(false),
        })
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn peer(&self) -> &ParticipationId {
        &self.peer
    }

    pub fn stats(&self) -> ReplicatorStats {
        *self.stats.borrow()
    }

    /// Commands sent but not yet confirmed by the repository.
    pub fn pending_commands(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Remote events held back by a sequence gap.
    pub fn pending_events(&self) -> usize {
        self.sequencer.borrow().pending(&self.peer)
    }

    /// The sequence number holding things up, if anything is buffered.
    pub fn gap(&self) -> Option<SequenceNumber> {
        self.sequencer.borrow().gap(&self.peer)
    }

    pub fn next_expected(&self) -> SequenceNumber {
        self.sequencer.borrow().next_expected(&self.peer)
    }

    /// Entry point for everything the connector receives from the peer.
    ///
    /// Application failures are logged and counted, not returned: the peer
    /// has already committed the change.
    pub fn receive_from_peer(&self, delta: Delta) -> Result<(), SyncError> {
        if self.disposed.get() {
            return Err(SyncError::Disposed);
        }
        let event = match delta {
            Delta::Event(event) => event,
            Delta::Command(command) => {
                return Err(SyncError::UnexpectedDelta(format!(
                    "command from {} sent to a client",
                    command.participation
                )))
            }
        };

        let sequence = match event.sequence {
            Some(sequence) => sequence,
            None => {
                self.apply_remote(&event);
                return Ok(());
            }
        };
        let admission = self
            .sequencer
            .borrow_mut()
            .admit(&self.peer, sequence, event)?;
        match admission {
            Admission::Ready(events) => {
                for event in &events {
                    self.apply_remote(event);
                }
            }
            Admission::Buffered => {
                debug!("{}: buffered event #{}", self.forest.participation(), sequence);
                self.stats.borrow_mut().buffered += 1;
            }
            Admission::Duplicate => {
                trace!("{}: duplicate event #{}", self.forest.participation(), sequence);
                self.stats.borrow_mut().duplicates += 1;
            }
        }
        Ok(())
    }

    /// Load a repository snapshot, then continue from its sequence number.
    pub fn bootstrap(&self, bootstrap: Bootstrap) -> Result<(), SyncError> {
        if self.disposed.get() {
            return Err(SyncError::Disposed);
        }
        for event in &bootstrap.events {
            self.apply_remote(event);
        }
        let ready = self
            .sequencer
            .borrow_mut()
            .resume_at(&self.peer, bootstrap.next_sequence);
        for event in &ready {
            self.apply_remote(event);
        }
        Ok(())
    }

    fn acknowledge(&self, event: &Event) -> Confirmation {
        if !self.config.acknowledge_own_commands {
            return Confirmation::NotOurs;
        }
        let own = self.forest.participation();
        let mut pending = self.pending.borrow_mut();
        let mut confirmation = Confirmation::NotOurs;
        for origin in event.origin.iter().filter(|o| &o.participation == own) {
            match pending.confirm(&origin.command_id) {
                Some(true) => confirmation = Confirmation::Contested,
                Some(false) => {
                    if let Confirmation::NotOurs = confirmation {
                        confirmation = Confirmation::Settled;
                    }
                }
                None => {}
            }
        }
        confirmation
    }

    fn apply_remote(&self, event: &Event) {
        let confirmation = self.acknowledge(event);
        if let Confirmation::Settled = confirmation {
            trace!("{}: {} confirms our command", self.forest.participation(), event.event_id);
            self.stats.borrow_mut().acknowledged += 1;
            return;
        }

        let _guard = self
            .suppression
            .enter(event.event_id.clone(), self.forest.event_ids());
        let outcome = match confirmation {
            Confirmation::Contested => {
                self.stats.borrow_mut().acknowledged += 1;
                self.reconcile(event).map(|()| Applied::Reconciled)
            }
            _ => self.apply_or_reconcile(event),
        };
        match outcome {
            Ok(applied) => {
                let mut stats = self.stats.borrow_mut();
                match applied {
                    Applied::Cleanly => stats.applied += 1,
                    Applied::Reconciled => stats.reconciled += 1,
                }
                if let Confirmation::NotOurs = confirmation {
                    self.pending.borrow_mut().contest(event);
                }
            }
            Err(e) => {
                warn!(
                    "{}: failed to apply {} from {}: {}",
                    self.forest.participation(),
                    event.event_id,
                    self.peer,
                    e
                );
                self.stats.borrow_mut().failed += 1;
            }
        }
    }

    /// Apply a peer's event. If it clashes with a value one of our pending
    /// commands already wrote locally, take the event's value instead.
    fn apply_or_reconcile(&self, event: &Event) -> Result<Applied, ModelError> {
        match self.applier.apply(event) {
            Ok(()) => Ok(Applied::Cleanly),
            Err(e) if self.overrides_pending(event) => {
                debug!(
                    "{}: {} clashes with a pending command ({}), taking its values",
                    self.forest.participation(),
                    event.event_id,
                    e
                );
                self.reconcile(event)?;
                Ok(Applied::Reconciled)
            }
            Err(e) => Err(e),
        }
    }

    fn overrides_pending(&self, event: &Event) -> bool {
        event.changes().iter().all(sets_value) && self.pending.borrow().touches(event)
    }

    /// Bring the local forest to the state a contested confirmation reports.
    ///
    /// Our change is already in the forest, but a peer's change sequenced
    /// before it may have overwritten it or shifted its position.
    fn reconcile(&self, event: &Event) -> Result<(), ModelError> {
        debug!(
            "{}: reconciling {} with the repository order",
            self.forest.participation(),
            event.event_id
        );
        for change in event.changes() {
            if let Some(correction) = self.correction(change)? {
                self.applier.execute(&correction)?;
            }
        }
        Ok(())
    }

    fn correction(&self, change: &EventChange) -> Result<Option<CommandChange>, ModelError> {
        use EventChange::*;
        let correction = match change {
            PropertyAdded {
                node,
                property,
                new_value,
            }
            | PropertyChanged {
                node,
                property,
                new_value,
                ..
            } => self.forest.node(node).and_then(|n| match n.property(property) {
                Some(current) if current == new_value.as_str() => None,
                Some(_) => Some(CommandChange::ChangeProperty {
                    node: node.clone(),
                    property: property.clone(),
                    new_value: new_value.clone(),
                }),
                None => Some(CommandChange::AddProperty {
                    node: node.clone(),
                    property: property.clone(),
                    new_value: new_value.clone(),
                }),
            }),
            PropertyDeleted { node, property, .. } => self
                .forest
                .node(node)
                .filter(|n| n.property(property).is_some())
                .map(|_| CommandChange::DeleteProperty {
                    node: node.clone(),
                    property: property.clone(),
                }),
            ClassifierChanged {
                node,
                new_classifier,
                ..
            } => self
                .forest
                .node(node)
                .filter(|n| &n.classifier != new_classifier)
                .map(|_| CommandChange::ChangeClassifier {
                    node: node.clone(),
                    new_classifier: new_classifier.clone(),
                }),
            ChildAdded { at, new_child } => {
                let child = new_child.root()?.id.clone();
                self.forest
                    .node(&at.parent)
                    .and_then(|parent| {
                        parent
                            .children(&at.containment)
                            .iter()
                            .position(|c| c == &child)
                    })
                    .filter(|index| *index != at.index)
                    .map(|_| CommandChange::MoveChildInSameContainment {
                        new_index: at.index,
                        moved_child: child,
                    })
            }
            AnnotationAdded { at, new_annotation } => {
                let annotation = new_annotation.root()?.id.clone();
                self.forest
                    .node(&at.parent)
                    .and_then(|parent| parent.annotations.iter().position(|a| a == &annotation))
                    .filter(|index| *index != at.index)
                    .map(|_| CommandChange::MoveAnnotationInSameParent {
                        new_index: at.index,
                        moved_annotation: annotation,
                    })
            }
            _ => None,
        };
        Ok(correction)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Detach from the forest and every partition. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        self.wiring.detach(&self.forest, &self.observers);
        self.applier.dispose();
        debug!("{}: replicator disposed", self.forest.participation());
    }
}

impl Drop for EventReplicator {
    fn drop(&mut self) {
        self.dispose();
    }
}
