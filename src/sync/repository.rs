//! Repository-side replicator
//!
//! The repository owns the authoritative forest. Client commands are
//! validated and executed against it; the events that execution raises are
//! gathered into one event per command, stamped with the next repository
//! sequence number and the originating command ids, and fanned out to every
//! client. Edits the repository makes on its own are announced the same way,
//! without an origin.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::delta::{AtomicCommand, Command, CommandOrigin, Delta, Event, EventChange};
use crate::ids::{CommandId, NodeId, SequenceNumber};
use crate::model::{Forest, ModelError, ObserverId};
use crate::processor::{Handler, Processor};

use super::replicator::Wiring;
use super::{OutboundQueue, SyncError};

/// Everything a newly connected client needs to catch up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    /// One unsequenced `PartitionAdded` per partition.
    pub events: Vec<Event>,
    /// The sequence number of the first event sent after the snapshot.
    pub next_sequence: SequenceNumber,
}

struct Announcer {
    forest: Forest,
    outbound: OutboundQueue,
    next_sequence: Cell<SequenceNumber>,
    in_command: Cell<bool>,
    collected: RefCell<Vec<Event>>,
}

impl Announcer {
    fn observe(&self, delta: &Delta) {
        let event = match delta {
            Delta::Event(event) => event,
            Delta::Command(_) => return,
        };
        if self.in_command.get() {
            self.collected.borrow_mut().push(event.clone());
        } else {
            self.announce(event.clone());
        }
    }

    fn announce(&self, event: Event) {
        let sequence = self.next_sequence.get();
        self.next_sequence.set(sequence + 1);

        let affected = {
            let nodes = self.forest.nodes();
            let mut affected: Vec<NodeId> = Vec::new();
            for change in event.changes() {
                for root in change.affected_partitions(|id| nodes.partition_of(id)) {
                    if !affected.contains(&root) {
                        affected.push(root);
                    }
                }
            }
            affected
        };

        trace!(
            "repository: #{} {} touches {:?}",
            sequence,
            event.event_id,
            affected
        );
        self.outbound
            .push(Delta::Event(event.with_sequence(sequence)), affected);
    }
}

/// Authoritative side of replication.
pub struct RepositoryReplicator {
    forest: Forest,
    announcer: Rc<Announcer>,
    wiring: Rc<Wiring>,
    observers: Vec<ObserverId>,
    seen: RefCell<HashSet<CommandId>>,
    disposed: Cell<bool>,
}

impl RepositoryReplicator {
    pub fn new(forest: &Forest, outbound: OutboundQueue) -> Self {
        let announcer = Rc::new(Announcer {
            forest: forest.clone(),
            outbound,
            next_sequence: Cell::new(0),
            in_command: Cell::new(false),
            collected: RefCell::new(Vec::new()),
        });
        let weak: Weak<Announcer> = Rc::downgrade(&announcer);
        let collector: Rc<dyn Processor<Delta>> =
            Rc::new(Handler::new("repository-collector", move |delta: &Delta| {
                if let Some(announcer) = weak.upgrade() {
                    announcer.observe(delta);
                }
            }));
        let (wiring, observers) = Wiring::attach(forest, collector);

        debug!(
            "{}: serving {} partitions",
            forest.participation(),
            forest.partitions().len()
        );
        Self {
            forest: forest.clone(),
            announcer,
            wiring,
            observers,
            seen: RefCell::new(HashSet::new()),
            disposed: Cell::new(false),
        }
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    /// Sequence number the next announced event will carry.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.announcer.next_sequence.get()
    }

    pub fn has_seen(&self, command_id: &CommandId) -> bool {
        self.seen.borrow().contains(command_id)
    }

    /// Entry point for everything the connector receives from clients.
    pub fn receive(&self, delta: Delta) -> Result<(), SyncError> {
        match delta {
            Delta::Command(command) => self.receive_command(command),
            Delta::Event(event) => Err(SyncError::UnexpectedDelta(format!(
                "event {} sent to the repository",
                event.event_id
            ))),
        }
    }

    /// Validate and execute a client command, then announce the result.
    ///
    /// Parts whose command id was seen before are dropped; the remaining parts
    /// of a composite are checked in full against a scratch copy of the node
    /// map first and are rejected without side effects if any of them fails.
    pub fn receive_command(&self, command: Command) -> Result<(), SyncError> {
        if self.disposed.get() {
            return Err(SyncError::Disposed);
        }
        let fresh: Vec<&AtomicCommand> = {
            let seen = self.seen.borrow();
            let mut ids: HashSet<&CommandId> = HashSet::new();
            let fresh = command
                .parts()
                .iter()
                .filter(|part| !seen.contains(&part.command_id) && ids.insert(&part.command_id))
                .collect();
            fresh
        };
        if fresh.is_empty() {
            if !command.parts().is_empty() {
                debug!(
                    "repository: ignoring replayed command from {}",
                    command.participation
                );
            }
            return Ok(());
        }
        if fresh.len() < command.parts().len() {
            debug!(
                "repository: dropping {} replayed parts of a command from {}",
                command.parts().len() - fresh.len(),
                command.participation
            );
        }

        if fresh.len() > 1 {
            let mut scratch = self.forest.nodes().clone();
            for part in &fresh {
                scratch.apply(&part.change)?;
            }
        }

        self.announcer.in_command.set(true);
        let result: Result<(), ModelError> = fresh
            .iter()
            .try_for_each(|part| self.forest.execute(&part.change));
        self.announcer.in_command.set(false);
        let collected: Vec<Event> = self.announcer.collected.borrow_mut().drain(..).collect();

        if let Err(e) = &result {
            warn!(
                "repository: command from {} rejected: {}",
                command.participation, e
            );
        } else {
            self.seen
                .borrow_mut()
                .extend(fresh.iter().map(|part| part.command_id.clone()));
        }

        if let Some(event) = self.merge(&command, &fresh, collected) {
            self.announcer.announce(event);
        }
        Ok(result?)
    }

    /// One event per command: a lone event keeps its id, several are bundled.
    fn merge(
        &self,
        command: &Command,
        executed: &[&AtomicCommand],
        mut collected: Vec<Event>,
    ) -> Option<Event> {
        let mut event = match collected.len() {
            0 => return None,
            1 => collected.pop()?,
            _ => {
                let changes: Vec<EventChange> = collected
                    .iter()
                    .flat_map(|e| e.changes().iter().cloned())
                    .collect();
                Event::composite(self.forest.event_ids().next_id(), changes)
            }
        };
        for part in executed {
            event = event.with_origin(CommandOrigin::new(
                command.participation.clone(),
                part.command_id.clone(),
            ));
        }
        event.messages.extend(command.messages.iter().cloned());
        Some(event)
    }

    /// Snapshot of every partition plus where the event stream continues.
    pub fn bootstrap(&self) -> Result<Bootstrap, SyncError> {
        let mut events = Vec::new();
        for partition in self.forest.partitions() {
            events.push(Event::atomic(
                self.forest.event_ids().next_id(),
                EventChange::PartitionAdded {
                    new_partition: partition.snapshot()?,
                },
            ));
        }
        Ok(Bootstrap {
            events,
            next_sequence: self.next_sequence(),
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        self.wiring.detach(&self.forest, &self.observers);
        debug!("{}: repository replicator disposed", self.forest.participation());
    }
}

impl Drop for RepositoryReplicator {
    fn drop(&mut self) {
        self.dispose();
    }
}
