use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use super::{KindSelector, Message, Processor, ProcessorId};

struct Subscription<M: Message> {
    receiver_id: ProcessorId,
    receiver: Rc<dyn Processor<M>>,
    kinds: HashSet<M::Kind>,
}

/// Output side of a processor: subscriber list plus per-kind reference counts.
pub struct Outbox<M: Message> {
    id: ProcessorId,
    subscriptions: RefCell<Vec<Subscription<M>>>,
    counts: RefCell<HashMap<M::Kind, usize>>,
}

impl<M: Message> Outbox<M> {
    pub fn new() -> Self {
        Self {
            id: ProcessorId::next(),
            subscriptions: RefCell::new(Vec::new()),
            counts: RefCell::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    /// Broadcast to every subscriber whose selector covers the message's kind.
    ///
    /// Iterates over a snapshot, so receivers may subscribe or unsubscribe
    /// while being called.
    pub fn send(&self, message: &M) {
        let kind = message.kind();
        let targets: Vec<Rc<dyn Processor<M>>> = self
            .subscriptions
            .borrow()
            .iter()
            .filter(|s| s.kinds.contains(&kind))
            .map(|s| Rc::clone(&s.receiver))
            .collect();

        for target in targets {
            target.receive(message);
        }
    }

    pub fn subscribe(&self, receiver: Rc<dyn Processor<M>>, selector: M::Selector) {
        let kinds: HashSet<M::Kind> = selector.expand().into_iter().collect();
        {
            let mut counts = self.counts.borrow_mut();
            for kind in &kinds {
                *counts.entry(*kind).or_insert(0) += 1;
            }
        }
        self.subscriptions.borrow_mut().push(Subscription {
            receiver_id: receiver.id(),
            receiver,
            kinds,
        });
    }

    /// Removes every subscription of `receiver`.
    pub fn unsubscribe(&self, receiver: ProcessorId) -> bool {
        let removed: Vec<Subscription<M>> = {
            let mut subs = self.subscriptions.borrow_mut();
            let (gone, kept): (Vec<_>, Vec<_>) =
                subs.drain(..).partition(|s| s.receiver_id == receiver);
            *subs = kept;
            gone
        };

        let mut counts = self.counts.borrow_mut();
        for sub in &removed {
            for kind in &sub.kinds {
                if let Some(count) = counts.get_mut(kind) {
                    *count -= 1;
                    if *count == 0 {
                        counts.remove(kind);
                    }
                }
            }
        }
        !removed.is_empty()
    }

    pub fn can_receive(&self, kinds: &[M::Kind]) -> bool {
        let counts = self.counts.borrow();
        kinds.iter().any(|k| counts.contains_key(k))
    }

    pub fn can_receive_any(&self, selector: &M::Selector) -> bool {
        self.can_receive(&selector.expand())
    }

    pub fn subscribers(&self) -> Vec<Rc<dyn Processor<M>>> {
        let mut seen = HashSet::new();
        self.subscriptions
            .borrow()
            .iter()
            .filter(|s| seen.insert(s.receiver_id))
            .map(|s| Rc::clone(&s.receiver))
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

impl<M: Message> Default for Outbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::{Basket, Fruit, FruitSelector};
    use crate::processor::Handler;

    fn recorder(log: &Rc<RefCell<Vec<String>>>, tag: &'static str) -> Rc<Handler<Basket>> {
        let log = Rc::clone(log);
        Rc::new(Handler::new(tag, move |b: &Basket| {
            log.borrow_mut().push(format!("{}:{:?}", tag, b.0));
        }))
    }

    #[test]
    fn test_delivery_is_filtered_by_kind() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let outbox: Outbox<Basket> = Outbox::new();
        outbox.subscribe(recorder(&log, "pome"), FruitSelector::Pome);
        outbox.subscribe(recorder(&log, "plum"), FruitSelector::Only(Fruit::Plum));

        outbox.send(&Basket(Fruit::Pear, 1));
        outbox.send(&Basket(Fruit::Plum, 2));

        assert_eq!(*log.borrow(), vec!["pome:Pear", "plum:Plum"]);
    }

    #[test]
    fn test_registration_order_is_kept() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let outbox: Outbox<Basket> = Outbox::new();
        outbox.subscribe(recorder(&log, "first"), FruitSelector::All);
        outbox.subscribe(recorder(&log, "second"), FruitSelector::All);
        outbox.subscribe(recorder(&log, "third"), FruitSelector::All);

        outbox.send(&Basket(Fruit::Apple, 0));

        assert_eq!(
            *log.borrow(),
            vec!["first:Apple", "second:Apple", "third:Apple"]
        );
    }

    #[test]
    fn test_can_receive_tracks_reference_counts() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let outbox: Outbox<Basket> = Outbox::new();
        assert!(!outbox.can_receive(&[Fruit::Apple]));

        let a = recorder(&log, "a");
        let b = recorder(&log, "b");
        outbox.subscribe(a.clone(), FruitSelector::Pome);
        outbox.subscribe(b.clone(), FruitSelector::Only(Fruit::Apple));

        assert!(outbox.can_receive(&[Fruit::Apple]));
        assert!(outbox.can_receive(&[Fruit::Plum, Fruit::Pear]));
        assert!(!outbox.can_receive(&[Fruit::Plum]));

        assert!(outbox.unsubscribe(a.id()));
        assert!(outbox.can_receive(&[Fruit::Apple]));
        assert!(!outbox.can_receive(&[Fruit::Pear]));

        assert!(outbox.unsubscribe(b.id()));
        assert!(!outbox.can_receive(&[Fruit::Apple]));

        // second unsubscribe is a no-op
        assert!(!outbox.unsubscribe(b.id()));
    }

    #[test]
    fn test_unsubscribe_during_delivery() {
        let outbox: Rc<Outbox<Basket>> = Rc::new(Outbox::new());
        let calls = Rc::new(RefCell::new(0));

        let self_removing: Rc<Handler<Basket>> = {
            let outbox = Rc::clone(&outbox);
            let calls = Rc::clone(&calls);
            Rc::new(Handler::new_with_self("once", move |me, _b: &Basket| {
                *calls.borrow_mut() += 1;
                outbox.unsubscribe(me);
            }))
        };
        outbox.subscribe(self_removing, FruitSelector::All);

        outbox.send(&Basket(Fruit::Apple, 1));
        outbox.send(&Basket(Fruit::Apple, 2));

        assert_eq!(*calls.borrow(), 1);
        assert_eq!(outbox.subscriber_count(), 0);
    }
}
