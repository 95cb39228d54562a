//! Processor graph
//!
//! A small synchronous publish/subscribe network. Every processor has one
//! inbound entry point ([`Processor::receive`]) and an [`Outbox`] that
//! broadcasts to whoever subscribed, filtered by message kind.
//!
//! Message kinds form a closed world: a [`KindSelector`] names either a single
//! concrete kind or a category, and expands to the concrete kinds it covers.
//! Subscriptions keep a reference count per concrete kind so that
//! [`Processor::can_receive`] is a hash lookup per asked kind. Callers use it to
//! skip building a message nobody listens to.
//!
//! Delivery is synchronous and reentrant: `receive` runs its whole effect chain
//! on the caller's thread, subscribers are called in registration order.

mod outbox;
mod pipeline;
pub mod topology;

pub use outbox::Outbox;
pub use pipeline::{Handler, Pipeline, Relay};

use std::fmt;
use std::hash::Hash;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("A pipeline needs at least 2 stages, got {0}")]
    PipelineTooShort(usize),
}

/// Names a set of concrete message kinds.
pub trait KindSelector<K>: Clone + fmt::Debug {
    /// Selector covering every kind.
    fn all() -> Self;

    /// The concrete kinds this selector covers.
    fn expand(&self) -> Vec<K>;
}

/// A message flowing through the processor graph.
pub trait Message: 'static {
    type Kind: Copy + Eq + Hash + fmt::Debug + 'static;
    type Selector: KindSelector<Self::Kind> + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Identity of a processor, used for unsubscription and topology walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessorId(u64);

impl ProcessorId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node of the processor graph.
pub trait Processor<M: Message> {
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;

    /// Where this processor's output goes.
    fn outbox(&self) -> &Outbox<M>;

    /// Single entry point for inbound messages.
    fn receive(&self, message: &M);

    fn id(&self) -> ProcessorId {
        self.outbox().id()
    }

    /// Wire this processor's output into `receiver`, for the kinds `selector` covers.
    fn subscribe(&self, receiver: Rc<dyn Processor<M>>, selector: M::Selector) {
        self.outbox().subscribe(receiver, selector)
    }

    /// Returns false if `receiver` was not subscribed.
    fn unsubscribe(&self, receiver: ProcessorId) -> bool {
        self.outbox().unsubscribe(receiver)
    }

    /// Would at least one of `kinds` reach a subscriber?
    fn can_receive(&self, kinds: &[M::Kind]) -> bool {
        self.outbox().can_receive(kinds)
    }

    fn subscribers(&self) -> Vec<Rc<dyn Processor<M>>> {
        self.outbox().subscribers()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A toy message type for exercising the graph without the delta vocabulary.

    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum Fruit {
        Apple,
        Pear,
        Plum,
    }

    #[derive(Clone, Debug)]
    pub enum FruitSelector {
        All,
        Pome,
        Only(Fruit),
    }

    impl KindSelector<Fruit> for FruitSelector {
        fn all() -> Self {
            FruitSelector::All
        }

        fn expand(&self) -> Vec<Fruit> {
            match self {
                FruitSelector::All => vec![Fruit::Apple, Fruit::Pear, Fruit::Plum],
                FruitSelector::Pome => vec![Fruit::Apple, Fruit::Pear],
                FruitSelector::Only(f) => vec![*f],
            }
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct Basket(pub Fruit, pub u32);

    impl Message for Basket {
        type Kind = Fruit;
        type Selector = FruitSelector;

        fn kind(&self) -> Fruit {
            self.0
        }
    }
}
