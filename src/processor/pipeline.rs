//! Building blocks: relays, closure handlers and linear pipelines.

use std::rc::Rc;

use super::{KindSelector, Message, Outbox, Processor, ProcessorError, ProcessorId};

/// Forwards everything it receives to its own subscribers.
pub struct Relay<M: Message> {
    name: String,
    outbox: Outbox<M>,
}

impl<M: Message> Relay<M> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outbox: Outbox::new(),
        }
    }
}

impl<M: Message> Processor<M> for Relay<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbox(&self) -> &Outbox<M> {
        &self.outbox
    }

    fn receive(&self, message: &M) {
        self.outbox.send(message);
    }
}

/// A terminal processor that hands each message to a closure.
pub struct Handler<M: Message> {
    name: String,
    outbox: Outbox<M>,
    callback: Box<dyn Fn(ProcessorId, &M)>,
}

impl<M: Message> Handler<M> {
    pub fn new(name: impl Into<String>, callback: impl Fn(&M) + 'static) -> Self {
        Self::new_with_self(name, move |_, m| callback(m))
    }

    /// Like [`Handler::new`], but the closure also gets the handler's own id,
    /// e.g. to unsubscribe itself.
    pub fn new_with_self(
        name: impl Into<String>,
        callback: impl Fn(ProcessorId, &M) + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            outbox: Outbox::new(),
            callback: Box::new(callback),
        }
    }
}

impl<M: Message> Processor<M> for Handler<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbox(&self) -> &Outbox<M> {
        &self.outbox
    }

    fn receive(&self, message: &M) {
        (self.callback)(self.outbox.id(), message);
    }
}

/// N ≥ 2 processors chained linearly.
///
/// Inbound messages enter the first stage; subscribers of the pipeline are
/// attached to the last stage.
pub struct Pipeline<M: Message> {
    id: ProcessorId,
    name: String,
    stages: Vec<Rc<dyn Processor<M>>>,
}

impl<M: Message> Pipeline<M> {
    pub fn new(stages: Vec<Rc<dyn Processor<M>>>) -> Result<Self, ProcessorError> {
        if stages.len() < 2 {
            return Err(ProcessorError::PipelineTooShort(stages.len()));
        }
        for pair in stages.windows(2) {
            pair[0].subscribe(Rc::clone(&pair[1]), M::Selector::all());
        }
        let name = stages
            .iter()
            .map(|s| s.name().to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        Ok(Self {
            id: ProcessorId::next(),
            name: format!("pipeline[{}]", name),
            stages,
        })
    }

    pub fn stages(&self) -> &[Rc<dyn Processor<M>>] {
        &self.stages
    }

    fn last(&self) -> &Rc<dyn Processor<M>> {
        &self.stages[self.stages.len() - 1]
    }
}

impl<M: Message> Processor<M> for Pipeline<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbox(&self) -> &Outbox<M> {
        self.last().outbox()
    }

    fn receive(&self, message: &M) {
        self.stages[0].receive(message);
    }

    fn id(&self) -> ProcessorId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::{Basket, Fruit, FruitSelector};
    use std::cell::RefCell;

    /// Doubles the count and passes it on.
    struct Doubler {
        outbox: Outbox<Basket>,
    }

    impl Processor<Basket> for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }

        fn outbox(&self) -> &Outbox<Basket> {
            &self.outbox
        }

        fn receive(&self, message: &Basket) {
            self.outbox.send(&Basket(message.0, message.1 * 2));
        }
    }

    fn doubler() -> Rc<dyn Processor<Basket>> {
        Rc::new(Doubler {
            outbox: Outbox::new(),
        })
    }

    #[test]
    fn test_pipeline_needs_two_stages() {
        assert_eq!(
            Pipeline::<Basket>::new(vec![]).err(),
            Some(ProcessorError::PipelineTooShort(0))
        );
        assert_eq!(
            Pipeline::new(vec![doubler()]).err(),
            Some(ProcessorError::PipelineTooShort(1))
        );
    }

    #[test]
    fn test_pipeline_chains_stages() {
        let pipeline = Pipeline::new(vec![doubler(), doubler(), doubler()]).unwrap();
        assert_eq!(pipeline.name(), "pipeline[doubler -> doubler -> doubler]");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = {
            let seen = Rc::clone(&seen);
            Rc::new(Handler::new("sink", move |b: &Basket| seen.borrow_mut().push(b.1)))
        };
        pipeline.subscribe(sink, FruitSelector::All);
        assert!(pipeline.can_receive(&[Fruit::Plum]));

        pipeline.receive(&Basket(Fruit::Plum, 1));
        assert_eq!(*seen.borrow(), vec![8]);
    }

    #[test]
    fn test_relay_forwards_filtered() {
        let relay: Relay<Basket> = Relay::new("relay");
        let seen = Rc::new(RefCell::new(0));
        let sink = {
            let seen = Rc::clone(&seen);
            Rc::new(Handler::new("sink", move |_: &Basket| *seen.borrow_mut() += 1))
        };
        relay.subscribe(sink, FruitSelector::Only(Fruit::Apple));

        relay.receive(&Basket(Fruit::Apple, 1));
        relay.receive(&Basket(Fruit::Pear, 1));
        assert_eq!(*seen.borrow(), 1);
    }
}
