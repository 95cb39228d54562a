//! Diagnostic walk over a processor graph.

use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use super::{Message, Processor, ProcessorId};

/// One subscription edge found during a walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    pub from: (ProcessorId, String),
    pub to: (ProcessorId, String),
    /// `to` had already been visited, i.e. this edge closes a cycle or joins
    /// an already described branch.
    pub revisit: bool,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} -> {}{}",
            self.from.1, self.from.0, self.to.1, self.to.0
        )?;
        if self.revisit {
            f.write_str(" (seen)")?;
        }
        Ok(())
    }
}

/// Depth-first walk of everything reachable from `root` through subscriptions.
///
/// Each processor is expanded once; the visited set is local to the call.
pub fn describe<M: Message>(root: &Rc<dyn Processor<M>>) -> Vec<Edge> {
    let mut visited: HashSet<ProcessorId> = HashSet::new();
    let mut edges = Vec::new();
    let mut stack: Vec<Rc<dyn Processor<M>>> = vec![Rc::clone(root)];

    while let Some(current) = stack.pop() {
        if !visited.insert(current.id()) {
            continue;
        }
        let subscribers = current.subscribers();
        for next in &subscribers {
            edges.push(Edge {
                from: (current.id(), current.name().to_string()),
                to: (next.id(), next.name().to_string()),
                revisit: visited.contains(&next.id()),
            });
        }
        // reversed so the stack pops them in registration order
        for next in subscribers.iter().rev() {
            stack.push(Rc::clone(next));
        }
    }
    edges
}

/// True if some processor reachable from `root` subscribes, directly or
/// indirectly, back into one of its own upstream processors.
pub fn has_cycle<M: Message>(root: &Rc<dyn Processor<M>>) -> bool {
    // iterative three-colour DFS
    let mut done: HashSet<ProcessorId> = HashSet::new();
    let mut on_path: HashSet<ProcessorId> = HashSet::new();
    let mut stack: Vec<(Rc<dyn Processor<M>>, bool)> = vec![(Rc::clone(root), false)];

    while let Some((node, leaving)) = stack.pop() {
        let id = node.id();
        if leaving {
            on_path.remove(&id);
            done.insert(id);
            continue;
        }
        if done.contains(&id) {
            continue;
        }
        if !on_path.insert(id) {
            return true;
        }
        stack.push((Rc::clone(&node), true));
        for next in node.subscribers() {
            if on_path.contains(&next.id()) {
                return true;
            }
            if !done.contains(&next.id()) {
                stack.push((next, false));
            }
        }
    }
    false
}
