//! Identity types shared by the model and the delta vocabulary
//!
//! Node, command and event identities are plain strings on the wire. The
//! newtypes here keep them from being mixed up in signatures.

use std::cell::{Cell, RefCell};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Process-wide unique identity of a node.
    NodeId
);
string_id!(
    /// Identity of one atomic command, chosen by the command's originator.
    CommandId
);
string_id!(
    /// Identity of one raised event. Locally raised events inherit the id of
    /// the remote event being applied, which is what echo suppression keys on.
    EventId
);
string_id!(
    /// Identifies one participant (the repository or a client).
    ParticipationId
);

/// Per-source monotonically increasing event number.
pub type SequenceNumber = u64;

/// Points at a classifier or feature inside a language.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetaPointer {
    pub language: String,
    pub version: String,
    pub key: String,
}

impl MetaPointer {
    pub fn new(
        language: impl Into<String>,
        version: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            language: language.into(),
            version: version.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for MetaPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.language, self.version, self.key)
    }
}

/// Mints fresh node ids for the cloner.
pub fn fresh_node_id() -> NodeId {
    NodeId(Uuid::new_v4().to_string())
}

/// Mints command ids prefixed by the owning participation.
pub struct CommandIdMinter {
    participation: ParticipationId,
    next: Cell<u64>,
}

impl CommandIdMinter {
    pub fn new(participation: ParticipationId) -> Self {
        Self {
            participation,
            next: Cell::new(0),
        }
    }

    pub fn participation(&self) -> &ParticipationId {
        &self.participation
    }

    pub fn mint(&self) -> CommandId {
        let n = self.next.get();
        self.next.set(n + 1);
        CommandId(format!("{}-cmd-{}", self.participation, n))
    }
}

/// Source of event ids for one participant.
///
/// While a remote event is being applied the source is pinned to that event's
/// id; every event raised in the meantime carries it.
pub struct EventIdSource {
    participation: ParticipationId,
    next: Cell<u64>,
    pinned: RefCell<Vec<EventId>>,
}

impl EventIdSource {
    pub fn new(participation: ParticipationId) -> Self {
        Self {
            participation,
            next: Cell::new(0),
            pinned: RefCell::new(Vec::new()),
        }
    }

    pub fn participation(&self) -> &ParticipationId {
        &self.participation
    }

    /// Id for the next raised event.
    pub fn next_id(&self) -> EventId {
        if let Some(pinned) = self.pinned.borrow().last() {
            return pinned.clone();
        }
        let n = self.next.get();
        self.next.set(n + 1);
        EventId(format!("{}-evt-{}", self.participation, n))
    }

    pub(crate) fn pin(&self, id: EventId) {
        self.pinned.borrow_mut().push(id);
    }

    pub(crate) fn unpin(&self, id: &EventId) {
        let mut pinned = self.pinned.borrow_mut();
        if let Some(pos) = pinned.iter().rposition(|p| p == id) {
            pinned.remove(pos);
        }
    }

    pub fn is_pinned(&self) -> bool {
        !self.pinned.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_follow_pin() {
        let source = EventIdSource::new("client-a".into());
        let first = source.next_id();
        let second = source.next_id();
        assert_ne!(first, second);

        let remote = EventId::new("repo-evt-7");
        source.pin(remote.clone());
        assert_eq!(source.next_id(), remote);
        assert_eq!(source.next_id(), remote);
        source.unpin(&remote);

        assert!(!source.is_pinned());
        assert_eq!(source.next_id().as_str(), "client-a-evt-2");
    }

    #[test]
    fn test_command_ids_are_prefixed() {
        let minter = CommandIdMinter::new("client-b".into());
        assert_eq!(minter.mint().as_str(), "client-b-cmd-0");
        assert_eq!(minter.mint().as_str(), "client-b-cmd-1");
    }

    #[test]
    fn test_fresh_node_ids_differ() {
        assert_ne!(fresh_node_id(), fresh_node_id());
    }
}
