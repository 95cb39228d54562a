//! Wire encodings for deltas
//!
//! JSON for inspection and interop, CBOR (`ciborium`) as the compact binary
//! form. Both carry the same logical shapes.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use super::Delta;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR error: {0}")]
    Cbor(String),
}

pub fn to_json(delta: &Delta) -> Result<String, CodecError> {
    Ok(serde_json::to_string(delta)?)
}

pub fn from_json(text: &str) -> Result<Delta, CodecError> {
    Ok(serde_json::from_str(text)?)
}

pub fn to_cbor(delta: &Delta) -> Result<Vec<u8>, CodecError> {
    cbor_serialize(delta)
}

pub fn from_cbor(data: &[u8]) -> Result<Delta, CodecError> {
    cbor_deserialize(data)
}

fn cbor_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Cbor(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(data).map_err(|e| CodecError::Cbor(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{
        AtomicCommand, ChildSlot, Command, CommandChange, CommandOrigin, EntrySlot, Event,
        EventChange, ProtocolMessage,
    };
    use crate::ids::MetaPointer;
    use crate::model::{Chunk, Node, ReferenceTarget};

    fn mp(key: &str) -> MetaPointer {
        MetaPointer::new("shapes", "1", key)
    }

    fn sample_event() -> Delta {
        let child = Chunk::new(vec![
            Node::new("c", mp("Circle"))
                .with_parent("g")
                .with_property(mp("radius"), "4")
                .with_child(mp("center"), "p")
                .with_reference(mp("peer"), ReferenceTarget::labelled("x", "X")),
            Node::new("p", mp("Point")).with_parent("c"),
        ]);
        Delta::Event(
            Event::atomic(
                "repo-evt-1".into(),
                EventChange::ChildAdded {
                    at: ChildSlot::new("g", mp("shapes"), 0),
                    new_child: child,
                },
            )
            .with_sequence(1)
            .with_origin(CommandOrigin::new("client".into(), "client-cmd-4".into()))
            .with_message(ProtocolMessage::new("info", "hydrated").with_data("nodes", "2")),
        )
    }

    fn sample_command() -> Delta {
        Delta::Command(Command::composite(
            "client".into(),
            vec![
                AtomicCommand::new(
                    "client-cmd-0".into(),
                    CommandChange::ChangeReferenceTarget {
                        at: EntrySlot::new("c", mp("peer"), 0),
                        old_target: "x".into(),
                        new_target: "y".into(),
                    },
                ),
                AtomicCommand::new(
                    "client-cmd-1".into(),
                    CommandChange::MoveChildInSameContainment {
                        new_index: 2,
                        moved_child: "c".into(),
                    },
                ),
            ],
        ))
    }

    #[test]
    fn test_json_preserves_delta() {
        for delta in [sample_event(), sample_command()] {
            let text = to_json(&delta).unwrap();
            assert_eq!(from_json(&text).unwrap(), delta);
        }
    }

    #[test]
    fn test_cbor_preserves_delta_and_is_smaller() {
        for delta in [sample_event(), sample_command()] {
            let bytes = to_cbor(&delta).unwrap();
            assert_eq!(from_cbor(&bytes).unwrap(), delta);
            assert!(bytes.len() < to_json(&delta).unwrap().len());
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(from_json("{\"Event\":"), Err(CodecError::Json(_))));
        assert!(matches!(from_cbor(&[0xff, 0x00]), Err(CodecError::Cbor(_))));
    }
}
