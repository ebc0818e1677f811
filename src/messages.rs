//! Wire types for the RPC layer.
//!
//! Every request travels inside a signed envelope: the sender's contact,
//! the id of its signing key, the payload and a signature over the encoded
//! payload. Responses are matched to requests by a correlation id carried
//! in the outer frame. Serialization is bincode with a hard size limit so a
//! hostile peer cannot make us allocate unboundedly.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::DhtError;
use crate::identity::{Contact, NodeId};
use crate::store::KeyValueSignature;

/// Maximum size of a stored value. Values must fit in a single datagram
/// alongside the envelope overhead.
pub const MAX_VALUE_SIZE: usize = 32 * 1024;

/// Maximum buffer size accepted by deserialization, with headroom for
/// framing and contact lists.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 16 * 1024;

/// Bincode options with the size limit enforced. All decoding of
/// network-supplied bytes goes through this.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Request payloads, one per RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestPayload {
    Ping,
    FindNodes {
        target: NodeId,
    },
    FindValue {
        key: NodeId,
    },
    Store {
        kvs: KeyValueSignature,
        ttl_secs: u64,
    },
    Delete {
        kvs: KeyValueSignature,
    },
    /// Republication of an earlier store: the original encoded `Store`
    /// payload and the original publisher's signature over it, forwarded
    /// verbatim by whichever replica currently holds the record.
    StoreRefresh {
        original_request: Vec<u8>,
        original_signature: Vec<u8>,
    },
}

/// A request and the sender's signature over its encoded payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub sender: Contact,
    pub signing_key_id: NodeId,
    pub payload: RequestPayload,
    pub signature: Vec<u8>,
}

/// Error kinds that cross the wire. A subset of [`DhtError`]: transport
/// failures never travel, they are observed locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    SignatureInvalid,
    SignerMismatch,
    Replay,
    Malformed,
    KeyNotFound,
    /// The peer is not serving (client-only or not yet joined).
    NotServing,
}

impl From<WireError> for DhtError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::SignatureInvalid => DhtError::SignatureInvalid,
            WireError::SignerMismatch => DhtError::SignerMismatch,
            WireError::Replay => DhtError::Replay,
            WireError::Malformed => DhtError::MalformedMessage("rejected by peer".into()),
            WireError::KeyNotFound => DhtError::KeyNotFound,
            WireError::NotServing => DhtError::RemoteUnreachable,
        }
    }
}

/// Response payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ResponsePayload {
    Pong,
    Nodes {
        contacts: Vec<Contact>,
    },
    /// FIND_VALUE result. `values` and `contacts` are mutually exclusive;
    /// `alternative_store_holder` may accompany an otherwise empty reply
    /// when the serving node holds the key outside the DHT store.
    Value {
        values: Vec<KeyValueSignature>,
        contacts: Vec<Contact>,
        alternative_store_holder: Option<Contact>,
    },
    Stored,
    Deleted,
    Refreshed,
    Error {
        kind: WireError,
    },
}

/// A response plus the responder's transport quality hint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub result: ResponsePayload,
    /// Round-trip estimate observed by the responder for this peer, if any.
    pub rtt_hint_ms: Option<u32>,
}

/// Outer frame: correlates requests with responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    Request { id: u64, envelope: RequestEnvelope },
    Response { id: u64, envelope: ResponseEnvelope },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn envelope_round_trip() {
        let kp = Keypair::from_seed([7u8; 32]);
        let contact = Contact::new(&kp, "127.0.0.1:4100".parse().unwrap(), vec![]);
        let payload = RequestPayload::FindNodes {
            target: NodeId::random(),
        };
        let payload_bytes = serialize(&payload).unwrap();
        let envelope = RequestEnvelope {
            sender: contact,
            signing_key_id: kp.node_id(),
            signature: kp.sign(&payload_bytes),
            payload,
        };
        let msg = WireMessage::Request { id: 42, envelope };
        let bytes = serialize(&msg).unwrap();
        let back: WireMessage = deserialize_bounded(&bytes).unwrap();
        match back {
            WireMessage::Request { id, envelope } => {
                assert_eq!(id, 42);
                assert_eq!(envelope.signing_key_id, kp.node_id());
            }
            _ => panic!("wrong frame"),
        }
    }

    #[test]
    fn oversized_input_is_rejected() {
        let huge = vec![0u8; (MAX_DESERIALIZE_SIZE as usize) + 1];
        assert!(deserialize_bounded::<WireMessage>(&huge).is_err());
    }
}
