//! Node identifiers, keypairs and contact records.
//!
//! Identifiers are 512-bit opaque values. A node's id is not a raw public
//! key: it is derived by hashing the Ed25519 public key together with that
//! key's self-signature, so holding an id implies holding the matching
//! private key. Closeness between ids is the Kademlia XOR metric.

use std::fmt;
use std::net::SocketAddr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Width of a node id in bits.
pub const NODE_ID_BITS: usize = 512;
/// Width of a node id in bytes.
pub const NODE_ID_LEN: usize = NODE_ID_BITS / 8;

/// Domain separator for deriving node ids from signing keys.
const ID_HASH_DOMAIN: &[u8] = b"kelpie-node-id-v1:";

// ============================================================================
// NodeId
// ============================================================================

/// A 512-bit identifier in the DHT keyspace.
///
/// Both node identities and record keys live in this space; a record is
/// stored on the nodes whose ids are XOR-closest to the record key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an id from a slice; fails unless the slice is exactly 64 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != NODE_ID_LEN {
            return None;
        }
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(bytes);
        Some(Self(arr))
    }

    /// A uniformly random id, used for record keys and test identities.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        getrandom::getrandom(&mut bytes).expect("system randomness unavailable");
        Self(bytes)
    }

    /// Derive a record key from arbitrary content.
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(content);
        let mut bytes = [0u8; NODE_ID_LEN];
        hasher.finalize_xof().fill(&mut bytes);
        Self(bytes)
    }

    /// The all-zero id used by anonymous client-only contacts.
    pub fn zero() -> Self {
        Self([0u8; NODE_ID_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading bits this id shares with `other`, counted from the
    /// most significant bit. Equal ids share all `NODE_ID_BITS` bits.
    pub fn common_prefix_bits(&self, other: &NodeId) -> usize {
        for (byte_idx, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return byte_idx * 8 + diff.leading_zeros() as usize;
            }
        }
        NODE_ID_BITS
    }

    /// True iff `self` is strictly closer to `target` than `other` is.
    pub fn closer_to(&self, target: &NodeId, other: &NodeId) -> bool {
        distance_cmp(&self.xor_distance(target), &other.xor_distance(target))
            == std::cmp::Ordering::Less
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

/// Compare two XOR distances lexicographically.
///
/// `Less` means the first distance is smaller, i.e. the first id is closer
/// to the target the distances were measured against.
#[inline]
pub fn distance_cmp(a: &[u8; NODE_ID_LEN], b: &[u8; NODE_ID_LEN]) -> std::cmp::Ordering {
    a.iter().cmp(b.iter())
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// serde's derive stops at 32-byte arrays, so ids serialize as raw byte
// strings by hand.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{NODE_ID_LEN} bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<NodeId, E> {
                NodeId::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<NodeId, A::Error> {
                let mut bytes = [0u8; NODE_ID_LEN];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(NodeId(bytes))
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}

// ============================================================================
// Keypair
// ============================================================================

/// An Ed25519 signing keypair plus its derived node id.
///
/// The id is `BLAKE3-XOF(domain || public_key || sign(public_key))` widened
/// to 64 bytes. Ed25519 signatures are deterministic, so the derivation is
/// reproducible by anyone holding the public key and its self-signature.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    node_id: NodeId,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(signing: SigningKey) -> Self {
        let public = signing.verifying_key().to_bytes();
        let validation = signing.sign(&public).to_bytes();
        let node_id = derive_node_id(&public, &validation);
        Self { signing, node_id }
    }

    /// Deterministic keypair from a 32-byte seed; test identities use this.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Self-signature over the public key, distributed alongside it so peers
    /// can re-derive and check the node id.
    pub fn key_validation(&self) -> Vec<u8> {
        self.signing.sign(&self.public_key()).to_bytes().to_vec()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Recompute a node id from a public key and its self-signature.
pub fn derive_node_id(public_key: &[u8], key_validation: &[u8]) -> NodeId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ID_HASH_DOMAIN);
    hasher.update(public_key);
    hasher.update(key_validation);
    let mut bytes = [0u8; NODE_ID_LEN];
    hasher.finalize_xof().fill(&mut bytes);
    NodeId::from_bytes(bytes)
}

/// Verify `signature` over `message` under a raw 32-byte Ed25519 key.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    verifying
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

// ============================================================================
// Contact
// ============================================================================

/// A peer's advertised identity and reachability information.
///
/// Two contacts are equal iff their node ids are equal; endpoint changes do
/// not create a new identity. A contact is only trusted for routing once its
/// public key has been fetched and checked against `public_key_id`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    /// Endpoint peers should dial first.
    pub primary_endpoint: SocketAddr,
    /// Additional endpoints on other interfaces.
    pub local_endpoints: Vec<SocketAddr>,
    /// Rendezvous endpoint for NAT-bound peers, passed through opaquely.
    pub rendezvous_endpoint: Option<SocketAddr>,
    /// Identifier of the signing key; equals the node id in this network.
    pub public_key_id: NodeId,
    /// Raw Ed25519 public key (32 bytes).
    pub public_key: Vec<u8>,
    /// Self-signature over the public key, used to re-derive the id.
    pub signature: Vec<u8>,
}

impl Contact {
    /// Build the contact a node advertises for itself.
    pub fn new(keypair: &Keypair, primary: SocketAddr, local: Vec<SocketAddr>) -> Self {
        Self {
            node_id: keypair.node_id(),
            primary_endpoint: primary,
            local_endpoints: local,
            rendezvous_endpoint: None,
            public_key_id: keypair.node_id(),
            public_key: keypair.public_key().to_vec(),
            signature: keypair.key_validation(),
        }
    }

    /// An anonymous contact for client-only nodes: carries endpoints and the
    /// signing key but a zero node id, so peers never route to it.
    pub fn anonymous(keypair: &Keypair, primary: SocketAddr) -> Self {
        Self {
            node_id: NodeId::zero(),
            primary_endpoint: primary,
            local_endpoints: Vec::new(),
            rendezvous_endpoint: None,
            public_key_id: keypair.node_id(),
            public_key: keypair.public_key().to_vec(),
            signature: keypair.key_validation(),
        }
    }

    /// Check that the embedded public key re-derives the claimed key id.
    pub fn key_matches_id(&self) -> bool {
        derive_node_id(&self.public_key, &self.signature) == self.public_key_id
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("node_id", &self.node_id)
            .field("endpoint", &self.primary_endpoint)
            .finish_non_exhaustive()
    }
}
