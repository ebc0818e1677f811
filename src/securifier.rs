//! Signing, verification and public-key resolution.
//!
//! The securifier owns the process keypair and is the only component that
//! touches private key material. Peers are identified by a key id (the hash
//! binding of their public key, see [`crate::identity::derive_node_id`]);
//! resolving an id to its key goes through a bounded cache first and an
//! optional pluggable resolver second.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::identity::{derive_node_id, verify_signature, Keypair, NodeId};

/// How many resolved keys to keep cached.
const KEY_CACHE_SIZE: usize = 1024;

/// A public key together with the validation token (the key's
/// self-signature) that binds it to its key id.
#[derive(Clone, Debug)]
pub struct ResolvedKey {
    pub public_key: Vec<u8>,
    pub validation: Vec<u8>,
}

/// Source of public keys for ids not seen yet (a key server, a local
/// keystore). Resolution may be slow; callers treat `None` as unknown.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, key_id: &NodeId) -> Option<ResolvedKey>;
}

pub struct Securifier {
    keypair: Keypair,
    cache: Mutex<LruCache<NodeId, ResolvedKey>>,
    resolver: Option<Arc<dyn KeyResolver>>,
}

impl Securifier {
    pub fn new(keypair: Keypair) -> Self {
        Self::with_resolver(keypair, None)
    }

    pub fn with_resolver(keypair: Keypair, resolver: Option<Arc<dyn KeyResolver>>) -> Self {
        Self {
            keypair,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(KEY_CACHE_SIZE).expect("nonzero cache size"),
            )),
            resolver,
        }
    }

    pub fn signing_key_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn signing_public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    pub fn key_validation(&self) -> Vec<u8> {
        self.keypair.key_validation()
    }

    /// Sign with the process-wide key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message)
    }

    /// Sign with an explicit key, for callers managing their own identities.
    pub fn asym_sign(message: &[u8], keypair: &Keypair) -> Vec<u8> {
        keypair.sign(message)
    }

    /// Check that `public_key`+`validation` bind to `signer_id`, and that
    /// `signature` verifies `message` under that key.
    ///
    /// An empty signature skips the message check; contact validation uses
    /// this form, where only the key binding matters.
    pub fn validate(
        &self,
        message: &[u8],
        signature: &[u8],
        signer_id: &NodeId,
        public_key: &[u8],
        validation: &[u8],
    ) -> bool {
        if derive_node_id(public_key, validation) != *signer_id {
            trace!(signer = %&signer_id.to_hex()[..16], "key id binding mismatch");
            return false;
        }
        if signature.is_empty() {
            return true;
        }
        verify_signature(public_key, message, signature)
    }

    /// Record a key observed on the wire so later resolutions hit the cache.
    /// Keys that fail the id binding are ignored.
    pub fn learn_key(&self, key_id: NodeId, public_key: Vec<u8>, validation: Vec<u8>) {
        if derive_node_id(&public_key, &validation) != key_id {
            return;
        }
        self.cache.lock().put(
            key_id,
            ResolvedKey {
                public_key,
                validation,
            },
        );
    }

    /// Resolve a key id to its public key and validation token.
    ///
    /// Completes inline on a cache hit, otherwise defers to the configured
    /// resolver.
    pub async fn get_public_key_and_validation(&self, signer_id: &NodeId) -> Option<ResolvedKey> {
        if let Some(found) = self.cache.lock().get(signer_id) {
            return Some(found.clone());
        }
        let resolver = self.resolver.as_ref()?;
        let resolved = resolver.resolve(signer_id).await?;
        self.cache.lock().put(*signer_id, resolved.clone());
        Some(resolved)
    }
}

impl std::fmt::Debug for Securifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Securifier")
            .field("signing_key_id", &self.signing_key_id())
            .finish_non_exhaustive()
    }
}
