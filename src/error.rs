//! Stable error taxonomy shared across the transport, RPC and lookup layers.
//!
//! Operation results are typed: a lookup yields `Result<_, DhtError>` and the
//! error kind tells the caller whether the failure was transport-level (the
//! peer may be down), protocol-level (the message was rejected) or semantic
//! (the operation ran but could not meet its contract).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DhtError {
    // Transport
    #[error("operation timed out")]
    TimedOut,
    #[error("remote endpoint unreachable")]
    RemoteUnreachable,
    #[error("no network available")]
    NoNetwork,
    #[error("failed to bind local endpoint: {0}")]
    BindError(String),
    #[error("failed to start listening: {0}")]
    ListenError(String),
    #[error("send failed: {0}")]
    SendFailure(String),
    #[error("receive failed: {0}")]
    ReceiveFailure(String),

    // Protocol
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("key is bound to a different signer")]
    SignerMismatch,
    #[error("value was deleted; replayed store refused")]
    Replay,
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    // Semantic
    #[error("not enough contacts to satisfy the operation")]
    NotEnoughContacts,
    #[error("store quorum not met: {contacted} of {required} required replicas")]
    NotEnoughStores { contacted: usize, required: usize },
    #[error("no bootstrap contacts supplied")]
    NoBootstrapContacts,
    #[error("key not found")]
    KeyNotFound,

    #[error("operation aborted")]
    Aborted,
}

impl DhtError {
    /// True for failures where the destination should be treated as down.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DhtError::TimedOut
                | DhtError::RemoteUnreachable
                | DhtError::NoNetwork
                | DhtError::SendFailure(_)
                | DhtError::ReceiveFailure(_)
        )
    }
}
