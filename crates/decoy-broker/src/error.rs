//! Broker error types.

/// Why an attach was refused. Terminal for that attempt; the session is
/// left untouched.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttachError {
    /// A leg for this role is already bound to the session.
    #[error("a {0} leg is already attached to this call")]
    RoleOccupied(decoy_types::Role),

    /// The broker is at its configured session cap.
    #[error("session limit reached")]
    ServerBusy,

    /// The session ended while the attach was in flight. The registry
    /// retries this internally with a fresh session; callers never see it
    /// unless the broker is shutting down.
    #[error("session already ended")]
    Ended,
}
