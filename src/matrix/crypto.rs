//! Group encryption collaborator.
//!
//! The cryptographic work (Megolm sessions, Olm key distribution, signatures)
//! lives behind the [`GroupCrypto`] trait. The dispatch pipeline only observes
//! the outcome of an encryption attempt through [`EncryptOutcome`] and reacts
//! to it with pattern matching.
//!
//! The production implementation is
//! [`OlmCrypto`](crate::matrix::encryption::OlmCrypto).

use matrix_sdk::ruma::{OwnedUserId, RoomId};
use mockall::automock;
use serde_json::Value;
use thiserror::Error;

/// Result of an attempt to encrypt an event with the room's active group session.
#[derive(Debug, Clone, PartialEq)]
pub enum EncryptOutcome {
    /// The session is valid, holds the `m.room.encrypted` content
    Valid(Value),
    /// The session reached its message count or age limit
    Expired,
    /// A session exists but was never shared with the current members
    NotShared,
    /// No outbound session exists for the room
    NoSession,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption store error: {0}")]
    Store(String),
    #[error("encryption request failed: {0}")]
    Request(String),
    #[error("failed to share the group session of {room_id}: {message}")]
    Share { room_id: String, message: String },
    #[error("failed to encrypt the event: {0}")]
    Encrypt(String),
}

/// Group-session encryption for a room.
#[automock]
pub trait GroupCrypto {
    /// Encrypts `content` of type `event_type` with the room's active outbound session.
    ///
    /// The event type travels inside the ciphertext so the recipients can
    /// restore the original event.
    async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> Result<EncryptOutcome, CryptoError>;

    /// Creates a new outbound session if needed and distributes its key to every device
    /// of `members`.
    async fn share_session(
        &self,
        room_id: &RoomId,
        members: &[OwnedUserId],
    ) -> Result<(), CryptoError>;
}
