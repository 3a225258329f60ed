//! Encrypted dispatch pipeline.
//!
//! [`Dispatcher::send`] decides for every outgoing event whether the target
//! room requires end-to-end encryption. Plaintext rooms get the content as
//! is. Encrypted rooms go through the group session lifecycle:
//!
//! 1. Resolve the joined members, a failure aborts the send
//! 2. Re-share the session when the membership changed since the last share
//! 3. Encrypt with the active session
//! 4. When the session is unusable, share a new one and encrypt again, once.
//!    A session shared in step 2 is not shared again
//! 5. Send the ciphertext as `m.room.encrypted`
//!
//! The caller's transaction id is used for the final send whatever the path,
//! so a retried command cannot produce a duplicate event.

use std::sync::Arc;

use log::{debug, info, warn};
use matrix_sdk::ruma::{OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId};
use serde_json::Value;
use thiserror::Error;

use crate::matrix::{
    crypto::{CryptoError, EncryptOutcome, GroupCrypto},
    events::ENCRYPTED,
    requester::{Homeserver, RequestError},
    state_cache::{RoomStateCache, StateError},
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Lookup(#[from] StateError),
    #[error("failed to resolve the members of {room_id}: {source}")]
    MembershipResolution {
        room_id: OwnedRoomId,
        source: RequestError,
    },
    #[error("room {0} has no joined members to share the session with")]
    EmptyMembership(OwnedRoomId),
    #[error("failed to share the group session of {room_id}: {source}")]
    Session {
        room_id: OwnedRoomId,
        source: CryptoError,
    },
    #[error("group session of {room_id} is still unusable after sharing a new one: {outcome:?}")]
    SessionRecoveryExhausted {
        room_id: OwnedRoomId,
        outcome: EncryptOutcome,
    },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("failed to send the event: {0}")]
    Transport(#[from] RequestError),
    #[error("failed to serialize the event content: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Sends events, encrypting them for the rooms that require it.
pub struct Dispatcher<H: Homeserver, C: GroupCrypto> {
    homeserver: Arc<H>,
    crypto: Arc<C>,
    cache: Arc<RoomStateCache<H>>,
}

impl<H: Homeserver, C: GroupCrypto> Dispatcher<H, C> {
    pub fn new(homeserver: Arc<H>, crypto: Arc<C>, cache: Arc<RoomStateCache<H>>) -> Self {
        Dispatcher {
            homeserver,
            crypto,
            cache,
        }
    }

    /// Sends an event of type `event_type` to `room_id`.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The target room
    /// * `event_type` - The type of the event, `m.room.message` for a message
    /// * `content` - The plaintext content
    /// * `txn_id` - Transaction id of the send, a fresh one is generated when `None`
    ///
    /// # Errors
    ///
    /// Returns an error when the encryption state of the room is unknown, when
    /// its members cannot be resolved, when the group session cannot be
    /// recovered after one new share, or when a request fails. Nothing is sent
    /// in plaintext to an encrypted room.
    pub async fn send(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
        txn_id: Option<OwnedTransactionId>,
    ) -> Result<OwnedEventId, DispatchError> {
        let txn_id = txn_id.unwrap_or_else(TransactionId::new);

        if !self.cache.is_encrypted(room_id).await? {
            debug!("room {} is not encrypted, send {} in plaintext", room_id, event_type);
            let event_id = self
                .homeserver
                .send_event(room_id, event_type, &content, &txn_id)
                .await?;
            return Ok(event_id);
        }

        let members = self.members(room_id).await?;

        let reshared = self.cache.take_membership_changed(room_id).await;
        if reshared {
            info!("membership of {} changed, re-share its group session", room_id);
            if let Err(source) = self.crypto.share_session(room_id, &members).await {
                // the next send must try again
                self.cache.mark_membership_changed(room_id).await;
                return Err(DispatchError::Session {
                    room_id: room_id.to_owned(),
                    source,
                });
            }
        }

        let ciphertext = self
            .encrypt_with_recovery(room_id, event_type, &content, &members, reshared)
            .await?;

        let event_id = self
            .homeserver
            .send_event(room_id, ENCRYPTED, &ciphertext, &txn_id)
            .await?;
        debug!("encrypted {} sent to {} as {}", event_type, room_id, event_id);
        Ok(event_id)
    }

    async fn members(&self, room_id: &RoomId) -> Result<Vec<OwnedUserId>, DispatchError> {
        let members = self
            .cache
            .try_resolve_members(room_id)
            .await
            .map_err(|source| DispatchError::MembershipResolution {
                room_id: room_id.to_owned(),
                source,
            })?;

        if members.is_empty() {
            return Err(DispatchError::EmptyMembership(room_id.to_owned()));
        }

        Ok(members.into_keys().collect())
    }

    /// Encrypts `content`, sharing a new session and retrying once when the
    /// active one is unusable.
    ///
    /// With `just_shared`, the session was shared by this send already and an
    /// unusable outcome fails without another share.
    async fn encrypt_with_recovery(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
        members: &[OwnedUserId],
        just_shared: bool,
    ) -> Result<Value, DispatchError> {
        match self.crypto.encrypt(room_id, event_type, content).await? {
            EncryptOutcome::Valid(ciphertext) => return Ok(ciphertext),
            outcome if just_shared => {
                return Err(DispatchError::SessionRecoveryExhausted {
                    room_id: room_id.to_owned(),
                    outcome,
                });
            }
            outcome => warn!(
                "group session of {} unusable ({:?}), share a new one",
                room_id, outcome
            ),
        }

        self.crypto
            .share_session(room_id, members)
            .await
            .map_err(|source| DispatchError::Session {
                room_id: room_id.to_owned(),
                source,
            })?;

        match self.crypto.encrypt(room_id, event_type, content).await? {
            EncryptOutcome::Valid(ciphertext) => Ok(ciphertext),
            outcome => Err(DispatchError::SessionRecoveryExhausted {
                room_id: room_id.to_owned(),
                outcome,
            }),
        }
    }
}
