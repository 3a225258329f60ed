//! Per-room encryption and membership state.
//!
//! The [`RoomStateCache`] answers the two questions the dispatch pipeline asks
//! before every send: is the room encrypted, and who is in it. The encryption
//! flag is cached; membership is always fetched again because it decides who
//! receives the group session keys.
//!
//! # Concurrency
//!
//! The cache is shared behind an `Arc` by the sync loop and the dispatcher.
//! Encryption states sit behind a read/write lock: lookups only take the read
//! side, and the write side is taken once per refresh. A room seen encrypted
//! stays encrypted for the lifetime of the process.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};
use matrix_sdk::ruma::{OwnedRoomId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::matrix::{
    events::{ENCRYPTION, MEMBER},
    requester::{Homeserver, RequestError},
    response_structs::MemberSet,
};

/// What to do when the encryption state of a room cannot be fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupPolicy {
    /// Treat the room as unencrypted and send in plaintext
    FailOpen,
    /// Report the error and send nothing
    #[default]
    FailClosed,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("could not determine whether room {room_id} is encrypted: {source}")]
    Lookup {
        room_id: OwnedRoomId,
        source: RequestError,
    },
}

#[derive(Debug, Clone, Copy)]
struct RoomEncryptionState {
    encrypted: bool,
    last_refreshed: Instant,
}

/// Cache of room encryption flags and membership changes.
///
/// # Examples
///
/// ```no_run
/// let cache = RoomStateCache::new(requester, LookupPolicy::FailClosed, Duration::from_secs(300));
/// if cache.is_encrypted(room_id).await? {
///     let members = cache.resolve_members(room_id).await;
/// }
/// ```
pub struct RoomStateCache<H: Homeserver> {
    homeserver: Arc<H>,
    policy: LookupPolicy,
    /// How long an unencrypted answer is trusted before asking again
    ttl: Duration,
    encryption: RwLock<HashMap<OwnedRoomId, RoomEncryptionState>>,
    /// Rooms whose membership changed since their group session was last shared
    stale_sessions: Mutex<HashSet<OwnedRoomId>>,
}

impl<H: Homeserver> RoomStateCache<H> {
    /// Create a new [RoomStateCache].
    ///
    /// # Arguments
    ///
    /// * `homeserver` - Requester used for cache misses.
    /// * `policy` - Behaviour when the encryption state lookup fails.
    /// * `ttl` - Lifetime of a cached "not encrypted" answer.
    pub fn new(homeserver: Arc<H>, policy: LookupPolicy, ttl: Duration) -> Self {
        RoomStateCache {
            homeserver,
            policy,
            ttl,
            encryption: RwLock::new(HashMap::new()),
            stale_sessions: Mutex::new(HashSet::new()),
        }
    }

    /// Whether events sent to `room_id` must be encrypted.
    ///
    /// Answers from the cache when possible. Otherwise requests the
    /// `m.room.encryption` state event: its absence means unencrypted. When the
    /// request fails, the [`LookupPolicy`] decides between `Ok(false)` and an
    /// error; neither outcome is cached.
    ///
    /// Once this returns `true` for a room it returns `true` for every later call.
    pub async fn is_encrypted(&self, room_id: &RoomId) -> Result<bool, StateError> {
        let cached = self.encryption.read().await.get(room_id).copied();
        if let Some(state) = cached
            && (state.encrypted || state.last_refreshed.elapsed() < self.ttl)
        {
            trace!("encryption state of {} cached: {}", room_id, state.encrypted);
            return Ok(state.encrypted);
        }

        debug!("look up encryption state of {}", room_id);
        match self.homeserver.get_state_event(room_id, ENCRYPTION, "").await {
            Ok(content) => Ok(self.store(room_id, content.is_some()).await),
            Err(source) => match self.policy {
                LookupPolicy::FailOpen => {
                    warn!(
                        "encryption state lookup of {} failed, treating it as unencrypted: {}",
                        room_id, source
                    );
                    Ok(false)
                }
                LookupPolicy::FailClosed => Err(StateError::Lookup {
                    room_id: room_id.to_owned(),
                    source,
                }),
            },
        }
    }

    /// Records that `room_id` is encrypted, as observed in an `m.room.encryption` event.
    pub async fn mark_encrypted(&self, room_id: &RoomId) {
        self.store(room_id, true).await;
        debug!("room {} marked as encrypted", room_id);
    }

    /// Stores a fresh answer and returns the resulting flag, which never goes
    /// from encrypted back to unencrypted.
    async fn store(&self, room_id: &RoomId, encrypted: bool) -> bool {
        let mut states = self.encryption.write().await;
        let state = states
            .entry(room_id.to_owned())
            .or_insert(RoomEncryptionState {
                encrypted,
                last_refreshed: Instant::now(),
            });

        state.encrypted |= encrypted;
        state.last_refreshed = Instant::now();
        state.encrypted
    }

    /// Fetches the joined members of `room_id`.
    ///
    /// A failed request is logged and yields an empty set.
    pub async fn resolve_members(&self, room_id: &RoomId) -> MemberSet {
        match self.try_resolve_members(room_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!("failed to fetch members of {}: {}", room_id, e);
                MemberSet::new()
            }
        }
    }

    /// Fetches the joined members of `room_id`, propagating a failed request.
    pub async fn try_resolve_members(&self, room_id: &RoomId) -> Result<MemberSet, RequestError> {
        let members = self.homeserver.joined_members(room_id).await?;
        debug!("room {} has {} joined members", room_id, members.len());
        Ok(members)
    }

    /// Lists the encrypted rooms, among the rooms the client is joined to, where
    /// `user_id` is joined too.
    ///
    /// Rooms whose state cannot be fetched are skipped with a warning.
    pub async fn find_encrypted_rooms_shared_with(&self, user_id: &UserId) -> BTreeSet<OwnedRoomId> {
        let joined_rooms = match self.homeserver.joined_rooms().await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!("failed to list joined rooms: {}", e);
                return BTreeSet::new();
            }
        };

        let mut shared = BTreeSet::new();
        for room_id in joined_rooms {
            match self.is_encrypted(&room_id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("skip room {}: {}", room_id, e);
                    continue;
                }
            }

            match self
                .homeserver
                .get_state_event(&room_id, MEMBER, user_id.as_str())
                .await
            {
                Ok(Some(content)) if content["membership"] == "join" => {
                    debug!("{} is joined to encrypted room {}", user_id, room_id);
                    shared.insert(room_id);
                }
                Ok(_) => {}
                Err(e) => warn!("failed to fetch membership of {} in {}: {}", user_id, room_id, e),
            }
        }

        shared
    }

    /// Marks the group session of `room_id` as stale after a membership change.
    pub async fn mark_membership_changed(&self, room_id: &RoomId) {
        if self.stale_sessions.lock().await.insert(room_id.to_owned()) {
            info!("membership of {} changed, its group session must be re-shared", room_id);
        }
    }

    /// Clears the stale mark of `room_id`, returning whether it was set.
    pub async fn take_membership_changed(&self, room_id: &RoomId) -> bool {
        self.stale_sessions.lock().await.remove(room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::requester::MockHomeserver;
    use matrix_sdk::ruma::{owned_room_id, room_id, user_id};
    use serde_json::json;

    fn forbidden() -> RequestError {
        RequestError::Status {
            status: 500,
            errcode: "M_UNKNOWN".to_owned(),
            message: "boom".to_owned(),
        }
    }

    fn cache(homeserver: MockHomeserver, policy: LookupPolicy) -> RoomStateCache<MockHomeserver> {
        RoomStateCache::new(Arc::new(homeserver), policy, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_is_encrypted_with_encryption_state() {
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_get_state_event()
            .withf(|room_id, event_type, state_key| {
                room_id.as_str() == "!abc:example.org"
                    && event_type == "m.room.encryption"
                    && state_key.is_empty()
            })
            .times(1)
            .returning(|_, _, _| Ok(Some(json!({"algorithm": "m.megolm.v1.aes-sha2"}))));

        let cache = cache(homeserver, LookupPolicy::FailClosed);

        assert!(cache.is_encrypted(room_id!("!abc:example.org")).await.unwrap());
        // answered from the cache, the mock allows a single request
        assert!(cache.is_encrypted(room_id!("!abc:example.org")).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_encrypted_without_encryption_state() {
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_get_state_event()
            .times(1)
            .returning(|_, _, _| Ok(None));

        let cache = cache(homeserver, LookupPolicy::FailClosed);

        assert!(!cache.is_encrypted(room_id!("!abc:example.org")).await.unwrap());
        assert!(!cache.is_encrypted(room_id!("!abc:example.org")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unencrypted_answer_is_refreshed_after_ttl() {
        let mut homeserver = MockHomeserver::new();
        let mut calls = 0;
        homeserver
            .expect_get_state_event()
            .times(2)
            .returning(move |_, _, _| {
                calls += 1;
                if calls == 1 {
                    Ok(None)
                } else {
                    Ok(Some(json!({"algorithm": "m.megolm.v1.aes-sha2"})))
                }
            });

        let cache = RoomStateCache::new(Arc::new(homeserver), LookupPolicy::FailClosed, Duration::ZERO);

        assert!(!cache.is_encrypted(room_id!("!abc:example.org")).await.unwrap());
        assert!(cache.is_encrypted(room_id!("!abc:example.org")).await.unwrap());
    }

    #[tokio::test]
    async fn test_encrypted_flag_is_monotonic() {
        let mut homeserver = MockHomeserver::new();
        // would answer "not encrypted" if it were ever asked
        homeserver
            .expect_get_state_event()
            .times(0)
            .returning(|_, _, _| Ok(None));

        let cache = RoomStateCache::new(Arc::new(homeserver), LookupPolicy::FailOpen, Duration::ZERO);
        let room_id = room_id!("!abc:example.org");

        cache.mark_encrypted(room_id).await;
        for _ in 0..5 {
            assert!(cache.is_encrypted(room_id).await.unwrap());
        }
        // a later unencrypted answer cannot downgrade the room
        assert!(cache.store(room_id, false).await);
        assert!(cache.is_encrypted(room_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_error_fail_open() {
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_get_state_event()
            .times(2)
            .returning(|_, _, _| Err(forbidden()));

        let cache = cache(homeserver, LookupPolicy::FailOpen);

        assert!(!cache.is_encrypted(room_id!("!abc:example.org")).await.unwrap());
        // errors are not cached
        assert!(!cache.is_encrypted(room_id!("!abc:example.org")).await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_error_fail_closed() {
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_get_state_event()
            .times(1)
            .returning(|_, _, _| Err(forbidden()));

        let cache = cache(homeserver, LookupPolicy::FailClosed);

        let result = cache.is_encrypted(room_id!("!abc:example.org")).await;
        assert!(matches!(result, Err(StateError::Lookup { .. })));
    }

    #[tokio::test]
    async fn test_resolve_members() {
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_joined_members()
            .times(1)
            .returning(|_| {
                Ok(MemberSet::from([
                    (user_id!("@a:example.org").to_owned(), Some("Alice".to_owned())),
                    (user_id!("@b:example.org").to_owned(), None),
                ]))
            });

        let cache = cache(homeserver, LookupPolicy::FailClosed);
        let members = cache.resolve_members(room_id!("!abc:example.org")).await;

        assert_eq!(members.len(), 2);
        assert_eq!(
            members[user_id!("@a:example.org")].as_deref(),
            Some("Alice")
        );
    }

    #[tokio::test]
    async fn test_resolve_members_error_yields_empty_set() {
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_joined_members()
            .times(2)
            .returning(|_| Err(forbidden()));

        let cache = cache(homeserver, LookupPolicy::FailClosed);

        assert!(cache.resolve_members(room_id!("!abc:example.org")).await.is_empty());
        assert!(cache.try_resolve_members(room_id!("!abc:example.org")).await.is_err());
    }

    #[tokio::test]
    async fn test_find_encrypted_rooms_shared_with() {
        let mut homeserver = MockHomeserver::new();
        homeserver.expect_joined_rooms().times(1).returning(|| {
            Ok(vec![
                owned_room_id!("!encrypted:example.org"),
                owned_room_id!("!plain:example.org"),
                owned_room_id!("!left:example.org"),
                owned_room_id!("!broken:example.org"),
            ])
        });
        homeserver
            .expect_get_state_event()
            .withf(|_, event_type, _| event_type == "m.room.encryption")
            .returning(|room_id, _, _| match room_id.as_str() {
                "!plain:example.org" => Ok(None),
                "!broken:example.org" => Err(forbidden()),
                _ => Ok(Some(json!({"algorithm": "m.megolm.v1.aes-sha2"}))),
            });
        homeserver
            .expect_get_state_event()
            .withf(|_, event_type, state_key| {
                event_type == "m.room.member" && state_key == "@b:example.org"
            })
            .returning(|room_id, _, _| match room_id.as_str() {
                "!left:example.org" => Ok(Some(json!({"membership": "leave"}))),
                _ => Ok(Some(json!({"membership": "join"}))),
            });

        let cache = cache(homeserver, LookupPolicy::FailClosed);
        let shared = cache
            .find_encrypted_rooms_shared_with(user_id!("@b:example.org"))
            .await;

        assert_eq!(
            shared,
            BTreeSet::from([owned_room_id!("!encrypted:example.org")])
        );
    }

    #[tokio::test]
    async fn test_find_encrypted_rooms_without_joined_rooms() {
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_joined_rooms()
            .times(1)
            .returning(|| Err(forbidden()));

        let cache = cache(homeserver, LookupPolicy::FailClosed);

        assert!(
            cache
                .find_encrypted_rooms_shared_with(user_id!("@b:example.org"))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_membership_change_marks() {
        let cache = cache(MockHomeserver::new(), LookupPolicy::FailClosed);
        let room_id = room_id!("!abc:example.org");

        assert!(!cache.take_membership_changed(room_id).await);

        cache.mark_membership_changed(room_id).await;
        cache.mark_membership_changed(room_id).await;

        assert!(cache.take_membership_changed(room_id).await);
        assert!(!cache.take_membership_changed(room_id).await);
    }
}
