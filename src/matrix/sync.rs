//! Sync loop.
//!
//! This module provides the [`MatrixSync`] struct which long-polls the
//! homeserver with an opaque cursor and turns every timeline event it receives
//! into a [`NormalizedEvent`].
//!
//! # Overview
//!
//! One iteration is a single `GET /sync`:
//! 1. The optional room filter is created once, before the first poll
//! 2. The homeserver is polled with the cursor, the filter and the presence
//! 3. The cursor is replaced with `next_batch`, even when nothing happened
//! 4. Membership and encryption events update the [`RoomStateCache`]
//! 5. Timeline events are decoded room by room, in server order
//! 6. The cursor is persisted once the batch has been handed over
//!
//! [`MatrixSync::sync_once`] runs one iteration, [`MatrixSync::into_stream`]
//! runs them forever as a lazy stream that stops on the first error or when
//! its [`CancellationToken`] is cancelled.
//!
//! # Example
//!
//! ```no_run
//! let matrix_sync = MatrixSync::new(homeserver, cache, SyncSettings::default());
//! let mut events = pin!(matrix_sync.into_stream(cancel));
//! while let Some(event) = events.try_next().await? {
//!     println!("{}: {:?}", event.sender, event.body());
//! }
//! ```

use std::sync::Arc;

use futures::{Stream, TryStreamExt, stream};
use log::{debug, error, info};
use matrix_sdk::ruma::OwnedRoomId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::matrix::{
    events::{EventContent, NormalizedEvent, TimelineEvent, decode, parse_event},
    requester::{Homeserver, Presence, RequestError, SyncRequest},
    response_structs::SyncResponse,
    session::MatrixSession,
    state_cache::RoomStateCache,
};

/// Default long-poll budget in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to create the sync filter: {0}")]
    Filter(#[source] RequestError),
    #[error("sync request failed: {0}")]
    Poll(#[source] RequestError),
}

/// Parameters of a sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// How long the homeserver may hold each poll open
    pub timeout_ms: u64,
    /// Only receive the events of this room
    pub room_filter: Option<OwnedRoomId>,
    pub presence: Presence,
    /// Cursor to resume from, the start of history when `None`
    pub since: Option<String>,
    /// Ask for the complete room state on the first poll
    pub full_state: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            room_filter: None,
            presence: Presence::default(),
            since: None,
            full_state: false,
        }
    }
}

/// Long-polls a homeserver and decodes the timeline events it sends.
///
/// The struct is the single owner of the sync cursor.
pub struct MatrixSync<H: Homeserver> {
    homeserver: Arc<H>,
    cache: Arc<RoomStateCache<H>>,
    /// Where the cursor is persisted after each poll, if anywhere
    session: Option<MatrixSession>,
    settings: SyncSettings,
    cursor: String,
    filter_id: Option<String>,
    /// Whether the room filter has been materialized
    prepared: bool,
    /// Whether a poll has succeeded
    polled: bool,
    /// Whether `cursor` is newer than the persisted one
    unsaved: bool,
}

impl<H: Homeserver> MatrixSync<H> {
    /// Creates a new sync loop. No request is made until the first iteration.
    ///
    /// # Arguments
    ///
    /// * `homeserver` - The homeserver to poll
    /// * `cache` - The room state cache fed with membership and encryption events
    /// * `settings` - Timeout, room filter, presence and starting cursor
    pub fn new(homeserver: Arc<H>, cache: Arc<RoomStateCache<H>>, settings: SyncSettings) -> Self {
        let cursor = settings.since.clone().unwrap_or_default();

        MatrixSync {
            homeserver,
            cache,
            session: None,
            settings,
            cursor,
            filter_id: None,
            prepared: false,
            polled: false,
            unsaved: false,
        }
    }

    /// Persists the cursor to `session` once each batch is consumed.
    pub fn with_session(mut self, session: MatrixSession) -> Self {
        self.session = Some(session);
        self
    }

    /// The cursor the next poll will send.
    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    /// Creates the server-side room filter, once.
    async fn prepare(&mut self) -> Result<(), SyncError> {
        if self.prepared {
            return Ok(());
        }

        if let Some(room_id) = &self.settings.room_filter {
            let filter_id = self
                .homeserver
                .create_filter(room_id)
                .await
                .map_err(SyncError::Filter)?;
            info!("sync restricted to {} with filter {}", room_id, filter_id);
            self.filter_id = Some(filter_id);
        }

        self.prepared = true;
        Ok(())
    }

    /// Polls the homeserver once and returns the decoded timeline events.
    ///
    /// The new cursor is persisted once the batch is decoded.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter cannot be created or the poll fails. The
    /// cursor is left untouched in that case.
    pub async fn sync_once(&mut self) -> Result<Vec<NormalizedEvent>, SyncError> {
        let response = self.poll().await?;
        let events = self.receive(response).await;
        self.persist_cursor().await;
        Ok(events)
    }

    /// Creates the filter if needed and sends one long poll.
    ///
    /// Nothing is modified when the future is dropped before it completes.
    async fn poll(&mut self) -> Result<SyncResponse, SyncError> {
        self.prepare().await?;

        let request = SyncRequest {
            timeout_ms: self.settings.timeout_ms,
            since: self.cursor.clone(),
            filter_id: self.filter_id.clone(),
            presence: self.settings.presence,
            full_state: self.settings.full_state && !self.polled,
        };
        debug!("poll since '{}'", request.since);

        let response = self
            .homeserver
            .sync(&request)
            .await
            .map_err(SyncError::Poll)?;
        self.polled = true;
        Ok(response)
    }

    /// Moves the cursor past `response` and decodes it.
    async fn receive(&mut self, response: SyncResponse) -> Vec<NormalizedEvent> {
        self.cursor = response.next_batch.clone();
        self.unsaved = true;
        self.dispatch(response).await
    }

    /// Saves the cursor of the last received batch, if it was not saved yet.
    async fn persist_cursor(&mut self) {
        if !self.unsaved {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };

        match session.persist_sync_token(self.cursor.clone()).await {
            Ok(()) => self.unsaved = false,
            Err(err) => error!("failed to persist sync token: {:?}", err),
        }
    }

    /// Feeds the cache and decodes the timeline, room by room.
    async fn dispatch(&self, response: SyncResponse) -> Vec<NormalizedEvent> {
        let mut decoded = Vec::new();

        for (room_id, room) in response.rooms.join {
            for raw in room.state.events {
                if let Some(event) = parse_event(&room_id, raw) {
                    self.observe(&event).await;
                }
            }

            for raw in room.timeline.events {
                let Some(event) = parse_event(&room_id, raw) else {
                    continue;
                };
                self.observe(&event).await;
                decoded.push(decode(&room_id, &event));
            }
        }

        debug!("{} events decoded", decoded.len());
        decoded
    }

    async fn observe(&self, event: &TimelineEvent) {
        match &event.content {
            EventContent::Member(_) => self.cache.mark_membership_changed(&event.room_id).await,
            EventContent::Encryption(_) => self.cache.mark_encrypted(&event.room_id).await,
            _ => {}
        }
    }

    /// Turns the loop into a lazy stream of events.
    ///
    /// Polls happen only while the stream is consumed. The stream yields the
    /// first error and ends, and ends without error once `cancel` is cancelled,
    /// even in the middle of a long poll.
    ///
    /// The cursor of a batch is persisted when the next item is requested after
    /// its last event, so a batch that was not fully consumed is received again
    /// by the next resumed sync.
    pub fn into_stream(
        self,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<NormalizedEvent, SyncError>> {
        info!("start syncing");

        stream::try_unfold((self, cancel), |(mut sync, cancel)| async move {
            // every event of the previous batch has been yielded
            sync.persist_cursor().await;

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                response = sync.poll() => Some(response),
            };

            let Some(response) = response else {
                info!("sync cancelled");
                return Ok(None);
            };

            let events = sync.receive(response?).await;
            let events = stream::iter(events.into_iter().map(Ok::<_, SyncError>));
            Ok(Some((events, (sync, cancel))))
        })
        .try_flatten()
    }
}
