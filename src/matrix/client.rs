//! Client context.
//!
//! This module provides [`MatrixClient`], the one object a command builds after
//! loading the configuration and the session. It wires the homeserver
//! requester, the encryption backend and the room state cache together and
//! exposes the two core operations: streaming sync events and sending
//! messages.

use std::sync::Arc;

use anyhow::bail;
use futures::Stream;
use log::{debug, info};
use matrix_sdk::ruma::{
    OwnedEventId, OwnedTransactionId, RoomId, events::room::message::RoomMessageEventContent,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    matrix::{
        crypto::GroupCrypto,
        dispatch::{DispatchError, Dispatcher},
        encryption::{OlmCrypto, restore_client},
        events::{MESSAGE, NormalizedEvent, decode, parse_event},
        requester::{Homeserver, HomeserverRequester, RequestError},
        session::MatrixSession,
        state_cache::RoomStateCache,
        sync::{MatrixSync, SyncError, SyncSettings},
    },
};

/// Body format of a sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Formatting {
    Plain,
    /// The body is rendered to HTML
    Markdown,
    /// HTML given by the caller, the body is the plain text fallback
    Html(String),
}

/// Matrix client of one logged in account.
///
/// # Examples
///
/// ```no_run
/// let session = MatrixSession::new("./data").await?;
/// let client = MatrixClient::restore(&session, &Config::load(None)?).await?;
///
/// let mut events = pin!(client.start_sync(SyncSettings::default(), CancellationToken::new()));
/// while let Some(event) = events.try_next().await? {
///     println!("{:?}", event);
/// }
/// ```
pub struct MatrixClient<H: Homeserver = HomeserverRequester, C: GroupCrypto = OlmCrypto> {
    homeserver: Arc<H>,
    cache: Arc<RoomStateCache<H>>,
    dispatcher: Dispatcher<H, C>,
    /// Session store receiving the sync cursor
    session: Option<MatrixSession>,
}

impl MatrixClient {
    /// Builds the client of the session persisted by a previous login and
    /// opens the encryption store of its device.
    ///
    /// # Errors
    ///
    /// Returns an error if no session is stored, the stored homeserver url is
    /// invalid or the encryption store cannot be opened.
    pub async fn restore(session: &MatrixSession, config: &Config) -> anyhow::Result<Self> {
        let (Some(user_session), Some(homeserver)) =
            (session.get_user_session(), session.get_homeserver())
        else {
            bail!("not logged in, run the login command first");
        };

        let requester = HomeserverRequester::new(
            homeserver,
            user_session.meta.user_id.clone(),
            &user_session.tokens.access_token,
        )?;
        info!(
            "restored session of {} on {}",
            user_session.meta.user_id, homeserver
        );

        let sdk_client = restore_client(session).await?;
        let crypto = OlmCrypto::open(sdk_client, session.crypto_store_path()).await?;

        Ok(MatrixClient::new(Arc::new(requester), Arc::new(crypto), config)
            .with_session(session.clone()))
    }
}

impl<H: Homeserver, C: GroupCrypto> MatrixClient<H, C> {
    /// Creates a client from its collaborators.
    ///
    /// # Arguments
    ///
    /// * `homeserver` - The homeserver requester
    /// * `crypto` - The group encryption backend
    /// * `config` - Provides the encryption lookup policy and cache lifetime
    pub fn new(homeserver: Arc<H>, crypto: Arc<C>, config: &Config) -> Self {
        let cache = Arc::new(RoomStateCache::new(
            homeserver.clone(),
            config.encryption.lookup_policy,
            config.encryption.cache_ttl(),
        ));
        let dispatcher = Dispatcher::new(homeserver.clone(), crypto, cache.clone());

        MatrixClient {
            homeserver,
            cache,
            dispatcher,
            session: None,
        }
    }

    /// Persists the sync cursor to `session`.
    pub fn with_session(mut self, session: MatrixSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn homeserver(&self) -> &H {
        &self.homeserver
    }

    pub fn cache(&self) -> &RoomStateCache<H> {
        &self.cache
    }

    /// Sync cursor saved by the last sync of this session.
    pub fn last_sync_token(&self) -> Option<String> {
        self.session.as_ref().and_then(MatrixSession::get_sync_token)
    }

    /// Starts a sync loop, see [`MatrixSync::into_stream`].
    ///
    /// Nothing is requested until the stream is polled.
    pub fn start_sync(
        &self,
        settings: SyncSettings,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<NormalizedEvent, SyncError>> + use<H, C> {
        debug!("sync settings {:?}", settings);

        let mut matrix_sync = MatrixSync::new(self.homeserver.clone(), self.cache.clone(), settings);
        if let Some(session) = &self.session {
            matrix_sync = matrix_sync.with_session(session.clone());
        }

        matrix_sync.into_stream(cancel)
    }

    /// Runs a single sync iteration and returns its events.
    pub async fn sync_once(&self, settings: SyncSettings) -> Result<Vec<NormalizedEvent>, SyncError> {
        let mut matrix_sync = MatrixSync::new(self.homeserver.clone(), self.cache.clone(), settings);
        if let Some(session) = &self.session {
            matrix_sync = matrix_sync.with_session(session.clone());
        }

        matrix_sync.sync_once().await
    }

    /// Fetches the last `limit` timeline events of `room_id`, oldest first.
    ///
    /// Malformed events are skipped, like in the sync loop.
    pub async fn messages(
        &self,
        room_id: &RoomId,
        limit: u32,
    ) -> Result<Vec<NormalizedEvent>, RequestError> {
        let chunk = self.homeserver.messages(room_id, limit).await?;
        debug!("{} events fetched from {}", chunk.len(), room_id);

        let events = chunk
            .into_iter()
            .rev()
            .filter_map(|raw| parse_event(room_id, raw))
            .map(|event| decode(room_id, &event))
            .collect();
        Ok(events)
    }

    /// Sends an event through the dispatch pipeline, see [`Dispatcher::send`].
    pub async fn send(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
        txn_id: Option<OwnedTransactionId>,
    ) -> Result<OwnedEventId, DispatchError> {
        self.dispatcher.send(room_id, event_type, content, txn_id).await
    }

    /// Sends an `m.room.message` text message.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The target room
    /// * `body` - The text of the message
    /// * `formatting` - How `body` is formatted
    pub async fn send_message(
        &self,
        room_id: &RoomId,
        body: &str,
        formatting: Formatting,
    ) -> Result<OwnedEventId, DispatchError> {
        let content = match formatting {
            Formatting::Plain => RoomMessageEventContent::text_plain(body),
            Formatting::Markdown => RoomMessageEventContent::text_markdown(body),
            Formatting::Html(html) => RoomMessageEventContent::text_html(body, html),
        };

        let content = serde_json::to_value(&content)?;
        self.send(room_id, MESSAGE, content, None).await
    }
}
