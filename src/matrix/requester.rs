//! HTTP client for the Matrix client-server API.
//!
//! This module provides the [`Homeserver`] trait, the request surface the sync
//! loop and the dispatch pipeline depend on, and [`HomeserverRequester`], its
//! implementation over `reqwest`. Every call is one request, there is no retry
//! at this level.

use std::time::Duration;

use log::{debug, info, trace};
use matrix_sdk::ruma::{
    EventId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, TransactionId, UserId,
};
use mockall::automock;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;

use crate::matrix::response_structs::{
    DisplayNameResponse, ErrorResponse, FilterResponse, JoinedMembersResponse,
    JoinedRoomsResponse, MemberSet, MessagesResponse, SendResponse, SyncResponse, WhoAmIResponse,
};

/// Extra time granted to the HTTP request on top of the long-poll budget.
const SYNC_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// Presence declared to the homeserver while syncing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    #[default]
    Offline,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Offline => "offline",
        }
    }
}

/// Parameters of one long-poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Long-poll budget in milliseconds
    pub timeout_ms: u64,
    /// Cursor returned by the previous poll, empty for the first one
    pub since: String,
    /// Server-side filter restricting the response
    pub filter_id: Option<String>,
    pub presence: Presence,
    /// Return every state event of the rooms, not only the changes since the cursor
    pub full_state: bool,
}

/// Errors returned by the homeserver requests.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request could not be sent or its body could not be read
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The homeserver answered with a non-success status
    #[error("homeserver answered {status} {errcode}: {message}")]
    Status {
        status: u16,
        errcode: String,
        message: String,
    },
    #[error("invalid homeserver url {0}")]
    InvalidUrl(String),
}

impl RequestError {
    /// Whether the homeserver reported that the requested resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RequestError::Status { status: 404, .. })
            || matches!(self, RequestError::Status { errcode, .. } if errcode == "M_NOT_FOUND")
    }
}

/// Requests to a Matrix homeserver.
///
/// This trait abstracts the HTTP operations for easier testing with mocks.
#[automock]
pub trait Homeserver {
    /// Long-polls the homeserver for new events.
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, RequestError>;
    /// Creates a filter restricting sync responses to a single room.
    async fn create_filter(&self, room_id: &RoomId) -> Result<String, RequestError>;
    /// Fetches the content of a state event, `None` when the room has no such state.
    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, RequestError>;
    /// Fetches the joined members of a room with their display names.
    async fn joined_members(&self, room_id: &RoomId) -> Result<MemberSet, RequestError>;
    /// Lists the rooms the logged in user is joined to.
    async fn joined_rooms(&self) -> Result<Vec<OwnedRoomId>, RequestError>;
    /// Sends a message-like event to a room.
    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
        txn_id: &TransactionId,
    ) -> Result<OwnedEventId, RequestError>;
    /// Marks `event_id` and everything before it as read.
    async fn send_receipt(&self, room_id: &RoomId, event_id: &EventId) -> Result<(), RequestError>;
    /// Fetches up to `limit` timeline events of a room, newest first.
    async fn messages(&self, room_id: &RoomId, limit: u32) -> Result<Vec<Value>, RequestError>;
    async fn whoami(&self) -> Result<WhoAmIResponse, RequestError>;
    async fn display_name(&self, user_id: &UserId) -> Result<Option<String>, RequestError>;
    /// Invalidates the access token.
    async fn logout(&self) -> Result<(), RequestError>;
}

/// `reqwest` implementation of [`Homeserver`].
///
/// # Examples
///
/// ```no_run
/// let requester = HomeserverRequester::new("https://matrix.example.org", user_id, "token")?;
/// let rooms = requester.joined_rooms().await?;
/// println!("Rooms: {:?}", rooms);
/// ```
pub struct HomeserverRequester {
    /// Base url of the homeserver, as discovered at login
    homeserver: Url,
    /// User the access token belongs to
    user_id: OwnedUserId,
    access_token: String,
    /// HTTP client
    client: Client,
}

impl HomeserverRequester {
    /// Create a new [HomeserverRequester].
    ///
    /// # Arguments
    ///
    /// * `homeserver` - Base url of the homeserver.
    /// * `user_id` - The user owning the access token.
    /// * `access_token` - The access token of the session.
    pub fn new(
        homeserver: &str,
        user_id: OwnedUserId,
        access_token: &str,
    ) -> Result<Self, RequestError> {
        let homeserver =
            Url::parse(homeserver).map_err(|_| RequestError::InvalidUrl(homeserver.to_owned()))?;

        Ok(HomeserverRequester {
            homeserver,
            user_id,
            access_token: access_token.to_owned(),
            client: Client::new(),
        })
    }

    /// Builds `{homeserver}/_matrix/client/v3/{segments...}`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RequestError> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| RequestError::InvalidUrl(self.homeserver.to_string()))?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        Ok(url)
    }

    /// Authenticates and sends the request, then deserializes a success body.
    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RequestError> {
        let response = request.bearer_auth(&self.access_token).send().await?;
        let status = response.status();

        if !status.is_success() {
            let error: ErrorResponse = response.json().await.unwrap_or_default();
            debug!("homeserver error {} {}", status, error.errcode);
            return Err(RequestError::Status {
                status: status.as_u16(),
                errcode: error.errcode,
                message: error.error,
            });
        }

        Ok(response.json().await?)
    }
}

impl Homeserver for HomeserverRequester {
    /// Request `GET /sync`.
    ///
    /// The `since` parameter is omitted for an empty cursor so the homeserver
    /// starts an initial sync.
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, RequestError> {
        let url = self.endpoint(&["sync"])?;

        let mut query = vec![
            ("timeout", request.timeout_ms.to_string()),
            ("set_presence", request.presence.as_str().to_owned()),
        ];
        if !request.since.is_empty() {
            query.push(("since", request.since.clone()));
        }
        if let Some(filter_id) = &request.filter_id {
            query.push(("filter", filter_id.clone()));
        }
        if request.full_state {
            query.push(("full_state", "true".to_owned()));
        }
        trace!("request {} {:?}", url, query);

        let budget = Duration::from_millis(request.timeout_ms) + SYNC_TIMEOUT_MARGIN;
        let response: SyncResponse = self
            .execute(self.client.get(url).query(&query).timeout(budget))
            .await?;

        debug!(
            "sync response next_batch={} rooms={}",
            response.next_batch,
            response.rooms.join.len()
        );
        Ok(response)
    }

    /// Request `POST /user/{userId}/filter` with a room filter:
    /// ```json
    /// { "room": { "rooms": ["!abc:example.org"] } }
    /// ```
    async fn create_filter(&self, room_id: &RoomId) -> Result<String, RequestError> {
        let url = self.endpoint(&["user", self.user_id.as_str(), "filter"])?;
        info!("create sync filter for room {}", room_id);

        let filter = json!({ "room": { "rooms": [room_id] } });
        let response: FilterResponse = self.execute(self.client.post(url).json(&filter)).await?;

        debug!("filter {} created", response.filter_id);
        Ok(response.filter_id)
    }

    /// Request `GET /rooms/{roomId}/state/{eventType}/{stateKey}`.
    ///
    /// A `404`/`M_NOT_FOUND` answer means the room has no such state and is
    /// returned as `Ok(None)`.
    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, RequestError> {
        let url = self.endpoint(&["rooms", room_id.as_str(), "state", event_type, state_key])?;
        debug!("request state {} of {}", event_type, room_id);

        match self.execute(self.client.get(url)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Request `GET /rooms/{roomId}/joined_members`.
    async fn joined_members(&self, room_id: &RoomId) -> Result<MemberSet, RequestError> {
        let url = self.endpoint(&["rooms", room_id.as_str(), "joined_members"])?;
        debug!("request joined members of {}", room_id);

        let response: JoinedMembersResponse = self.execute(self.client.get(url)).await?;

        Ok(response
            .joined
            .into_iter()
            .map(|(user_id, member)| (user_id, member.display_name))
            .collect())
    }

    async fn joined_rooms(&self) -> Result<Vec<OwnedRoomId>, RequestError> {
        let url = self.endpoint(&["joined_rooms"])?;
        let response: JoinedRoomsResponse = self.execute(self.client.get(url)).await?;
        Ok(response.joined_rooms)
    }

    /// Request `PUT /rooms/{roomId}/send/{eventType}/{txnId}`.
    ///
    /// The transaction id makes the request idempotent: the homeserver answers a
    /// replay of the same id with the event id of the first send.
    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
        txn_id: &TransactionId,
    ) -> Result<OwnedEventId, RequestError> {
        let url = self.endpoint(&["rooms", room_id.as_str(), "send", event_type, txn_id.as_str()])?;
        info!("send {} to {}", event_type, room_id);

        let response: SendResponse = self.execute(self.client.put(url).json(content)).await?;

        debug!("sent event {}", response.event_id);
        Ok(response.event_id)
    }

    /// Request `POST /rooms/{roomId}/receipt/m.read/{eventId}`.
    async fn send_receipt(&self, room_id: &RoomId, event_id: &EventId) -> Result<(), RequestError> {
        let url = self.endpoint(&["rooms", room_id.as_str(), "receipt", "m.read", event_id.as_str()])?;
        trace!("mark {} read in {}", event_id, room_id);

        let _: Value = self.execute(self.client.post(url).json(&json!({}))).await?;
        Ok(())
    }

    /// Request `GET /rooms/{roomId}/messages?dir=b&limit={limit}`.
    ///
    /// Without a `from` token the homeserver paginates back from the end of
    /// the timeline.
    async fn messages(&self, room_id: &RoomId, limit: u32) -> Result<Vec<Value>, RequestError> {
        let url = self.endpoint(&["rooms", room_id.as_str(), "messages"])?;
        debug!("request {} messages of {}", limit, room_id);

        let query = [("dir", "b".to_owned()), ("limit", limit.to_string())];
        let response: MessagesResponse = self.execute(self.client.get(url).query(&query)).await?;
        Ok(response.chunk)
    }

    async fn whoami(&self) -> Result<WhoAmIResponse, RequestError> {
        let url = self.endpoint(&["account", "whoami"])?;
        self.execute(self.client.get(url)).await
    }

    async fn display_name(&self, user_id: &UserId) -> Result<Option<String>, RequestError> {
        let url = self.endpoint(&["profile", user_id.as_str(), "displayname"])?;
        let response: DisplayNameResponse = self.execute(self.client.get(url)).await?;
        Ok(response.displayname)
    }

    async fn logout(&self) -> Result<(), RequestError> {
        let url = self.endpoint(&["logout"])?;
        info!("logout {}", self.user_id);

        let _: Value = self.execute(self.client.post(url).json(&json!({}))).await?;
        Ok(())
    }
}
