//! Deserialized responses of the Matrix client-server API.
//!
//! Only the fields the client actually reads are modelled; everything else the
//! homeserver sends is ignored by serde. Timeline events are kept as raw JSON
//! values so a single malformed event never fails the whole sync response.

use std::collections::BTreeMap;

use matrix_sdk::ruma::{OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Joined members of one room, mapped to their optional display name.
pub type MemberSet = BTreeMap<OwnedUserId, Option<String>>;

/// Response of `GET /sync`.
///
/// ```json
/// {
///   "next_batch": "s72595_4483_1934",
///   "rooms": {
///     "join": {
///       "!abc:example.org": {
///         "timeline": { "events": [ ... ] },
///         "state": { "events": [ ... ] }
///       }
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SyncResponse {
    /// Cursor to hand back on the next poll
    pub next_batch: String,
    /// Rooms with updates since the previous cursor
    #[serde(default)]
    pub rooms: Rooms,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Rooms {
    /// Rooms the user is joined to
    #[serde(default)]
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JoinedRoom {
    /// Timeline slice, in server order
    #[serde(default)]
    pub timeline: EventList,
    /// State changes between the previous cursor and the start of the timeline
    #[serde(default)]
    pub state: EventList,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<Value>,
}

/// Response of `POST /user/{userId}/filter`.
#[derive(Debug, Deserialize)]
pub struct FilterResponse {
    pub filter_id: String,
}

/// Response of `GET /rooms/{roomId}/joined_members`.
#[derive(Debug, Deserialize)]
pub struct JoinedMembersResponse {
    #[serde(default)]
    pub joined: BTreeMap<OwnedUserId, JoinedMember>,
}

#[derive(Debug, Deserialize)]
pub struct JoinedMember {
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Response of `GET /joined_rooms`.
#[derive(Debug, Deserialize)]
pub struct JoinedRoomsResponse {
    #[serde(default)]
    pub joined_rooms: Vec<OwnedRoomId>,
}

/// Response of `GET /rooms/{roomId}/messages`.
///
/// Events are kept raw, like the sync timeline. The pagination tokens are not
/// used.
#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub chunk: Vec<Value>,
}

/// Response of `PUT /rooms/{roomId}/send/{eventType}/{txnId}`.
#[derive(Debug, Deserialize)]
pub struct SendResponse {
    pub event_id: OwnedEventId,
}

/// Response of `GET /account/whoami`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    pub user_id: OwnedUserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,
    #[serde(default)]
    pub is_guest: bool,
}

/// Response of `GET /profile/{userId}/displayname`.
#[derive(Debug, Deserialize)]
pub struct DisplayNameResponse {
    #[serde(default)]
    pub displayname: Option<String>,
}

/// Standard Matrix error body.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub errcode: String,
    #[serde(default)]
    pub error: String,
}
