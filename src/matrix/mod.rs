//! Matrix protocol integration.
//!
//! This module provides the client core:
//! - Room encryption and membership state, see [`state_cache`]
//! - Decoding of timeline events, see [`events`]
//! - The long-polling sync loop, see [`sync`]
//! - The encrypted dispatch pipeline, see [`dispatch`]
//!
//! # Architecture
//!
//! The [`client::MatrixClient`] is built once per command from the persisted
//! session and the configuration. It owns the [`requester::HomeserverRequester`]
//! used for every client-server request, the [`encryption::OlmCrypto`] backend
//! and the [`state_cache::RoomStateCache`] shared by the sync loop and the
//! dispatcher. Only [`login`] and the key requests of [`encryption`] go through
//! the Matrix SDK.
//!
//! # Examples
//!
//! ```no_run
//! let session = MatrixSession::new("./data").await?;
//! let client = MatrixClient::restore(&session, &config).await?;
//! let event_id = client
//!     .send_message(room_id, "hello", Formatting::Plain)
//!     .await?;
//! ```

pub mod client;
pub mod crypto;
pub mod dispatch;
pub mod encryption;
pub mod events;
pub mod login;
pub mod requester;
pub mod response_structs;
pub mod session;
pub mod state_cache;
pub mod sync;

use matrix_sdk::ruma::OwnedUserId;

pub use crate::matrix::client::{Formatting, MatrixClient};

/// Credentials used for a password login
#[derive(Debug, Clone)]
pub struct UserCredentials {
    /// User ID of the matrix account
    pub user_id: OwnedUserId,
    /// Password of the matrix account
    pub password: String,
    /// Display name of the device created by the login
    pub device_name: String,
    /// Homeserver url, discovered from the user id server name when `None`
    pub homeserver: Option<String>,
}
