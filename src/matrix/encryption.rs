//! End-to-end encryption backend.
//!
//! This module provides [`OlmCrypto`], the [`GroupCrypto`] implementation
//! backed by the Matrix SDK crypto machine.
//!
//! # Overview
//!
//! The device identity keys, the Olm sessions with other devices and the
//! Megolm room keys live in a sqlite store in the `crypto` directory of the
//! data directory, so a device keeps its keys from one command to the next.
//! The machine produces the requests that publish and distribute those keys:
//! - **Key upload**: the device keys and one-time keys, once after login
//! - **Key query**: the device lists of the room members
//! - **Key claim**: one-time keys of the devices without an Olm session
//! - **To-device**: the room key, encrypted for every member device
//!
//! They are sent through an SDK [`Client`] restored from the persisted login.
//! That client is only a transport, it never syncs and keeps no state on disk.

use std::fmt::Display;

use anyhow::bail;
use log::{debug, info, warn};
use matrix_sdk::{
    Client, SqliteCryptoStore,
    config::RequestConfig,
    ruma::{
        OwnedUserId, RoomId, UserId,
        api::client::{keys::get_keys, to_device::send_event_to_device},
        events::AnyMessageLikeEventContent,
        serde::Raw,
    },
};
use matrix_sdk_crypto::{
    EncryptionSettings, OlmMachine,
    store::CryptoStore,
    types::requests::{AnyOutgoingRequest, OutgoingRequest, ToDeviceRequest},
};
use serde_json::Value;

use crate::matrix::{
    crypto::{CryptoError, EncryptOutcome, GroupCrypto},
    session::MatrixSession,
};

/// Restores an SDK client from the persisted login, without any request.
///
/// # Errors
///
/// Returns an error if no session is stored or the homeserver url is invalid.
pub async fn restore_client(session: &MatrixSession) -> anyhow::Result<Client> {
    let (Some(user_session), Some(homeserver)) =
        (session.get_user_session(), session.get_homeserver())
    else {
        bail!("not logged in, run the login command first");
    };

    let client = Client::builder()
        .homeserver_url(homeserver)
        .request_config(RequestConfig::short_retry())
        .build()
        .await?;
    client.restore_session(user_session.clone()).await?;
    debug!("sdk client restored for {}", user_session.meta.user_id);

    Ok(client)
}

/// Group encryption with an Olm machine persisted in sqlite.
///
/// # Examples
///
/// ```no_run
/// let client = restore_client(&session).await?;
/// let crypto = OlmCrypto::open(client, session.crypto_store_path()).await?;
/// crypto.share_session(room_id, &members).await?;
/// ```
pub struct OlmCrypto {
    client: Client,
    machine: OlmMachine,
}

impl OlmCrypto {
    /// Opens the crypto store of the client's device.
    ///
    /// A new device identity is created when the store is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or belongs to another
    /// device.
    pub async fn open(client: Client, store_path: &str) -> anyhow::Result<Self> {
        let Some(meta) = client.session_meta() else {
            bail!("the client has no session");
        };
        let (user_id, device_id) = (meta.user_id.clone(), meta.device_id.clone());

        let store = SqliteCryptoStore::open(store_path, None).await?;
        let machine = OlmMachine::with_store(&user_id, &device_id, store, None).await?;
        debug!(
            "crypto store {} opened for {} {}",
            store_path, user_id, device_id
        );

        Ok(OlmCrypto { client, machine })
    }

    /// Public curve25519 identity key of the device.
    pub fn identity_key(&self) -> String {
        self.machine.identity_keys().curve25519.to_base64()
    }

    /// Sends every request the machine has queued.
    ///
    /// All requests are attempted, the first failure is returned.
    pub async fn send_outgoing_requests(&self) -> Result<(), CryptoError> {
        let requests = self.machine.outgoing_requests().await.map_err(store_error)?;
        debug!("{} outgoing encryption requests", requests.len());

        let mut result = Ok(());
        for request in &requests {
            if let Err(e) = self.send_outgoing_request(request).await {
                warn!("encryption request {} failed: {}", request.request_id(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }

    async fn send_outgoing_request(&self, request: &OutgoingRequest) -> Result<(), CryptoError> {
        let request_id = request.request_id();

        match request.request() {
            AnyOutgoingRequest::KeysUpload(upload) => {
                debug!("upload the keys of the device");
                let response = self.client.send(upload.clone()).await.map_err(request_error)?;
                self.machine
                    .mark_request_as_sent(request_id, &response)
                    .await
                    .map_err(store_error)?;
            }
            AnyOutgoingRequest::KeysQuery(query) => {
                debug!("query the devices of {} users", query.device_keys.len());
                let mut keys = get_keys::v3::Request::new();
                keys.device_keys = query.device_keys.clone();

                let response = self.client.send(keys).await.map_err(request_error)?;
                self.machine
                    .mark_request_as_sent(request_id, &response)
                    .await
                    .map_err(store_error)?;
            }
            AnyOutgoingRequest::KeysClaim(claim) => {
                let response = self.client.send(claim.clone()).await.map_err(request_error)?;
                self.machine
                    .mark_request_as_sent(request_id, &response)
                    .await
                    .map_err(store_error)?;
            }
            AnyOutgoingRequest::ToDeviceRequest(to_device) => {
                self.send_to_device(to_device).await?;
            }
            AnyOutgoingRequest::SignatureUpload(signatures) => {
                let response = self
                    .client
                    .send(signatures.clone())
                    .await
                    .map_err(request_error)?;
                self.machine
                    .mark_request_as_sent(request_id, &response)
                    .await
                    .map_err(store_error)?;
            }
            AnyOutgoingRequest::RoomMessage(_) => {
                debug!("skip in-room verification request {}", request_id);
            }
        }

        Ok(())
    }

    async fn send_to_device(&self, to_device: &ToDeviceRequest) -> Result<(), CryptoError> {
        let request = send_event_to_device::v3::Request::new_raw(
            to_device.event_type.clone(),
            to_device.txn_id.clone(),
            to_device.messages.clone(),
        );

        let response = self.client.send(request).await.map_err(request_error)?;
        self.machine
            .mark_request_as_sent(&to_device.txn_id, &response)
            .await
            .map_err(store_error)
    }

    /// Claims one-time keys for the devices of `members` without an Olm session.
    async fn claim_missing_sessions(&self, members: &[OwnedUserId]) -> Result<(), CryptoError> {
        let Some((request_id, request)) = self
            .machine
            .get_missing_sessions(user_ids(members))
            .await
            .map_err(store_error)?
        else {
            return Ok(());
        };

        debug!("claim one-time keys of {} users", request.one_time_keys.len());
        let response = self.client.send(request).await.map_err(request_error)?;
        self.machine
            .mark_request_as_sent(&request_id, &response)
            .await
            .map_err(store_error)
    }

    async fn share(&self, room_id: &RoomId, members: &[OwnedUserId]) -> Result<(), CryptoError> {
        self.machine
            .update_tracked_users(user_ids(members))
            .await
            .map_err(store_error)?;
        // without a sync the device lists are only refreshed here
        self.machine
            .mark_all_tracked_users_as_dirty()
            .await
            .map_err(store_error)?;
        self.send_outgoing_requests().await?;
        self.claim_missing_sessions(members).await?;

        let requests = self
            .machine
            .share_room_key(room_id, user_ids(members), EncryptionSettings::default())
            .await
            .map_err(store_error)?;
        debug!("{} room key requests for {}", requests.len(), room_id);

        for request in requests {
            self.send_to_device(&request).await?;
        }

        Ok(())
    }
}

impl GroupCrypto for OlmCrypto {
    async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> Result<EncryptOutcome, CryptoError> {
        let session = self
            .machine
            .store()
            .get_outbound_group_session(room_id)
            .await
            .map_err(store_error)?;

        let Some(session) = session else {
            return Ok(EncryptOutcome::NoSession);
        };
        if session.expired() || session.invalidated() {
            return Ok(EncryptOutcome::Expired);
        }
        if !session.shared() {
            return Ok(EncryptOutcome::NotShared);
        }

        let raw_content = serde_json::value::to_raw_value(content).map_err(encrypt_error)?;
        let raw_content = Raw::<AnyMessageLikeEventContent>::from_json(raw_content);
        let encrypted = self
            .machine
            .encrypt_room_event_raw(room_id, event_type, &raw_content)
            .await
            .map_err(encrypt_error)?;

        let ciphertext = serde_json::to_value(&encrypted).map_err(encrypt_error)?;
        Ok(EncryptOutcome::Valid(ciphertext))
    }

    async fn share_session(
        &self,
        room_id: &RoomId,
        members: &[OwnedUserId],
    ) -> Result<(), CryptoError> {
        if let Err(e) = self.share(room_id, members).await {
            // the session of a failed share is never used for encryption
            if let Err(discard) = self.machine.discard_room_key(room_id).await {
                warn!("failed to discard the room key of {}: {}", room_id, discard);
            }
            return Err(CryptoError::Share {
                room_id: room_id.to_string(),
                message: e.to_string(),
            });
        }

        info!("group session of {} shared with {} users", room_id, members.len());
        Ok(())
    }
}

fn user_ids(members: &[OwnedUserId]) -> impl Iterator<Item = &UserId> {
    members.iter().map(|user_id| &**user_id)
}

fn store_error(e: impl Display) -> CryptoError {
    CryptoError::Store(e.to_string())
}

fn request_error(e: impl Display) -> CryptoError {
    CryptoError::Request(e.to_string())
}

fn encrypt_error(e: impl Display) -> CryptoError {
    CryptoError::Encrypt(e.to_string())
}
