//! Password login.
//!
//! Login is the one operation delegated to the Matrix SDK: it discovers the
//! homeserver from the server name of the user id (or uses the url given on
//! the command line), logs in with a password, and hands back the resulting
//! session. The new device gets a fresh encryption store and its identity
//! keys are uploaded right away. Every later request goes through
//! [`HomeserverRequester`](crate::matrix::requester::HomeserverRequester) with
//! the persisted access token.

use log::{debug, error, info, warn};
use matrix_sdk::{Client, authentication::matrix, config::RequestConfig};

use crate::matrix::{UserCredentials, encryption::OlmCrypto, session::MatrixSession};

/// Builds an SDK client for the homeserver of `user_credentials`.
async fn build_client(user_credentials: &UserCredentials) -> Result<Client, anyhow::Error> {
    let builder = Client::builder().request_config(RequestConfig::short_retry());
    let builder = match &user_credentials.homeserver {
        Some(homeserver) => builder.homeserver_url(homeserver),
        None => builder.server_name(user_credentials.user_id.server_name()),
    };

    let client = builder.build().await?;
    debug!("matrix client created for {}", client.homeserver());
    Ok(client)
}

/// Logs in with a password and persists the new session.
///
/// The sync cursor of a previous session is dropped: a new device starts
/// syncing from the beginning of history.
///
/// # Arguments
///
/// * `user_credentials` - The user id, password and device display name
/// * `matrix_session` - The session store receiving the new login
///
/// # Returns
///
/// The persisted SDK session, holding the device id and access token.
///
/// # Errors
///
/// Returns an error if:
/// - The homeserver cannot be discovered
/// - The login is rejected
/// - The session or the encryption store cannot be written
pub async fn login(
    user_credentials: &UserCredentials,
    matrix_session: &MatrixSession,
) -> Result<matrix::MatrixSession, anyhow::Error> {
    let client = build_client(user_credentials).await?;

    client
        .matrix_auth()
        .login_username(&user_credentials.user_id, &user_credentials.password)
        .initial_device_display_name(&user_credentials.device_name)
        .send()
        .await?;

    let Some(user_session) = client.matrix_auth().session() else {
        return Err(anyhow::anyhow!("homeserver returned no session after login"));
    };

    let homeserver = client.homeserver();
    if let Err(err) = matrix_session
        .persist_user_session(&user_session, homeserver.as_str())
        .await
    {
        error!("error persisting user session: {:?}", err);
        return Err(anyhow::anyhow!("error persisting user session: {:?}", err));
    }

    info!(
        "logged in as {} with device {}",
        user_session.meta.user_id, user_session.meta.device_id
    );

    // the keys of a previous device cannot be used by the new one
    matrix_session.delete_crypto_store().await?;
    let crypto = OlmCrypto::open(client, matrix_session.crypto_store_path()).await?;
    match crypto.send_outgoing_requests().await {
        Ok(()) => info!("device keys uploaded, identity key {}", crypto.identity_key()),
        Err(e) => warn!("failed to upload the device keys, retried on the next share: {}", e),
    }

    Ok(user_session)
}
