use std::{fs::exists, io::ErrorKind};

use tokio::{fs, io::AsyncWriteExt};

use log::{debug, trace, warn};
use matrix_sdk::authentication::matrix;
use serde::{Deserialize, Serialize};

use crate::utils::get_path;

/// Persisted login.
///
/// Contains the Matrix user session, the homeserver it was created against
/// and the last sync cursor. This is serialized to JSON and persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Session {
    /// The Matrix user session containing the access token and device.
    user_session: matrix::MatrixSession,

    /// Base url of the homeserver discovered at login.
    homeserver: String,

    /// The `next_batch` of the latest successful sync.
    ///
    /// Omitted from serialization when `None` to keep the file clean.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sync_token: Option<String>,
}

/// Matrix session store.
///
/// Keeps the login and the sync cursor in a JSON file named `session` inside
/// the data directory. The file holds an access token, so it is only readable
/// by its owner on unix.
///
/// # Examples
///
/// ```no_run
/// let matrix_session = MatrixSession::new("path/to/data/dir").await?;
/// if let Some(since) = matrix_session.get_sync_token() {
///     println!("resume sync from {since}");
/// }
/// ```
#[derive(Clone)]
pub struct MatrixSession {
    /// The user session if it exists.
    session: Option<Session>,
    /// Data directory
    dir_path: String,
    /// Path to the session file. Value is `dir_path/session`
    session_path: String,
    /// Path to the encryption store directory. Value is `dir_path/crypto`
    crypto_store_path: String,
}

impl MatrixSession {
    /// Create a new session store.
    ///
    /// Attempts to load an existing session from the session file if it exists.
    /// If no session file is found, creates a new instance without a session.
    ///
    /// # Arguments
    ///
    /// * `dir_path` - The directory holding the session file.
    pub async fn new(dir_path: &str) -> Result<MatrixSession, anyhow::Error> {
        debug!("read session at {}", dir_path);

        let session_path = get_path(dir_path, "session");
        debug!("session path {}", session_path);

        let session = match MatrixSession::get_session(&session_path).await {
            Ok(session) => session,
            Err(e) => {
                warn!("ignore unreadable session file {}: {:#}", session_path, e);
                None
            }
        };
        debug!(
            "found user session {:?}",
            session.as_ref().map(|s| &s.user_session.meta)
        );

        Ok(MatrixSession {
            session,
            dir_path: dir_path.to_owned(),
            session_path,
            crypto_store_path: get_path(dir_path, "crypto"),
        })
    }

    /// Load the session from disk, `None` when there is no session file.
    async fn get_session(session_path: &str) -> Result<Option<Session>, anyhow::Error> {
        if !exists(session_path).unwrap_or_default() {
            return Ok(None);
        }

        let session_data = fs::read_to_string(session_path).await?;
        let session: Session = serde_json::from_str(&session_data).map_err(anyhow::Error::new)?;
        Ok(Some(session))
    }

    /// Checks if a session was loaded from disk.
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Returns the user session if one is loaded.
    pub fn get_user_session(&self) -> Option<&matrix::MatrixSession> {
        self.session.as_ref().map(|s| &s.user_session)
    }

    /// Returns the homeserver url of the loaded session.
    pub fn get_homeserver(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.homeserver.as_str())
    }

    /// Directory of the sqlite store holding the device keys and the room keys.
    pub fn crypto_store_path(&self) -> &str {
        &self.crypto_store_path
    }

    /// Returns the sync token if one is stored.
    ///
    /// The sync token is used to resume synchronization from the last position.
    pub fn get_sync_token(&self) -> Option<String> {
        self.session.as_ref().and_then(|s| s.sync_token.clone())
    }

    /// Persists the sync token to disk.
    ///
    /// Updates the session file with the new sync token while preserving
    /// the user session data.
    ///
    /// # Errors
    ///
    /// Returns an error if the session file cannot be read, parsed, or written.
    pub async fn persist_sync_token(&self, sync_token: String) -> anyhow::Result<()> {
        trace!("persist sync token {}", sync_token);

        let serialized_session = fs::read_to_string(&self.session_path).await?;
        let mut full_session: Session = serde_json::from_str(&serialized_session)?;
        if full_session.sync_token.as_deref() == Some(sync_token.as_str()) {
            trace!("sync token unchanged");
            return Ok(());
        }

        full_session.sync_token = Some(sync_token);
        self.write(&full_session).await?;

        trace!("sync token persisted");
        Ok(())
    }

    /// Persists a fresh login to disk, creating the data directory when needed.
    ///
    /// Any previous sync token is dropped: a new device starts from the
    /// beginning of history.
    ///
    /// # Arguments
    ///
    /// * `user_session` - The Matrix user session to persist
    /// * `homeserver` - The homeserver url the session belongs to
    pub async fn persist_user_session(
        &self,
        user_session: &matrix::MatrixSession,
        homeserver: &str,
    ) -> anyhow::Result<()> {
        trace!("persist user session");

        fs::create_dir_all(&self.dir_path).await?;
        let session = Session {
            user_session: user_session.clone(),
            homeserver: homeserver.to_owned(),
            sync_token: None,
        };
        self.write(&session).await?;

        trace!("user session persisted");
        Ok(())
    }

    /// Removes the encryption store, the keys of the device it belonged to are lost.
    pub async fn delete_crypto_store(&self) -> anyhow::Result<()> {
        if !exists(&self.crypto_store_path).unwrap_or_default() {
            return Ok(());
        }

        fs::remove_dir_all(&self.crypto_store_path).await?;
        debug!("crypto store {} deleted", self.crypto_store_path);
        Ok(())
    }

    /// Removes the session file and the encryption store. Succeeds when there
    /// is nothing to remove.
    pub async fn delete(&self) -> anyhow::Result<()> {
        self.delete_crypto_store().await?;

        if !exists(&self.session_path).unwrap_or_default() {
            debug!("no session file to delete");
            return Ok(());
        }

        fs::remove_file(&self.session_path).await?;
        debug!("session file {} deleted", self.session_path);
        Ok(())
    }

    /// Replaces the session file.
    ///
    /// The content goes to a temporary file created with mode 0600 which is
    /// then renamed over `session`, so readers see either the old or the new
    /// file and the token is never readable by others.
    async fn write(&self, session: &Session) -> anyhow::Result<()> {
        let serialized_session = serde_json::to_string(session)?;
        let tmp_path = format!("{}.tmp", self.session_path);

        // leftover of an interrupted write, possibly with other permissions
        match fs::remove_file(&tmp_path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp_path).await?;
        file.write_all(serialized_session.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &self.session_path).await?;
        Ok(())
    }
}
