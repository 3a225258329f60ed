//! Command runners.
//!
//! Each command of the binary maps to one function here. Results are written
//! to `out` as JSON, one object per line, so the output of `sync` can be piped
//! into line-oriented tools while it runs.

use std::{io::Write, pin::pin};

use anyhow::bail;
use futures::TryStreamExt;
use log::{info, warn};
use matrix_sdk::ruma::{DeviceId, EventId, OwnedRoomId, RoomId, UserId};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SyncConfig,
    matrix::{
        Formatting, MatrixClient, UserCredentials,
        crypto::GroupCrypto,
        events::NormalizedEvent,
        login,
        requester::{Homeserver, Presence},
        session::MatrixSession,
        sync::SyncSettings,
    },
    utils::to_json_line,
};

#[derive(Serialize)]
struct LoginOutput<'a> {
    user_id: &'a UserId,
    device_id: &'a DeviceId,
}

#[derive(Serialize)]
struct ProfileOutput<'a> {
    user_id: &'a UserId,
    displayname: Option<String>,
}

#[derive(Serialize)]
struct MemberOutput<'a> {
    user_id: &'a UserId,
    display_name: Option<&'a str>,
}

#[derive(Serialize)]
struct RoomOutput<'a> {
    room_id: &'a RoomId,
}

#[derive(Serialize)]
struct SentOutput<'a> {
    event_id: &'a EventId,
}

fn print_line<T: Serialize>(out: &mut impl Write, value: &T) -> anyhow::Result<()> {
    writeln!(out, "{}", to_json_line(value)?)?;
    out.flush()?;
    Ok(())
}

/// Logs in and prints the new device.
pub async fn login(
    credentials: &UserCredentials,
    session: &MatrixSession,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    if session.has_session() {
        warn!("replacing the session of {:?}", session.get_user_session().map(|s| &s.meta.user_id));
    }

    let user_session = login::login(credentials, session).await?;
    print_line(
        out,
        &LoginOutput {
            user_id: &user_session.meta.user_id,
            device_id: &user_session.meta.device_id,
        },
    )
}

/// Invalidates the access token and deletes the local session.
///
/// The local session is deleted even when the homeserver refuses the logout,
/// the token being unusable either way.
pub async fn logout<H: Homeserver, C: GroupCrypto>(
    client: &MatrixClient<H, C>,
    session: &MatrixSession,
) -> anyhow::Result<()> {
    if let Err(e) = client.homeserver().logout().await {
        warn!("homeserver logout failed: {}", e);
    }

    session.delete().await?;
    info!("logged out");
    Ok(())
}

pub async fn whoami<H: Homeserver, C: GroupCrypto>(
    client: &MatrixClient<H, C>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let whoami = client.homeserver().whoami().await?;
    print_line(out, &whoami)
}

/// Prints the display name of `user_id`, or of the logged in user.
pub async fn user<H: Homeserver, C: GroupCrypto>(
    client: &MatrixClient<H, C>,
    user_id: Option<&UserId>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let own_user_id;
    let user_id: &UserId = match user_id {
        Some(user_id) => user_id,
        None => {
            own_user_id = client.homeserver().whoami().await?.user_id;
            &own_user_id
        }
    };

    let displayname = client.homeserver().display_name(user_id).await?;
    print_line(out, &ProfileOutput { user_id, displayname })
}

/// Builds the sync settings from the configuration and the command-line flags.
pub fn sync_settings(
    config: &SyncConfig,
    room: Option<OwnedRoomId>,
    presence: Option<Presence>,
    timeout: Option<u64>,
    since: Option<String>,
    full_state: bool,
) -> SyncSettings {
    SyncSettings {
        timeout_ms: timeout.unwrap_or(config.timeout),
        room_filter: room,
        presence: presence.unwrap_or(config.presence),
        since,
        full_state,
    }
}

/// Prints sync events, one per line.
///
/// With `once`, runs a single poll. Otherwise runs until `cancel` is cancelled
/// or a poll fails. With `receipt`, every printed event is marked read.
pub async fn sync<H: Homeserver, C: GroupCrypto>(
    client: &MatrixClient<H, C>,
    settings: SyncSettings,
    once: bool,
    receipt: bool,
    cancel: CancellationToken,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    if once {
        for event in client.sync_once(settings).await? {
            print_event(client, &event, receipt, out).await?;
        }
        return Ok(());
    }

    let mut events = pin!(client.start_sync(settings, cancel));
    while let Some(event) = events.try_next().await? {
        print_event(client, &event, receipt, out).await?;
    }

    Ok(())
}

async fn print_event<H: Homeserver, C: GroupCrypto>(
    client: &MatrixClient<H, C>,
    event: &NormalizedEvent,
    receipt: bool,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    print_line(out, event)?;

    if receipt
        && let Err(e) = client
            .homeserver()
            .send_receipt(&event.room_id, &event.event_id)
            .await
    {
        warn!("failed to mark {} read: {}", event.event_id, e);
    }
    Ok(())
}

/// Prints the last `limit` events of `room_id`, oldest first.
pub async fn messages<H: Homeserver, C: GroupCrypto>(
    client: &MatrixClient<H, C>,
    room_id: &RoomId,
    limit: u32,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    for event in client.messages(room_id, limit).await? {
        print_line(out, &event)?;
    }
    Ok(())
}

/// Reads a whole message, kept verbatim.
pub async fn read_message(mut reader: impl AsyncRead + Unpin) -> anyhow::Result<String> {
    let mut message = String::new();
    reader.read_to_string(&mut message).await?;

    if message.is_empty() {
        bail!("refusing to send an empty message");
    }
    Ok(message)
}

/// Sends `message`, or the message read from stdin, and prints its event id.
pub async fn send<H: Homeserver, C: GroupCrypto>(
    client: &MatrixClient<H, C>,
    room_id: &RoomId,
    message: Option<String>,
    formatting: Formatting,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let body = match message {
        Some(message) => message,
        None => read_message(tokio::io::stdin()).await?,
    };

    let event_id = client.send_message(room_id, &body, formatting).await?;
    print_line(out, &SentOutput { event_id: &event_id })
}

/// Prints the joined members of `room_id`.
pub async fn room_members<H: Homeserver, C: GroupCrypto>(
    client: &MatrixClient<H, C>,
    room_id: &RoomId,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let members = client.cache().try_resolve_members(room_id).await?;

    for (user_id, display_name) in &members {
        print_line(
            out,
            &MemberOutput {
                user_id,
                display_name: display_name.as_deref(),
            },
        )?;
    }
    Ok(())
}

/// Prints the rooms the logged in user is joined to.
pub async fn rooms_list<H: Homeserver, C: GroupCrypto>(
    client: &MatrixClient<H, C>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    for room_id in client.homeserver().joined_rooms().await? {
        print_line(out, &RoomOutput { room_id: &room_id })?;
    }
    Ok(())
}

/// Prints the encrypted rooms shared with `user_id`.
pub async fn rooms_shared_with<H: Homeserver, C: GroupCrypto>(
    client: &MatrixClient<H, C>,
    user_id: &UserId,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    for room_id in client.cache().find_encrypted_rooms_shared_with(user_id).await {
        print_line(out, &RoomOutput { room_id: &room_id })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        matrix::{
            crypto::MockGroupCrypto, requester::MockHomeserver, response_structs::{MemberSet, WhoAmIResponse},
            requester::RequestError,
        },
    };
    use matrix_sdk::ruma::{owned_event_id, owned_user_id, room_id, user_id};
    use serde_json::json;
    use std::sync::Arc;

    fn client(homeserver: MockHomeserver) -> MatrixClient<MockHomeserver, MockGroupCrypto> {
        MatrixClient::new(
            Arc::new(homeserver),
            Arc::new(MockGroupCrypto::new()),
            &Config::default(),
        )
    }

    fn lines(out: Vec<u8>) -> Vec<String> {
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[tokio::test]
    async fn test_whoami() {
        let mut homeserver = MockHomeserver::new();
        homeserver.expect_whoami().times(1).returning(|| {
            Ok(WhoAmIResponse {
                user_id: owned_user_id!("@a:example.org"),
                device_id: Some("DEVICE".into()),
                is_guest: false,
            })
        });

        let mut out = Vec::new();
        whoami(&client(homeserver), &mut out).await.unwrap();

        assert_eq!(
            lines(out),
            [r#"{"user_id":"@a:example.org","device_id":"DEVICE","is_guest":false}"#]
        );
    }

    #[tokio::test]
    async fn test_user_defaults_to_own_user() {
        let mut homeserver = MockHomeserver::new();
        homeserver.expect_whoami().times(1).returning(|| {
            Ok(WhoAmIResponse {
                user_id: owned_user_id!("@a:example.org"),
                device_id: None,
                is_guest: false,
            })
        });
        homeserver
            .expect_display_name()
            .withf(|user_id| user_id.as_str() == "@a:example.org")
            .times(1)
            .returning(|_| Ok(Some("Alice".to_owned())));

        let mut out = Vec::new();
        user(&client(homeserver), None, &mut out).await.unwrap();

        assert_eq!(
            lines(out),
            [r#"{"user_id":"@a:example.org","displayname":"Alice"}"#]
        );
    }

    #[tokio::test]
    async fn test_user_with_explicit_id() {
        let mut homeserver = MockHomeserver::new();
        homeserver.expect_whoami().times(0);
        homeserver
            .expect_display_name()
            .times(1)
            .returning(|_| Ok(None));

        let mut out = Vec::new();
        user(&client(homeserver), Some(user_id!("@b:example.org")), &mut out)
            .await
            .unwrap();

        assert_eq!(lines(out), [r#"{"user_id":"@b:example.org","displayname":null}"#]);
    }

    #[test]
    fn test_sync_settings_flags_override_config() {
        let config = SyncConfig {
            timeout: 5000,
            presence: Presence::Online,
        };

        let settings = sync_settings(&config, None, None, None, None, false);
        assert_eq!(settings.timeout_ms, 5000);
        assert_eq!(settings.presence, Presence::Online);

        let settings = sync_settings(
            &config,
            Some(room_id!("!abc:example.org").to_owned()),
            Some(Presence::Offline),
            Some(100),
            Some("s3".to_owned()),
            true,
        );
        assert_eq!(settings.timeout_ms, 100);
        assert_eq!(settings.presence, Presence::Offline);
        assert_eq!(settings.room_filter.unwrap().as_str(), "!abc:example.org");
        assert_eq!(settings.since.as_deref(), Some("s3"));
        assert!(settings.full_state);
    }

    #[tokio::test]
    async fn test_sync_once_prints_json_lines() {
        let mut homeserver = MockHomeserver::new();
        homeserver.expect_sync().times(1).returning(|_| {
            Ok(serde_json::from_value(json!({
                "next_batch": "s1",
                "rooms": {"join": {"!abc:example.org": {"timeline": {"events": [{
                    "event_id": "$1",
                    "type": "m.room.message",
                    "sender": "@a:example.org",
                    "origin_server_ts": 1_700_000_000_000u64,
                    "content": {"msgtype": "m.text", "body": "hello"}
                }]}}}}
            }))
            .unwrap())
        });

        let mut out = Vec::new();
        sync(
            &client(homeserver),
            SyncSettings::default(),
            true,
            false,
            CancellationToken::new(),
            &mut out,
        )
        .await
        .unwrap();

        let lines = lines(out);
        assert_eq!(lines.len(), 1);
        let event: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(event["body"], "hello");
        assert_eq!(event["room_id"], "!abc:example.org");
        assert_eq!(event["timestamp"], "2023-11-14T22:13:20.000Z");
    }

    fn one_message_sync(homeserver: &mut MockHomeserver) {
        homeserver.expect_sync().times(1).returning(|_| {
            Ok(serde_json::from_value(json!({
                "next_batch": "s1",
                "rooms": {"join": {"!abc:example.org": {"timeline": {"events": [{
                    "event_id": "$1",
                    "type": "m.room.message",
                    "sender": "@a:example.org",
                    "origin_server_ts": 1_700_000_000_000u64,
                    "content": {"msgtype": "m.text", "body": "hello"}
                }]}}}}
            }))
            .unwrap())
        });
    }

    #[tokio::test]
    async fn test_sync_receipt_marks_printed_events_read() {
        let mut homeserver = MockHomeserver::new();
        one_message_sync(&mut homeserver);
        homeserver
            .expect_send_receipt()
            .withf(|room_id, event_id| {
                room_id.as_str() == "!abc:example.org" && event_id.as_str() == "$1"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut out = Vec::new();
        sync(
            &client(homeserver),
            SyncSettings::default(),
            true,
            true,
            CancellationToken::new(),
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(lines(out).len(), 1);
    }

    #[tokio::test]
    async fn test_sync_receipt_failure_is_not_fatal() {
        let mut homeserver = MockHomeserver::new();
        one_message_sync(&mut homeserver);
        homeserver.expect_send_receipt().times(1).returning(|_, _| {
            Err(RequestError::Status {
                status: 403,
                errcode: "M_FORBIDDEN".to_owned(),
                message: String::new(),
            })
        });

        let mut out = Vec::new();
        sync(
            &client(homeserver),
            SyncSettings::default(),
            true,
            true,
            CancellationToken::new(),
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(lines(out).len(), 1);
    }

    #[tokio::test]
    async fn test_sync_without_receipt_sends_none() {
        let mut homeserver = MockHomeserver::new();
        one_message_sync(&mut homeserver);
        homeserver.expect_send_receipt().times(0);

        let mut out = Vec::new();
        sync(
            &client(homeserver),
            SyncSettings::default(),
            true,
            false,
            CancellationToken::new(),
            &mut out,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_messages() {
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_messages()
            .withf(|_, limit| *limit == 10)
            .times(1)
            .returning(|_, _| {
                Ok(vec![json!({
                    "event_id": "$1",
                    "type": "m.room.message",
                    "sender": "@a:example.org",
                    "origin_server_ts": 1_700_000_000_000u64,
                    "content": {"msgtype": "m.text", "body": "hello"}
                })])
            });

        let mut out = Vec::new();
        messages(&client(homeserver), room_id!("!abc:example.org"), 10, &mut out)
            .await
            .unwrap();

        let lines = lines(out);
        assert_eq!(lines.len(), 1);
        let event: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(event["body"], "hello");
        assert_eq!(event["event_id"], "$1");
    }

    #[tokio::test]
    async fn test_rooms_list() {
        let mut homeserver = MockHomeserver::new();
        homeserver.expect_joined_rooms().times(1).returning(|| {
            Ok(vec![
                room_id!("!a:example.org").to_owned(),
                room_id!("!b:example.org").to_owned(),
            ])
        });

        let mut out = Vec::new();
        rooms_list(&client(homeserver), &mut out).await.unwrap();

        assert_eq!(
            lines(out),
            [
                r#"{"room_id":"!a:example.org"}"#,
                r#"{"room_id":"!b:example.org"}"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_sync_stream_ends_on_error() {
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_sync()
            .times(1)
            .returning(|_| Err(RequestError::InvalidUrl("gone".to_owned())));

        let mut out = Vec::new();
        let result = sync(
            &client(homeserver),
            SyncSettings::default(),
            false,
            false,
            CancellationToken::new(),
            &mut out,
        )
        .await;

        assert!(result.is_err());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_send_prints_event_id() {
        let mut homeserver = MockHomeserver::new();
        homeserver
            .expect_get_state_event()
            .returning(|_, _, _| Ok(None));
        homeserver
            .expect_send_event()
            .returning(|_, _, _, _| Ok(owned_event_id!("$sent:example.org")));

        let mut out = Vec::new();
        send(
            &client(homeserver),
            room_id!("!abc:example.org"),
            Some("hello".to_owned()),
            Formatting::Plain,
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(lines(out), [r#"{"event_id":"$sent:example.org"}"#]);
    }

    #[tokio::test]
    async fn test_read_message() {
        let message = read_message(&b"line one\nline two\n"[..]).await.unwrap();
        assert_eq!(message, "line one\nline two\n");

        assert!(read_message(&b""[..]).await.is_err());
    }

    #[tokio::test]
    async fn test_room_members() {
        let mut homeserver = MockHomeserver::new();
        homeserver.expect_joined_members().times(1).returning(|_| {
            Ok(MemberSet::from([
                (owned_user_id!("@a:example.org"), Some("Alice".to_owned())),
                (owned_user_id!("@b:example.org"), None),
            ]))
        });

        let mut out = Vec::new();
        room_members(&client(homeserver), room_id!("!abc:example.org"), &mut out)
            .await
            .unwrap();

        assert_eq!(
            lines(out),
            [
                r#"{"user_id":"@a:example.org","display_name":"Alice"}"#,
                r#"{"user_id":"@b:example.org","display_name":null}"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_logout_deletes_session_even_when_refused() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dir_path = temp_dir.path().to_string_lossy().to_string();
        let session_path = format!("{}/session", dir_path);
        std::fs::write(&session_path, "{}").unwrap();
        let session = MatrixSession::new(&dir_path).await.unwrap();

        let mut homeserver = MockHomeserver::new();
        homeserver.expect_logout().times(1).returning(|| {
            Err(RequestError::Status {
                status: 401,
                errcode: "M_UNKNOWN_TOKEN".to_owned(),
                message: "Invalid token".to_owned(),
            })
        });

        logout(&client(homeserver), &session).await.unwrap();

        assert!(!std::path::Path::new(&session_path).exists());
    }
}
