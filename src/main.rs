//! mnotify - A command line Matrix client.
//!
//! mnotify streams the events of a Matrix account as JSON lines and sends
//! messages to rooms, encrypting them for the rooms that require end-to-end
//! encryption.
//!
//! # Overview
//!
//! ```bash
//! # Log in once, the session is kept in the data directory
//! MNOTIFY_PASSWORD=secret mnotify login @me:example.org
//!
//! # Stream the events of one room until interrupted
//! mnotify sync --room '!abc:example.org'
//!
//! # Print the last five messages of a room
//! mnotify messages --room '!abc:example.org' --limit 5
//!
//! # Send a message, from an argument or from stdin
//! mnotify send --room '!abc:example.org' "deploy done"
//! make 2>&1 | mnotify send --room '!abc:example.org'
//! ```
//!
//! # Configuration
//!
//! An optional YAML file given with `--config` and `MNOTIFY_` environment
//! variables tune the sync loop and the encryption checks, see [`config`].
//!
//! # Architecture
//!
//! - [`cli`] - One runner per command, printing JSON lines
//! - [`config`] - Layered configuration loading
//! - [`matrix`] - Sync loop, dispatch pipeline, room state cache and the homeserver client
//! - [`utils`] - Utility functions for path handling and output
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (default: `info`). Logs go to stderr.
//! - `MNOTIFY_PASSWORD` - Password used by `login`
//! - `MNOTIFY_DATA` - Data directory, same as `--data`

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{debug, error, info};
use matrix_sdk::ruma::{OwnedRoomId, OwnedUserId};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    matrix::{
        Formatting, MatrixClient, UserCredentials, requester::Presence, session::MatrixSession,
    },
};

mod cli;
mod config;
mod matrix;
mod utils;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    ///
    /// Every value has a default, the file is optional.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Path to the directory for storing persistent data.
    ///
    /// The directory holds the `session` file with the access token and the
    /// last sync cursor, and the `crypto` store with the device keys. Keep it
    /// private.
    #[arg(short, long, global = true, env = "MNOTIFY_DATA", default_value = "mnotify-data")]
    data: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in with a password and store the session
    Login {
        /// Fully qualified user id, like @me:example.org
        user_id: OwnedUserId,
        #[arg(short, long, env = "MNOTIFY_PASSWORD", hide_env_values = true)]
        password: String,
        /// Display name of the new device
        #[arg(long, default_value = "mnotify")]
        device_name: String,
        /// Homeserver url, discovered from the user id when absent
        #[arg(long)]
        homeserver: Option<String>,
    },
    /// Invalidate the access token and delete the stored session
    Logout,
    /// Print the logged in user and device
    Whoami,
    /// Print the display name of a user, the logged in user by default
    User { user_id: Option<OwnedUserId> },
    /// Stream timeline events as JSON lines
    Sync {
        /// Only receive the events of this room
        #[arg(short, long)]
        room: Option<OwnedRoomId>,
        #[arg(long, value_enum)]
        presence: Option<Presence>,
        /// Long-poll budget in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Poll once and exit
        #[arg(long)]
        once: bool,
        /// Start from the cursor saved by the previous sync
        #[arg(long)]
        resume: bool,
        /// Mark every printed event as read
        #[arg(long)]
        receipt: bool,
        /// Request the complete state of the rooms on the first poll
        #[arg(long)]
        full_state: bool,
    },
    /// Print the last events of a room, oldest first
    Messages {
        #[arg(short, long)]
        room: OwnedRoomId,
        /// Number of events to fetch
        #[arg(short, long, default_value_t = 10)]
        limit: u32,
    },
    /// Send a text message, read from stdin when not given
    Send {
        #[arg(short, long)]
        room: OwnedRoomId,
        /// Render the message as Markdown
        #[arg(long, conflicts_with = "html")]
        markdown: bool,
        /// HTML version of the message
        #[arg(long)]
        html: Option<String>,
        message: Option<String>,
    },
    /// Inspect joined rooms
    Rooms {
        #[command(subcommand)]
        command: RoomsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RoomsCommand {
    /// Print the joined rooms
    List,
    /// Print the joined members of a room
    Members { room_id: OwnedRoomId },
    /// Print the encrypted rooms shared with a user
    Shared { user_id: OwnedUserId },
}

/// Cancels `cancel` on Ctrl-C.
fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("interrupted, stopping");
        cancel.cancel();
    });
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let session = MatrixSession::new(&args.data).await?;
    let mut stdout = std::io::stdout().lock();

    match args.command {
        Command::Login {
            user_id,
            password,
            device_name,
            homeserver,
        } => {
            let credentials = UserCredentials {
                user_id,
                password,
                device_name,
                homeserver,
            };
            cli::login(&credentials, &session, &mut stdout).await
        }
        Command::Logout => {
            let client = MatrixClient::restore(&session, &config).await?;
            cli::logout(&client, &session).await
        }
        Command::Whoami => {
            let client = MatrixClient::restore(&session, &config).await?;
            cli::whoami(&client, &mut stdout).await
        }
        Command::User { user_id } => {
            let client = MatrixClient::restore(&session, &config).await?;
            cli::user(&client, user_id.as_deref(), &mut stdout).await
        }
        Command::Sync {
            room,
            presence,
            timeout,
            once,
            resume,
            receipt,
            full_state,
        } => {
            let client = MatrixClient::restore(&session, &config).await?;
            let since = if resume { client.last_sync_token() } else { None };
            let settings =
                cli::sync_settings(&config.sync, room, presence, timeout, since, full_state);

            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone());
            cli::sync(&client, settings, once, receipt, cancel, &mut stdout).await
        }
        Command::Messages { room, limit } => {
            let client = MatrixClient::restore(&session, &config).await?;
            cli::messages(&client, &room, limit, &mut stdout).await
        }
        Command::Send {
            room,
            markdown,
            html,
            message,
        } => {
            let formatting = match (markdown, html) {
                (_, Some(html)) => Formatting::Html(html),
                (true, None) => Formatting::Markdown,
                (false, None) => Formatting::Plain,
            };
            let client = MatrixClient::restore(&session, &config).await?;
            cli::send(&client, &room, message, formatting, &mut stdout).await
        }
        Command::Rooms { command } => {
            let client = MatrixClient::restore(&session, &config).await?;
            match command {
                RoomsCommand::List => cli::rooms_list(&client, &mut stdout).await,
                RoomsCommand::Members { room_id } => {
                    cli::room_members(&client, &room_id, &mut stdout).await
                }
                RoomsCommand::Shared { user_id } => {
                    cli::rooms_shared_with(&client, &user_id, &mut stdout).await
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Put logger at info level by default
    let env = Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    let args = Args::parse();
    debug!("mnotify {}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
