// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! mailwatch command line.
//!
//! Usage:
//!   mailwatch run                                   # Poll in the background until Ctrl-C
//!   mailwatch poll-once                             # One cycle, ignoring the enabled switch
//!   mailwatch check <ID>                            # Foreground check; clears the new-mail flag
//!   mailwatch set-polling --enabled true --interval 60
//!   mailwatch add-account <ADDRESS> <AUTH_TOKEN>
//!   mailwatch list-accounts

use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use mailwatch::config::Settings;
use mailwatch::imap::client::{ImapConfig, ImapMailClient};
use mailwatch::services::account_store::{
    AccountStore, PollSettings, SqliteAccountStore, POLLING_INTERVAL_KEY,
};
use mailwatch::services::check::check_now;
use mailwatch::services::dispatcher::Dispatcher;
use mailwatch::services::poller::Poller;

#[derive(Parser)]
#[command(name = "mailwatch", about = "Polls many IMAP mailboxes for their latest message")]
struct Cli {
    /// Optional configuration file (TOML)
    #[arg(long, short, env = "MAILWATCH_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the background poller until interrupted
    Run,
    /// Run a single poll cycle now and print its report
    PollOnce,
    /// Fetch the latest mail of one account and acknowledge it
    Check {
        id: i64,
    },
    /// Store the polling switch and interval
    SetPolling {
        #[arg(long, action = ArgAction::Set)]
        enabled: bool,
        /// Seconds between cycles (minimum 10)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Register a mailbox
    AddAccount {
        address: String,
        auth_token: String,
    },
    /// Print every account as JSON, new mail first
    ListAccounts,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let (settings, warnings) = Settings::load(cli.config.as_deref())?;

    // Initialize logger; RUST_LOG still wins when set
    let env = env_logger::Env::new().default_filter_or(settings.log.level.as_str());
    env_logger::init_from_env(env);
    for warning in &warnings {
        warn!("{}", warning);
    }

    let store = Arc::new(SqliteAccountStore::connect(&settings.database_url).await?);

    match cli.command {
        Command::Run => {
            let poller = build_poller(&settings, store.clone())?;
            let shutdown = CancellationToken::new();
            let handle = tokio::spawn(poller.run(shutdown.clone()));

            tokio::signal::ctrl_c().await?;
            info!("Interrupt received, stopping poller");
            shutdown.cancel();
            handle.await?;
        }
        Command::PollOnce => {
            let poller = build_poller(&settings, store.clone())?;
            let report = poller.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Check { id } => {
            let client = ImapMailClient::new(ImapConfig::from(&settings.imap))?;
            let outcome = check_now(store.as_ref(), &client, id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
        Command::SetPolling { enabled, interval } => {
            let interval = match interval {
                Some(secs) => secs,
                None => {
                    let stored = store.read_setting(POLLING_INTERVAL_KEY).await?;
                    let default_interval = settings.polling.default_interval_seconds;
                    PollSettings::from_raw(None, stored.as_deref(), default_interval).interval_secs
                }
            };
            let poll_settings = PollSettings::new(enabled, interval)?;
            store.save_poll_settings(&poll_settings).await?;
            println!("{}", serde_json::to_string_pretty(&poll_settings)?);
        }
        Command::AddAccount { address, auth_token } => {
            let id = store.insert_account(&address, &auth_token).await?;
            info!("Added account {} ({})", id, address);
            println!("{}", id);
        }
        Command::ListAccounts => {
            let accounts = store.all_accounts().await?;
            println!("{}", serde_json::to_string_pretty(&accounts)?);
        }
    }

    Ok(())
}

fn build_poller(
    settings: &Settings,
    store: Arc<SqliteAccountStore>,
) -> Result<Poller, Box<dyn std::error::Error>> {
    let client = ImapMailClient::new(ImapConfig::from(&settings.imap))?;
    let dispatcher = Dispatcher::new(Arc::new(client), settings.polling.worker_limit);
    Ok(Poller::new(store, dispatcher, settings.polling.clone()))
}
