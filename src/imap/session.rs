// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::future::Future;
use std::time::Duration;

use async_imap::types::Fetch;
use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use log::{debug, warn};
use tokio::net::TcpStream as TokioTcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_util::compat::Compat;

use crate::imap::error::MailError;
use crate::imap::types::LatestMail;
use crate::utils::message::parse_message;

pub const INBOX: &str = "INBOX";

// Type aliases
pub type TlsCompatibleStream = Compat<TlsStream<TokioTcpStream>>;
pub type TlsImapSession = async_imap::Session<TlsCompatibleStream>;

/// The handful of IMAP commands the latest-message read needs.
///
/// Implemented for the real async-imap session and by fakes in tests.
#[async_trait]
pub trait MailboxSession: Send {
    async fn select_inbox(&mut self) -> Result<(), MailError>;

    /// Sequence numbers of every message in the selected mailbox (SEARCH ALL).
    async fn message_numbers(&mut self) -> Result<Vec<u32>, MailError>;

    /// Full RFC 822 source of the message with sequence number `seq`.
    async fn fetch_rfc822(&mut self, seq: u32) -> Result<Vec<u8>, MailError>;

    async fn close(&mut self) -> Result<(), MailError>;

    async fn logout(&mut self) -> Result<(), MailError>;
}

/// Owns one logged-in async-imap session.
pub struct AsyncImapSessionWrapper {
    session: TlsImapSession,
}

impl AsyncImapSessionWrapper {
    pub fn new(session: TlsImapSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl MailboxSession for AsyncImapSessionWrapper {
    async fn select_inbox(&mut self) -> Result<(), MailError> {
        let mailbox = self.session.select(INBOX).await?;
        debug!("Selected {} ({} messages)", INBOX, mailbox.exists);
        Ok(())
    }

    async fn message_numbers(&mut self) -> Result<Vec<u32>, MailError> {
        let found = self.session.search("ALL").await?;
        Ok(found.into_iter().collect())
    }

    async fn fetch_rfc822(&mut self, seq: u32) -> Result<Vec<u8>, MailError> {
        // Drain the whole response before the next command
        let fetches: Vec<Fetch> = self
            .session
            .fetch(seq.to_string(), "(RFC822)")
            .await?
            .try_collect()
            .await?;

        fetches
            .iter()
            .find_map(|fetch| fetch.body().map(|b| b.to_vec()))
            .ok_or_else(|| {
                MailError::Protocol(format!("no RFC822 data returned for message {}", seq))
            })
    }

    async fn close(&mut self) -> Result<(), MailError> {
        self.session.close().await.map_err(MailError::from)
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        self.session.logout().await.map_err(MailError::from)
    }
}

/// Read the newest message of the inbox.
///
/// "Newest" is the highest server-assigned sequence number, not the Date
/// header. `inbox_selected` is set as soon as SELECT succeeds so the caller
/// knows whether CLOSE is meaningful.
pub async fn read_latest<S: MailboxSession + ?Sized>(
    session: &mut S,
    inbox_selected: &mut bool,
) -> Result<LatestMail, MailError> {
    session.select_inbox().await?;
    *inbox_selected = true;

    let Some(latest) = session.message_numbers().await?.into_iter().max() else {
        debug!("Inbox is empty");
        return Ok(LatestMail::empty_inbox());
    };

    let raw = session.fetch_rfc822(latest).await?;
    debug!("Fetched message {} ({} bytes)", latest, raw.len());
    Ok(parse_message(&raw).into())
}

/// Run [`read_latest`] on a logged-in session, then always release it.
///
/// Every command is bounded by `op_timeout`. Release failures are logged and
/// never change the result.
pub async fn fetch_with_session<S: MailboxSession + ?Sized>(
    session: &mut S,
    op_timeout: Duration,
) -> Result<LatestMail, MailError> {
    let mut inbox_selected = false;
    let result =
        bounded(op_timeout, "mailbox read", read_latest(session, &mut inbox_selected)).await;

    if inbox_selected {
        if let Err(e) = bounded(op_timeout, "close", session.close()).await {
            warn!("Failed to close mailbox: {}", e);
        }
    }
    if let Err(e) = bounded(op_timeout, "logout", session.logout()).await {
        warn!("Failed to logout IMAP session: {}", e);
    }

    result
}

async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, MailError>
where
    F: Future<Output = Result<T, MailError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(MailError::timeout(what, limit)),
    }
}
