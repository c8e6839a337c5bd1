// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Failures of a single mailbox fetch.
///
/// These never escape [`crate::imap::client::ImapMailClient`]: they are folded
/// into an error [`crate::imap::types::FetchOutcome`] carrying the display text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailError {
    /// The server rejected the credentials.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// TCP, TLS or timeout failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered a command with NO/BAD or unparseable data.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl MailError {
    pub fn timeout(what: &str, after: std::time::Duration) -> Self {
        MailError::Network(format!("{} timed out after {:?}", what, after))
    }
}

impl From<async_imap::error::Error> for MailError {
    fn from(err: async_imap::error::Error) -> Self {
        match err {
            async_imap::error::Error::Io(e) => MailError::Network(e.to_string()),
            async_imap::error::Error::No(msg) => MailError::Protocol(msg),
            async_imap::error::Error::Bad(msg) => MailError::Protocol(msg),
            async_imap::error::Error::Parse(e) => MailError::Protocol(e.to_string()),
            other => MailError::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for MailError {
    fn from(err: std::io::Error) -> Self {
        MailError::Network(err.to_string())
    }
}
