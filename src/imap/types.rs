// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

use crate::imap::error::MailError;
use crate::services::freshness::mail_identifier;

pub const EMPTY_INBOX_SUBJECT: &str = "无邮件";
pub const EMPTY_INBOX_CONTENT: &str = "收件箱是空的";

/// The most recent message of a mailbox, reduced to what the poller and the
/// web layer display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestMail {
    pub sender: Option<String>,
    pub subject: String,
    pub content: String,
    /// Fingerprint used for change detection. `None` for the empty-inbox
    /// sentinel so an empty mailbox never signals new mail.
    pub identifier: Option<String>,
}

impl LatestMail {
    pub fn new(sender: String, subject: String, content: String) -> Self {
        let identifier = Some(mail_identifier(&subject, &sender));
        Self {
            sender: Some(sender),
            subject,
            content,
            identifier,
        }
    }

    pub fn empty_inbox() -> Self {
        Self {
            sender: None,
            subject: EMPTY_INBOX_SUBJECT.to_string(),
            content: EMPTY_INBOX_CONTENT.to_string(),
            identifier: None,
        }
    }
}

/// Result of one `fetch_latest` call. Fetching never fails past this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FetchOutcome {
    Success(LatestMail),
    Error { message: String },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }
}

impl From<Result<LatestMail, MailError>> for FetchOutcome {
    fn from(result: Result<LatestMail, MailError>) -> Self {
        match result {
            Ok(mail) => FetchOutcome::Success(mail),
            Err(e) => FetchOutcome::Error { message: e.to_string() },
        }
    }
}
