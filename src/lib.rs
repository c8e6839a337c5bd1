// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Library core for mailwatch.

// --- Modules ---
pub mod config;
pub mod imap;
pub mod services;
pub mod utils;

// CONSOLIDATED PRELUDE
pub mod prelude {
    // Config
    pub use crate::config::{ImapSettings, PollingSettings, Settings};

    // IMAP
    pub use crate::imap::client::{ImapConfig, ImapMailClient, MailFetcher};
    pub use crate::imap::error::MailError;
    pub use crate::imap::types::{FetchOutcome, LatestMail};

    // Polling core
    pub use crate::services::account_store::{
        Account, AccountStatus, AccountStore, AccountUpdate, PollSettings, SqliteAccountStore,
        StorageError,
    };
    pub use crate::services::check::{check_now, CheckError};
    pub use crate::services::dispatcher::{DispatchReport, Dispatcher, PollKind, PollResult};
    pub use crate::services::poller::{CycleReport, PollError, Poller, TickOutcome};
    pub use crate::services::reconciler::reconcile;

    // Common Libs
    pub use log::{debug, error, info, trace, warn};
    pub use std::sync::Arc;
}
