// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use log::{debug, error, info};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::imap::client::MailFetcher;
use crate::imap::types::FetchOutcome;
use crate::services::account_store::Account;
use crate::services::freshness::is_new;

/// What one fetch produced for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PollKind {
    Success {
        /// `None` for an empty inbox.
        identifier: Option<String>,
        is_new: bool,
    },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollResult {
    pub account_id: i64,
    pub checked_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: PollKind,
}

impl PollResult {
    /// Compare a fetch outcome against what the account last recorded.
    pub fn from_outcome(
        account: &Account,
        outcome: FetchOutcome,
        checked_at: DateTime<Utc>,
    ) -> Self {
        let kind = match outcome {
            FetchOutcome::Success(mail) => {
                let is_new = mail
                    .identifier
                    .as_deref()
                    .map(|current| is_new(account.last_identifier.as_deref(), current))
                    .unwrap_or(false);
                PollKind::Success {
                    identifier: mail.identifier,
                    is_new,
                }
            }
            FetchOutcome::Error { message } => PollKind::Error { message },
        };
        Self {
            account_id: account.id,
            checked_at,
            kind,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.kind, PollKind::Success { .. })
    }

    pub fn is_new(&self) -> bool {
        matches!(self.kind, PollKind::Success { is_new: true, .. })
    }
}

/// Results of one fan-out. `dropped` counts tasks that died without a result.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub results: Vec<PollResult>,
    pub dropped: usize,
}

/// Fans fetches out over a bounded number of concurrent workers.
#[derive(Clone)]
pub struct Dispatcher {
    fetcher: Arc<dyn MailFetcher>,
    worker_limit: usize,
}

impl Dispatcher {
    pub fn new(fetcher: Arc<dyn MailFetcher>, worker_limit: usize) -> Self {
        Self {
            fetcher,
            worker_limit: worker_limit.max(1),
        }
    }

    pub fn worker_limit(&self) -> usize {
        self.worker_limit
    }

    /// Fetch every account, at most `worker_limit` at a time, and wait for all
    /// of them. A failing fetch becomes an error result and never affects its
    /// siblings; a panicking task is logged and counted as dropped.
    pub async fn dispatch(&self, accounts: Vec<Account>) -> DispatchReport {
        let total = accounts.len();
        if total == 0 {
            return DispatchReport::default();
        }
        info!("Dispatching {} account(s) over {} worker(s)", total, self.worker_limit);

        let semaphore = Arc::new(Semaphore::new(self.worker_limit));
        let mut tasks = JoinSet::new();

        for account in accounts {
            let semaphore = semaphore.clone();
            let fetcher = self.fetcher.clone();
            tasks.spawn(async move {
                // None only if the semaphore was closed
                let _permit = semaphore.acquire_owned().await.ok()?;
                debug!("Polling account {} ({})", account.id, account.address);
                let fetch = fetcher.fetch_latest(&account.address, &account.auth_token);
                match AssertUnwindSafe(fetch).catch_unwind().await {
                    Ok(outcome) => Some(PollResult::from_outcome(&account, outcome, Utc::now())),
                    Err(_) => {
                        error!("Poll task for account {} panicked; result dropped", account.id);
                        None
                    }
                }
            });
        }

        let mut report = DispatchReport {
            results: Vec::with_capacity(total),
            dropped: 0,
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(result)) => report.results.push(result),
                Ok(None) => report.dropped += 1,
                Err(e) => {
                    error!("Poll task failed: {}", e);
                    report.dropped += 1;
                }
            }
        }

        debug!("Dispatch finished: {} result(s), {} dropped", report.results.len(), report.dropped);
        report
    }
}
