// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::Utc;
use log::{info, warn};
use thiserror::Error;

use crate::imap::client::MailFetcher;
use crate::imap::types::FetchOutcome;
use crate::services::account_store::{AccountStatus, AccountStore, AccountUpdate, StorageError};

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Account not found: {0}")]
    AccountNotFound(i64),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Foreground "check now" for one account.
///
/// Fetches the latest message and stores the outcome through the same
/// update path the poller uses. A successful check acknowledges the
/// mailbox: the new-mail flag is cleared and the identifier is replaced
/// unconditionally. A failed check records `error` and returns the fetch
/// error message to the caller.
pub async fn check_now(
    store: &dyn AccountStore,
    fetcher: &dyn MailFetcher,
    account_id: i64,
) -> Result<FetchOutcome, CheckError> {
    let account = store
        .get_account(account_id)
        .await?
        .ok_or(CheckError::AccountNotFound(account_id))?;

    info!("Checking account {} ({}) now", account.id, account.address);
    let outcome = fetcher.fetch_latest(&account.address, &account.auth_token).await;

    let update = match &outcome {
        FetchOutcome::Success(mail) => AccountUpdate::with_marker(
            AccountStatus::Success,
            false,
            mail.identifier.clone(),
            Utc::now(),
        ),
        FetchOutcome::Error { message } => {
            warn!("Check of account {} failed: {}", account.id, message);
            AccountUpdate::status_only(AccountStatus::Error, Utc::now())
        }
    };

    if !store.update_account(account.id, &update).await? {
        return Err(CheckError::AccountNotFound(account.id));
    }
    Ok(outcome)
}
