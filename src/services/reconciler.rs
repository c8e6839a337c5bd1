// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use log::{debug, error, warn};

use crate::services::account_store::{AccountStatus, AccountStore, AccountUpdate, StorageError};
use crate::services::dispatcher::{PollKind, PollResult};

/// The row change a poll result implies.
///
/// Only a new identifier touches the mail marker. A repeat of the recorded
/// identifier, an empty inbox and a failed fetch all leave the flag and the
/// identifier as they were.
pub fn update_for(result: &PollResult) -> AccountUpdate {
    let checked_at = result.checked_at;
    match &result.kind {
        PollKind::Success {
            identifier: Some(identifier),
            is_new: true,
        } => AccountUpdate::with_marker(
            AccountStatus::Success,
            true,
            Some(identifier.clone()),
            checked_at,
        ),
        PollKind::Success { .. } => AccountUpdate::status_only(AccountStatus::Success, checked_at),
        PollKind::Error { .. } => AccountUpdate::status_only(AccountStatus::Error, checked_at),
    }
}

/// Write every result back to storage, one row update each.
///
/// Stops at the first storage error; rows already written stay written and
/// the remaining results are picked up again by the next cycle.
pub async fn reconcile(
    store: &dyn AccountStore,
    results: &[PollResult],
) -> Result<usize, StorageError> {
    let mut applied = 0;
    for result in results {
        let update = update_for(result);
        match store.update_account(result.account_id, &update).await {
            Ok(true) => {
                applied += 1;
                if let PollKind::Error { message } = &result.kind {
                    debug!("Account {} marked as error: {}", result.account_id, message);
                }
            }
            Ok(false) => warn!(
                "Account {} disappeared before its result was stored",
                result.account_id
            ),
            Err(e) => {
                error!(
                    "Failed to store result for account {} ({} of {} applied): {}",
                    result.account_id,
                    applied,
                    results.len(),
                    e
                );
                return Err(e);
            }
        }
    }
    Ok(applied)
}
