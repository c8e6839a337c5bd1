// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! New-mail detection.
//!
//! A message is identified by `"<subject>|<sender>"`. Two distinct messages
//! with the same subject and sender collide, so a repeat send of an identical
//! message is not reported as new.

/// Build the identifier for a message.
pub fn mail_identifier(subject: &str, sender: &str) -> String {
    format!("{}|{}", subject, sender)
}

/// `true` when `current` differs from the last recorded identifier.
/// An account with no recorded identifier always has new mail.
pub fn is_new(previous: Option<&str>, current: &str) -> bool {
    previous != Some(current)
}
