// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Duplicate suppression for dispatch requests.

use super::{DuplicateGuard, Guard, GuardResult};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Remembers every key it has admitted.
///
/// The empty key always passes so callers can opt out.
#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    seen: Mutex<HashSet<String>>,
}

impl IdempotencyGuard {
    pub const NAME: &'static str = "idempotency";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str) -> GuardResult {
        if key.is_empty() {
            return GuardResult::allow();
        }
        if self.seen.lock().insert(key.to_owned()) {
            GuardResult::allow()
        } else {
            GuardResult::deny(Self::NAME, format!("duplicate request {key}"))
        }
    }

    /// Forgets `key` so the next check with it passes again.
    pub fn remove(&self, key: &str) {
        self.seen.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Guard for IdempotencyGuard {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn check(&self, key: &str) -> GuardResult {
        IdempotencyGuard::check(self, key)
    }
}

impl DuplicateGuard for IdempotencyGuard {
    fn remove(&self, key: &str) {
        IdempotencyGuard::remove(self, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_use_of_key_is_denied() {
        let guard = IdempotencyGuard::new();
        assert!(guard.check("req-1").allowed);

        let denied = guard.check("req-1");
        assert!(!denied.allowed);
        assert_eq!(denied.guard, Some(IdempotencyGuard::NAME));
    }

    #[test]
    fn empty_key_always_passes() {
        let guard = IdempotencyGuard::new();
        assert!(guard.check("").allowed);
        assert!(guard.check("").allowed);
        assert!(guard.is_empty());
    }

    #[test]
    fn remove_allows_retry() {
        let guard = IdempotencyGuard::new();
        guard.check("req-1");
        guard.remove("req-1");
        assert!(guard.check("req-1").allowed);
        assert_eq!(guard.len(), 1);
    }
}
