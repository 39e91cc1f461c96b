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

//! Error types for ledger command processing.

use crate::base::{AccountId, Amount};
use thiserror::Error;

/// Broad error classification exposed to callers.
///
/// Callers map these onto their own surface (HTTP status codes, provider
/// error codes) without matching on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    InsufficientBalance,
    NotFound,
    Conflict,
    Internal,
}

/// Ledger errors.
///
/// Returning any of these means nothing was applied: the caller is
/// expected to drop (roll back) the store scope it passed in.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed or out-of-range input
    #[error("validation failed: {0}")]
    Validation(String),

    /// A debit or reservation exceeds the available funds
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: Amount, requested: Amount },

    /// Referenced account or target transaction is absent
    #[error("{0} not found")]
    NotFound(String),

    /// The requested change collides with existing state
    #[error("conflict: {0}")]
    Conflict(String),

    /// The account row lock was not granted before the deadline
    #[error("timed out waiting for lock on account {0}")]
    LockTimeout(AccountId),

    /// Underlying store failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::LockTimeout(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same command may be retried with the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }

    pub(crate) fn account_not_found(account_id: AccountId) -> Self {
        Self::NotFound(format!("account {account_id}"))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("metadata encoding: {err}"))
    }
}
