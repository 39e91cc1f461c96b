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

//! Ledger command parameters and results.

use crate::account::Account;
use crate::base::{AccountId, Amount};
use crate::outbox::OutboxDraft;
use crate::transaction::{Reference, Transaction, TransactionType};

/// Parameters shared by every amount-carrying command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryParams {
    pub account_id: AccountId,
    /// Minor units, must be strictly positive.
    pub amount: Amount,
    pub reference: Reference,
}

impl EntryParams {
    pub fn new(account_id: AccountId, amount: Amount) -> Self {
        Self {
            account_id,
            amount,
            reference: Reference::default(),
        }
    }

    pub fn reference(mut self, reference: Reference) -> Self {
        self.reference = reference;
        self
    }
}

/// Reverses an earlier transaction identified by its external id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelParams {
    pub account_id: AccountId,
    /// External id of the transaction to reverse.
    pub target_external_id: String,
    /// Correlation ids of the cancel request itself. Its manufacturer id
    /// also scopes the target lookup.
    pub reference: Reference,
}

impl CancelParams {
    pub fn new(account_id: AccountId, target_external_id: impl Into<String>) -> Self {
        Self {
            account_id,
            target_external_id: target_external_id.into(),
            reference: Reference::default(),
        }
    }

    pub fn reference(mut self, reference: Reference) -> Self {
        self.reference = reference;
        self
    }
}

/// Why bonus funds are being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForfeitReason {
    /// Bonus withdrawn by the operator (expiry, cancelled promotion).
    #[default]
    Forfeited,
    /// Bonus lost through wagering requirements not being met.
    Lost,
}

impl ForfeitReason {
    pub fn transaction_type(self) -> TransactionType {
        match self {
            Self::Forfeited => TransactionType::BonusForfeit,
            Self::Lost => TransactionType::BonusLost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForfeitParams {
    pub account_id: AccountId,
    /// `None` forfeits the whole bonus balance.
    pub amount: Option<Amount>,
    pub reason: ForfeitReason,
    pub reference: Reference,
}

impl ForfeitParams {
    pub fn all(account_id: AccountId) -> Self {
        Self {
            account_id,
            amount: None,
            reason: ForfeitReason::default(),
            reference: Reference::default(),
        }
    }

    pub fn amount(mut self, amount: Amount) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn reason(mut self, reason: ForfeitReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn reference(mut self, reference: Reference) -> Self {
        self.reference = reference;
        self
    }
}

/// Outcome of a ledger command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// The row this command wrote, or the original row on replay.
    pub transaction: Transaction,
    /// Account as locked at the end of the command.
    pub account: Account,
    /// Drafts enqueued by this call; empty on replay.
    pub events: Vec<OutboxDraft>,
    /// True when the idempotency key had already been applied.
    pub replayed: bool,
}

impl CommandResult {
    pub(crate) fn replay(transaction: Transaction, account: Account) -> Self {
        Self {
            transaction,
            account,
            events: Vec::new(),
            replayed: true,
        }
    }
}
