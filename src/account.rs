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

//! Account rows and balance deltas.
//!
//! An [`Account`] holds three non-negative balances. Every mutation is
//! expressed as a [`BalanceDelta`], which records only the columns that
//! actually move so the store can update exactly those columns.
//!
//! # Example
//!
//! ```
//! use wallet_ledger::{Account, AccountId, BalanceColumn, BalanceDelta, Currency};
//!
//! let mut account = Account::new(AccountId(1), Currency::new("EUR"));
//! let delta = BalanceDelta::default().with(BalanceColumn::Balance, 500);
//! account.apply(&delta).unwrap();
//! assert_eq!(account.balance, 500);
//! assert_eq!(delta.dirty_columns().count(), 1);
//! ```

use crate::LedgerError;
use crate::base::{AccountId, Amount, Currency};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Player wallet row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub currency: Currency,
    /// Real funds.
    pub balance: Amount,
    /// Promotional funds.
    pub bonus_balance: Amount,
    /// Funds earmarked by a pending withdrawal.
    pub reserved_balance: Amount,
}

impl Account {
    pub fn new(id: AccountId, currency: Currency) -> Self {
        Self {
            id,
            currency,
            balance: 0,
            bonus_balance: 0,
            reserved_balance: 0,
        }
    }

    pub fn column(&self, column: BalanceColumn) -> Amount {
        match column {
            BalanceColumn::Balance => self.balance,
            BalanceColumn::BonusBalance => self.bonus_balance,
            BalanceColumn::ReservedBalance => self.reserved_balance,
        }
    }

    fn column_mut(&mut self, column: BalanceColumn) -> &mut Amount {
        match column {
            BalanceColumn::Balance => &mut self.balance,
            BalanceColumn::BonusBalance => &mut self.bonus_balance,
            BalanceColumn::ReservedBalance => &mut self.reserved_balance,
        }
    }

    /// Real plus bonus funds, i.e. what a bet may consume.
    pub fn spendable(&self) -> Amount {
        self.balance.saturating_add(self.bonus_balance)
    }

    /// Applies `delta` to the dirty columns only.
    ///
    /// Either every dirty column is updated or none is.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InsufficientBalance`] if a column would go negative.
    /// - [`LedgerError::Validation`] if a column would overflow.
    pub fn apply(&mut self, delta: &BalanceDelta) -> Result<(), LedgerError> {
        let mut updated = [None; 3];
        for (slot, (column, change)) in updated.iter_mut().zip(delta.dirty_columns()) {
            let current = self.column(column);
            let next = current
                .checked_add(change)
                .ok_or_else(|| LedgerError::Validation(format!("{column} overflow")))?;
            if next < 0 {
                return Err(LedgerError::InsufficientBalance {
                    available: current,
                    requested: -change,
                });
            }
            *slot = Some((column, next));
        }

        for (column, next) in updated.into_iter().flatten() {
            *self.column_mut(column) = next;
        }
        self.assert_invariants();
        Ok(())
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.balance >= 0,
            "Invariant violated: balance went negative: {}",
            self.balance
        );
        debug_assert!(
            self.bonus_balance >= 0,
            "Invariant violated: bonus balance went negative: {}",
            self.bonus_balance
        );
        debug_assert!(
            self.reserved_balance >= 0,
            "Invariant violated: reserved balance went negative: {}",
            self.reserved_balance
        );
    }
}

/// One of the three balance columns of an account row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BalanceColumn {
    Balance,
    BonusBalance,
    ReservedBalance,
}

impl BalanceColumn {
    pub const ALL: [BalanceColumn; 3] = [
        BalanceColumn::Balance,
        BalanceColumn::BonusBalance,
        BalanceColumn::ReservedBalance,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::BonusBalance => "bonus_balance",
            Self::ReservedBalance => "reserved_balance",
        }
    }
}

impl fmt::Display for BalanceColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signed movement of each balance column for one command.
///
/// Zero fields are clean and never touched by an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceDelta {
    pub balance: Amount,
    pub bonus_balance: Amount,
    pub reserved_balance: Amount,
}

impl BalanceDelta {
    pub fn with(mut self, column: BalanceColumn, change: Amount) -> Self {
        match column {
            BalanceColumn::Balance => self.balance = change,
            BalanceColumn::BonusBalance => self.bonus_balance = change,
            BalanceColumn::ReservedBalance => self.reserved_balance = change,
        }
        self
    }

    pub fn get(&self, column: BalanceColumn) -> Amount {
        match column {
            BalanceColumn::Balance => self.balance,
            BalanceColumn::BonusBalance => self.bonus_balance,
            BalanceColumn::ReservedBalance => self.reserved_balance,
        }
    }

    /// Columns with a non-zero change, in a fixed column order.
    pub fn dirty_columns(&self) -> impl Iterator<Item = (BalanceColumn, Amount)> + '_ {
        BalanceColumn::ALL
            .into_iter()
            .map(|column| (column, self.get(column)))
            .filter(|(_, change)| *change != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.dirty_columns().next().is_none()
    }

    /// The delta that exactly undoes this one.
    pub fn negated(&self) -> Self {
        Self {
            balance: -self.balance,
            bonus_balance: -self.bonus_balance,
            reserved_balance: -self.reserved_balance,
        }
    }
}
