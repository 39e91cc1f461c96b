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

//! Account store abstraction.
//!
//! The ledger talks to its relational store through [`LedgerStore`] and
//! [`LedgerTx`]. A `LedgerTx` is one ACID scope: row locks taken through it
//! are held until it is committed or dropped, and nothing it writes is
//! visible to other scopes before [`LedgerTx::commit`]. Dropping a scope
//! without committing rolls it back.

mod log;
pub mod memory;

pub use memory::{MemoryStore, MemoryTx};

use crate::LedgerError;
use crate::account::{Account, BalanceDelta};
use crate::base::{AccountId, TransactionId};
use crate::outbox::OutboxDraft;
use crate::transaction::{IdempotencyKey, NewTransaction, Transaction, TransactionType};

/// Opens transactional scopes.
pub trait LedgerStore {
    type Tx<'a>: LedgerTx
    where
        Self: 'a;

    fn begin(&self) -> Self::Tx<'_>;
}

/// Runs `f` in a fresh scope, committing on `Ok` and rolling back on `Err`.
pub fn transact<'s, S, R>(
    store: &'s S,
    f: impl FnOnce(&mut S::Tx<'s>) -> Result<R, LedgerError>,
) -> Result<R, LedgerError>
where
    S: LedgerStore,
{
    let mut tx = store.begin();
    let result = f(&mut tx)?;
    tx.commit()?;
    Ok(result)
}

/// Operations available inside one transactional scope.
pub trait LedgerTx {
    /// Takes the exclusive row lock on an account and returns its balances.
    ///
    /// Blocks while another scope holds the lock. Re-locking an account
    /// already held by this scope returns immediately.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] - the account does not exist.
    /// - [`LedgerError::LockTimeout`] - the lock was not granted in time.
    fn lock_account(&mut self, account_id: AccountId) -> Result<Account, LedgerError>;

    /// Finds the row recorded under `key`, including rows staged in this scope.
    fn find_transaction(&self, key: &IdempotencyKey) -> Result<Option<Transaction>, LedgerError>;

    /// Finds the non-cancellation row an external cancel request refers to.
    fn find_target(
        &self,
        account_id: AccountId,
        external_id: &str,
        manufacturer_id: Option<&str>,
    ) -> Result<Option<Transaction>, LedgerError>;

    /// Finds the row that already cancelled `target`, if any.
    fn find_cancellation(
        &self,
        account_id: AccountId,
        target: TransactionId,
    ) -> Result<Option<Transaction>, LedgerError>;

    /// All rows of `kind` recorded for one game round, oldest first.
    fn transactions_in_round(
        &self,
        account_id: AccountId,
        game_round_id: &str,
        kind: TransactionType,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// Applies the dirty columns of `delta` to a locked account and
    /// returns the re-read row.
    fn update_balances(
        &mut self,
        account_id: AccountId,
        delta: &BalanceDelta,
    ) -> Result<Account, LedgerError>;

    /// Appends a row for a locked account and returns it with its id.
    fn insert_transaction(&mut self, new: NewTransaction) -> Result<Transaction, LedgerError>;

    /// Stages an outbox draft to be published with this scope.
    fn enqueue_outbox(&mut self, draft: OutboxDraft) -> Result<(), LedgerError>;

    /// Publishes every staged write atomically and releases the locks.
    fn commit(self) -> Result<(), LedgerError>
    where
        Self: Sized;
}
