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

//! Committed, append-only transaction log.
//!
//! Rows are indexed by id for point lookups, by account for history, by
//! external id for idempotency and cancel targets, by game round for win
//! splits, and by target for cancellations. Nothing is ever updated or
//! removed.

use crate::base::{AccountId, TransactionId};
use crate::transaction::Transaction;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::error;

/// A thread-safe, append-only transaction log.
///
/// Combines a [`DashMap`] keyed by transaction id with a per-account index
/// that preserves commit order. Appends for one account are serialized by
/// that account's row lock, so the index order is the lock-grant order.
#[derive(Debug, Default)]
pub(crate) struct TransactionLog {
    /// Rows by transaction id.
    transactions: DashMap<TransactionId, Arc<Transaction>>,

    /// Transaction ids per account, in commit order.
    by_account: DashMap<AccountId, Vec<TransactionId>>,

    /// Transaction ids per account and external id, in commit order.
    by_external_id: DashMap<(AccountId, String), Vec<TransactionId>>,

    /// Transaction ids per account and game round, in commit order.
    by_round: DashMap<(AccountId, String), Vec<TransactionId>>,

    /// Cancellation row id per cancelled transaction.
    cancellations: DashMap<TransactionId, TransactionId>,
}

impl TransactionLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a committed row.
    ///
    /// Ids come from the store sequence and are never reused, so an
    /// occupied slot is a store bug; the existing row is kept.
    pub(crate) fn append(&self, transaction: Transaction) {
        let id = transaction.id;
        let account_id = transaction.account_id;

        match self.transactions.entry(id) {
            Entry::Occupied(_) => {
                error!(transaction = %id, "transaction id reused, row dropped");
            }
            Entry::Vacant(entry) => {
                if let Some(external_id) = &transaction.external_id {
                    self.by_external_id
                        .entry((account_id, external_id.clone()))
                        .or_default()
                        .push(id);
                }
                if let Some(round) = &transaction.game_round_id {
                    self.by_round
                        .entry((account_id, round.clone()))
                        .or_default()
                        .push(id);
                }
                if transaction.kind.is_cancellation()
                    && let Some(target) = transaction.target_transaction_id
                {
                    self.cancellations.entry(target).or_insert(id);
                }
                entry.insert(Arc::new(transaction));
                self.by_account.entry(account_id).or_default().push(id);
            }
        }
    }

    pub(crate) fn get(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.transactions.get(&id).map(|row| Arc::clone(row.value()))
    }

    /// All committed rows of one account, oldest first.
    pub(crate) fn for_account(&self, account_id: AccountId) -> Vec<Arc<Transaction>> {
        let ids = self.by_account.get(&account_id).map(|ids| ids.value().clone());
        self.resolve(ids)
    }

    /// Committed rows of one account carrying `external_id`, oldest first.
    pub(crate) fn with_external_id(
        &self,
        account_id: AccountId,
        external_id: &str,
    ) -> Vec<Arc<Transaction>> {
        let ids = self
            .by_external_id
            .get(&(account_id, external_id.to_owned()))
            .map(|ids| ids.value().clone());
        self.resolve(ids)
    }

    /// Committed rows of one account in a game round, oldest first.
    pub(crate) fn in_round(&self, account_id: AccountId, round: &str) -> Vec<Arc<Transaction>> {
        let ids = self
            .by_round
            .get(&(account_id, round.to_owned()))
            .map(|ids| ids.value().clone());
        self.resolve(ids)
    }

    /// The committed row that cancelled `target`, if any.
    pub(crate) fn cancellation_of(&self, target: TransactionId) -> Option<Arc<Transaction>> {
        let id = *self.cancellations.get(&target)?.value();
        self.get(id)
    }

    // Index guards are dropped before the id map is read.
    fn resolve(&self, ids: Option<Vec<TransactionId>>) -> Vec<Arc<Transaction>> {
        ids.unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.transactions.len()
    }
}
