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

//! Account lock, idempotency lookup and the single balance-mutation path.
//!
//! Every ledger command runs the same three primitives in order:
//! [`lock_player_for_update`], [`find_existing_transaction`] and
//! [`post_ledger_entry`]. Only the last one writes, and it is the only
//! place in the crate that changes a balance.

use crate::LedgerError;
use crate::account::{Account, BalanceDelta};
use crate::base::{AccountId, Amount, TransactionId};
use crate::store::LedgerTx;
use crate::transaction::{BalanceSnapshot, NewTransaction, Reference, Transaction, TransactionType};
use tracing::debug;

/// Locks the account row for the rest of the scope and returns its balances.
///
/// This is the only serialization point between concurrent commands on one
/// account: a second scope blocks here until the first commits or rolls back.
pub fn lock_player_for_update<T: LedgerTx>(
    tx: &mut T,
    account_id: AccountId,
) -> Result<Account, LedgerError> {
    tx.lock_account(account_id)
}

/// Looks up the row a previous call with the same idempotency key created.
///
/// Returns `Ok(None)` when the reference carries no external id.
pub fn find_existing_transaction<T: LedgerTx>(
    tx: &T,
    account_id: AccountId,
    reference: &Reference,
) -> Result<Option<Transaction>, LedgerError> {
    let Some(key) = reference.idempotency_key(account_id) else {
        return Ok(None);
    };
    let existing = tx.find_transaction(&key)?;
    if let Some(transaction) = &existing {
        debug!(
            account = %account_id,
            external_id = %key.external_id,
            transaction = %transaction.id,
            "idempotency key already applied"
        );
    }
    Ok(existing)
}

/// Everything [`post_ledger_entry`] writes.
#[derive(Debug, Clone, PartialEq)]
pub struct PostingParams {
    pub account_id: AccountId,
    pub kind: TransactionType,
    pub amount: Amount,
    pub delta: BalanceDelta,
    pub reference: Reference,
    pub target_transaction_id: Option<TransactionId>,
    pub metadata: Option<serde_json::Value>,
}

impl PostingParams {
    pub fn new(
        account_id: AccountId,
        kind: TransactionType,
        amount: Amount,
        delta: BalanceDelta,
        reference: Reference,
    ) -> Self {
        Self {
            account_id,
            kind,
            amount,
            delta,
            reference,
            target_transaction_id: None,
            metadata: None,
        }
    }
}

/// Applies the delta to a locked account and appends the matching row.
///
/// Performs no locking or idempotency checks of its own. The row's balance
/// snapshot is taken from the account as re-read after the update, so the
/// two are always consistent.
pub fn post_ledger_entry<T: LedgerTx>(
    tx: &mut T,
    params: PostingParams,
) -> Result<(Transaction, Account), LedgerError> {
    let account = tx.update_balances(params.account_id, &params.delta)?;
    let transaction = tx.insert_transaction(NewTransaction {
        account_id: params.account_id,
        kind: params.kind,
        amount: params.amount,
        snapshot: BalanceSnapshot::of(&account),
        reference: params.reference,
        target_transaction_id: params.target_transaction_id,
        metadata: params.metadata,
    })?;
    Ok((transaction, account))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::BalanceColumn;
    use crate::base::Currency;
    use crate::store::{LedgerStore, MemoryStore};

    fn store() -> MemoryStore {
        let store = MemoryStore::default();
        store.open_account(AccountId(1), Currency::new("EUR")).unwrap();
        store
    }

    #[test]
    fn posting_snapshots_post_mutation_balances() {
        let store = store();
        let mut tx = store.begin();
        lock_player_for_update(&mut tx, AccountId(1)).unwrap();

        let delta = BalanceDelta::default()
            .with(BalanceColumn::Balance, 700)
            .with(BalanceColumn::BonusBalance, 300);
        let (transaction, account) = post_ledger_entry(
            &mut tx,
            PostingParams::new(
                AccountId(1),
                TransactionType::Deposit,
                700,
                delta,
                Reference::default(),
            ),
        )
        .unwrap();

        assert_eq!(transaction.snapshot, BalanceSnapshot::of(&account));
        assert_eq!(transaction.snapshot.balance, 700);
        assert_eq!(transaction.snapshot.bonus_balance, 300);
    }

    #[test]
    fn empty_delta_still_writes_a_row() {
        let store = store();
        let mut tx = store.begin();
        lock_player_for_update(&mut tx, AccountId(1)).unwrap();

        let (transaction, account) = post_ledger_entry(
            &mut tx,
            PostingParams::new(
                AccountId(1),
                TransactionType::SettlementLoss,
                -50,
                BalanceDelta::default(),
                Reference::default(),
            ),
        )
        .unwrap();

        assert_eq!(account.balance, 0);
        assert_eq!(transaction.amount, -50);
    }

    #[test]
    fn lookup_without_external_id_finds_nothing() {
        let store = store();
        let mut tx = store.begin();
        lock_player_for_update(&mut tx, AccountId(1)).unwrap();
        post_ledger_entry(
            &mut tx,
            PostingParams::new(
                AccountId(1),
                TransactionType::Deposit,
                10,
                BalanceDelta::default().with(BalanceColumn::Balance, 10),
                Reference::default(),
            ),
        )
        .unwrap();

        assert_eq!(
            find_existing_transaction(&tx, AccountId(1), &Reference::default()).unwrap(),
            None
        );
    }

    #[test]
    fn lookup_finds_committed_row_by_key() {
        let store = store();
        let mut tx = store.begin();
        lock_player_for_update(&mut tx, AccountId(1)).unwrap();
        let (posted, _) = post_ledger_entry(
            &mut tx,
            PostingParams::new(
                AccountId(1),
                TransactionType::Deposit,
                10,
                BalanceDelta::default().with(BalanceColumn::Balance, 10),
                Reference::external("psp-9"),
            ),
        )
        .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin();
        lock_player_for_update(&mut tx, AccountId(1)).unwrap();
        let found = find_existing_transaction(&tx, AccountId(1), &Reference::external("psp-9"))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, posted.id);
    }
}
