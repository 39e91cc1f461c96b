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

//! Outbox drafts emitted alongside balance-affecting transactions.

use crate::account::Account;
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event record handed to the outbox consumer.
///
/// Exactly one draft is written per balance-affecting transaction, in the
/// same store scope as the transaction row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxDraft {
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub partition_key: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct Payload<'a> {
    transaction: &'a Transaction,
    account: &'a Account,
}

impl OutboxDraft {
    /// Builds the draft describing `transaction` and the account it left behind.
    pub fn for_transaction(
        aggregate_type: &str,
        transaction: &Transaction,
        account: &Account,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(Payload {
            transaction,
            account,
        })?;
        let account_key = transaction.account_id.to_string();
        Ok(Self {
            event_id: Uuid::new_v4(),
            aggregate_type: aggregate_type.to_owned(),
            aggregate_id: account_key.clone(),
            event_type: format!("wallet.{}", transaction.kind),
            partition_key: account_key,
            payload,
            occurred_at: transaction.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{AccountId, Currency, TransactionId};
    use crate::transaction::{BalanceSnapshot, NewTransaction, Reference, TransactionType};

    #[test]
    fn draft_is_keyed_by_account() {
        let mut account = Account::new(AccountId(7), Currency::new("EUR"));
        account.balance = 1500;
        let transaction = NewTransaction {
            account_id: AccountId(7),
            kind: TransactionType::Deposit,
            amount: 1500,
            snapshot: BalanceSnapshot::of(&account),
            reference: Reference::external("psp-1"),
            target_transaction_id: None,
            metadata: None,
        }
        .into_transaction(TransactionId(3), Utc::now());

        let draft = OutboxDraft::for_transaction("wallet", &transaction, &account).unwrap();

        assert_eq!(draft.aggregate_type, "wallet");
        assert_eq!(draft.aggregate_id, "7");
        assert_eq!(draft.partition_key, "7");
        assert_eq!(draft.event_type, "wallet.deposit");
        assert_eq!(draft.occurred_at, transaction.created_at);
        assert_eq!(draft.payload["transaction"]["id"], 3);
        assert_eq!(draft.payload["transaction"]["type"], "deposit");
        assert_eq!(draft.payload["account"]["balance"], 1500);
    }

    #[test]
    fn drafts_get_distinct_event_ids() {
        let account = Account::new(AccountId(1), Currency::new("EUR"));
        let transaction = NewTransaction {
            account_id: AccountId(1),
            kind: TransactionType::BonusCredit,
            amount: 10,
            snapshot: BalanceSnapshot::default(),
            reference: Reference::default(),
            target_transaction_id: None,
            metadata: None,
        }
        .into_transaction(TransactionId(1), Utc::now());

        let first = OutboxDraft::for_transaction("wallet", &transaction, &account).unwrap();
        let second = OutboxDraft::for_transaction("wallet", &transaction, &account).unwrap();
        assert_ne!(first.event_id, second.event_id);
    }
}
