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

//! Transaction log rows and their correlation identifiers.
//!
//! A [`Transaction`] is written exactly once per applied command and never
//! changes afterwards. Its correlation fields double as the idempotency
//! substrate: a repeated command is recognised by looking up its
//! [`IdempotencyKey`] among existing rows.

use crate::account::Account;
use crate::base::{AccountId, Amount, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    WithdrawalProcessed,
    Bet,
    Win,
    SettlementLoss,
    CancelDeposit,
    CancelBet,
    CancelWin,
    CancelWithdrawal,
    BonusCredit,
    BonusForfeit,
    BonusLost,
    TurnBonusToReal,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::WithdrawalProcessed => "withdrawal-processed",
            Self::Bet => "bet",
            Self::Win => "win",
            Self::SettlementLoss => "settlement-loss",
            Self::CancelDeposit => "cancel-deposit",
            Self::CancelBet => "cancel-bet",
            Self::CancelWin => "cancel-win",
            Self::CancelWithdrawal => "cancel-withdrawal",
            Self::BonusCredit => "bonus-credit",
            Self::BonusForfeit => "bonus-forfeit",
            Self::BonusLost => "bonus-lost",
            Self::TurnBonusToReal => "turn-bonus-to-real",
        }
    }

    pub fn is_cancellation(self) -> bool {
        matches!(
            self,
            Self::CancelDeposit | Self::CancelBet | Self::CancelWin | Self::CancelWithdrawal
        )
    }

    /// The tag a cancellation of this type is recorded under, if it can be cancelled.
    pub fn cancellation(self) -> Option<Self> {
        match self {
            Self::Deposit => Some(Self::CancelDeposit),
            Self::Withdrawal => Some(Self::CancelWithdrawal),
            Self::Bet => Some(Self::CancelBet),
            Self::Win => Some(Self::CancelWin),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External correlation ids supplied by the caller.
///
/// An absent or empty `external_id` opts the command out of idempotency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub external_id: Option<String>,
    pub manufacturer_id: Option<String>,
    pub sub_transaction_id: Option<String>,
    pub game_round_id: Option<String>,
}

impl Reference {
    pub fn external(external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
            ..Self::default()
        }
    }

    pub fn manufacturer(mut self, manufacturer_id: impl Into<String>) -> Self {
        self.manufacturer_id = Some(manufacturer_id.into());
        self
    }

    pub fn sub_transaction(mut self, sub_transaction_id: impl Into<String>) -> Self {
        self.sub_transaction_id = Some(sub_transaction_id.into());
        self
    }

    pub fn round(mut self, game_round_id: impl Into<String>) -> Self {
        self.game_round_id = Some(game_round_id.into());
        self
    }

    /// Builds the idempotency key for `account_id`, or `None` when opted out.
    pub fn idempotency_key(&self, account_id: AccountId) -> Option<IdempotencyKey> {
        let external_id = self.external_id.as_deref().filter(|id| !id.is_empty())?;
        Some(IdempotencyKey {
            account_id,
            external_id: external_id.to_owned(),
            manufacturer_id: self.manufacturer_id.clone(),
            sub_transaction_id: self.sub_transaction_id.clone(),
        })
    }
}

/// Identity of one economic event.
///
/// Provider flows key on all four fields; provider-agnostic flows leave
/// the manufacturer and sub-transaction ids unset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub account_id: AccountId,
    pub external_id: String,
    pub manufacturer_id: Option<String>,
    pub sub_transaction_id: Option<String>,
}

impl IdempotencyKey {
    pub fn matches(&self, transaction: &Transaction) -> bool {
        transaction.account_id == self.account_id
            && transaction.external_id.as_deref() == Some(self.external_id.as_str())
            && transaction.manufacturer_id == self.manufacturer_id
            && transaction.sub_transaction_id == self.sub_transaction_id
    }
}

/// Post-mutation balances recorded on every transaction row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub balance: Amount,
    pub bonus_balance: Amount,
    pub reserved_balance: Amount,
}

impl BalanceSnapshot {
    pub fn of(account: &Account) -> Self {
        Self {
            balance: account.balance,
            bonus_balance: account.bonus_balance,
            reserved_balance: account.reserved_balance,
        }
    }
}

/// How a bet stake was funded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetSplit {
    pub real_bet: Amount,
    pub bonus_bet: Amount,
}

/// How a win payout was credited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinSplit {
    pub real_win: Amount,
    pub bonus_win: Amount,
}

/// Immutable ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// Positive for credits to the player, negative for debits.
    pub amount: Amount,
    #[serde(flatten)]
    pub snapshot: BalanceSnapshot,
    pub external_id: Option<String>,
    pub manufacturer_id: Option<String>,
    pub sub_transaction_id: Option<String>,
    pub target_transaction_id: Option<TransactionId>,
    pub game_round_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Decodes the funding split recorded on a bet row.
    pub fn bet_split(&self) -> Option<BetSplit> {
        self.decode_metadata()
    }

    /// Decodes the credit split recorded on a win row.
    pub fn win_split(&self) -> Option<WinSplit> {
        self.decode_metadata()
    }

    fn decode_metadata<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        let metadata = self.metadata.as_ref()?;
        serde_json::from_value(metadata.clone()).ok()
    }
}

/// A transaction row before the store assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub account_id: AccountId,
    pub kind: TransactionType,
    pub amount: Amount,
    pub snapshot: BalanceSnapshot,
    pub reference: Reference,
    pub target_transaction_id: Option<TransactionId>,
    pub metadata: Option<serde_json::Value>,
}

impl NewTransaction {
    pub fn into_transaction(self, id: TransactionId, created_at: DateTime<Utc>) -> Transaction {
        Transaction {
            id,
            account_id: self.account_id,
            kind: self.kind,
            amount: self.amount,
            snapshot: self.snapshot,
            external_id: self.reference.external_id.filter(|id| !id.is_empty()),
            manufacturer_id: self.reference.manufacturer_id,
            sub_transaction_id: self.reference.sub_transaction_id,
            target_transaction_id: self.target_transaction_id,
            game_round_id: self.reference.game_round_id,
            metadata: self.metadata,
            created_at,
        }
    }
}
