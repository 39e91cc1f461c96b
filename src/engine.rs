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

//! Ledger command engine.
//!
//! The [`Engine`] turns wallet events into balance mutations. Every command
//! runs inside a store scope owned by the caller and follows one skeleton:
//!
//! 1. validate the amount,
//! 2. lock the account row,
//! 3. return the original row if the idempotency key was already applied,
//! 4. compute a [`BalanceDelta`],
//! 5. post it through [`post_ledger_entry`],
//! 6. enqueue exactly one outbox draft for balance-affecting commands.
//!
//! Any error leaves the scope's staged state unusable and the caller is
//! expected to drop it, which rolls everything back.
//!
//! # Commands
//!
//! | Command | Delta | Precondition |
//! |---------|-------|--------------|
//! | Deposit | balance += a | none |
//! | Withdraw | balance -= a, reserved += a | balance >= a |
//! | CompleteWithdrawal | reserved -= a | reserved >= a |
//! | BonusCredit | bonus += a | none |
//! | TurnBonusToReal | balance += a, bonus -= a | bonus >= a |
//! | ForfeitBonus | bonus -= a | bonus >= a |
//! | PlaceBet | balance -= real, bonus -= bonus part | balance + bonus >= a |
//! | CreditWin | balance += real, bonus += bonus part | none |
//! | SettleLoss | none | none |
//! | CancelTransaction | inverse of the target | target exists |

use crate::account::{Account, BalanceColumn, BalanceDelta};
use crate::base::{AccountId, Amount, TransactionId};
use crate::command::{CancelParams, CommandResult, EntryParams, ForfeitParams};
use crate::config::OutboxConfig;
use crate::outbox::OutboxDraft;
use crate::posting::{
    PostingParams, find_existing_transaction, lock_player_for_update, post_ledger_entry,
};
use crate::store::LedgerTx;
use crate::transaction::{BetSplit, Reference, Transaction, TransactionType, WinSplit};
use crate::LedgerError;
use tracing::{info, warn};

/// What a command decided to write once the account was locked.
struct Plan {
    kind: TransactionType,
    amount: Amount,
    delta: BalanceDelta,
    target_transaction_id: Option<TransactionId>,
    metadata: Option<serde_json::Value>,
    emits_event: bool,
}

impl Plan {
    fn new(kind: TransactionType, amount: Amount, delta: BalanceDelta) -> Self {
        Self {
            kind,
            amount,
            delta,
            target_transaction_id: None,
            metadata: None,
            emits_event: true,
        }
    }

    fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

enum Step {
    Post(Plan),
    /// Nothing to write; answer with an existing row.
    Replay(Transaction),
}

/// Wallet ledger engine.
///
/// Holds no balances itself; all state lives in the store scope passed to
/// each command.
#[derive(Debug, Clone)]
pub struct Engine {
    aggregate_type: String,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(&OutboxConfig::default())
    }

    pub fn with_config(config: &OutboxConfig) -> Self {
        Self {
            aggregate_type: config.aggregate_type.clone(),
        }
    }

    /// Credits real funds.
    pub fn deposit<T: LedgerTx>(
        &self,
        tx: &mut T,
        params: EntryParams,
    ) -> Result<CommandResult, LedgerError> {
        let amount = ensure_positive(params.amount)?;
        self.run(tx, params.account_id, &params.reference, |_, _| {
            Ok(Step::Post(Plan::new(
                TransactionType::Deposit,
                amount,
                BalanceDelta::default().with(BalanceColumn::Balance, amount),
            )))
        })
    }

    /// Moves real funds into the reserved column pending payout.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientBalance`] if the real balance is below the amount.
    pub fn withdraw<T: LedgerTx>(
        &self,
        tx: &mut T,
        params: EntryParams,
    ) -> Result<CommandResult, LedgerError> {
        let amount = ensure_positive(params.amount)?;
        self.run(tx, params.account_id, &params.reference, |_, account| {
            if account.balance < amount {
                return Err(LedgerError::InsufficientBalance {
                    available: account.balance,
                    requested: amount,
                });
            }
            Ok(Step::Post(Plan::new(
                TransactionType::Withdrawal,
                -amount,
                BalanceDelta::default()
                    .with(BalanceColumn::Balance, -amount)
                    .with(BalanceColumn::ReservedBalance, amount),
            )))
        })
    }

    /// Releases reserved funds once the payout has left.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Validation`] if less than the amount is reserved.
    pub fn complete_withdrawal<T: LedgerTx>(
        &self,
        tx: &mut T,
        params: EntryParams,
    ) -> Result<CommandResult, LedgerError> {
        let amount = ensure_positive(params.amount)?;
        self.run(tx, params.account_id, &params.reference, |_, account| {
            if account.reserved_balance < amount {
                return Err(LedgerError::Validation(format!(
                    "reserved balance {} is less than {amount}",
                    account.reserved_balance
                )));
            }
            Ok(Step::Post(Plan::new(
                TransactionType::WithdrawalProcessed,
                -amount,
                BalanceDelta::default().with(BalanceColumn::ReservedBalance, -amount),
            )))
        })
    }

    /// Credits promotional funds.
    pub fn bonus_credit<T: LedgerTx>(
        &self,
        tx: &mut T,
        params: EntryParams,
    ) -> Result<CommandResult, LedgerError> {
        let amount = ensure_positive(params.amount)?;
        self.run(tx, params.account_id, &params.reference, |_, _| {
            Ok(Step::Post(Plan::new(
                TransactionType::BonusCredit,
                amount,
                BalanceDelta::default().with(BalanceColumn::BonusBalance, amount),
            )))
        })
    }

    /// Converts bonus funds into real funds.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Validation`] if the bonus balance is below the amount.
    pub fn turn_bonus_to_real<T: LedgerTx>(
        &self,
        tx: &mut T,
        params: EntryParams,
    ) -> Result<CommandResult, LedgerError> {
        let amount = ensure_positive(params.amount)?;
        self.run(tx, params.account_id, &params.reference, |_, account| {
            if account.bonus_balance < amount {
                return Err(LedgerError::Validation(format!(
                    "bonus balance {} is less than {amount}",
                    account.bonus_balance
                )));
            }
            Ok(Step::Post(Plan::new(
                TransactionType::TurnBonusToReal,
                amount,
                BalanceDelta::default()
                    .with(BalanceColumn::Balance, amount)
                    .with(BalanceColumn::BonusBalance, -amount),
            )))
        })
    }

    /// Removes bonus funds, by default the whole bonus balance.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Validation`] if there is nothing to forfeit or the
    /// bonus balance is below the requested amount.
    pub fn forfeit_bonus<T: LedgerTx>(
        &self,
        tx: &mut T,
        params: ForfeitParams,
    ) -> Result<CommandResult, LedgerError> {
        if let Some(amount) = params.amount {
            ensure_positive(amount)?;
        }
        let kind = params.reason.transaction_type();
        self.run(tx, params.account_id, &params.reference, |_, account| {
            let amount = params.amount.unwrap_or(account.bonus_balance);
            if amount <= 0 {
                return Err(LedgerError::Validation("no bonus balance to forfeit".into()));
            }
            if account.bonus_balance < amount {
                return Err(LedgerError::Validation(format!(
                    "bonus balance {} is less than {amount}",
                    account.bonus_balance
                )));
            }
            Ok(Step::Post(Plan::new(
                kind,
                -amount,
                BalanceDelta::default().with(BalanceColumn::BonusBalance, -amount),
            )))
        })
    }

    /// Debits a stake, consuming real funds before bonus funds.
    ///
    /// The split is recorded as `realBet`/`bonusBet` metadata, which
    /// [`Engine::credit_win`] later reads back.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientBalance`] if real plus bonus funds are
    /// below the stake.
    pub fn place_bet<T: LedgerTx>(
        &self,
        tx: &mut T,
        params: EntryParams,
    ) -> Result<CommandResult, LedgerError> {
        let stake = ensure_positive(params.amount)?;
        self.run(tx, params.account_id, &params.reference, |_, account| {
            if account.spendable() < stake {
                return Err(LedgerError::InsufficientBalance {
                    available: account.spendable(),
                    requested: stake,
                });
            }
            let split = split_bet(stake, account.balance);
            let plan = Plan::new(
                TransactionType::Bet,
                -stake,
                BalanceDelta::default()
                    .with(BalanceColumn::Balance, -split.real_bet)
                    .with(BalanceColumn::BonusBalance, -split.bonus_bet),
            );
            Ok(Step::Post(plan.metadata(serde_json::to_value(split)?)))
        })
    }

    /// Credits a payout, split between real and bonus funds.
    ///
    /// If the account holds any bonus the whole win goes to bonus.
    /// Otherwise the win follows the funding ratio of the bets recorded for
    /// the same game round, and is all real when there are none.
    pub fn credit_win<T: LedgerTx>(
        &self,
        tx: &mut T,
        params: EntryParams,
    ) -> Result<CommandResult, LedgerError> {
        let amount = ensure_positive(params.amount)?;
        let round = params.reference.game_round_id.clone();
        self.run(tx, params.account_id, &params.reference, |tx, account| {
            let split = split_win(tx, account, amount, round.as_deref())?;
            let plan = Plan::new(
                TransactionType::Win,
                amount,
                BalanceDelta::default()
                    .with(BalanceColumn::Balance, split.real_win)
                    .with(BalanceColumn::BonusBalance, split.bonus_win),
            );
            Ok(Step::Post(plan.metadata(serde_json::to_value(split)?)))
        })
    }

    /// Records that a stake was lost at settlement.
    ///
    /// The stake already left the account when the bet was placed, so no
    /// balance moves and no outbox draft is emitted.
    pub fn settle_loss<T: LedgerTx>(
        &self,
        tx: &mut T,
        params: EntryParams,
    ) -> Result<CommandResult, LedgerError> {
        let stake = ensure_positive(params.amount)?;
        self.run(tx, params.account_id, &params.reference, |_, _| {
            let mut plan = Plan::new(
                TransactionType::SettlementLoss,
                -stake,
                BalanceDelta::default(),
            );
            plan.emits_event = false;
            Ok(Step::Post(plan))
        })
    }

    /// Reverses a deposit, withdrawal, bet or win.
    ///
    /// A target that was already cancelled, under any external id, answers
    /// with the existing cancellation flagged as a replay.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] if the target does not exist.
    /// - [`LedgerError::Validation`] if the target type cannot be cancelled.
    /// - [`LedgerError::InsufficientBalance`] if the reversal would drive a
    ///   balance negative.
    pub fn cancel_transaction<T: LedgerTx>(
        &self,
        tx: &mut T,
        params: CancelParams,
    ) -> Result<CommandResult, LedgerError> {
        if params.target_external_id.is_empty() {
            return Err(LedgerError::Validation("target external id is empty".into()));
        }
        self.run(tx, params.account_id, &params.reference, |tx, account| {
            let target = tx
                .find_target(
                    account.id,
                    &params.target_external_id,
                    params.reference.manufacturer_id.as_deref(),
                )?
                .ok_or_else(|| {
                    LedgerError::NotFound(format!("transaction {}", params.target_external_id))
                })?;
            let kind = target.kind.cancellation().ok_or_else(|| {
                LedgerError::Validation(format!("{} transactions cannot be cancelled", target.kind))
            })?;
            if let Some(existing) = tx.find_cancellation(account.id, target.id)? {
                return Ok(Step::Replay(existing));
            }

            let mut plan = Plan::new(kind, -target.amount, applied_delta(&target).negated());
            plan.target_transaction_id = Some(target.id);
            plan.metadata = target.metadata.clone();
            Ok(Step::Post(plan))
        })
    }

    fn run<T, F>(
        &self,
        tx: &mut T,
        account_id: AccountId,
        reference: &Reference,
        plan: F,
    ) -> Result<CommandResult, LedgerError>
    where
        T: LedgerTx,
        F: FnOnce(&T, &Account) -> Result<Step, LedgerError>,
    {
        let account = lock_player_for_update(tx, account_id)?;
        if let Some(existing) = find_existing_transaction(&*tx, account_id, reference)? {
            info!(account = %account_id, transaction = %existing.id, kind = %existing.kind, "replayed");
            return Ok(CommandResult::replay(existing, account));
        }

        let plan = match plan(&*tx, &account)? {
            Step::Post(plan) => plan,
            Step::Replay(existing) => {
                info!(account = %account_id, transaction = %existing.id, kind = %existing.kind, "replayed");
                return Ok(CommandResult::replay(existing, account));
            }
        };

        let emits_event = plan.emits_event;
        let (transaction, account) = post_ledger_entry(
            tx,
            PostingParams {
                account_id,
                kind: plan.kind,
                amount: plan.amount,
                delta: plan.delta,
                reference: reference.clone(),
                target_transaction_id: plan.target_transaction_id,
                metadata: plan.metadata,
            },
        )?;

        let mut events = Vec::with_capacity(1);
        if emits_event {
            let draft = OutboxDraft::for_transaction(&self.aggregate_type, &transaction, &account)?;
            tx.enqueue_outbox(draft.clone())?;
            events.push(draft);
        }

        info!(
            account = %account_id,
            transaction = %transaction.id,
            kind = %transaction.kind,
            amount = transaction.amount,
            balance = account.balance,
            bonus_balance = account.bonus_balance,
            reserved_balance = account.reserved_balance,
            "ledger entry posted"
        );

        Ok(CommandResult {
            transaction,
            account,
            events,
            replayed: false,
        })
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_positive(amount: Amount) -> Result<Amount, LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(amount)
}

/// Real funds first, the remainder from bonus.
fn split_bet(stake: Amount, balance: Amount) -> BetSplit {
    let real_bet = stake.min(balance.max(0));
    BetSplit {
        real_bet,
        bonus_bet: stake - real_bet,
    }
}

/// Funding-ratio heuristic for a win, see [`Engine::credit_win`].
///
/// The ratio is re-derived from every bet row of the round, so mixed
/// funding across several bets yields an approximation.
fn split_win<T: LedgerTx>(
    tx: &T,
    account: &Account,
    amount: Amount,
    game_round_id: Option<&str>,
) -> Result<WinSplit, LedgerError> {
    if account.bonus_balance > 0 {
        return Ok(WinSplit {
            real_win: 0,
            bonus_win: amount,
        });
    }
    let all_real = WinSplit {
        real_win: amount,
        bonus_win: 0,
    };
    let Some(round) = game_round_id else {
        return Ok(all_real);
    };

    let (mut total_real, mut total_bonus) = (0i128, 0i128);
    for bet in tx.transactions_in_round(account.id, round, TransactionType::Bet)? {
        match bet.bet_split() {
            Some(split) => {
                total_real += i128::from(split.real_bet);
                total_bonus += i128::from(split.bonus_bet);
            }
            None => warn!(
                account = %account.id,
                transaction = %bet.id,
                "bet row has no funding split, ignored for win split"
            ),
        }
    }

    let total = total_real + total_bonus;
    if total_bonus <= 0 || total <= 0 {
        return Ok(all_real);
    }
    let bonus_win = Amount::try_from(i128::from(amount) * total_bonus / total)
        .map_err(|_| LedgerError::Validation("win split overflow".into()))?;
    Ok(WinSplit {
        real_win: amount - bonus_win,
        bonus_win,
    })
}

/// The delta a transaction applied, reconstructed from its amount and metadata.
fn applied_delta(transaction: &Transaction) -> BalanceDelta {
    let amount = transaction.amount;
    match transaction.kind {
        TransactionType::Deposit => BalanceDelta::default().with(BalanceColumn::Balance, amount),
        TransactionType::Withdrawal => BalanceDelta::default()
            .with(BalanceColumn::Balance, amount)
            .with(BalanceColumn::ReservedBalance, -amount),
        TransactionType::Bet => {
            let split = transaction.bet_split().unwrap_or(BetSplit {
                real_bet: -amount,
                bonus_bet: 0,
            });
            BalanceDelta::default()
                .with(BalanceColumn::Balance, -split.real_bet)
                .with(BalanceColumn::BonusBalance, -split.bonus_bet)
        }
        TransactionType::Win => {
            let split = transaction.win_split().unwrap_or(WinSplit {
                real_win: amount,
                bonus_win: 0,
            });
            BalanceDelta::default()
                .with(BalanceColumn::Balance, split.real_win)
                .with(BalanceColumn::BonusBalance, split.bonus_win)
        }
        _ => BalanceDelta::default(),
    }
}
