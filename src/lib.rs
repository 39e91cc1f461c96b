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

//! # Wallet Ledger
//!
//! This library provides the ledger engine behind a player wallet: the
//! commands that move real, bonus and reserved funds in response to
//! deposits, bets, wins, withdrawals and bonus conversions, plus the
//! admission guards that protect dispatch paths.
//!
//! ## Core Components
//!
//! - [`Engine`]: Ledger commands (deposit, withdraw, place bet, credit win, ...)
//! - [`LedgerStore`] / [`LedgerTx`]: Transactional account store with row locks
//! - [`MemoryStore`]: In-process store implementation
//! - [`Transaction`]: Immutable, append-only ledger row
//! - [`OutboxDraft`]: Event emitted in the same scope as each balance change
//! - [`RateLimiter`], [`CircuitBreaker`], [`IdempotencyGuard`]: Admission guards
//! - [`DispatchService`]: Guard chain in front of plugin actions
//!
//! ## Example
//!
//! ```
//! use wallet_ledger::{AccountId, Currency, Engine, EntryParams, MemoryStore, Reference, transact};
//!
//! let store = MemoryStore::default();
//! store.open_account(AccountId(1), Currency::new("EUR")).unwrap();
//! let engine = Engine::new();
//!
//! let deposit = EntryParams::new(AccountId(1), 5000).reference(Reference::external("psp-1"));
//! let first = transact(&store, |tx| engine.deposit(tx, deposit.clone())).unwrap();
//! let again = transact(&store, |tx| engine.deposit(tx, deposit.clone())).unwrap();
//!
//! assert!(again.replayed);
//! assert_eq!(first.transaction.id, again.transaction.id);
//! assert_eq!(store.account(AccountId(1)).unwrap().balance, 5000);
//! ```
//!
//! ## Concurrency
//!
//! Commands on the same account serialize on the account's row lock, taken
//! at the start of every command and held until the caller's scope commits
//! or rolls back. Commands on different accounts run in parallel.

pub mod account;
mod base;
mod command;
pub mod config;
pub mod dispatch;
mod engine;
pub mod error;
pub mod guard;
mod outbox;
pub mod posting;
pub mod store;
mod transaction;

pub use account::{Account, BalanceColumn, BalanceDelta};
pub use base::{AccountId, Amount, Currency, TransactionId};
pub use command::{CancelParams, CommandResult, EntryParams, ForfeitParams, ForfeitReason};
pub use config::LedgerConfig;
pub use dispatch::{
    DispatchLog, DispatchOutcome, DispatchRecord, DispatchRequest, DispatchService,
    DispatchStatus, GuardChain, MemoryDispatchLog,
};
pub use engine::Engine;
pub use error::{ErrorKind, LedgerError};
pub use guard::{CircuitBreaker, CircuitState, GuardResult, IdempotencyGuard, RateLimiter};
pub use outbox::OutboxDraft;
pub use store::{LedgerStore, LedgerTx, MemoryStore, MemoryTx, transact};
pub use transaction::{
    BalanceSnapshot, BetSplit, IdempotencyKey, Reference, Transaction, TransactionType, WinSplit,
};
