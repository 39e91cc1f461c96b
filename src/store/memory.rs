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

//! In-process implementation of the account store.
//!
//! Each account row carries its own lock owner slot and condition variable,
//! giving `SELECT ... FOR UPDATE` semantics: a scope that locks an account
//! keeps it until the scope commits or is dropped, and any other scope
//! asking for the same row waits (up to the configured timeout).
//!
//! Writes are staged inside the [`MemoryTx`] and only published by
//! [`LedgerTx::commit`], so a dropped scope leaves no trace.

use super::log::TransactionLog;
use super::{LedgerStore, LedgerTx};
use crate::LedgerError;
use crate::account::{Account, BalanceDelta};
use crate::base::{AccountId, Currency, TransactionId};
use crate::config::StoreConfig;
use crate::outbox::OutboxDraft;
use crate::transaction::{IdempotencyKey, NewTransaction, Transaction, TransactionType};
use chrono::Utc;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One account row plus its lock.
#[derive(Debug)]
struct AccountRow {
    /// Scope currently holding the row lock.
    owner: Mutex<Option<u64>>,
    released: Condvar,
    /// Committed row contents.
    data: Mutex<Account>,
}

impl AccountRow {
    fn new(account: Account) -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
            data: Mutex::new(account),
        }
    }

    fn acquire(&self, scope: u64, deadline: Instant) -> bool {
        let mut owner = self.owner.lock();
        while owner.is_some() {
            if self.released.wait_until(&mut owner, deadline).timed_out() && owner.is_some() {
                return false;
            }
        }
        *owner = Some(scope);
        true
    }

    fn release(&self, scope: u64) {
        let mut owner = self.owner.lock();
        if *owner == Some(scope) {
            *owner = None;
            self.released.notify_all();
        }
    }
}

/// Thread-safe in-memory account store.
#[derive(Debug)]
pub struct MemoryStore {
    rows: DashMap<AccountId, Arc<AccountRow>>,
    log: TransactionLog,
    /// Committed drafts waiting for the outbox consumer, in commit order.
    outbox: SegQueue<OutboxDraft>,
    next_transaction_id: AtomicU64,
    next_scope: AtomicU64,
    lock_timeout: Duration,
}

impl MemoryStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_lock_timeout(config.lock_timeout())
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            rows: DashMap::new(),
            log: TransactionLog::new(),
            outbox: SegQueue::new(),
            next_transaction_id: AtomicU64::new(1),
            next_scope: AtomicU64::new(1),
            lock_timeout,
        }
    }

    /// Creates an empty account.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Conflict`] if the account already exists.
    pub fn open_account(&self, id: AccountId, currency: Currency) -> Result<Account, LedgerError> {
        match self.rows.entry(id) {
            Entry::Occupied(_) => Err(LedgerError::Conflict(format!("account {id} already exists"))),
            Entry::Vacant(entry) => {
                let account = Account::new(id, currency);
                entry.insert(Arc::new(AccountRow::new(account.clone())));
                debug!(account = %id, currency = %account.currency, "account opened");
                Ok(account)
            }
        }
    }

    /// Last committed state of an account.
    pub fn account(&self, id: AccountId) -> Option<Account> {
        let row = self.row(id)?;
        let data = row.data.lock();
        Some(data.clone())
    }

    /// Committed state of every account, ordered by id.
    pub fn accounts(&self) -> Vec<Account> {
        let rows: Vec<_> = self.rows.iter().map(|row| Arc::clone(row.value())).collect();
        let mut accounts: Vec<_> = rows.iter().map(|row| row.data.lock().clone()).collect();
        accounts.sort_by_key(|account| account.id);
        accounts
    }

    /// Committed transactions of an account in lock-grant order.
    pub fn transactions(&self, id: AccountId) -> Vec<Transaction> {
        self.log
            .for_account(id)
            .into_iter()
            .map(|row| (*row).clone())
            .collect()
    }

    pub fn transaction_count(&self) -> usize {
        self.log.len()
    }

    /// Hands every committed draft to the caller, oldest first.
    pub fn drain_outbox(&self) -> Vec<OutboxDraft> {
        let mut drafts = Vec::with_capacity(self.outbox.len());
        while let Some(draft) = self.outbox.pop() {
            drafts.push(draft);
        }
        drafts
    }

    fn row(&self, id: AccountId) -> Option<Arc<AccountRow>> {
        // Clone out of the shard so no DashMap guard is held while waiting.
        self.rows.get(&id).map(|row| Arc::clone(row.value()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&StoreConfig::default())
    }
}

impl LedgerStore for MemoryStore {
    type Tx<'a> = MemoryTx<'a>;

    fn begin(&self) -> MemoryTx<'_> {
        MemoryTx {
            store: self,
            scope: self.next_scope.fetch_add(1, Ordering::Relaxed),
            held: HashMap::new(),
            staged_accounts: HashMap::new(),
            staged_transactions: Vec::new(),
            staged_outbox: Vec::new(),
        }
    }
}

/// One transactional scope over a [`MemoryStore`].
///
/// Dropping it without calling [`LedgerTx::commit`] rolls back.
#[derive(Debug)]
pub struct MemoryTx<'a> {
    store: &'a MemoryStore,
    scope: u64,
    held: HashMap<AccountId, Arc<AccountRow>>,
    staged_accounts: HashMap<AccountId, Account>,
    staged_transactions: Vec<Transaction>,
    staged_outbox: Vec<OutboxDraft>,
}

impl MemoryTx<'_> {
    /// Rows this scope has written for one account, oldest first.
    fn staged(&self, account_id: AccountId) -> impl Iterator<Item = &Transaction> {
        self.staged_transactions
            .iter()
            .filter(move |row| row.account_id == account_id)
    }

    fn require_lock(&self, account_id: AccountId) -> Result<(), LedgerError> {
        if self.staged_accounts.contains_key(&account_id) {
            Ok(())
        } else {
            Err(LedgerError::Internal(format!(
                "account {account_id} is not locked in this scope"
            )))
        }
    }
}

impl LedgerTx for MemoryTx<'_> {
    fn lock_account(&mut self, account_id: AccountId) -> Result<Account, LedgerError> {
        if let Some(account) = self.staged_accounts.get(&account_id) {
            return Ok(account.clone());
        }

        let row = self
            .store
            .row(account_id)
            .ok_or_else(|| LedgerError::account_not_found(account_id))?;

        let started = Instant::now();
        if !row.acquire(self.scope, started + self.store.lock_timeout) {
            warn!(
                account = %account_id,
                timeout_ms = self.store.lock_timeout.as_millis() as u64,
                "account lock wait timed out"
            );
            return Err(LedgerError::LockTimeout(account_id));
        }
        debug!(
            account = %account_id,
            scope = self.scope,
            waited_us = started.elapsed().as_micros() as u64,
            "account lock granted"
        );

        let account = row.data.lock().clone();
        self.held.insert(account_id, row);
        self.staged_accounts.insert(account_id, account.clone());
        Ok(account)
    }

    fn find_transaction(&self, key: &IdempotencyKey) -> Result<Option<Transaction>, LedgerError> {
        let committed = self
            .store
            .log
            .with_external_id(key.account_id, &key.external_id)
            .into_iter()
            .find(|row| key.matches(&**row))
            .map(|row| (*row).clone());
        Ok(committed.or_else(|| self.staged(key.account_id).find(|row| key.matches(row)).cloned()))
    }

    fn find_target(
        &self,
        account_id: AccountId,
        external_id: &str,
        manufacturer_id: Option<&str>,
    ) -> Result<Option<Transaction>, LedgerError> {
        let is_target = |row: &Transaction| {
            !row.kind.is_cancellation()
                && row.external_id.as_deref() == Some(external_id)
                && row.manufacturer_id.as_deref() == manufacturer_id
        };
        let committed = self
            .store
            .log
            .with_external_id(account_id, external_id)
            .into_iter()
            .find(|row| is_target(&**row))
            .map(|row| (*row).clone());
        Ok(committed.or_else(|| self.staged(account_id).find(|row| is_target(*row)).cloned()))
    }

    fn find_cancellation(
        &self,
        account_id: AccountId,
        target: TransactionId,
    ) -> Result<Option<Transaction>, LedgerError> {
        let committed = self
            .store
            .log
            .cancellation_of(target)
            .filter(|row| row.account_id == account_id)
            .map(|row| (*row).clone());
        Ok(committed.or_else(|| {
            self.staged(account_id)
                .find(|row| {
                    row.kind.is_cancellation() && row.target_transaction_id == Some(target)
                })
                .cloned()
        }))
    }

    fn transactions_in_round(
        &self,
        account_id: AccountId,
        game_round_id: &str,
        kind: TransactionType,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let in_round =
            |row: &Transaction| row.kind == kind && row.game_round_id.as_deref() == Some(game_round_id);
        let mut rows: Vec<Transaction> = self
            .store
            .log
            .in_round(account_id, game_round_id)
            .into_iter()
            .filter(|row| in_round(&**row))
            .map(|row| (*row).clone())
            .collect();
        rows.extend(self.staged(account_id).filter(|row| in_round(*row)).cloned());
        Ok(rows)
    }

    fn update_balances(
        &mut self,
        account_id: AccountId,
        delta: &BalanceDelta,
    ) -> Result<Account, LedgerError> {
        self.require_lock(account_id)?;
        let account = self
            .staged_accounts
            .get_mut(&account_id)
            .ok_or_else(|| LedgerError::account_not_found(account_id))?;
        account.apply(delta)?;
        Ok(account.clone())
    }

    fn insert_transaction(&mut self, new: NewTransaction) -> Result<Transaction, LedgerError> {
        self.require_lock(new.account_id)?;
        let id = TransactionId(self.store.next_transaction_id.fetch_add(1, Ordering::Relaxed));
        let transaction = new.into_transaction(id, Utc::now());
        self.staged_transactions.push(transaction.clone());
        Ok(transaction)
    }

    fn enqueue_outbox(&mut self, draft: OutboxDraft) -> Result<(), LedgerError> {
        self.staged_outbox.push(draft);
        Ok(())
    }

    fn commit(mut self) -> Result<(), LedgerError> {
        for (account_id, account) in self.staged_accounts.drain() {
            let row = self.held.get(&account_id).ok_or_else(|| {
                LedgerError::Internal(format!("account {account_id} lost its lock"))
            })?;
            *row.data.lock() = account;
        }
        for transaction in self.staged_transactions.drain(..) {
            self.store.log.append(transaction);
        }
        for draft in self.staged_outbox.drain(..) {
            self.store.outbox.push(draft);
        }
        // Locks are released by Drop.
        debug!(scope = self.scope, "scope committed");
        Ok(())
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if !self.staged_transactions.is_empty() || !self.staged_outbox.is_empty() {
            debug!(
                scope = self.scope,
                discarded = self.staged_transactions.len(),
                "scope rolled back"
            );
        }
        for row in self.held.values() {
            row.release(self.scope);
        }
    }
}
