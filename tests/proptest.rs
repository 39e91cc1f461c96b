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

//! Property-based tests for the ledger engine.
//!
//! These tests verify invariants that should hold for any sequence of
//! commands, whether individual commands succeed or are rejected.

use proptest::prelude::*;
use wallet_ledger::{
    Account, AccountId, BalanceColumn, BalanceDelta, CancelParams, Currency, Engine, EntryParams,
    ErrorKind, ForfeitParams, MemoryStore, Reference, transact,
};

const PLAYER: AccountId = AccountId(1);

// =============================================================================
// Arbitrary Strategies
// =============================================================================

/// Generate a positive amount in minor units.
fn arb_amount() -> impl Strategy<Value = i64> {
    1i64..=100_000i64
}

#[derive(Debug, Clone)]
enum Op {
    Deposit(i64),
    Withdraw(i64),
    CompleteWithdrawal(i64),
    Bonus(i64),
    BonusToReal(i64),
    Forfeit,
    Bet(i64, u8),
    Win(i64, u8),
    /// Cancel the n-th command issued so far.
    Cancel(usize),
}

fn arb_cash_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        arb_amount().prop_map(Op::Deposit),
        arb_amount().prop_map(Op::Withdraw),
        arb_amount().prop_map(Op::CompleteWithdrawal),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => arb_amount().prop_map(Op::Deposit),
        1 => arb_amount().prop_map(Op::Withdraw),
        1 => arb_amount().prop_map(Op::CompleteWithdrawal),
        2 => arb_amount().prop_map(Op::Bonus),
        1 => arb_amount().prop_map(Op::BonusToReal),
        1 => Just(Op::Forfeit),
        3 => (arb_amount(), 0u8..4).prop_map(|(a, r)| Op::Bet(a, r)),
        2 => (arb_amount(), 0u8..4).prop_map(|(a, r)| Op::Win(a, r)),
        1 => (0usize..32).prop_map(Op::Cancel),
    ]
}

fn arb_delta() -> impl Strategy<Value = BalanceDelta> {
    (-1_000i64..=1_000, -1_000i64..=1_000, -1_000i64..=1_000).prop_map(|(b, bb, r)| {
        BalanceDelta::default()
            .with(BalanceColumn::Balance, b)
            .with(BalanceColumn::BonusBalance, bb)
            .with(BalanceColumn::ReservedBalance, r)
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn setup() -> (MemoryStore, Engine) {
    let store = MemoryStore::default();
    store.open_account(PLAYER, Currency::new("EUR")).unwrap();
    (store, Engine::new())
}

/// Applies `op` as the `i`-th command. Returns whether it took effect.
fn run(store: &MemoryStore, engine: &Engine, i: usize, op: &Op) -> bool {
    let key = format!("op-{i}");
    let entry = |amount: i64| EntryParams::new(PLAYER, amount).reference(Reference::external(key.clone()));
    let in_round = |amount: i64, round: u8| {
        EntryParams::new(PLAYER, amount)
            .reference(Reference::external(key.clone()).round(format!("round-{round}")))
    };

    let result = match op {
        Op::Deposit(a) => transact(store, |tx| engine.deposit(tx, entry(*a))),
        Op::Withdraw(a) => transact(store, |tx| engine.withdraw(tx, entry(*a))),
        Op::CompleteWithdrawal(a) => transact(store, |tx| engine.complete_withdrawal(tx, entry(*a))),
        Op::Bonus(a) => transact(store, |tx| engine.bonus_credit(tx, entry(*a))),
        Op::BonusToReal(a) => transact(store, |tx| engine.turn_bonus_to_real(tx, entry(*a))),
        Op::Forfeit => transact(store, |tx| {
            engine.forfeit_bonus(tx, ForfeitParams::all(PLAYER).reference(Reference::external(key.clone())))
        }),
        Op::Bet(a, r) => transact(store, |tx| engine.place_bet(tx, in_round(*a, *r))),
        Op::Win(a, r) => transact(store, |tx| engine.credit_win(tx, in_round(*a, *r))),
        Op::Cancel(n) => {
            let params = CancelParams::new(PLAYER, format!("op-{n}"))
                .reference(Reference::external(key.clone()));
            transact(store, |tx| engine.cancel_transaction(tx, params))
        }
    };

    match result {
        Ok(result) => !result.replayed,
        Err(e) => {
            assert_ne!(e.kind(), ErrorKind::Internal, "{e}");
            false
        }
    }
}

fn assert_non_negative(account: &Account) -> Result<(), TestCaseError> {
    prop_assert!(account.balance >= 0);
    prop_assert!(account.bonus_balance >= 0);
    prop_assert!(account.reserved_balance >= 0);
    Ok(())
}

// =============================================================================
// Conservation
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// balance + reserved tracks deposits minus completed withdrawals, and
    /// reserved tracks withdrawn minus completed.
    #[test]
    fn cash_flows_are_conserved(ops in prop::collection::vec(arb_cash_op(), 1..40)) {
        let (store, engine) = setup();
        let (mut deposited, mut withdrawn, mut completed) = (0i64, 0i64, 0i64);

        for (i, op) in ops.iter().enumerate() {
            if run(&store, &engine, i, op) {
                match op {
                    Op::Deposit(a) => deposited += a,
                    Op::Withdraw(a) => withdrawn += a,
                    Op::CompleteWithdrawal(a) => completed += a,
                    _ => unreachable!(),
                }
            }
        }

        let account = store.account(PLAYER).unwrap();
        prop_assert_eq!(account.balance + account.reserved_balance, deposited - completed);
        prop_assert_eq!(account.reserved_balance, withdrawn - completed);
        assert_non_negative(&account)?;
    }

    /// No mix of commands drives any column negative, and every row's
    /// snapshot matches the balances replayed up to it.
    #[test]
    fn balances_never_negative(ops in prop::collection::vec(arb_op(), 1..40)) {
        let (store, engine) = setup();
        for (i, op) in ops.iter().enumerate() {
            run(&store, &engine, i, op);
            assert_non_negative(&store.account(PLAYER).unwrap())?;
        }

        let account = store.account(PLAYER).unwrap();
        if let Some(last) = store.transactions(PLAYER).last() {
            prop_assert_eq!(last.snapshot.balance, account.balance);
            prop_assert_eq!(last.snapshot.bonus_balance, account.bonus_balance);
            prop_assert_eq!(last.snapshot.reserved_balance, account.reserved_balance);
        }
    }

    /// Re-running the same keyed commands changes nothing.
    #[test]
    fn replaying_a_history_is_a_no_op(ops in prop::collection::vec(arb_op(), 1..30)) {
        let (store, engine) = setup();
        for (i, op) in ops.iter().enumerate() {
            run(&store, &engine, i, op);
        }
        let before = store.account(PLAYER).unwrap();
        let rows = store.transaction_count();
        store.drain_outbox();

        for (i, op) in ops.iter().enumerate() {
            let applied = run(&store, &engine, i, op);
            // Only commands rejected the first time may take effect now.
            if applied {
                return Ok(());
            }
        }

        prop_assert_eq!(store.account(PLAYER).unwrap(), before);
        prop_assert_eq!(store.transaction_count(), rows);
        prop_assert!(store.drain_outbox().is_empty());
    }

    /// One outbox draft per balance-affecting row.
    #[test]
    fn one_draft_per_row(ops in prop::collection::vec(arb_op(), 1..30)) {
        let (store, engine) = setup();
        for (i, op) in ops.iter().enumerate() {
            run(&store, &engine, i, op);
        }
        prop_assert_eq!(store.drain_outbox().len(), store.transaction_count());
    }
}

// =============================================================================
// Balance Delta
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// A delta is applied whole or not at all.
    #[test]
    fn delta_is_atomic(
        start in (0i64..=1_000, 0i64..=1_000, 0i64..=1_000),
        delta in arb_delta(),
    ) {
        let mut account = Account::new(PLAYER, Currency::new("EUR"));
        account.balance = start.0;
        account.bonus_balance = start.1;
        account.reserved_balance = start.2;
        let before = account.clone();

        match account.apply(&delta) {
            Ok(()) => {
                for column in BalanceColumn::ALL {
                    prop_assert_eq!(account.column(column), before.column(column) + delta.get(column));
                }
            }
            Err(e) => {
                prop_assert_eq!(e.kind(), ErrorKind::InsufficientBalance);
                prop_assert_eq!(&account, &before);
            }
        }
        assert_non_negative(&account)?;
    }

    /// Dirty columns are exactly the non-zero ones.
    #[test]
    fn dirty_columns_skip_zero(delta in arb_delta()) {
        let dirty: Vec<_> = delta.dirty_columns().collect();
        prop_assert!(dirty.iter().all(|(_, change)| *change != 0));
        let expected = BalanceColumn::ALL.iter().filter(|c| delta.get(**c) != 0).count();
        prop_assert_eq!(dirty.len(), expected);
        prop_assert_eq!(delta.is_empty(), expected == 0);
    }
}
