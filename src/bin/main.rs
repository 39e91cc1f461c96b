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

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use wallet_ledger::{
    AccountId, Amount, CancelParams, CommandResult, Currency, Engine, EntryParams, ForfeitParams,
    LedgerConfig, LedgerError, MemoryStore, Reference, transact,
};

/// Wallet Ledger - Replay ledger commands from a CSV file
///
/// Reads ledger commands from a CSV file, applies each one in its own
/// store transaction and writes the resulting account balances to stdout.
#[derive(Parser, Debug)]
#[command(name = "wallet-ledger")]
#[command(about = "Replays wallet ledger commands from a CSV file", long_about = None)]
struct Args {
    /// Path to CSV file with commands
    ///
    /// Expected format: command,account,amount,external_id,round,target,currency
    /// Example: cargo run -- commands.csv > accounts.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// JSON configuration file
    #[arg(long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Write the outbox drafts as JSON lines to this file
    #[arg(long, value_name = "EVENTS")]
    events: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match LedgerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config '{}': {}", path.display(), e);
                process::exit(1);
            }
        },
        None => LedgerConfig::default(),
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let store = MemoryStore::new(&config.store);
    let engine = Engine::with_config(&config.outbox);
    if let Err(e) = replay_commands(&engine, &store, BufReader::new(file)) {
        eprintln!("Error processing commands: {}", e);
        process::exit(1);
    }

    if let Some(path) = &args.events {
        if let Err(e) = write_events(&store, path) {
            eprintln!("Error writing events '{}': {}", path.display(), e);
            process::exit(1);
        }
    }

    if let Err(e) = write_accounts(&store, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record.
///
/// Fields: `command, account, amount, external_id, round, target, currency`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    command: String,
    account: u64,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Amount>,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    round: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    currency: Option<String>,
}

/// Outcome of one replayed row.
#[derive(Debug)]
enum Applied {
    Opened,
    Command(Box<CommandResult>),
}

impl CsvRecord {
    fn reference(&self) -> Reference {
        Reference {
            external_id: self.external_id.clone().filter(|id| !id.is_empty()),
            game_round_id: self.round.clone().filter(|id| !id.is_empty()),
            ..Reference::default()
        }
    }

    fn entry(&self) -> Result<EntryParams, LedgerError> {
        let amount = self
            .amount
            .ok_or_else(|| LedgerError::Validation("missing amount".into()))?;
        Ok(EntryParams::new(AccountId(self.account), amount).reference(self.reference()))
    }

    fn apply(&self, engine: &Engine, store: &MemoryStore) -> Result<Applied, LedgerError> {
        let account_id = AccountId(self.account);
        let command = self.command.to_lowercase();
        let result = match command.as_str() {
            "open" => {
                let currency = self.currency.as_deref().unwrap_or("EUR");
                store.open_account(account_id, Currency::new(currency))?;
                return Ok(Applied::Opened);
            }
            "deposit" => {
                let params = self.entry()?;
                transact(store, |tx| engine.deposit(tx, params))?
            }
            "withdraw" => {
                let params = self.entry()?;
                transact(store, |tx| engine.withdraw(tx, params))?
            }
            "complete_withdrawal" => {
                let params = self.entry()?;
                transact(store, |tx| engine.complete_withdrawal(tx, params))?
            }
            "bet" => {
                let params = self.entry()?;
                transact(store, |tx| engine.place_bet(tx, params))?
            }
            "win" => {
                let params = self.entry()?;
                transact(store, |tx| engine.credit_win(tx, params))?
            }
            "loss" => {
                let params = self.entry()?;
                transact(store, |tx| engine.settle_loss(tx, params))?
            }
            "bonus" => {
                let params = self.entry()?;
                transact(store, |tx| engine.bonus_credit(tx, params))?
            }
            "bonus_to_real" => {
                let params = self.entry()?;
                transact(store, |tx| engine.turn_bonus_to_real(tx, params))?
            }
            "forfeit" => {
                let mut params = ForfeitParams::all(account_id).reference(self.reference());
                params.amount = self.amount;
                transact(store, |tx| engine.forfeit_bonus(tx, params))?
            }
            "cancel" => {
                let target = self
                    .target
                    .clone()
                    .ok_or_else(|| LedgerError::Validation("missing target".into()))?;
                let params = CancelParams::new(account_id, target).reference(self.reference());
                transact(store, |tx| engine.cancel_transaction(tx, params))?
            }
            other => {
                return Err(LedgerError::Validation(format!("unknown command {other}")));
            }
        };
        Ok(Applied::Command(Box::new(result)))
    }
}

/// Replays commands from a CSV reader against `store`.
///
/// Rows are streamed; malformed rows and rejected commands are logged and
/// skipped, each command's scope being rolled back on failure.
///
/// # CSV Format
///
/// Expected columns: `command, account, amount, external_id, round, target, currency`
/// - `command`: open, deposit, withdraw, complete_withdrawal, bet, win, loss,
///   bonus, bonus_to_real, forfeit, cancel
/// - `account`: Account ID (u64)
/// - `amount`: Minor units (optional for open, cancel and forfeit)
/// - `external_id`: Idempotency key (optional)
/// - `round`: Game round id (optional)
/// - `target`: External id of the transaction to cancel
/// - `currency`: Currency for `open` (defaults to EUR)
///
/// # Example
///
/// ```csv
/// command,account,amount,external_id,round,target,currency
/// open,1,,,,,EUR
/// deposit,1,5000,psp-1,,,
/// bet,1,1500,bet-1,r-1,,
/// ```
///
/// # Errors
///
/// Returns a CSV error only if the reader itself fails.
fn replay_commands<R: Read>(
    engine: &Engine,
    store: &MemoryStore,
    reader: R,
) -> Result<(), csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (line, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                if e.is_io_error() {
                    return Err(e);
                }
                warn!(line = line + 2, error = %e, "skipping malformed row");
                continue;
            }
        };

        match record.apply(engine, store) {
            Ok(Applied::Command(result)) if result.replayed => {
                debug!(line = line + 2, transaction = %result.transaction.id, "replayed");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    line = line + 2,
                    command = %record.command,
                    account = record.account,
                    error = %e,
                    "skipping rejected command"
                );
            }
        }
    }

    Ok(())
}

/// Account balances as written to the output CSV.
#[derive(Debug, Serialize)]
struct AccountRow {
    account: u64,
    currency: String,
    balance: Amount,
    bonus_balance: Amount,
    reserved_balance: Amount,
}

/// Write account states to a CSV writer, ordered by account id.
///
/// # CSV Format
///
/// Columns: `account, currency, balance, bonus_balance, reserved_balance`
fn write_accounts<W: Write>(store: &MemoryStore, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for account in store.accounts() {
        wtr.serialize(AccountRow {
            account: account.id.0,
            currency: account.currency.to_string(),
            balance: account.balance,
            bonus_balance: account.bonus_balance,
            reserved_balance: account.reserved_balance,
        })?;
    }

    wtr.flush()?;
    Ok(())
}

/// Drain the outbox into a JSON-lines file.
fn write_events(store: &MemoryStore, path: &Path) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for draft in store.drain_outbox() {
        serde_json::to_writer(&mut out, &draft)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn replay(csv: &str) -> MemoryStore {
        let store = MemoryStore::default();
        replay_commands(&Engine::new(), &store, Cursor::new(csv)).unwrap();
        store
    }

    #[test]
    fn replays_deposit_and_bet() {
        let store = replay(
            "command,account,amount,external_id,round,target,currency\n\
             open,1,,,,,EUR\n\
             deposit,1,5000,psp-1,,,\n\
             bet,1,1500,bet-1,r-1,,\n",
        );

        let account = store.account(AccountId(1)).unwrap();
        assert_eq!(account.balance, 3500);
        assert_eq!(store.transactions(AccountId(1)).len(), 2);
    }

    #[test]
    fn duplicate_rows_apply_once() {
        let store = replay(
            "command,account,amount,external_id,round,target,currency\n\
             open,1,,,,,EUR\n\
             deposit,1,5000,psp-1,,,\n\
             deposit,1,5000,psp-1,,,\n",
        );

        assert_eq!(store.account(AccountId(1)).unwrap().balance, 5000);
    }

    #[test]
    fn rejected_and_malformed_rows_are_skipped() {
        let store = replay(
            "command,account,amount,external_id,round,target,currency\n\
             open,1,,,,,EUR\n\
             withdraw,1,100,w-1,,,\n\
             deposit,not-a-number,5,,,,\n\
             teleport,1,5,,,,\n\
             deposit,1,700,,,,\n",
        );

        let account = store.account(AccountId(1)).unwrap();
        assert_eq!(account.balance, 700);
        assert_eq!(account.reserved_balance, 0);
    }

    #[test]
    fn cancel_reverses_target() {
        let store = replay(
            "command,account,amount,external_id,round,target,currency\n\
             open,1,,,,,EUR\n\
             deposit,1,5000,psp-1,,,\n\
             cancel,1,,c-1,,psp-1,\n",
        );

        assert_eq!(store.account(AccountId(1)).unwrap().balance, 0);
    }

    #[test]
    fn writes_accounts_sorted_by_id() {
        let store = replay(
            "command,account,amount,external_id,round,target,currency\n\
             open,2,,,,,usd\n\
             open,1,,,,,EUR\n\
             deposit,2,250,,,,\n",
        );

        let mut output = Vec::new();
        write_accounts(&store, &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();

        assert_eq!(
            output,
            "account,currency,balance,bonus_balance,reserved_balance\n\
             1,EUR,0,0,0\n\
             2,USD,250,0,0\n"
        );
    }
}
