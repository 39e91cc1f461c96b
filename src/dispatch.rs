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

//! Guarded plugin dispatch.
//!
//! A [`DispatchService`] owns one of each guard and evaluates them in a
//! fixed order before letting a plugin action run:
//!
//! 1. rate limit on `plugin:account`,
//! 2. circuit breaker on the plugin,
//! 3. idempotency on the caller's key.
//!
//! The first denial is returned as is and nothing is persisted. An admitted
//! request is recorded as pending, the action runs, the record is finished,
//! and the circuit breaker hears about the outcome.

use crate::base::AccountId;
use crate::config::GuardConfig;
use crate::guard::{
    CircuitBreaker, Clock, DuplicateGuard, FailureTracker, Guard, GuardResult, IdempotencyGuard,
    RateLimiter,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch record {0} not found")]
    RecordNotFound(u64),

    #[error("dispatch log failure: {0}")]
    Log(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub plugin_id: String,
    pub account_id: AccountId,
    pub action: String,
    /// Empty opts out of duplicate suppression.
    pub idempotency_key: String,
    pub payload: serde_json::Value,
}

impl DispatchRequest {
    pub fn new(plugin_id: impl Into<String>, account_id: AccountId, action: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            account_id,
            action: action.into(),
            idempotency_key: String::new(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    fn rate_limit_key(&self) -> String {
        format!("{}:{}", self.plugin_id, self.account_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Persisted record of one admitted dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub id: u64,
    pub plugin_id: String,
    pub account_id: AccountId,
    pub action: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub status: DispatchStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Persistence for dispatch records.
pub trait DispatchLog: Send + Sync {
    /// Stores a new pending record for an admitted request.
    fn record(&self, request: &DispatchRequest) -> Result<DispatchRecord, DispatchError>;

    /// Moves a pending record to its final status.
    fn finish(
        &self,
        id: u64,
        status: DispatchStatus,
        error: Option<String>,
    ) -> Result<DispatchRecord, DispatchError>;
}

#[derive(Debug, Default)]
pub struct MemoryDispatchLog {
    records: Mutex<Vec<DispatchRecord>>,
}

impl MemoryDispatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records.lock().clone()
    }
}

impl DispatchLog for MemoryDispatchLog {
    fn record(&self, request: &DispatchRequest) -> Result<DispatchRecord, DispatchError> {
        let mut records = self.records.lock();
        let record = DispatchRecord {
            id: records.len() as u64 + 1,
            plugin_id: request.plugin_id.clone(),
            account_id: request.account_id,
            action: request.action.clone(),
            idempotency_key: request.idempotency_key.clone(),
            payload: request.payload.clone(),
            status: DispatchStatus::Pending,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        records.push(record.clone());
        Ok(record)
    }

    fn finish(
        &self,
        id: u64,
        status: DispatchStatus,
        error: Option<String>,
    ) -> Result<DispatchRecord, DispatchError> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(DispatchError::RecordNotFound(id))?;
        record.status = status;
        record.error = error;
        record.finished_at = Some(Utc::now());
        Ok(record.clone())
    }
}

/// The three guards, evaluated in a fixed order.
pub struct GuardChain {
    rate_limiter: Box<dyn Guard>,
    circuit_breaker: Box<dyn FailureTracker>,
    idempotency: Box<dyn DuplicateGuard>,
}

impl GuardChain {
    pub fn new(
        rate_limiter: Box<dyn Guard>,
        circuit_breaker: Box<dyn FailureTracker>,
        idempotency: Box<dyn DuplicateGuard>,
    ) -> Self {
        Self {
            rate_limiter,
            circuit_breaker,
            idempotency,
        }
    }

    /// In-memory guards built from configuration.
    pub fn from_config(config: &GuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Box::new(RateLimiter::from_config(&config.rate_limit, Arc::clone(&clock))),
            Box::new(CircuitBreaker::from_config(&config.circuit_breaker, clock)),
            Box::new(IdempotencyGuard::new()),
        )
    }

    /// Returns the first denial, or an allow once every guard has passed.
    ///
    /// A denial after the circuit breaker admitted the request gives its
    /// probe slot back, since no outcome will ever be recorded for it.
    pub fn evaluate(&self, request: &DispatchRequest) -> GuardResult {
        let result = self.rate_limiter.check(&request.rate_limit_key());
        if !result.allowed {
            return result;
        }
        let result = self.circuit_breaker.check(&request.plugin_id);
        if !result.allowed {
            return result;
        }
        let result = self.idempotency.check(&request.idempotency_key);
        if !result.allowed {
            self.circuit_breaker.release(&request.plugin_id);
        }
        result
    }

    /// Undoes the admission of a request that will not run.
    fn abandon(&self, request: &DispatchRequest) {
        self.circuit_breaker.release(&request.plugin_id);
        self.idempotency.remove(&request.idempotency_key);
    }
}

impl fmt::Debug for GuardChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardChain")
            .field("rate_limiter", &self.rate_limiter.name())
            .field("circuit_breaker", &self.circuit_breaker.name())
            .field("idempotency", &self.idempotency.name())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome<T> {
    /// A guard refused; nothing was recorded or attempted.
    Denied(GuardResult),
    Completed { record: DispatchRecord, output: T },
    Failed { record: DispatchRecord, error: String },
}

impl<T> DispatchOutcome<T> {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }
}

#[derive(Debug)]
pub struct DispatchService<L: DispatchLog = MemoryDispatchLog> {
    guards: GuardChain,
    log: L,
}

impl<L: DispatchLog> DispatchService<L> {
    pub fn new(guards: GuardChain, log: L) -> Self {
        Self { guards, log }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Runs `action` if every guard admits `request`.
    ///
    /// A failed action releases the idempotency key so the same request
    /// may be retried.
    ///
    /// # Errors
    ///
    /// Only dispatch log failures are errors; denials and action failures
    /// are reported through [`DispatchOutcome`].
    pub fn dispatch<T, E, F>(
        &self,
        request: DispatchRequest,
        action: F,
    ) -> Result<DispatchOutcome<T>, DispatchError>
    where
        E: fmt::Display,
        F: FnOnce(&DispatchRecord) -> Result<T, E>,
    {
        let verdict = self.guards.evaluate(&request);
        if !verdict.allowed {
            warn!(
                plugin = %request.plugin_id,
                account = %request.account_id,
                action = %request.action,
                guard = verdict.guard.unwrap_or_default(),
                reason = %verdict.reason,
                "dispatch denied"
            );
            return Ok(DispatchOutcome::Denied(verdict));
        }

        let record = match self.log.record(&request) {
            Ok(record) => record,
            Err(err) => {
                self.guards.abandon(&request);
                return Err(err);
            }
        };

        match action(&record) {
            Ok(output) => {
                self.guards.circuit_breaker.record_success(&request.plugin_id);
                let record = self.log.finish(record.id, DispatchStatus::Succeeded, None)?;
                info!(
                    plugin = %record.plugin_id,
                    account = %record.account_id,
                    action = %record.action,
                    dispatch = record.id,
                    "dispatch succeeded"
                );
                Ok(DispatchOutcome::Completed { record, output })
            }
            Err(err) => {
                let error = err.to_string();
                self.guards.circuit_breaker.record_failure(&request.plugin_id);
                self.guards.idempotency.remove(&request.idempotency_key);
                let record =
                    self.log
                        .finish(record.id, DispatchStatus::Failed, Some(error.clone()))?;
                warn!(
                    plugin = %record.plugin_id,
                    account = %record.account_id,
                    action = %record.action,
                    dispatch = record.id,
                    error = %error,
                    "dispatch failed"
                );
                Ok(DispatchOutcome::Failed { record, error })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::ManualClock;
    use std::time::Duration;

    fn guards(limit: usize, threshold: u32, clock: Arc<dyn Clock>) -> GuardChain {
        GuardChain::new(
            Box::new(RateLimiter::with_clock(limit, Duration::from_secs(60), clock.clone())),
            Box::new(CircuitBreaker::with_clock(
                threshold,
                Duration::from_secs(30),
                1,
                clock,
            )),
            Box::new(IdempotencyGuard::new()),
        )
    }

    fn service(limit: usize, threshold: u32) -> DispatchService {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        DispatchService::new(guards(limit, threshold, clock), MemoryDispatchLog::new())
    }

    #[derive(Debug)]
    struct UnavailableLog;

    impl DispatchLog for UnavailableLog {
        fn record(&self, _: &DispatchRequest) -> Result<DispatchRecord, DispatchError> {
            Err(DispatchError::Log("unavailable".into()))
        }

        fn finish(
            &self,
            id: u64,
            _: DispatchStatus,
            _: Option<String>,
        ) -> Result<DispatchRecord, DispatchError> {
            Err(DispatchError::RecordNotFound(id))
        }
    }

    fn request(key: &str) -> DispatchRequest {
        DispatchRequest::new("cashback", AccountId(1), "credit").idempotency_key(key)
    }

    #[test]
    fn admitted_dispatch_is_recorded_as_succeeded() {
        let service = service(10, 3);
        let outcome = service
            .dispatch(request("r-1"), |record| Ok::<_, String>(record.id))
            .unwrap();

        match outcome {
            DispatchOutcome::Completed { record, output } => {
                assert_eq!(output, 1);
                assert_eq!(record.status, DispatchStatus::Succeeded);
                assert!(record.finished_at.is_some());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn denial_short_circuits_before_persistence() {
        let service = service(1, 3);
        service
            .dispatch(request("r-1"), |_| Ok::<_, String>(()))
            .unwrap();

        let outcome = service
            .dispatch(request("r-2"), |_| -> Result<(), String> {
                panic!("action must not run")
            })
            .unwrap();

        match outcome {
            DispatchOutcome::Denied(result) => assert_eq!(result.guard, Some(RateLimiter::NAME)),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(service.log().records().len(), 1);
    }

    #[test]
    fn duplicate_key_is_denied_by_idempotency() {
        let service = service(10, 3);
        service
            .dispatch(request("r-1"), |_| Ok::<_, String>(()))
            .unwrap();
        let outcome = service
            .dispatch(request("r-1"), |_| Ok::<_, String>(()))
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Denied(GuardResult::deny(
                IdempotencyGuard::NAME,
                "duplicate request r-1"
            ))
        );
    }

    #[test]
    fn failed_action_frees_key_and_counts_against_breaker() {
        let service = service(10, 1);
        let outcome = service
            .dispatch(request("r-1"), |_| Err::<(), _>("upstream down"))
            .unwrap();
        match outcome {
            DispatchOutcome::Failed { record, error } => {
                assert_eq!(error, "upstream down");
                assert_eq!(record.status, DispatchStatus::Failed);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let retry = service
            .dispatch(request("r-1"), |_| Ok::<_, String>(()))
            .unwrap();
        match retry {
            DispatchOutcome::Denied(result) => {
                assert_eq!(result.guard, Some(CircuitBreaker::NAME))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn log_failure_gives_back_half_open_slot_and_key() {
        let clock = Arc::new(ManualClock::new());
        let chain = guards(10, 1, clock.clone());
        chain.circuit_breaker.record_failure("cashback");
        clock.advance(Duration::from_secs(30));
        let service = DispatchService::new(chain, UnavailableLog);

        for _ in 0..3 {
            let result = service.dispatch(request("r-1"), |_| -> Result<(), String> {
                panic!("action must not run")
            });
            assert_eq!(result, Err(DispatchError::Log("unavailable".into())));
        }
    }
}
