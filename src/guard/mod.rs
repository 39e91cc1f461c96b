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

//! Admission guards consulted before a privileged or expensive action.
//!
//! Each guard is an independent, mutex-protected state machine keyed by an
//! arbitrary string. Guard denials are values, not errors: the caller
//! decides whether to answer with a 429/503-style response or fall back.
//!
//! The in-memory implementations here are process-local. The [`Guard`],
//! [`FailureTracker`] and [`DuplicateGuard`] traits are the seam for a
//! shared backend when several instances must agree.

mod circuit_breaker;
mod idempotency;
mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use idempotency::IdempotencyGuard;
pub use rate_limiter::RateLimiter;

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Outcome of a guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardResult {
    pub allowed: bool,
    pub reason: String,
    /// Name of the guard that denied, `None` when allowed.
    pub guard: Option<&'static str>,
}

impl GuardResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "allowed".to_owned(),
            guard: None,
        }
    }

    pub fn deny(guard: &'static str, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            guard: Some(guard),
        }
    }
}

impl fmt::Display for GuardResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.guard {
            Some(guard) => write!(f, "denied by {guard}: {}", self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

/// An admission check keyed by string.
pub trait Guard: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, key: &str) -> GuardResult;
}

/// A guard that learns from the outcome of the guarded action.
pub trait FailureTracker: Guard {
    fn record_success(&self, key: &str);

    fn record_failure(&self, key: &str);

    /// Returns a slot taken by a `check` whose action never ran.
    fn release(&self, key: &str);
}

/// A guard that remembers keys and can forget one for an explicit retry.
pub trait DuplicateGuard: Guard {
    fn remove(&self, key: &str);
}

/// Time source for the time-dependent guards.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}
