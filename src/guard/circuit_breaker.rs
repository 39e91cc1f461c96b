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

//! Per-key circuit breaker.
//!
//! ```text
//!  Closed ──failures >= threshold──► Open ──reset_timeout elapsed──► HalfOpen
//!    ▲                                 ▲                               │
//!    │                                 └────────── failure ────────────┤
//!    └──────────────── half_open_max successes ────────────────────────┘
//! ```

use super::{Clock, FailureTracker, Guard, GuardResult, SystemClock};
use crate::config::CircuitBreakerConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct Circuit {
    state: CircuitState,
    /// Cumulative; only cleared by a success while closed or by closing.
    failures: u32,
    probes: u32,
    probe_successes: u32,
    last_failure: Option<Instant>,
}

impl Circuit {
    fn close(&mut self) {
        *self = Circuit::default();
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max: u32,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub const NAME: &'static str = "circuit_breaker";

    pub fn new(failure_threshold: u32, reset_timeout: Duration, half_open_max: u32) -> Self {
        Self::with_clock(
            failure_threshold,
            reset_timeout,
            half_open_max,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        failure_threshold: u32,
        reset_timeout: Duration,
        half_open_max: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            half_open_max,
            clock,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(
            config.failure_threshold,
            config.reset_timeout(),
            config.half_open_max,
            clock,
        )
    }

    pub fn check(&self, key: &str) -> GuardResult {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(key) else {
            return GuardResult::allow();
        };

        if circuit.state == CircuitState::Open {
            let cooled_down = circuit
                .last_failure
                .is_none_or(|at| now.saturating_duration_since(at) >= self.reset_timeout);
            if !cooled_down {
                return GuardResult::deny(Self::NAME, format!("circuit open for {key}"));
            }
            info!(key, "circuit half-open");
            circuit.state = CircuitState::HalfOpen;
            circuit.probes = 0;
            circuit.probe_successes = 0;
        }

        if circuit.state == CircuitState::HalfOpen {
            if circuit.probes >= self.half_open_max {
                return GuardResult::deny(
                    Self::NAME,
                    format!("circuit half-open for {key}, probe quota used"),
                );
            }
            circuit.probes += 1;
        }
        GuardResult::allow()
    }

    pub fn record_success(&self, key: &str) {
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(key) else {
            return;
        };
        match circuit.state {
            CircuitState::Closed => circuit.failures = 0,
            CircuitState::HalfOpen => {
                circuit.probe_successes += 1;
                if circuit.probe_successes >= self.half_open_max {
                    info!(key, "circuit closed");
                    circuit.close();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, key: &str) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(key.to_owned()).or_default();
        circuit.failures = circuit.failures.saturating_add(1);
        circuit.last_failure = Some(now);
        if circuit.failures >= self.failure_threshold {
            if circuit.state != CircuitState::Open {
                warn!(key, failures = circuit.failures, "circuit opened");
            }
            circuit.state = CircuitState::Open;
            circuit.probes = 0;
            circuit.probe_successes = 0;
        }
    }

    /// Hands back a half-open probe slot taken by an admitted check that
    /// never reached the guarded action.
    pub fn release(&self, key: &str) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(key)
            && circuit.state == CircuitState::HalfOpen
        {
            circuit.probes = circuit.probes.saturating_sub(1);
        }
    }

    /// Current state without consuming a half-open probe.
    pub fn state(&self, key: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(key)
            .map(|circuit| circuit.state)
            .unwrap_or_default()
    }
}

impl Guard for CircuitBreaker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn check(&self, key: &str) -> GuardResult {
        CircuitBreaker::check(self, key)
    }
}

impl FailureTracker for CircuitBreaker {
    fn record_success(&self, key: &str) {
        CircuitBreaker::record_success(self, key);
    }

    fn record_failure(&self, key: &str) {
        CircuitBreaker::record_failure(self, key);
    }

    fn release(&self, key: &str) {
        CircuitBreaker::release(self, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::ManualClock;

    fn breaker(threshold: u32, half_open_max: u32) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker =
            CircuitBreaker::with_clock(threshold, Duration::from_secs(30), half_open_max, clock.clone());
        (breaker, clock)
    }

    #[test]
    fn unknown_key_is_closed() {
        let (breaker, _) = breaker(2, 1);
        assert!(breaker.check("psp").allowed);
        assert_eq!(breaker.state("psp"), CircuitState::Closed);
    }

    #[test]
    fn opens_at_threshold() {
        let (breaker, _) = breaker(2, 1);
        breaker.record_failure("psp");
        assert!(breaker.check("psp").allowed);
        breaker.record_failure("psp");

        let denied = breaker.check("psp");
        assert!(!denied.allowed);
        assert_eq!(denied.guard, Some(CircuitBreaker::NAME));
        assert_eq!(breaker.state("psp"), CircuitState::Open);
    }

    #[test]
    fn half_open_allows_one_probe_then_denies() {
        let (breaker, clock) = breaker(2, 1);
        breaker.record_failure("psp");
        breaker.record_failure("psp");

        clock.advance(Duration::from_secs(30));
        assert!(breaker.check("psp").allowed);
        assert_eq!(breaker.state("psp"), CircuitState::HalfOpen);
        assert!(!breaker.check("psp").allowed);
    }

    #[test]
    fn probe_successes_close_the_circuit() {
        let (breaker, clock) = breaker(1, 2);
        breaker.record_failure("psp");
        clock.advance(Duration::from_secs(31));

        assert!(breaker.check("psp").allowed);
        breaker.record_success("psp");
        assert_eq!(breaker.state("psp"), CircuitState::HalfOpen);
        assert!(breaker.check("psp").allowed);
        breaker.record_success("psp");

        assert_eq!(breaker.state("psp"), CircuitState::Closed);
        breaker.record_failure("psp");
        assert_eq!(breaker.state("psp"), CircuitState::Open);
    }

    #[test]
    fn probe_failure_reopens() {
        let (breaker, clock) = breaker(2, 1);
        breaker.record_failure("psp");
        breaker.record_failure("psp");
        clock.advance(Duration::from_secs(30));
        assert!(breaker.check("psp").allowed);

        breaker.record_failure("psp");
        assert_eq!(breaker.state("psp"), CircuitState::Open);
        assert!(!breaker.check("psp").allowed);
    }

    #[test]
    fn released_slot_can_be_taken_again() {
        let (breaker, clock) = breaker(1, 1);
        breaker.record_failure("psp");
        clock.advance(Duration::from_secs(30));

        assert!(breaker.check("psp").allowed);
        assert!(!breaker.check("psp").allowed);
        breaker.release("psp");
        assert!(breaker.check("psp").allowed);
        assert_eq!(breaker.state("psp"), CircuitState::HalfOpen);
    }

    #[test]
    fn release_outside_half_open_is_ignored() {
        let (breaker, _) = breaker(1, 1);
        breaker.release("psp");
        breaker.record_failure("psp");
        breaker.release("psp");
        assert_eq!(breaker.state("psp"), CircuitState::Open);
        assert!(!breaker.check("psp").allowed);
    }

    #[test]
    fn success_while_closed_resets_failures() {
        let (breaker, _) = breaker(2, 1);
        breaker.record_failure("psp");
        breaker.record_success("psp");
        breaker.record_failure("psp");
        assert_eq!(breaker.state("psp"), CircuitState::Closed);
    }

    #[test]
    fn keys_trip_independently() {
        let (breaker, _) = breaker(1, 1);
        breaker.record_failure("a");
        assert!(!breaker.check("a").allowed);
        assert!(breaker.check("b").allowed);
    }
}
