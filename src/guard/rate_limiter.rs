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

//! Sliding-window rate limiter.

use super::{Clock, Guard, GuardResult, SystemClock};
use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Number of checks between sweeps of idle keys.
const PURGE_INTERVAL: u64 = 1024;

/// Allows at most `limit` checks per key within any `window`.
///
/// Windows are created lazily per key and hold the instants of the
/// admitted checks only; denied checks are not recorded. Every
/// `PURGE_INTERVAL` checks the map is swept for keys whose windows have
/// emptied, so idle keys do not accumulate.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub const NAME: &'static str = "rate_limiter";

    pub fn new(limit: usize, window: Duration) -> Self {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    pub fn with_clock(limit: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            window,
            clock,
            windows: Mutex::new(HashMap::new()),
            checks: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(config.limit, config.window(), clock)
    }

    pub fn check(&self, key: &str) -> GuardResult {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        if self.checks.fetch_add(1, Ordering::Relaxed) % PURGE_INTERVAL == PURGE_INTERVAL - 1 {
            let purged = Self::purge(&mut windows, now, self.window);
            if purged > 0 {
                debug!(purged, remaining = windows.len(), "idle rate limit keys purged");
            }
        }
        let hits = windows.entry(key.to_owned()).or_default();
        Self::prune(hits, now, self.window);

        if hits.len() >= self.limit {
            return GuardResult::deny(
                Self::NAME,
                format!("{} requests within {:?}", hits.len(), self.window),
            );
        }
        hits.push_back(now);
        GuardResult::allow()
    }

    /// Drops keys whose windows have fully expired. Returns how many were dropped.
    ///
    /// `check` already does this periodically; call it directly to reclaim
    /// memory sooner, e.g. from a maintenance timer.
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        Self::purge(&mut self.windows.lock(), now, self.window)
    }

    fn purge(windows: &mut HashMap<String, VecDeque<Instant>>, now: Instant, window: Duration) -> usize {
        let before = windows.len();
        windows.retain(|_, hits| {
            Self::prune(hits, now, window);
            !hits.is_empty()
        });
        before - windows.len()
    }

    fn prune(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&oldest) = hits.front() {
            if now.saturating_duration_since(oldest) > window {
                hits.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Guard for RateLimiter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn check(&self, key: &str) -> GuardResult {
        RateLimiter::check(self, key)
    }
}
