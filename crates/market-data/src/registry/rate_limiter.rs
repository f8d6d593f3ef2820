//! Rolling-window weight limiter for live queries.
//!
//! Each market type gets its own window: a budget of weight units that may be
//! spent within any span of `window` length. Grants are kept as a log of
//! (instant, weight) pairs and expire once they fall out of the window.
//!
//! Check-and-spend happens under one lock, so concurrent callers can never
//! jointly exceed the budget.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::clock::Clock;
use crate::errors::MarketDataError;
use crate::models::MarketType;

/// Default window length.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Weight budget for one market type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeightBudget {
    /// Weight units allowed per window.
    pub limit: u32,
    pub window: Duration,
}

impl WeightBudget {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window: DEFAULT_WINDOW,
        }
    }

    pub fn for_market(market: MarketType) -> Self {
        Self::per_minute(market.weight_per_minute())
    }
}

/// What happens when a reservation does not fit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LimiterMode {
    /// Wait until the budget frees up.
    #[default]
    Blocking,
    /// Fail with `RateLimitExceeded` instead of waiting.
    FailFast,
}

/// Outcome of a single reservation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    /// Nothing was spent; enough budget frees up after this long.
    MustWait(Duration),
}

#[derive(Debug)]
struct WeightWindow {
    budget: WeightBudget,
    grants: VecDeque<(Instant, u32)>,
    used: u32,
}

impl WeightWindow {
    fn new(budget: WeightBudget) -> Self {
        Self {
            budget,
            grants: VecDeque::new(),
            used: 0,
        }
    }

    /// Drop grants that have left the window.
    fn evict(&mut self, now: Instant) {
        while let Some(&(at, weight)) = self.grants.front() {
            if now.saturating_duration_since(at) < self.budget.window {
                break;
            }
            self.grants.pop_front();
            self.used = self.used.saturating_sub(weight);
        }
    }

    fn reserve(&mut self, weight: u32, now: Instant) -> Reservation {
        self.evict(now);

        if self.used + weight <= self.budget.limit {
            self.grants.push_back((now, weight));
            self.used += weight;
            return Reservation::Granted;
        }

        // Walk the oldest grants until enough weight would have expired.
        let needed = self.used + weight - self.budget.limit;
        let mut freed = 0;
        for &(at, granted) in &self.grants {
            freed += granted;
            if freed >= needed {
                let expires = at + self.budget.window;
                return Reservation::MustWait(expires.saturating_duration_since(now));
            }
        }
        Reservation::MustWait(self.budget.window)
    }

    fn remaining(&mut self, now: Instant) -> u32 {
        self.evict(now);
        self.budget.limit.saturating_sub(self.used)
    }
}

/// Per-market weight limiter.
///
/// Shared by every live client in the process (pass it around as
/// `Arc<RateLimiter>`); tests build an isolated one with a manual clock.
pub struct RateLimiter {
    windows: Mutex<HashMap<MarketType, WeightWindow>>,
    budgets: Mutex<HashMap<MarketType, WeightBudget>>,
    mode: LimiterMode,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a blocking limiter with the per-market default budgets.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_mode(clock, LimiterMode::Blocking)
    }

    pub fn with_mode(clock: Arc<dyn Clock>, mode: LimiterMode) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            budgets: Mutex::new(HashMap::new()),
            mode,
            clock,
        }
    }

    pub fn mode(&self) -> LimiterMode {
        self.mode
    }

    /// Lock the windows mutex, recovering from poison if necessary.
    ///
    /// The worst case after recovery is a slightly stale window, which is
    /// better than panicking.
    fn lock_windows(&self) -> MutexGuard<'_, HashMap<MarketType, WeightWindow>> {
        self.windows.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter windows mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_budgets(&self) -> MutexGuard<'_, HashMap<MarketType, WeightBudget>> {
        self.budgets.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter budgets mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn budget_for(&self, market: MarketType) -> WeightBudget {
        self.lock_budgets()
            .get(&market)
            .copied()
            .unwrap_or_else(|| WeightBudget::for_market(market))
    }

    /// Override the budget for a market. Existing grants are forgotten.
    pub fn configure(&self, market: MarketType, budget: WeightBudget) {
        self.lock_budgets().insert(market, budget);
        self.lock_windows().remove(&market);
    }

    /// Try to spend `weight` units now.
    ///
    /// Never blocks. Fails only when `weight` alone is larger than the
    /// budget, since such a reservation could never be granted.
    pub fn reserve(&self, market: MarketType, weight: u32) -> Result<Reservation, MarketDataError> {
        let budget = self.budget_for(market);
        if weight > budget.limit {
            return Err(MarketDataError::WeightExceedsBudget {
                market,
                weight,
                limit: budget.limit,
            });
        }

        let now = self.clock.now();
        let mut windows = self.lock_windows();
        let window = windows
            .entry(market)
            .or_insert_with(|| WeightWindow::new(budget));
        Ok(window.reserve(weight, now))
    }

    /// Spend `weight` units, waiting for budget in blocking mode.
    pub async fn acquire(&self, market: MarketType, weight: u32) -> Result<(), MarketDataError> {
        loop {
            match self.reserve(market, weight)? {
                Reservation::Granted => {
                    debug!("Rate limiter: granted {} weight for '{}'", weight, market);
                    return Ok(());
                }
                Reservation::MustWait(wait) => {
                    if self.mode == LimiterMode::FailFast {
                        return Err(MarketDataError::RateLimitExceeded {
                            market,
                            retry_after: wait,
                        });
                    }
                    debug!("Rate limiter: waiting {:?} for '{}'", wait, market);
                    // A zero wait can only come from a grant expiring this instant.
                    self.clock.sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Weight still available in the current window.
    pub fn remaining(&self, market: MarketType) -> u32 {
        let now = self.clock.now();
        let budget = self.budget_for(market);
        let mut windows = self.lock_windows();
        match windows.get_mut(&market) {
            Some(window) => window.remaining(now),
            None => budget.limit,
        }
    }

    /// Forget all grants for a market.
    pub fn reset(&self, market: MarketType) {
        self.lock_windows().remove(&market);
    }
}
