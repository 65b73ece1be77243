//! Run-wide token budget with reservation semantics.
//!
//! The tracker keeps two counters against a ceiling: tokens actually
//! `consumed` by settled agent calls, and tokens `reserved` by tasks that
//! are still in flight. Launch decisions look at the sum of both so a run
//! never knowingly dispatches past its ceiling.
//!
//! Reservations are RAII guards. The only way to give capacity back is to
//! drop (or [`Reservation::release`]) the guard, so a reservation cannot be
//! released twice and is released on every exit path, panics included.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default fraction of the ceiling at which a warning is raised.
pub const DEFAULT_WARNING_RATIO: f64 = 0.8;

/// Usage attributed to a single worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl WorkerUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Point-in-time copy of the tracker's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub consumed: u64,
    pub reserved: u64,
    /// `None` when no limit is configured.
    pub ceiling: Option<u64>,
    pub cost_usd: f64,
    pub grants: u64,
    pub releases: u64,
}

#[derive(Debug, Default)]
struct BudgetState {
    consumed: u64,
    reserved: u64,
    cost_usd: f64,
    grants: u64,
    releases: u64,
    warning_fired: bool,
    per_worker: HashMap<String, WorkerUsage>,
}

/// Shared budget tracker.
///
/// All operations take one short internal lock, so check-then-reserve is
/// atomic with respect to other task executions.
#[derive(Debug)]
pub struct BudgetTracker {
    state: Mutex<BudgetState>,
    ceiling: Option<u64>,
    warning_ratio: f64,
}

impl BudgetTracker {
    /// Create a tracker. `None` means unbounded.
    pub fn new(ceiling: Option<u64>) -> Arc<Self> {
        Self::with_warning_ratio(ceiling, DEFAULT_WARNING_RATIO)
    }

    pub fn with_warning_ratio(ceiling: Option<u64>, warning_ratio: f64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BudgetState::default()),
            ceiling,
            warning_ratio,
        })
    }

    /// Tracker with no limit.
    pub fn unbounded() -> Arc<Self> {
        Self::new(None)
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        // Critical sections never panic midway, so a poisoned state is
        // still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ceiling_value(&self) -> u64 {
        self.ceiling.unwrap_or(u64::MAX)
    }

    fn exceeded(&self, state: &BudgetState) -> bool {
        state.consumed.saturating_add(state.reserved) > self.ceiling_value()
    }

    /// `consumed + reserved > ceiling`.
    pub fn effective_exceeded(&self) -> bool {
        let state = self.lock();
        self.exceeded(&state)
    }

    /// Hold `estimate` tokens until the returned guard is dropped.
    pub fn reserve(self: &Arc<Self>, estimate: u64) -> Reservation {
        let mut state = self.lock();
        state.reserved = state.reserved.saturating_add(estimate);
        state.grants += 1;
        tracing::debug!(estimate, reserved = state.reserved, "budget reserved");
        Reservation {
            tracker: Arc::clone(self),
            amount: estimate,
        }
    }

    /// Check the ceiling and reserve in one step.
    ///
    /// Returns `None` without reserving when the budget is already exceeded.
    pub fn try_reserve(self: &Arc<Self>, estimate: u64) -> Option<Reservation> {
        let mut state = self.lock();
        if self.exceeded(&state) {
            return None;
        }
        state.reserved = state.reserved.saturating_add(estimate);
        state.grants += 1;
        tracing::debug!(estimate, reserved = state.reserved, "budget reserved");
        Some(Reservation {
            tracker: Arc::clone(self),
            amount: estimate,
        })
    }

    fn release_amount(&self, amount: u64) {
        let mut state = self.lock();
        state.reserved = state.reserved.saturating_sub(amount);
        state.releases += 1;
        tracing::debug!(amount, reserved = state.reserved, "budget released");
    }

    /// Record actual usage reported by an agent call.
    pub fn record(&self, worker: &str, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        let mut state = self.lock();
        state.consumed = state
            .consumed
            .saturating_add(input_tokens)
            .saturating_add(output_tokens);
        state.cost_usd += cost_usd;
        let usage = state.per_worker.entry(worker.to_string()).or_default();
        usage.input_tokens += input_tokens;
        usage.output_tokens += output_tokens;
        usage.cost_usd += cost_usd;
    }

    /// True exactly once: the first time consumption reaches the warning
    /// threshold.
    pub fn warning_crossed(&self) -> bool {
        let Some(ceiling) = self.ceiling else {
            return false;
        };
        let mut state = self.lock();
        if state.warning_fired {
            return false;
        }
        let threshold = (ceiling as f64 * self.warning_ratio).ceil() as u64;
        if state.consumed >= threshold {
            state.warning_fired = true;
            return true;
        }
        false
    }

    pub fn consumed(&self) -> u64 {
        self.lock().consumed
    }

    pub fn reserved(&self) -> u64 {
        self.lock().reserved
    }

    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    /// Usage attributed to one worker.
    pub fn worker_usage(&self, worker: &str) -> WorkerUsage {
        self.lock().per_worker.get(worker).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.lock();
        BudgetSnapshot {
            consumed: state.consumed,
            reserved: state.reserved,
            ceiling: self.ceiling,
            cost_usd: state.cost_usd,
            grants: state.grants,
            releases: state.releases,
        }
    }
}

/// A provisional hold on budget capacity.
///
/// Dropping the guard releases the hold.
#[derive(Debug)]
#[must_use = "dropping a reservation releases it immediately"]
pub struct Reservation {
    tracker: Arc<BudgetTracker>,
    amount: u64,
}

impl Reservation {
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Give the capacity back now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.tracker.release_amount(self.amount);
    }
}
