//! Wall-clock budget for one invocation
//!
//! The hosting platform kills an invocation at a hard deadline, so the scanner
//! and the persister check the budget before every unit of work and stop early
//! with partial progress instead.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    /// Point after which no new work may start (already net of safety margin)
    cutoff: Option<Instant>,
}

impl Deadline {
    /// Budget starting now, keeping `safety_margin` in reserve
    pub fn new(budget: Duration, safety_margin: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            cutoff: Some(started + budget.saturating_sub(safety_margin)),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            started: Instant::now(),
            cutoff: None,
        }
    }

    /// A deadline that has already passed
    pub fn expired() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            cutoff: Some(now),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the cutoff, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.cutoff
            .map(|cutoff| cutoff.saturating_duration_since(Instant::now()))
    }

    pub fn is_exhausted(&self) -> bool {
        match self.cutoff {
            Some(cutoff) => Instant::now() >= cutoff,
            None => false,
        }
    }

    /// Whether at least `needed` is left
    pub fn has_at_least(&self, needed: Duration) -> bool {
        self.remaining().map_or(true, |left| left >= needed)
    }

    /// Child deadline covering `fraction` of the time currently remaining
    pub fn fraction(&self, fraction: f64) -> Deadline {
        self.split_cumulative(&[fraction])[0]
    }

    /// Carve the remaining time into consecutive slices by share.
    ///
    /// Slice `i` ends at `now + remaining * (share[0] + .. + share[i])`, so time
    /// left unused by an early slice rolls into the later ones. Unbounded
    /// parents yield unbounded slices.
    pub fn split_cumulative(&self, shares: &[f64]) -> Vec<Deadline> {
        let now = Instant::now();
        let Some(total) = self.remaining() else {
            return shares.iter().map(|_| Deadline::unbounded()).collect();
        };

        let mut cumulative = 0.0f64;
        shares
            .iter()
            .map(|share| {
                cumulative = (cumulative + share.max(0.0)).min(1.0);
                Deadline {
                    started: now,
                    cutoff: Some(now + total.mul_f64(cumulative)),
                }
            })
            .collect()
    }
}
