//! Per-minute and per-day ceilings on outbound LLM requests.
//!
//! The per-minute ceiling is a sliding 60 second window over request
//! timestamps. A caller that finds the window saturated sleeps exactly until
//! the oldest entry leaves the window. The per-day ceiling is a counter reset
//! when the local date changes; exhausting it is an error, never a wait.
//!
//! Slots are reserved by [`RateLimiter::check_limit`] and turned into window
//! entries by [`RateLimiter::record_request`], so concurrent callers can never
//! collectively pass the ceiling between the check and the record. A slot
//! whose request is never sent must be handed back with
//! [`RateLimiter::release`].

use crate::error::LlmError;
use chrono::{Local, NaiveDate};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct WindowState {
    window: VecDeque<Instant>,
    /// Slots handed out by `check_limit` and not yet recorded or released.
    reserved: u32,
    day: NaiveDate,
    day_count: u32,
}

impl WindowState {
    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if now.duration_since(*oldest) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.day {
            debug!(previous = %self.day, %today, "Resetting daily request counter");
            self.day = today;
            self.day_count = 0;
        }
    }
}

/// Shared limiter; one instance per process, passed to every LLM caller.
#[derive(Debug)]
pub struct RateLimiter {
    per_minute: u32,
    per_day: u32,
    state: Mutex<WindowState>,
    released: Notify,
}

impl RateLimiter {
    pub fn new(per_minute: u32, per_day: u32) -> Self {
        Self {
            per_minute: per_minute.max(1),
            per_day,
            state: Mutex::new(WindowState {
                window: VecDeque::new(),
                reserved: 0,
                day: Local::now().date_naive(),
                day_count: 0,
            }),
            released: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until one more request may be issued.
    ///
    /// # Errors
    ///
    /// [`LlmError::DailyLimitExhausted`] if today's ceiling is already used up.
    pub async fn check_limit(&self) -> Result<(), LlmError> {
        self.check_limit_on(|| Local::now().date_naive()).await
    }

    async fn check_limit_on(&self, today: impl Fn() -> NaiveDate) -> Result<(), LlmError> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let wait = {
                let mut state = self.state();
                state.roll_day(today());

                if state.day_count + state.reserved >= self.per_day {
                    warn!(limit = self.per_day, "Daily LLM request ceiling exhausted");
                    return Err(LlmError::DailyLimitExhausted {
                        limit: self.per_day,
                    });
                }

                let now = Instant::now();
                state.evict(now);
                let in_use = state.window.len() as u32 + state.reserved;
                if in_use < self.per_minute {
                    state.reserved += 1;
                    return Ok(());
                }

                // Saturated: wait for the oldest entry to leave the window, or,
                // when every slot is a pending reservation, for one to resolve.
                state
                    .window
                    .front()
                    .map(|oldest| (*oldest + WINDOW).saturating_duration_since(now))
            };

            match wait {
                Some(delay) => {
                    debug!(?delay, "Per-minute window saturated; waiting");
                    sleep(delay).await;
                }
                None => released.await,
            }
        }
    }

    /// Record one issued request. Call exactly once after a successful `check_limit`.
    pub fn record_request(&self) {
        let mut state = self.state();
        state.reserved = state.reserved.saturating_sub(1);
        state.window.push_back(Instant::now());
        state.day_count += 1;
        drop(state);
        self.released.notify_waiters();
    }

    /// Give back a slot reserved by `check_limit` for a request that was never sent.
    pub fn release(&self) {
        let mut state = self.state();
        state.reserved = state.reserved.saturating_sub(1);
        drop(state);
        self.released.notify_waiters();
    }

    #[cfg(test)]
    fn requests_today(&self) -> u32 {
        self.state().day_count
    }

    #[cfg(test)]
    fn reserved(&self) -> u32 {
        self.state().reserved
    }
}
