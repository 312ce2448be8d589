//! Market status scheduler
//!
//! Keeps each market's persisted status in step with its clock. One task per
//! active market sleeps until the next computed transition, recomputes, and
//! writes plus publishes only when the status actually changed.

use crate::db::sqlite::models::{EngineSettings, Market, MarketStatus};
use crate::error::{AppError, Result};
use crate::events::MarketTransition;
use crate::market::{compute_status, ClockReading, MarketCalendar};
use crate::state::AppState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest sleep between recomputations when no transition is near
const MAX_IDLE: Duration = Duration::from_secs(3600);

/// Exponential backoff for failed status writes
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self { initial, max, next: initial, attempt: 0 }
    }

    /// Delay before the next retry; doubles up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.attempt += 1;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.attempt = 0;
    }
}

/// Result of reconciling one market
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub reading: ClockReading,
    /// Status stored before reconciling
    pub stored: MarketStatus,
    /// Published event, if the status changed
    pub transition: Option<MarketTransition>,
}

/// Supervisor of the per-market timer tasks
pub struct MarketScheduler {
    state: Arc<AppState>,
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl MarketScheduler {
    pub fn new(state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            state,
            cancel,
            tasks: Vec::new(),
        }
    }

    /// Recompute a market's status at `now` and persist it if it changed.
    ///
    /// The stored status is never rewritten to the same value. On change the
    /// transition is written together with its log entry and then published
    /// with the boundary instant from the clock. When the status is unchanged
    /// but its boundary is newer than the stored one, the market went through
    /// a whole cycle unobserved and the re-entry is caught up instead.
    pub fn reconcile(state: &AppState, market_key: &str, now: DateTime<Utc>) -> Result<Reconciled> {
        let market = state
            .sqlite
            .get_market(market_key)?
            .ok_or_else(|| AppError::NotFound(format!("Market '{}' not found", market_key)))?;

        let calendar = state.sqlite.load_market_calendar(&market)?;
        let reading = compute_status(&calendar, now);

        if reading.status == market.status {
            if let Some(transition) = Self::catch_up_missed_cycle(state, &market, &calendar, &reading)? {
                return Ok(Reconciled { reading, stored: market.status, transition: Some(transition) });
            }
            debug!("{} still {}, nothing to write", market_key, market.status);
            return Ok(Reconciled { reading, stored: market.status, transition: None });
        }

        let written = state
            .sqlite
            .transition_market_status(market_key, market.status, reading.status, reading.since)?;

        if !written {
            debug!("{} status changed underneath, skipping {}", market_key, reading.status);
            return Ok(Reconciled { reading, stored: market.status, transition: None });
        }

        let transition = MarketTransition {
            market_key: market_key.to_string(),
            previous_status: market.status,
            new_status: reading.status,
            instant: reading.since,
        };

        info!(
            "{}: {} -> {} at {}",
            market_key, transition.previous_status, transition.new_status, transition.instant
        );
        state.bus.publish(transition.clone());

        Ok(Reconciled { reading, stored: market.status, transition: Some(transition) })
    }

    /// Refresh `status_changed_at` and publish the re-entry into the current
    /// status when it happened after the stored boundary
    fn catch_up_missed_cycle(
        state: &AppState,
        market: &Market,
        calendar: &MarketCalendar,
        reading: &ClockReading,
    ) -> Result<Option<MarketTransition>> {
        let Some(stored_at) = market.status_changed_at else {
            return Ok(None);
        };
        if !reading.since_is_boundary || reading.since <= stored_at {
            return Ok(None);
        }

        let previous = compute_status(calendar, reading.since - chrono::Duration::seconds(1)).status;
        if previous == reading.status {
            return Ok(None);
        }

        let written = state
            .sqlite
            .record_missed_market_cycle(&market.key, reading.status, previous, reading.since)?;
        if !written {
            return Ok(None);
        }

        let transition = MarketTransition {
            market_key: market.key.clone(),
            previous_status: previous,
            new_status: reading.status,
            instant: reading.since,
        };

        info!(
            "{}: missed cycle caught up, {} -> {} at {}",
            market.key, transition.previous_status, transition.new_status, transition.instant
        );
        state.bus.publish(transition.clone());

        Ok(Some(transition))
    }

    /// Reconcile every active market, then start one timer task per market.
    /// Returns the number of markets scheduled.
    pub fn start(&mut self) -> Result<usize> {
        let markets = self.state.sqlite.get_active_markets()?;
        let now = Utc::now();

        for market in markets {
            // Catch up on transitions missed while the process was down
            if let Err(e) = Self::reconcile(&self.state, &market.key, now) {
                warn!("Startup reconciliation of {} failed: {}", market.key, e);
            }

            let handle = tokio::spawn(Self::run_market(
                self.state.clone(),
                market.key.clone(),
                self.cancel.child_token(),
            ));
            self.tasks.push((market.key, handle));
        }

        info!("Market scheduler started for {} markets", self.tasks.len());
        Ok(self.tasks.len())
    }

    /// Keys of the scheduled markets
    pub fn markets(&self) -> Vec<String> {
        self.tasks.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Number of timer tasks still running
    pub fn running(&self) -> usize {
        self.tasks.iter().filter(|(_, handle)| !handle.is_finished()).count()
    }

    /// Cancel every timer and wait for the tasks to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (key, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!("Scheduler task for {} ended abnormally: {}", key, e);
            }
        }
        info!("Market scheduler stopped");
    }

    fn retry_backoff(state: &AppState) -> Backoff {
        let settings = state.sqlite.get_engine_settings().unwrap_or_else(|e| {
            warn!("Could not read retry settings, using defaults: {}", e);
            EngineSettings::default()
        });
        Backoff::new(
            Duration::from_millis(settings.persist_retry_initial_ms),
            Duration::from_millis(settings.persist_retry_max_ms),
        )
    }

    /// Time to sleep until the next transition, capped at [`MAX_IDLE`]
    fn sleep_until_next(reading: &ClockReading, now: DateTime<Utc>) -> Duration {
        match reading.next {
            Some(next) => (next.at - now).to_std().unwrap_or(Duration::ZERO).min(MAX_IDLE),
            None => MAX_IDLE,
        }
    }

    async fn run_market(state: Arc<AppState>, market_key: String, cancel: CancellationToken) {
        let mut backoff = Self::retry_backoff(&state);

        loop {
            let now = Utc::now();
            let wait = match Self::reconcile(&state, &market_key, now) {
                Ok(reconciled) => {
                    backoff.reset();
                    let wait = Self::sleep_until_next(&reconciled.reading, now);
                    debug!("{} next check in {}s", market_key, wait.as_secs());
                    wait
                }
                Err(e) => {
                    // The clock is recomputed on retry, so the pending
                    // transition is written once storage recovers
                    let delay = backoff.next_delay();
                    warn!(
                        "Status update for {} failed (attempt {}), retrying in {}ms: {}",
                        market_key,
                        backoff.attempt(),
                        delay.as_millis(),
                        e
                    );
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        debug!("Scheduler task for {} stopped", market_key);
    }
}
