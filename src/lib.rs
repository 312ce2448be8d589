//! Session Grader - Market Session Lifecycle & Trade Grading Engine
//!
//! Tracks when markets open and close, snapshots configured instruments at
//! each open, and grades those snapshots against live quotes until their
//! target or stop is reached.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod market;
pub mod scheduler;
pub mod services;
pub mod state;

use config::EngineConfig;
use error::Result;
use scheduler::MarketScheduler;
use services::{CaptureService, GradingService, QuoteCache, QuoteSource};
use state::AppState;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Running engine: market scheduler, capture listener and grading loop
pub struct Engine {
    state: Arc<AppState>,
    cancel: CancellationToken,
    scheduler: MarketScheduler,
    listener: JoinHandle<()>,
    grading: JoinHandle<()>,
}

impl Engine {
    /// Start every engine task on the current tokio runtime
    pub fn start(state: Arc<AppState>) -> Result<Self> {
        let cancel = CancellationToken::new();

        // The listener subscribes before the scheduler reconciles, so
        // transitions caught up at startup are captured too
        let listener = CaptureService::spawn_listener(state.clone(), cancel.child_token());

        let mut scheduler = MarketScheduler::new(state.clone(), cancel.child_token());
        scheduler.start()?;

        let grading = GradingService::spawn(state.clone(), cancel.child_token());

        Ok(Self {
            state,
            cancel,
            scheduler,
            listener,
            grading,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Cancel pending timers and the next grading pass, then wait for every
    /// task to finish its current work
    pub async fn shutdown(self) {
        tracing::info!("Shutting down engine...");
        self.cancel.cancel();

        self.scheduler.shutdown().await;
        if let Err(e) = self.listener.await {
            tracing::warn!("Capture listener ended abnormally: {}", e);
        }
        if let Err(e) = self.grading.await {
            tracing::warn!("Grading loop ended abnormally: {}", e);
        }

        tracing::info!("Engine stopped");
    }
}

/// Initialize logging
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_grader=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Run the engine against a quote source until ctrl-c
pub async fn run_with(config: EngineConfig, quotes: Arc<dyn QuoteSource>) -> Result<()> {
    let state = Arc::new(AppState::new(config, quotes)?);
    let engine = Engine::start(state)?;

    tracing::info!("Engine running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    engine.shutdown().await;
    Ok(())
}

/// Initialize logging and run the engine with configuration from the
/// environment. Quotes are read from an in-process cache that the feed
/// pipeline populates.
pub async fn run() -> Result<()> {
    init_tracing();

    tracing::info!("Starting Session Grader...");

    let config = EngineConfig::from_env()?;
    run_with(config, Arc::new(QuoteCache::new())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::models::{
        Instrument, MarketStatus, OffsetMode, Outcome, PrecisionConfig, Signal, TargetOffset,
    };
    use crate::events::MarketTransition;
    use crate::services::Quote;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    #[tokio::test]
    async fn test_engine_captures_and_grades_end_to_end() {
        let cache = Arc::new(QuoteCache::new());
        let state = Arc::new(AppState::in_memory(cache.clone()).unwrap());

        let mut market = state.sqlite.get_market("MCX").unwrap().unwrap();
        market.capture_enabled = true;
        state.sqlite.upsert_market(&market).unwrap();
        state
            .sqlite
            .upsert_instrument(&Instrument {
                symbol: "GOLD".to_string(),
                market_key: "MCX".to_string(),
                feed_symbol: None,
                tick_value: 1.0,
                margin: 0.0,
                include_in_composite: true,
                is_future: true,
                active: true,
                signal: Some(Signal::Buy),
                signal_weight: 1.0,
                band: PrecisionConfig {
                    precision: Some(0),
                    high: Some(TargetOffset { mode: OffsetMode::Points, value: 10.0 }),
                    low: Some(TargetOffset { mode: OffsetMode::Points, value: 10.0 }),
                },
            })
            .unwrap();

        let quote = |bid: f64| Quote {
            symbol: "GOLD".to_string(),
            bid,
            ask: bid + 1.0,
            last: bid,
            volume: 1,
            timestamp: Utc::now(),
        };
        cache.update(quote(99.0));

        let engine = Engine::start(state.clone()).unwrap();

        // Drive the open directly rather than waiting for the wall clock
        let instant = Utc.with_ymd_and_hms(2024, 7, 3, 3, 30, 0).unwrap();
        state.bus.publish(MarketTransition {
            market_key: "MCX".to_string(),
            previous_status: MarketStatus::Closed,
            new_status: MarketStatus::Open,
            instant,
        });

        let group_id = CaptureService::group_id("MCX", instant);
        let mut ids = Vec::new();
        for _ in 0..300 {
            ids = state
                .sqlite
                .get_session_group(&group_id)
                .unwrap()
                .into_iter()
                .filter(|r| r.symbol == "GOLD")
                .map(|r| r.id)
                .collect();
            if !ids.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ids.len(), 1);

        // Entry on the ask (100), target 110
        cache.update(quote(111.0));
        let mut outcome = Outcome::Pending;
        for _ in 0..300 {
            outcome = state.sqlite.get_session(ids[0]).unwrap().unwrap().outcome;
            if outcome != Outcome::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(outcome, Outcome::Worked);

        tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
            .await
            .unwrap();
    }
}
