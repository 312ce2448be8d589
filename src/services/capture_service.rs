//! Capture Service
//!
//! Snapshots every active instrument of a market when it opens, plus one
//! composite row, and records close prices when it closes. A capture group
//! is keyed by market and transition instant, so re-delivered open events
//! never produce a second group.

use crate::db::sqlite::models::{
    Bias, EngineSettings, Instrument, Market, MarketStatus, NewSessionRecord, PrecisionConfig,
    COMPOSITE_SYMBOL,
};
use crate::error::{AppError, Result};
use crate::events::MarketTransition;
use crate::market::compute_status;
use crate::services::quotes_service::{Quote, ReferenceStats};
use crate::services::signal_service::{composite_classification, Classification};
use crate::services::target_service::compute_targets;
use crate::state::AppState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of a capture attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Captured { group_id: String, rows: usize },
    /// A group for this transition already exists
    Duplicate { group_id: String },
    /// Capture is switched off for this market, or every active
    /// instrument is a future while futures capture is off
    Disabled,
    /// The market has no active instruments
    NoInstruments,
}

/// Capture service for business logic
pub struct CaptureService;

impl CaptureService {
    /// Idempotency key of the group captured for a transition
    pub fn group_id(market_key: &str, instant: DateTime<Utc>) -> String {
        format!("{}:{}", market_key, instant.timestamp())
    }

    /// Capture the open snapshot of a market for the transition at `instant`
    pub fn capture_open(state: &AppState, market_key: &str, instant: DateTime<Utc>) -> Result<CaptureOutcome> {
        Self::capture_open_at(state, market_key, instant, Utc::now())
    }

    /// Same as [`capture_open`](Self::capture_open) with an explicit wall
    /// time for the quote staleness check
    pub fn capture_open_at(
        state: &AppState,
        market_key: &str,
        instant: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CaptureOutcome> {
        let market = Self::market(state, market_key)?;

        if !market.capture_enabled {
            debug!("Capture disabled for {}", market_key);
            return Ok(CaptureOutcome::Disabled);
        }

        let group_id = Self::group_id(market_key, instant);
        if state.sqlite.session_group_exists(&group_id)? {
            info!("Capture group {} already exists, skipping", group_id);
            return Ok(CaptureOutcome::Duplicate { group_id });
        }

        let configured = state.sqlite.get_active_instruments(market_key)?;
        if configured.is_empty() {
            warn!("No active instruments for {}, nothing to capture", market_key);
            return Ok(CaptureOutcome::NoInstruments);
        }

        let (instruments, skipped): (Vec<Instrument>, Vec<Instrument>) = configured
            .into_iter()
            .partition(|i| market.futures_capture_enabled || !i.is_future);
        if !skipped.is_empty() {
            debug!("Futures capture off for {}, skipping {} futures", market_key, skipped.len());
        }
        if instruments.is_empty() {
            debug!("Capture disabled for {}: only futures are configured", market_key);
            return Ok(CaptureOutcome::Disabled);
        }

        let reference = Self::composite_reference(state, &market, &instruments)?;

        let mut symbols: Vec<String> = instruments.iter().map(|i| i.quote_symbol().to_string()).collect();
        if let Some(reference) = &reference {
            symbols.push(reference.quote_symbol().to_string());
        }

        // One batch read so every row of the group shares a snapshot
        let quotes_service = state.quotes_service()?;
        let quotes = quotes_service.latest_many(&symbols, now);

        let mut rows = Vec::with_capacity(instruments.len() + 1);
        let mut composite_inputs = Vec::new();

        for instrument in &instruments {
            let quote = quotes.get(instrument.quote_symbol());
            if quote.is_none() {
                warn!("No quote for {} at capture, row will be neutral", instrument.symbol);
            }

            let classification = state.classifier.classify(instrument, quote);
            if instrument.include_in_composite {
                composite_inputs.push(classification);
            }

            let stats = quotes_service.reference_stats(instrument.quote_symbol());
            rows.push(build_row(
                &instrument.symbol,
                instrument.quote_symbol(),
                false,
                quote,
                stats.as_ref(),
                classification,
                &instrument.band,
            ));
        }

        rows.push(Self::composite_row(&quotes, reference.as_ref(), &composite_inputs));

        let row_count = rows.len();
        match state.sqlite.insert_session_group(&group_id, market_key, instant, &rows)? {
            Some(_) => {
                info!("Captured group {} with {} rows", group_id, row_count);
            }
            None => {
                info!("Capture group {} written concurrently, skipping", group_id);
                return Ok(CaptureOutcome::Duplicate { group_id });
            }
        }

        Self::record_open_prices(state, market_key, &rows);

        Ok(CaptureOutcome::Captured { group_id, rows: row_count })
    }

    /// Instrument whose quotes stand in for the composite row
    fn composite_reference(
        state: &AppState,
        market: &Market,
        instruments: &[Instrument],
    ) -> Result<Option<Instrument>> {
        let Some(symbol) = market.composite_reference.as_deref() else {
            return Ok(None);
        };

        if let Some(instrument) = instruments.iter().find(|i| i.symbol == symbol) {
            return Ok(Some(instrument.clone()));
        }

        let Some(instrument) = state.sqlite.get_instrument(symbol)? else {
            warn!("Composite reference {} of {} is not a configured instrument", symbol, market.key);
            return Ok(None);
        };
        if instrument.is_future && !market.futures_capture_enabled {
            debug!("Composite reference {} of {} is a future, not captured", symbol, market.key);
            return Ok(None);
        }
        Ok(Some(instrument))
    }

    fn market(state: &AppState, market_key: &str) -> Result<Market> {
        state
            .sqlite
            .get_market(market_key)?
            .ok_or_else(|| AppError::NotFound(format!("Market '{}' not found", market_key)))
    }

    fn composite_row(
        quotes: &HashMap<String, Quote>,
        reference: Option<&Instrument>,
        inputs: &[Classification],
    ) -> NewSessionRecord {
        let classification = composite_classification(inputs).unwrap_or(Classification {
            signal: None,
            weight: 0.0,
        });

        match reference {
            Some(reference) => build_row(
                COMPOSITE_SYMBOL,
                reference.quote_symbol(),
                true,
                quotes.get(reference.quote_symbol()),
                None,
                classification,
                &reference.band,
            ),
            None => build_row(
                COMPOSITE_SYMBOL,
                COMPOSITE_SYMBOL,
                true,
                None,
                None,
                classification,
                &PrecisionConfig::default(),
            ),
        }
    }

    /// Post-capture aggregation: fold the opening prices into the rolling stat
    fn record_open_prices(state: &AppState, market_key: &str, rows: &[NewSessionRecord]) {
        let prices: Vec<(String, f64)> = rows
            .iter()
            .filter(|r| !r.is_composite)
            .filter_map(|r| r.last.map(|last| (r.symbol.clone(), last)))
            .collect();

        if prices.is_empty() {
            return;
        }

        if let Err(e) = state.sqlite.update_open_price_stats(market_key, &prices) {
            warn!("Failed to update open price stats for {}: {}", market_key, e);
        }
    }

    /// Record close prices on the group captured in the session closing at
    /// `instant`.
    ///
    /// A group left over from an earlier session is not touched. Each row's
    /// close is written once; later calls are no-ops. Returns the number of
    /// rows written.
    pub fn record_close(state: &AppState, market_key: &str, instant: DateTime<Utc>) -> Result<usize> {
        Self::record_close_at(state, market_key, instant, Utc::now())
    }

    pub fn record_close_at(
        state: &AppState,
        market_key: &str,
        instant: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let market = Self::market(state, market_key)?;
        let calendar = state.sqlite.load_market_calendar(&market)?;
        let session = compute_status(&calendar, instant - chrono::Duration::seconds(1));
        if session.status != MarketStatus::Open {
            debug!("{} was not open before {}, no session to close", market_key, instant);
            return Ok(0);
        }

        let Some(group_id) = state.sqlite.latest_session_group(market_key)? else {
            debug!("No capture group to close for {}", market_key);
            return Ok(0);
        };

        let records: Vec<_> = state
            .sqlite
            .get_session_group(&group_id)?
            .into_iter()
            .filter(|r| r.captured_at >= session.since && r.captured_at <= instant)
            .collect();
        if records.is_empty() {
            debug!("Group {} was not captured in the session closing at {}", group_id, instant);
            return Ok(0);
        }

        let symbols: Vec<String> = records.iter().map(|r| r.feed_symbol.clone()).collect();
        let quotes = state.quotes_service()?.latest_many(&symbols, now);

        let mut written = 0;
        for record in records.iter().filter(|r| r.close_price.is_none()) {
            let Some(price) = quotes.get(&record.feed_symbol).and_then(Quote::last_price) else {
                debug!("No close quote for {} in {}", record.symbol, group_id);
                continue;
            };
            if state.sqlite.record_session_close(record.id, price, instant)? {
                written += 1;
            }
        }

        if written > 0 {
            info!("Recorded {} close prices for group {}", written, group_id);
        }
        Ok(written)
    }

    /// Spawn the transition listener.
    ///
    /// Open transitions trigger a capture, close transitions record close
    /// prices. Failed writes are retried after each of the configured
    /// `capture_retry_delays_ms`.
    pub fn spawn_listener(state: Arc<AppState>, cancel: CancellationToken) -> JoinHandle<()> {
        // Subscribe before spawning so no event published after this call is missed
        let mut events = state.bus.subscribe::<MarketTransition>();

        tokio::spawn(async move {
            info!("Capture listener started");

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => received,
                };

                match event {
                    Ok(transition) => Self::handle_transition(&state, &transition, &cancel).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Capture listener missed {} transition events", n);
                    }
                    Err(RecvError::Closed) => {
                        error!("Transition channel closed");
                        break;
                    }
                }
            }

            info!("Capture listener stopped");
        })
    }

    async fn handle_transition(state: &AppState, transition: &MarketTransition, cancel: &CancellationToken) {
        let key = transition.market_key.as_str();
        let instant = transition.instant;

        if transition.is_open() {
            let result = Self::with_retry(state, cancel, "capture", key, || {
                Self::capture_open(state, key, instant)
            })
            .await;
            if let Some(CaptureOutcome::Disabled) = result {
                debug!("Open of {} not captured: capture disabled", key);
            }
        } else if transition.is_close() {
            Self::with_retry(state, cancel, "close", key, || Self::record_close(state, key, instant)).await;
        }
    }

    /// Configured capture retry delays, or the defaults when the settings
    /// cannot be read
    fn retry_delays(state: &AppState) -> Vec<u64> {
        match state.sqlite.get_engine_settings() {
            Ok(settings) => settings.capture_retry_delays_ms,
            Err(e) => {
                warn!("Could not read capture retry settings, using defaults: {}", e);
                EngineSettings::default().capture_retry_delays_ms
            }
        }
    }

    async fn with_retry<T, F>(
        state: &AppState,
        cancel: &CancellationToken,
        what: &str,
        market_key: &str,
        mut op: F,
    ) -> Option<T>
    where
        F: FnMut() -> Result<T>,
    {
        let delays = Self::retry_delays(state);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op() {
                Ok(value) => return Some(value),
                Err(e) => e,
            };

            let Some(delay) = delays.get(attempt - 1).copied().filter(|_| err.is_transient()) else {
                error!("{} for {} failed after {} attempts: {}", what, market_key, attempt, err);
                return None;
            };

            warn!("{} for {} failed (attempt {}), retrying in {}ms: {}", what, market_key, attempt, delay, err);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
    }
}

/// Build one session row from a quote snapshot and classification
fn build_row(
    symbol: &str,
    feed_symbol: &str,
    is_composite: bool,
    quote: Option<&Quote>,
    stats: Option<&ReferenceStats>,
    classification: Classification,
    band: &PrecisionConfig,
) -> NewSessionRecord {
    let entry_price = match classification.signal.map(|s| s.bias()) {
        Some(Bias::Long) => quote.and_then(Quote::ask_price),
        Some(Bias::Short) => quote.and_then(Quote::bid_price),
        _ => None,
    };

    let targets = entry_price.map(|entry| compute_targets(symbol, entry, band));

    NewSessionRecord {
        symbol: symbol.to_string(),
        feed_symbol: feed_symbol.to_string(),
        is_composite,
        last: quote.and_then(Quote::last_price),
        bid: quote.and_then(Quote::bid_price),
        ask: quote.and_then(Quote::ask_price),
        volume: quote.map(|q| q.volume),
        prev_close: stats.and_then(|s| s.prev_close),
        high_24h: stats.and_then(|s| s.high_24h),
        low_24h: stats.and_then(|s| s.low_24h),
        high_52w: stats.and_then(|s| s.high_52w),
        low_52w: stats.and_then(|s| s.low_52w),
        signal: classification.signal,
        signal_weight: classification.weight,
        entry_price,
        target_high: targets.and_then(|t| t.high),
        target_low: targets.and_then(|t| t.low),
    }
}
