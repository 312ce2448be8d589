//! Grading Service
//!
//! Re-evaluates every PENDING session record against the live quote of its
//! feed symbol and finalizes the first threshold it crosses. Finalization is
//! a conditional write, so overlapping passes never produce two outcomes.

use crate::db::sqlite::models::{Bias, Outcome, OutcomeKind, SessionRecord};
use crate::error::Result;
use crate::services::quotes_service::{Quote, QuotesService};
use crate::state::AppState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Shortest allowed pass interval
pub const MIN_INTERVAL_MS: u64 = 50;

/// Finalized outcome for a record
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub kind: OutcomeKind,
    pub price: f64,
}

/// Counters of one grading pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub scanned: usize,
    pub finalized: usize,
    /// Records left PENDING for lack of a usable quote
    pub skipped: usize,
    pub errors: usize,
}

/// Apply the grading rule to one record and quote.
///
/// Long records exit on the bid: at or above `target_high` is WORKED/TARGET,
/// at or below `target_low` is DIDNT_WORK/STOP. Short records mirror this on
/// the ask. The target condition is checked first, so a quote satisfying
/// both resolves to the target. `None` leaves the record PENDING.
pub fn grade(record: &SessionRecord, quote: &Quote) -> Option<Decision> {
    let high = record.target_high?;
    let low = record.target_low?;

    match record.signal?.bias() {
        Bias::Long => {
            let bid = quote.bid_price()?;
            if bid >= high {
                Some(Decision { outcome: Outcome::Worked, kind: OutcomeKind::Target, price: bid })
            } else if bid <= low {
                Some(Decision { outcome: Outcome::DidntWork, kind: OutcomeKind::Stop, price: bid })
            } else {
                None
            }
        }
        Bias::Short => {
            let ask = quote.ask_price()?;
            if ask <= low {
                Some(Decision { outcome: Outcome::Worked, kind: OutcomeKind::Target, price: ask })
            } else if ask >= high {
                Some(Decision { outcome: Outcome::DidntWork, kind: OutcomeKind::Stop, price: ask })
            } else {
                None
            }
        }
        Bias::Neutral => None,
    }
}

/// Result of grading a single record
enum RecordResult {
    Finalized,
    Unchanged,
    Skipped,
}

/// Grading service for business logic
pub struct GradingService;

impl GradingService {
    /// Run one pass over all PENDING records
    pub fn grade_pending_once(state: &AppState, now: DateTime<Utc>) -> Result<PassSummary> {
        let ids = state.sqlite.get_pending_session_ids()?;
        let quotes = state.quotes_service()?;

        let mut summary = PassSummary {
            scanned: ids.len(),
            ..Default::default()
        };

        for id in ids {
            match Self::grade_one(state, &quotes, id, now) {
                Ok(RecordResult::Finalized) => summary.finalized += 1,
                Ok(RecordResult::Skipped) => summary.skipped += 1,
                Ok(RecordResult::Unchanged) => {}
                Err(e) => {
                    // Record stays PENDING and is retried next pass
                    error!("Failed to grade session {}: {}", id, e);
                    summary.errors += 1;
                }
            }
        }

        if summary.scanned > 0 {
            debug!(
                "Grading pass: {} scanned, {} finalized, {} skipped, {} errors",
                summary.scanned, summary.finalized, summary.skipped, summary.errors
            );
        }

        Ok(summary)
    }

    fn grade_one(state: &AppState, quotes: &QuotesService, id: i64, now: DateTime<Utc>) -> Result<RecordResult> {
        let Some(record) = state.sqlite.get_session(id)? else {
            return Ok(RecordResult::Unchanged);
        };
        if record.outcome != Outcome::Pending {
            return Ok(RecordResult::Unchanged);
        }

        let Some(quote) = quotes.latest(&record.feed_symbol, now) else {
            return Ok(RecordResult::Skipped);
        };

        let Some(decision) = grade(&record, &quote) else {
            return Ok(RecordResult::Unchanged);
        };

        let written = state.sqlite.finalize_session_outcome(
            record.id,
            decision.outcome,
            decision.price,
            decision.kind,
            now,
        )?;

        if written {
            info!(
                "Session {} {} ({}) graded {} / {} at {}",
                record.id, record.symbol, record.group_id, decision.outcome, decision.kind, decision.price
            );
            Ok(RecordResult::Finalized)
        } else {
            debug!("Session {} already finalized by another pass", record.id);
            Ok(RecordResult::Unchanged)
        }
    }

    /// Current pass interval from the settings table
    fn interval(state: &AppState) -> Duration {
        let ms = state
            .sqlite
            .get_engine_settings()
            .map(|s| s.grading_interval_ms)
            .unwrap_or(1000);
        Duration::from_millis(ms.max(MIN_INTERVAL_MS))
    }

    /// Spawn the grading loop.
    ///
    /// Cancellation stops scheduling of the next pass; a pass already running
    /// always finishes its batch.
    pub fn spawn(state: Arc<AppState>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut period = Self::interval(&state);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("Grading loop started ({}ms interval)", period.as_millis());

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = Self::grade_pending_once(&state, Utc::now()) {
                    error!("Grading pass failed: {}", e);
                }

                let next = Self::interval(&state);
                if next != period {
                    info!("Grading interval changed to {}ms", next.as_millis());
                    period = next;
                    ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
            }

            info!("Grading loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::models::{NewSessionRecord, Signal};
    use crate::db::sqlite::SettingsUpdate;
    use crate::services::quotes_service::QuoteCache;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 3, 4, 0, 0).unwrap()
    }

    fn quote(bid: f64, ask: f64) -> Quote {
        Quote {
            symbol: "NIFTY".to_string(),
            bid,
            ask,
            last: bid,
            volume: 1,
            timestamp: t0(),
        }
    }

    fn row(signal: Signal) -> NewSessionRecord {
        NewSessionRecord {
            symbol: "NIFTY".to_string(),
            feed_symbol: "NIFTY".to_string(),
            is_composite: false,
            last: Some(100.0),
            bid: Some(100.0),
            ask: Some(100.0),
            volume: Some(1),
            prev_close: None,
            high_24h: None,
            low_24h: None,
            high_52w: None,
            low_52w: None,
            signal: Some(signal),
            signal_weight: 1.0,
            entry_price: Some(100.0),
            target_high: Some(102.0),
            target_low: Some(98.0),
        }
    }

    fn setup(signal: Signal) -> (Arc<QuoteCache>, AppState, i64) {
        let cache = Arc::new(QuoteCache::new());
        let state = AppState::in_memory(cache.clone()).unwrap();
        let ids = state
            .sqlite
            .insert_session_group("NSE:1", "NSE", t0(), &[row(signal)])
            .unwrap()
            .unwrap();
        (cache, state, ids[0])
    }

    fn record(signal: Signal) -> SessionRecord {
        let (_cache, state, id) = setup(signal);
        state.sqlite.get_session(id).unwrap().unwrap()
    }

    #[test]
    fn test_long_rule() {
        let long = record(Signal::Buy);
        assert_eq!(grade(&long, &quote(101.0, 101.5)), None);
        assert_eq!(
            grade(&long, &quote(102.0, 102.5)),
            Some(Decision { outcome: Outcome::Worked, kind: OutcomeKind::Target, price: 102.0 })
        );
        assert_eq!(
            grade(&long, &quote(98.0, 98.5)),
            Some(Decision { outcome: Outcome::DidntWork, kind: OutcomeKind::Stop, price: 98.0 })
        );
    }

    #[test]
    fn test_short_rule_uses_ask() {
        let short = record(Signal::StrongSell);
        // Bid through the low is not enough, the ask has to get there
        assert_eq!(grade(&short, &quote(97.5, 98.5)), None);
        assert_eq!(
            grade(&short, &quote(97.5, 98.0)),
            Some(Decision { outcome: Outcome::Worked, kind: OutcomeKind::Target, price: 98.0 })
        );
        assert_eq!(
            grade(&short, &quote(101.5, 102.0)),
            Some(Decision { outcome: Outcome::DidntWork, kind: OutcomeKind::Stop, price: 102.0 })
        );
    }

    #[test]
    fn test_target_wins_when_both_satisfied() {
        let mut long = record(Signal::Buy);
        long.target_low = Some(103.0);
        assert_eq!(grade(&long, &quote(102.5, 103.0)).unwrap().kind, OutcomeKind::Target);
    }

    #[test]
    fn test_empty_book_side_is_not_graded() {
        let long = record(Signal::Buy);
        assert_eq!(grade(&long, &quote(0.0, 97.0)), None);
    }

    #[test]
    fn test_bid_sequence_finalizes_once() {
        let (cache, state, id) = setup(Signal::Buy);

        for bid in [99.0, 101.0] {
            cache.update(quote(bid, bid + 0.5));
            let summary = GradingService::grade_pending_once(&state, t0()).unwrap();
            assert_eq!(summary.finalized, 0);
            assert_eq!(state.sqlite.get_session(id).unwrap().unwrap().outcome, Outcome::Pending);
        }

        cache.update(quote(102.5, 103.0));
        let summary = GradingService::grade_pending_once(&state, t0()).unwrap();
        assert_eq!(summary.finalized, 1);

        let graded = state.sqlite.get_session(id).unwrap().unwrap();
        assert_eq!(graded.outcome, Outcome::Worked);
        assert_eq!(graded.outcome_kind, Some(OutcomeKind::Target));
        assert_eq!(graded.outcome_price, Some(102.5));

        // Later quotes through the stop are never looked at
        cache.update(quote(90.0, 90.5));
        let summary = GradingService::grade_pending_once(&state, t0()).unwrap();
        assert_eq!(summary.scanned, 0);
        assert_eq!(state.sqlite.get_session(id).unwrap().unwrap().outcome, Outcome::Worked);
    }

    #[test]
    fn test_missing_or_stale_quote_skips() {
        let (cache, state, id) = setup(Signal::Buy);

        let summary = GradingService::grade_pending_once(&state, t0()).unwrap();
        assert_eq!(summary, PassSummary { scanned: 1, finalized: 0, skipped: 1, errors: 0 });

        state
            .sqlite
            .update_engine_settings(&SettingsUpdate { max_quote_age_secs: Some(10), ..Default::default() })
            .unwrap();
        cache.update(quote(105.0, 105.5));
        let later = t0() + chrono::Duration::seconds(60);
        let summary = GradingService::grade_pending_once(&state, later).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(state.sqlite.get_session(id).unwrap().unwrap().outcome, Outcome::Pending);
    }

    #[test]
    fn test_neutral_rows_never_scanned() {
        let (_cache, state, _id) = setup(Signal::Hold);
        let summary = GradingService::grade_pending_once(&state, t0()).unwrap();
        assert_eq!(summary.scanned, 0);
    }

    #[test]
    fn test_concurrent_passes_write_once() {
        let (cache, state, id) = setup(Signal::Buy);
        cache.update(quote(102.5, 103.0));

        let finalized: usize = std::thread::scope(|s| {
            let a = s.spawn(|| GradingService::grade_pending_once(&state, t0()).unwrap());
            let b = s.spawn(|| GradingService::grade_pending_once(&state, t0()).unwrap());
            a.join().unwrap().finalized + b.join().unwrap().finalized
        });

        assert_eq!(finalized, 1);
        assert_eq!(state.sqlite.get_session(id).unwrap().unwrap().outcome_price, Some(102.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_grades_and_stops_on_cancel() {
        let (cache, state, id) = setup(Signal::Buy);
        cache.update(quote(102.5, 103.0));
        let state = Arc::new(state);

        let cancel = CancellationToken::new();
        let handle = GradingService::spawn(state.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(state.sqlite.get_session(id).unwrap().unwrap().outcome, Outcome::Worked);

        cancel.cancel();
        handle.await.unwrap();
    }
}
