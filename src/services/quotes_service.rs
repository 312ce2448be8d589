//! Quotes Service
//!
//! Read side of the live-price feed. The ingestion pipeline (broker API,
//! spreadsheet bridge, websocket) lives outside the engine and writes into a
//! [`QuoteSource`]; capture and grading only read from it.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Latest tick for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: i64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Bid, if the book has one
    pub fn bid_price(&self) -> Option<f64> {
        (self.bid > 0.0).then_some(self.bid)
    }

    /// Ask, if the book has one
    pub fn ask_price(&self) -> Option<f64> {
        (self.ask > 0.0).then_some(self.ask)
    }

    pub fn last_price(&self) -> Option<f64> {
        (self.last > 0.0).then_some(self.last)
    }
}

/// Prior-day and rolling range statistics for a symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStats {
    pub prev_close: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub high_52w: Option<f64>,
    pub low_52w: Option<f64>,
}

/// Read interface over the live-quote feed
pub trait QuoteSource: Send + Sync {
    /// Latest quote, or `None` if the feed has never seen the symbol
    fn get_latest(&self, symbol: &str) -> Option<Quote>;

    /// Latest quotes for many symbols from one consistent snapshot.
    /// Missing symbols are absent from the map.
    fn get_latest_many(&self, symbols: &[String]) -> HashMap<String, Quote> {
        symbols
            .iter()
            .filter_map(|s| self.get_latest(s).map(|q| (s.clone(), q)))
            .collect()
    }

    /// Reference statistics, if the feed provides them
    fn reference_stats(&self, _symbol: &str) -> Option<ReferenceStats> {
        None
    }
}

/// In-process quote cache fed by the ingestion pipeline
#[derive(Debug, Default)]
pub struct QuoteCache {
    quotes: RwLock<HashMap<String, Quote>>,
    stats: RwLock<HashMap<String, ReferenceStats>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest tick for a symbol, replacing the previous one
    pub fn update(&self, quote: Quote) {
        self.quotes.write().insert(quote.symbol.clone(), quote);
    }

    /// Store reference statistics for a symbol
    pub fn set_reference_stats(&self, symbol: &str, stats: ReferenceStats) {
        self.stats.write().insert(symbol.to_string(), stats);
    }

    /// Drop a symbol from the cache
    pub fn remove(&self, symbol: &str) -> Option<Quote> {
        self.quotes.write().remove(symbol)
    }

    pub fn len(&self) -> usize {
        self.quotes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.read().is_empty()
    }
}

impl QuoteSource for QuoteCache {
    fn get_latest(&self, symbol: &str) -> Option<Quote> {
        self.quotes.read().get(symbol).cloned()
    }

    fn get_latest_many(&self, symbols: &[String]) -> HashMap<String, Quote> {
        // One read guard for the whole batch so rows share a snapshot
        let quotes = self.quotes.read();
        symbols
            .iter()
            .filter_map(|s| quotes.get(s).map(|q| (s.clone(), q.clone())))
            .collect()
    }

    fn reference_stats(&self, symbol: &str) -> Option<ReferenceStats> {
        self.stats.read().get(symbol).cloned()
    }
}

/// Quote access with the staleness policy applied
#[derive(Clone)]
pub struct QuotesService {
    source: Arc<dyn QuoteSource>,
    max_age: Option<Duration>,
}

impl QuotesService {
    /// `max_age_secs` of 0 disables the staleness check, as does an age too
    /// large to represent
    pub fn new(source: Arc<dyn QuoteSource>, max_age_secs: u64) -> Self {
        let max_age = i64::try_from(max_age_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .and_then(Duration::try_seconds);
        Self { source, max_age }
    }

    fn is_fresh(&self, quote: &Quote, now: DateTime<Utc>) -> bool {
        match self.max_age {
            Some(max_age) => now - quote.timestamp <= max_age,
            None => true,
        }
    }

    /// Latest usable quote for a symbol
    pub fn latest(&self, symbol: &str, now: DateTime<Utc>) -> Option<Quote> {
        let quote = self.source.get_latest(symbol)?;
        if self.is_fresh(&quote, now) {
            Some(quote)
        } else {
            tracing::debug!("Ignoring stale quote for {} from {}", symbol, quote.timestamp);
            None
        }
    }

    /// Latest usable quotes for many symbols, from one snapshot
    pub fn latest_many(&self, symbols: &[String], now: DateTime<Utc>) -> HashMap<String, Quote> {
        let mut quotes = self.source.get_latest_many(symbols);
        quotes.retain(|symbol, quote| {
            let fresh = self.is_fresh(quote, now);
            if !fresh {
                tracing::debug!("Ignoring stale quote for {} from {}", symbol, quote.timestamp);
            }
            fresh
        });
        quotes
    }

    pub fn reference_stats(&self, symbol: &str) -> Option<ReferenceStats> {
        self.source.reference_stats(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn quote(symbol: &str, bid: f64, ask: f64, at: DateTime<Utc>) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            last: (bid + ask) / 2.0,
            volume: 100,
            timestamp: at,
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_cache_batch_read_skips_missing() {
        let cache = QuoteCache::new();
        cache.update(quote("ES", 5000.0, 5000.25, noon()));
        cache.update(quote("NQ", 18000.0, 18000.5, noon()));

        let symbols = vec!["ES".to_string(), "NQ".to_string(), "YM".to_string()];
        let quotes = cache.get_latest_many(&symbols);
        assert_eq!(quotes.len(), 2);
        assert!(!quotes.contains_key("YM"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_update_replaces_previous_tick() {
        let cache = QuoteCache::new();
        cache.update(quote("ES", 5000.0, 5000.25, noon()));
        cache.update(quote("ES", 5001.0, 5001.25, noon()));
        assert_eq!(cache.get_latest("ES").unwrap().bid, 5001.0);

        assert!(cache.remove("ES").is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_book_sides_are_absent() {
        let q = quote("ES", 0.0, 5000.25, noon());
        assert_eq!(q.bid_price(), None);
        assert_eq!(q.ask_price(), Some(5000.25));
    }

    #[test]
    fn test_staleness_policy() {
        let cache = Arc::new(QuoteCache::new());
        cache.update(quote("ES", 5000.0, 5000.25, noon()));
        cache.update(quote("NQ", 18000.0, 18000.5, noon() - Duration::seconds(30)));

        let strict = QuotesService::new(cache.clone(), 10);
        assert!(strict.latest("ES", noon() + Duration::seconds(5)).is_some());
        assert!(strict.latest("NQ", noon()).is_none());

        let symbols = vec!["ES".to_string(), "NQ".to_string()];
        assert_eq!(strict.latest_many(&symbols, noon()).len(), 1);

        let lenient = QuotesService::new(cache, 0);
        assert_eq!(lenient.latest_many(&symbols, noon()).len(), 2);
    }

    #[test]
    fn test_huge_max_age_means_no_limit() {
        let cache = Arc::new(QuoteCache::new());
        cache.update(quote("ES", 5000.0, 5000.25, noon() - Duration::days(365)));
        let symbols = vec!["ES".to_string()];

        for max_age_secs in [u64::MAX, i64::MAX as u64] {
            let service = QuotesService::new(cache.clone(), max_age_secs);
            assert!(service.latest("ES", noon()).is_some());
            assert_eq!(service.latest_many(&symbols, noon()).len(), 1);
        }
    }

    #[test]
    fn test_reference_stats_passthrough() {
        let cache = Arc::new(QuoteCache::new());
        cache.set_reference_stats(
            "ES",
            ReferenceStats { prev_close: Some(4990.0), ..Default::default() },
        );
        let service = QuotesService::new(cache, 0);
        assert_eq!(service.reference_stats("ES").unwrap().prev_close, Some(4990.0));
        assert!(service.reference_stats("NQ").is_none());
    }
}
