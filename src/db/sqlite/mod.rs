//! SQLite database module

pub mod models;
mod connection;
mod migrations;
mod market;
mod instrument;
mod session;
mod settings;

use crate::error::Result;
use crate::market::MarketCalendar;
use chrono::{DateTime, NaiveDate, Utc};
use models::*;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

pub use settings::SettingsUpdate;

/// SQLite database wrapper
///
/// The session store shared by capture and grading. Every method takes the
/// connection lock for the duration of one statement or transaction.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Create new SQLite database connection
    pub fn new(path: &Path) -> Result<Self> {
        let conn = connection::create_connection(path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        // Run migrations
        db.run_migrations()?;

        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();
        migrations::run_migrations(&conn)
    }

    // ========== Market Methods ==========

    /// Insert or update a market's configuration
    pub fn upsert_market(&self, market: &Market) -> Result<()> {
        let conn = self.conn.lock();
        market::upsert_market(&conn, market)
    }

    /// Get a market by key
    pub fn get_market(&self, key: &str) -> Result<Option<Market>> {
        let conn = self.conn.lock();
        market::get_market(&conn, key)
    }

    /// Get all active markets
    pub fn get_active_markets(&self) -> Result<Vec<Market>> {
        let conn = self.conn.lock();
        market::get_active_markets(&conn)
    }

    /// Persist a status transition (conditional on `previous`)
    pub fn transition_market_status(
        &self,
        key: &str,
        previous: MarketStatus,
        new: MarketStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        market::transition_status(&mut conn, key, previous, new, at)
    }

    /// Move `status_changed_at` forward after a cycle nobody observed
    pub fn record_missed_market_cycle(
        &self,
        key: &str,
        status: MarketStatus,
        previous: MarketStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        market::record_missed_cycle(&mut conn, key, status, previous, at)
    }

    /// Status history of a market
    pub fn get_market_status_log(&self, key: &str) -> Result<Vec<StatusLogEntry>> {
        let conn = self.conn.lock();
        market::get_status_log(&conn, key)
    }

    /// Insert or update one weekday timing
    pub fn upsert_market_timing(&self, timing: &MarketTiming) -> Result<()> {
        let conn = self.conn.lock();
        market::upsert_timing(&conn, timing)
    }

    /// Get the weekly timings of an exchange
    pub fn get_market_timings(&self, exchange: &str) -> Result<Vec<MarketTiming>> {
        let conn = self.conn.lock();
        market::get_timings(&conn, exchange)
    }

    /// Build the clock calendar of a market
    pub fn load_market_calendar(&self, market: &Market) -> Result<MarketCalendar> {
        let conn = self.conn.lock();
        market::load_calendar(&conn, market)
    }

    // ========== Holiday Methods ==========

    /// Create a market holiday
    pub fn create_market_holiday(&self, req: &CreateHolidayRequest) -> Result<MarketHoliday> {
        let mut conn = self.conn.lock();
        market::create_holiday(&mut conn, req)
    }

    /// Get holidays of an exchange
    pub fn get_market_holidays_by_exchange(&self, exchange: &str, year: Option<i32>) -> Result<Vec<MarketHoliday>> {
        let conn = self.conn.lock();
        market::get_holidays_by_exchange(&conn, exchange, year)
    }

    /// Check if a date is a holiday for an exchange
    pub fn is_market_holiday(&self, exchange: &str, date: NaiveDate) -> Result<bool> {
        let conn = self.conn.lock();
        market::is_holiday(&conn, exchange, date)
    }

    /// Delete a market holiday
    pub fn delete_market_holiday(&self, id: i64) -> Result<bool> {
        let mut conn = self.conn.lock();
        market::delete_holiday(&mut conn, id)
    }

    // ========== Instrument Methods ==========

    /// Insert or update an instrument
    pub fn upsert_instrument(&self, instrument: &Instrument) -> Result<()> {
        let conn = self.conn.lock();
        instrument::upsert_instrument(&conn, instrument)
    }

    /// Get an instrument by symbol
    pub fn get_instrument(&self, symbol: &str) -> Result<Option<Instrument>> {
        let conn = self.conn.lock();
        instrument::get_instrument(&conn, symbol)
    }

    /// Get the active instruments of a market
    pub fn get_active_instruments(&self, market_key: &str) -> Result<Vec<Instrument>> {
        let conn = self.conn.lock();
        instrument::get_active_instruments(&conn, market_key)
    }

    // ========== Session Methods ==========

    /// Check whether a capture group exists
    pub fn session_group_exists(&self, group_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        session::group_exists(&conn, group_id)
    }

    /// Insert a capture group; `None` if it already exists
    pub fn insert_session_group(
        &self,
        group_id: &str,
        market_key: &str,
        captured_at: DateTime<Utc>,
        rows: &[NewSessionRecord],
    ) -> Result<Option<Vec<i64>>> {
        let mut conn = self.conn.lock();
        session::insert_group(&mut conn, group_id, market_key, captured_at, rows)
    }

    /// Rows of a capture group
    pub fn get_session_group(&self, group_id: &str) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        session::get_group(&conn, group_id)
    }

    /// Get one session record
    pub fn get_session(&self, id: i64) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        session::get_session(&conn, id)
    }

    /// Ids of PENDING records
    pub fn get_pending_session_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        session::get_pending_ids(&conn)
    }

    /// Most recent capture group of a market
    pub fn latest_session_group(&self, market_key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        session::latest_group_id(&conn, market_key)
    }

    /// Conditionally finalize a PENDING record
    pub fn finalize_session_outcome(
        &self,
        id: i64,
        outcome: Outcome,
        price: f64,
        kind: OutcomeKind,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        session::finalize_outcome(&conn, id, outcome, price, kind, at)
    }

    /// Record a close price unless one is already set
    pub fn record_session_close(&self, id: i64, price: f64, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        session::record_close_price(&conn, id, price, at)
    }

    /// Outcome counts per symbol
    pub fn get_outcome_summary(&self, market_key: &str) -> Result<Vec<OutcomeSummary>> {
        let conn = self.conn.lock();
        session::outcome_summary(&conn, market_key)
    }

    /// Fold opening prices into the rolling statistic
    pub fn update_open_price_stats(&self, market_key: &str, prices: &[(String, f64)]) -> Result<()> {
        let mut conn = self.conn.lock();
        session::update_open_price_stats(&mut conn, market_key, prices)
    }

    /// Get the open-price statistic of a symbol
    pub fn get_open_price_stat(&self, market_key: &str, symbol: &str) -> Result<Option<OpenPriceStat>> {
        let conn = self.conn.lock();
        session::get_open_price_stat(&conn, market_key, symbol)
    }

    // ========== Settings Methods ==========

    /// Get engine settings
    pub fn get_engine_settings(&self) -> Result<EngineSettings> {
        let conn = self.conn.lock();
        settings::get_engine_settings(&conn)
    }

    /// Update engine settings
    pub fn update_engine_settings(&self, update: &SettingsUpdate) -> Result<EngineSettings> {
        let conn = self.conn.lock();
        settings::update_engine_settings(&conn, update)
    }

    /// Raw SQL against the store, for tests that need to break it
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(sql)?;
        Ok(())
    }
}
