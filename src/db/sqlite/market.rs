//! Markets, trading timings and holidays
//!
//! Configuration is written by the surrounding application; the engine only
//! reads it, except for `status` which the market scheduler owns.

use super::models::{
    CreateHolidayRequest, HolidayExchange, Market, MarketHoliday, MarketStatus, MarketTiming,
    StatusLogEntry,
};
use crate::error::Result;
use crate::market::{DaySchedule, HolidayRule, MarketCalendar};
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use rusqlite::{params, Connection, OptionalExtension, Row};

// ============================================================================
// Markets
// ============================================================================

const MARKET_COLUMNS: &str = "key, name, timezone, active, capture_enabled, futures_capture_enabled, \
     composite_reference, status, status_changed_at";

fn market_from_row(row: &Row<'_>) -> rusqlite::Result<Market> {
    Ok(Market {
        key: row.get(0)?,
        name: row.get(1)?,
        timezone: row.get(2)?,
        active: row.get(3)?,
        capture_enabled: row.get(4)?,
        futures_capture_enabled: row.get(5)?,
        composite_reference: row.get(6)?,
        status: row.get(7)?,
        status_changed_at: row.get(8)?,
    })
}

/// Insert or replace a market's configuration. Status is left untouched on update.
pub fn upsert_market(conn: &Connection, market: &Market) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO markets (key, name, timezone, active, capture_enabled,
                             futures_capture_enabled, composite_reference)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(key) DO UPDATE SET
            name = excluded.name,
            timezone = excluded.timezone,
            active = excluded.active,
            capture_enabled = excluded.capture_enabled,
            futures_capture_enabled = excluded.futures_capture_enabled,
            composite_reference = excluded.composite_reference
        "#,
        params![
            market.key,
            market.name,
            market.timezone,
            market.active,
            market.capture_enabled,
            market.futures_capture_enabled,
            market.composite_reference
        ],
    )?;

    tracing::info!("Saved market configuration: {}", market.key);
    Ok(())
}

/// Get a market by key
pub fn get_market(conn: &Connection, key: &str) -> Result<Option<Market>> {
    let market = conn
        .query_row(
            &format!("SELECT {} FROM markets WHERE key = ?1", MARKET_COLUMNS),
            params![key],
            market_from_row,
        )
        .optional()?;
    Ok(market)
}

/// Get all active markets
pub fn get_active_markets(conn: &Connection) -> Result<Vec<Market>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM markets WHERE active = 1 ORDER BY key",
        MARKET_COLUMNS
    ))?;

    let markets = stmt
        .query_map([], market_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(markets)
}

/// Persist a status transition.
///
/// Conditional on the stored status still being `previous`, so the same value
/// is never rewritten and a stale writer cannot clobber a newer transition.
/// The transition is appended to `market_status_log` in the same transaction.
/// Returns `false` when nothing was written.
pub fn transition_status(
    conn: &mut Connection,
    key: &str,
    previous: MarketStatus,
    new: MarketStatus,
    at: DateTime<Utc>,
) -> Result<bool> {
    if previous == new {
        return Ok(false);
    }

    let tx = conn.transaction()?;
    let rows = tx.execute(
        "UPDATE markets SET status = ?1, status_changed_at = ?2 WHERE key = ?3 AND status = ?4",
        params![new, at, key, previous],
    )?;

    if rows == 0 {
        return Ok(false);
    }

    tx.execute(
        "INSERT INTO market_status_log (market_key, previous_status, new_status, changed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![key, previous, new, at],
    )?;
    tx.commit()?;

    Ok(true)
}

/// Persist a full cycle that happened while nothing was watching.
///
/// The stored status equals `status` again, but the market left and
/// re-entered it. Only `status_changed_at` moves forward, and only when `at`
/// is later than the stored value. The re-entry is logged as
/// `previous -> status`. Returns `false` when nothing was written.
pub fn record_missed_cycle(
    conn: &mut Connection,
    key: &str,
    status: MarketStatus,
    previous: MarketStatus,
    at: DateTime<Utc>,
) -> Result<bool> {
    if previous == status {
        return Ok(false);
    }

    let tx = conn.transaction()?;
    let rows = tx.execute(
        "UPDATE markets SET status_changed_at = ?1
         WHERE key = ?2 AND status = ?3 AND (status_changed_at IS NULL OR status_changed_at < ?1)",
        params![at, key, status],
    )?;

    if rows == 0 {
        return Ok(false);
    }

    tx.execute(
        "INSERT INTO market_status_log (market_key, previous_status, new_status, changed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![key, previous, status, at],
    )?;
    tx.commit()?;

    Ok(true)
}

/// Status history of a market, oldest first
pub fn get_status_log(conn: &Connection, key: &str) -> Result<Vec<StatusLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT market_key, previous_status, new_status, changed_at
         FROM market_status_log WHERE market_key = ?1 ORDER BY id",
    )?;

    let entries = stmt
        .query_map(params![key], |row| {
            Ok(StatusLogEntry {
                market_key: row.get(0)?,
                previous_status: row.get(1)?,
                new_status: row.get(2)?,
                changed_at: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(entries)
}

// ============================================================================
// Market Timings
// ============================================================================

/// Insert or replace the timing of one weekday
pub fn upsert_timing(conn: &Connection, timing: &MarketTiming) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO market_timings (exchange, weekday, pre_open_start, market_open, market_close)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(exchange, weekday) DO UPDATE SET
            pre_open_start = excluded.pre_open_start,
            market_open = excluded.market_open,
            market_close = excluded.market_close
        "#,
        params![
            timing.exchange,
            timing.weekday,
            timing.pre_open_start,
            timing.market_open,
            timing.market_close
        ],
    )?;
    Ok(())
}

/// Get the weekly timings for an exchange
pub fn get_timings(conn: &Connection, exchange: &str) -> Result<Vec<MarketTiming>> {
    let mut stmt = conn.prepare(
        "SELECT exchange, weekday, pre_open_start, market_open, market_close
         FROM market_timings WHERE exchange = ?1 ORDER BY weekday",
    )?;

    let timings = stmt
        .query_map(params![exchange], |row| {
            Ok(MarketTiming {
                exchange: row.get(0)?,
                weekday: row.get(1)?,
                pre_open_start: row.get(2)?,
                market_open: row.get(3)?,
                market_close: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(timings)
}

// ============================================================================
// Market Holidays
// ============================================================================

/// Create a new market holiday
pub fn create_holiday(conn: &mut Connection, req: &CreateHolidayRequest) -> Result<MarketHoliday> {
    let year = req.date.year();

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO market_holidays (date, description, year) VALUES (?1, ?2, ?3)",
        params![req.date, req.description, year],
    )?;

    let id = tx.last_insert_rowid();

    for exchange in &req.exchanges {
        tx.execute(
            "INSERT INTO market_holiday_exchanges (holiday_id, exchange, early_close) VALUES (?1, ?2, ?3)",
            params![id, exchange.exchange, exchange.early_close],
        )?;
    }
    tx.commit()?;

    tracing::info!("Created market holiday: {} ({})", req.date, id);

    Ok(MarketHoliday {
        id,
        date: req.date,
        description: req.description.clone(),
        year,
        exchanges: req.exchanges.clone(),
    })
}

/// Get all holidays for an exchange, optionally limited to one year
pub fn get_holidays_by_exchange(
    conn: &Connection,
    exchange: &str,
    year: Option<i32>,
) -> Result<Vec<MarketHoliday>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT h.id, h.date, h.description, h.year
        FROM market_holidays h
        INNER JOIN market_holiday_exchanges e ON h.id = e.holiday_id
        WHERE e.exchange = ?1 AND (?2 IS NULL OR h.year = ?2)
        ORDER BY h.date
        "#,
    )?;

    let holidays: Vec<(i64, NaiveDate, Option<String>, i32)> = stmt
        .query_map(params![exchange, year], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut result = Vec::new();
    for (id, date, description, year) in holidays {
        let exchanges = get_holiday_exchanges(conn, id)?;
        result.push(MarketHoliday {
            id,
            date,
            description,
            year,
            exchanges,
        });
    }

    Ok(result)
}

/// Check if a date is a holiday (full or early close) for an exchange
pub fn is_holiday(conn: &Connection, exchange: &str, date: NaiveDate) -> Result<bool> {
    let count: i64 = conn.query_row(
        r#"
        SELECT COUNT(*)
        FROM market_holidays h
        INNER JOIN market_holiday_exchanges e ON h.id = e.holiday_id
        WHERE e.exchange = ?1 AND h.date = ?2
        "#,
        params![exchange, date],
        |row| row.get(0),
    )?;

    Ok(count > 0)
}

fn get_holiday_exchanges(conn: &Connection, holiday_id: i64) -> Result<Vec<HolidayExchange>> {
    let mut stmt = conn.prepare(
        "SELECT exchange, early_close FROM market_holiday_exchanges WHERE holiday_id = ?1 ORDER BY exchange",
    )?;

    let exchanges = stmt
        .query_map(params![holiday_id], |row| {
            Ok(HolidayExchange {
                exchange: row.get(0)?,
                early_close: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(exchanges)
}

/// Delete a market holiday
pub fn delete_holiday(conn: &mut Connection, id: i64) -> Result<bool> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM market_holiday_exchanges WHERE holiday_id = ?1", params![id])?;
    let rows = tx.execute("DELETE FROM market_holidays WHERE id = ?1", params![id])?;
    tx.commit()?;
    Ok(rows > 0)
}

// ============================================================================
// Calendar
// ============================================================================

fn weekday_from_iso(weekday: u32) -> Option<Weekday> {
    match weekday {
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        7 => Some(Weekday::Sun),
        _ => None,
    }
}

/// Assemble the clock calendar of a market from its timings and holidays
pub fn load_calendar(conn: &Connection, market: &Market) -> Result<MarketCalendar> {
    let mut calendar = MarketCalendar::for_timezone(&market.timezone)?;

    for timing in get_timings(conn, &market.key)? {
        match weekday_from_iso(timing.weekday) {
            Some(weekday) => calendar.set_day(
                weekday,
                Some(DaySchedule {
                    pre_open: timing.pre_open_start,
                    open: timing.market_open,
                    close: timing.market_close,
                }),
            ),
            None => tracing::warn!(
                "Ignoring timing with invalid weekday {} for {}",
                timing.weekday,
                market.key
            ),
        }
    }

    for holiday in get_holidays_by_exchange(conn, &market.key, None)? {
        let rule = holiday
            .exchanges
            .iter()
            .find(|e| e.exchange == market.key)
            .and_then(|e| e.early_close)
            .map(HolidayRule::EarlyClose)
            .unwrap_or(HolidayRule::Closed);
        calendar.add_holiday(holiday.date, rule);
    }

    Ok(calendar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::migrations::run_migrations;
    use crate::market::compute_status;
    use chrono::{NaiveTime, TimeZone};

    fn create_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn test_market(key: &str) -> Market {
        Market {
            key: key.to_string(),
            name: "Test Exchange".to_string(),
            timezone: "America/New_York".to_string(),
            active: true,
            capture_enabled: true,
            futures_capture_enabled: true,
            composite_reference: None,
            status: MarketStatus::Closed,
            status_changed_at: None,
        }
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_seeded_timings_parse() {
        let conn = create_test_db();
        let timings = get_timings(&conn, "NSE").unwrap();
        assert_eq!(timings.len(), 5);
        assert_eq!(timings[0].pre_open_start, Some(hm(9, 0)));
        assert_eq!(timings[0].market_open, hm(9, 15));
        assert_eq!(timings[0].market_close, hm(15, 30));
    }

    #[test]
    fn test_upsert_keeps_status() {
        let mut conn = create_test_db();
        upsert_market(&conn, &test_market("XNYS")).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 7, 3, 13, 30, 0).unwrap();
        assert!(transition_status(&mut conn, "XNYS", MarketStatus::Closed, MarketStatus::Open, at).unwrap());

        let mut renamed = test_market("XNYS");
        renamed.name = "New York".to_string();
        upsert_market(&conn, &renamed).unwrap();

        let market = get_market(&conn, "XNYS").unwrap().unwrap();
        assert_eq!(market.name, "New York");
        assert_eq!(market.status, MarketStatus::Open);
        assert_eq!(market.status_changed_at, Some(at));
    }

    #[test]
    fn test_transition_is_conditional() {
        let mut conn = create_test_db();
        upsert_market(&conn, &test_market("XNYS")).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 7, 3, 13, 30, 0).unwrap();

        // Same value never rewritten
        assert!(!transition_status(&mut conn, "XNYS", MarketStatus::Closed, MarketStatus::Closed, at).unwrap());
        // Stale previous status rejected
        assert!(!transition_status(&mut conn, "XNYS", MarketStatus::Premarket, MarketStatus::Open, at).unwrap());
        assert!(transition_status(&mut conn, "XNYS", MarketStatus::Closed, MarketStatus::Open, at).unwrap());
        assert!(!transition_status(&mut conn, "XNYS", MarketStatus::Closed, MarketStatus::Open, at).unwrap());

        let log = get_status_log(&conn, "XNYS").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].previous_status, MarketStatus::Closed);
        assert_eq!(log[0].new_status, MarketStatus::Open);
        assert_eq!(log[0].changed_at, at);
    }

    #[test]
    fn test_missed_cycle_only_moves_forward() {
        let mut conn = create_test_db();
        upsert_market(&conn, &test_market("XNYS")).unwrap();
        let wed = Utc.with_ymd_and_hms(2024, 7, 3, 13, 30, 0).unwrap();
        let thu = Utc.with_ymd_and_hms(2024, 7, 4, 13, 30, 0).unwrap();
        assert!(transition_status(&mut conn, "XNYS", MarketStatus::Closed, MarketStatus::Open, wed).unwrap());

        // Stored status must match
        assert!(!record_missed_cycle(&mut conn, "XNYS", MarketStatus::Closed, MarketStatus::Open, thu).unwrap());
        assert!(record_missed_cycle(&mut conn, "XNYS", MarketStatus::Open, MarketStatus::Closed, thu).unwrap());
        // Same or older instant is a no-op
        assert!(!record_missed_cycle(&mut conn, "XNYS", MarketStatus::Open, MarketStatus::Closed, thu).unwrap());
        assert!(!record_missed_cycle(&mut conn, "XNYS", MarketStatus::Open, MarketStatus::Closed, wed).unwrap());

        let market = get_market(&conn, "XNYS").unwrap().unwrap();
        assert_eq!(market.status, MarketStatus::Open);
        assert_eq!(market.status_changed_at, Some(thu));

        let log = get_status_log(&conn, "XNYS").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].previous_status, MarketStatus::Closed);
        assert_eq!(log[1].new_status, MarketStatus::Open);
        assert_eq!(log[1].changed_at, thu);
    }

    #[test]
    fn test_futures_flag_round_trips() {
        let conn = create_test_db();
        let mut market = test_market("XNYS");
        market.futures_capture_enabled = false;
        upsert_market(&conn, &market).unwrap();
        assert!(!get_market(&conn, "XNYS").unwrap().unwrap().futures_capture_enabled);
        // Seeded markets default to capturing futures
        assert!(get_market(&conn, "MCX").unwrap().unwrap().futures_capture_enabled);
    }

    #[test]
    fn test_holiday_crud() {
        let mut conn = create_test_db();
        let date = NaiveDate::from_ymd_opt(2024, 12, 24).unwrap();
        let holiday = create_holiday(
            &mut conn,
            &CreateHolidayRequest {
                date,
                description: Some("Christmas Eve".to_string()),
                exchanges: vec![
                    HolidayExchange { exchange: "NSE".to_string(), early_close: None },
                    HolidayExchange { exchange: "MCX".to_string(), early_close: Some(hm(17, 0)) },
                ],
            },
        )
        .unwrap();

        assert!(is_holiday(&conn, "NSE", date).unwrap());
        assert!(!is_holiday(&conn, "BSE", date).unwrap());

        let mcx = get_holidays_by_exchange(&conn, "MCX", Some(2024)).unwrap();
        assert_eq!(mcx.len(), 1);
        assert_eq!(mcx[0].exchanges.len(), 2);
        assert!(get_holidays_by_exchange(&conn, "MCX", Some(2023)).unwrap().is_empty());

        assert!(delete_holiday(&mut conn, holiday.id).unwrap());
        assert!(!is_holiday(&conn, "NSE", date).unwrap());
    }

    #[test]
    fn test_load_calendar_applies_exchange_rules() {
        let mut conn = create_test_db();
        let date = NaiveDate::from_ymd_opt(2024, 12, 24).unwrap(); // Tuesday
        create_holiday(
            &mut conn,
            &CreateHolidayRequest {
                date,
                description: None,
                exchanges: vec![
                    HolidayExchange { exchange: "NSE".to_string(), early_close: None },
                    HolidayExchange { exchange: "MCX".to_string(), early_close: Some(hm(17, 0)) },
                ],
            },
        )
        .unwrap();

        let ist = chrono_tz::Asia::Kolkata;
        let noon = ist.with_ymd_and_hms(2024, 12, 24, 12, 0, 0).unwrap().with_timezone(&Utc);
        let evening = ist.with_ymd_and_hms(2024, 12, 24, 18, 0, 0).unwrap().with_timezone(&Utc);

        let nse = load_calendar(&conn, &get_market(&conn, "NSE").unwrap().unwrap()).unwrap();
        assert_eq!(compute_status(&nse, noon).status, MarketStatus::Closed);

        let mcx = load_calendar(&conn, &get_market(&conn, "MCX").unwrap().unwrap()).unwrap();
        assert_eq!(compute_status(&mcx, noon).status, MarketStatus::Open);
        assert_eq!(compute_status(&mcx, evening).status, MarketStatus::Closed);
    }
}
