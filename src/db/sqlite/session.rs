//! Session records: capture groups, grading outcomes and close metrics

use super::models::{
    NewSessionRecord, OpenPriceStat, Outcome, OutcomeKind, OutcomeSummary, SessionRecord,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const SESSION_COLUMNS: &str = "id, group_id, market_key, symbol, feed_symbol, is_composite, captured_at,
    last, bid, ask, volume, prev_close, high_24h, low_24h, high_52w, low_52w,
    signal, signal_weight, entry_price, target_high, target_low,
    outcome, outcome_price, outcome_kind, outcome_at, close_price, close_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        group_id: row.get(1)?,
        market_key: row.get(2)?,
        symbol: row.get(3)?,
        feed_symbol: row.get(4)?,
        is_composite: row.get(5)?,
        captured_at: row.get(6)?,
        last: row.get(7)?,
        bid: row.get(8)?,
        ask: row.get(9)?,
        volume: row.get(10)?,
        prev_close: row.get(11)?,
        high_24h: row.get(12)?,
        low_24h: row.get(13)?,
        high_52w: row.get(14)?,
        low_52w: row.get(15)?,
        signal: row.get(16)?,
        signal_weight: row.get(17)?,
        entry_price: row.get(18)?,
        target_high: row.get(19)?,
        target_low: row.get(20)?,
        outcome: row.get(21)?,
        outcome_price: row.get(22)?,
        outcome_kind: row.get(23)?,
        outcome_at: row.get(24)?,
        close_price: row.get(25)?,
        close_at: row.get(26)?,
    })
}

/// Check whether any row of a capture group exists
pub fn group_exists(conn: &Connection, group_id: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sessions WHERE group_id = ?1)",
        params![group_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Insert all rows of a capture group in one transaction.
///
/// Returns `None` without writing when the group already exists. Rows that
/// cannot be graded are stored directly as NEUTRAL.
pub fn insert_group(
    conn: &mut Connection,
    group_id: &str,
    market_key: &str,
    captured_at: DateTime<Utc>,
    rows: &[NewSessionRecord],
) -> Result<Option<Vec<i64>>> {
    let tx = conn.transaction()?;

    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM sessions WHERE group_id = ?1)",
        params![group_id],
        |row| row.get(0),
    )?;
    if exists {
        return Ok(None);
    }

    let mut ids = Vec::with_capacity(rows.len());
    {
        let mut stmt = tx.prepare(
            r#"
            INSERT INTO sessions (
                group_id, market_key, symbol, feed_symbol, is_composite, captured_at,
                last, bid, ask, volume, prev_close, high_24h, low_24h, high_52w, low_52w,
                signal, signal_weight, entry_price, target_high, target_low, outcome, outcome_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22)
            "#,
        )?;

        for row in rows {
            let outcome = row.initial_outcome();
            let outcome_at = (outcome == Outcome::Neutral).then_some(captured_at);
            stmt.execute(params![
                group_id,
                market_key,
                row.symbol,
                row.feed_symbol,
                row.is_composite,
                captured_at,
                row.last,
                row.bid,
                row.ask,
                row.volume,
                row.prev_close,
                row.high_24h,
                row.low_24h,
                row.high_52w,
                row.low_52w,
                row.signal,
                row.signal_weight,
                row.entry_price,
                row.target_high,
                row.target_low,
                outcome,
                outcome_at,
            ])?;
            ids.push(tx.last_insert_rowid());
        }
    }

    tx.commit()?;
    Ok(Some(ids))
}

/// All rows of a capture group, composite last
pub fn get_group(conn: &Connection, group_id: &str) -> Result<Vec<SessionRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sessions WHERE group_id = ?1 ORDER BY is_composite, symbol",
        SESSION_COLUMNS
    ))?;

    let records = stmt
        .query_map(params![group_id], session_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(records)
}

/// Get one session record
pub fn get_session(conn: &Connection, id: i64) -> Result<Option<SessionRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Ids of rows still waiting for an outcome, served by the partial pending index
pub fn get_pending_ids(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM sessions WHERE outcome = 'PENDING' ORDER BY id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Most recent capture group of a market
pub fn latest_group_id(conn: &Connection, market_key: &str) -> Result<Option<String>> {
    let group = conn
        .query_row(
            "SELECT group_id FROM sessions WHERE market_key = ?1 ORDER BY captured_at DESC, id DESC LIMIT 1",
            params![market_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(group)
}

/// Finalize a record's outcome.
///
/// Single conditional write: only a row still PENDING transitions, so
/// concurrent grading passes produce exactly one outcome. Returns whether
/// this call performed the transition.
pub fn finalize_outcome(
    conn: &Connection,
    id: i64,
    outcome: Outcome,
    price: f64,
    kind: OutcomeKind,
    at: DateTime<Utc>,
) -> Result<bool> {
    let rows = conn.execute(
        r#"
        UPDATE sessions
        SET outcome = ?1, outcome_price = ?2, outcome_kind = ?3, outcome_at = ?4
        WHERE id = ?5 AND outcome = 'PENDING'
        "#,
        params![outcome, price, kind, at, id],
    )?;
    Ok(rows == 1)
}

/// Record the close price of a row, once
pub fn record_close_price(conn: &Connection, id: i64, price: f64, at: DateTime<Utc>) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE sessions SET close_price = ?1, close_at = ?2 WHERE id = ?3 AND close_price IS NULL",
        params![price, at, id],
    )?;
    Ok(rows == 1)
}

/// Outcome counts per symbol for a market
pub fn outcome_summary(conn: &Connection, market_key: &str) -> Result<Vec<OutcomeSummary>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT symbol,
               SUM(CASE WHEN outcome = 'WORKED' THEN 1 ELSE 0 END),
               SUM(CASE WHEN outcome = 'DIDNT_WORK' THEN 1 ELSE 0 END),
               SUM(CASE WHEN outcome = 'NEUTRAL' THEN 1 ELSE 0 END),
               SUM(CASE WHEN outcome = 'PENDING' THEN 1 ELSE 0 END)
        FROM sessions
        WHERE market_key = ?1
        GROUP BY symbol
        ORDER BY symbol
        "#,
    )?;

    let summary = stmt
        .query_map(params![market_key], |row| {
            Ok(OutcomeSummary {
                symbol: row.get(0)?,
                worked: row.get(1)?,
                didnt_work: row.get(2)?,
                neutral: row.get(3)?,
                pending: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(summary)
}

/// Fold opening prices into the rolling open-price statistic
pub fn update_open_price_stats(
    conn: &mut Connection,
    market_key: &str,
    prices: &[(String, f64)],
) -> Result<()> {
    let tx = conn.transaction()?;
    for (symbol, price) in prices {
        tx.execute(
            r#"
            INSERT INTO open_price_stats (market_key, symbol, first_open_price, last_open_price, avg_open_price, sample_count)
            VALUES (?1, ?2, ?3, ?3, ?3, 1)
            ON CONFLICT(market_key, symbol) DO UPDATE SET
                last_open_price = excluded.last_open_price,
                avg_open_price = (avg_open_price * sample_count + excluded.last_open_price) / (sample_count + 1),
                sample_count = sample_count + 1,
                updated_at = datetime('now')
            "#,
            params![market_key, symbol, price],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Get the open-price statistic of a symbol
pub fn get_open_price_stat(conn: &Connection, market_key: &str, symbol: &str) -> Result<Option<OpenPriceStat>> {
    let stat = conn
        .query_row(
            "SELECT market_key, symbol, first_open_price, last_open_price, avg_open_price, sample_count
             FROM open_price_stats WHERE market_key = ?1 AND symbol = ?2",
            params![market_key, symbol],
            |row| {
                Ok(OpenPriceStat {
                    market_key: row.get(0)?,
                    symbol: row.get(1)?,
                    first_open_price: row.get(2)?,
                    last_open_price: row.get(3)?,
                    avg_open_price: row.get(4)?,
                    sample_count: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(stat)
}
