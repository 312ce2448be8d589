//! Instrument configuration

use super::models::{Instrument, OffsetMode, PrecisionConfig, TargetOffset};
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

const INSTRUMENT_COLUMNS: &str = "symbol, market_key, feed_symbol, display_precision, tick_value, margin,
    include_in_composite, is_future, active, signal, signal_weight,
    offset_high_mode, offset_high_value, offset_low_mode, offset_low_value";

fn instrument_from_row(row: &Row<'_>) -> rusqlite::Result<Instrument> {
    let high = match (row.get::<_, Option<OffsetMode>>(11)?, row.get::<_, Option<f64>>(12)?) {
        (Some(mode), Some(value)) => Some(TargetOffset { mode, value }),
        _ => None,
    };
    let low = match (row.get::<_, Option<OffsetMode>>(13)?, row.get::<_, Option<f64>>(14)?) {
        (Some(mode), Some(value)) => Some(TargetOffset { mode, value }),
        _ => None,
    };

    Ok(Instrument {
        symbol: row.get(0)?,
        market_key: row.get(1)?,
        feed_symbol: row.get(2)?,
        band: PrecisionConfig {
            precision: row.get(3)?,
            high,
            low,
        },
        tick_value: row.get(4)?,
        margin: row.get(5)?,
        include_in_composite: row.get(6)?,
        is_future: row.get(7)?,
        active: row.get(8)?,
        signal: row.get(9)?,
        signal_weight: row.get(10)?,
    })
}

/// Insert or replace an instrument
pub fn upsert_instrument(conn: &Connection, instrument: &Instrument) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO instruments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            INSTRUMENT_COLUMNS
        ),
        params![
            instrument.symbol,
            instrument.market_key,
            instrument.feed_symbol,
            instrument.band.precision,
            instrument.tick_value,
            instrument.margin,
            instrument.include_in_composite,
            instrument.is_future,
            instrument.active,
            instrument.signal,
            instrument.signal_weight,
            instrument.band.high.map(|o| o.mode),
            instrument.band.high.map(|o| o.value),
            instrument.band.low.map(|o| o.mode),
            instrument.band.low.map(|o| o.value),
        ],
    )?;

    tracing::debug!("Saved instrument {} ({})", instrument.symbol, instrument.market_key);
    Ok(())
}

/// Get an instrument by symbol
pub fn get_instrument(conn: &Connection, symbol: &str) -> Result<Option<Instrument>> {
    let instrument = conn
        .query_row(
            &format!("SELECT {} FROM instruments WHERE symbol = ?1", INSTRUMENT_COLUMNS),
            params![symbol],
            instrument_from_row,
        )
        .optional()?;
    Ok(instrument)
}

/// Get the active instruments of a market
pub fn get_active_instruments(conn: &Connection, market_key: &str) -> Result<Vec<Instrument>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM instruments WHERE market_key = ?1 AND active = 1 ORDER BY symbol",
        INSTRUMENT_COLUMNS
    ))?;

    let instruments = stmt
        .query_map(params![market_key], instrument_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(instruments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::migrations::run_migrations;
    use crate::db::sqlite::models::Signal;

    fn instrument(symbol: &str, active: bool) -> Instrument {
        Instrument {
            symbol: symbol.to_string(),
            market_key: "MCX".to_string(),
            feed_symbol: Some(format!("{}FUT", symbol)),
            tick_value: 1.0,
            margin: 5000.0,
            include_in_composite: true,
            is_future: true,
            active,
            signal: Some(Signal::Buy),
            signal_weight: 2.0,
            band: PrecisionConfig {
                precision: Some(2),
                high: Some(TargetOffset { mode: OffsetMode::Points, value: 2.0 }),
                low: Some(TargetOffset { mode: OffsetMode::Percent, value: 1.5 }),
            },
        }
    }

    #[test]
    fn test_instrument_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        upsert_instrument(&conn, &instrument("GOLD", true)).unwrap();
        let loaded = get_instrument(&conn, "GOLD").unwrap().unwrap();

        assert_eq!(loaded.quote_symbol(), "GOLDFUT");
        assert_eq!(loaded.signal, Some(Signal::Buy));
        assert_eq!(loaded.band, instrument("GOLD", true).band);
        assert!(get_instrument(&conn, "SILVER").unwrap().is_none());
    }

    #[test]
    fn test_active_instruments_only() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        upsert_instrument(&conn, &instrument("GOLD", true)).unwrap();
        upsert_instrument(&conn, &instrument("SILVER", false)).unwrap();

        let active = get_active_instruments(&conn, "MCX").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].symbol, "GOLD");
    }

    #[test]
    fn test_missing_offset_value_means_no_offset() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let mut partial = instrument("CRUDE", true);
        partial.band = PrecisionConfig::default();
        upsert_instrument(&conn, &partial).unwrap();

        let loaded = get_instrument(&conn, "CRUDE").unwrap().unwrap();
        assert_eq!(loaded.band, PrecisionConfig::default());
        assert_eq!(loaded.quote_symbol(), "CRUDEFUT");
    }
}
