//! SQLite database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Run all database migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    // Create migrations table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    run_migration(conn, "001_settings", CREATE_SETTINGS_TABLE)?;
    run_migration(conn, "002_markets", CREATE_MARKETS_TABLE)?;
    run_migration(conn, "003_market_timings", CREATE_MARKET_TIMINGS_TABLE)?;
    run_migration(conn, "004_market_holidays", CREATE_MARKET_HOLIDAYS_TABLE)?;
    run_migration(conn, "005_market_status_log", CREATE_MARKET_STATUS_LOG_TABLE)?;
    run_migration(conn, "006_instruments", CREATE_INSTRUMENTS_TABLE)?;
    run_migration(conn, "007_sessions", CREATE_SESSIONS_TABLE)?;
    run_migration(conn, "008_open_price_stats", CREATE_OPEN_PRICE_STATS_TABLE)?;
    run_migration(conn, "009_seed_markets", SEED_DEFAULT_MARKETS)?;

    tracing::info!("Database migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    // Check if migration already applied
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?)",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("Running migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    }

    Ok(())
}

const CREATE_SETTINGS_TABLE: &str = r#"
CREATE TABLE settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    grading_interval_ms INTEGER NOT NULL DEFAULT 1000,
    persist_retry_initial_ms INTEGER NOT NULL DEFAULT 500,
    persist_retry_max_ms INTEGER NOT NULL DEFAULT 30000,
    -- Delays between capture retries as JSON array (milliseconds)
    capture_retry_delays_ms TEXT NOT NULL DEFAULT '[1000, 5000, 15000]',
    max_quote_age_secs INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
INSERT OR IGNORE INTO settings (id) VALUES (1);
"#;

const CREATE_MARKETS_TABLE: &str = r#"
CREATE TABLE markets (
    key TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    timezone TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    capture_enabled INTEGER NOT NULL DEFAULT 0,
    -- Off: instruments flagged is_future are left out of capture
    futures_capture_enabled INTEGER NOT NULL DEFAULT 1,
    composite_reference TEXT,
    status TEXT NOT NULL DEFAULT 'CLOSED'
        CHECK (status IN ('CLOSED', 'PREMARKET', 'OPEN')),
    status_changed_at TEXT
);
"#;

const CREATE_MARKET_TIMINGS_TABLE: &str = r#"
CREATE TABLE market_timings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL REFERENCES markets(key) ON DELETE CASCADE,
    weekday INTEGER NOT NULL CHECK (weekday BETWEEN 1 AND 7),
    pre_open_start TEXT,
    market_open TEXT NOT NULL,
    market_close TEXT NOT NULL,
    UNIQUE(exchange, weekday)
);
"#;

const CREATE_MARKET_HOLIDAYS_TABLE: &str = r#"
CREATE TABLE market_holidays (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL,
    description TEXT,
    year INTEGER NOT NULL,
    UNIQUE(date)
);

CREATE TABLE market_holiday_exchanges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    holiday_id INTEGER NOT NULL REFERENCES market_holidays(id) ON DELETE CASCADE,
    exchange TEXT NOT NULL,
    -- NULL means the exchange is closed for the whole day
    early_close TEXT,
    UNIQUE(holiday_id, exchange)
);
"#;

const CREATE_MARKET_STATUS_LOG_TABLE: &str = r#"
CREATE TABLE market_status_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_key TEXT NOT NULL,
    previous_status TEXT NOT NULL,
    new_status TEXT NOT NULL,
    changed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_market_status_log_market ON market_status_log(market_key, changed_at);
"#;

const CREATE_INSTRUMENTS_TABLE: &str = r#"
CREATE TABLE instruments (
    symbol TEXT PRIMARY KEY,
    market_key TEXT NOT NULL REFERENCES markets(key) ON DELETE CASCADE,
    feed_symbol TEXT,
    display_precision INTEGER,
    tick_value REAL NOT NULL DEFAULT 0,
    margin REAL NOT NULL DEFAULT 0,
    include_in_composite INTEGER NOT NULL DEFAULT 1,
    is_future INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    signal TEXT,
    signal_weight REAL NOT NULL DEFAULT 1,
    offset_high_mode TEXT CHECK (offset_high_mode IN ('points', 'percent')),
    offset_high_value REAL,
    offset_low_mode TEXT CHECK (offset_low_mode IN ('points', 'percent')),
    offset_low_value REAL
);
CREATE INDEX IF NOT EXISTS idx_instruments_market ON instruments(market_key);
"#;

const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id TEXT NOT NULL,
    market_key TEXT NOT NULL,
    symbol TEXT NOT NULL,
    feed_symbol TEXT NOT NULL,
    is_composite INTEGER NOT NULL DEFAULT 0,
    captured_at TEXT NOT NULL,
    last REAL,
    bid REAL,
    ask REAL,
    volume INTEGER,
    prev_close REAL,
    high_24h REAL,
    low_24h REAL,
    high_52w REAL,
    low_52w REAL,
    signal TEXT,
    signal_weight REAL NOT NULL DEFAULT 0,
    entry_price REAL,
    target_high REAL,
    target_low REAL,
    outcome TEXT NOT NULL DEFAULT 'PENDING'
        CHECK (outcome IN ('PENDING', 'WORKED', 'DIDNT_WORK', 'NEUTRAL')),
    outcome_price REAL,
    outcome_kind TEXT CHECK (outcome_kind IN ('TARGET', 'STOP')),
    outcome_at TEXT,
    close_price REAL,
    close_at TEXT,
    UNIQUE(group_id, symbol)
);
CREATE INDEX IF NOT EXISTS idx_sessions_pending ON sessions(outcome) WHERE outcome = 'PENDING';
CREATE INDEX IF NOT EXISTS idx_sessions_market ON sessions(market_key, captured_at);
"#;

const CREATE_OPEN_PRICE_STATS_TABLE: &str = r#"
CREATE TABLE open_price_stats (
    market_key TEXT NOT NULL,
    symbol TEXT NOT NULL,
    first_open_price REAL NOT NULL,
    last_open_price REAL NOT NULL,
    avg_open_price REAL NOT NULL,
    sample_count INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (market_key, symbol)
);
"#;

/// Indian exchanges, Monday to Friday. Capture stays disabled until
/// instruments are configured.
const SEED_DEFAULT_MARKETS: &str = r#"
INSERT OR IGNORE INTO markets (key, name, timezone, active, capture_enabled)
VALUES ('NSE', 'National Stock Exchange', 'Asia/Kolkata', 1, 0),
       ('BSE', 'Bombay Stock Exchange', 'Asia/Kolkata', 1, 0),
       ('MCX', 'Multi Commodity Exchange', 'Asia/Kolkata', 1, 0);

INSERT OR IGNORE INTO market_timings (exchange, weekday, pre_open_start, market_open, market_close)
VALUES ('NSE', 1, '09:00', '09:15', '15:30'), ('NSE', 2, '09:00', '09:15', '15:30'),
       ('NSE', 3, '09:00', '09:15', '15:30'), ('NSE', 4, '09:00', '09:15', '15:30'),
       ('NSE', 5, '09:00', '09:15', '15:30'),
       ('BSE', 1, '09:00', '09:15', '15:30'), ('BSE', 2, '09:00', '09:15', '15:30'),
       ('BSE', 3, '09:00', '09:15', '15:30'), ('BSE', 4, '09:00', '09:15', '15:30'),
       ('BSE', 5, '09:00', '09:15', '15:30'),
       ('MCX', 1, NULL, '09:00', '23:30'), ('MCX', 2, NULL, '09:00', '23:30'),
       ('MCX', 3, NULL, '09:00', '23:30'), ('MCX', 4, NULL, '09:00', '23:30'),
       ('MCX', 5, NULL, '09:00', '23:30');
"#;
