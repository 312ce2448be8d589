//! SQLite database models

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Implements `as_str`, `Display`, `FromStr` and the rusqlite conversions for a
/// unit enum stored as TEXT.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("invalid {} value '{}'", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

// ============================================================================
// Market
// ============================================================================

/// Computed trading status of a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    Closed,
    Premarket,
    Open,
}

text_enum!(MarketStatus {
    Closed => "CLOSED",
    Premarket => "PREMARKET",
    Open => "OPEN",
});

/// Market (exchange) configuration plus its persisted status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub key: String,
    pub name: String,
    /// IANA timezone name, e.g. `America/New_York`
    pub timezone: String,
    pub active: bool,
    pub capture_enabled: bool,
    /// Whether futures instruments of this market are captured
    pub futures_capture_enabled: bool,
    /// Instrument whose quotes stand in for the composite row
    pub composite_reference: Option<String>,
    pub status: MarketStatus,
    pub status_changed_at: Option<DateTime<Utc>>,
}

/// Trading window for one weekday of one exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketTiming {
    pub exchange: String,
    /// ISO weekday, 1 = Monday .. 7 = Sunday
    pub weekday: u32,
    pub pre_open_start: Option<NaiveTime>,
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
}

/// Market holiday entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHoliday {
    pub id: i64,
    pub date: NaiveDate,
    pub description: Option<String>,
    pub year: i32,
    pub exchanges: Vec<HolidayExchange>,
}

/// Per-exchange holiday rule; `early_close` of `None` means fully closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolidayExchange {
    pub exchange: String,
    pub early_close: Option<NaiveTime>,
}

/// Create request for a market holiday
#[derive(Debug, Clone, Deserialize)]
pub struct CreateHolidayRequest {
    pub date: NaiveDate,
    pub description: Option<String>,
    pub exchanges: Vec<HolidayExchange>,
}

/// Persisted status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusLogEntry {
    pub market_key: String,
    pub previous_status: MarketStatus,
    pub new_status: MarketStatus,
    pub changed_at: DateTime<Utc>,
}

// ============================================================================
// Instrument
// ============================================================================

/// How a target offset is applied to the entry price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetMode {
    Points,
    Percent,
}

text_enum!(OffsetMode {
    Points => "points",
    Percent => "percent",
});

/// One side of a target band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetOffset {
    pub mode: OffsetMode,
    pub value: f64,
}

/// Precision and offsets used to derive a target band for a symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecisionConfig {
    /// Display decimal places; `None` means not configured
    pub precision: Option<u32>,
    pub high: Option<TargetOffset>,
    pub low: Option<TargetOffset>,
}

/// Tradable instrument configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub market_key: String,
    /// Key in the quote source; defaults to `symbol`
    pub feed_symbol: Option<String>,
    pub tick_value: f64,
    pub margin: f64,
    pub include_in_composite: bool,
    pub is_future: bool,
    pub active: bool,
    pub signal: Option<Signal>,
    pub signal_weight: f64,
    pub band: PrecisionConfig,
}

impl Instrument {
    /// Symbol to look up in the quote source
    pub fn quote_symbol(&self) -> &str {
        self.feed_symbol.as_deref().unwrap_or(&self.symbol)
    }
}

// ============================================================================
// Session records
// ============================================================================

/// Directional signal attached to a captured row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

text_enum!(Signal {
    StrongBuy => "STRONG_BUY",
    Buy => "BUY",
    Hold => "HOLD",
    Sell => "SELL",
    StrongSell => "STRONG_SELL",
});

/// Trade direction implied by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Long,
    Short,
    Neutral,
}

impl Signal {
    /// Numeric score from -2 (strong sell) to +2 (strong buy)
    pub fn score(&self) -> i32 {
        match self {
            Signal::StrongBuy => 2,
            Signal::Buy => 1,
            Signal::Hold => 0,
            Signal::Sell => -1,
            Signal::StrongSell => -2,
        }
    }

    /// Nearest signal for a (possibly fractional) score
    pub fn from_score(score: f64) -> Signal {
        match score.round() as i64 {
            s if s >= 2 => Signal::StrongBuy,
            1 => Signal::Buy,
            0 => Signal::Hold,
            -1 => Signal::Sell,
            _ => Signal::StrongSell,
        }
    }

    pub fn bias(&self) -> Bias {
        match self.score() {
            s if s > 0 => Bias::Long,
            s if s < 0 => Bias::Short,
            _ => Bias::Neutral,
        }
    }
}

/// Grading outcome of a session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pending,
    Worked,
    DidntWork,
    Neutral,
}

text_enum!(Outcome {
    Pending => "PENDING",
    Worked => "WORKED",
    DidntWork => "DIDNT_WORK",
    Neutral => "NEUTRAL",
});

/// Which threshold finalized a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Target,
    Stop,
}

text_enum!(OutcomeKind {
    Target => "TARGET",
    Stop => "STOP",
});

/// Row symbol used for the composite record of a group
pub const COMPOSITE_SYMBOL: &str = "TOTAL";

/// Session record as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub group_id: String,
    pub market_key: String,
    pub symbol: String,
    pub feed_symbol: String,
    pub is_composite: bool,
    pub captured_at: DateTime<Utc>,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: Option<i64>,
    pub prev_close: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub high_52w: Option<f64>,
    pub low_52w: Option<f64>,
    pub signal: Option<Signal>,
    pub signal_weight: f64,
    pub entry_price: Option<f64>,
    pub target_high: Option<f64>,
    pub target_low: Option<f64>,
    pub outcome: Outcome,
    pub outcome_price: Option<f64>,
    pub outcome_kind: Option<OutcomeKind>,
    pub outcome_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
    pub close_at: Option<DateTime<Utc>>,
}

/// Session record ready to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewSessionRecord {
    pub symbol: String,
    pub feed_symbol: String,
    pub is_composite: bool,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: Option<i64>,
    pub prev_close: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub high_52w: Option<f64>,
    pub low_52w: Option<f64>,
    pub signal: Option<Signal>,
    pub signal_weight: f64,
    pub entry_price: Option<f64>,
    pub target_high: Option<f64>,
    pub target_low: Option<f64>,
}

impl NewSessionRecord {
    /// Whether the row can ever be graded; otherwise it is stored as NEUTRAL
    pub fn is_gradable(&self) -> bool {
        let directional = matches!(
            self.signal.map(|s| s.bias()),
            Some(Bias::Long) | Some(Bias::Short)
        );
        directional
            && self.entry_price.is_some()
            && self.target_high.is_some()
            && self.target_low.is_some()
    }

    pub fn initial_outcome(&self) -> Outcome {
        if self.is_gradable() {
            Outcome::Pending
        } else {
            Outcome::Neutral
        }
    }
}

/// Outcome counts for one symbol of a market
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub symbol: String,
    pub worked: i64,
    pub didnt_work: i64,
    pub neutral: i64,
    pub pending: i64,
}

/// Rolling statistic of prices seen at market open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPriceStat {
    pub market_key: String,
    pub symbol: String,
    pub first_open_price: f64,
    pub last_open_price: f64,
    pub avg_open_price: f64,
    pub sample_count: i64,
}

// ============================================================================
// Settings
// ============================================================================

/// Engine settings (single row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub grading_interval_ms: u64,
    pub persist_retry_initial_ms: u64,
    pub persist_retry_max_ms: u64,
    pub capture_retry_delays_ms: Vec<u64>,
    /// 0 disables the staleness check
    pub max_quote_age_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            grading_interval_ms: 1000,
            persist_retry_initial_ms: 500,
            persist_retry_max_ms: 30_000,
            capture_retry_delays_ms: vec![1000, 5000, 15000],
            max_quote_age_secs: 0,
        }
    }
}
