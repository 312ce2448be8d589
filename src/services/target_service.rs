//! Target Band Service
//!
//! Derives the (high, low) exit band of a captured entry from the symbol's
//! offset configuration. Pure: no IO. Arithmetic runs in `Decimal` so that
//! round-half-up at the display precision is exact (100.125 -> 100.13).

use crate::db::sqlite::models::{OffsetMode, PrecisionConfig, TargetOffset};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Largest precision a display value is quantized to
const MAX_PRECISION: u32 = 8;

/// Exit band of one entry. A side is `None` when its offset is not configured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TargetBand {
    pub high: Option<f64>,
    pub low: Option<f64>,
    /// Whether the values were quantized to a configured precision
    pub quantized: bool,
}

/// Apply one offset to an entry price in the given direction (+1 / -1)
fn apply_offset(entry: Decimal, offset: &TargetOffset, direction: Decimal) -> Option<Decimal> {
    let value = Decimal::from_f64(offset.value)?;
    let delta = match offset.mode {
        OffsetMode::Points => value,
        OffsetMode::Percent => entry * value / Decimal::ONE_HUNDRED,
    };
    Some(entry + delta * direction)
}

/// Round half away from zero, which is round-half-up for prices
fn quantize(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision.min(MAX_PRECISION), RoundingStrategy::MidpointAwayFromZero)
}

/// Compute the target band for an entry price.
///
/// Offsets are magnitudes: the high side is `entry + offset`, the low side
/// `entry - offset`, in points or in percent of the entry. With no precision
/// configured the values are returned unquantized and a warning is logged.
pub fn compute_targets(symbol: &str, entry_price: f64, config: &PrecisionConfig) -> TargetBand {
    let Some(entry) = Decimal::from_f64(entry_price) else {
        tracing::warn!("Cannot compute targets for {}: entry price {} is not finite", symbol, entry_price);
        return TargetBand { high: None, low: None, quantized: false };
    };

    let high = config.high.as_ref().and_then(|o| apply_offset(entry, o, Decimal::ONE));
    let low = config.low.as_ref().and_then(|o| apply_offset(entry, o, Decimal::NEGATIVE_ONE));

    let (high, low) = match config.precision {
        Some(precision) => (
            high.map(|v| quantize(v, precision)),
            low.map(|v| quantize(v, precision)),
        ),
        None => {
            tracing::warn!("No display precision configured for {}; targets left unquantized", symbol);
            (high, low)
        }
    };

    TargetBand {
        high: high.and_then(|v| v.to_f64()),
        low: low.and_then(|v| v.to_f64()),
        quantized: config.precision.is_some(),
    }
}
