//! Signal Service
//!
//! Resolves the directional signal and weight of an instrument at capture
//! time, and aggregates them into the composite row.

use crate::db::sqlite::models::{Instrument, Signal};
use crate::services::quotes_service::Quote;
use serde::Serialize;

/// Signal and weight resolved for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub signal: Option<Signal>,
    pub weight: f64,
}

/// Pluggable signal lookup used by capture
pub trait SignalClassifier: Send + Sync {
    fn classify(&self, instrument: &Instrument, quote: Option<&Quote>) -> Classification;
}

/// Classifier reading the signal configured on the instrument
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfiguredClassifier;

impl SignalClassifier for ConfiguredClassifier {
    fn classify(&self, instrument: &Instrument, _quote: Option<&Quote>) -> Classification {
        Classification {
            signal: instrument.signal,
            weight: instrument.signal_weight,
        }
    }
}

/// Weighted aggregate of the rows that take part in the composite.
///
/// The composite score is the weight-averaged score of every row with a
/// signal and a positive weight, mapped back to the nearest signal. The
/// composite weight is the sum of those weights. `None` if no row qualifies.
pub fn composite_classification<'a, I>(rows: I) -> Option<Classification>
where
    I: IntoIterator<Item = &'a Classification>,
{
    let (weighted, total) = rows
        .into_iter()
        .filter(|c| c.weight > 0.0)
        .filter_map(|c| c.signal.map(|s| (s.score() as f64 * c.weight, c.weight)))
        .fold((0.0, 0.0), |(sum, total), (score, weight)| (sum + score, total + weight));

    if total <= 0.0 {
        return None;
    }

    Some(Classification {
        signal: Some(Signal::from_score(weighted / total)),
        weight: total,
    })
}
