//! Scheduler module
//!
//! Handles scheduled tasks including:
//! - Market status transitions (one timer task per active market)

mod market_scheduler;

pub use market_scheduler::{Backoff, MarketScheduler, Reconciled};
