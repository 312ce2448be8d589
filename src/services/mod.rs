//! Services Layer
//!
//! Engine logic on top of the session store. Services never call each
//! other across the open/grade boundary: capture reacts to transition
//! events, grading polls the store on its own cadence.
//!
//! # Architecture
//!
//! ```text
//! MarketScheduler --(MarketTransition)--> CaptureService ──┐
//!                                                          ├──> SqliteDb
//! QuoteSource --> GradingService (interval loop) ──────────┘
//! ```
//!
//! # Services
//!
//! - `QuotesService` - Latest quotes with the staleness policy applied
//! - `SignalClassifier` - Directional signal and weight per instrument
//! - `target_service` - Target band calculation
//! - `CaptureService` - Open snapshots, close prices, transition listener
//! - `GradingService` - Grading rule and grading loop

pub mod quotes_service;
pub mod signal_service;
pub mod target_service;
pub mod capture_service;
pub mod grading_service;

// Re-export commonly used types and services
pub use quotes_service::{Quote, QuoteCache, QuoteSource, QuotesService, ReferenceStats};
pub use signal_service::{Classification, ConfiguredClassifier, SignalClassifier};
pub use target_service::{compute_targets, TargetBand};
pub use capture_service::{CaptureOutcome, CaptureService};
pub use grading_service::{GradingService, PassSummary};
