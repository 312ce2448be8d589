//! Application state management

use crate::config::EngineConfig;
use crate::db::sqlite::SqliteDb;
use crate::error::Result;
use crate::events::EventBus;
use crate::services::quotes_service::{QuoteCache, QuoteSource, QuotesService};
use crate::services::signal_service::{ConfiguredClassifier, SignalClassifier};
use std::sync::Arc;

/// Application state shared by the scheduler, capture and grading tasks
pub struct AppState {
    /// Session store
    pub sqlite: Arc<SqliteDb>,

    /// Live-quote feed (read only)
    pub quotes: Arc<dyn QuoteSource>,

    /// Signal lookup used at capture time
    pub classifier: Arc<dyn SignalClassifier>,

    /// Transition events
    pub bus: Arc<EventBus>,

    pub config: EngineConfig,
}

impl AppState {
    /// Create application state, opening the database named by `config`
    pub fn new(config: EngineConfig, quotes: Arc<dyn QuoteSource>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        tracing::info!("Data directory: {:?}", config.data_dir);

        let sqlite = Arc::new(SqliteDb::new(&config.db_path)?);

        Ok(Self::with_parts(
            sqlite,
            quotes,
            Arc::new(ConfiguredClassifier),
            config,
        ))
    }

    /// Assemble state from already-built parts
    pub fn with_parts(
        sqlite: Arc<SqliteDb>,
        quotes: Arc<dyn QuoteSource>,
        classifier: Arc<dyn SignalClassifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            sqlite,
            quotes,
            classifier,
            bus: Arc::new(EventBus::new()),
            config,
        }
    }

    /// In-memory state over a quote cache, for tests and dry runs
    pub fn in_memory(quotes: Arc<QuoteCache>) -> Result<Self> {
        let config = EngineConfig {
            data_dir: ":memory:".into(),
            db_path: ":memory:".into(),
        };
        Ok(Self::with_parts(
            Arc::new(SqliteDb::open_in_memory()?),
            quotes,
            Arc::new(ConfiguredClassifier),
            config,
        ))
    }

    /// Quote access with the current staleness setting applied
    pub fn quotes_service(&self) -> Result<QuotesService> {
        let settings = self.sqlite.get_engine_settings()?;
        Ok(QuotesService::new(self.quotes.clone(), settings.max_quote_age_secs))
    }
}
