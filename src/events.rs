//! Typed publish/subscribe bus
//!
//! One tokio broadcast channel per message type. Publishers and listeners
//! only share the message type, so the scheduler has no knowledge of who
//! consumes transitions.

use crate::db::sqlite::models::MarketStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use tokio::sync::broadcast;

/// Buffered messages per type before slow receivers start lagging
const CHANNEL_CAPACITY: usize = 256;

/// A market's computed status changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketTransition {
    pub market_key: String,
    pub previous_status: MarketStatus,
    pub new_status: MarketStatus,
    /// Boundary instant of the transition
    pub instant: DateTime<Utc>,
}

impl MarketTransition {
    pub fn is_open(&self) -> bool {
        self.new_status == MarketStatus::Open && self.previous_status != MarketStatus::Open
    }

    pub fn is_close(&self) -> bool {
        self.previous_status == MarketStatus::Open && self.new_status != MarketStatus::Open
    }
}

/// Event bus keyed by message type
#[derive(Default)]
pub struct EventBus {
    channels: DashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender<E>(&self) -> broadcast::Sender<E>
    where
        E: Clone + Send + Sync + 'static,
    {
        let entry = self
            .channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel::<E>(CHANNEL_CAPACITY);
                Box::new(sender) as Box<dyn Any + Send + Sync>
            });

        // Keys are the TypeId of the stored sender's message type, so the
        // downcast only fails if that invariant is broken
        entry
            .value()
            .downcast_ref::<broadcast::Sender<E>>()
            .cloned()
            .unwrap_or_else(|| broadcast::channel::<E>(CHANNEL_CAPACITY).0)
    }

    /// Publish a message to every current subscriber of its type.
    ///
    /// Returns the number of receivers reached. Publishing with no
    /// subscriber is not an error.
    pub fn publish<E>(&self, event: E) -> usize
    where
        E: Clone + Send + Sync + 'static,
    {
        self.sender::<E>().send(event).unwrap_or(0)
    }

    /// Subscribe to all future messages of a type
    pub fn subscribe<E>(&self) -> broadcast::Receiver<E>
    where
        E: Clone + Send + Sync + 'static,
    {
        self.sender::<E>().subscribe()
    }

    /// Number of live subscribers for a message type
    pub fn subscriber_count<E>(&self) -> usize
    where
        E: Clone + Send + Sync + 'static,
    {
        self.sender::<E>().receiver_count()
    }
}
