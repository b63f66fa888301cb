//! Read-side cache of a club's day grid.
//!
//! Entries are invalidated, never patched, whenever a hold or booking of the
//! same `(owner, date)` changes. The conflict check never reads from here.

use chrono::{DateTime, NaiveDate, Utc};
use rally_core::{Booking, Hold};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::SharedClock;

/// What a club's day looks like: live holds and occupying bookings.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SlotGrid {
    pub holds: Vec<Hold>,
    pub bookings: Vec<Booking>,
}

struct CacheEntry {
    grid: SlotGrid,
    stored_at: DateTime<Utc>,
}

pub struct SlotCache {
    entries: RwLock<HashMap<(Uuid, NaiveDate), CacheEntry>>,
    ttl: chrono::Duration,
    clock: SharedClock,
}

impl SlotCache {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        Self { entries: RwLock::new(HashMap::new()), ttl, clock }
    }

    pub async fn get(&self, owner_id: Uuid, date: NaiveDate) -> Option<SlotGrid> {
        let now = self.clock.utc();
        let entries = self.entries.read().await;
        entries
            .get(&(owner_id, date))
            .filter(|entry| now - entry.stored_at < self.ttl)
            .map(|entry| entry.grid.clone())
    }

    pub async fn set(&self, owner_id: Uuid, date: NaiveDate, grid: SlotGrid) {
        let stored_at = self.clock.utc();
        let mut entries = self.entries.write().await;
        // Drop stale entries while we hold the write lock.
        entries.retain(|_, entry| stored_at - entry.stored_at < self.ttl);
        entries.insert((owner_id, date), CacheEntry { grid, stored_at });
    }

    pub async fn invalidate(&self, owner_id: Uuid, date: NaiveDate) {
        self.entries.write().await.remove(&(owner_id, date));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
