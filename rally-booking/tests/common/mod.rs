#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use mockable::Clock;
use rally_booking::{ConfirmRequest, HoldRequest, SlotEngine, Stores};
use rally_core::{EngineSettings, EventPublisher, RetryPolicy, SlotKey, SplitEntry, TimeRange};
use rally_shared::SlotEvent;
use rally_store::MemoryStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub struct TestClock(Mutex<DateTime<Utc>>);

impl TestClock {
    pub fn new() -> Self {
        Self(Mutex::new(Utc.with_ymd_and_hms(2024, 5, 31, 17, 0, 0).unwrap()))
    }

    pub fn advance(&self, delta: chrono::Duration) {
        *self.0.lock().unwrap() += delta;
    }
}

impl Clock for TestClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<SlotEvent>>,
}

impl RecordingPublisher {
    pub fn topics(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(SlotEvent::topic).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &SlotEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct World {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<TestClock>,
    pub events: Arc<RecordingPublisher>,
    pub engine: SlotEngine,
}

impl World {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(TestClock::new());
        let events = Arc::new(RecordingPublisher::default());
        let settings = EngineSettings {
            retry: RetryPolicy::new(3, Duration::ZERO),
            ..EngineSettings::default()
        };
        let engine = SlotEngine::new(Stores::shared(store.clone()), events.clone(), clock.clone(), &settings);
        Self { store, clock, events, engine }
    }
}

pub fn court_c1() -> SlotKey {
    SlotKey {
        owner_id: Uuid::from_u128(0xc10b),
        resource_id: Uuid::from_u128(0xc1),
        date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
    }
}

pub fn hours(start: u32, end: u32) -> TimeRange {
    TimeRange::new(
        NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
    )
    .unwrap()
}

pub fn hold_request(holder: &str, range: TimeRange) -> HoldRequest {
    HoldRequest { key: court_c1(), range, holder_id: holder.into(), hold_minutes: None }
}

pub fn confirm_request(lock_id: Uuid, range: TimeRange, total_cents: i64, split_plan: Vec<SplitEntry>) -> ConfirmRequest {
    ConfirmRequest {
        lock_id,
        key: court_c1(),
        range,
        payer_id: "member-1".into(),
        payer_name: "Ana".into(),
        total_cents,
        split_plan,
        idempotency_key: None,
        details: serde_json::json!({ "court": "C1" }),
    }
}
