//! Shared fixtures for the integration tests
//!
//! `InMemoryAdapter` keeps records in a map, stamps its own modification
//! times on write the way most real targets do, logs every apply call and can
//! be told to fail specific calls.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::{
    error::Result as BridgeResult, AdapterCapabilities, ApplyRequest, BridgeError, EntityAdapter,
    EntityKind, NoteRecord, RawRecord, WriteReceipt,
};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use core_runtime::config::ReconcileConfig;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// In-memory adapter
// ============================================================================

pub struct InMemoryAdapter {
    name: &'static str,
    records: Mutex<BTreeMap<String, RawRecord>>,
    failures: Mutex<HashMap<String, VecDeque<BridgeError>>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicU32,
    write_clock: AtomicI64,
    settable_modified_at: bool,
    fixed_create_id: Option<String>,
    fetch_delay: Option<Duration>,
}

impl InMemoryAdapter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
            write_clock: AtomicI64::new(0),
            settable_modified_at: false,
            fixed_create_id: None,
            fetch_delay: None,
        }
    }

    /// Keep the modification time the engine asks for instead of stamping
    pub fn settable_modified_at(mut self) -> Self {
        self.settable_modified_at = true;
        self
    }

    /// Answer every create with the same id
    pub fn with_fixed_create_id(mut self, id: &str) -> Self {
        self.fixed_create_id = Some(id.to_string());
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn put(&self, record: RawRecord) {
        let id = record.source_id().unwrap_or_default().to_string();
        self.records.lock().unwrap().insert(id, record);
    }

    pub fn put_note(&self, id: &str, title: &str, body: &str, modified_at: Option<DateTime<Utc>>) {
        self.put(RawRecord::Note(NoteRecord {
            id: Some(id.to_string()),
            title: Some(title.to_string()),
            body: Some(body.to_string()),
            modified_at,
            ..Default::default()
        }));
    }

    pub fn edit_note(&self, id: &str, modified_at: Option<DateTime<Utc>>, edit: impl FnOnce(&mut NoteRecord)) {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(id) {
            Some(RawRecord::Note(note)) => {
                edit(note);
                note.modified_at = modified_at;
            }
            other => panic!("no note {} in {}: {:?}", id, self.name, other),
        }
    }

    pub fn note(&self, id: &str) -> Option<NoteRecord> {
        match self.records.lock().unwrap().get(id) {
            Some(RawRecord::Note(note)) => Some(note.clone()),
            _ => None,
        }
    }

    pub fn remove(&self, id: &str) {
        self.records.lock().unwrap().remove(id);
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Note titles, sorted
    pub fn titles(&self) -> Vec<String> {
        let mut titles: Vec<String> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter_map(|record| match record {
                RawRecord::Note(note) => note.title.clone(),
                _ => None,
            })
            .collect();
        titles.sort();
        titles
    }

    /// Fail the next calls touching `id` (source id for creates, target id
    /// otherwise), one error per call
    pub fn fail_next(&self, id: &str, errors: impl IntoIterator<Item = BridgeError>) {
        self.failures
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .extend(errors);
    }

    /// Every apply call made so far, as `op:id`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    fn record_call(&self, op: &str, id: &str) -> BridgeResult<()> {
        self.calls.lock().unwrap().push(format!("{}:{}", op, id));
        match self.failures.lock().unwrap().get_mut(id).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn stamp(&self, requested: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        if self.settable_modified_at {
            return requested;
        }
        let tick = self.write_clock.fetch_add(1, Ordering::SeqCst) + 1;
        Some(write_epoch() + ChronoDuration::seconds(tick))
    }

    fn store(&self, id: &str, request: &ApplyRequest) -> WriteReceipt {
        let modified_at = self.stamp(request.modified_at);
        let stored = restamp(&request.payload, id, modified_at);
        self.records.lock().unwrap().insert(id.to_string(), stored);
        WriteReceipt {
            modified_at,
            ..WriteReceipt::new(id)
        }
    }
}

#[async_trait]
impl EntityAdapter for InMemoryAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            settable_modified_at: self.settable_modified_at,
        }
    }

    async fn fetch_snapshot(&self, kind: EntityKind) -> BridgeResult<Vec<RawRecord>> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|record| record.kind() == kind)
            .cloned()
            .collect())
    }

    async fn apply_create(&self, _kind: EntityKind, request: &ApplyRequest) -> BridgeResult<WriteReceipt> {
        self.record_call("create", request.payload.source_id().unwrap_or_default())?;
        let id = match &self.fixed_create_id {
            Some(id) => id.clone(),
            None => format!(
                "{}-{}",
                self.name,
                self.next_id.fetch_add(1, Ordering::SeqCst) + 1
            ),
        };
        Ok(self.store(&id, request))
    }

    async fn apply_update(
        &self,
        _kind: EntityKind,
        id: &str,
        request: &ApplyRequest,
    ) -> BridgeResult<WriteReceipt> {
        self.record_call("update", id)?;
        if !self.records.lock().unwrap().contains_key(id) {
            return Err(BridgeError::NotFound(id.to_string()));
        }
        Ok(self.store(id, request))
    }

    async fn apply_delete(&self, _kind: EntityKind, id: &str) -> BridgeResult<()> {
        self.record_call("delete", id)?;
        self.records
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))
    }
}

/// Copy of `record` as the target would store it
fn restamp(record: &RawRecord, id: &str, modified_at: Option<DateTime<Utc>>) -> RawRecord {
    let mut copy = record.clone();
    match &mut copy {
        RawRecord::Note(r) => {
            r.id = Some(id.to_string());
            r.modified_at = modified_at;
        }
        RawRecord::Reminder(r) => {
            r.id = Some(id.to_string());
            r.modified_at = modified_at;
        }
        RawRecord::Photo(r) => {
            r.id = Some(id.to_string());
            r.modified_at = modified_at;
        }
        RawRecord::Credential(r) => {
            r.id = Some(id.to_string());
            r.modified_at = modified_at;
        }
    }
    copy
}

// ============================================================================
// Helpers
// ============================================================================

/// Base of the adapters' own write stamps; earlier than any user edit below
pub fn write_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

/// A user edit made at `hour` o'clock on a fixed day
pub fn edited_at(hour: u32) -> Option<DateTime<Utc>> {
    Some(Utc.with_ymd_and_hms(2026, 6, 1, hour, 0, 0).unwrap())
}

/// Engine tuning with millisecond backoff so retry tests stay fast
pub fn fast_config() -> ReconcileConfig {
    ReconcileConfig {
        call_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        ..Default::default()
    }
}
