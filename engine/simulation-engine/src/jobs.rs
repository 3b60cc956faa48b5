//! Jobs and the time-ordered job queue
//!
//! One queue multiplexes every schedule of a run instead of one OS timer per
//! job. Entries order by fire time, ties by insertion sequence, which keeps
//! firing order deterministic in fast-forward runs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use protocol_emitter::DeviceProtocol;

use crate::config::AttributeConfig;
use crate::schedule::Schedule;

/// The element a job updates
#[derive(Debug, Clone)]
pub enum PlannedElement {
    Entity {
        entity_name: String,
        entity_type: String,
        /// Sent with every update of the entity, never independently scheduled
        static_attributes: Vec<AttributeConfig>,
    },
    Device {
        device_id: String,
        api_key: String,
        protocol: DeviceProtocol,
    },
}

impl PlannedElement {
    /// Element identity for diagnostics
    pub fn identity(&self) -> &str {
        match self {
            PlannedElement::Entity { entity_name, .. } => entity_name,
            PlannedElement::Device { device_id, .. } => device_id,
        }
    }

    /// Element identity for the event feed
    pub fn identity_json(&self) -> Value {
        match self {
            PlannedElement::Entity { entity_name, entity_type, .. } => {
                json!({ "entity_name": entity_name, "entity_type": entity_type })
            }
            PlannedElement::Device { device_id, .. } => json!({ "device_id": device_id }),
        }
    }
}

/// A scheduled unit of work: one element plus the attribute subset sharing a
/// schedule
#[derive(Debug)]
pub struct Job {
    pub name: String,
    pub element: PlannedElement,
    pub attributes: Vec<AttributeConfig>,
    pub schedule: Schedule,
}

#[derive(Debug)]
struct Entry {
    fire_at: DateTime<Utc>,
    seq: u64,
    recurring: bool,
    job: Arc<Job>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at.cmp(&other.fire_at).then(self.seq.cmp(&other.seq))
    }
}

/// A due invocation popped from the queue
#[derive(Debug)]
pub struct DueJob {
    pub fire_at: DateTime<Utc>,
    pub recurring: bool,
    pub job: Arc<Job>,
}

/// Time-ordered queue of pending job invocations
#[derive(Default)]
pub struct JobQueue {
    entries: Mutex<BinaryHeap<Reverse<Entry>>>,
    seq: AtomicU64,
    /// Signalled on every insertion so a sleeping scheduler re-plans
    pub notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an invocation
    pub fn schedule(&self, fire_at: DateTime<Utc>, job: Arc<Job>, recurring: bool) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push(Reverse(Entry { fire_at, seq, recurring, job }));
        self.notify.notify_one();
    }

    /// Earliest pending fire time
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.entries.lock().peek().map(|Reverse(entry)| entry.fire_at)
    }

    /// Pop every invocation due at or before `now`, earliest first
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<DueJob> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = entries.peek() {
            if entry.fire_at > now {
                break;
            }
            let Reverse(entry) = entries.pop().expect("peeked entry exists");
            due.push(DueJob { fire_at: entry.fire_at, recurring: entry.recurring, job: entry.job });
        }
        due
    }

    /// Number of pending invocations
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no invocations are pending
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every pending invocation
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(name: &str) -> Arc<Job> {
        Arc::new(Job {
            name: name.to_string(),
            element: PlannedElement::Device {
                device_id: name.to_string(),
                api_key: "k".to_string(),
                protocol: DeviceProtocol::UltraLightHttp,
            },
            attributes: vec![],
            schedule: Schedule::Once,
        })
    }

    fn at(m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 10, 20, 12, m, s).unwrap()
    }

    #[test]
    fn test_pop_due_orders_by_time_then_insertion() {
        let queue = JobQueue::new();
        queue.schedule(at(5, 0), job("late"), false);
        queue.schedule(at(1, 0), job("early-a"), false);
        queue.schedule(at(1, 0), job("early-b"), false);

        assert_eq!(queue.next_fire_time(), Some(at(1, 0)));
        let due = queue.pop_due(at(1, 0));
        let names: Vec<&str> = due.iter().map(|d| d.job.name.as_str()).collect();
        assert_eq!(names, vec!["early-a", "early-b"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_due_leaves_future_entries() {
        let queue = JobQueue::new();
        queue.schedule(at(5, 0), job("future"), true);
        assert!(queue.pop_due(at(1, 0)).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_clear_cancels_everything() {
        let queue = JobQueue::new();
        queue.schedule(at(1, 0), job("a"), false);
        queue.schedule(at(2, 0), job("b"), true);
        queue.clear();
        assert!(queue.is_empty());
    }
}
