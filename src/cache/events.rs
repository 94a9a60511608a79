//! Change-event queue.
//!
//! Write paths publish data-source change notifications here; the refresh
//! orchestrator drains them and applies incremental cache updates.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::types::AssessmentKind;

const SOURCE: &str = "cache::events";

/// Monotonic epoch used to order events emitted within this process.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Unique identifier for idempotency.
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Data-source changes the cache reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Sessions were created; cache entries and reverse indexes grow.
    SessionsCreated {
        kind: AssessmentKind,
        session_ids: Vec<Uuid>,
    },
    /// Sessions were updated; their info hashes are refetched.
    SessionsUpdated {
        kind: AssessmentKind,
        session_ids: Vec<Uuid>,
    },
    /// Sessions were deleted; entries are removed without a refetch.
    SessionsDeleted {
        kind: AssessmentKind,
        session_ids: Vec<Uuid>,
    },
    /// Question results under a session changed.
    SessionResultsChanged {
        kind: AssessmentKind,
        session_id: Uuid,
    },
    /// Papers were created or updated; blobs are refetched.
    PapersUpserted { paper_ids: Vec<Uuid> },
    /// Papers were deleted; blobs are dropped.
    PapersDeleted { paper_ids: Vec<Uuid> },
    /// Student roster changed; the email list is rebuilt.
    StudentsChanged,
    /// Warm every cache at process start.
    WarmupOnStartup,
}

/// In-memory FIFO of change events.
///
/// Contention is low, so a plain mutex suffices.
pub struct EventQueue {
    queue: Mutex<VecDeque<ChangeEvent>>,
    epoch_counter: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn publish(&self, kind: EventKind) {
        let epoch = self.next_epoch();
        let event = ChangeEvent::new(kind.clone(), epoch);

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?kind,
            "change event enqueued"
        );

        lock_queue(&self.queue, "publish").push_back(event);
    }

    /// Drains up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<ChangeEvent> {
        let mut queue = lock_queue(&self.queue, "drain");
        let count = limit.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        lock_queue(&self.queue, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_queue<'a>(
    lock: &'a Mutex<VecDeque<ChangeEvent>>,
    op: &'static str,
) -> std::sync::MutexGuard<'a, VecDeque<ChangeEvent>> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = SOURCE,
                result = "poisoned_recovered",
                hint = "queue may be stale after panic in another thread",
                "recovered from poisoned event queue lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn epoch_monotonicity() {
        let queue = EventQueue::new();
        let e1 = queue.next_epoch();
        let e2 = queue.next_epoch();
        assert!(e1 < e2);
    }

    #[test]
    fn publish_and_drain_in_fifo_order() {
        let queue = EventQueue::new();

        queue.publish(EventKind::StudentsChanged);
        queue.publish(EventKind::WarmupOnStartup);
        queue.publish(EventKind::PapersDeleted {
            paper_ids: vec![Uuid::nil()],
        });

        assert_eq!(queue.len(), 3);

        let events = queue.drain(2);
        assert_eq!(events.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(events[0].kind, EventKind::StudentsChanged);
        assert_eq!(events[1].kind, EventKind::WarmupOnStartup);
    }

    #[test]
    fn drain_more_than_available() {
        let queue = EventQueue::new();
        queue.publish(EventKind::StudentsChanged);

        let events = queue.drain(100);
        assert_eq!(events.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_recovers_from_poisoned_lock() {
        let queue = EventQueue::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.publish(EventKind::StudentsChanged);
        assert_eq!(queue.len(), 1);
    }
}
