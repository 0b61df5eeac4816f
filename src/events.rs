//! Typed engine notifications and the subscription bus.
//!
//! Every observable state change is one [`EngineEvent`] variant. Events are
//! stamped with a bus-wide sequence number, appended to a bounded journal for
//! audit and replay, and fanned out to subscribers in sequence order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::buffer::Timestamp;
use crate::classifier::{ClearReason, Level, PendingCrisis};
use crate::dispatcher::InterventionRecord;
use crate::learner::ThresholdAdjustment;
use crate::scorer::ScoreRecord;

/// Journal entries kept when no capacity is given.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ScoreUpdated {
        subject_id: String,
        level: Level,
        score: ScoreRecord,
    },
    InterventionTriggered {
        subject_id: String,
        intervention: InterventionRecord,
    },
    InterventionCompleted {
        subject_id: String,
        intervention: InterventionRecord,
    },
    /// The domain executor failed; bookkeeping is unaffected
    InterventionError {
        subject_id: String,
        intervention_id: String,
        ts: Timestamp,
        error: String,
    },
    CrisisSuspected {
        subject_id: String,
        ts: Timestamp,
        pending: PendingCrisis,
    },
    CrisisConfirmed {
        subject_id: String,
        ts: Timestamp,
        pending: PendingCrisis,
    },
    CrisisCleared {
        subject_id: String,
        ts: Timestamp,
        pending: PendingCrisis,
        reason: ClearReason,
    },
    ThresholdAdjustmentProposed {
        subject_id: String,
        ts: Timestamp,
        adjustment: ThresholdAdjustment,
    },
    ThresholdAdjustmentApplied {
        subject_id: String,
        ts: Timestamp,
        adjustment: ThresholdAdjustment,
        config_version: u64,
    },
}

impl EngineEvent {
    pub fn subject_id(&self) -> &str {
        match self {
            EngineEvent::ScoreUpdated { subject_id, .. }
            | EngineEvent::InterventionTriggered { subject_id, .. }
            | EngineEvent::InterventionCompleted { subject_id, .. }
            | EngineEvent::InterventionError { subject_id, .. }
            | EngineEvent::CrisisSuspected { subject_id, .. }
            | EngineEvent::CrisisConfirmed { subject_id, .. }
            | EngineEvent::CrisisCleared { subject_id, .. }
            | EngineEvent::ThresholdAdjustmentProposed { subject_id, .. }
            | EngineEvent::ThresholdAdjustmentApplied { subject_id, .. } => subject_id,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            EngineEvent::ScoreUpdated { score, .. } => score.timestamp,
            EngineEvent::InterventionTriggered { intervention, .. } => intervention.timestamp,
            EngineEvent::InterventionCompleted { intervention, .. } => {
                intervention.completed_at.unwrap_or(intervention.due_at)
            }
            EngineEvent::InterventionError { ts, .. }
            | EngineEvent::CrisisSuspected { ts, .. }
            | EngineEvent::CrisisConfirmed { ts, .. }
            | EngineEvent::CrisisCleared { ts, .. }
            | EngineEvent::ThresholdAdjustmentProposed { ts, .. }
            | EngineEvent::ThresholdAdjustmentApplied { ts, .. } => *ts,
        }
    }

    /// Variant name as it appears in the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ScoreUpdated { .. } => "score_updated",
            EngineEvent::InterventionTriggered { .. } => "intervention_triggered",
            EngineEvent::InterventionCompleted { .. } => "intervention_completed",
            EngineEvent::InterventionError { .. } => "intervention_error",
            EngineEvent::CrisisSuspected { .. } => "crisis_suspected",
            EngineEvent::CrisisConfirmed { .. } => "crisis_confirmed",
            EngineEvent::CrisisCleared { .. } => "crisis_cleared",
            EngineEvent::ThresholdAdjustmentProposed { .. } => "threshold_adjustment_proposed",
            EngineEvent::ThresholdAdjustmentApplied { .. } => "threshold_adjustment_applied",
        }
    }
}

/// Journalled event with its bus sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub event: EngineEvent,
}

struct Subscriber {
    /// Only events for this subject, when set
    subject: Option<String>,
    tx: UnboundedSender<JournalEntry>,
}

struct BusState {
    seq: u64,
    next_subscription: u64,
    subscribers: BTreeMap<u64, Subscriber>,
    journal: VecDeque<JournalEntry>,
    journal_capacity: usize,
}

impl BusState {
    fn remove(&mut self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }
}

/// Fan-out bus. Cloning shares the same subscribers and journal.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventBus")
            .field("seq", &state.seq)
            .field("subscribers", &state.subscribers.len())
            .field("journal", &state.journal.len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_journal_capacity(DEFAULT_JOURNAL_CAPACITY)
    }

    pub fn with_journal_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                seq: 0,
                next_subscription: 0,
                subscribers: BTreeMap::new(),
                journal: VecDeque::new(),
                journal_capacity: capacity,
            })),
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.add_subscriber(None)
    }

    /// Receive only events for one subject.
    pub fn subscribe_subject(&self, subject_id: &str) -> Subscription {
        self.add_subscriber(Some(subject_id.to_string()))
    }

    fn add_subscriber(&self, subject: Option<String>) -> Subscription {
        let (tx, rx) = unbounded_channel();
        let mut state = self.state.lock();
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscribers.insert(id, Subscriber { subject, tx });
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.state),
        }
    }

    /// Remove a subscription by id. Returns false when it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.state.lock().remove(id)
    }

    /// Stamp, journal and deliver one event. Returns its sequence number.
    pub fn publish(&self, event: EngineEvent) -> u64 {
        let mut state = self.state.lock();
        state.seq += 1;
        let entry = JournalEntry {
            seq: state.seq,
            event,
        };

        let mut closed = Vec::new();
        for (id, sub) in &state.subscribers {
            if let Some(subject) = &sub.subject {
                if subject != entry.event.subject_id() {
                    continue;
                }
            }
            if sub.tx.send(entry.clone()).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            state.remove(id);
        }

        if state.journal_capacity > 0 {
            if state.journal.len() >= state.journal_capacity {
                state.journal.pop_front();
            }
            state.journal.push_back(entry);
        }
        state.seq
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn last_seq(&self) -> u64 {
        self.state.lock().seq
    }

    /// Journalled events with `seq > after`, oldest first.
    pub fn journal_since(&self, after: u64) -> Vec<JournalEntry> {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle unsubscribes as well.
pub struct Subscription {
    id: u64,
    rx: UnboundedReceiver<JournalEntry>,
    bus: Weak<Mutex<BusState>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await.map(|e| e.event)
    }

    pub async fn recv_entry(&mut self) -> Option<JournalEntry> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok().map(|e| e.event)
    }

    /// Everything delivered so far, without waiting.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            out.push(entry.event);
        }
        out
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(state) = self.bus.upgrade() {
            state.lock().remove(self.id);
        }
        self.bus = Weak::new();
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
