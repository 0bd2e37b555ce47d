//! State store (C1): the single guarded holder of current system state,
//! latest plan summary, last action, learner status snapshots, override
//! status, sequencer summary, buffer-calc status and the decision log.
//! Every producer (arbitration loop, data collectors, request handlers)
//! writes and reads through this store.
//!
//! Grounded on `controller/mod.rs`'s `BatteryController` snapshot/lock
//! pattern ("clone under lock, filter outside lock") generalized from one
//! `RwLock`-guarded field to a single cross-cutting snapshot. Uses a plain
//! (non-reentrant) `parking_lot::Mutex`: see DESIGN.md Open Question 4 for
//! why reentrancy isn't needed here.
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::buffer::BufferMode;
use crate::domain::{
    Action, DecisionCategory, DecisionLog, DecisionLogEntry, DispatchSlot, Override, PlanHorizon,
    ResidualCorrection, ResidualMode, SystemState,
};
use crate::sequencer::SequencerSummary;

/// Slot-0 figures plus solve metadata, the subset of a `PlanHorizon` the
/// store republishes in snapshots (the full 96-slot plan is too large and
/// too transient to carry through every snapshot read).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub computed_at: DateTime<Utc>,
    pub solver_status: String,
    pub objective_value: f64,
    pub slot0: Option<DispatchSlot>,
}

impl PlanSummary {
    pub fn from_plan(plan: &PlanHorizon) -> Self {
        Self {
            computed_at: plan.computed_at,
            solver_status: plan.solver_status.clone(),
            objective_value: plan.objective_value,
            slot0: plan.slot0().cloned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReliabilityStatus {
    pub pv_confidence: f64,
    pub consumption_confidence: f64,
    pub price_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStatus {
    pub mode: BufferMode,
    pub floor_percent: f64,
}

/// An atomic, point-in-time read of every field the store owns. Two
/// fields read from the same snapshot always correspond to a single
/// `update` epoch — no torn reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub epoch: u64,
    pub state: Option<SystemState>,
    pub plan: Option<PlanSummary>,
    pub last_action: Option<Action>,
    pub override_status: Option<Override>,
    pub sequencer: Option<SequencerSummary>,
    pub buffer: Option<BufferStatus>,
    pub residual_mode: ResidualMode,
    pub residual_correction: Option<ResidualCorrection>,
    pub reliability: ReliabilityStatus,
    pub reaction_ema: f64,
    pub stale_vehicle: bool,
    pub decision_log: Vec<DecisionLogEntry>,
}

struct Inner {
    epoch: u64,
    state: Option<SystemState>,
    plan: Option<PlanSummary>,
    last_action: Option<Action>,
    override_status: Option<Override>,
    sequencer: Option<SequencerSummary>,
    buffer: Option<BufferStatus>,
    residual_mode: ResidualMode,
    residual_correction: Option<ResidualCorrection>,
    reliability: ReliabilityStatus,
    reaction_ema: f64,
    stale_vehicle: bool,
    decision_log: DecisionLog,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StateSnapshot>,
}

/// A live event-stream registration. Dropping or explicitly unregistering
/// this handle cancels the subscription; the store reaps a dead sender
/// lazily, the next time it tries to publish to it.
pub struct SubscriberHandle {
    id: u64,
}

const DECISION_LOG_CAPACITY: usize = 64;
const SUBSCRIBER_QUEUE_DEPTH: usize = 32;

/// The single guarded store every producer writes and every consumer
/// reads through snapshots. Cheap to clone: internally an
/// `Arc`-free `Mutex`, held behind a `Arc` by callers that need to share
/// it across tasks (see `main.rs`'s composition root).
pub struct StateStore {
    inner: Mutex<Inner>,
    next_subscriber_id: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                epoch: 0,
                state: None,
                plan: None,
                last_action: None,
                override_status: None,
                sequencer: None,
                buffer: None,
                residual_mode: ResidualMode::Shadow,
                residual_correction: None,
                reliability: ReliabilityStatus::default(),
                reaction_ema: 0.5,
                stale_vehicle: false,
                decision_log: DecisionLog::new(DECISION_LOG_CAPACITY),
                subscribers: Vec::new(),
            }),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Atomic replacement of the per-cycle fields: the fresh `SystemState`,
    /// the action the arbitrator derived, and the residual correction it
    /// considered (logged even in shadow mode, where it isn't applied).
    /// Called by the arbitration loop once per cycle.
    pub fn update(
        &self,
        state: SystemState,
        action: Action,
        residual_correction: Option<ResidualCorrection>,
    ) {
        let mut guard = self.inner.lock();
        guard.epoch += 1;
        guard.state = Some(state);
        guard.last_action = Some(action);
        guard.residual_correction = residual_correction;
        Self::publish_locked(&mut guard);
    }

    /// Called after each successful LP solve; stores only the compact
    /// summary (slot-0 + solver metadata) a snapshot needs.
    pub fn update_plan(&self, plan: &PlanHorizon) {
        let mut guard = self.inner.lock();
        guard.epoch += 1;
        guard.plan = Some(PlanSummary::from_plan(plan));
        Self::publish_locked(&mut guard);
    }

    pub fn clear_plan(&self) {
        let mut guard = self.inner.lock();
        guard.epoch += 1;
        guard.plan = None;
        Self::publish_locked(&mut guard);
    }

    pub fn set_override_status(&self, status: Option<Override>) {
        let mut guard = self.inner.lock();
        guard.epoch += 1;
        guard.override_status = status;
        Self::publish_locked(&mut guard);
    }

    pub fn set_sequencer_summary(&self, summary: SequencerSummary) {
        let mut guard = self.inner.lock();
        guard.epoch += 1;
        guard.sequencer = Some(summary);
        Self::publish_locked(&mut guard);
    }

    pub fn set_buffer_status(&self, status: BufferStatus) {
        let mut guard = self.inner.lock();
        guard.epoch += 1;
        guard.buffer = Some(status);
        Self::publish_locked(&mut guard);
    }

    pub fn set_residual_mode(&self, mode: ResidualMode) {
        let mut guard = self.inner.lock();
        guard.epoch += 1;
        guard.residual_mode = mode;
        Self::publish_locked(&mut guard);
    }

    pub fn set_reliability(&self, reliability: ReliabilityStatus) {
        let mut guard = self.inner.lock();
        guard.epoch += 1;
        guard.reliability = reliability;
        Self::publish_locked(&mut guard);
    }

    pub fn set_reaction_ema(&self, ema: f64) {
        let mut guard = self.inner.lock();
        guard.epoch += 1;
        guard.reaction_ema = ema;
        Self::publish_locked(&mut guard);
    }

    pub fn set_stale_vehicle(&self, stale: bool) {
        let mut guard = self.inner.lock();
        guard.epoch += 1;
        guard.stale_vehicle = stale;
        Self::publish_locked(&mut guard);
    }

    pub fn push_decision(
        &self,
        category: DecisionCategory,
        icon: &'static str,
        text: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        let mut guard = self.inner.lock();
        guard.decision_log.push(DecisionLogEntry {
            ts: Utc::now(),
            category,
            icon,
            text: text.into(),
            details,
        });
        guard.epoch += 1;
        Self::publish_locked(&mut guard);
    }

    /// A coherent, point-in-time copy of every field: any two fields read
    /// from one snapshot correspond to a single update epoch. The clone
    /// happens under the lock; callers do any filtering or
    /// heavier work afterwards, outside it.
    pub fn snapshot(&self) -> StateSnapshot {
        let guard = self.inner.lock();
        Self::snapshot_locked(&guard)
    }

    fn snapshot_locked(guard: &Inner) -> StateSnapshot {
        StateSnapshot {
            epoch: guard.epoch,
            state: guard.state.clone(),
            plan: guard.plan.clone(),
            last_action: guard.last_action.clone(),
            override_status: guard.override_status.clone(),
            sequencer: guard.sequencer.clone(),
            buffer: guard.buffer.clone(),
            residual_mode: guard.residual_mode,
            residual_correction: guard.residual_correction,
            reliability: guard.reliability.clone(),
            reaction_ema: guard.reaction_ema,
            stale_vehicle: guard.stale_vehicle,
            decision_log: guard.decision_log.entries().cloned().collect(),
        }
    }

    /// Register a live event-stream subscriber. The returned receiver
    /// yields one snapshot per `update`-family call; a slow subscriber
    /// drops the newest update rather than block the producer (bounded
    /// queue, `try_send`).
    pub fn register_event_subscriber(&self) -> (SubscriberHandle, mpsc::Receiver<StateSnapshot>) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.inner.lock().subscribers.push(Subscriber { id, tx });
        (SubscriberHandle { id }, rx)
    }

    /// Cancel a subscription. Idempotent: unregistering twice, or after
    /// the receiver was already dropped, is a no-op.
    pub fn unregister(&self, handle: SubscriberHandle) {
        self.inner.lock().subscribers.retain(|s| s.id != handle.id);
    }

    /// Push the current snapshot into every subscriber queue while still
    /// holding the lock, non-blocking (`try_send`); dead or full
    /// subscribers are dropped from the list rather than retried, so a
    /// slow consumer never backs up the producer. The actual socket/SSE
    /// write happens on the subscriber's own task, outside this lock.
    fn publish_locked(guard: &mut Inner) {
        let snapshot = Self::snapshot_locked(guard);
        guard.subscribers.retain(|sub| {
            match sub.tx.try_send(snapshot.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
