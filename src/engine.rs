//! The fracture engine: subject registry plus the per-tick pipeline.
//!
//! ```text
//!  ingest ──► SignalBuffers ──(snapshot at tick start)──► FeatureExtractor
//!                                                               │
//!   ┌───────────────────────────────────────────────────────────┘
//!   ▼
//! CompositeScorer ──► ThresholdClassifier ──► InterventionDispatcher ──► ActionExecutor
//!   │                    │ crisis machine        │                      (detached)
//!   ▼                    ▼                       ▼
//!  ─────────────────────── EventBus ──────────────────────────
//!                                                ▲
//!  record_outcome ──► EffectivenessLearner ──────┘ (advisory proposals)
//! ```
//!
//! Each subject owns its state behind two locks: the buffer lock, held only
//! for a push or a snapshot, and the tick slot, held for a whole tick. Ingest
//! therefore interleaves freely with ticks, while two ticks of one subject
//! never overlap. Different subjects never share a lock beyond the registry.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::buffer::{PushOutcome, SignalBuffers, Timestamp};
use crate::classifier::{ClearReason, CrisisState, CrisisTransition, Level, ThresholdClassifier};
use crate::clock::{EngineClock, SystemClock, TickSchedule};
use crate::config::{EngineConfig, LearningPolicy};
use crate::dispatcher::{ActionExecutor, ActionTable, Admission, InterventionDispatcher, InterventionRecord};
use crate::domains::DomainProfile;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus, Subscription};
use crate::features::{FeatureExtractor, FeatureSet};
use crate::learner::{EffectivenessEntry, EffectivenessLearner, LevelKey, OutcomeContext, ThresholdAdjustment};
use crate::logging::{
    self, log, log_adjustment, log_crisis, log_ignored_sample, log_intervention, log_rejected_sample, log_score, obj,
    v_num, v_str, Domain,
};
use crate::scorer::{CompositeScorer, ScoreRecord};

/// Extractor key that matches every source.
pub const ANY_SOURCE: &str = "*";

type ExtractorMap = BTreeMap<String, Arc<dyn FeatureExtractor>>;

/// Mutable per-subject state, guarded by the tick slot.
struct SubjectCore {
    config: EngineConfig,
    actions: ActionTable,
    scorer: CompositeScorer,
    classifier: ThresholdClassifier,
    dispatcher: InterventionDispatcher,
    learner: EffectivenessLearner,
    proposals: Vec<ThresholdAdjustment>,
    ticks: u64,
}

impl SubjectCore {
    /// Proposals are computed against one config version; drop the ones a
    /// newer config has made stale.
    fn prune_proposals(&mut self) {
        let live = self.config.version;
        self.proposals.retain(|p| p.config_version >= live);
    }
}

struct Subject {
    id: String,
    domain: String,
    buffers: Mutex<SignalBuffers>,
    core: Mutex<SubjectCore>,
    extractors: RwLock<ExtractorMap>,
    schedule: Mutex<Option<TickSchedule>>,
}

/// Arena of subject slots plus an id index. Removed slots are reused.
#[derive(Default)]
struct Registry {
    slots: Vec<Option<Arc<Subject>>>,
    index: HashMap<String, usize>,
    free: Vec<usize>,
}

impl Registry {
    fn get(&self, id: &str) -> Option<Arc<Subject>> {
        let slot = *self.index.get(id)?;
        self.slots.get(slot).and_then(|s| s.clone())
    }

    fn insert(&mut self, subject: Subject) -> usize {
        let id = subject.id.clone();
        let subject = Some(Arc::new(subject));
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = subject;
                slot
            }
            None => {
                self.slots.push(subject);
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        slot
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Subject>> {
        let slot = self.index.remove(id)?;
        self.free.push(slot);
        self.slots.get_mut(slot).and_then(|s| s.take())
    }
}

/// Audit view of one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub subject_id: String,
    pub domain: String,
    pub config_version: u64,
    pub config_fingerprint: String,
    pub ticks: u64,
    pub last_score: Option<ScoreRecord>,
    pub level: Level,
    pub crisis: CrisisState,
    pub active_interventions: Vec<InterventionRecord>,
    pub completed_interventions: usize,
    pub sources: Vec<String>,
    pub effectiveness: Vec<EffectivenessEntry>,
    pub pending_adjustments: Vec<ThresholdAdjustment>,
    pub monitoring: bool,
}

/// What reporting one outcome led to.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeReport {
    /// Ledger for the outcome's (domain, level, kind) key after this report
    pub entry: EffectivenessEntry,
    pub proposal: Option<ThresholdAdjustment>,
    /// New config version when the proposal was applied automatically
    pub applied_version: Option<u64>,
}

pub struct FractureEngine {
    clock: Arc<dyn EngineClock>,
    bus: EventBus,
    registry: RwLock<Registry>,
    extractors: RwLock<ExtractorMap>,
    executor: RwLock<Option<Arc<dyn ActionExecutor>>>,
}

impl std::fmt::Debug for FractureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FractureEngine")
            .field("clock", &self.clock)
            .field("subjects", &self.registry.read().index.len())
            .field("bus", &self.bus)
            .finish()
    }
}

impl Default for FractureEngine {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl FractureEngine {
    pub fn new(clock: Arc<dyn EngineClock>) -> Self {
        Self {
            clock,
            bus: EventBus::new(),
            registry: RwLock::new(Registry::default()),
            extractors: RwLock::new(BTreeMap::new()),
            executor: RwLock::new(None),
        }
    }

    pub fn now_ms(&self) -> Timestamp {
        self.clock.now_ms()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn subscribe_subject(&self, subject_id: &str) -> Subscription {
        self.bus.subscribe_subject(subject_id)
    }

    pub fn set_executor(&self, executor: Arc<dyn ActionExecutor>) {
        *self.executor.write() = Some(executor);
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a subject with an explicit, validated configuration.
    pub fn register_subject(
        &self,
        subject_id: &str,
        domain: &str,
        mut config: EngineConfig,
        actions: ActionTable,
    ) -> Result<()> {
        config.validate()?;
        config.version = 1;

        let mut registry = self.registry.write();
        if registry.index.contains_key(subject_id) {
            return Err(EngineError::DuplicateSubject(subject_id.to_string()));
        }

        let fingerprint = config.fingerprint();
        let core = SubjectCore {
            scorer: CompositeScorer::new(config.history_capacity),
            classifier: ThresholdClassifier::new(),
            dispatcher: InterventionDispatcher::new(config.history_capacity),
            learner: EffectivenessLearner::new(),
            proposals: Vec::new(),
            ticks: 0,
            actions,
            config,
        };
        let slot = registry.insert(Subject {
            id: subject_id.to_string(),
            domain: domain.to_string(),
            buffers: Mutex::new(SignalBuffers::new(core.config.buffer_capacity)),
            core: Mutex::new(core),
            extractors: RwLock::new(BTreeMap::new()),
            schedule: Mutex::new(None),
        });

        log(
            logging::Level::Info,
            Domain::Config,
            "subject_registered",
            obj(&[
                ("subject_id", v_str(subject_id)),
                ("domain", v_str(domain)),
                ("slot", json!(slot)),
                ("version", json!(1)),
                ("fingerprint", v_str(&fingerprint)),
            ]),
        );
        Ok(())
    }

    /// Register a subject from a domain profile; the profile's extractor
    /// handles every source of this subject unless a more specific one exists.
    pub fn register_profile(&self, subject_id: &str, profile: &DomainProfile) -> Result<()> {
        self.register_subject(subject_id, &profile.name, profile.config.clone(), profile.actions.clone())?;
        self.register_subject_extractor(subject_id, ANY_SOURCE, profile.extractor())
    }

    /// Remove a subject, cancelling its monitoring schedule.
    pub fn remove_subject(&self, subject_id: &str) -> Result<()> {
        let subject = self
            .registry
            .write()
            .remove(subject_id)
            .ok_or_else(|| EngineError::UnknownSubject(subject_id.to_string()))?;
        if let Some(schedule) = subject.schedule.lock().take() {
            schedule.cancel();
        }
        log(
            logging::Level::Info,
            Domain::Config,
            "subject_removed",
            obj(&[("subject_id", v_str(subject_id))]),
        );
        Ok(())
    }

    pub fn subjects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.read().index.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Engine-wide extractor for a source (or [`ANY_SOURCE`]).
    pub fn register_extractor<E>(&self, source_id: &str, extractor: E)
    where
        E: FeatureExtractor + 'static,
    {
        self.extractors
            .write()
            .insert(source_id.to_string(), Arc::new(extractor));
        log(
            logging::Level::Info,
            Domain::Features,
            "extractor_registered",
            obj(&[("source_id", v_str(source_id)), ("scope", v_str("engine"))]),
        );
    }

    /// Subject-level extractor; overrides an engine-wide one for the same key.
    pub fn register_subject_extractor<E>(&self, subject_id: &str, source_id: &str, extractor: E) -> Result<()>
    where
        E: FeatureExtractor + 'static,
    {
        let subject = self.subject(subject_id)?;
        subject
            .extractors
            .write()
            .insert(source_id.to_string(), Arc::new(extractor));
        log(
            logging::Level::Info,
            Domain::Features,
            "extractor_registered",
            obj(&[
                ("subject_id", v_str(subject_id)),
                ("source_id", v_str(source_id)),
                ("scope", v_str("subject")),
            ]),
        );
        Ok(())
    }

    fn subject(&self, subject_id: &str) -> Result<Arc<Subject>> {
        self.registry
            .read()
            .get(subject_id)
            .ok_or_else(|| EngineError::UnknownSubject(subject_id.to_string()))
    }

    /// Most specific extractor wins; subject beats engine at equal specificity.
    fn resolve_extractor(&self, subject: &Subject, source_id: &str) -> Option<Arc<dyn FeatureExtractor>> {
        let own = subject.extractors.read();
        let shared = self.extractors.read();
        own.get(source_id)
            .or_else(|| shared.get(source_id))
            .or_else(|| own.get(ANY_SOURCE))
            .or_else(|| shared.get(ANY_SOURCE))
            .cloned()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Replace a subject's configuration. Invalid configs are rejected and the
    /// previous one stays in force. Returns the new version.
    pub fn configure(&self, subject_id: &str, mut config: EngineConfig) -> Result<u64> {
        let subject = self.subject(subject_id)?;
        if let Err(err) = config.validate() {
            log(
                logging::Level::Warn,
                Domain::Config,
                "config_rejected",
                obj(&[("subject_id", v_str(subject_id)), ("error", v_str(&err.to_string()))]),
            );
            return Err(err);
        }

        let mut core = subject.core.lock();
        config.version = core.config.version + 1;
        core.scorer.set_capacity(config.history_capacity);
        core.dispatcher.set_history_capacity(config.history_capacity);
        subject.buffers.lock().resize(config.buffer_capacity);
        let version = config.version;
        let fingerprint = config.fingerprint();
        core.config = config;
        core.prune_proposals();
        drop(core);

        log(
            logging::Level::Info,
            Domain::Config,
            "configured",
            obj(&[
                ("subject_id", v_str(subject_id)),
                ("version", json!(version)),
                ("fingerprint", v_str(&fingerprint)),
            ]),
        );
        Ok(version)
    }

    pub fn config(&self, subject_id: &str) -> Result<EngineConfig> {
        Ok(self.subject(subject_id)?.core.lock().config.clone())
    }

    pub fn set_actions(&self, subject_id: &str, actions: ActionTable) -> Result<()> {
        self.subject(subject_id)?.core.lock().actions = actions;
        Ok(())
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Feed one raw sample.
    ///
    /// Unknown subjects and sources are warned about and ignored. Non-finite
    /// values are rejected with [`EngineError::InvalidSample`] and counted
    /// against the next tick's quality score.
    pub fn ingest(&self, subject_id: &str, source_id: &str, value: f64, timestamp: Timestamp) -> Result<PushOutcome> {
        let subject = match self.registry.read().get(subject_id) {
            Some(subject) => subject,
            None => {
                log_ignored_sample(subject_id, source_id, "unknown_subject");
                return Ok(PushOutcome::UnknownSubject);
            }
        };

        let mut buffers = subject.buffers.lock();
        if !buffers.has_source(source_id) {
            if self.resolve_extractor(&subject, source_id).is_none() {
                drop(buffers);
                log_ignored_sample(subject_id, source_id, "unknown_source");
                return Ok(PushOutcome::UnknownSource);
            }
            buffers.add_source(source_id);
        }

        if !value.is_finite() {
            buffers.mark_missing(source_id);
            drop(buffers);
            log_rejected_sample(subject_id, source_id, value);
            return Err(EngineError::InvalidSample {
                subject_id: subject_id.to_string(),
                source_id: source_id.to_string(),
                value,
            });
        }

        let outcome = buffers.push(source_id, value, timestamp);
        drop(buffers);
        if outcome == PushOutcome::OutOfOrder {
            log_ignored_sample(subject_id, source_id, "out_of_order");
        }
        Ok(outcome)
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Run one scoring cycle for a subject.
    pub fn tick(&self, subject_id: &str) -> Result<ScoreRecord> {
        let subject = self.subject(subject_id)?;
        let mut core = subject.core.lock();
        let now = self.clock.now_ms();
        let cfg = core.config.clone();

        let windows = subject.buffers.lock().snapshot(cfg.window_size);
        let params = cfg.extraction_params();
        let feature_sets: Vec<FeatureSet> = windows
            .iter()
            .map(|window| match self.resolve_extractor(&subject, &window.source_id) {
                Some(extractor) => extractor.extract(window, &params),
                None => FeatureSet::empty(&window.source_id),
            })
            .collect();

        let score = core
            .scorer
            .score(&feature_sets, &cfg.weights, &cfg.normalization, now);
        let classification = core.classifier.observe(score.index, now, &cfg);
        core.ticks += 1;

        log_score(
            subject_id,
            score.index,
            score.confidence,
            score.trend.as_str(),
            classification.level.as_str(),
        );
        if classification.level_changed() {
            log(
                logging::Level::Info,
                Domain::Classify,
                "level_changed",
                obj(&[
                    ("subject_id", v_str(subject_id)),
                    ("from", v_str(classification.previous.as_str())),
                    ("to", v_str(classification.level.as_str())),
                    ("index", v_num(score.index)),
                ]),
            );
        }
        self.bus.publish(EngineEvent::ScoreUpdated {
            subject_id: subject_id.to_string(),
            level: classification.level,
            score: score.clone(),
        });

        self.publish_crisis(subject_id, now, classification.crisis);

        // Sweep completions first so finished interventions free capacity.
        for record in core.dispatcher.complete_due(now) {
            self.publish_completed(record);
        }

        let admission = {
            let SubjectCore {
                dispatcher, actions, ..
            } = &mut *core;
            dispatcher.maybe_trigger(subject_id, &score, classification.level, &cfg, actions)
        };
        drop(core);

        match admission {
            Admission::Triggered(record) => {
                log_intervention(subject_id, &record.id, "intervention_triggered", record.level.as_str());
                self.bus.publish(EngineEvent::InterventionTriggered {
                    subject_id: subject_id.to_string(),
                    intervention: record.clone(),
                });
                self.spawn_execution(record);
            }
            Admission::CoolingDown { remaining_ms } => log(
                logging::Level::Debug,
                Domain::Dispatch,
                "cooldown_active",
                obj(&[
                    ("subject_id", v_str(subject_id)),
                    ("level", v_str(classification.level.as_str())),
                    ("remaining_ms", json!(remaining_ms)),
                ]),
            ),
            Admission::AtCapacity { active } => log(
                logging::Level::Debug,
                Domain::Dispatch,
                "at_capacity",
                obj(&[("subject_id", v_str(subject_id)), ("active", json!(active))]),
            ),
            Admission::NotRequired => {}
        }

        Ok(score)
    }

    fn publish_crisis(&self, subject_id: &str, now: Timestamp, transition: CrisisTransition) {
        let subject_id = subject_id.to_string();
        match transition {
            CrisisTransition::None => {}
            CrisisTransition::Progressed(pending) => log(
                logging::Level::Debug,
                Domain::Crisis,
                "crisis_progressed",
                obj(&[
                    ("subject_id", v_str(&subject_id)),
                    ("index", v_num(pending.last_index)),
                    ("confirmations", json!(pending.confirmations)),
                    ("escalating", json!(pending.escalating)),
                ]),
            ),
            CrisisTransition::Suspected(pending) => {
                log_crisis(&subject_id, "crisis_suspected", pending.last_index, pending.confirmations);
                self.bus.publish(EngineEvent::CrisisSuspected {
                    subject_id,
                    ts: now,
                    pending,
                });
            }
            CrisisTransition::Confirmed(pending) => {
                log_crisis(&subject_id, "crisis_confirmed", pending.last_index, pending.confirmations);
                self.bus.publish(EngineEvent::CrisisConfirmed {
                    subject_id,
                    ts: now,
                    pending,
                });
            }
            CrisisTransition::Cleared {
                pending,
                reason,
                restarted,
            } => {
                log_crisis(&subject_id, "crisis_cleared", pending.last_index, pending.confirmations);
                self.bus.publish(EngineEvent::CrisisCleared {
                    subject_id: subject_id.clone(),
                    ts: now,
                    pending,
                    reason,
                });
                if let Some(pending) = restarted {
                    self.publish_crisis(&subject_id, now, CrisisTransition::Suspected(pending));
                }
            }
        }
    }

    fn publish_completed(&self, record: InterventionRecord) {
        log_intervention(&record.subject_id, &record.id, "intervention_completed", record.level.as_str());
        self.bus.publish(EngineEvent::InterventionCompleted {
            subject_id: record.subject_id.clone(),
            intervention: record,
        });
    }

    /// Hand a triggered intervention to the executor without waiting on it.
    fn spawn_execution(&self, record: InterventionRecord) {
        let executor = match self.executor.read().clone() {
            Some(executor) => executor,
            None => return,
        };
        let bus = self.bus.clone();
        let clock = self.clock.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = executor.execute(&record.subject_id, &record).await {
                        report_execution_error(&bus, clock.now_ms(), &record, &format!("{:#}", err));
                    }
                });
            }
            Err(err) => {
                report_execution_error(&bus, clock.now_ms(), &record, &format!("no async runtime: {}", err));
            }
        }
    }

    /// Complete due interventions outside a tick.
    pub fn complete_due(&self, subject_id: &str) -> Result<Vec<InterventionRecord>> {
        let subject = self.subject(subject_id)?;
        let now = self.clock.now_ms();
        let completed = subject.core.lock().dispatcher.complete_due(now);
        for record in &completed {
            self.publish_completed(record.clone());
        }
        Ok(completed)
    }

    // =========================================================================
    // Learning
    // =========================================================================

    /// Report how well an intervention worked. Each intervention accepts one
    /// report; a second one fails with [`EngineError::OutcomeAlreadyRecorded`].
    ///
    /// Every `evaluate_every` outcomes for a (domain, level, kind) key the
    /// learner is asked for a proposal, which is published and returned. Under
    /// [`LearningPolicy::Manual`] it replaces any pending proposal for the same
    /// key; under [`LearningPolicy::AutoApply`] a valid proposal is applied
    /// immediately and the new config version is reported.
    pub fn record_outcome(
        &self,
        subject_id: &str,
        intervention_id: &str,
        effectiveness: f64,
        notes: BTreeMap<String, Value>,
    ) -> Result<OutcomeReport> {
        let subject = self.subject(subject_id)?;
        let now = self.clock.now_ms();
        let mut core = subject.core.lock();

        let record = core
            .dispatcher
            .find(intervention_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownIntervention {
                subject_id: subject_id.to_string(),
                intervention_id: intervention_id.to_string(),
            })?;
        if record.effectiveness.is_some() {
            return Err(EngineError::OutcomeAlreadyRecorded {
                subject_id: subject_id.to_string(),
                intervention_id: intervention_id.to_string(),
            });
        }

        let key = LevelKey::new(&subject.domain, record.level, &record.kind);
        let context = OutcomeContext {
            intervention_id: Some(record.id.clone()),
            effectiveness,
            timestamp: now,
            trigger_index: Some(record.trigger_index),
            notes,
        };
        let cfg = core.config.clone();
        let recorded = core.learner.record_outcome(key.clone(), effectiveness, context, &cfg.learning)?;
        core.dispatcher.set_effectiveness(intervention_id, effectiveness);

        log(
            logging::Level::Info,
            Domain::Learning,
            "outcome_recorded",
            obj(&[
                ("subject_id", v_str(subject_id)),
                ("intervention_id", v_str(intervention_id)),
                ("key", v_str(&key.to_string())),
                ("effectiveness", v_num(effectiveness)),
                ("avg_effectiveness", v_num(recorded.entry.avg_effectiveness)),
                ("total", json!(recorded.entry.total_count)),
            ]),
        );

        let mut report = OutcomeReport {
            entry: recorded.entry,
            proposal: None,
            applied_version: None,
        };
        if !recorded.evaluate {
            return Ok(report);
        }
        let proposal = match core.learner.propose_adjustment(
            &key,
            &cfg.thresholds,
            cfg.cooldown_ms,
            cfg.version,
            &cfg.learning,
        ) {
            Some(proposal) => proposal,
            None => return Ok(report),
        };

        log_adjustment(
            subject_id,
            "adjustment_proposed",
            proposal.boundary.as_str(),
            proposal.current,
            proposal.proposed,
        );
        self.bus.publish(EngineEvent::ThresholdAdjustmentProposed {
            subject_id: subject_id.to_string(),
            ts: now,
            adjustment: proposal.clone(),
        });

        match cfg.learning.policy {
            LearningPolicy::Manual => {
                core.proposals.retain(|p| p.key != proposal.key);
                core.proposals.push(proposal.clone());
            }
            LearningPolicy::AutoApply => {
                // A rejected proposal is logged and leaves the config as is.
                report.applied_version = self.apply_locked(subject_id, &mut core, &proposal, now).ok();
            }
        }
        report.proposal = Some(proposal);
        Ok(report)
    }

    /// Apply a proposal after validating the resulting configuration.
    /// Returns the new config version.
    pub fn apply_adjustment(&self, subject_id: &str, adjustment: &ThresholdAdjustment) -> Result<u64> {
        let subject = self.subject(subject_id)?;
        let now = self.clock.now_ms();
        let mut core = subject.core.lock();
        self.apply_locked(subject_id, &mut core, adjustment, now)
    }

    fn apply_locked(
        &self,
        subject_id: &str,
        core: &mut SubjectCore,
        adjustment: &ThresholdAdjustment,
        now: Timestamp,
    ) -> Result<u64> {
        let mut next = core.config.clone();
        next.thresholds = adjustment.apply_to(&next.thresholds);
        if let Some(cooldown_ms) = adjustment.proposed_cooldown_ms {
            next.cooldown_ms = cooldown_ms;
        }
        if let Err(err) = next.validate() {
            log(
                logging::Level::Warn,
                Domain::Learning,
                "adjustment_rejected",
                obj(&[
                    ("subject_id", v_str(subject_id)),
                    ("boundary", v_str(adjustment.boundary.as_str())),
                    ("proposed", v_num(adjustment.proposed)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
            return Err(err);
        }

        next.version = core.config.version + 1;
        let version = next.version;
        core.config = next;
        core.prune_proposals();

        log_adjustment(
            subject_id,
            "adjustment_applied",
            adjustment.boundary.as_str(),
            adjustment.current,
            adjustment.proposed,
        );
        self.bus.publish(EngineEvent::ThresholdAdjustmentApplied {
            subject_id: subject_id.to_string(),
            ts: now,
            adjustment: adjustment.clone(),
            config_version: version,
        });
        Ok(version)
    }

    /// Proposals emitted under the manual policy, at most one per key, that
    /// are neither applied nor made stale by a newer config.
    pub fn pending_adjustments(&self, subject_id: &str) -> Result<Vec<ThresholdAdjustment>> {
        Ok(self.subject(subject_id)?.core.lock().proposals.clone())
    }

    // =========================================================================
    // Monitoring lifecycle
    // =========================================================================

    /// Tick a subject every `period` on the ambient tokio runtime. Replaces
    /// any schedule already running for it.
    pub fn start_monitoring(self: &Arc<Self>, subject_id: &str, period: Duration) -> Result<()> {
        let subject = self.subject(subject_id)?;
        let engine: Weak<Self> = Arc::downgrade(self);
        let id = subject_id.to_string();

        let schedule = TickSchedule::spawn(period, move || {
            let engine = match engine.upgrade() {
                Some(engine) => engine,
                None => return false,
            };
            match engine.tick(&id) {
                Ok(_) => true,
                Err(EngineError::UnknownSubject(_)) => false,
                Err(err) => {
                    log(
                        logging::Level::Error,
                        Domain::Clock,
                        "tick_failed",
                        obj(&[("subject_id", v_str(&id)), ("error", v_str(&err.to_string()))]),
                    );
                    true
                }
            }
        })?;

        log(
            logging::Level::Info,
            Domain::Clock,
            "monitoring_started",
            obj(&[
                ("subject_id", v_str(subject_id)),
                ("period_ms", json!(period.as_millis() as u64)),
            ]),
        );
        if let Some(previous) = subject.schedule.lock().replace(schedule) {
            previous.cancel();
        }
        Ok(())
    }

    /// Cancel the tick schedule and drop any unconfirmed crisis. History,
    /// buffers and learning state are kept. Returns whether a schedule ran.
    pub fn stop_monitoring(&self, subject_id: &str) -> Result<bool> {
        let subject = self.subject(subject_id)?;
        let was_running = match subject.schedule.lock().take() {
            Some(schedule) => {
                schedule.cancel();
                true
            }
            None => false,
        };

        let cancelled = subject.core.lock().classifier.cancel_crisis();
        if let Some(pending) = cancelled {
            let now = self.clock.now_ms();
            log_crisis(subject_id, "crisis_cleared", pending.last_index, pending.confirmations);
            self.bus.publish(EngineEvent::CrisisCleared {
                subject_id: subject_id.to_string(),
                ts: now,
                pending,
                reason: ClearReason::Cancelled,
            });
        }

        log(
            logging::Level::Info,
            Domain::Clock,
            "monitoring_stopped",
            obj(&[("subject_id", v_str(subject_id)), ("was_running", json!(was_running))]),
        );
        Ok(was_running)
    }

    pub fn is_monitoring(&self, subject_id: &str) -> bool {
        self.registry
            .read()
            .get(subject_id)
            .map(|s| s.schedule.lock().as_ref().map_or(false, |sched| !sched.is_finished()))
            .unwrap_or(false)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn snapshot(&self, subject_id: &str) -> Result<SubjectSnapshot> {
        let subject = self.subject(subject_id)?;
        let monitoring = self.is_monitoring(subject_id);
        let sources: Vec<String> = subject.buffers.lock().sources().map(str::to_string).collect();
        let core = subject.core.lock();
        Ok(SubjectSnapshot {
            subject_id: subject.id.clone(),
            domain: subject.domain.clone(),
            config_version: core.config.version,
            config_fingerprint: core.config.fingerprint(),
            ticks: core.ticks,
            last_score: core.scorer.last().cloned(),
            level: core.classifier.last_level(),
            crisis: core.classifier.crisis().clone(),
            active_interventions: core.dispatcher.active().to_vec(),
            completed_interventions: core.dispatcher.history().count(),
            sources,
            effectiveness: core.learner.entries().cloned().collect(),
            pending_adjustments: core.proposals.clone(),
            monitoring,
        })
    }

    pub fn score_history(&self, subject_id: &str) -> Result<Vec<ScoreRecord>> {
        Ok(self.subject(subject_id)?.core.lock().scorer.history().cloned().collect())
    }

    pub fn intervention_history(&self, subject_id: &str) -> Result<Vec<InterventionRecord>> {
        Ok(self
            .subject(subject_id)?
            .core
            .lock()
            .dispatcher
            .history()
            .cloned()
            .collect())
    }
}

fn report_execution_error(bus: &EventBus, now: Timestamp, record: &InterventionRecord, error: &str) {
    log(
        logging::Level::Warn,
        Domain::Dispatch,
        "intervention_error",
        obj(&[
            ("subject_id", v_str(&record.subject_id)),
            ("intervention_id", v_str(&record.id)),
            ("error", v_str(error)),
        ]),
    );
    bus.publish(EngineEvent::InterventionError {
        subject_id: record.subject_id.clone(),
        intervention_id: record.id.clone(),
        ts: now,
        error: error.to_string(),
    });
}
