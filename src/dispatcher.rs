//! Tiered intervention dispatch with cooldown admission control.
//!
//! A classified level turns into a domain-supplied action bundle. The
//! cooldown is the admission gate: two triggers for one subject are never
//! closer than `cooldown_ms`, and no more than `max_concurrent_interventions`
//! are active at once. Interventions complete automatically once their
//! level-specific duration elapses, whether or not their actions succeeded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

use crate::buffer::Timestamp;
use crate::classifier::Level;
use crate::config::EngineConfig;
use crate::scorer::ScoreRecord;

/// One step of an intervention, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub kind: String,
    pub target: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl ActionSpec {
    pub fn new(kind: &str, target: &str) -> Self {
        Self {
            kind: kind.to_string(),
            target: target.to_string(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }
}

/// Fixed action set for one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionBundle {
    pub level: Level,
    /// Intervention type, part of the effectiveness key
    pub kind: String,
    pub actions: Vec<ActionSpec>,
    /// Auto-completion delay
    pub duration_ms: u64,
}

/// Level → bundle lookup supplied by a domain.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionTable {
    bundles: BTreeMap<Level, ActionBundle>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle(mut self, bundle: ActionBundle) -> Self {
        self.bundles.insert(bundle.level, bundle);
        self
    }

    pub fn get(&self, level: Level) -> Option<&ActionBundle> {
        self.bundles.get(&level)
    }

    /// Bundle for a level, or an empty placeholder with a duration scaled to
    /// the level.
    pub fn bundle_for(&self, level: Level) -> ActionBundle {
        self.bundles.get(&level).cloned().unwrap_or_else(|| ActionBundle {
            level,
            kind: level.as_str().to_string(),
            actions: Vec::new(),
            duration_ms: default_duration_ms(level),
        })
    }

    /// Generic notify / mitigate / contain ladder.
    pub fn generic() -> Self {
        Self::new()
            .with_bundle(ActionBundle {
                level: Level::Gentle,
                kind: "notify".to_string(),
                actions: vec![ActionSpec::new("notify", "operator")],
                duration_ms: default_duration_ms(Level::Gentle),
            })
            .with_bundle(ActionBundle {
                level: Level::Moderate,
                kind: "mitigate".to_string(),
                actions: vec![
                    ActionSpec::new("notify", "operator"),
                    ActionSpec::new("reduce_load", "subject").param("factor", Value::from(0.5)),
                ],
                duration_ms: default_duration_ms(Level::Moderate),
            })
            .with_bundle(ActionBundle {
                level: Level::Aggressive,
                kind: "contain".to_string(),
                actions: vec![
                    ActionSpec::new("alert", "operator"),
                    ActionSpec::new("halt", "subject"),
                ],
                duration_ms: default_duration_ms(Level::Aggressive),
            })
    }
}

pub fn default_duration_ms(level: Level) -> u64 {
    match level {
        Level::Normal => 0,
        Level::Gentle => 10_000,
        Level::Moderate => 20_000,
        Level::Aggressive => 30_000,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRecord {
    pub id: String,
    pub subject_id: String,
    pub level: Level,
    pub kind: String,
    pub trigger_index: f64,
    pub timestamp: Timestamp,
    /// Scheduled auto-completion time
    pub due_at: Timestamp,
    pub actions: Vec<ActionSpec>,
    pub status: InterventionStatus,
    pub completed_at: Option<Timestamp>,
    /// Reported outcome; at most one per intervention
    #[serde(default)]
    pub effectiveness: Option<f64>,
}

impl InterventionRecord {
    pub fn is_active(&self) -> bool {
        self.status == InterventionStatus::Active
    }
}

/// Why `maybe_trigger` did or did not dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Triggered(InterventionRecord),
    /// Level is normal
    NotRequired,
    CoolingDown { remaining_ms: u64 },
    AtCapacity { active: usize },
}

impl Admission {
    pub fn triggered(self) -> Option<InterventionRecord> {
        match self {
            Admission::Triggered(record) => Some(record),
            _ => None,
        }
    }
}

/// Executes intervention actions against the domain's own systems.
///
/// Runs detached from the scoring loop; an `Err` is reported as an
/// intervention error and never affects bookkeeping.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, subject_id: &str, intervention: &InterventionRecord) -> anyhow::Result<()>;
}

/// Intervention ID: INT-<subject>-<ts>-<seq>
pub fn intervention_id(subject_id: &str, ts: Timestamp, seq: u64) -> String {
    format!("INT-{}-{}-{}", subject_id, ts, seq)
}

/// Per-subject dispatch state.
#[derive(Debug, Clone)]
pub struct InterventionDispatcher {
    active: Vec<InterventionRecord>,
    history: VecDeque<InterventionRecord>,
    history_capacity: usize,
    last_trigger: Option<Timestamp>,
    seq: u64,
}

impl InterventionDispatcher {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            active: Vec::new(),
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
            last_trigger: None,
            seq: 0,
        }
    }

    pub fn set_history_capacity(&mut self, capacity: usize) {
        self.history_capacity = capacity.max(1);
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
    }

    /// Admit an intervention for this score if the level, cooldown and
    /// concurrency limit allow it.
    pub fn maybe_trigger(
        &mut self,
        subject_id: &str,
        score: &ScoreRecord,
        level: Level,
        cfg: &EngineConfig,
        table: &ActionTable,
    ) -> Admission {
        if !level.is_intervention() {
            return Admission::NotRequired;
        }

        let now = score.timestamp;
        if let Some(last) = self.last_trigger {
            let elapsed = now.saturating_sub(last);
            if elapsed < cfg.cooldown_ms {
                return Admission::CoolingDown {
                    remaining_ms: cfg.cooldown_ms - elapsed,
                };
            }
        }

        if self.active.len() >= cfg.max_concurrent_interventions {
            return Admission::AtCapacity {
                active: self.active.len(),
            };
        }

        self.seq += 1;
        let bundle = table.bundle_for(level);
        let record = InterventionRecord {
            id: intervention_id(subject_id, now, self.seq),
            subject_id: subject_id.to_string(),
            level,
            kind: bundle.kind,
            trigger_index: score.index,
            timestamp: now,
            due_at: now.saturating_add(bundle.duration_ms),
            actions: bundle.actions,
            status: InterventionStatus::Active,
            completed_at: None,
            effectiveness: None,
        };
        self.last_trigger = Some(now);
        self.active.push(record.clone());
        Admission::Triggered(record)
    }

    /// Complete every active intervention whose duration has elapsed.
    pub fn complete_due(&mut self, now: Timestamp) -> Vec<InterventionRecord> {
        let (due, still_active): (Vec<_>, Vec<_>) =
            self.active.drain(..).partition(|r| r.due_at <= now);
        self.active = still_active;

        let mut completed = Vec::with_capacity(due.len());
        for mut record in due {
            record.status = InterventionStatus::Completed;
            record.completed_at = Some(now);
            if self.history.len() >= self.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(record.clone());
            completed.push(record);
        }
        completed
    }

    pub fn active(&self) -> &[InterventionRecord] {
        &self.active
    }

    pub fn history(&self) -> impl Iterator<Item = &InterventionRecord> {
        self.history.iter()
    }

    pub fn last_trigger(&self) -> Option<Timestamp> {
        self.last_trigger
    }

    /// Look up an intervention, active or completed.
    pub fn find(&self, id: &str) -> Option<&InterventionRecord> {
        self.active
            .iter()
            .find(|r| r.id == id)
            .or_else(|| self.history.iter().find(|r| r.id == id))
    }

    /// Attach a reported outcome. Returns false if the id is unknown.
    pub fn set_effectiveness(&mut self, id: &str, effectiveness: f64) -> bool {
        let record = match self.active.iter_mut().find(|r| r.id == id) {
            Some(record) => Some(record),
            None => self.history.iter_mut().find(|r| r.id == id),
        };
        match record {
            Some(record) => {
                record.effectiveness = Some(effectiveness);
                true
            }
            None => false,
        }
    }
}
