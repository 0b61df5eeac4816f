//! Effectiveness learning: intervention outcomes feed back into thresholds.
//!
//! Each `(domain, level, kind)` key keeps running success and average
//! effectiveness. Every `evaluate_every` outcomes the key is evaluated and
//! may yield a [`ThresholdAdjustment`]. The learner never touches live
//! configuration; proposals are advisory until a supervisor applies them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

use crate::buffer::Timestamp;
use crate::classifier::Level;
use crate::config::{LearningConfig, Thresholds};
use crate::error::{EngineError, Result};

/// Smallest gap kept between neighbouring boundaries when proposing.
const BOUNDARY_GAP: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LevelKey {
    pub domain: String,
    pub level: Level,
    /// Intervention type (bundle kind)
    pub kind: String,
}

impl LevelKey {
    pub fn new(domain: &str, level: Level, kind: &str) -> Self {
        Self {
            domain: domain.to_string(),
            level,
            kind: kind.to_string(),
        }
    }
}

impl std::fmt::Display for LevelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.domain, self.level, self.kind)
    }
}

/// Circumstances of one reported outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeContext {
    pub intervention_id: Option<String>,
    pub effectiveness: f64,
    pub timestamp: Timestamp,
    pub trigger_index: Option<f64>,
    #[serde(default)]
    pub notes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivenessEntry {
    pub key: LevelKey,
    pub success_count: u64,
    pub total_count: u64,
    pub avg_effectiveness: f64,
    pub recent_contexts: VecDeque<OutcomeContext>,
    /// Outcomes since the key was last evaluated
    since_evaluation: u32,
}

impl EffectivenessEntry {
    fn new(key: LevelKey) -> Self {
        Self {
            key,
            success_count: 0,
            total_count: 0,
            avg_effectiveness: 0.0,
            recent_contexts: VecDeque::new(),
            since_evaluation: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_count as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    /// Interventions at this level are not helping: intervene earlier, less often
    LowEffectiveness,
    /// Interventions reliably help: the band can be relaxed
    HighEffectiveness,
}

/// Advisory change to one level boundary and, optionally, the cooldown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdAdjustment {
    pub key: LevelKey,
    pub boundary: Level,
    pub current: f64,
    pub proposed: f64,
    pub current_cooldown_ms: u64,
    pub proposed_cooldown_ms: Option<u64>,
    pub avg_effectiveness: f64,
    pub success_rate: f64,
    pub sample_count: u64,
    pub reason: AdjustmentReason,
    /// Config version the proposal was computed against
    pub config_version: u64,
}

impl ThresholdAdjustment {
    /// Thresholds with this proposal applied; validation is the caller's job.
    pub fn apply_to(&self, thresholds: &Thresholds) -> Thresholds {
        thresholds.with_boundary(self.boundary, self.proposed)
    }
}

/// Outcome bookkeeping result.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecorded {
    pub entry: EffectivenessEntry,
    /// The key reached its evaluation interval
    pub evaluate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EffectivenessLearner {
    entries: BTreeMap<LevelKey, EffectivenessEntry>,
}

impl EffectivenessLearner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(
        &mut self,
        key: LevelKey,
        effectiveness: f64,
        context: OutcomeContext,
        cfg: &LearningConfig,
    ) -> Result<OutcomeRecorded> {
        if !effectiveness.is_finite() || !(0.0..=1.0).contains(&effectiveness) {
            return Err(EngineError::InvalidEffectiveness(effectiveness));
        }

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| EffectivenessEntry::new(key));

        entry.total_count += 1;
        if effectiveness >= cfg.success_cutoff {
            entry.success_count += 1;
        }
        // Incremental mean
        entry.avg_effectiveness += (effectiveness - entry.avg_effectiveness) / entry.total_count as f64;

        entry.recent_contexts.push_back(context);
        while entry.recent_contexts.len() > cfg.recent_contexts.max(1) {
            entry.recent_contexts.pop_front();
        }

        entry.since_evaluation += 1;
        let evaluate = entry.since_evaluation >= cfg.evaluate_every.max(1);
        if evaluate {
            entry.since_evaluation = 0;
        }

        Ok(OutcomeRecorded {
            entry: entry.clone(),
            evaluate,
        })
    }

    /// Propose a boundary (and cooldown) change for a key, if its average
    /// effectiveness sits outside the floor/ceiling band.
    pub fn propose_adjustment(
        &self,
        key: &LevelKey,
        thresholds: &Thresholds,
        cooldown_ms: u64,
        config_version: u64,
        cfg: &LearningConfig,
    ) -> Option<ThresholdAdjustment> {
        let entry = self.entries.get(key)?;
        let current = thresholds.boundary(key.level)?;
        if entry.total_count == 0 {
            return None;
        }

        let (lower, upper) = neighbour_bounds(key.level, thresholds, cfg.min_boundary);
        let step = cfg.boundary_step;

        let (reason, proposed, proposed_cooldown_ms) = if entry.avg_effectiveness < cfg.effectiveness_floor {
            let proposed = (current - step).max(lower).min(current);
            let extended = ((cooldown_ms as f64) * (1.0 + cfg.cooldown_step_pct)).round() as u64;
            let extended = extended.min(cfg.max_cooldown_ms.max(cooldown_ms));
            let cooldown = (extended > cooldown_ms).then_some(extended);
            (AdjustmentReason::LowEffectiveness, proposed, cooldown)
        } else if entry.avg_effectiveness > cfg.effectiveness_ceiling {
            let proposed = (current + step).min(upper).max(current);
            (AdjustmentReason::HighEffectiveness, proposed, None)
        } else {
            return None;
        };

        if (proposed - current).abs() < 1e-12 && proposed_cooldown_ms.is_none() {
            return None;
        }

        Some(ThresholdAdjustment {
            key: key.clone(),
            boundary: key.level,
            current,
            proposed,
            current_cooldown_ms: cooldown_ms,
            proposed_cooldown_ms,
            avg_effectiveness: entry.avg_effectiveness,
            success_rate: entry.success_rate(),
            sample_count: entry.total_count,
            reason,
            config_version,
        })
    }

    pub fn entry(&self, key: &LevelKey) -> Option<&EffectivenessEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &EffectivenessEntry> {
        self.entries.values()
    }
}

/// Range a boundary may move within without crossing its neighbours.
fn neighbour_bounds(level: Level, t: &Thresholds, min_boundary: f64) -> (f64, f64) {
    match level {
        Level::Normal => (0.0, 0.0),
        Level::Gentle => (min_boundary, t.moderate - BOUNDARY_GAP),
        Level::Moderate => (t.gentle + BOUNDARY_GAP, t.aggressive - BOUNDARY_GAP),
        Level::Aggressive => (t.moderate + BOUNDARY_GAP, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(effectiveness: f64) -> OutcomeContext {
        OutcomeContext {
            intervention_id: None,
            effectiveness,
            timestamp: 0,
            trigger_index: None,
            notes: BTreeMap::new(),
        }
    }

    fn key(level: Level) -> LevelKey {
        LevelKey::new("market", level, "hedge")
    }

    #[test]
    fn test_running_stats() {
        let mut l = EffectivenessLearner::new();
        let cfg = LearningConfig::default();
        for e in [1.0, 0.0, 0.5, 0.9] {
            l.record_outcome(key(Level::Moderate), e, ctx(e), &cfg).unwrap();
        }
        let entry = l.entry(&key(Level::Moderate)).unwrap();
        assert_eq!(entry.total_count, 4);
        assert_eq!(entry.success_count, 2);
        assert!((entry.avg_effectiveness - 0.6).abs() < 1e-12);
        assert!((entry.success_rate() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut l = EffectivenessLearner::new();
        let cfg = LearningConfig::default();
        assert!(l.record_outcome(key(Level::Gentle), 1.5, ctx(1.5), &cfg).is_err());
        assert!(l.record_outcome(key(Level::Gentle), f64::NAN, ctx(0.0), &cfg).is_err());
        assert!(l.entry(&key(Level::Gentle)).is_none());
    }

    #[test]
    fn test_evaluation_interval() {
        let mut l = EffectivenessLearner::new();
        let cfg = LearningConfig {
            evaluate_every: 3,
            ..LearningConfig::default()
        };
        let flags: Vec<bool> = (0..6)
            .map(|_| l.record_outcome(key(Level::Gentle), 0.2, ctx(0.2), &cfg).unwrap().evaluate)
            .collect();
        assert_eq!(flags, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_recent_contexts_bounded() {
        let mut l = EffectivenessLearner::new();
        let cfg = LearningConfig {
            recent_contexts: 2,
            ..LearningConfig::default()
        };
        for e in [0.1, 0.2, 0.3] {
            l.record_outcome(key(Level::Gentle), e, ctx(e), &cfg).unwrap();
        }
        let entry = l.entry(&key(Level::Gentle)).unwrap();
        assert_eq!(entry.recent_contexts.len(), 2);
        assert_eq!(entry.recent_contexts[0].effectiveness, 0.2);
    }

    #[test]
    fn test_low_effectiveness_lowers_boundary_and_extends_cooldown() {
        let mut l = EffectivenessLearner::new();
        let cfg = LearningConfig::default();
        for _ in 0..5 {
            l.record_outcome(key(Level::Moderate), 0.2, ctx(0.2), &cfg).unwrap();
        }
        let adj = l
            .propose_adjustment(&key(Level::Moderate), &Thresholds::default(), 20_000, 1, &cfg)
            .unwrap();
        assert_eq!(adj.reason, AdjustmentReason::LowEffectiveness);
        assert!((adj.proposed - 0.55).abs() < 1e-12);
        assert_eq!(adj.proposed_cooldown_ms, Some(25_000));
        assert!(adj.apply_to(&Thresholds::default()).validate().is_ok());
    }

    #[test]
    fn test_high_effectiveness_raises_boundary() {
        let mut l = EffectivenessLearner::new();
        let cfg = LearningConfig::default();
        l.record_outcome(key(Level::Gentle), 0.95, ctx(0.95), &cfg).unwrap();
        let adj = l
            .propose_adjustment(&key(Level::Gentle), &Thresholds::default(), 20_000, 1, &cfg)
            .unwrap();
        assert_eq!(adj.reason, AdjustmentReason::HighEffectiveness);
        assert!((adj.proposed - 0.35).abs() < 1e-12);
        assert_eq!(adj.proposed_cooldown_ms, None);
    }

    #[test]
    fn test_step_is_bounded_by_neighbours() {
        let mut l = EffectivenessLearner::new();
        let cfg = LearningConfig {
            boundary_step: 0.5,
            ..LearningConfig::default()
        };
        l.record_outcome(key(Level::Moderate), 0.95, ctx(0.95), &cfg).unwrap();
        let adj = l
            .propose_adjustment(&key(Level::Moderate), &Thresholds::default(), 20_000, 1, &cfg)
            .unwrap();
        assert!((adj.proposed - 0.79).abs() < 1e-12);
        assert!(adj.apply_to(&Thresholds::default()).validate().is_ok());
    }

    #[test]
    fn test_mid_band_proposes_nothing() {
        let mut l = EffectivenessLearner::new();
        let cfg = LearningConfig::default();
        l.record_outcome(key(Level::Moderate), 0.7, ctx(0.7), &cfg).unwrap();
        assert!(l
            .propose_adjustment(&key(Level::Moderate), &Thresholds::default(), 20_000, 1, &cfg)
            .is_none());
    }
}
