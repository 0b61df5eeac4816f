//! Engine configuration: weights, threshold bands, cooldowns, windows and
//! learning policy.
//!
//! A subject's config is live: every tick re-reads it, and it only changes
//! through an explicit `configure` or an applied threshold adjustment. Each
//! change bumps `version`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::classifier::Level;
use crate::error::{EngineError, Result};
use crate::features::{ExtractionParams, SpectralBand};

/// Level boundaries on the [0, 1] index, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub gentle: f64,
    pub moderate: f64,
    pub aggressive: f64,
    /// Index at or above which a crisis becomes pending
    pub crisis: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            gentle: 0.3,
            moderate: 0.6,
            aggressive: 0.8,
            crisis: 0.85,
        }
    }
}

impl Thresholds {
    /// Lower boundary of a level; `Normal` has none.
    pub fn boundary(&self, level: Level) -> Option<f64> {
        match level {
            Level::Normal => None,
            Level::Gentle => Some(self.gentle),
            Level::Moderate => Some(self.moderate),
            Level::Aggressive => Some(self.aggressive),
        }
    }

    pub fn with_boundary(mut self, level: Level, value: f64) -> Self {
        match level {
            Level::Normal => {}
            Level::Gentle => self.gentle = value,
            Level::Moderate => self.moderate = value,
            Level::Aggressive => self.aggressive = value,
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let all = [self.gentle, self.moderate, self.aggressive, self.crisis];
        if all.iter().any(|v| !v.is_finite() || *v <= 0.0 || *v > 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "thresholds must lie in (0, 1]: {:?}",
                self
            )));
        }
        if !(self.gentle < self.moderate && self.moderate < self.aggressive) {
            return Err(EngineError::InvalidConfig(format!(
                "thresholds must be strictly ascending: gentle={} moderate={} aggressive={}",
                self.gentle, self.moderate, self.aggressive
            )));
        }
        if self.crisis < self.gentle {
            return Err(EngineError::InvalidConfig(format!(
                "crisis threshold {} below gentle {}",
                self.crisis, self.gentle
            )));
        }
        Ok(())
    }
}

/// Shared mapping of raw features into [0, 1] components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    /// Relative volatility that maps to a component of 1.0
    pub volatility_saturation: f64,
    /// Spectral slope magnitude treated as fully stable (component 0.0)
    pub slope_reference: f64,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            volatility_saturation: 0.25,
            slope_reference: 2.0,
        }
    }
}

/// Who applies threshold adjustment proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningPolicy {
    /// Proposals are emitted; a supervisor calls `apply_adjustment`
    Manual,
    /// Valid proposals are applied as soon as they are emitted
    AutoApply,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Evaluate a key after this many outcomes
    pub evaluate_every: u32,
    /// Average effectiveness below this triggers an earlier boundary
    pub effectiveness_floor: f64,
    /// Average effectiveness above this relaxes the boundary
    pub effectiveness_ceiling: f64,
    /// Effectiveness counted as a success
    pub success_cutoff: f64,
    /// Largest boundary move per proposal
    pub boundary_step: f64,
    /// Boundaries never move below this
    pub min_boundary: f64,
    /// Relative cooldown extension proposed alongside a lowered boundary
    pub cooldown_step_pct: f64,
    pub max_cooldown_ms: u64,
    /// Contexts retained per effectiveness entry
    pub recent_contexts: usize,
    pub policy: LearningPolicy,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            evaluate_every: 5,
            effectiveness_floor: 0.5,
            effectiveness_ceiling: 0.85,
            success_cutoff: 0.6,
            boundary_step: 0.05,
            min_boundary: 0.05,
            cooldown_step_pct: 0.25,
            max_cooldown_ms: 300_000,
            recent_contexts: 10,
            policy: LearningPolicy::Manual,
        }
    }
}

impl LearningConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = [
            self.effectiveness_floor,
            self.effectiveness_ceiling,
            self.success_cutoff,
            self.boundary_step,
            self.min_boundary,
        ];
        if unit.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0) {
            return Err(EngineError::InvalidConfig(
                "learning parameters must lie in [0, 1]".to_string(),
            ));
        }
        if self.effectiveness_floor >= self.effectiveness_ceiling {
            return Err(EngineError::InvalidConfig(format!(
                "effectiveness floor {} must be below ceiling {}",
                self.effectiveness_floor, self.effectiveness_ceiling
            )));
        }
        if self.evaluate_every == 0 {
            return Err(EngineError::InvalidConfig(
                "learning evaluate_every must be at least 1".to_string(),
            ));
        }
        if !self.cooldown_step_pct.is_finite() || self.cooldown_step_pct < 0.0 {
            return Err(EngineError::InvalidConfig(
                "cooldown_step_pct must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn default_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("volatility".to_string(), 0.55),
        ("autocorrelation".to_string(), 0.25),
        ("spectral".to_string(), 0.20),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bumped on every accepted change
    pub version: u64,
    /// Component weights keyed by `component` or `source.component`
    pub weights: BTreeMap<String, f64>,
    pub thresholds: Thresholds,
    /// Minimum spacing between two triggered interventions
    pub cooldown_ms: u64,
    /// Consecutive above-crisis readings needed to confirm
    pub crisis_window: u32,
    /// A pending crisis older than this clears
    pub crisis_timeout_ms: u64,
    /// Samples per source handed to extractors
    pub window_size: usize,
    /// Shorter windows yield zero-quality features
    pub min_window: usize,
    pub buffer_capacity: usize,
    /// Score and intervention history bound
    pub history_capacity: usize,
    pub max_concurrent_interventions: usize,
    pub normalization: Normalization,
    pub spectral_band: SpectralBand,
    pub learning: LearningConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 0,
            weights: default_weights(),
            thresholds: Thresholds::default(),
            cooldown_ms: 20_000,
            crisis_window: 3,
            crisis_timeout_ms: 60_000,
            window_size: 50,
            min_window: 10,
            buffer_capacity: 256,
            history_capacity: 100,
            max_concurrent_interventions: 1,
            normalization: Normalization::default(),
            spectral_band: SpectralBand::default(),
            learning: LearningConfig::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `name=weight,name=weight`; malformed pairs are skipped.
pub fn parse_weights(list: &str) -> BTreeMap<String, f64> {
    list.split(',')
        .filter_map(|pair| {
            let (name, weight) = pair.split_once('=')?;
            let weight: f64 = weight.trim().parse().ok()?;
            Some((name.trim().to_string(), weight))
        })
        .collect()
}

impl EngineConfig {
    /// Defaults overridden by `FRACTURE_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let weights = std::env::var("FRACTURE_WEIGHTS")
            .ok()
            .map(|v| parse_weights(&v))
            .filter(|w| !w.is_empty())
            .unwrap_or(d.weights);
        let policy = match std::env::var("FRACTURE_LEARNING_POLICY").as_deref() {
            Ok("auto") | Ok("auto_apply") => LearningPolicy::AutoApply,
            _ => d.learning.policy,
        };

        Self {
            version: 0,
            weights,
            thresholds: Thresholds {
                gentle: env_or("FRACTURE_GENTLE", d.thresholds.gentle),
                moderate: env_or("FRACTURE_MODERATE", d.thresholds.moderate),
                aggressive: env_or("FRACTURE_AGGRESSIVE", d.thresholds.aggressive),
                crisis: env_or("FRACTURE_CRISIS", d.thresholds.crisis),
            },
            cooldown_ms: env_or("FRACTURE_COOLDOWN_MS", d.cooldown_ms),
            crisis_window: env_or("FRACTURE_CRISIS_WINDOW", d.crisis_window),
            crisis_timeout_ms: env_or("FRACTURE_CRISIS_TIMEOUT_MS", d.crisis_timeout_ms),
            window_size: env_or("FRACTURE_WINDOW", d.window_size),
            min_window: env_or("FRACTURE_MIN_WINDOW", d.min_window),
            buffer_capacity: env_or("FRACTURE_CAPACITY", d.buffer_capacity),
            history_capacity: env_or("FRACTURE_HISTORY", d.history_capacity),
            max_concurrent_interventions: env_or("FRACTURE_MAX_CONCURRENT", d.max_concurrent_interventions),
            normalization: Normalization {
                volatility_saturation: env_or("FRACTURE_VOL_SATURATION", d.normalization.volatility_saturation),
                slope_reference: env_or("FRACTURE_SLOPE_REFERENCE", d.normalization.slope_reference),
            },
            spectral_band: SpectralBand {
                low: env_or("FRACTURE_BAND_LOW", d.spectral_band.low),
                high: env_or("FRACTURE_BAND_HIGH", d.spectral_band.high),
            },
            learning: LearningConfig {
                evaluate_every: env_or("FRACTURE_LEARN_EVERY", d.learning.evaluate_every),
                effectiveness_floor: env_or("FRACTURE_LEARN_FLOOR", d.learning.effectiveness_floor),
                policy,
                ..d.learning
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.weights.is_empty() {
            return Err(EngineError::InvalidConfig("no component weights".to_string()));
        }
        if let Some((name, w)) = self
            .weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(EngineError::InvalidConfig(format!(
                "weight {} for {} must be finite and non-negative",
                w, name
            )));
        }
        if self.weights.values().sum::<f64>() <= 0.0 {
            return Err(EngineError::InvalidConfig("weights sum to zero".to_string()));
        }
        self.thresholds.validate()?;
        if self.crisis_window == 0 {
            return Err(EngineError::InvalidConfig("crisis_window must be at least 1".to_string()));
        }
        if self.min_window < 4 {
            return Err(EngineError::InvalidConfig(format!(
                "min_window {} below 4",
                self.min_window
            )));
        }
        if self.window_size < self.min_window {
            return Err(EngineError::InvalidConfig(format!(
                "window_size {} below min_window {}",
                self.window_size, self.min_window
            )));
        }
        if self.buffer_capacity < self.window_size {
            return Err(EngineError::InvalidConfig(format!(
                "buffer_capacity {} below window_size {}",
                self.buffer_capacity, self.window_size
            )));
        }
        if self.history_capacity < 3 {
            return Err(EngineError::InvalidConfig("history_capacity below 3".to_string()));
        }
        if self.max_concurrent_interventions == 0 {
            return Err(EngineError::InvalidConfig(
                "max_concurrent_interventions must be at least 1".to_string(),
            ));
        }
        let n = &self.normalization;
        if !(n.volatility_saturation.is_finite() && n.volatility_saturation > 0.0)
            || !(n.slope_reference.is_finite() && n.slope_reference > 0.0)
        {
            return Err(EngineError::InvalidConfig(
                "normalization constants must be positive".to_string(),
            ));
        }
        if !self.spectral_band.is_valid() {
            return Err(EngineError::InvalidConfig(format!(
                "spectral band must satisfy 0 <= low < high <= 0.5: {:?}",
                self.spectral_band
            )));
        }
        self.learning.validate()
    }

    pub fn extraction_params(&self) -> ExtractionParams {
        ExtractionParams {
            min_window: self.min_window,
            band: self.spectral_band,
        }
    }

    /// SHA-256 of the settings, independent of `version`.
    pub fn fingerprint(&self) -> String {
        let mut canonical = self.clone();
        canonical.version = 0;
        let json = serde_json::to_string(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.thresholds.gentle, 0.3);
        assert_eq!(cfg.thresholds.moderate, 0.6);
        assert_eq!(cfg.thresholds.aggressive, 0.8);
        assert_eq!(cfg.thresholds.crisis, 0.85);
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let mut cfg = EngineConfig::default();
        cfg.thresholds.moderate = 0.9;
        assert!(matches!(cfg.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_out_of_range_boundary() {
        let t = Thresholds::default().with_boundary(Level::Gentle, -0.1);
        assert!(t.validate().is_err());
        let t = Thresholds::default().with_boundary(Level::Aggressive, 1.2);
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_rejects_negative_weight() {
        let mut cfg = EngineConfig::default();
        cfg.weights.insert("volatility".to_string(), -1.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_windows() {
        let mut cfg = EngineConfig::default();
        cfg.window_size = 5;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.buffer_capacity = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.spectral_band = SpectralBand { low: 0.3, high: 0.2 };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_version() {
        let a = EngineConfig::default();
        let mut b = a.clone();
        b.version = 9;
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.cooldown_ms = 1;
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_parse_weights() {
        let w = parse_weights("volatility=0.5, spectral=0.2,bogus,x=abc");
        assert_eq!(w.len(), 2);
        assert_eq!(w["volatility"], 0.5);
        assert_eq!(w["spectral"], 0.2);
    }

    #[test]
    fn test_serde_roundtrip_keeps_policy() {
        let mut cfg = EngineConfig::default();
        cfg.learning.policy = LearningPolicy::AutoApply;
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("auto_apply"));
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.learning.policy, LearningPolicy::AutoApply);
        assert_eq!(back.cooldown_ms, cfg.cooldown_ms);
        assert!((back.thresholds.moderate - 0.6).abs() < 1e-12);
    }
}
