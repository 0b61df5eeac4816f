//! Domain profiles: one engine, different plug-ins.
//!
//! A domain contributes an extractor with its own sub-scores, default weights
//! and cooldowns, and the action bundles for each level. The numeric defaults
//! are starting points for configuration, not calibrated values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::buffer::SignalWindow;
use crate::classifier::Level;
use crate::config::EngineConfig;
use crate::dispatcher::{default_duration_ms, ActionBundle, ActionSpec, ActionTable};
use crate::features::{mean, standard_features, ExtractionParams, FeatureExtractor, FeatureSet};

/// Structural sub-scores a domain can add on top of the standard features.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubScore {
    /// Decline of the latest value from the window peak, relative to the peak
    Drawdown,
    /// Drop of the recent half's mean below the earlier half's
    Regression,
    /// Fraction of samples outside a safe range
    RangeExcursion { low: f64, high: f64 },
}

impl SubScore {
    pub fn name(&self) -> &'static str {
        match self {
            SubScore::Drawdown => "drawdown",
            SubScore::Regression => "regression",
            SubScore::RangeExcursion { .. } => "range_excursion",
        }
    }

    /// Sub-score in [0, 1]. Empty input scores 0.
    pub fn compute(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let raw = match *self {
            SubScore::Drawdown => {
                let peak = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let last = values[values.len() - 1];
                if peak.abs() < 1e-12 {
                    0.0
                } else {
                    (peak - last) / peak.abs()
                }
            }
            SubScore::Regression => {
                if values.len() < 2 {
                    return 0.0;
                }
                let (early, recent) = values.split_at(values.len() / 2);
                let base = mean(early);
                if base.abs() < 1e-12 {
                    0.0
                } else {
                    (base - mean(recent)) / base.abs()
                }
            }
            SubScore::RangeExcursion { low, high } => {
                let outside = values.iter().filter(|&&v| v < low || v > high).count();
                outside as f64 / values.len() as f64
            }
        };
        if raw.is_finite() {
            raw.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Standard features plus a domain's sub-scores.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DomainExtractor {
    sub_scores: Vec<SubScore>,
}

impl DomainExtractor {
    pub fn new(sub_scores: Vec<SubScore>) -> Self {
        Self { sub_scores }
    }
}

impl FeatureExtractor for DomainExtractor {
    fn extract(&self, window: &SignalWindow, params: &ExtractionParams) -> FeatureSet {
        let mut features = standard_features(window, params);
        if features.is_empty() {
            return features;
        }
        let values: Vec<f64> = window.values().into_iter().filter(|v| v.is_finite()).collect();
        for sub in &self.sub_scores {
            features = features.with_field(sub.name(), sub.compute(&values));
        }
        features
    }
}

/// Everything a domain plugs into the engine.
#[derive(Debug, Clone)]
pub struct DomainProfile {
    pub name: String,
    pub sub_scores: Vec<SubScore>,
    pub config: EngineConfig,
    pub actions: ActionTable,
}

impl DomainProfile {
    pub fn extractor(&self) -> DomainExtractor {
        DomainExtractor::new(self.sub_scores.clone())
    }

    /// Domain-agnostic profile: standard features and the generic ladder.
    pub fn generic() -> Self {
        Self {
            name: "generic".to_string(),
            sub_scores: Vec::new(),
            config: EngineConfig::default(),
            actions: ActionTable::generic(),
        }
    }

    pub fn market() -> Self {
        let config = EngineConfig {
            weights: weights(&[
                ("volatility", 0.45),
                ("autocorrelation", 0.20),
                ("spectral", 0.15),
                ("drawdown", 0.20),
            ]),
            cooldown_ms: 30_000,
            ..EngineConfig::default()
        };
        let actions = ActionTable::new()
            .with_bundle(bundle(
                Level::Gentle,
                "reduce_exposure",
                vec![ActionSpec::new("scale_position", "portfolio").param("factor", Value::from(0.75))],
            ))
            .with_bundle(bundle(
                Level::Moderate,
                "hedge",
                vec![
                    ActionSpec::new("scale_position", "portfolio").param("factor", Value::from(0.5)),
                    ActionSpec::new("open_hedge", "portfolio"),
                ],
            ))
            .with_bundle(bundle(
                Level::Aggressive,
                "flatten",
                vec![
                    ActionSpec::new("cancel_orders", "venue"),
                    ActionSpec::new("close_positions", "portfolio"),
                    ActionSpec::new("alert", "operator"),
                ],
            ));
        Self {
            name: "market".to_string(),
            sub_scores: vec![SubScore::Drawdown],
            config,
            actions,
        }
    }

    pub fn learning() -> Self {
        let config = EngineConfig {
            weights: weights(&[
                ("volatility", 0.35),
                ("autocorrelation", 0.25),
                ("spectral", 0.15),
                ("regression", 0.25),
            ]),
            cooldown_ms: 20_000,
            ..EngineConfig::default()
        };
        let actions = ActionTable::new()
            .with_bundle(bundle(
                Level::Gentle,
                "hint",
                vec![ActionSpec::new("show_hint", "learner")],
            ))
            .with_bundle(bundle(
                Level::Moderate,
                "scaffold",
                vec![
                    ActionSpec::new("lower_difficulty", "session").param("steps", Value::from(1u64)),
                    ActionSpec::new("show_worked_example", "learner"),
                ],
            ))
            .with_bundle(bundle(
                Level::Aggressive,
                "pause",
                vec![
                    ActionSpec::new("suggest_break", "learner"),
                    ActionSpec::new("notify", "instructor"),
                ],
            ));
        Self {
            name: "learning".to_string(),
            sub_scores: vec![SubScore::Regression],
            config,
            actions,
        }
    }

    /// Physiological monitoring with a safe `[low, high]` range for the signal.
    pub fn physiological(low: f64, high: f64) -> Self {
        let config = EngineConfig {
            weights: weights(&[
                ("volatility", 0.40),
                ("autocorrelation", 0.20),
                ("spectral", 0.15),
                ("range_excursion", 0.25),
            ]),
            cooldown_ms: 25_000,
            crisis_window: 5,
            ..EngineConfig::default()
        };
        let actions = ActionTable::new()
            .with_bundle(bundle(
                Level::Gentle,
                "prompt",
                vec![ActionSpec::new("breathing_prompt", "patient")],
            ))
            .with_bundle(bundle(
                Level::Moderate,
                "check_in",
                vec![
                    ActionSpec::new("notify", "caregiver"),
                    ActionSpec::new("increase_sampling", "sensor").param("factor", Value::from(2u64)),
                ],
            ))
            .with_bundle(bundle(
                Level::Aggressive,
                "escalate",
                vec![
                    ActionSpec::new("page", "clinician"),
                    ActionSpec::new("notify", "caregiver"),
                ],
            ));
        Self {
            name: "physiological".to_string(),
            sub_scores: vec![SubScore::RangeExcursion { low, high }],
            config,
            actions,
        }
    }

    /// Look up a preset by name. Physiological uses a resting heart-rate range.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "generic" => Some(Self::generic()),
            "market" => Some(Self::market()),
            "learning" => Some(Self::learning()),
            "physiological" => Some(Self::physiological(50.0, 100.0)),
            _ => None,
        }
    }
}

fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn bundle(level: Level, kind: &str, actions: Vec<ActionSpec>) -> ActionBundle {
    ActionBundle {
        level,
        kind: kind.to_string(),
        actions,
        duration_ms: default_duration_ms(level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_are_valid() {
        for name in ["generic", "market", "learning", "physiological"] {
            let p = DomainProfile::by_name(name).unwrap();
            assert!(p.config.validate().is_ok(), "{} config invalid", name);
            for level in Level::INTERVENTION_LEVELS {
                assert!(p.actions.get(level).is_some(), "{} missing {}", name, level);
            }
        }
        assert!(DomainProfile::by_name("weather").is_none());
    }

    #[test]
    fn test_drawdown() {
        assert!((SubScore::Drawdown.compute(&[100.0, 120.0, 90.0]) - 0.25).abs() < 1e-12);
        assert_eq!(SubScore::Drawdown.compute(&[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(SubScore::Drawdown.compute(&[]), 0.0);
    }

    #[test]
    fn test_regression() {
        let s = SubScore::Regression.compute(&[0.8, 0.8, 0.4, 0.4]);
        assert!((s - 0.5).abs() < 1e-12);
        // Improvement is not regression
        assert_eq!(SubScore::Regression.compute(&[0.4, 0.4, 0.8, 0.8]), 0.0);
    }

    #[test]
    fn test_range_excursion() {
        let sub = SubScore::RangeExcursion { low: 50.0, high: 100.0 };
        assert_eq!(sub.compute(&[60.0, 70.0, 120.0, 40.0]), 0.5);
    }

    #[test]
    fn test_extractor_adds_fields() {
        let values: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let window = SignalWindow::from_values("price", &values);
        let fs = DomainProfile::market().extractor().extract(&window, &ExtractionParams::default());
        assert!(fs.domain_fields["drawdown"] > 0.15);
    }

    #[test]
    fn test_short_window_has_no_fields() {
        let window = SignalWindow::from_values("price", &[1.0, 2.0]);
        let fs = DomainProfile::market().extractor().extract(&window, &ExtractionParams::default());
        assert!(fs.is_empty());
        assert!(fs.domain_fields.is_empty());
    }
}
