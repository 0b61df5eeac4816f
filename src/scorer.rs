//! Composite instability index.
//!
//! Feature sets from every source are normalized into [0, 1] components,
//! combined by explicit domain-supplied weights, and clamped to [0, 1].
//! Trend compares the three most recent records; confidence is the mean
//! quality of the contributing feature sets.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::buffer::Timestamp;
use crate::config::Normalization;
use crate::features::FeatureSet;

/// Trend threshold on the index delta across the last three records.
pub const TREND_DELTA: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Increasing => "increasing",
            Trend::Decreasing => "decreasing",
            Trend::Stable => "stable",
        }
    }
}

/// One scoring cycle's output. Read-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    /// Instability index in [0, 1]
    pub index: f64,
    pub timestamp: Timestamp,
    /// Normalized components keyed `source.component`
    pub components: BTreeMap<String, f64>,
    pub trend: Trend,
    /// Mean feature quality in [0, 1]
    pub confidence: f64,
}

fn unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Map one feature set onto named [0, 1] components.
pub fn normalize(features: &FeatureSet, norm: &Normalization) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    let spectral = if features.spectral_power > 0.0 {
        // slope 0 (flat) → 1.0, slope -reference (red) → 0.0
        unit(1.0 + features.spectral_slope / norm.slope_reference)
    } else {
        0.0
    };
    out.insert("spectral".to_string(), spectral);
    out.insert("autocorrelation".to_string(), unit(features.autocorrelation));
    out.insert(
        "volatility".to_string(),
        unit(features.volatility / norm.volatility_saturation),
    );
    for (name, value) in &features.domain_fields {
        out.insert(name.clone(), unit(*value));
    }
    out
}

fn weight_for(weights: &BTreeMap<String, f64>, source: &str, component: &str) -> Option<f64> {
    weights
        .get(&format!("{}.{}", source, component))
        .or_else(|| weights.get(component))
        .copied()
        .filter(|w| w.is_finite() && *w >= 0.0)
}

/// Weighted mean of components that carry a weight, clamped to [0, 1].
///
/// `components` is a list of `(source, component, value)`.
pub fn composite_index(components: &[(String, String, f64)], weights: &BTreeMap<String, f64>) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for (source, name, value) in components {
        if let Some(w) = weight_for(weights, source, name) {
            num += w * unit(*value);
            den += w;
        }
    }
    if den > 0.0 {
        unit(num / den)
    } else {
        0.0
    }
}

/// Trend over the last three indices (oldest first).
pub fn trend_of(recent: &[f64]) -> Trend {
    if recent.len() < 3 {
        return Trend::Stable;
    }
    let last3 = &recent[recent.len() - 3..];
    let delta = last3[2] - last3[0];
    if delta > TREND_DELTA {
        Trend::Increasing
    } else if delta < -TREND_DELTA {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

/// Produces score records and keeps a bounded history.
#[derive(Debug, Clone)]
pub struct CompositeScorer {
    history: VecDeque<ScoreRecord>,
    capacity: usize,
}

impl CompositeScorer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(3);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(3);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    pub fn score(
        &mut self,
        feature_sets: &[FeatureSet],
        weights: &BTreeMap<String, f64>,
        norm: &Normalization,
        timestamp: Timestamp,
    ) -> ScoreRecord {
        let mut flat = Vec::new();
        let mut components = BTreeMap::new();
        for fs in feature_sets {
            for (name, value) in normalize(fs, norm) {
                components.insert(format!("{}.{}", fs.source_id, name), value);
                flat.push((fs.source_id.clone(), name, value));
            }
        }

        let index = composite_index(&flat, weights);
        let confidence = if feature_sets.is_empty() {
            0.0
        } else {
            unit(feature_sets.iter().map(|f| f.quality_score).sum::<f64>() / feature_sets.len() as f64)
        };

        let mut recent: Vec<f64> = self.history.iter().rev().take(2).map(|r| r.index).collect();
        recent.reverse();
        recent.push(index);

        let record = ScoreRecord {
            index,
            timestamp,
            components,
            trend: trend_of(&recent),
            confidence,
        };

        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        record
    }

    pub fn last(&self) -> Option<&ScoreRecord> {
        self.history.back()
    }

    pub fn history(&self) -> impl Iterator<Item = &ScoreRecord> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
