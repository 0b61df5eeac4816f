//! Property-based tests for scoring, classification and dispatch.
//!
//! - Index bounds: the composite index is always within [0, 1]
//! - Monotonicity: raising one weighted component never lowers the index
//! - Cooldown spacing: triggers are never closer than the cooldown
//! - Idempotence: classifying the same index twice gives the same level
//! - Crisis window: exactly one confirmation per full above-threshold run

use proptest::prelude::*;
use std::collections::BTreeMap;

use fracture_engine::classifier::{classify, CrisisState, CrisisTransition, ThresholdClassifier};
use fracture_engine::config::{default_weights, EngineConfig, Normalization, Thresholds};
use fracture_engine::dispatcher::{ActionTable, Admission, InterventionDispatcher};
use fracture_engine::features::FeatureSet;
use fracture_engine::scorer::{composite_index, CompositeScorer, ScoreRecord, Trend};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

const COMPONENTS: [&str; 4] = ["volatility", "autocorrelation", "spectral", "drawdown"];

fn arb_weights() -> impl Strategy<Value = BTreeMap<String, f64>> {
    prop::collection::vec(0.0..=10.0_f64, COMPONENTS.len()).prop_map(|ws| {
        COMPONENTS
            .iter()
            .zip(ws)
            .map(|(name, w)| (name.to_string(), w))
            .collect()
    })
}

fn arb_any_f64() -> impl Strategy<Value = f64> {
    prop_oneof![
        -1e6..=1e6_f64,
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
        Just(0.0),
    ]
}

fn arb_feature_set() -> impl Strategy<Value = FeatureSet> {
    (
        prop::sample::select(vec!["a", "b", "c"]),
        arb_any_f64(),
        0.0..=100.0_f64,
        arb_any_f64(),
        arb_any_f64(),
        arb_any_f64(),
        arb_any_f64(),
    )
        .prop_map(|(source, slope, power, ac, vol, quality, drawdown)| {
            let mut fs = FeatureSet::empty(source).with_field("drawdown", drawdown);
            fs.spectral_slope = slope;
            fs.spectral_power = power;
            fs.autocorrelation = ac;
            fs.volatility = vol;
            fs.quality_score = quality;
            fs.sample_count = 50;
            fs
        })
}

fn arb_thresholds() -> impl Strategy<Value = Thresholds> {
    (0.05..0.3_f64, 0.05..0.3_f64, 0.05..0.3_f64).prop_map(|(a, b, c)| Thresholds {
        gentle: a,
        moderate: a + b,
        aggressive: a + b + c,
        crisis: a + b + c,
    })
}

fn score_at(index: f64, ts: u64) -> ScoreRecord {
    ScoreRecord {
        index,
        timestamp: ts,
        components: BTreeMap::new(),
        trend: Trend::Stable,
        confidence: 1.0,
    }
}

// ────────────────────────────────────────────────────────────────────
// Scoring
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Index and confidence stay in [0, 1] for arbitrary, even non-finite, features.
    #[test]
    fn prop_index_bounded(sets in prop::collection::vec(arb_feature_set(), 0..5), weights in arb_weights()) {
        let mut scorer = CompositeScorer::new(10);
        let rec = scorer.score(&sets, &weights, &Normalization::default(), 0);
        prop_assert!((0.0..=1.0).contains(&rec.index), "index {}", rec.index);
        prop_assert!((0.0..=1.0).contains(&rec.confidence), "confidence {}", rec.confidence);
        for (name, value) in &rec.components {
            prop_assert!((0.0..=1.0).contains(value), "{} = {}", name, value);
        }
    }

    /// Raising a single component's value never lowers the index.
    #[test]
    fn prop_index_monotone(
        values in prop::collection::vec(0.0..=1.0_f64, COMPONENTS.len()),
        weights in arb_weights(),
        which in 0..COMPONENTS.len(),
        bump in 0.0..=1.0_f64,
    ) {
        let flat: Vec<(String, String, f64)> = COMPONENTS
            .iter()
            .zip(&values)
            .map(|(name, v)| ("src".to_string(), name.to_string(), *v))
            .collect();
        let mut raised = flat.clone();
        raised[which].2 = (raised[which].2 + bump).min(1.0);

        let before = composite_index(&flat, &weights);
        let after = composite_index(&raised, &weights);
        prop_assert!(after + 1e-12 >= before, "before {} after {}", before, after);
    }
}

// ────────────────────────────────────────────────────────────────────
// Classification
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Same index, same config: same level, with or without classifier state.
    #[test]
    fn prop_classification_idempotent(index in 0.0..=1.0_f64, thresholds in arb_thresholds()) {
        let cfg = EngineConfig { thresholds, ..EngineConfig::default() };
        let mut classifier = ThresholdClassifier::new();
        let first = classifier.observe(index, 0, &cfg).level;
        let second = classifier.observe(index, 1, &cfg).level;
        prop_assert_eq!(first, second);
        prop_assert_eq!(first, classify(index, &thresholds));
        prop_assert_eq!(classifier.level_for(index, &cfg), first);
    }

    /// Levels never decrease as the index grows.
    #[test]
    fn prop_levels_ordered(a in 0.0..=1.0_f64, b in 0.0..=1.0_f64, thresholds in arb_thresholds()) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(classify(lo, &thresholds) <= classify(hi, &thresholds));
    }

    /// A run of exactly `window` readings confirms once; one short clears.
    #[test]
    fn prop_crisis_window(window in 1u32..8, above in 0.85..=1.0_f64, below in 0.0..0.85_f64) {
        let mut machine = CrisisState::new();
        let mut confirmed = 0;
        for i in 0..window {
            if let CrisisTransition::Confirmed(_) = machine.observe(above, i as u64, 0.85, window, 60_000) {
                confirmed += 1;
            }
        }
        prop_assert_eq!(confirmed, 1);

        let mut machine = CrisisState::new();
        let mut confirmed = 0;
        for i in 0..window - 1 {
            if let CrisisTransition::Confirmed(_) = machine.observe(above, i as u64, 0.85, window, 60_000) {
                confirmed += 1;
            }
        }
        let last = machine.observe(below, window as u64, 0.85, window, 60_000);
        prop_assert_eq!(confirmed, 0);
        if window > 1 {
            let cleared = matches!(last, CrisisTransition::Cleared { .. });
            prop_assert!(cleared);
        }
    }
}

// ────────────────────────────────────────────────────────────────────
// Dispatch
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Triggers for one subject are never closer than the cooldown.
    #[test]
    fn prop_cooldown_spacing(
        cooldown_ms in 0u64..60_000,
        max_concurrent in 1usize..4,
        steps in prop::collection::vec((0u64..15_000, 0.0..=1.0_f64), 1..80),
    ) {
        let cfg = EngineConfig {
            cooldown_ms,
            max_concurrent_interventions: max_concurrent,
            ..EngineConfig::default()
        };
        let table = ActionTable::generic();
        let mut dispatcher = InterventionDispatcher::new(50);
        let mut now = 0u64;
        let mut triggers = Vec::new();

        for (dt, index) in steps {
            now += dt;
            dispatcher.complete_due(now);
            let level = classify(index, &cfg.thresholds);
            if let Admission::Triggered(record) =
                dispatcher.maybe_trigger("s", &score_at(index, now), level, &cfg, &table)
            {
                triggers.push(record.timestamp);
            }
            prop_assert!(dispatcher.active().len() <= max_concurrent);
        }

        for pair in triggers.windows(2) {
            prop_assert!(pair[1] - pair[0] >= cooldown_ms, "triggers {:?}", pair);
        }
    }

    /// Default weights keep the index bounded for any standard component values.
    #[test]
    fn prop_default_weights_bounded(values in prop::collection::vec(arb_any_f64(), 3)) {
        let flat: Vec<(String, String, f64)> = ["volatility", "autocorrelation", "spectral"]
            .iter()
            .zip(values)
            .map(|(n, v)| ("x".to_string(), n.to_string(), v))
            .collect();
        let index = composite_index(&flat, &default_weights());
        prop_assert!((0.0..=1.0).contains(&index));
    }
}
