//! Async behaviour: detached action execution and tick scheduling.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fracture_engine::buffer::SignalWindow;
use fracture_engine::classifier::ClearReason;
use fracture_engine::clock::{EngineClock, ManualClock};
use fracture_engine::config::EngineConfig;
use fracture_engine::dispatcher::{ActionExecutor, ActionTable, InterventionRecord};
use fracture_engine::events::EngineEvent;
use fracture_engine::features::{ExtractionParams, FeatureSet};
use fracture_engine::FractureEngine;

fn direct_extractor(window: &SignalWindow, _params: &ExtractionParams) -> FeatureSet {
    let last = window.samples.last().map(|s| s.value).unwrap_or(0.0);
    let mut fs = FeatureSet::empty(&window.source_id).with_field("direct", last);
    fs.quality_score = 1.0;
    fs.sample_count = window.len();
    fs
}

fn engine_with(cfg: EngineConfig) -> (Arc<FractureEngine>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Arc::new(FractureEngine::new(clock.clone()));
    engine.register_extractor("direct", direct_extractor);
    let cfg = EngineConfig {
        weights: BTreeMap::from([("direct".to_string(), 1.0)]),
        ..cfg
    };
    engine
        .register_subject("s", "test", cfg, ActionTable::generic())
        .unwrap();
    (engine, clock)
}

struct FailingExecutor;

#[async_trait]
impl ActionExecutor for FailingExecutor {
    async fn execute(&self, _subject_id: &str, intervention: &InterventionRecord) -> anyhow::Result<()> {
        anyhow::bail!("actuator offline for {}", intervention.kind)
    }
}

struct CountingExecutor(Arc<AtomicUsize>);

#[async_trait]
impl ActionExecutor for CountingExecutor {
    async fn execute(&self, _subject_id: &str, intervention: &InterventionRecord) -> anyhow::Result<()> {
        self.0.fetch_add(intervention.actions.len(), Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn executor_failure_is_reported_not_fatal() {
    let (engine, clock) = engine_with(EngineConfig::default());
    engine.set_executor(Arc::new(FailingExecutor));
    let mut events = engine.subscribe();

    engine.ingest("s", "direct", 0.7, clock.advance(1_000)).unwrap();
    engine.tick("s").unwrap();

    let mut error = None;
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .ok()
        .flatten()
    {
        if let EngineEvent::InterventionError { error: msg, .. } = event {
            error = Some(msg);
            break;
        }
    }
    let error = error.expect("intervention error event");
    assert!(error.contains("actuator offline for mitigate"));

    // Bookkeeping is untouched: the record still completes on schedule
    clock.advance(20_000);
    let done = engine.complete_due("s").unwrap();
    assert_eq!(done.len(), 1);
}

#[tokio::test]
async fn executor_runs_detached() {
    let (engine, clock) = engine_with(EngineConfig::default());
    let seen = Arc::new(AtomicUsize::new(0));
    engine.set_executor(Arc::new(CountingExecutor(seen.clone())));

    engine.ingest("s", "direct", 0.9, clock.advance(1_000)).unwrap();
    engine.tick("s").unwrap();

    for _ in 0..100 {
        if seen.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    // Generic aggressive bundle has two actions
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn executor_without_runtime_reports_error() {
    let (engine, clock) = engine_with(EngineConfig::default());
    engine.set_executor(Arc::new(FailingExecutor));
    let mut events = engine.subscribe();

    engine.ingest("s", "direct", 0.7, clock.advance(1_000)).unwrap();
    engine.tick("s").unwrap();

    let errors = events
        .drain()
        .into_iter()
        .filter(|e| e.name() == "intervention_error")
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test(start_paused = true)]
async fn monitoring_ticks_until_stopped() {
    let (engine, clock) = engine_with(EngineConfig::default());
    engine.ingest("s", "direct", 0.1, clock.now_ms()).unwrap();

    engine.start_monitoring("s", Duration::from_millis(100)).unwrap();
    assert!(engine.is_monitoring("s"));
    tokio::time::sleep(Duration::from_millis(350)).await;

    let ticks = engine.snapshot("s").unwrap().ticks;
    assert!(ticks >= 3, "ticks {}", ticks);

    assert!(engine.stop_monitoring("s").unwrap());
    assert!(!engine.is_monitoring("s"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.snapshot("s").unwrap().ticks, ticks);

    // Second stop is a no-op
    assert!(!engine.stop_monitoring("s").unwrap());
}

#[tokio::test(start_paused = true)]
async fn stop_clears_pending_crisis_and_keeps_history() {
    let (engine, clock) = engine_with(EngineConfig {
        crisis_window: 5,
        ..EngineConfig::default()
    });
    let mut events = engine.subscribe();
    engine.ingest("s", "direct", 0.9, clock.now_ms()).unwrap();

    engine.start_monitoring("s", Duration::from_millis(100)).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    engine.stop_monitoring("s").unwrap();

    let events = events.drain();
    let cancelled = events.iter().any(|e| {
        matches!(
            e,
            EngineEvent::CrisisCleared {
                reason: ClearReason::Cancelled,
                ..
            }
        )
    });
    assert!(cancelled);

    let snap = engine.snapshot("s").unwrap();
    assert!(snap.crisis.pending.is_none());
    assert!(snap.last_score.is_some());
    assert!(!engine.score_history("s").unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_keeps_confirmed_episode_latched() {
    let (engine, clock) = engine_with(EngineConfig {
        crisis_window: 3,
        ..EngineConfig::default()
    });
    let mut events = engine.subscribe();
    let drive = |index: f64| {
        engine.ingest("s", "direct", index, clock.advance(1_000)).unwrap();
        engine.tick("s").unwrap();
    };

    for _ in 0..3 {
        drive(0.95);
    }
    engine.start_monitoring("s", Duration::from_secs(3_600)).unwrap();
    assert!(engine.stop_monitoring("s").unwrap());
    for _ in 0..3 {
        drive(0.95);
    }

    let events = events.drain();
    let named = |name: &str| events.iter().filter(|e| e.name() == name).count();
    assert_eq!(named("crisis_confirmed"), 1);
    assert_eq!(named("crisis_cleared"), 0);
    assert_eq!(engine.snapshot("s").unwrap().crisis.confirmed_episodes, 1);
}

#[tokio::test(start_paused = true)]
async fn removing_subject_ends_its_schedule() {
    let (engine, _) = engine_with(EngineConfig::default());
    engine.start_monitoring("s", Duration::from_millis(100)).unwrap();
    engine.remove_subject("s").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!engine.is_monitoring("s"));
    assert!(engine.subjects().is_empty());
}
