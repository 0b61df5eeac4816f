//! Threshold classification and crisis confirmation.
//!
//! The index is mapped onto discrete intervention levels using live
//! thresholds, re-read on every call. A separate sub-machine requires a run
//! of consecutive above-crisis readings before declaring a crisis, so single
//! samples of noise never confirm one.
//!
//! ```text
//!            index >= crisis                 confirmations == window
//!   Idle ─────────────────────► Pending ───────────────────────────► Confirmed
//!    ▲                           │  │                                    │
//!    │  index < crisis (cleared) │  │ timeout (cleared)                  │
//!    └───────────────────────────┴──┘◄───── latched until index < crisis ┘
//! ```

use serde::{Deserialize, Serialize};

use crate::buffer::Timestamp;
use crate::config::{EngineConfig, Thresholds};

/// Discrete intervention tier, ascending severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Normal,
    Gentle,
    Moderate,
    Aggressive,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Normal => "normal",
            Level::Gentle => "gentle",
            Level::Moderate => "moderate",
            Level::Aggressive => "aggressive",
        }
    }

    /// Levels that call for an intervention
    pub fn is_intervention(&self) -> bool {
        !matches!(self, Level::Normal)
    }

    pub const INTERVENTION_LEVELS: [Level; 3] = [Level::Gentle, Level::Moderate, Level::Aggressive];
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an index onto a level. Pure: same inputs, same level.
pub fn classify(index: f64, thresholds: &Thresholds) -> Level {
    if index >= thresholds.aggressive {
        Level::Aggressive
    } else if index >= thresholds.moderate {
        Level::Moderate
    } else if index >= thresholds.gentle {
        Level::Gentle
    } else {
        Level::Normal
    }
}

// =============================================================================
// Crisis confirmation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisPhase {
    Idle,
    Pending,
    /// Episode confirmed; stays here until the index drops below threshold
    Confirmed,
}

/// An above-threshold run that has not yet been confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PendingCrisis {
    pub start_time: Timestamp,
    pub initial_index: f64,
    pub last_index: f64,
    pub confirmations: u32,
    /// Latest index exceeds the initial one
    pub escalating: bool,
}

impl PendingCrisis {
    fn open(index: f64, now: Timestamp) -> Self {
        Self {
            start_time: now,
            initial_index: index,
            last_index: index,
            confirmations: 1,
            escalating: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearReason {
    BelowThreshold,
    Timeout,
    Cancelled,
}

impl ClearReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClearReason::BelowThreshold => "below_threshold",
            ClearReason::Timeout => "timeout",
            ClearReason::Cancelled => "cancelled",
        }
    }
}

/// What a single observation did to the crisis machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CrisisTransition {
    None,
    Suspected(PendingCrisis),
    Progressed(PendingCrisis),
    Confirmed(PendingCrisis),
    /// `restarted` is the fresh episode opened by the same reading when a
    /// timed-out crisis is still above threshold.
    Cleared {
        pending: PendingCrisis,
        reason: ClearReason,
        restarted: Option<PendingCrisis>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrisisState {
    pub pending: Option<PendingCrisis>,
    latched: bool,
    /// Confirmed episodes over the subject's lifetime
    pub confirmed_episodes: u64,
    pub last_confirmed_at: Option<Timestamp>,
}

impl CrisisState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> CrisisPhase {
        if self.pending.is_some() {
            CrisisPhase::Pending
        } else if self.latched {
            CrisisPhase::Confirmed
        } else {
            CrisisPhase::Idle
        }
    }

    /// Advance the machine by one reading.
    pub fn observe(
        &mut self,
        index: f64,
        now: Timestamp,
        threshold: f64,
        window: u32,
        timeout_ms: u64,
    ) -> CrisisTransition {
        if index < threshold {
            self.latched = false;
            return match self.pending.take() {
                Some(pending) => CrisisTransition::Cleared {
                    pending,
                    reason: ClearReason::BelowThreshold,
                    restarted: None,
                },
                None => CrisisTransition::None,
            };
        }

        if self.latched {
            return CrisisTransition::None;
        }

        let window = window.max(1);
        let mut pending = match self.pending.take() {
            Some(p) => {
                if now.saturating_sub(p.start_time) > timeout_ms {
                    let fresh = PendingCrisis::open(index, now);
                    self.pending = Some(fresh);
                    return CrisisTransition::Cleared {
                        pending: p,
                        reason: ClearReason::Timeout,
                        restarted: Some(fresh),
                    };
                }
                PendingCrisis {
                    last_index: index,
                    confirmations: p.confirmations + 1,
                    escalating: index > p.initial_index,
                    ..p
                }
            }
            None => PendingCrisis::open(index, now),
        };

        if pending.confirmations >= window {
            pending.confirmations = window;
            self.latched = true;
            self.confirmed_episodes += 1;
            self.last_confirmed_at = Some(now);
            return CrisisTransition::Confirmed(pending);
        }

        self.pending = Some(pending);
        if pending.confirmations == 1 {
            CrisisTransition::Suspected(pending)
        } else {
            CrisisTransition::Progressed(pending)
        }
    }

    /// Drop any unconfirmed episode. A confirmed episode stays latched until
    /// the index falls below threshold, and history counters are kept.
    pub fn cancel(&mut self) -> Option<PendingCrisis> {
        self.pending.take()
    }
}

// =============================================================================
// Classifier
// =============================================================================

/// Result of classifying one score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub level: Level,
    pub previous: Level,
    pub crisis: CrisisTransition,
}

impl Classification {
    pub fn level_changed(&self) -> bool {
        self.level != self.previous
    }
}

/// Level mapping plus the crisis sub-machine for one subject.
#[derive(Debug, Clone, Default)]
pub struct ThresholdClassifier {
    crisis: CrisisState,
    last_level: Option<Level>,
}

impl ThresholdClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level for an index under the given config, without touching state.
    pub fn level_for(&self, index: f64, cfg: &EngineConfig) -> Level {
        classify(index, &cfg.thresholds)
    }

    /// Classify a reading and advance the crisis machine.
    pub fn observe(&mut self, index: f64, now: Timestamp, cfg: &EngineConfig) -> Classification {
        let level = classify(index, &cfg.thresholds);
        let previous = self.last_level.unwrap_or(Level::Normal);
        self.last_level = Some(level);
        let crisis = self.crisis.observe(
            index,
            now,
            cfg.thresholds.crisis,
            cfg.crisis_window,
            cfg.crisis_timeout_ms,
        );
        Classification {
            level,
            previous,
            crisis,
        }
    }

    pub fn last_level(&self) -> Level {
        self.last_level.unwrap_or(Level::Normal)
    }

    pub fn crisis(&self) -> &CrisisState {
        &self.crisis
    }

    pub fn cancel_crisis(&mut self) -> Option<PendingCrisis> {
        self.crisis.cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(machine: &mut CrisisState, series: &[f64]) -> Vec<CrisisTransition> {
        series
            .iter()
            .enumerate()
            .map(|(i, &x)| machine.observe(x, i as u64 * 1000, 0.85, 3, 60_000))
            .collect()
    }

    fn confirmed(ts: &[CrisisTransition]) -> usize {
        ts.iter()
            .filter(|t| matches!(t, CrisisTransition::Confirmed(_)))
            .count()
    }

    #[test]
    fn test_level_bands() {
        let t = Thresholds::default();
        assert_eq!(classify(0.0, &t), Level::Normal);
        assert_eq!(classify(0.29, &t), Level::Normal);
        assert_eq!(classify(0.3, &t), Level::Gentle);
        assert_eq!(classify(0.6, &t), Level::Moderate);
        assert_eq!(classify(0.79, &t), Level::Moderate);
        assert_eq!(classify(0.8, &t), Level::Aggressive);
        assert_eq!(classify(1.0, &t), Level::Aggressive);
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Normal < Level::Gentle);
        assert!(Level::Gentle < Level::Moderate);
        assert!(Level::Moderate < Level::Aggressive);
    }

    #[test]
    fn test_crisis_confirms_after_window() {
        let mut m = CrisisState::new();
        let ts = run(&mut m, &[0.9, 0.9, 0.9]);
        assert!(matches!(ts[0], CrisisTransition::Suspected(_)));
        assert!(matches!(ts[1], CrisisTransition::Progressed(p) if p.confirmations == 2));
        assert!(matches!(ts[2], CrisisTransition::Confirmed(p) if p.confirmations == 3));
        assert_eq!(m.confirmed_episodes, 1);
        assert_eq!(m.phase(), CrisisPhase::Confirmed);
    }

    #[test]
    fn test_crisis_clears_before_window() {
        let mut m = CrisisState::new();
        let ts = run(&mut m, &[0.9, 0.9, 0.5]);
        assert_eq!(confirmed(&ts), 0);
        assert!(matches!(
            ts[2],
            CrisisTransition::Cleared { reason: ClearReason::BelowThreshold, .. }
        ));
        assert_eq!(m.phase(), CrisisPhase::Idle);
    }

    #[test]
    fn test_sustained_episode_confirms_once() {
        let mut m = CrisisState::new();
        let ts = run(&mut m, &[0.9; 10]);
        assert_eq!(confirmed(&ts), 1);

        // Dropping below re-arms the machine
        let ts = run(&mut m, &[0.1, 0.95, 0.95, 0.95]);
        assert_eq!(confirmed(&ts), 1);
        assert_eq!(m.confirmed_episodes, 2);
    }

    #[test]
    fn test_escalating_flag() {
        let mut m = CrisisState::new();
        m.observe(0.86, 0, 0.85, 5, 60_000);
        let t = m.observe(0.95, 1000, 0.85, 5, 60_000);
        assert!(matches!(t, CrisisTransition::Progressed(p) if p.escalating));
        let t = m.observe(0.86, 2000, 0.85, 5, 60_000);
        assert!(matches!(t, CrisisTransition::Progressed(p) if !p.escalating));
    }

    #[test]
    fn test_pending_times_out() {
        let mut m = CrisisState::new();
        m.observe(0.9, 0, 0.85, 3, 10_000);
        let t = m.observe(0.9, 20_000, 0.85, 3, 10_000);
        assert!(matches!(
            t,
            CrisisTransition::Cleared { reason: ClearReason::Timeout, .. }
        ));
        // The timing-out reading opens the next episode
        let fresh = m.pending.expect("pending after timeout");
        assert_eq!(fresh.start_time, 20_000);
        assert_eq!(fresh.confirmations, 1);
        assert!(matches!(t, CrisisTransition::Cleared { restarted: Some(p), .. } if p == fresh));
        assert!(matches!(
            m.observe(0.9, 21_000, 0.85, 3, 10_000),
            CrisisTransition::Progressed(p) if p.confirmations == 2
        ));
    }

    #[test]
    fn test_sustained_crisis_confirms_across_timeouts() {
        let mut m = CrisisState::new();
        let transitions: Vec<_> = [0.9, 0.95, 0.95, 0.95]
            .iter()
            .zip([0u64, 20_000, 21_000, 22_000])
            .map(|(&x, ts)| m.observe(x, ts, 0.85, 3, 10_000))
            .collect();
        assert_eq!(confirmed(&transitions), 1);
        assert_eq!(m.phase(), CrisisPhase::Confirmed);
    }

    #[test]
    fn test_cancel_keeps_confirmed_latch() {
        let mut m = CrisisState::new();
        run(&mut m, &[0.9, 0.9, 0.9]);
        assert!(m.cancel().is_none());
        assert_eq!(confirmed(&run(&mut m, &[0.9, 0.9, 0.9])), 0);
        assert_eq!(m.confirmed_episodes, 1);

        // Pending episodes are dropped
        let mut m = CrisisState::new();
        run(&mut m, &[0.9, 0.9]);
        assert_eq!(m.cancel().map(|p| p.confirmations), Some(2));
        assert_eq!(m.phase(), CrisisPhase::Idle);
    }

    #[test]
    fn test_window_of_one_confirms_immediately() {
        let mut m = CrisisState::new();
        assert!(matches!(
            m.observe(0.9, 0, 0.85, 1, 60_000),
            CrisisTransition::Confirmed(_)
        ));
    }

    #[test]
    fn test_classifier_reads_live_thresholds() {
        let mut c = ThresholdClassifier::new();
        let mut cfg = EngineConfig::default();
        assert_eq!(c.observe(0.5, 0, &cfg).level, Level::Gentle);

        cfg.thresholds.moderate = 0.45;
        let out = c.observe(0.5, 1, &cfg);
        assert_eq!(out.level, Level::Moderate);
        assert_eq!(out.previous, Level::Gentle);
        assert!(out.level_changed());
    }

    #[test]
    fn test_cancel_clears_pending() {
        let mut c = ThresholdClassifier::new();
        let cfg = EngineConfig::default();
        c.observe(0.9, 0, &cfg);
        assert!(c.crisis().pending.is_some());
        assert!(c.cancel_crisis().is_some());
        assert_eq!(c.crisis().phase(), CrisisPhase::Idle);
    }
}
