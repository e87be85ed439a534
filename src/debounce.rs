/// Detection debouncing module
///
/// A spoken word spans several consecutive analysis windows, so a naive
/// count of above-threshold scores over-counts proportionally to utterance
/// length over stride. This state machine converts the continuous stream of
/// per-window probabilities into discrete detection events: at most one event
/// per contiguous above-threshold run, with a refractory period that absorbs
/// brief probability dips inside a single utterance.

use crate::engine::DetectionScore;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum DebounceError {
    #[error("threshold must be between 0.0 and 1.0, got {0}")]
    InvalidThreshold(f32),

    #[error("refractory period must be > 0")]
    ZeroRefractory,
}

/// A confirmed single utterance of the target word
#[derive(Debug, Clone, Copy)]
pub struct DetectionEvent {
    /// Stream time of the rising edge (the window that triggered detection)
    pub at: Duration,
}

/// Debouncer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// No utterance in progress; the next high score is a new detection
    Idle,

    /// Inside an above-threshold run; further high scores are the same word
    Active,

    /// The run ended; low scores and brief dips are absorbed until the
    /// refractory period has elapsed
    Cooldown {
        /// Stream time at which the refractory timer started
        since: Duration,
    },
}

/// Converts per-window scores into at-most-one event per utterance
pub struct DetectionDebouncer {
    threshold: f32,
    refractory_period: Duration,
    state: DebounceState,
}

impl DetectionDebouncer {
    pub fn new(threshold: f32, refractory_period: Duration) -> Result<Self, DebounceError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(DebounceError::InvalidThreshold(threshold));
        }
        if refractory_period.is_zero() {
            return Err(DebounceError::ZeroRefractory);
        }

        Ok(Self {
            threshold,
            refractory_period,
            state: DebounceState::Idle,
        })
    }

    /// Feed one score, in window order. Returns an event on the rising edge
    /// of a new utterance and `None` otherwise.
    pub fn update(&mut self, score: DetectionScore) -> Option<DetectionEvent> {
        let above = score.probability >= self.threshold;

        trace!(
            "score {:.3} at {:?}, state {:?}",
            score.probability,
            score.at,
            self.state
        );

        match self.state {
            DebounceState::Idle => {
                if above {
                    self.state = DebounceState::Active;
                    debug!("state: Idle -> Active (detection at {:?})", score.at);
                    return Some(DetectionEvent { at: score.at });
                }
                None
            }

            DebounceState::Active => {
                if !above {
                    self.state = DebounceState::Cooldown { since: score.at };
                    debug!("state: Active -> Cooldown");
                }
                None
            }

            DebounceState::Cooldown { since } => {
                if score.at.saturating_sub(since) < self.refractory_period {
                    // Still refractory: absorb dips and echoes of the same
                    // utterance regardless of score.
                    return None;
                }

                debug!("state: Cooldown -> Idle (refractory elapsed)");
                if above {
                    self.state = DebounceState::Active;
                    debug!("state: Idle -> Active (detection at {:?})", score.at);
                    return Some(DetectionEvent { at: score.at });
                }
                self.state = DebounceState::Idle;
                None
            }
        }
    }

    /// Current state
    pub fn state(&self) -> DebounceState {
        self.state
    }

    /// Return to the initial state
    pub fn reset(&mut self) {
        self.state = DebounceState::Idle;
        debug!("debouncer reset");
    }
}
