//! Domain-agnostic instability ("fracture") monitoring engine.
//!
//! Signal streams go in, a bounded [0, 1] instability index comes out each
//! tick, and tiered interventions are dispatched under cooldown control.
//! Intervention outcomes feed an effectiveness learner that proposes threshold
//! adjustments. Market, learning and physiological monitoring are profiles of
//! the same engine (see [`domains`]).

pub mod buffer;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod domains;
pub mod engine;
pub mod error;
pub mod events;
pub mod features;
pub mod learner;
pub mod logging;
pub mod scorer;
pub mod synthetic;

pub use engine::{FractureEngine, OutcomeReport, SubjectSnapshot, ANY_SOURCE};
pub use error::{EngineError, Result};
