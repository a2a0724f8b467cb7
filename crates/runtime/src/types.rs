//! Core identifier types and engine constants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier assigned by the network builder.
///
/// Keys name base signals, probes and communication slots. They are unique
/// within a run; the engine never interprets their numeric value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Key(pub u64);

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Key {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Process rank within the communicator.
pub type Rank = usize;

/// Message tag disambiguating exchanges between the same peer pair.
///
/// Tags are user-assigned and must be unique per directed peer pair.
pub type Tag = u32;

/// How frequently probe buffers spill to the log sink, in steps.
pub const FLUSH_PROBES_EVERY: u64 = 1000;

/// How frequently the collective barrier fires, in steps.
pub const BARRIER_PERIOD: u64 = 1000;

/// Per-step context handed to operators.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    /// Simulation time at the start of this step, in seconds.
    pub time: f64,
    /// Fixed simulation timestep, in seconds.
    pub dt: f64,
}
