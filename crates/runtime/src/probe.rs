//! Probes: periodic samplers attached to signal views.
//!
//! On step `t` a probe with period `p` appends a fresh copy of its target
//! view whenever `t % p == 0`, so `n` steps collect exactly `ceil(n / p)`
//! samples. The buffer is a ring of blocks: every flush hands the collected
//! samples to the log sink and starts a fresh block.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, BuildResult};
use crate::signal::{ResolvedView, SignalSpec, SignalStore};
use crate::tensor::Tensor;
use crate::types::Key;

/// Build-time description of a probe. Wire form: `probe_key;signal_spec;period`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub probe_key: Key,
    pub target: SignalSpec,
    pub period: u64,
}

impl std::fmt::Display for ProbeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{};{};{}", self.probe_key, self.target, self.period)
    }
}

impl FromStr for ProbeSpec {
    type Err = BuildError;

    fn from_str(s: &str) -> BuildResult<Self> {
        let bad = || BuildError::BadSpec(format!("probe spec '{s}'"));
        let mut fields = s.split(';');
        let probe_key: u64 = fields.next().ok_or_else(bad)?.trim().parse().map_err(|_| bad())?;
        let target: SignalSpec = fields.next().ok_or_else(bad)?.parse()?;
        let period: u64 = fields.next().ok_or_else(bad)?.trim().parse().map_err(|_| bad())?;
        if period == 0 || fields.next().is_some() {
            return Err(bad());
        }
        Ok(ProbeSpec {
            probe_key: Key(probe_key),
            target,
            period,
        })
    }
}

/// A sampler bound to a resolved view.
#[derive(Debug)]
pub struct Probe {
    key: Key,
    label: String,
    target: ResolvedView,
    period: u64,
    buffer: Vec<Tensor>,
}

impl Probe {
    pub(crate) fn new(key: Key, label: String, target: ResolvedView, period: u64) -> Self {
        assert!(period >= 1, "probe period must be at least 1");
        Self {
            key,
            label,
            target,
            period,
            buffer: Vec::new(),
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Shape of each collected sample.
    pub fn sample_shape(&self) -> (usize, usize) {
        self.target.shape()
    }

    /// Number of samples currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Snapshot the target view if this step is on-period.
    pub(crate) fn sample(&mut self, step: u64, store: &SignalStore) {
        if step % self.period == 0 {
            self.buffer.push(store.snapshot(&self.target));
        }
    }

    /// Move the buffered samples out, leaving a fresh block.
    pub(crate) fn take_block(&mut self) -> Vec<Tensor> {
        std::mem::take(&mut self.buffer)
    }

    /// Drop everything; a hard clear also releases capacity.
    pub(crate) fn clear(&mut self, hard: bool) {
        self.buffer.clear();
        if hard {
            self.buffer.shrink_to_fit();
        }
    }
}
