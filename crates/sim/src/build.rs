//! Wire records between the coordinator and worker ranks.
//!
//! The build phase is a typed stream of records dispatched to each chunk by
//! owning rank, terminated by `Stop`. Flags mirror the framed wire protocol:
//! `add_signal = 1`, `add_op = 2`, `add_probe = 3`, `stop = 4`. Operator and
//! probe payloads travel as spec strings; signals carry the full tensor.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use axon_runtime::{Key, Rank, Tensor};

pub const ADD_SIGNAL_FLAG: u8 = 1;
pub const ADD_OP_FLAG: u8 = 2;
pub const ADD_PROBE_FLAG: u8 = 3;
pub const STOP_FLAG: u8 = 4;

/// One build-phase record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BuildRecord {
    AddSignal {
        key: Key,
        label: String,
        tensor: Tensor,
    },
    AddOp {
        spec: String,
    },
    AddProbe {
        spec: String,
    },
    Stop,
}

impl BuildRecord {
    /// Wire flag of this record.
    pub fn flag(&self) -> u8 {
        match self {
            BuildRecord::AddSignal { .. } => ADD_SIGNAL_FLAG,
            BuildRecord::AddOp { .. } => ADD_OP_FLAG,
            BuildRecord::AddProbe { .. } => ADD_PROBE_FLAG,
            BuildRecord::Stop => STOP_FLAG,
        }
    }
}

/// Steady-state control broadcast from the coordinator.
#[derive(Debug, Clone)]
pub enum ControlRecord {
    RunSteps {
        steps: u64,
        log_path: Option<PathBuf>,
    },
    Reset {
        seed: u64,
    },
    Close,
}

/// Replies from worker ranks.
#[derive(Debug)]
pub enum WorkerReply {
    /// Build finalized cleanly.
    Built { rank: Rank },
    /// Probe samples collected during the last run.
    ProbeData {
        rank: Rank,
        probe_key: Key,
        samples: Vec<Tensor>,
    },
    /// The last control record was handled.
    Done { rank: Rank },
    /// A build record or a run failed; the worker has exited.
    Failed { rank: Rank, message: String },
}
