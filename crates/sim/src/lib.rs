//! Axon distributed simulator
//!
//! Coordinates N chunks: build-record dispatch by owning rank, collective
//! step-count broadcast, probe-data gather and orderly shutdown.

pub mod build;
pub mod simulator;
mod worker;

pub use build::{
    BuildRecord, ControlRecord, WorkerReply, ADD_OP_FLAG, ADD_PROBE_FLAG, ADD_SIGNAL_FLAG,
    STOP_FLAG,
};
pub use simulator::{SimConfig, SimError, SimResult, Simulator};
