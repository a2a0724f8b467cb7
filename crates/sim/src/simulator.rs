//! Distributed simulator: coordinates N chunks.
//!
//! Rank 0's chunk lives on the caller's thread; every other rank runs on a
//! worker thread. The coordinator dispatches build records by owning rank,
//! validates the global send/receive mirror at finalize, broadcasts step
//! counts, and gathers probe data back after every run.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::JoinHandle;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use axon_runtime::chunk::{Chunk, ChunkConfig};
use axon_runtime::comm::{CommEndpoint, Fabric};
use axon_runtime::error::{BuildError, StepError};
use axon_runtime::operators::{CallbackFn, OpSpec};
use axon_runtime::probe::ProbeSpec;
use axon_runtime::signal::SignalSpec;
use axon_runtime::sink::FileSink;
use axon_runtime::tensor::Tensor;
use axon_runtime::types::{Key, Rank, Tag, FLUSH_PROBES_EVERY};

use crate::build::{BuildRecord, ControlRecord, WorkerReply};
use crate::worker::{run_worker, WorkerContext};

/// Errors from the distributed simulator.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("worker rank {rank} failed: {message}")]
    Worker { rank: Rank, message: String },

    #[error("rank {0} out of range")]
    BadRank(Rank),

    #[error("simulator is closed")]
    Closed,
}

pub type SimResult<T> = std::result::Result<T, SimError>;

/// Simulator-wide configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub dt: f64,
    /// Merge per-peer exchanges into one message per step.
    pub merged: bool,
    /// Steps between probe-ring spills to the log sink.
    pub flush_probes_every: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dt: 0.001,
            merged: false,
            flush_probes_every: FLUSH_PROBES_EVERY,
        }
    }
}

/// A declared point-to-point slot, tracked globally for mirror validation.
#[derive(Debug, Clone, Copy)]
struct CommDecl {
    owner: Rank,
    peer: Rank,
    tag: Tag,
    len: usize,
}

/// Coordinates N chunks through build, run, reset and shutdown.
pub struct Simulator {
    n_ranks: usize,
    master: Chunk,
    master_endpoint: Option<CommEndpoint>,
    build_txs: Vec<Sender<BuildRecord>>,
    ctrl_txs: Vec<Sender<ControlRecord>>,
    reply_rx: Receiver<WorkerReply>,
    handles: Vec<JoinHandle<()>>,
    /// Owning rank per probe key, in registration order; also the routing
    /// table for gathered data.
    probe_owner: IndexMap<Key, Rank>,
    probe_data: IndexMap<Key, Vec<Tensor>>,
    /// Base-signal shapes per (rank, key), for comm-length validation.
    signal_shapes: IndexMap<(Rank, Key), (usize, usize)>,
    declared_sends: Vec<CommDecl>,
    declared_recvs: Vec<CommDecl>,
    finalized: bool,
    closed: bool,
}

impl Simulator {
    pub fn new(n_ranks: usize, dt: f64) -> Self {
        Self::with_config(
            n_ranks,
            SimConfig {
                dt,
                ..SimConfig::default()
            },
        )
    }

    /// Spawn the fabric and one worker thread per non-zero rank.
    pub fn with_config(n_ranks: usize, config: SimConfig) -> Self {
        assert!(n_ranks > 0, "need at least one rank");
        info!(n_ranks, dt = config.dt, merged = config.merged, "simulator starting");

        let mut endpoints = Fabric::connect(n_ranks);
        let worker_endpoints = endpoints.split_off(1);
        let master_endpoint = endpoints.pop();

        let chunk_config = |rank: Rank| ChunkConfig {
            rank,
            n_ranks,
            dt: config.dt,
            merged: config.merged,
            flush_probes_every: config.flush_probes_every,
        };

        let (reply_tx, reply_rx) = channel();
        let mut build_txs = Vec::with_capacity(n_ranks.saturating_sub(1));
        let mut ctrl_txs = Vec::with_capacity(n_ranks.saturating_sub(1));
        let mut handles = Vec::with_capacity(n_ranks.saturating_sub(1));

        for (offset, endpoint) in worker_endpoints.into_iter().enumerate() {
            let rank = offset + 1;
            let (build_tx, build_rx) = channel();
            let (ctrl_tx, ctrl_rx) = channel();
            let ctx = WorkerContext {
                rank,
                config: chunk_config(rank),
                endpoint,
                build_rx,
                ctrl_rx,
                reply_tx: reply_tx.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("axon-worker-{rank}"))
                .spawn(move || run_worker(ctx))
                .expect("failed to spawn worker thread");
            build_txs.push(build_tx);
            ctrl_txs.push(ctrl_tx);
            handles.push(handle);
        }

        Self {
            n_ranks,
            master: Chunk::new(chunk_config(0)),
            master_endpoint,
            build_txs,
            ctrl_txs,
            reply_rx,
            handles,
            probe_owner: IndexMap::new(),
            probe_data: IndexMap::new(),
            signal_shapes: IndexMap::new(),
            declared_sends: Vec::new(),
            declared_recvs: Vec::new(),
            finalized: false,
            closed: false,
        }
    }

    pub fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    fn check_rank(&self, rank: Rank) -> SimResult<()> {
        if rank < self.n_ranks {
            Ok(())
        } else {
            Err(SimError::BadRank(rank))
        }
    }

    fn dispatch(&self, rank: Rank, record: BuildRecord) {
        // A dead worker surfaces as a Failed reply at finalize; the lost
        // send itself is not an error.
        let _ = self.build_txs[rank - 1].send(record);
    }

    // *** Build surface ***

    /// Add a base signal to the chunk owned by `rank`.
    pub fn add_signal(
        &mut self,
        rank: Rank,
        key: Key,
        label: &str,
        tensor: Tensor,
    ) -> SimResult<()> {
        self.check_rank(rank)?;
        self.signal_shapes.insert((rank, key), tensor.shape());
        if rank == 0 {
            self.master
                .add_base_signal(key, label.to_string(), tensor)?;
        } else {
            self.dispatch(
                rank,
                BuildRecord::AddSignal {
                    key,
                    label: label.to_string(),
                    tensor,
                },
            );
        }
        Ok(())
    }

    /// Add an operator (wire form) to the chunk owned by `rank`.
    pub fn add_op(&mut self, rank: Rank, spec: &str) -> SimResult<()> {
        self.check_rank(rank)?;
        let parsed: OpSpec = spec.parse()?;
        match &parsed {
            OpSpec::MpiSend {
                dst, tag, content, ..
            } => {
                let len = self.view_len(rank, content)?;
                self.declared_sends.push(CommDecl {
                    owner: rank,
                    peer: *dst,
                    tag: *tag,
                    len,
                });
            }
            OpSpec::MpiRecv {
                src, tag, content, ..
            } => {
                let len = self.view_len(rank, content)?;
                self.declared_recvs.push(CommDecl {
                    owner: rank,
                    peer: *src,
                    tag: *tag,
                    len,
                });
            }
            _ => {}
        }
        debug!(rank, kind = parsed.kind_name(), "add op");
        if rank == 0 {
            self.master.add_op(parsed)?;
        } else {
            self.dispatch(rank, BuildRecord::AddOp { spec: spec.to_string() });
        }
        Ok(())
    }

    /// Attach a probe to a signal owned by `rank`.
    pub fn add_probe(
        &mut self,
        rank: Rank,
        probe_key: Key,
        signal: &str,
        period: u64,
    ) -> SimResult<()> {
        self.check_rank(rank)?;
        if self.probe_owner.contains_key(&probe_key) {
            return Err(BuildError::DuplicateProbe(probe_key).into());
        }
        let target: SignalSpec = signal.parse()?;
        if rank == 0 {
            self.master.add_probe(ProbeSpec {
                probe_key,
                target,
                period,
            })?;
        } else {
            self.dispatch(
                rank,
                BuildRecord::AddProbe {
                    spec: format!("{probe_key};{target};{period}"),
                },
            );
        }
        self.probe_owner.insert(probe_key, rank);
        self.probe_data.insert(probe_key, Vec::new());
        Ok(())
    }

    /// Register a host callback. Callback handles cannot ride the record
    /// stream, so they are only accepted on rank 0.
    pub fn add_host_callback(&mut self, spec: OpSpec, handle: CallbackFn) -> SimResult<()> {
        self.master.add_host_callback(spec, handle)?;
        Ok(())
    }

    fn view_len(&self, rank: Rank, spec: &SignalSpec) -> SimResult<usize> {
        if spec.ndim == 0 {
            let (rows, cols) = self
                .signal_shapes
                .get(&(rank, spec.base_key))
                .copied()
                .ok_or(BuildError::UnknownKey(spec.base_key))?;
            Ok(rows * cols)
        } else if spec.ndim == 1 {
            Ok(spec.shape1)
        } else {
            Ok(spec.shape1 * spec.shape2)
        }
    }

    // *** Finalize ***

    /// Validate the global send/receive mirror, stop the build streams and
    /// finalize every chunk.
    pub fn finalize_build(&mut self) -> SimResult<()> {
        // Every send needs exactly one matching receive on the destination
        // rank, with the same element count; and vice versa.
        for send in &self.declared_sends {
            let recv = self
                .declared_recvs
                .iter()
                .find(|r| r.owner == send.peer && r.peer == send.owner && r.tag == send.tag)
                .ok_or(BuildError::MissingPeer {
                    src: send.owner,
                    dst: send.peer,
                    tag: send.tag,
                })?;
            if recv.len != send.len {
                return Err(BuildError::CommSizeMismatch {
                    src: send.owner,
                    dst: send.peer,
                    tag: send.tag,
                    send_len: send.len,
                    recv_len: recv.len,
                }
                .into());
            }
        }
        for recv in &self.declared_recvs {
            self.declared_sends
                .iter()
                .find(|s| s.owner == recv.peer && s.peer == recv.owner && s.tag == recv.tag)
                .ok_or(BuildError::MissingPeer {
                    src: recv.peer,
                    dst: recv.owner,
                    tag: recv.tag,
                })?;
        }

        for tx in &self.build_txs {
            let _ = tx.send(BuildRecord::Stop);
        }
        self.master.finalize_build(self.master_endpoint.take())?;

        let mut built = 0;
        while built < self.n_ranks - 1 {
            match self.reply_rx.recv() {
                Ok(WorkerReply::Built { rank }) => {
                    debug!(rank, "worker build finalized");
                    built += 1;
                }
                Ok(WorkerReply::Failed { rank, message }) => {
                    return Err(SimError::Worker { rank, message });
                }
                Ok(other) => {
                    warn!(?other, "unexpected reply during finalize");
                }
                Err(_) => {
                    return Err(SimError::Worker {
                        rank: 0,
                        message: "reply channel closed during finalize".into(),
                    });
                }
            }
        }
        self.finalized = true;
        info!(ranks = self.n_ranks, probes = self.probe_owner.len(), "build finalized");
        Ok(())
    }

    // *** Run ***

    /// Broadcast the step count, run every chunk, and gather probe data.
    pub fn run_n_steps(&mut self, steps: u64) -> SimResult<()> {
        self.run_n_steps_logged(steps, None)
    }

    /// As `run_n_steps`, optionally logging probe data under `log_path`
    /// instead of gathering it in memory.
    #[instrument(skip(self), fields(ranks = self.n_ranks))]
    pub fn run_n_steps_logged(&mut self, steps: u64, log_path: Option<&Path>) -> SimResult<()> {
        self.check_running()?;

        let log_path: Option<PathBuf> = log_path.map(Path::to_path_buf);
        for tx in &self.ctrl_txs {
            let _ = tx.send(ControlRecord::RunSteps {
                steps,
                log_path: log_path.clone(),
            });
        }

        if let Some(path) = &log_path {
            if !self.master.is_logging() {
                match FileSink::new(path, 0, self.master.dt()) {
                    Ok(sink) => self.master.set_sink(Box::new(sink)),
                    Err(e) => warn!(error = %e, "cannot open log sink; logging disabled"),
                }
            }
        }

        self.master.run_n_steps(steps)?;
        for probe_key in self.master.probe_keys() {
            let samples = self.master.take_probe_data(probe_key)?;
            self.probe_data
                .entry(probe_key)
                .or_default()
                .extend(samples);
        }

        self.collect_dones()?;
        info!(steps, "run complete");
        Ok(())
    }

    /// Wait for every worker to acknowledge the last control record,
    /// folding in any probe data sent along the way.
    fn collect_dones(&mut self) -> SimResult<()> {
        let mut done = 0;
        while done < self.n_ranks - 1 {
            match self.reply_rx.recv() {
                Ok(WorkerReply::ProbeData {
                    probe_key, samples, ..
                }) => {
                    self.probe_data
                        .entry(probe_key)
                        .or_default()
                        .extend(samples);
                }
                Ok(WorkerReply::Done { .. }) => done += 1,
                Ok(WorkerReply::Failed { rank, message }) => {
                    return Err(SimError::Worker { rank, message });
                }
                Ok(other) => warn!(?other, "unexpected reply"),
                Err(_) => {
                    return Err(SimError::Worker {
                        rank: 0,
                        message: "reply channel closed mid-run".into(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_running(&self) -> SimResult<()> {
        if self.closed {
            return Err(SimError::Closed);
        }
        if !self.finalized {
            return Err(BuildError::NotFinalized.into());
        }
        Ok(())
    }

    // *** Probe data ***

    /// All gathered samples for a probe, across runs.
    pub fn probe_data(&self, probe_key: Key) -> SimResult<&[Tensor]> {
        self.probe_data
            .get(&probe_key)
            .map(Vec::as_slice)
            .ok_or_else(|| BuildError::UnknownKey(probe_key).into())
    }

    /// Probe keys in registration order.
    pub fn probe_keys(&self) -> Vec<Key> {
        self.probe_owner.keys().copied().collect()
    }

    // *** Reset & shutdown ***

    /// Restore every chunk to its initial state and drop gathered data.
    pub fn reset(&mut self, seed: u64) -> SimResult<()> {
        self.check_running()?;
        for tx in &self.ctrl_txs {
            let _ = tx.send(ControlRecord::Reset { seed });
        }
        self.master.reset(seed);
        self.collect_dones()?;
        for samples in self.probe_data.values_mut() {
            samples.clear();
        }
        Ok(())
    }

    /// Broadcast the termination flag and join every worker.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for tx in &self.ctrl_txs {
            let _ = tx.send(ControlRecord::Close);
        }
        // Unblock any worker still waiting on build records (a build that
        // never reached Stop).
        self.build_txs.clear();
        self.ctrl_txs.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.master.close_log();
        info!("simulator closed");
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.close();
    }
}
