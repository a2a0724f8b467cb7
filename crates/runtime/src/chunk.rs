//! The chunk: one process's slice of the network.
//!
//! A chunk owns its signals, operators and probes, and drives the per-step
//! loop. Build and step are strictly separated: after `finalize_build` the
//! operator schedule and signal arena are frozen for the run.
//!
//! Build order matters only in one way: a base signal must be added before
//! any operator or probe that references it.

use indexmap::IndexMap;
use tracing::{debug, info, instrument, trace, warn};

use crate::comm::{CommEndpoint, MergedRecv, MergedSend, MpiBarrier, MpiRecv, MpiSend};
use crate::error::{BuildError, BuildResult, StepError, StepResult};
use crate::operators::{build_compute, CallbackFn, OpKind, Operator, OpSpec};
use crate::probe::{Probe, ProbeSpec};
use crate::signal::{ResolvedView, SignalSpec, SignalStore};
use crate::sink::{ProbeBlock, ProbeSink};
use crate::tensor::Tensor;
use crate::types::{Key, Rank, StepContext, Tag, FLUSH_PROBES_EVERY};

/// Build-time configuration of a chunk.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub rank: Rank,
    pub n_ranks: usize,
    pub dt: f64,
    /// Concatenate per-peer exchanges into one message per step.
    pub merged: bool,
    /// Steps between probe-ring spills to the log sink.
    pub flush_probes_every: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            n_ranks: 1,
            dt: 0.001,
            merged: false,
            flush_probes_every: FLUSH_PROBES_EVERY,
        }
    }
}

/// A declared point-to-point slot, materialized into an operator at finalize.
#[derive(Debug, Clone, Copy)]
struct CommSlot {
    index: f64,
    peer: Rank,
    tag: Tag,
    view: ResolvedView,
}

/// One process's share of the network.
pub struct Chunk {
    config: ChunkConfig,
    time: f64,
    step_counter: u64,
    seed: u64,
    store: SignalStore,
    ops: Vec<Operator>,
    next_seq: u64,
    probes: IndexMap<Key, Probe>,
    pending_sends: Vec<CommSlot>,
    pending_recvs: Vec<CommSlot>,
    endpoint: Option<CommEndpoint>,
    sink: Option<Box<dyn ProbeSink>>,
    finalized: bool,
}

impl Chunk {
    pub fn new(config: ChunkConfig) -> Self {
        assert!(config.dt > 0.0, "dt must be positive");
        assert!(
            config.flush_probes_every > 0,
            "flush period must be positive"
        );
        Self {
            config,
            time: 0.0,
            step_counter: 0,
            seed: 0,
            store: SignalStore::default(),
            ops: Vec::new(),
            next_seq: 0,
            probes: IndexMap::new(),
            pending_sends: Vec::new(),
            pending_recvs: Vec::new(),
            endpoint: None,
            sink: None,
            finalized: false,
        }
    }

    pub fn rank(&self) -> Rank {
        self.config.rank
    }

    pub fn dt(&self) -> f64 {
        self.config.dt
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step_counter(&self) -> u64 {
        self.step_counter
    }

    /// Seed recorded by the last reset.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn num_probes(&self) -> usize {
        self.probes.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Read access to the signal store, for tests and diagnostics.
    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    // *** Build surface ***

    /// Add a base signal. All simulation data lives in base signals; the key
    /// is how operators and probes will reference views of it.
    pub fn add_base_signal(&mut self, key: Key, label: String, tensor: Tensor) -> BuildResult<()> {
        self.check_building()?;
        debug!(rank = self.config.rank, %key, %label, "add signal");
        self.store.add_base(key, label, tensor)
    }

    /// Add an operator from its spec. Communication specs are routed to the
    /// pending send/recv slots and materialized at finalize.
    pub fn add_op(&mut self, spec: OpSpec) -> BuildResult<()> {
        self.check_building()?;
        match &spec {
            OpSpec::MpiSend {
                index,
                dst,
                tag,
                content,
            } => {
                return self.add_mpi_send(*index, *dst, *tag, content);
            }
            OpSpec::MpiRecv {
                index,
                src,
                tag,
                content,
            } => {
                return self.add_mpi_recv(*index, *src, *tag, content);
            }
            OpSpec::HostCallback { .. } => {
                return Err(BuildError::BadSpec(
                    "HostCallback needs a handle; use add_host_callback".into(),
                ));
            }
            _ => {}
        }
        let kind = build_compute(&spec, &self.store)?
            .expect("compute specs always build a kind");
        self.push_op(spec.index(), kind);
        Ok(())
    }

    /// Parse and add an operator from its wire form.
    pub fn add_op_str(&mut self, spec: &str) -> BuildResult<()> {
        self.add_op(spec.parse()?)
    }

    /// Add a host-callback operator: `handle` is invoked every step with the
    /// current time (if requested) and a snapshot of the input view, and its
    /// result is written to the output view.
    pub fn add_host_callback(&mut self, spec: OpSpec, handle: CallbackFn) -> BuildResult<()> {
        self.check_building()?;
        let (index, output, want_time, input) = match spec {
            OpSpec::HostCallback {
                index,
                output,
                want_time,
                input,
            } => (index, output, want_time, input),
            other => {
                return Err(BuildError::BadSpec(format!(
                    "add_host_callback got a {} spec",
                    other.kind_name()
                )));
            }
        };
        let output_key = output.base_key;
        let output = self.store.resolve(&output)?;
        let input = input.map(|spec| self.store.resolve(&spec)).transpose()?;
        let in_buf = vec![0.0; input.map(|v| v.len()).unwrap_or(0)];
        self.push_op(
            index,
            OpKind::HostCallback {
                output_key,
                output,
                want_time,
                input,
                in_buf,
                handle,
            },
        );
        Ok(())
    }

    /// Declare a send of `content` to `dst` on `tag`, scheduled at `index`.
    pub fn add_mpi_send(
        &mut self,
        index: f64,
        dst: Rank,
        tag: Tag,
        content: &SignalSpec,
    ) -> BuildResult<()> {
        self.check_building()?;
        let view = self.store.resolve(content)?;
        self.pending_sends.push(CommSlot {
            index,
            peer: dst,
            tag,
            view,
        });
        Ok(())
    }

    /// Declare a receive into `content` from `src` on `tag`, scheduled at
    /// `index`.
    pub fn add_mpi_recv(
        &mut self,
        index: f64,
        src: Rank,
        tag: Tag,
        content: &SignalSpec,
    ) -> BuildResult<()> {
        self.check_building()?;
        let view = self.store.resolve(content)?;
        self.pending_recvs.push(CommSlot {
            index,
            peer: src,
            tag,
            view,
        });
        Ok(())
    }

    /// Attach a probe to a signal view.
    pub fn add_probe(&mut self, spec: ProbeSpec) -> BuildResult<()> {
        self.check_building()?;
        if self.probes.contains_key(&spec.probe_key) {
            return Err(BuildError::DuplicateProbe(spec.probe_key));
        }
        if spec.period == 0 {
            return Err(BuildError::BadSpec("probe period must be at least 1".into()));
        }
        let view = self.store.resolve(&spec.target)?;
        let label = if spec.target.label.is_empty() {
            self.store.label_of(spec.target.base_key)?.to_string()
        } else {
            spec.target.label.clone()
        };
        self.probes.insert(
            spec.probe_key,
            Probe::new(spec.probe_key, label, view, spec.period),
        );
        Ok(())
    }

    /// Install a log sink. Probe rings spill into it every
    /// `flush_probes_every` steps.
    pub fn set_sink(&mut self, sink: Box<dyn ProbeSink>) {
        self.sink = Some(sink);
    }

    pub fn is_logging(&self) -> bool {
        self.sink.is_some()
    }

    fn push_op(&mut self, index: f64, kind: OpKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ops.push(Operator::new(index, seq, kind));
    }

    fn check_building(&self) -> BuildResult<()> {
        if self.finalized {
            Err(BuildError::AlreadyFinalized)
        } else {
            Ok(())
        }
    }

    // *** Finalize ***

    /// Freeze the build: materialize communication operators (merging per
    /// peer when enabled), install the periodic barrier, bind the
    /// communicator and sort the schedule.
    pub fn finalize_build(&mut self, endpoint: Option<CommEndpoint>) -> BuildResult<()> {
        self.check_building()?;

        let has_comm = !self.pending_sends.is_empty() || !self.pending_recvs.is_empty();
        if has_comm && endpoint.is_none() {
            return Err(BuildError::CommUnbound);
        }

        let sends = std::mem::take(&mut self.pending_sends);
        let recvs = std::mem::take(&mut self.pending_recvs);
        if self.config.merged {
            // All traffic to one peer collapses to a single exchange per
            // step. The composite send runs at the group's latest member
            // index (after every producer), the composite receive at the
            // earliest (before every consumer); segment order is ascending
            // tag on both sides.
            for (dst, group) in group_by_peer(sends) {
                let index = group
                    .iter()
                    .map(|s| s.index)
                    .fold(f64::NEG_INFINITY, f64::max);
                let tag = group[0].tag;
                let members = group.iter().map(|s| s.view).collect();
                self.push_op(index, OpKind::MergedSend(MergedSend::new(dst, tag, members)));
            }
            for (src, group) in group_by_peer(recvs) {
                let index = group.iter().map(|s| s.index).fold(f64::INFINITY, f64::min);
                let tag = group[0].tag;
                let members = group.iter().map(|s| s.view).collect();
                self.push_op(index, OpKind::MergedRecv(MergedRecv::new(src, tag, members)));
            }
        } else {
            for slot in sends {
                self.push_op(
                    slot.index,
                    OpKind::MpiSend(MpiSend::new(slot.peer, slot.tag, slot.view)),
                );
            }
            for slot in recvs {
                self.push_op(
                    slot.index,
                    OpKind::MpiRecv(MpiRecv::new(slot.peer, slot.tag, slot.view)),
                );
            }
        }

        if endpoint.is_some() {
            // Terminal index: the barrier always runs last.
            self.push_op(f64::INFINITY, OpKind::Barrier(MpiBarrier::new()));
        }

        self.ops
            .sort_by(|a, b| a.index.total_cmp(&b.index).then(a.seq.cmp(&b.seq)));

        self.endpoint = endpoint;
        self.finalized = true;
        info!(
            rank = self.config.rank,
            signals = self.store.len(),
            ops = self.ops.len(),
            probes = self.probes.len(),
            merged = self.config.merged,
            "chunk build finalized"
        );
        Ok(())
    }

    // *** Step ***

    /// Run an integer number of steps, then complete any outstanding
    /// exchanges so the chunk is quiescent between runs.
    #[instrument(skip(self), fields(rank = self.config.rank))]
    pub fn run_n_steps(&mut self, steps: u64) -> StepResult<()> {
        if !self.finalized {
            return Err(StepError::NotFinalized);
        }
        for _ in 0..steps {
            self.step_once()?;
        }
        for op in &mut self.ops {
            op.kind.complete(self.endpoint.as_mut())?;
        }
        if steps > 0 {
            self.flush_probes();
        }
        trace!(rank = self.config.rank, steps, "run complete");
        Ok(())
    }

    fn step_once(&mut self) -> StepResult<()> {
        let ctx = StepContext {
            time: self.time,
            dt: self.config.dt,
        };
        for op in &mut self.ops {
            op.step(&mut self.store, self.endpoint.as_mut(), &ctx)?;
        }
        for probe in self.probes.values_mut() {
            probe.sample(self.step_counter, &self.store);
        }
        self.step_counter += 1;
        self.time += self.config.dt;
        if self.step_counter % self.config.flush_probes_every == 0 {
            self.flush_probes();
        }
        Ok(())
    }

    /// Spill every probe ring to the sink. A sink failure disables logging
    /// but never stops the run.
    pub fn flush_probes(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let mut failed = false;
        for probe in self.probes.values_mut() {
            let samples = probe.take_block();
            if samples.is_empty() {
                continue;
            }
            let block = ProbeBlock {
                probe_key: probe.key(),
                label: probe.label().to_string(),
                period: probe.period(),
                samples,
            };
            if let Err(e) = sink.emit_block(block) {
                warn!(rank = self.config.rank, error = %e, "log sink failed; disabling");
                failed = true;
                break;
            }
        }
        if !failed {
            if let Err(e) = sink.flush() {
                warn!(rank = self.config.rank, error = %e, "log sink flush failed; disabling");
                failed = true;
            }
        }
        if failed {
            self.sink = None;
        }
    }

    /// Close the log sink, writing any trailing data and the manifest.
    pub fn close_log(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close() {
                warn!(rank = self.config.rank, error = %e, "log sink close failed");
            }
        }
    }

    // *** Probe data ***

    /// Keys of every probe on this chunk, in registration order.
    pub fn probe_keys(&self) -> Vec<Key> {
        self.probes.keys().copied().collect()
    }

    /// Move the buffered samples for one probe out of the chunk.
    pub fn take_probe_data(&mut self, probe_key: Key) -> BuildResult<Vec<Tensor>> {
        self.probes
            .get_mut(&probe_key)
            .map(Probe::take_block)
            .ok_or(BuildError::UnknownKey(probe_key))
    }

    // *** Reset ***

    /// Restore every base signal to its initial snapshot, zero the clock,
    /// clear probe buffers and re-arm communication operators.
    pub fn reset(&mut self, seed: u64) {
        info!(rank = self.config.rank, seed, "chunk reset");
        self.store.restore_initial();
        self.time = 0.0;
        self.step_counter = 0;
        self.seed = seed;
        for probe in self.probes.values_mut() {
            probe.clear(true);
        }
        for op in &mut self.ops {
            op.reset_state();
        }
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.drain();
        }
    }
}

/// Group comm slots by peer, preserving declaration order of peers and
/// sorting each group by ascending tag.
fn group_by_peer(slots: Vec<CommSlot>) -> IndexMap<Rank, Vec<CommSlot>> {
    let mut groups: IndexMap<Rank, Vec<CommSlot>> = IndexMap::new();
    for slot in slots {
        groups.entry(slot.peer).or_default().push(slot);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|s| s.tag);
    }
    groups
}
