//! Message fabric and communication operators.
//!
//! Chunks exchange state over an in-process fabric: every rank owns a mailbox
//! receiver plus a sender handle for each peer, and collectives ride on a
//! shared barrier. Posting a send hands an owned copy of the staged buffer to
//! the channel, so adjacent operators may freely rewrite the signal without
//! corrupting an in-flight message; the receive side blocks on its mailbox,
//! stashing out-of-order envelopes per `(src, tag)`.
//!
//! The latency contract: a value written to a send view during step `s` is
//! presented by the matching receive view during step `s + 1`, never the same
//! step. Receives skip their first call, so step 0 presents the initial value
//! of the receive signal.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier};

use indexmap::IndexMap;

use crate::error::{StepError, StepResult};
use crate::signal::{ResolvedView, SignalStore};
use crate::types::{Rank, Tag, BARRIER_PERIOD};

/// One message between peers.
struct Envelope {
    src: Rank,
    tag: Tag,
    payload: Vec<f64>,
}

/// Constructor for a fully-connected set of endpoints.
pub struct Fabric;

impl Fabric {
    /// Create one endpoint per rank. Every endpoint can send to every rank,
    /// itself included (self-loops are legal).
    pub fn connect(n_ranks: usize) -> Vec<CommEndpoint> {
        assert!(n_ranks > 0, "fabric needs at least one rank");

        let mut senders = Vec::with_capacity(n_ranks);
        let mut inboxes = Vec::with_capacity(n_ranks);
        for _ in 0..n_ranks {
            let (tx, rx) = channel();
            senders.push(tx);
            inboxes.push(rx);
        }
        let barrier = Arc::new(Barrier::new(n_ranks));

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| CommEndpoint {
                rank,
                n_ranks,
                peers: senders.clone(),
                inbox,
                stash: IndexMap::new(),
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }
}

/// One rank's handle on the fabric.
pub struct CommEndpoint {
    rank: Rank,
    n_ranks: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: IndexMap<(Rank, Tag), VecDeque<Vec<f64>>>,
    barrier: Arc<Barrier>,
}

impl CommEndpoint {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    /// Post a message. Never blocks; fails only if the peer is gone.
    pub fn send(&self, dst: Rank, tag: Tag, payload: Vec<f64>) -> StepResult<()> {
        let tx = self.peers.get(dst).ok_or_else(|| {
            StepError::CommFailure(format!("rank {} has no peer {dst}", self.rank))
        })?;
        tx.send(Envelope {
            src: self.rank,
            tag,
            payload,
        })
        .map_err(|_| {
            StepError::CommFailure(format!(
                "rank {}: peer {dst} dropped out of the communicator",
                self.rank
            ))
        })
    }

    /// Complete a receive from `(src, tag)`, blocking until the message
    /// arrives. Envelopes for other slots are stashed for their own waits.
    pub fn recv(&mut self, src: Rank, tag: Tag) -> StepResult<Vec<f64>> {
        if let Some(queue) = self.stash.get_mut(&(src, tag)) {
            if let Some(payload) = queue.pop_front() {
                return Ok(payload);
            }
        }
        loop {
            let env = self.inbox.recv().map_err(|_| {
                StepError::CommFailure(format!(
                    "rank {}: communicator closed while waiting on rank {src} tag {tag}",
                    self.rank
                ))
            })?;
            if env.src == src && env.tag == tag {
                return Ok(env.payload);
            }
            self.stash
                .entry((env.src, env.tag))
                .or_default()
                .push_back(env.payload);
        }
    }

    /// Collective barrier across all ranks.
    pub fn barrier(&self) {
        self.barrier.wait();
    }

    /// Discard every buffered and pending message. Callers must ensure all
    /// ranks are quiescent first.
    pub fn drain(&mut self) {
        self.stash.clear();
        while self.inbox.try_recv().is_ok() {}
    }
}

/// Non-blocking send operator.
///
/// Each step stages a copy of the content view and posts it. There is no
/// request to await: the channel owns the copy outright.
pub struct MpiSend {
    pub dst: Rank,
    pub tag: Tag,
    content: ResolvedView,
    staged: Vec<f64>,
}

impl MpiSend {
    pub fn new(dst: Rank, tag: Tag, content: ResolvedView) -> Self {
        let staged = vec![0.0; content.len()];
        Self {
            dst,
            tag,
            content,
            staged,
        }
    }

    pub fn step(&mut self, store: &SignalStore, comm: &mut CommEndpoint) -> StepResult<()> {
        store.gather_into(&self.content, &mut self.staged);
        comm.send(self.dst, self.tag, self.staged.clone())
    }
}

/// Non-blocking receive operator.
///
/// The first call arms the slot without touching the content view; every
/// later call completes the previous step's exchange and copies the payload
/// into the view. `complete` pulls the outstanding message at end of run and
/// holds it so a subsequent run continues where the last one stopped.
pub struct MpiRecv {
    pub src: Rank,
    pub tag: Tag,
    content: ResolvedView,
    first_call: bool,
    held: Option<Vec<f64>>,
}

impl MpiRecv {
    pub fn new(src: Rank, tag: Tag, content: ResolvedView) -> Self {
        Self {
            src,
            tag,
            content,
            first_call: true,
            held: None,
        }
    }

    pub fn step(&mut self, store: &mut SignalStore, comm: &mut CommEndpoint) -> StepResult<()> {
        if self.first_call {
            self.first_call = false;
            return Ok(());
        }
        let payload = match self.held.take() {
            Some(payload) => payload,
            None => comm.recv(self.src, self.tag)?,
        };
        store.scatter(&self.content, &payload);
        Ok(())
    }

    pub fn complete(&mut self, comm: &mut CommEndpoint) -> StepResult<()> {
        if !self.first_call && self.held.is_none() {
            self.held = Some(comm.recv(self.src, self.tag)?);
        }
        Ok(())
    }

    pub fn rearm(&mut self) {
        self.first_call = true;
        self.held = None;
    }
}

/// Periodic collective barrier. Bounds inter-rank skew without paying a
/// collective on every step.
pub struct MpiBarrier {
    period: u64,
    step: u64,
}

impl MpiBarrier {
    pub fn new() -> Self {
        Self::with_period(BARRIER_PERIOD)
    }

    pub fn with_period(period: u64) -> Self {
        assert!(period > 0, "barrier period must be positive");
        Self { period, step: 0 }
    }

    pub fn step(&mut self, comm: &mut CommEndpoint) {
        if self.step != 0 && self.step % self.period == 0 {
            comm.barrier();
        }
        self.step += 1;
    }

    pub fn rearm(&mut self) {
        self.step = 0;
    }
}

impl Default for MpiBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Composite send: every logical send to one peer concatenated into a single
/// wire message. Segment order is ascending member tag on both sides.
pub struct MergedSend {
    pub dst: Rank,
    pub tag: Tag,
    members: Vec<ResolvedView>,
    total_len: usize,
}

impl MergedSend {
    pub fn new(dst: Rank, tag: Tag, members: Vec<ResolvedView>) -> Self {
        let total_len = members.iter().map(|m| m.len()).sum();
        Self {
            dst,
            tag,
            members,
            total_len,
        }
    }

    pub fn step(&mut self, store: &SignalStore, comm: &mut CommEndpoint) -> StepResult<()> {
        let mut staged = Vec::with_capacity(self.total_len);
        for member in &self.members {
            let start = staged.len();
            staged.resize(start + member.len(), 0.0);
            store.gather_into(member, &mut staged[start..]);
        }
        comm.send(self.dst, self.tag, staged)
    }
}

/// Composite receive: one wire message per peer, scattered back to the
/// member views by the shared segment map.
pub struct MergedRecv {
    pub src: Rank,
    pub tag: Tag,
    members: Vec<ResolvedView>,
    first_call: bool,
    held: Option<Vec<f64>>,
}

impl MergedRecv {
    pub fn new(src: Rank, tag: Tag, members: Vec<ResolvedView>) -> Self {
        Self {
            src,
            tag,
            members,
            first_call: true,
            held: None,
        }
    }

    pub fn step(&mut self, store: &mut SignalStore, comm: &mut CommEndpoint) -> StepResult<()> {
        if self.first_call {
            self.first_call = false;
            return Ok(());
        }
        let payload = match self.held.take() {
            Some(payload) => payload,
            None => comm.recv(self.src, self.tag)?,
        };
        let mut start = 0;
        for member in &self.members {
            store.scatter(member, &payload[start..start + member.len()]);
            start += member.len();
        }
        Ok(())
    }

    pub fn complete(&mut self, comm: &mut CommEndpoint) -> StepResult<()> {
        if !self.first_call && self.held.is_none() {
            self.held = Some(comm.recv(self.src, self.tag)?);
        }
        Ok(())
    }

    pub fn rearm(&mut self) {
        self.first_call = true;
        self.held = None;
    }
}
