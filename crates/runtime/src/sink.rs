//! Probe log sinks.
//!
//! Every `FLUSH_PROBES_EVERY` steps the chunk spills its probe rings to a
//! sink as [`ProbeBlock`]s. Sinks are strictly observer-side: a sink failure
//! never stops the step loop — the chunk disables the sink, emits a
//! diagnostic and keeps stepping.
//!
//! Implementations:
//! - [`NullSink`] — discard everything (performance testing)
//! - [`MemorySink`] — keep blocks in memory behind a shared handle (tests,
//!   probe-data gather)
//! - [`FileSink`] — columnar JSON on disk, one block file per flush plus a
//!   manifest describing every dataset

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;
use crate::types::{Key, Rank};

/// Result type for sink operations.
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Errors from sink operations. Non-fatal for the simulation core.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("sink already closed")]
    AlreadyClosed,
}

/// One flushed probe ring: every sample collected since the previous flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeBlock {
    pub probe_key: Key,
    pub label: String,
    pub period: u64,
    pub samples: Vec<Tensor>,
}

/// Destination for flushed probe data.
pub trait ProbeSink: Send {
    /// Accept one flushed block.
    fn emit_block(&mut self, block: ProbeBlock) -> SinkResult<()>;

    /// Push any buffered data to the backend.
    fn flush(&mut self) -> SinkResult<()>;

    /// Finalize output. The sink must not be used afterwards.
    fn close(&mut self) -> SinkResult<()>;
}

/// Discards all data.
pub struct NullSink;

impl ProbeSink for NullSink {
    fn emit_block(&mut self, _block: ProbeBlock) -> SinkResult<()> {
        Ok(())
    }

    fn flush(&mut self) -> SinkResult<()> {
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        Ok(())
    }
}

/// Shared view of the blocks a [`MemorySink`] has collected.
#[derive(Clone, Default)]
pub struct MemorySinkHandle {
    blocks: Arc<Mutex<Vec<ProbeBlock>>>,
}

impl MemorySinkHandle {
    /// Snapshot of every block emitted so far.
    pub fn blocks(&self) -> Vec<ProbeBlock> {
        self.blocks.lock().unwrap().clone()
    }

    /// All samples for one probe key, across blocks, in emission order.
    pub fn samples(&self, probe_key: Key) -> Vec<Tensor> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.probe_key == probe_key)
            .flat_map(|b| b.samples.iter().cloned())
            .collect()
    }
}

/// In-memory sink; the sink is consumed by the chunk while the handle stays
/// with the caller.
pub struct MemorySink {
    blocks: Arc<Mutex<Vec<ProbeBlock>>>,
}

impl MemorySink {
    pub fn new() -> (Self, MemorySinkHandle) {
        let handle = MemorySinkHandle::default();
        (
            Self {
                blocks: Arc::clone(&handle.blocks),
            },
            handle,
        )
    }
}

impl ProbeSink for MemorySink {
    fn emit_block(&mut self, block: ProbeBlock) -> SinkResult<()> {
        self.blocks.lock().unwrap().push(block);
        Ok(())
    }

    fn flush(&mut self) -> SinkResult<()> {
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        Ok(())
    }
}

/// Manifest describing a log directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogManifest {
    pub created_at: String,
    pub rank: Rank,
    pub dt: f64,
    pub n_blocks: u64,
    /// Metadata per probe key.
    pub datasets: IndexMap<String, DatasetMeta>,
}

/// Per-dataset metadata: enough to reassemble `(samples, *signal_shape)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub label: String,
    pub period: u64,
    pub shape: (usize, usize),
    pub n_samples: u64,
}

/// One block file: the probe rings flushed together at one step boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockFile {
    seq: u64,
    blocks: Vec<ProbeBlock>,
}

/// File-backed sink: a directory of numbered block files plus a manifest
/// written at close. Rank-local; each rank logs into its own directory.
pub struct FileSink {
    run_dir: PathBuf,
    rank: Rank,
    dt: f64,
    seq: u64,
    pending: Vec<ProbeBlock>,
    datasets: IndexMap<String, DatasetMeta>,
    is_closed: bool,
}

impl FileSink {
    /// Create the sink, making `<path>/rank<k>/` on disk.
    pub fn new(path: impl Into<PathBuf>, rank: Rank, dt: f64) -> SinkResult<Self> {
        let run_dir = path.into().join(format!("rank{rank}"));
        fs::create_dir_all(&run_dir)?;
        Ok(Self {
            run_dir,
            rank,
            dt,
            seq: 0,
            pending: Vec::new(),
            datasets: IndexMap::new(),
            is_closed: false,
        })
    }

    pub fn run_dir(&self) -> &PathBuf {
        &self.run_dir
    }

    fn check_open(&self) -> SinkResult<()> {
        if self.is_closed {
            Err(SinkError::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

impl ProbeSink for FileSink {
    fn emit_block(&mut self, block: ProbeBlock) -> SinkResult<()> {
        self.check_open()?;
        let meta = self
            .datasets
            .entry(block.probe_key.to_string())
            .or_insert_with(|| DatasetMeta {
                label: block.label.clone(),
                period: block.period,
                shape: block
                    .samples
                    .first()
                    .map(|t| t.shape())
                    .unwrap_or((0, 0)),
                n_samples: 0,
            });
        meta.n_samples += block.samples.len() as u64;
        if meta.shape == (0, 0) {
            if let Some(first) = block.samples.first() {
                meta.shape = first.shape();
            }
        }
        self.pending.push(block);
        Ok(())
    }

    fn flush(&mut self) -> SinkResult<()> {
        self.check_open()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let file = BlockFile {
            seq: self.seq,
            blocks: std::mem::take(&mut self.pending),
        };
        let path = self.run_dir.join(format!("block_{:06}.json", self.seq));
        let json = serde_json::to_string(&file)
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        fs::write(path, json)?;
        self.seq += 1;
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        if self.is_closed {
            return Ok(());
        }
        self.flush()?;
        let manifest = LogManifest {
            created_at: chrono::Local::now().to_rfc3339(),
            rank: self.rank,
            dt: self.dt,
            n_blocks: self.seq,
            datasets: self.datasets.clone(),
        };
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        fs::write(self.run_dir.join("manifest.json"), json)?;
        self.is_closed = true;
        Ok(())
    }
}
