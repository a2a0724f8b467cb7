//! Worker rank: builds its chunk from the record stream, then serves the
//! control loop until told to close.

use std::sync::mpsc::{Receiver, Sender};

use tracing::{debug, info, warn};

use axon_runtime::chunk::{Chunk, ChunkConfig};
use axon_runtime::comm::CommEndpoint;
use axon_runtime::error::BuildResult;
use axon_runtime::probe::ProbeSpec;
use axon_runtime::sink::FileSink;
use axon_runtime::types::Rank;

use crate::build::{BuildRecord, ControlRecord, WorkerReply};

pub(crate) struct WorkerContext {
    pub rank: Rank,
    pub config: ChunkConfig,
    pub endpoint: CommEndpoint,
    pub build_rx: Receiver<BuildRecord>,
    pub ctrl_rx: Receiver<ControlRecord>,
    pub reply_tx: Sender<WorkerReply>,
}

/// Entry point of a worker thread.
pub(crate) fn run_worker(ctx: WorkerContext) {
    let WorkerContext {
        rank,
        config,
        endpoint,
        build_rx,
        ctrl_rx,
        reply_tx,
    } = ctx;

    let mut chunk = Chunk::new(config);
    debug!(rank, "worker ready for build records");

    loop {
        let record = match build_rx.recv() {
            Ok(record) => record,
            // Coordinator went away before Stop; nothing left to do.
            Err(_) => return,
        };
        let result = apply_record(&mut chunk, record);
        match result {
            Ok(true) => break, // Stop
            Ok(false) => {}
            Err(e) => {
                let _ = reply_tx.send(WorkerReply::Failed {
                    rank,
                    message: e.to_string(),
                });
                return;
            }
        }
    }

    match chunk.finalize_build(Some(endpoint)) {
        Ok(()) => {
            let _ = reply_tx.send(WorkerReply::Built { rank });
        }
        Err(e) => {
            let _ = reply_tx.send(WorkerReply::Failed {
                rank,
                message: e.to_string(),
            });
            return;
        }
    }

    while let Ok(record) = ctrl_rx.recv() {
        match record {
            ControlRecord::RunSteps { steps, log_path } => {
                if let Some(path) = log_path {
                    if !chunk.is_logging() {
                        match FileSink::new(path, rank, chunk.dt()) {
                            Ok(sink) => chunk.set_sink(Box::new(sink)),
                            Err(e) => {
                                warn!(rank, error = %e, "cannot open log sink; logging disabled")
                            }
                        }
                    }
                }
                info!(rank, steps, "worker running");
                if let Err(e) = chunk.run_n_steps(steps) {
                    let _ = reply_tx.send(WorkerReply::Failed {
                        rank,
                        message: e.to_string(),
                    });
                    return;
                }
                for probe_key in chunk.probe_keys() {
                    let samples = chunk.take_probe_data(probe_key).unwrap_or_default();
                    let _ = reply_tx.send(WorkerReply::ProbeData {
                        rank,
                        probe_key,
                        samples,
                    });
                }
                let _ = reply_tx.send(WorkerReply::Done { rank });
            }
            ControlRecord::Reset { seed } => {
                chunk.reset(seed);
                let _ = reply_tx.send(WorkerReply::Done { rank });
            }
            ControlRecord::Close => break,
        }
    }

    chunk.close_log();
    debug!(rank, "worker shut down");
}

/// Apply one build record. Returns `Ok(true)` on `Stop`.
fn apply_record(chunk: &mut Chunk, record: BuildRecord) -> BuildResult<bool> {
    match record {
        BuildRecord::AddSignal { key, label, tensor } => {
            chunk.add_base_signal(key, label, tensor)?;
        }
        BuildRecord::AddOp { spec } => {
            chunk.add_op_str(&spec)?;
        }
        BuildRecord::AddProbe { spec } => {
            let spec: ProbeSpec = spec.parse()?;
            chunk.add_probe(spec)?;
        }
        BuildRecord::Stop => return Ok(true),
    }
    Ok(false)
}
