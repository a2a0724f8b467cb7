//! Axon runtime
//!
//! The per-process half of the distributed simulator: signal storage and
//! views, the operator schedule, probes, the message fabric and the probe
//! log sink, all owned by a [`Chunk`] that drives the step loop.

pub mod chunk;
pub mod comm;
pub mod error;
pub mod operators;
pub mod probe;
pub mod signal;
pub mod sink;
pub mod tensor;
pub mod types;

pub use chunk::{Chunk, ChunkConfig};
pub use comm::{CommEndpoint, Fabric};
pub use error::{BuildError, BuildResult, StepError, StepResult};
pub use operators::{CallbackFn, OpSpec};
pub use probe::ProbeSpec;
pub use signal::SignalSpec;
pub use sink::{FileSink, MemorySink, MemorySinkHandle, NullSink, ProbeBlock, ProbeSink};
pub use tensor::Tensor;
pub use types::{Key, Rank, StepContext, Tag, BARRIER_PERIOD, FLUSH_PROBES_EVERY};
