//! Operators: the step-callables that carry out the simulation.
//!
//! The operator set is closed. Every operator exposes only `step`; it reads
//! the current value of the views it references and writes in operator order.
//! Ordering is by float `index` ascending, ties broken by insertion order, so
//! builders can wedge new operators between existing ones without
//! renumbering.
//!
//! `OpSpec` is the build-time description. Its wire form is the
//! `;`-delimited text the build-record stream carries, e.g.
//! `DotInc;2.5;10;11;12` or `SimLIF;4;50;0.02;0.002;0.001;20;21`.

use std::fmt;
use std::str::FromStr;

use crate::comm::{CommEndpoint, MergedRecv, MergedSend, MpiBarrier, MpiRecv, MpiSend};
use crate::error::{BuildError, BuildResult, StepError, StepResult};
use crate::signal::{ResolvedView, SignalSpec, SignalStore};
use crate::types::{Key, Rank, StepContext, Tag};

/// Handle for an externally-registered callback.
///
/// Called once per step with the current time (if requested) and a snapshot
/// of the input view (if one was registered); returns the output vector.
pub type CallbackFn = Box<dyn FnMut(Option<f64>, Option<&[f64]>) -> Vec<f64> + Send>;

/// Build-time description of an operator.
#[derive(Debug, Clone, PartialEq)]
pub enum OpSpec {
    Reset {
        index: f64,
        dst: SignalSpec,
        value: f64,
    },
    Copy {
        index: f64,
        dst: SignalSpec,
        src: SignalSpec,
    },
    DotInc {
        index: f64,
        a: SignalSpec,
        x: SignalSpec,
        y: SignalSpec,
    },
    ScalarDotInc {
        index: f64,
        a: SignalSpec,
        x: SignalSpec,
        y: SignalSpec,
    },
    ElementwiseInc {
        index: f64,
        a: SignalSpec,
        x: SignalSpec,
        y: SignalSpec,
    },
    ProdUpdate {
        index: f64,
        a: SignalSpec,
        x: SignalSpec,
        b: SignalSpec,
        y: SignalSpec,
    },
    ScalarProdUpdate {
        index: f64,
        a: SignalSpec,
        x: SignalSpec,
        b: SignalSpec,
        y: SignalSpec,
    },
    Filter {
        index: f64,
        input: SignalSpec,
        output: SignalSpec,
        numer: Vec<f64>,
        denom: Vec<f64>,
    },
    SimLIF {
        index: f64,
        n: usize,
        tau_rc: f64,
        tau_ref: f64,
        dt: f64,
        j: SignalSpec,
        out: SignalSpec,
    },
    SimLIFRate {
        index: f64,
        n: usize,
        tau_rc: f64,
        tau_ref: f64,
        j: SignalSpec,
        out: SignalSpec,
    },
    RectifiedLinear {
        index: f64,
        n: usize,
        j: SignalSpec,
        out: SignalSpec,
    },
    Sigmoid {
        index: f64,
        n: usize,
        tau_ref: f64,
        j: SignalSpec,
        out: SignalSpec,
    },
    HostCallback {
        index: f64,
        output: SignalSpec,
        want_time: bool,
        input: Option<SignalSpec>,
    },
    MpiSend {
        index: f64,
        dst: Rank,
        tag: Tag,
        content: SignalSpec,
    },
    MpiRecv {
        index: f64,
        src: Rank,
        tag: Tag,
        content: SignalSpec,
    },
}

impl OpSpec {
    pub fn index(&self) -> f64 {
        match self {
            OpSpec::Reset { index, .. }
            | OpSpec::Copy { index, .. }
            | OpSpec::DotInc { index, .. }
            | OpSpec::ScalarDotInc { index, .. }
            | OpSpec::ElementwiseInc { index, .. }
            | OpSpec::ProdUpdate { index, .. }
            | OpSpec::ScalarProdUpdate { index, .. }
            | OpSpec::Filter { index, .. }
            | OpSpec::SimLIF { index, .. }
            | OpSpec::SimLIFRate { index, .. }
            | OpSpec::RectifiedLinear { index, .. }
            | OpSpec::Sigmoid { index, .. }
            | OpSpec::HostCallback { index, .. }
            | OpSpec::MpiSend { index, .. }
            | OpSpec::MpiRecv { index, .. } => *index,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            OpSpec::Reset { .. } => "Reset",
            OpSpec::Copy { .. } => "Copy",
            OpSpec::DotInc { .. } => "DotInc",
            OpSpec::ScalarDotInc { .. } => "ScalarDotInc",
            OpSpec::ElementwiseInc { .. } => "ElementwiseInc",
            OpSpec::ProdUpdate { .. } => "ProdUpdate",
            OpSpec::ScalarProdUpdate { .. } => "ScalarProdUpdate",
            OpSpec::Filter { .. } => "Filter",
            OpSpec::SimLIF { .. } => "SimLIF",
            OpSpec::SimLIFRate { .. } => "SimLIFRate",
            OpSpec::RectifiedLinear { .. } => "RectifiedLinear",
            OpSpec::Sigmoid { .. } => "Sigmoid",
            OpSpec::HostCallback { .. } => "HostCallback",
            OpSpec::MpiSend { .. } => "MPISend",
            OpSpec::MpiRecv { .. } => "MPIRecv",
        }
    }
}

impl fmt::Display for OpSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpSpec::Reset { index, dst, value } => {
                write!(f, "Reset;{index};{dst};{value}")
            }
            OpSpec::Copy { index, dst, src } => {
                write!(f, "Copy;{index};{dst};{src}")
            }
            OpSpec::DotInc { index, a, x, y } => {
                write!(f, "DotInc;{index};{a};{x};{y}")
            }
            OpSpec::ScalarDotInc { index, a, x, y } => {
                write!(f, "ScalarDotInc;{index};{a};{x};{y}")
            }
            OpSpec::ElementwiseInc { index, a, x, y } => {
                write!(f, "ElementwiseInc;{index};{a};{x};{y}")
            }
            OpSpec::ProdUpdate { index, a, x, b, y } => {
                write!(f, "ProdUpdate;{index};{a};{x};{b};{y}")
            }
            OpSpec::ScalarProdUpdate { index, a, x, b, y } => {
                write!(f, "ScalarProdUpdate;{index};{a};{x};{b};{y}")
            }
            OpSpec::Filter {
                index,
                input,
                output,
                numer,
                denom,
            } => {
                write!(
                    f,
                    "Filter;{index};{input};{output};{};{}",
                    join_coeffs(numer),
                    join_coeffs(denom)
                )
            }
            OpSpec::SimLIF {
                index,
                n,
                tau_rc,
                tau_ref,
                dt,
                j,
                out,
            } => {
                write!(f, "SimLIF;{index};{n};{tau_rc};{tau_ref};{dt};{j};{out}")
            }
            OpSpec::SimLIFRate {
                index,
                n,
                tau_rc,
                tau_ref,
                j,
                out,
            } => {
                write!(f, "SimLIFRate;{index};{n};{tau_rc};{tau_ref};{j};{out}")
            }
            OpSpec::RectifiedLinear { index, n, j, out } => {
                write!(f, "RectifiedLinear;{index};{n};{j};{out}")
            }
            OpSpec::Sigmoid {
                index,
                n,
                tau_ref,
                j,
                out,
            } => {
                write!(f, "Sigmoid;{index};{n};{tau_ref};{j};{out}")
            }
            OpSpec::HostCallback {
                index,
                output,
                want_time,
                input,
            } => {
                let input = input
                    .as_ref()
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "-".into());
                write!(
                    f,
                    "HostCallback;{index};{output};{};{input}",
                    u8::from(*want_time)
                )
            }
            OpSpec::MpiSend {
                index,
                dst,
                tag,
                content,
            } => {
                write!(f, "MPISend;{index};{dst};{tag};{content}")
            }
            OpSpec::MpiRecv {
                index,
                src,
                tag,
                content,
            } => {
                write!(f, "MPIRecv;{index};{src};{tag};{content}")
            }
        }
    }
}

fn join_coeffs(coeffs: &[f64]) -> String {
    coeffs
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_coeffs(s: &str) -> BuildResult<Vec<f64>> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|c| {
            c.trim()
                .parse()
                .map_err(|_| BuildError::BadSpec(format!("coefficient '{c}'")))
        })
        .collect()
}

impl FromStr for OpSpec {
    type Err = BuildError;

    fn from_str(s: &str) -> BuildResult<Self> {
        let fields: Vec<&str> = s.split(';').collect();
        let kind = *fields
            .first()
            .ok_or_else(|| BuildError::BadSpec("empty op spec".into()))?;

        let arity = |want: usize| -> BuildResult<()> {
            if fields.len() == want + 2 {
                Ok(())
            } else {
                Err(BuildError::BadSpec(format!(
                    "{kind} expects {want} arguments, got {}",
                    fields.len().saturating_sub(2)
                )))
            }
        };
        let num = |field: &str| -> BuildResult<f64> {
            field
                .trim()
                .parse()
                .map_err(|_| BuildError::BadSpec(format!("number '{field}' in {kind}")))
        };
        let int = |field: &str| -> BuildResult<usize> {
            field
                .trim()
                .parse()
                .map_err(|_| BuildError::BadSpec(format!("integer '{field}' in {kind}")))
        };
        let sig = |field: &str| -> BuildResult<SignalSpec> { field.parse() };

        let index = if fields.len() >= 2 { num(fields[1])? } else { 0.0 };

        match kind {
            "Reset" => {
                arity(2)?;
                Ok(OpSpec::Reset {
                    index,
                    dst: sig(fields[2])?,
                    value: num(fields[3])?,
                })
            }
            "Copy" => {
                arity(2)?;
                Ok(OpSpec::Copy {
                    index,
                    dst: sig(fields[2])?,
                    src: sig(fields[3])?,
                })
            }
            "DotInc" | "ScalarDotInc" | "ElementwiseInc" => {
                arity(3)?;
                let (a, x, y) = (sig(fields[2])?, sig(fields[3])?, sig(fields[4])?);
                Ok(match kind {
                    "DotInc" => OpSpec::DotInc { index, a, x, y },
                    "ScalarDotInc" => OpSpec::ScalarDotInc { index, a, x, y },
                    _ => OpSpec::ElementwiseInc { index, a, x, y },
                })
            }
            "ProdUpdate" | "ScalarProdUpdate" => {
                arity(4)?;
                let (a, x, b, y) = (
                    sig(fields[2])?,
                    sig(fields[3])?,
                    sig(fields[4])?,
                    sig(fields[5])?,
                );
                Ok(if kind == "ProdUpdate" {
                    OpSpec::ProdUpdate { index, a, x, b, y }
                } else {
                    OpSpec::ScalarProdUpdate { index, a, x, b, y }
                })
            }
            "Filter" => {
                arity(4)?;
                Ok(OpSpec::Filter {
                    index,
                    input: sig(fields[2])?,
                    output: sig(fields[3])?,
                    numer: parse_coeffs(fields[4])?,
                    denom: parse_coeffs(fields[5])?,
                })
            }
            "SimLIF" => {
                arity(6)?;
                Ok(OpSpec::SimLIF {
                    index,
                    n: int(fields[2])?,
                    tau_rc: num(fields[3])?,
                    tau_ref: num(fields[4])?,
                    dt: num(fields[5])?,
                    j: sig(fields[6])?,
                    out: sig(fields[7])?,
                })
            }
            "SimLIFRate" => {
                arity(5)?;
                Ok(OpSpec::SimLIFRate {
                    index,
                    n: int(fields[2])?,
                    tau_rc: num(fields[3])?,
                    tau_ref: num(fields[4])?,
                    j: sig(fields[5])?,
                    out: sig(fields[6])?,
                })
            }
            "RectifiedLinear" => {
                arity(3)?;
                Ok(OpSpec::RectifiedLinear {
                    index,
                    n: int(fields[2])?,
                    j: sig(fields[3])?,
                    out: sig(fields[4])?,
                })
            }
            "Sigmoid" => {
                arity(4)?;
                Ok(OpSpec::Sigmoid {
                    index,
                    n: int(fields[2])?,
                    tau_ref: num(fields[3])?,
                    j: sig(fields[4])?,
                    out: sig(fields[5])?,
                })
            }
            "HostCallback" => {
                arity(3)?;
                let input = match fields[4].trim() {
                    "-" => None,
                    other => Some(other.parse()?),
                };
                Ok(OpSpec::HostCallback {
                    index,
                    output: sig(fields[2])?,
                    want_time: int(fields[3])? != 0,
                    input,
                })
            }
            "MPISend" | "MPIRecv" => {
                arity(3)?;
                let peer = int(fields[2])?;
                let tag = fields[3]
                    .trim()
                    .parse()
                    .map_err(|_| BuildError::BadSpec(format!("tag '{}' in {kind}", fields[3])))?;
                let content = sig(fields[4])?;
                Ok(if kind == "MPISend" {
                    OpSpec::MpiSend {
                        index,
                        dst: peer,
                        tag,
                        content,
                    }
                } else {
                    OpSpec::MpiRecv {
                        index,
                        src: peer,
                        tag,
                        content,
                    }
                })
            }
            other => Err(BuildError::UnknownOpKind(other.to_string())),
        }
    }
}

/// A scheduled operator: execution-order key plus behavior.
pub struct Operator {
    pub index: f64,
    pub(crate) seq: u64,
    pub(crate) kind: OpKind,
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind.name(), self.index)
    }
}

impl Operator {
    pub(crate) fn new(index: f64, seq: u64, kind: OpKind) -> Self {
        Self { index, seq, kind }
    }

    /// Execute one step.
    pub(crate) fn step(
        &mut self,
        store: &mut SignalStore,
        comm: Option<&mut CommEndpoint>,
        ctx: &StepContext,
    ) -> StepResult<()> {
        self.kind.step(store, comm, ctx)
    }

    /// Discard per-run state: filter histories, neuron voltages, in-flight
    /// communication. Called on reset.
    pub(crate) fn reset_state(&mut self) {
        self.kind.reset_state();
    }
}

/// Closed set of operator behaviors. Concrete variants hold the resolved
/// views they read/write plus any per-run state and scratch buffers.
pub(crate) enum OpKind {
    Reset {
        dst: ResolvedView,
        value: f64,
    },
    Copy {
        dst: ResolvedView,
        src: ResolvedView,
        buf: Vec<f64>,
    },
    DotInc {
        a: ResolvedView,
        x: ResolvedView,
        y: ResolvedView,
        a_buf: Vec<f64>,
        x_buf: Vec<f64>,
        y_buf: Vec<f64>,
    },
    ScalarDotInc {
        a: ResolvedView,
        x: ResolvedView,
        y: ResolvedView,
        x_buf: Vec<f64>,
    },
    ElementwiseInc {
        a: ResolvedView,
        x: ResolvedView,
        y: ResolvedView,
        a_buf: Vec<f64>,
        x_buf: Vec<f64>,
        y_buf: Vec<f64>,
    },
    ProdUpdate {
        a: ResolvedView,
        x: ResolvedView,
        b: ResolvedView,
        y: ResolvedView,
        a_buf: Vec<f64>,
        x_buf: Vec<f64>,
        b_buf: Vec<f64>,
        y_buf: Vec<f64>,
    },
    ScalarProdUpdate {
        a: ResolvedView,
        x: ResolvedView,
        b: ResolvedView,
        y: ResolvedView,
        x_buf: Vec<f64>,
        b_buf: Vec<f64>,
        y_buf: Vec<f64>,
    },
    Filter {
        input: ResolvedView,
        output: ResolvedView,
        numer: Vec<f64>,
        denom: Vec<f64>,
        // Per-element input/output histories, most recent first, laid out
        // `n * numer.len()` and `n * denom.len()` respectively.
        x_hist: Vec<f64>,
        y_hist: Vec<f64>,
        in_buf: Vec<f64>,
        out_buf: Vec<f64>,
    },
    SimLif {
        tau_rc: f64,
        tau_ref: f64,
        dt: f64,
        j: ResolvedView,
        out: ResolvedView,
        voltage: Vec<f64>,
        ref_time: Vec<f64>,
        j_buf: Vec<f64>,
        out_buf: Vec<f64>,
    },
    SimLifRate {
        tau_rc: f64,
        tau_ref: f64,
        j: ResolvedView,
        out: ResolvedView,
        j_buf: Vec<f64>,
        out_buf: Vec<f64>,
    },
    RectifiedLinear {
        j: ResolvedView,
        out: ResolvedView,
        buf: Vec<f64>,
    },
    Sigmoid {
        tau_ref: f64,
        j: ResolvedView,
        out: ResolvedView,
        buf: Vec<f64>,
    },
    HostCallback {
        output_key: Key,
        output: ResolvedView,
        want_time: bool,
        input: Option<ResolvedView>,
        in_buf: Vec<f64>,
        handle: CallbackFn,
    },
    MpiSend(MpiSend),
    MpiRecv(MpiRecv),
    MergedSend(MergedSend),
    MergedRecv(MergedRecv),
    Barrier(MpiBarrier),
}

impl OpKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            OpKind::Reset { .. } => "Reset",
            OpKind::Copy { .. } => "Copy",
            OpKind::DotInc { .. } => "DotInc",
            OpKind::ScalarDotInc { .. } => "ScalarDotInc",
            OpKind::ElementwiseInc { .. } => "ElementwiseInc",
            OpKind::ProdUpdate { .. } => "ProdUpdate",
            OpKind::ScalarProdUpdate { .. } => "ScalarProdUpdate",
            OpKind::Filter { .. } => "Filter",
            OpKind::SimLif { .. } => "SimLIF",
            OpKind::SimLifRate { .. } => "SimLIFRate",
            OpKind::RectifiedLinear { .. } => "RectifiedLinear",
            OpKind::Sigmoid { .. } => "Sigmoid",
            OpKind::HostCallback { .. } => "HostCallback",
            OpKind::MpiSend(_) => "MPISend",
            OpKind::MpiRecv(_) => "MPIRecv",
            OpKind::MergedSend(_) => "MergedSend",
            OpKind::MergedRecv(_) => "MergedRecv",
            OpKind::Barrier(_) => "MPIBarrier",
        }
    }

    pub(crate) fn is_comm(&self) -> bool {
        matches!(
            self,
            OpKind::MpiSend(_)
                | OpKind::MpiRecv(_)
                | OpKind::MergedSend(_)
                | OpKind::MergedRecv(_)
                | OpKind::Barrier(_)
        )
    }

    fn step(
        &mut self,
        store: &mut SignalStore,
        comm: Option<&mut CommEndpoint>,
        ctx: &StepContext,
    ) -> StepResult<()> {
        match self {
            OpKind::Reset { dst, value } => {
                store.fill(dst, *value);
                Ok(())
            }
            OpKind::Copy { dst, src, buf } => {
                store.gather_into(src, buf);
                store.scatter(dst, buf);
                Ok(())
            }
            OpKind::DotInc {
                a,
                x,
                y,
                a_buf,
                x_buf,
                y_buf,
            } => {
                store.gather_into(a, a_buf);
                store.gather_into(x, x_buf);
                let (m, n) = a.shape();
                for i in 0..m {
                    let mut acc = 0.0;
                    for j in 0..n {
                        acc += a_buf[i * n + j] * x_buf[j];
                    }
                    y_buf[i] = acc;
                }
                store.add_assign(y, y_buf);
                Ok(())
            }
            OpKind::ScalarDotInc { a, x, y, x_buf } => {
                store.gather_into(x, x_buf);
                let scale = store.gather_vec(a)[0];
                for v in x_buf.iter_mut() {
                    *v *= scale;
                }
                store.add_assign(y, x_buf);
                Ok(())
            }
            OpKind::ElementwiseInc {
                a,
                x,
                y,
                a_buf,
                x_buf,
                y_buf,
            } => {
                store.gather_into(a, a_buf);
                store.gather_into(x, x_buf);
                let (ra, ca) = a.shape();
                let (rx, cx) = x.shape();
                let (ry, cy) = y.shape();
                let mut n = 0;
                for i in 0..ry {
                    for j in 0..cy {
                        let av = a_buf[broadcast_index(i, j, ra, ca)];
                        let xv = x_buf[broadcast_index(i, j, rx, cx)];
                        y_buf[n] = av * xv;
                        n += 1;
                    }
                }
                store.add_assign(y, y_buf);
                Ok(())
            }
            OpKind::ProdUpdate {
                a,
                x,
                b,
                y,
                a_buf,
                x_buf,
                b_buf,
                y_buf,
            } => {
                store.gather_into(a, a_buf);
                store.gather_into(x, x_buf);
                store.gather_into(b, b_buf);
                store.gather_into(y, y_buf);
                let (m, n) = a.shape();
                for i in 0..m {
                    let mut acc = 0.0;
                    for j in 0..n {
                        acc += a_buf[i * n + j] * x_buf[j];
                    }
                    let scale = if b_buf.len() == 1 { b_buf[0] } else { b_buf[i] };
                    y_buf[i] = scale * y_buf[i] + acc;
                }
                store.scatter(y, y_buf);
                Ok(())
            }
            OpKind::ScalarProdUpdate {
                a,
                x,
                b,
                y,
                x_buf,
                b_buf,
                y_buf,
            } => {
                store.gather_into(x, x_buf);
                store.gather_into(b, b_buf);
                store.gather_into(y, y_buf);
                let scale_a = store.gather_vec(a)[0];
                for i in 0..y_buf.len() {
                    let scale_b = if b_buf.len() == 1 { b_buf[0] } else { b_buf[i] };
                    y_buf[i] = scale_b * y_buf[i] + scale_a * x_buf[i];
                }
                store.scatter(y, y_buf);
                Ok(())
            }
            OpKind::Filter {
                input,
                output,
                numer,
                denom,
                x_hist,
                y_hist,
                in_buf,
                out_buf,
            } => {
                store.gather_into(input, in_buf);
                let nl = numer.len();
                let dl = denom.len();
                for (i, (&xi, out)) in in_buf.iter().zip(out_buf.iter_mut()).enumerate() {
                    let xs = &mut x_hist[i * nl..(i + 1) * nl];
                    if nl > 0 {
                        xs.rotate_right(1);
                        xs[0] = xi;
                    }
                    let mut y = 0.0;
                    for k in 0..nl {
                        y += numer[k] * xs[k];
                    }
                    let ys = &mut y_hist[i * dl..(i + 1) * dl];
                    for k in 0..dl {
                        y -= denom[k] * ys[k];
                    }
                    if dl > 0 {
                        ys.rotate_right(1);
                        ys[0] = y;
                    }
                    *out = y;
                }
                store.scatter(output, out_buf);
                Ok(())
            }
            OpKind::SimLif {
                tau_rc,
                tau_ref,
                dt,
                j,
                out,
                voltage,
                ref_time,
                j_buf,
                out_buf,
            } => {
                store.gather_into(j, j_buf);
                let dt = *dt;
                for i in 0..j_buf.len() {
                    let dv = dt / *tau_rc * (j_buf[i] - voltage[i]);
                    let mut v = (voltage[i] + dv).max(0.0);
                    ref_time[i] -= dt;
                    v *= (1.0 - ref_time[i] / dt).clamp(0.0, 1.0);
                    if v >= 1.0 {
                        out_buf[i] = 1.0 / dt;
                        let overshoot = if dv != 0.0 { (v - 1.0) / dv } else { 0.0 };
                        ref_time[i] = *tau_ref + dt * (1.0 - overshoot);
                        v = 0.0;
                    } else {
                        out_buf[i] = 0.0;
                    }
                    voltage[i] = v;
                }
                store.scatter(out, out_buf);
                Ok(())
            }
            OpKind::SimLifRate {
                tau_rc,
                tau_ref,
                j,
                out,
                j_buf,
                out_buf,
            } => {
                store.gather_into(j, j_buf);
                for (ji, out) in j_buf.iter().zip(out_buf.iter_mut()) {
                    *out = if *ji > 1.0 {
                        1.0 / (*tau_ref + *tau_rc * (1.0 + 1.0 / (ji - 1.0)).ln())
                    } else {
                        0.0
                    };
                }
                store.scatter(out, out_buf);
                Ok(())
            }
            OpKind::RectifiedLinear { j, out, buf } => {
                store.gather_into(j, buf);
                for v in buf.iter_mut() {
                    *v = v.max(0.0);
                }
                store.scatter(out, buf);
                Ok(())
            }
            OpKind::Sigmoid {
                tau_ref,
                j,
                out,
                buf,
            } => {
                store.gather_into(j, buf);
                for v in buf.iter_mut() {
                    *v = 1.0 / (*tau_ref * (1.0 + (-*v).exp()));
                }
                store.scatter(out, buf);
                Ok(())
            }
            OpKind::HostCallback {
                output_key,
                output,
                want_time,
                input,
                in_buf,
                handle,
            } => {
                let time = want_time.then_some(ctx.time);
                let input = match input {
                    Some(view) => {
                        store.gather_into(view, in_buf);
                        Some(in_buf.as_slice())
                    }
                    None => None,
                };
                let result = handle(time, input);
                if result.len() != output.len() {
                    return Err(StepError::CallbackShape {
                        key: *output_key,
                        expected: output.len(),
                        got: result.len(),
                    });
                }
                store.scatter(output, &result);
                Ok(())
            }
            OpKind::MpiSend(op) => op.step(store, expect_comm(comm)?),
            OpKind::MpiRecv(op) => op.step(store, expect_comm(comm)?),
            OpKind::MergedSend(op) => op.step(store, expect_comm(comm)?),
            OpKind::MergedRecv(op) => op.step(store, expect_comm(comm)?),
            OpKind::Barrier(op) => {
                op.step(expect_comm(comm)?);
                Ok(())
            }
        }
    }

    /// Complete any outstanding exchange after the last step of a run.
    pub(crate) fn complete(&mut self, comm: Option<&mut CommEndpoint>) -> StepResult<()> {
        match self {
            OpKind::MpiRecv(op) => op.complete(expect_comm(comm)?),
            OpKind::MergedRecv(op) => op.complete(expect_comm(comm)?),
            _ => Ok(()),
        }
    }

    fn reset_state(&mut self) {
        match self {
            OpKind::Filter { x_hist, y_hist, .. } => {
                x_hist.fill(0.0);
                y_hist.fill(0.0);
            }
            OpKind::SimLif {
                voltage, ref_time, ..
            } => {
                voltage.fill(0.0);
                ref_time.fill(0.0);
            }
            OpKind::MpiRecv(op) => op.rearm(),
            OpKind::MergedRecv(op) => op.rearm(),
            OpKind::Barrier(op) => op.rearm(),
            _ => {}
        }
    }
}

fn expect_comm<'a>(comm: Option<&'a mut CommEndpoint>) -> StepResult<&'a mut CommEndpoint> {
    comm.ok_or_else(|| StepError::CommFailure("no communicator bound".into()))
}

/// Flat index into a row-major buffer of shape `(rows, cols)` with size-1
/// dimensions broadcast.
fn broadcast_index(i: usize, j: usize, rows: usize, cols: usize) -> usize {
    let bi = if rows == 1 { 0 } else { i };
    let bj = if cols == 1 { 0 } else { j };
    bi * cols + bj
}

/// Build the `OpKind` for a compute spec, resolving and validating its views.
/// Communication and callback kinds are assembled by the chunk instead.
pub(crate) fn build_compute(spec: &OpSpec, store: &SignalStore) -> BuildResult<Option<OpKind>> {
    let mismatch = |message: String| BuildError::ShapeMismatch {
        context: spec.kind_name().to_string(),
        message,
    };

    match spec {
        OpSpec::Reset { dst, value, .. } => Ok(Some(OpKind::Reset {
            dst: store.resolve(dst)?,
            value: *value,
        })),
        OpSpec::Copy { dst, src, .. } => {
            let dst = store.resolve(dst)?;
            let src = store.resolve(src)?;
            if dst.len() != src.len() {
                return Err(mismatch(format!(
                    "dst has {} elements, src has {}",
                    dst.len(),
                    src.len()
                )));
            }
            let buf = vec![0.0; src.len()];
            Ok(Some(OpKind::Copy { dst, src, buf }))
        }
        OpSpec::DotInc { a, x, y, .. } => {
            let a = store.resolve(a)?;
            let x = store.resolve(x)?;
            let y = store.resolve(y)?;
            let (m, n) = a.shape();
            if x.len() != n || y.len() != m {
                return Err(mismatch(format!(
                    "A is {m}x{n}, X has {} elements, Y has {}",
                    x.len(),
                    y.len()
                )));
            }
            Ok(Some(OpKind::DotInc {
                a,
                x,
                y,
                a_buf: vec![0.0; m * n],
                x_buf: vec![0.0; n],
                y_buf: vec![0.0; m],
            }))
        }
        OpSpec::ScalarDotInc { a, x, y, .. } => {
            let a = store.resolve(a)?;
            let x = store.resolve(x)?;
            let y = store.resolve(y)?;
            if a.len() != 1 {
                return Err(mismatch(format!("A has {} elements, expected 1", a.len())));
            }
            if x.len() != y.len() {
                return Err(mismatch(format!(
                    "X has {} elements, Y has {}",
                    x.len(),
                    y.len()
                )));
            }
            Ok(Some(OpKind::ScalarDotInc {
                a,
                x,
                x_buf: vec![0.0; x.len()],
                y,
            }))
        }
        OpSpec::ElementwiseInc { a, x, y, .. } => {
            let a = store.resolve(a)?;
            let x = store.resolve(x)?;
            let y = store.resolve(y)?;
            let (ra, ca) = a.shape();
            let (rx, cx) = x.shape();
            let (ry, cy) = y.shape();
            let rows_ok = |r: usize| r == 1 || r == ry;
            let cols_ok = |c: usize| c == 1 || c == cy;
            if !rows_ok(ra) || !cols_ok(ca) || !rows_ok(rx) || !cols_ok(cx) {
                return Err(mismatch(format!(
                    "cannot broadcast {ra}x{ca} * {rx}x{cx} into {ry}x{cy}"
                )));
            }
            Ok(Some(OpKind::ElementwiseInc {
                a_buf: vec![0.0; a.len()],
                x_buf: vec![0.0; x.len()],
                y_buf: vec![0.0; y.len()],
                a,
                x,
                y,
            }))
        }
        OpSpec::ProdUpdate { a, x, b, y, .. } => {
            let a = store.resolve(a)?;
            let x = store.resolve(x)?;
            let b = store.resolve(b)?;
            let y = store.resolve(y)?;
            let (m, n) = a.shape();
            if x.len() != n || y.len() != m {
                return Err(mismatch(format!(
                    "A is {m}x{n}, X has {} elements, Y has {}",
                    x.len(),
                    y.len()
                )));
            }
            if b.len() != 1 && b.len() != y.len() {
                return Err(mismatch(format!(
                    "B has {} elements, expected 1 or {}",
                    b.len(),
                    y.len()
                )));
            }
            Ok(Some(OpKind::ProdUpdate {
                a_buf: vec![0.0; a.len()],
                x_buf: vec![0.0; x.len()],
                b_buf: vec![0.0; b.len()],
                y_buf: vec![0.0; y.len()],
                a,
                x,
                b,
                y,
            }))
        }
        OpSpec::ScalarProdUpdate { a, x, b, y, .. } => {
            let a = store.resolve(a)?;
            let x = store.resolve(x)?;
            let b = store.resolve(b)?;
            let y = store.resolve(y)?;
            if a.len() != 1 {
                return Err(mismatch(format!("A has {} elements, expected 1", a.len())));
            }
            if x.len() != y.len() {
                return Err(mismatch(format!(
                    "X has {} elements, Y has {}",
                    x.len(),
                    y.len()
                )));
            }
            if b.len() != 1 && b.len() != y.len() {
                return Err(mismatch(format!(
                    "B has {} elements, expected 1 or {}",
                    b.len(),
                    y.len()
                )));
            }
            Ok(Some(OpKind::ScalarProdUpdate {
                x_buf: vec![0.0; x.len()],
                b_buf: vec![0.0; b.len()],
                y_buf: vec![0.0; y.len()],
                a,
                x,
                b,
                y,
            }))
        }
        OpSpec::Filter {
            input,
            output,
            numer,
            denom,
            ..
        } => {
            let input = store.resolve(input)?;
            let output = store.resolve(output)?;
            if input.len() != output.len() {
                return Err(mismatch(format!(
                    "input has {} elements, output has {}",
                    input.len(),
                    output.len()
                )));
            }
            let n = input.len();
            Ok(Some(OpKind::Filter {
                x_hist: vec![0.0; n * numer.len()],
                y_hist: vec![0.0; n * denom.len()],
                in_buf: vec![0.0; n],
                out_buf: vec![0.0; n],
                numer: numer.clone(),
                denom: denom.clone(),
                input,
                output,
            }))
        }
        OpSpec::SimLIF {
            n,
            tau_rc,
            tau_ref,
            dt,
            j,
            out,
            ..
        } => {
            let j = store.resolve(j)?;
            let out = store.resolve(out)?;
            if j.len() != *n || out.len() != *n {
                return Err(mismatch(format!(
                    "expected {n} neurons, J has {} elements, out has {}",
                    j.len(),
                    out.len()
                )));
            }
            Ok(Some(OpKind::SimLif {
                tau_rc: *tau_rc,
                tau_ref: *tau_ref,
                dt: *dt,
                voltage: vec![0.0; *n],
                ref_time: vec![0.0; *n],
                j_buf: vec![0.0; *n],
                out_buf: vec![0.0; *n],
                j,
                out,
            }))
        }
        OpSpec::SimLIFRate {
            n,
            tau_rc,
            tau_ref,
            j,
            out,
            ..
        } => {
            let j = store.resolve(j)?;
            let out = store.resolve(out)?;
            if j.len() != *n || out.len() != *n {
                return Err(mismatch(format!(
                    "expected {n} neurons, J has {} elements, out has {}",
                    j.len(),
                    out.len()
                )));
            }
            Ok(Some(OpKind::SimLifRate {
                tau_rc: *tau_rc,
                tau_ref: *tau_ref,
                j_buf: vec![0.0; *n],
                out_buf: vec![0.0; *n],
                j,
                out,
            }))
        }
        OpSpec::RectifiedLinear { n, j, out, .. } => {
            let j = store.resolve(j)?;
            let out = store.resolve(out)?;
            if j.len() != *n || out.len() != *n {
                return Err(mismatch(format!(
                    "expected {n} neurons, J has {} elements, out has {}",
                    j.len(),
                    out.len()
                )));
            }
            Ok(Some(OpKind::RectifiedLinear {
                buf: vec![0.0; *n],
                j,
                out,
            }))
        }
        OpSpec::Sigmoid {
            n, tau_ref, j, out, ..
        } => {
            let j = store.resolve(j)?;
            let out = store.resolve(out)?;
            if j.len() != *n || out.len() != *n {
                return Err(mismatch(format!(
                    "expected {n} neurons, J has {} elements, out has {}",
                    j.len(),
                    out.len()
                )));
            }
            Ok(Some(OpKind::Sigmoid {
                tau_ref: *tau_ref,
                buf: vec![0.0; *n],
                j,
                out,
            }))
        }
        OpSpec::HostCallback { .. } | OpSpec::MpiSend { .. } | OpSpec::MpiRecv { .. } => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalSpec;
    use crate::tensor::Tensor;

    fn ctx() -> StepContext {
        StepContext {
            time: 0.0,
            dt: 0.001,
        }
    }

    fn store() -> SignalStore {
        SignalStore::default()
    }

    fn add(store: &mut SignalStore, key: u64, t: Tensor) -> SignalSpec {
        store.add_base(Key(key), format!("s{key}"), t).unwrap();
        SignalSpec::full(Key(key))
    }

    fn op(spec: &OpSpec, store: &SignalStore) -> Operator {
        let kind = build_compute(spec, store).unwrap().unwrap();
        Operator::new(spec.index(), 0, kind)
    }

    #[test]
    fn test_reset_fills_value() {
        let mut s = store();
        let dst = add(&mut s, 1, Tensor::vector(&[0.0, 0.0, 0.0]));
        let mut reset = op(
            &OpSpec::Reset {
                index: 0.0,
                dst,
                value: 3.5,
            },
            &s,
        );
        reset.step(&mut s, None, &ctx()).unwrap();
        assert_eq!(s.tensor(Key(1)).unwrap().data(), &[3.5, 3.5, 3.5]);
    }

    #[test]
    fn test_dot_inc_literal() {
        let mut s = store();
        let a = add(&mut s, 1, Tensor::from_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]));
        let x = add(&mut s, 2, Tensor::vector(&[1.0, 1.0]));
        let y = add(&mut s, 3, Tensor::vector(&[0.0, 0.0]));
        let mut dot = op(&OpSpec::DotInc { index: 0.0, a, x, y }, &s);
        dot.step(&mut s, None, &ctx()).unwrap();
        assert_eq!(s.tensor(Key(3)).unwrap().data(), &[3.0, 7.0]);
    }

    #[test]
    fn test_dot_inc_accumulates() {
        let mut s = store();
        let a = add(&mut s, 1, Tensor::from_slice(1, 1, &[2.0]));
        let x = add(&mut s, 2, Tensor::vector(&[3.0]));
        let y = add(&mut s, 3, Tensor::vector(&[10.0]));
        let mut dot = op(&OpSpec::DotInc { index: 0.0, a, x, y }, &s);
        dot.step(&mut s, None, &ctx()).unwrap();
        assert_eq!(s.tensor(Key(3)).unwrap().data(), &[16.0]);
    }

    #[test]
    fn test_scalar_dot_inc_broadcasts() {
        let mut s = store();
        let a = add(&mut s, 1, Tensor::vector(&[2.0]));
        let x = add(&mut s, 2, Tensor::vector(&[1.0, 2.0, 3.0]));
        let y = add(&mut s, 3, Tensor::vector(&[0.0, 0.0, 1.0]));
        let mut dot = op(&OpSpec::ScalarDotInc { index: 0.0, a, x, y }, &s);
        dot.step(&mut s, None, &ctx()).unwrap();
        assert_eq!(s.tensor(Key(3)).unwrap().data(), &[2.0, 4.0, 7.0]);
    }

    #[test]
    fn test_elementwise_inc_broadcast_shapes() {
        // (M,1) * scalar, scalar * (M,1), (M,N) pairs, (M,1)x(1,N) outer.
        let cases: &[((usize, usize), (usize, usize), (usize, usize))] = &[
            ((3, 1), (1, 1), (3, 1)),
            ((1, 1), (3, 1), (3, 1)),
            ((3, 2), (3, 2), (3, 2)),
            ((3, 1), (1, 2), (3, 2)),
        ];
        for &((ra, ca), (rx, cx), (ry, cy)) in cases {
            let mut s = store();
            let a = add(&mut s, 1, Tensor::from_vec(ra, ca, vec![2.0; ra * ca]));
            let x = add(&mut s, 2, Tensor::from_vec(rx, cx, vec![3.0; rx * cx]));
            let y = add(&mut s, 3, Tensor::zeros(ry, cy));
            let mut ewi = op(&OpSpec::ElementwiseInc { index: 0.0, a, x, y }, &s);
            ewi.step(&mut s, None, &ctx()).unwrap();
            assert!(
                s.tensor(Key(3)).unwrap().data().iter().all(|&v| v == 6.0),
                "case {ra}x{ca} * {rx}x{cx}"
            );
        }
    }

    #[test]
    fn test_elementwise_inc_rejects_bad_broadcast() {
        let mut s = store();
        let a = add(&mut s, 1, Tensor::zeros(2, 1));
        let x = add(&mut s, 2, Tensor::zeros(3, 1));
        let y = add(&mut s, 3, Tensor::zeros(3, 1));
        let err = build_compute(&OpSpec::ElementwiseInc { index: 0.0, a, x, y }, &s);
        assert!(matches!(err, Err(BuildError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_prod_update() {
        // Y = B .* Y + A.X with B a vector.
        let mut s = store();
        let a = add(&mut s, 1, Tensor::from_slice(2, 1, &[1.0, 2.0]));
        let x = add(&mut s, 2, Tensor::vector(&[3.0]));
        let b = add(&mut s, 3, Tensor::vector(&[0.5, 0.0]));
        let y = add(&mut s, 4, Tensor::vector(&[10.0, 10.0]));
        let mut pu = op(&OpSpec::ProdUpdate { index: 0.0, a, x, b, y }, &s);
        pu.step(&mut s, None, &ctx()).unwrap();
        assert_eq!(s.tensor(Key(4)).unwrap().data(), &[8.0, 6.0]);
    }

    #[test]
    fn test_scalar_prod_update() {
        let mut s = store();
        let a = add(&mut s, 1, Tensor::vector(&[2.0]));
        let x = add(&mut s, 2, Tensor::vector(&[1.0, 1.0]));
        let b = add(&mut s, 3, Tensor::vector(&[0.0]));
        let y = add(&mut s, 4, Tensor::vector(&[5.0, 7.0]));
        let mut pu = op(&OpSpec::ScalarProdUpdate { index: 0.0, a, x, b, y }, &s);
        pu.step(&mut s, None, &ctx()).unwrap();
        assert_eq!(s.tensor(Key(4)).unwrap().data(), &[2.0, 2.0]);
    }

    #[test]
    fn test_lowpass_filter_converges() {
        // Discrete lowpass: y[t] = (1-a) x[t] + a y[t-1], a = exp(-dt/tau).
        let dt: f64 = 0.001;
        let tau: f64 = 0.05;
        let alpha: f64 = (-dt / tau).exp();

        let mut s = store();
        let input = add(&mut s, 1, Tensor::vector(&[1.0]));
        let output = add(&mut s, 2, Tensor::vector(&[0.0]));
        let mut filter = op(
            &OpSpec::Filter {
                index: 0.0,
                input,
                output,
                numer: vec![1.0 - alpha],
                denom: vec![-alpha],
            },
            &s,
        );

        let steps = 40;
        for _ in 0..steps {
            filter.step(&mut s, None, &ctx()).unwrap();
        }
        let expected = 1.0 - alpha.powi(steps);
        let got = s.tensor(Key(2)).unwrap().data()[0];
        assert!((got - expected).abs() < 1e-12, "got {got}, want {expected}");
    }

    #[test]
    fn test_filter_state_resets() {
        let mut s = store();
        let input = add(&mut s, 1, Tensor::vector(&[1.0]));
        let output = add(&mut s, 2, Tensor::vector(&[0.0]));
        let mut filter = op(
            &OpSpec::Filter {
                index: 0.0,
                input,
                output,
                numer: vec![0.5],
                denom: vec![-0.5],
            },
            &s,
        );
        filter.step(&mut s, None, &ctx()).unwrap();
        let first = s.tensor(Key(2)).unwrap().data()[0];
        filter.step(&mut s, None, &ctx()).unwrap();
        assert_ne!(s.tensor(Key(2)).unwrap().data()[0], first);

        filter.reset_state();
        filter.step(&mut s, None, &ctx()).unwrap();
        assert_eq!(s.tensor(Key(2)).unwrap().data()[0], first);
    }

    #[test]
    fn test_lif_fires_at_constant_drive() {
        let dt = 0.001;
        let mut s = store();
        let j = add(&mut s, 1, Tensor::vector(&[2.0]));
        let out = add(&mut s, 2, Tensor::vector(&[0.0]));
        let mut lif = op(
            &OpSpec::SimLIF {
                index: 0.0,
                n: 1,
                tau_rc: 0.02,
                tau_ref: 0.002,
                dt,
                j,
                out,
            },
            &s,
        );

        let mut spikes = 0;
        let mut zeros = 0;
        for _ in 0..50 {
            lif.step(&mut s, None, &ctx()).unwrap();
            let v = s.tensor(Key(2)).unwrap().data()[0];
            if v == 1.0 / dt {
                spikes += 1;
            } else if v == 0.0 {
                zeros += 1;
            } else {
                panic!("LIF output must be 0 or 1/dt, got {v}");
            }
        }
        assert!(spikes >= 1, "expected at least one spike in 50 steps");
        assert_eq!(spikes + zeros, 50);
    }

    #[test]
    fn test_lif_subthreshold_never_fires() {
        let mut s = store();
        let j = add(&mut s, 1, Tensor::vector(&[0.5]));
        let out = add(&mut s, 2, Tensor::vector(&[0.0]));
        let mut lif = op(
            &OpSpec::SimLIF {
                index: 0.0,
                n: 1,
                tau_rc: 0.02,
                tau_ref: 0.002,
                dt: 0.001,
                j,
                out,
            },
            &s,
        );
        for _ in 0..200 {
            lif.step(&mut s, None, &ctx()).unwrap();
            assert_eq!(s.tensor(Key(2)).unwrap().data()[0], 0.0);
        }
    }

    #[test]
    fn test_lif_rate_closed_form() {
        let tau_rc = 0.02;
        let tau_ref = 0.002;
        let mut s = store();
        let j = add(&mut s, 1, Tensor::vector(&[2.0, 0.5]));
        let out = add(&mut s, 2, Tensor::vector(&[0.0, 0.0]));
        let mut lif = op(
            &OpSpec::SimLIFRate {
                index: 0.0,
                n: 2,
                tau_rc,
                tau_ref,
                j,
                out,
            },
            &s,
        );
        lif.step(&mut s, None, &ctx()).unwrap();
        let expected = 1.0 / (tau_ref + tau_rc * 2.0_f64.ln());
        let got = s.tensor(Key(2)).unwrap().data().to_vec();
        assert!((got[0] - expected).abs() < 1e-12);
        assert_eq!(got[1], 0.0);
    }

    #[test]
    fn test_rectified_linear() {
        let mut s = store();
        let j = add(&mut s, 1, Tensor::vector(&[-1.0, 0.0, 2.5]));
        let out = add(&mut s, 2, Tensor::vector(&[9.0, 9.0, 9.0]));
        let mut relu = op(
            &OpSpec::RectifiedLinear {
                index: 0.0,
                n: 3,
                j,
                out,
            },
            &s,
        );
        relu.step(&mut s, None, &ctx()).unwrap();
        assert_eq!(s.tensor(Key(2)).unwrap().data(), &[0.0, 0.0, 2.5]);
    }

    #[test]
    fn test_sigmoid_at_zero() {
        let tau_ref = 0.002;
        let mut s = store();
        let j = add(&mut s, 1, Tensor::vector(&[0.0]));
        let out = add(&mut s, 2, Tensor::vector(&[0.0]));
        let mut sigmoid = op(
            &OpSpec::Sigmoid {
                index: 0.0,
                n: 1,
                tau_ref,
                j,
                out,
            },
            &s,
        );
        sigmoid.step(&mut s, None, &ctx()).unwrap();
        let got = s.tensor(Key(2)).unwrap().data()[0];
        assert!((got - 0.5 / tau_ref).abs() < 1e-9);
    }

    #[test]
    fn test_spec_wire_round_trip() {
        let specs = [
            "Reset;1;10;3.5",
            "Copy;2;10;11",
            "DotInc;2.5;1;2;3",
            "ProdUpdate;3;1;2;4;3",
            "Filter;4;1;2;0.5;-0.5",
            "SimLIF;5;50;0.02;0.002;0.001;20;21",
            "MPISend;6;1;7;30",
            "MPIRecv;0.5;1;7;31",
        ];
        for text in specs {
            let spec: OpSpec = text.parse().unwrap();
            let back: OpSpec = spec.to_string().parse().unwrap();
            assert_eq!(spec, back, "{text}");
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = "Convolve;1;2;3".parse::<OpSpec>();
        assert!(matches!(err, Err(BuildError::UnknownOpKind(k)) if k == "Convolve"));
    }

    #[test]
    fn test_bad_arity_rejected() {
        assert!(matches!(
            "Reset;1;10".parse::<OpSpec>(),
            Err(BuildError::BadSpec(_))
        ));
    }
}
