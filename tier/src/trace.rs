//! Running compiled traces, and leaving them.
//!
//! A *trace* is a straight-line sequence of micro-ops that the optimizer
//! recorded from a hot region of bytecode. Every micro-op either continues
//! to the next one or leaves the trace, and there are exactly three ways to
//! leave:
//!
//! - a guard fails and the trace *deoptimizes*: the interpreter resumes at
//!   the bytecode instruction the micro-op was recorded from;
//! - the trace reaches its designated *exit*, and the interpreter resumes at
//!   the exit's target;
//! - the micro-op *raises* an error, which has been recorded in the
//!   [`ExecState`]. The interpreter unwinds instead of resuming.
//!
//! Whichever way the trace is left, the operand stack pointer it was
//! running with is saved into the [`Frame`] first, so the interpreter picks
//! up a consistent stack.
use crate::{
    exec_state::{ExecError, ExecState, Raised},
    frame::{Frame, InstrPtr, StackPointer},
};
use core::fmt;

/// The longest trace the optimizer records, in micro-ops.
pub const MAX_TRACE_LENGTH: usize = 128;

/// A single micro-op.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct UopInstruction {
    /// What to do.
    pub opcode: u32,
    /// The micro-op's argument.
    pub oparg: u32,
    /// The index of the bytecode instruction this micro-op came from: where
    /// to resume if it deoptimizes or exits.
    pub target: u32,
    /// A cached operand (for example, a type version to guard on).
    pub operand: u64,
}

/// A recorded sequence of micro-ops.
#[derive(Clone, Eq, PartialEq)]
pub struct Trace {
    uops: Box<[UopInstruction]>,
}

/// Error returned by [`Trace::new`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TraceError {
    /// The trace had no micro-ops.
    #[error("a trace must contain at least one micro-op")]
    Empty,
    /// The trace had more than [`MAX_TRACE_LENGTH`] micro-ops.
    #[error("trace is {len} micro-ops long, but the limit is {MAX_TRACE_LENGTH}")]
    TooLong {
        /// How long the trace was.
        len: usize,
    },
}

/// What a micro-op did, as reported by the step function passed to
/// [`run_trace`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// Go on to the next micro-op.
    Continue,
    /// Go back to the start of the trace, after servicing pending calls.
    JumpToTop,
    /// A guard failed: resume the interpreter at the micro-op's `target`.
    Deoptimize,
    /// The trace is done: resume the interpreter at the micro-op's `target`.
    Exit,
    /// An error was raised and recorded in the [`ExecState`]. Pop `pop`
    /// values off the operand stack, then unwind.
    Error {
        /// How many values the failed micro-op leaves on the stack that must
        /// be discarded.
        pop: usize,
    },
    /// The micro-op read an unassigned local variable (the one in slot
    /// `oparg`). Raise the error for it, then unwind.
    UnboundLocal,
}

// === impl Trace ===

impl Trace {
    /// Returns a new trace.
    pub fn new(uops: impl Into<Box<[UopInstruction]>>) -> Result<Self, TraceError> {
        let uops = uops.into();
        match uops.len() {
            0 => Err(TraceError::Empty),
            len if len > MAX_TRACE_LENGTH => Err(TraceError::TooLong { len }),
            _ => Ok(Self { uops }),
        }
    }

    /// Returns the trace's micro-ops.
    #[must_use]
    pub fn uops(&self) -> &[UopInstruction] {
        &self.uops
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("len", &self.uops.len())
            .field("uops", &self.uops)
            .finish()
    }
}

/// Runs `trace` on `frame`, returning where the interpreter resumes.
///
/// `sp` is the operand stack pointer to start from; `step` executes one
/// micro-op. Returns:
///
/// - `Ok(ip)` if the trace deoptimized or exited, where `ip` is the bytecode
///   instruction to resume at;
/// - `Err(Raised)` if a micro-op raised, in which case the error is recorded
///   in `tstate`.
///
/// In every case, the stack pointer is saved into `frame` before returning.
///
/// A trace whose last micro-op continues, or a micro-op whose `target` is
/// outside the frame's code object, is a fatal error.
pub fn run_trace<V, F>(
    trace: &Trace,
    frame: &mut Frame<V>,
    mut sp: StackPointer,
    tstate: &ExecState,
    mut step: F,
) -> Result<InstrPtr, Raised>
where
    F: FnMut(&UopInstruction, &mut Frame<V>, &mut StackPointer, &ExecState) -> Step,
{
    let mut pc = 0;
    loop {
        let Some(uop) = trace.uops.get(pc) else {
            hyphae::fatal::fatal_error(format_args!(
                "ran off the end of a {}-micro-op trace in {}",
                trace.uops.len(),
                frame.code().name()
            ));
        };

        match step(uop, frame, &mut sp, tstate) {
            Step::Continue => pc += 1,
            Step::JumpToTop => {
                if let Err(raised) = tstate.check_eval_breaker() {
                    frame.set_stack_pointer(sp);
                    tracing::trace!(code = frame.code().name(), "trace: interrupted");
                    return Err(raised);
                }
                pc = 0;
            }
            Step::Deoptimize => {
                let ip = resume_at(frame, sp, uop);
                tracing::trace!(code = frame.code().name(), %ip, pc, "trace: deoptimized");
                return Ok(ip);
            }
            Step::Exit => {
                let ip = resume_at(frame, sp, uop);
                tracing::trace!(code = frame.code().name(), %ip, pc, "trace: exited");
                return Ok(ip);
            }
            Step::Error { pop } => return Err(error_exit(frame, sp, pop, tstate)),
            Step::UnboundLocal => {
                let name = frame
                    .code()
                    .local_name(uop.oparg as usize)
                    .unwrap_or("<unknown>")
                    .to_owned();
                let _ = tstate.raise(ExecError::UnboundLocal { name });
                return Err(error_exit(frame, sp, 0, tstate));
            }
        }
    }
}

fn resume_at<V>(frame: &mut Frame<V>, sp: StackPointer, uop: &UopInstruction) -> InstrPtr {
    frame.set_stack_pointer(sp);
    frame.code().instr(uop.target as usize).unwrap_or_else(|| {
        hyphae::fatal::fatal_error(format_args!(
            "micro-op {uop:?} targets instruction {}, but {} has only {}",
            uop.target,
            frame.code().name(),
            frame.code().code().len()
        ))
    })
}

fn error_exit<V>(
    frame: &mut Frame<V>,
    mut sp: StackPointer,
    pop: usize,
    tstate: &ExecState,
) -> Raised {
    sp.shrink(pop);
    frame.set_stack_pointer(sp);
    if !tstate.has_error() {
        tracing::warn!(code = frame.code().name(), "trace: error exit without an error");
        return tstate.raise(ExecError::System(
            "error return without exception set".to_owned(),
        ));
    }
    tracing::trace!(code = frame.code().name(), pop, "trace: raised");
    Raised::new()
}

#[cfg(all(test, not(loom)))]
mod tests;
