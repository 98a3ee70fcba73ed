//! The boundary between compiled traces and the bytecode interpreter.
//!
//! The optimizer turns hot bytecode into *traces* of micro-ops, which run
//! until a guard fails, the trace reaches its exit, or an error is raised.
//! This crate defines what happens at that boundary: where the interpreter
//! resumes ([`run_trace`]), what state the frame is left in
//! ([`Frame`]), and where a raised error goes ([`ExecState`]).
//!
//! An [`ExecState`] also implements [`hyphae::ThreadState`], so a thread
//! that blocks on one of `hyphae`'s locks can let go of the global
//! interpreter lock, and can be interrupted by [pending calls].
//!
//! [pending calls]: exec_state::PendingCalls
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub mod exec_state;
pub mod frame;
pub mod trace;

#[doc(inline)]
pub use self::exec_state::{ExecError, ExecState, Raised};
#[doc(inline)]
pub use self::frame::{CodeObject, CodeUnit, Frame, InstrPtr, StackPointer};
#[doc(inline)]
pub use self::trace::{run_trace, Step, Trace, TraceError, UopInstruction};
