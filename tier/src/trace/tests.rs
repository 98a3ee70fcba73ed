use super::*;
use crate::frame::{CodeObject, CodeUnit};
use proptest::prelude::*;
use std::sync::Arc;

const PUSH: u32 = 1;
const ADD: u32 = 2;
const GUARD_TOP_IS: u32 = 3;
const EXIT: u32 = 4;
const RAISE: u32 = 5;
const LOAD_UNBOUND: u32 = 6;
const JUMP_TO_TOP: u32 = 7;
const RAISE_QUIETLY: u32 = 8;

fn uop(opcode: u32, oparg: u32, target: u32, operand: u64) -> UopInstruction {
    UopInstruction {
        opcode,
        oparg,
        target,
        operand,
    }
}

fn frame() -> Frame<u64> {
    let code = (0..10)
        .map(|opcode| CodeUnit { opcode, oparg: 0 })
        .collect();
    let code = CodeObject::new("test", code, vec!["a".into(), "b".into()], 16);
    Frame::new(Arc::new(code))
}

/// A tiny interpreter for the micro-ops above.
fn step(
    uop: &UopInstruction,
    frame: &mut Frame<u64>,
    sp: &mut StackPointer,
    tstate: &ExecState,
) -> Step {
    match uop.opcode {
        PUSH => {
            frame.push(sp, uop.operand);
            Step::Continue
        }
        ADD => {
            let (Some(b), Some(a)) = (frame.pop(sp), frame.pop(sp)) else {
                let _ = tstate.raise(ExecError::System("stack underflow".into()));
                return Step::Error { pop: 0 };
            };
            frame.push(sp, a + b);
            Step::Continue
        }
        GUARD_TOP_IS => {
            if frame.peek(*sp, 1) == Some(&uop.operand) {
                Step::Continue
            } else {
                Step::Deoptimize
            }
        }
        EXIT => Step::Exit,
        RAISE => {
            let _ = tstate.raise(ExecError::Other("boom".into()));
            Step::Error {
                pop: uop.oparg as usize,
            }
        }
        LOAD_UNBOUND => Step::UnboundLocal,
        JUMP_TO_TOP => Step::JumpToTop,
        RAISE_QUIETLY => Step::Error { pop: 0 },
        opcode => panic!("unknown opcode {opcode}"),
    }
}

fn run(
    uops: Vec<UopInstruction>,
    frame: &mut Frame<u64>,
    tstate: &ExecState,
) -> Result<InstrPtr, Raised> {
    let trace = Trace::new(uops).expect("valid trace");
    let sp = frame.stack_pointer();
    run_trace(&trace, frame, sp, tstate, step)
}

#[test]
fn exit_resumes_at_target() {
    let tstate = ExecState::new();
    let mut frame = frame();
    let ip = run(
        vec![
            uop(PUSH, 0, 0, 2),
            uop(PUSH, 0, 0, 3),
            uop(ADD, 0, 1, 0),
            uop(EXIT, 0, 7, 0),
        ],
        &mut frame,
        &tstate,
    );

    assert_eq!(ip.map(InstrPtr::index), Ok(7));
    assert_eq!(frame.stack(), &[5]);
    assert_eq!(frame.stack_pointer().depth(), 1);
    assert!(!tstate.has_error());
}

#[test]
fn failed_guard_deoptimizes() {
    let tstate = ExecState::new();
    let mut frame = frame();
    let ip = run(
        vec![
            uop(PUSH, 0, 0, 1),
            uop(GUARD_TOP_IS, 0, 3, 2),
            uop(PUSH, 0, 4, 10),
            uop(EXIT, 0, 9, 0),
        ],
        &mut frame,
        &tstate,
    );

    assert_eq!(ip.map(InstrPtr::index), Ok(3));
    // the stack is as it was when the guard failed.
    assert_eq!(frame.stack(), &[1]);
    assert!(!tstate.has_error());
}

#[test]
fn error_pops_and_records() {
    let tstate = ExecState::new();
    let mut frame = frame();
    let result = run(
        vec![
            uop(PUSH, 0, 0, 1),
            uop(PUSH, 0, 0, 2),
            uop(PUSH, 0, 0, 3),
            uop(RAISE, 2, 5, 0),
        ],
        &mut frame,
        &tstate,
    );

    assert_eq!(result, Err(Raised::new()));
    assert_eq!(frame.stack(), &[1]);
    assert_eq!(tstate.take_error(), Some(ExecError::Other("boom".into())));
}

#[test]
fn unbound_local_names_the_variable() {
    let tstate = ExecState::new();
    let mut frame = frame();
    let result = run(vec![uop(LOAD_UNBOUND, 1, 0, 0)], &mut frame, &tstate);

    assert!(result.is_err());
    let error = tstate.take_error().expect("an error is recorded");
    assert_eq!(error, ExecError::UnboundLocal { name: "b".into() });
    assert_eq!(
        error.to_string(),
        "cannot access local variable 'b' where it is not associated with a value"
    );
}

#[test]
fn error_without_an_error_is_a_system_error() {
    let tstate = ExecState::new();
    let mut frame = frame();
    let result = run(vec![uop(RAISE_QUIETLY, 0, 0, 0)], &mut frame, &tstate);

    assert!(result.is_err());
    assert!(matches!(tstate.take_error(), Some(ExecError::System(_))));
}

#[test]
fn jump_to_top_services_pending_calls() {
    let tstate = ExecState::new();
    let pending = tstate.pending_calls();
    let mut frame = frame();
    let mut iterations = 0;

    let trace = Trace::new(vec![uop(PUSH, 0, 0, 1), uop(JUMP_TO_TOP, 0, 0, 0)]).unwrap();
    let sp = frame.stack_pointer();
    let result = run_trace(&trace, &mut frame, sp, &tstate, |uop, frame, sp, tstate| {
        if uop.opcode == JUMP_TO_TOP {
            iterations += 1;
            if iterations == 3 {
                pending.add(|| Err(ExecError::Interrupted));
            }
        }
        step(uop, frame, sp, tstate)
    });

    assert_eq!(result, Err(Raised::new()));
    assert_eq!(iterations, 3);
    assert_eq!(tstate.take_error(), Some(ExecError::Interrupted));
    // every iteration's push is still on the stack.
    assert_eq!(frame.stack(), &[1, 1, 1]);
}

#[test]
fn trace_length_is_bounded() {
    assert_eq!(Trace::new(Vec::new()), Err(TraceError::Empty));

    let uops = vec![uop(EXIT, 0, 0, 0); MAX_TRACE_LENGTH];
    assert!(Trace::new(uops).is_ok());

    let uops = vec![uop(EXIT, 0, 0, 0); MAX_TRACE_LENGTH + 1];
    assert_eq!(
        Trace::new(uops),
        Err(TraceError::TooLong {
            len: MAX_TRACE_LENGTH + 1
        })
    );
}

proptest! {
    /// However a trace leaves, the frame's stack pointer is the one the
    /// trace was running with, less whatever an error popped.
    #[test]
    fn stack_pointer_is_saved_on_every_exit(
        pushes in 0usize..12,
        exit in prop_oneof![
            Just(EXIT),
            Just(GUARD_TOP_IS),
            Just(RAISE),
            Just(LOAD_UNBOUND),
        ],
        pop in 0u32..4,
    ) {
        let tstate = ExecState::new();
        let mut frame = frame();
        let mut uops = (0..pushes)
            .map(|i| uop(PUSH, 0, 0, i as u64))
            .collect::<Vec<_>>();
        // the guard always fails: nothing pushed is `u64::MAX`.
        uops.push(uop(exit, pop, 2, u64::MAX));

        let result = run(uops, &mut frame, &tstate);
        let expected_depth = match exit {
            RAISE => pushes.saturating_sub(pop as usize),
            _ => pushes,
        };

        prop_assert_eq!(frame.stack_pointer().depth(), expected_depth);
        prop_assert_eq!(frame.stack().len(), expected_depth);
        match exit {
            EXIT | GUARD_TOP_IS => {
                prop_assert_eq!(result.map(InstrPtr::index), Ok(2));
                prop_assert!(!tstate.has_error());
            }
            _ => {
                prop_assert!(result.is_err());
                prop_assert!(tstate.has_error());
            }
        }
    }
}
