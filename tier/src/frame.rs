//! Code objects, interpreter frames and the operand stack.
use std::{fmt, sync::Arc};

/// One instruction of a code object's bytecode.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CodeUnit {
    /// The instruction's opcode.
    pub opcode: u8,
    /// The instruction's argument.
    pub oparg: u8,
}

/// A compiled function body: bytecode, plus what is needed to describe it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodeObject {
    name: String,
    code: Vec<CodeUnit>,
    local_names: Vec<String>,
    stack_size: usize,
}

/// The address of an instruction within a [`CodeObject`].
///
/// This is where the interpreter resumes after a compiled trace exits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct InstrPtr(usize);

/// A cursor into a frame's operand stack.
///
/// The live values are the bottom `depth` slots of the stack. A running
/// trace keeps its own cursor and only stores it back into the [`Frame`]
/// when it exits.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct StackPointer(usize);

/// An interpreter frame: a code object, its operand stack, and the stack
/// pointer last saved into it.
pub struct Frame<V> {
    code: Arc<CodeObject>,
    stack: Vec<V>,
    stack_pointer: StackPointer,
}

// === impl CodeObject ===

impl CodeObject {
    /// Returns a new code object.
    ///
    /// `stack_size` is the deepest the operand stack may grow while running
    /// it.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        code: Vec<CodeUnit>,
        local_names: Vec<String>,
        stack_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            code,
            local_names,
            stack_size,
        }
    }

    /// Returns the code object's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the bytecode.
    #[must_use]
    pub fn code(&self) -> &[CodeUnit] {
        &self.code
    }

    /// Returns the address of the instruction at `index`, if there is one.
    #[must_use]
    pub fn instr(&self, index: usize) -> Option<InstrPtr> {
        (index < self.code.len()).then_some(InstrPtr(index))
    }

    /// Returns the instruction at `ip`.
    #[must_use]
    pub fn get(&self, ip: InstrPtr) -> Option<&CodeUnit> {
        self.code.get(ip.0)
    }

    /// Returns the name of the local variable in slot `index`.
    #[must_use]
    pub fn local_name(&self, index: usize) -> Option<&str> {
        self.local_names.get(index).map(String::as_str)
    }

    /// Returns the maximum depth of the operand stack.
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}

// === impl InstrPtr ===

impl InstrPtr {
    /// Returns the index of the instruction within its code object.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstrPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

// === impl StackPointer ===

impl StackPointer {
    /// Returns the number of live values below the cursor.
    #[inline]
    #[must_use]
    pub const fn depth(self) -> usize {
        self.0
    }

    /// Moves the cursor down by `n` slots, discarding the values above it.
    ///
    /// Shrinking past the bottom of the stack stops at the bottom.
    #[inline]
    pub fn shrink(&mut self, n: usize) {
        self.0 = self.0.saturating_sub(n);
    }
}

// === impl Frame ===

impl<V> Frame<V> {
    /// Returns a new frame running `code`, with an empty operand stack.
    #[must_use]
    pub fn new(code: Arc<CodeObject>) -> Self {
        let stack = Vec::with_capacity(code.stack_size());
        Self {
            code,
            stack,
            stack_pointer: StackPointer(0),
        }
    }

    /// Returns the frame's code object.
    #[must_use]
    pub fn code(&self) -> &Arc<CodeObject> {
        &self.code
    }

    /// Returns the stack pointer last saved into this frame.
    #[must_use]
    pub fn stack_pointer(&self) -> StackPointer {
        self.stack_pointer
    }

    /// Saves `sp` into the frame.
    ///
    /// Values at or above `sp` are dead, and are dropped.
    pub fn set_stack_pointer(&mut self, sp: StackPointer) {
        debug_assert!(
            sp.0 <= self.stack.len(),
            "stack pointer {sp:?} is above the top of the stack ({})",
            self.stack.len()
        );
        self.stack.truncate(sp.0);
        self.stack_pointer = StackPointer(sp.0.min(self.stack.len()));
    }

    /// Pushes `value` at `sp`, moving the cursor up.
    pub fn push(&mut self, sp: &mut StackPointer, value: V) {
        self.stack.truncate(sp.0);
        debug_assert!(
            self.stack.len() < self.code.stack_size(),
            "operand stack overflow in {}",
            self.code.name()
        );
        self.stack.push(value);
        sp.0 = self.stack.len();
    }

    /// Pops the value below `sp`, moving the cursor down.
    pub fn pop(&mut self, sp: &mut StackPointer) -> Option<V> {
        self.stack.truncate(sp.0);
        let value = self.stack.pop();
        sp.0 = self.stack.len();
        value
    }

    /// Returns the `n`th live value below `sp`, counting from 1 at the top.
    #[must_use]
    pub fn peek(&self, sp: StackPointer, n: usize) -> Option<&V> {
        if n == 0 {
            return None;
        }
        let index = sp.0.checked_sub(n)?;
        self.stack.get(index)
    }

    /// Returns the live values saved in the frame, bottom first.
    #[must_use]
    pub fn stack(&self) -> &[V] {
        let top = self.stack_pointer.0.min(self.stack.len());
        &self.stack[..top]
    }
}

impl<V: fmt::Debug> fmt::Debug for Frame<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code.name())
            .field("stack", &self.stack())
            .field("stack_pointer", &self.stack_pointer)
            .finish()
    }
}
