//! Closures, upvalues, host functions and call frames.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tol_asm::Prototype;

use crate::error::VmError;
use crate::state::Vm;
use crate::value::Value;

/// A captured variable, open while its stack slot is live and closed
/// (detached into its own cell) afterwards.
#[derive(Debug)]
pub struct Upvalue {
    state: RefCell<UpvalState>,
}

#[derive(Debug)]
enum UpvalState {
    /// Points at an absolute registry index.
    Open(usize),
    /// Owns the value.
    Closed(Value),
}

impl Upvalue {
    /// An open upvalue aliasing the given registry slot.
    pub fn open(index: usize) -> Self {
        Self {
            state: RefCell::new(UpvalState::Open(index)),
        }
    }

    /// The registry index, while open.
    pub fn open_index(&self) -> Option<usize> {
        match *self.state.borrow() {
            UpvalState::Open(index) => Some(index),
            UpvalState::Closed(_) => None,
        }
    }

    /// Read through the cell.
    pub fn get(&self, registry: &[Value]) -> Value {
        match &*self.state.borrow() {
            UpvalState::Open(index) => registry[*index].clone(),
            UpvalState::Closed(value) => value.clone(),
        }
    }

    /// Write through the cell.
    pub fn set(&self, registry: &mut [Value], value: Value) {
        match &mut *self.state.borrow_mut() {
            UpvalState::Open(index) => registry[*index] = value,
            UpvalState::Closed(slot) => *slot = value,
        }
    }

    /// Detach from the stack, capturing the current value.
    pub fn close(&self, registry: &[Value]) {
        let mut state = self.state.borrow_mut();
        if let UpvalState::Open(index) = *state {
            *state = UpvalState::Closed(registry[index].clone());
        }
    }
}

/// A closure: a shared prototype plus its bound upvalues.
#[derive(Debug)]
pub struct Closure {
    /// Creation id; the deterministic identity of the closure.
    pub id: u64,
    /// The compiled function, shared and immutable.
    pub proto: Rc<Prototype>,
    /// Captured upvalues, in prototype order.
    pub upvalues: Vec<Rc<Upvalue>>,
}

/// The host-function calling convention: mutable VM handle plus the
/// argument slice, returning the result values.
pub type HostFn = Box<dyn Fn(&mut Vm, &[Value]) -> Result<Vec<Value>, VmError>>;

/// A function registered by the embedder.
pub struct HostFunction {
    /// Creation id; the deterministic identity of the function.
    pub id: u64,
    /// Registration name, for diagnostics.
    pub name: String,
    /// The callable.
    pub func: HostFn,
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction#{}({})", self.id, self.name)
    }
}

/// One activation record of the call stack.
#[derive(Debug)]
pub struct Frame {
    /// The executing closure.
    pub closure: Rc<Closure>,
    /// Absolute registry index of register 0.
    pub base: usize,
    /// Saved program counter.
    pub pc: usize,
    /// Result count the caller expects; -1 keeps all results.
    pub nresults: i32,
    /// Absolute registry index the results land at.
    pub ret_base: usize,
    /// Extra arguments beyond the declared parameters.
    pub varargs: Vec<Value>,
    /// Dynamic top for multi-value operand ranges (absolute index one
    /// past the last live value).
    pub top: usize,
}
