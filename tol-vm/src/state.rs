//! VM state: registry, call stack, globals, gas, embedding API.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tol_asm::{bytecode, Prototype, VmId};
use tol_compiler::{compile_lua, compile_tol, skip_shebang};

use crate::error::VmError;
use crate::frame::{Closure, Frame, HostFunction, Upvalue};
use crate::stdlib;
use crate::table::Table;
use crate::value::Value;

/// Tunables of a VM state.
#[derive(Debug, Clone)]
pub struct VmParams {
    /// Registry slots allocated up front.
    pub registry_initial: usize,
    /// Registry slots added per growth step.
    pub registry_grow: usize,
    /// Hard registry ceiling; exceeding it is fatal.
    pub registry_max: usize,
    /// Maximum call-stack depth; exceeding it raises `stack overflow`.
    pub call_stack_max: usize,
    /// Skip installing the standard libraries.
    pub skip_open_libs: bool,
    /// Instruction budget; 0 means unlimited.
    pub gas_limit: u64,
}

impl Default for VmParams {
    fn default() -> Self {
        Self {
            registry_initial: 256,
            registry_grow: 256,
            registry_max: 1 << 20,
            call_stack_max: 200,
            skip_open_libs: false,
            gas_limit: 0,
        }
    }
}

/// A single-threaded deterministic VM state.
///
/// The state exclusively owns its registry, call stack and globals table.
/// It is not safe for concurrent use from multiple host threads; embedders
/// needing parallel execution create one state per context.
pub struct Vm {
    pub(crate) registry: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) globals: Rc<RefCell<Table>>,
    pub(crate) params: VmParams,
    pub(crate) gas_limit: u64,
    pub(crate) gas_used: u64,
    pub(crate) next_id: u64,
    pub(crate) open_upvals: BTreeMap<usize, Rc<Upvalue>>,
    pub(crate) ret_count: usize,
    host_stack: Vec<Value>,
}

impl Vm {
    /// A state with default parameters and the deterministic standard
    /// libraries installed.
    pub fn new() -> Self {
        Self::with_params(VmParams::default())
    }

    /// A state with explicit parameters.
    pub fn with_params(params: VmParams) -> Self {
        let mut vm = Self {
            registry: vec![Value::Nil; params.registry_initial],
            frames: Vec::new(),
            globals: Rc::new(RefCell::new(Table::new(1))),
            gas_limit: params.gas_limit,
            gas_used: 0,
            next_id: 2,
            open_upvals: BTreeMap::new(),
            ret_count: 0,
            host_stack: Vec::new(),
            params,
        };
        if !vm.params.skip_open_libs {
            stdlib::open_libs(&mut vm);
        }
        vm
    }

    // ---- identity and allocation ----------------------------------------

    /// Next deterministic object id.
    pub(crate) fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Allocate a fresh table.
    pub fn new_table(&mut self) -> Rc<RefCell<Table>> {
        let id = self.fresh_id();
        Rc::new(RefCell::new(Table::new(id)))
    }

    // ---- gas -------------------------------------------------------------

    /// Set the gas limit; 0 means unlimited.
    pub fn set_gas_limit(&mut self, limit: u64) {
        self.gas_limit = limit;
    }

    /// The configured gas limit.
    pub fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    /// Gas consumed so far.
    pub fn gas_used(&self) -> u64 {
        self.gas_used
    }

    // ---- globals and registration ---------------------------------------

    /// The shared globals table.
    pub fn globals(&self) -> Rc<RefCell<Table>> {
        self.globals.clone()
    }

    /// Read a global by name.
    pub fn global(&self, name: &str) -> Value {
        self.globals.borrow().get_str(name)
    }

    /// Write a global by name.
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.borrow_mut().set_str(name, value);
    }

    /// Register a host function under a global name.
    pub fn register<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&mut Vm, &[Value]) -> Result<Vec<Value>, VmError> + 'static,
    {
        let value = self.host_function(name, func);
        self.set_global(name, value);
    }

    /// Wrap a host function into a value without registering it.
    pub fn host_function<F>(&mut self, name: &str, func: F) -> Value
    where
        F: Fn(&mut Vm, &[Value]) -> Result<Vec<Value>, VmError> + 'static,
    {
        let id = self.fresh_id();
        Value::Host(Rc::new(HostFunction {
            id,
            name: name.to_string(),
            func: Box::new(func),
        }))
    }

    /// Register a module: a global table holding the given functions.
    /// Entries land in deterministic sorted-key order regardless of the
    /// order given.
    pub fn register_module<F>(&mut self, name: &str, entries: Vec<(&str, F)>)
    where
        F: Fn(&mut Vm, &[Value]) -> Result<Vec<Value>, VmError> + 'static,
    {
        let module = self.new_table();
        let mut sorted = entries;
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (fname, func) in sorted {
            let qualified = format!("{name}.{fname}");
            let value = self.host_function(&qualified, func);
            module.borrow_mut().set_str(fname, value);
        }
        self.set_global(name, Value::Table(module));
    }

    // ---- host value stack ------------------------------------------------

    /// Push a value onto the host exchange stack.
    pub fn push(&mut self, value: Value) {
        self.host_stack.push(value);
    }

    /// Pop a value from the host exchange stack.
    pub fn pop(&mut self) -> Option<Value> {
        self.host_stack.pop()
    }

    /// Peek at the top of the host exchange stack.
    pub fn peek(&self) -> Option<&Value> {
        self.host_stack.last()
    }

    // ---- execution entry points ------------------------------------------

    /// Execute raw bytes: bytecode when the container magic matches,
    /// otherwise Lua source (with shebang skipping).
    pub fn execute(&mut self, bytes: &[u8], name: &str) -> Result<Vec<Value>, VmError> {
        if bytecode::is_bytecode(bytes) {
            let proto = bytecode::decode(bytes, &VmId::current())?;
            return self.execute_proto(Rc::new(proto));
        }
        let stripped = skip_shebang(bytes);
        let source = core::str::from_utf8(stripped)
            .map_err(|_| VmError::runtime("source is not valid utf-8"))?;
        self.execute_lua(source, name)
    }

    /// Compile and execute Lua-subset source.
    pub fn execute_lua(&mut self, source: &str, name: &str) -> Result<Vec<Value>, VmError> {
        let proto = compile_lua(source, name)?;
        self.execute_proto(Rc::new(proto))
    }

    /// Compile and execute a TOL contract module.
    pub fn execute_tol(&mut self, source: &str, name: &str) -> Result<Vec<Value>, VmError> {
        let proto = compile_tol(source, name)?;
        self.execute_proto(Rc::new(proto))
    }

    /// Execute a prepared prototype as the main chunk.
    pub fn execute_proto(&mut self, proto: Rc<Prototype>) -> Result<Vec<Value>, VmError> {
        let _span = tracing::debug_span!("execute", chunk = %proto.source).entered();
        let id = self.fresh_id();
        let closure = Value::Function(Rc::new(Closure {
            id,
            proto,
            upvalues: Vec::new(),
        }));
        self.call_value(closure, &[])
    }

    /// Host-side protected call: never panics, never propagates
    /// recoverable errors.
    pub fn pcall(&mut self, f: Value, args: &[Value]) -> Result<Vec<Value>, VmError> {
        let depth = self.frames.len();
        let top = self.stack_top();
        match self.call_value(f, args) {
            Ok(results) => {
                let mut out = vec![Value::Bool(true)];
                out.extend(results);
                Ok(out)
            }
            Err(err) if err.is_recoverable() => {
                self.unwind_to(depth, top);
                Ok(vec![Value::Bool(false), err.error_value()])
            }
            Err(err) => Err(err),
        }
    }

    /// Host-side `xpcall`: the handler enriches the error object before
    /// the protected call reports failure.
    pub fn xpcall(
        &mut self,
        f: Value,
        handler: Value,
        args: &[Value],
    ) -> Result<Vec<Value>, VmError> {
        let depth = self.frames.len();
        let top = self.stack_top();
        match self.call_value(f, args) {
            Ok(results) => {
                let mut out = vec![Value::Bool(true)];
                out.extend(results);
                Ok(out)
            }
            Err(err) if err.is_recoverable() => {
                self.unwind_to(depth, top);
                let handled = self.call_value(handler, &[err.error_value()])?;
                let mut out = vec![Value::Bool(false)];
                out.extend(handled);
                Ok(out)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn unwind_to(&mut self, depth: usize, top: usize) {
        self.close_upvalues(top);
        self.frames.truncate(depth);
    }

    pub(crate) fn stack_top(&self) -> usize {
        self.frames
            .last()
            .map(|f| f.top.max(f.base + f.closure.proto.max_stack as usize))
            .unwrap_or(0)
    }

    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let closed = self.open_upvals.split_off(&from);
        for upval in closed.values() {
            upval.close(&self.registry);
        }
    }

    pub(crate) fn ensure_registry(&mut self, needed: usize) -> Result<(), VmError> {
        if needed <= self.registry.len() {
            return Ok(());
        }
        if needed > self.params.registry_max {
            return Err(VmError::RegistryOverflow);
        }
        let grow = self.params.registry_grow.max(1);
        let mut target = self.registry.len();
        while target < needed {
            target = (target + grow).min(self.params.registry_max);
        }
        self.registry.resize(target, Value::Nil);
        Ok(())
    }

    /// Source label and line of the instruction the innermost frame is
    /// executing; used by `error` level prefixes and tracebacks.
    pub(crate) fn current_location(&self) -> Option<(String, u32)> {
        let frame = self.frames.last()?;
        let pc = frame.pc.saturating_sub(1);
        let line = frame
            .closure
            .proto
            .debug
            .source_positions
            .get(pc)
            .copied()
            .unwrap_or(0);
        Some((frame.closure.proto.source.clone(), line))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
