//! The instruction dispatch loop.
//!
//! Every dispatched instruction costs one unit of gas, charged at the head
//! of dispatch; exhaustion raises the fixed public message and unwinds
//! like any recoverable error, except that the spent counter keeps further
//! progress impossible until the host raises the limit.

use std::rc::Rc;

use tol_asm::{Constant, Instruction, OpCode, Prototype, RK_CONSTANT_FLAG};
use tol_types::Uint256;

use crate::error::{TracebackFrame, VmError};
use crate::frame::{Closure, Frame, Upvalue};
use crate::value::Value;
use crate::Vm;

/// Bound on `__index`/`__newindex` chains.
const MAX_INDEX_CHAIN: usize = 100;
/// Bound on `__call` resolution chains.
const MAX_CALL_CHAIN: usize = 16;

pub(crate) fn constant_value(c: &Constant) -> Value {
    match c {
        Constant::Nil => Value::Nil,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Number(n) => Value::Number(*n),
        Constant::Str(s) => Value::from_string(s.clone()),
        Constant::Address(a) => Value::Address(*a),
    }
}

impl Vm {
    /// Call any callable value with the given arguments, running nested
    /// execution to completion. This is the host entry point and the
    /// engine behind metamethod and iterator invocation.
    pub fn call_value(&mut self, f: Value, args: &[Value]) -> Result<Vec<Value>, VmError> {
        let base = self.stack_top();
        let saved_top = self.frames.last().map(|frame| frame.top);
        self.ensure_registry(base + args.len() + 1)?;
        for (i, arg) in args.iter().enumerate() {
            self.registry[base + i] = arg.clone();
        }
        let depth = self.frames.len();
        self.begin_call(f, base, args.len(), base, -1)?;
        if self.frames.len() > depth {
            self.run_until(depth)?;
        }
        let count = self.ret_count;
        let out = self.registry[base..base + count].to_vec();
        // The nested call may have advanced the enclosing frame's dynamic
        // top; restore it so operand ranges stay where the caller left
        // them.
        if let (Some(frame), Some(top)) = (self.frames.last_mut(), saved_top) {
            frame.top = top;
        }
        Ok(out)
    }

    fn run_until(&mut self, depth: usize) -> Result<(), VmError> {
        while self.frames.len() > depth {
            self.step()?;
        }
        Ok(())
    }

    /// Raise a runtime error with position prefix and traceback.
    pub(crate) fn rt_error(&self, message: &str) -> VmError {
        let text = match self.current_location() {
            Some((source, line)) => format!("{source}:{line}: {message}"),
            None => message.to_string(),
        };
        VmError::Runtime {
            value: Value::from_string(text),
            traceback: self.traceback(),
        }
    }

    pub(crate) fn traceback(&self) -> Vec<TracebackFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let pc = frame.pc.saturating_sub(1);
                let line = frame
                    .closure
                    .proto
                    .debug
                    .source_positions
                    .get(pc)
                    .copied()
                    .unwrap_or(0);
                TracebackFrame {
                    source: frame.closure.proto.source.clone(),
                    line,
                    what: "function".into(),
                }
            })
            .collect()
    }

    // ---- call machinery --------------------------------------------------

    pub(crate) fn begin_call(
        &mut self,
        f: Value,
        arg_base: usize,
        nargs: usize,
        ret_base: usize,
        nresults: i32,
    ) -> Result<(), VmError> {
        let mut callee = f;
        let mut arg_count = nargs;
        for _ in 0..MAX_CALL_CHAIN {
            match callee {
                Value::Host(host) => {
                    let args: Vec<Value> =
                        self.registry[arg_base..arg_base + arg_count].to_vec();
                    let results = (host.func)(self, &args)?;
                    return self.finish_host_call(ret_base, nresults, results);
                }
                Value::Function(closure) => {
                    if self.frames.len() >= self.params.call_stack_max {
                        return Err(VmError::StackOverflow);
                    }
                    let proto = closure.proto.clone();
                    let nparams = proto.num_params as usize;
                    let max_stack = (proto.max_stack as usize).max(nparams).max(2);
                    self.ensure_registry(arg_base + max_stack.max(arg_count) + 1)?;
                    let varargs = if proto.is_vararg && arg_count > nparams {
                        self.registry[arg_base + nparams..arg_base + arg_count].to_vec()
                    } else {
                        Vec::new()
                    };
                    // Registers beyond the parameters start out nil.
                    for i in arg_count.min(nparams)..max_stack {
                        self.registry[arg_base + i] = Value::Nil;
                    }
                    self.frames.push(Frame {
                        closure,
                        base: arg_base,
                        pc: 0,
                        nresults,
                        ret_base,
                        varargs,
                        top: arg_base + max_stack,
                    });
                    return Ok(());
                }
                other => match self.metamethod_of(&other, "__call") {
                    Some(mm) => {
                        self.ensure_registry(arg_base + arg_count + 1)?;
                        for i in (0..arg_count).rev() {
                            self.registry[arg_base + i + 1] =
                                self.registry[arg_base + i].clone();
                        }
                        self.registry[arg_base] = other;
                        arg_count += 1;
                        callee = mm;
                    }
                    None => {
                        return Err(self.rt_error(&format!(
                            "attempt to call a {} value",
                            other.type_name()
                        )))
                    }
                },
            }
        }
        Err(self.rt_error("'__call' chain too long"))
    }

    fn finish_host_call(
        &mut self,
        ret_base: usize,
        nresults: i32,
        results: Vec<Value>,
    ) -> Result<(), VmError> {
        let count = results.len();
        if nresults >= 0 {
            let wanted = nresults as usize;
            self.ensure_registry(ret_base + wanted)?;
            for i in 0..wanted {
                self.registry[ret_base + i] =
                    results.get(i).cloned().unwrap_or(Value::Nil);
            }
        } else {
            self.ensure_registry(ret_base + count)?;
            for (i, value) in results.into_iter().enumerate() {
                self.registry[ret_base + i] = value;
            }
            self.ret_count = count;
            if let Some(caller) = self.frames.last_mut() {
                caller.top = ret_base + count;
            }
        }
        Ok(())
    }

    fn do_return(&mut self, result_base: usize, count: usize) {
        let frame = self.frames.pop().expect("returning frame");
        self.close_upvalues(frame.base);
        for i in 0..count {
            self.registry[frame.ret_base + i] = self.registry[result_base + i].clone();
        }
        if frame.nresults >= 0 {
            for i in count..frame.nresults as usize {
                self.registry[frame.ret_base + i] = Value::Nil;
            }
        } else {
            self.ret_count = count;
            if let Some(caller) = self.frames.last_mut() {
                caller.top = frame.ret_base + count;
            }
        }
    }

    // ---- metamethods and operators ---------------------------------------

    pub(crate) fn metamethod_of(&self, value: &Value, event: &str) -> Option<Value> {
        let mt = value.metatable()?;
        let mm = mt.borrow().get_str(event);
        if mm.is_nil() {
            None
        } else {
            Some(mm)
        }
    }

    fn call_mm(&mut self, mm: Value, args: &[Value]) -> Result<Value, VmError> {
        let results = self.call_value(mm, args)?;
        Ok(results.into_iter().next().unwrap_or(Value::Nil))
    }

    /// Table read honoring `__index` chains, bounded in depth.
    pub fn get_index(&mut self, obj: &Value, key: &Value) -> Result<Value, VmError> {
        let mut current = obj.clone();
        for _ in 0..MAX_INDEX_CHAIN {
            if let Value::Table(t) = &current {
                let raw = t.borrow().get(key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
            }
            let mm = match self.metamethod_of(&current, "__index") {
                Some(mm) => mm,
                None => {
                    return if matches!(current, Value::Table(_)) {
                        Ok(Value::Nil)
                    } else {
                        Err(self.rt_error(&format!(
                            "attempt to index a {} value",
                            current.type_name()
                        )))
                    }
                }
            };
            match mm {
                Value::Function(_) | Value::Host(_) => {
                    return self
                        .call_value(mm, &[current, key.clone()])
                        .map(|r| r.into_iter().next().unwrap_or(Value::Nil));
                }
                other => current = other,
            }
        }
        Err(self.rt_error("'__index' chain too long"))
    }

    /// Table write honoring `__newindex` chains, bounded in depth.
    pub fn set_index(
        &mut self,
        obj: &Value,
        key: &Value,
        value: Value,
    ) -> Result<(), VmError> {
        let canonical = crate::table::TableKey::from_value(key);
        let mut current = obj.clone();
        for _ in 0..MAX_INDEX_CHAIN {
            if let Value::Table(t) = &current {
                let has = !t.borrow().get(key).is_nil();
                if has || self.metamethod_of(&current, "__newindex").is_none() {
                    // Canonicalized up front so a table used as its own
                    // key cannot re-borrow the cell mid-write.
                    let Some(canonical) = canonical else {
                        return Err(self.rt_error("table index is nil"));
                    };
                    t.borrow_mut().set_with_key(canonical, key, value);
                    return Ok(());
                }
            }
            let mm = match self.metamethod_of(&current, "__newindex") {
                Some(mm) => mm,
                None => {
                    return Err(self.rt_error(&format!(
                        "attempt to index a {} value",
                        current.type_name()
                    )))
                }
            };
            match mm {
                Value::Function(_) | Value::Host(_) => {
                    self.call_value(mm, &[current, key.clone(), value])?;
                    return Ok(());
                }
                other => current = other,
            }
        }
        Err(self.rt_error("'__newindex' chain too long"))
    }

    fn arith(&mut self, op: OpCode, a: Value, b: Value) -> Result<Value, VmError> {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return self.arith_numbers(op, x, y);
        }
        let event = arith_event(op);
        match self
            .metamethod_of(&a, event)
            .or_else(|| self.metamethod_of(&b, event))
        {
            Some(mm) => self.call_mm(mm, &[a, b]),
            None => {
                let offender = if a.as_number().is_none() { &a } else { &b };
                Err(self.rt_error(&format!(
                    "attempt to perform arithmetic on a {} value",
                    offender.type_name()
                )))
            }
        }
    }

    fn arith_numbers(
        &self,
        op: OpCode,
        x: Uint256,
        y: Uint256,
    ) -> Result<Value, VmError> {
        let result = match op {
            OpCode::Add => x.wrapping_add(y),
            OpCode::Sub => x.wrapping_sub(y),
            OpCode::Mul => x.wrapping_mul(y),
            OpCode::Div | OpCode::IDiv => x
                .checked_div(y)
                .ok_or_else(|| self.rt_error("attempt to divide by zero"))?,
            OpCode::Mod => x
                .checked_rem(y)
                .ok_or_else(|| self.rt_error("attempt to perform 'n%%0'"))?,
            OpCode::Pow => x.wrapping_pow(y),
            OpCode::BAnd => x.bitand(y),
            OpCode::BOr => x.bitor(y),
            OpCode::BXor => x.bitxor(y),
            OpCode::Shl => x.shl(y),
            OpCode::Shr => x.shr(y),
            _ => unreachable!("not an arithmetic opcode"),
        };
        Ok(Value::Number(result))
    }

    fn values_equal(&mut self, a: &Value, b: &Value) -> Result<bool, VmError> {
        if a.raw_eq(b) {
            return Ok(true);
        }
        let comparable = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_))
        );
        if comparable {
            if let Some(mm) = self
                .metamethod_of(a, "__eq")
                .or_else(|| self.metamethod_of(b, "__eq"))
            {
                let result = self.call_mm(mm, &[a.clone(), b.clone()])?;
                return Ok(result.truthy());
            }
        }
        Ok(false)
    }

    fn values_less(&mut self, a: &Value, b: &Value, or_equal: bool) -> Result<bool, VmError> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(if or_equal {
                x <= y
            } else {
                x < y
            }),
            (Value::Str(x), Value::Str(y)) => Ok(if or_equal {
                x.as_bytes() <= y.as_bytes()
            } else {
                x.as_bytes() < y.as_bytes()
            }),
            (Value::Address(x), Value::Address(y)) => Ok(if or_equal {
                x <= y
            } else {
                x < y
            }),
            _ => {
                let event = if or_equal { "__le" } else { "__lt" };
                match self
                    .metamethod_of(a, event)
                    .or_else(|| self.metamethod_of(b, event))
                {
                    Some(mm) => {
                        let result = self.call_mm(mm, &[a.clone(), b.clone()])?;
                        Ok(result.truthy())
                    }
                    None => Err(self.rt_error(&format!(
                        "attempt to compare {} with {}",
                        a.type_name(),
                        b.type_name()
                    ))),
                }
            }
        }
    }

    fn value_len(&mut self, v: &Value) -> Result<Value, VmError> {
        match v {
            Value::Str(s) => Ok(Value::number(s.len() as u64)),
            Value::Table(t) => {
                if let Some(mm) = self.metamethod_of(v, "__len") {
                    return self.call_mm(mm, &[v.clone()]);
                }
                Ok(Value::number(t.borrow().len() as u64))
            }
            other => match self.metamethod_of(other, "__len") {
                Some(mm) => self.call_mm(mm, &[other.clone()]),
                None => Err(self.rt_error(&format!(
                    "attempt to get length of a {} value",
                    other.type_name()
                ))),
            },
        }
    }

    fn concat_pair(&mut self, a: Value, b: Value) -> Result<Value, VmError> {
        match (stringable(&a), stringable(&b)) {
            (Some(x), Some(y)) => Ok(Value::from_string(format!("{x}{y}"))),
            _ => {
                match self
                    .metamethod_of(&a, "__concat")
                    .or_else(|| self.metamethod_of(&b, "__concat"))
                {
                    Some(mm) => self.call_mm(mm, &[a, b]),
                    None => {
                        let offender = if stringable(&a).is_none() { a } else { b };
                        Err(self.rt_error(&format!(
                            "attempt to concatenate a {} value",
                            offender.type_name()
                        )))
                    }
                }
            }
        }
    }

    /// Stringify honoring `__tostring`.
    pub fn tostring_value(&mut self, v: &Value) -> Result<String, VmError> {
        if let Some(mm) = self.metamethod_of(v, "__tostring") {
            let result = self.call_mm(mm, &[v.clone()])?;
            return Ok(result.display_string());
        }
        Ok(v.display_string())
    }

    // ---- dispatch --------------------------------------------------------

    fn rk(&self, proto: &Prototype, base: usize, operand: u16) -> Value {
        if operand & RK_CONSTANT_FLAG != 0 {
            constant_value(&proto.constants[(operand & !RK_CONSTANT_FLAG) as usize])
        } else {
            self.registry[base + operand as usize].clone()
        }
    }

    fn reg(&self, base: usize, r: impl Into<usize>) -> Value {
        self.registry[base + r.into()].clone()
    }

    fn set_reg(&mut self, base: usize, r: impl Into<usize>, value: Value) {
        self.registry[base + r.into()] = value;
    }

    fn bump_pc(&mut self, delta: i64) {
        let frame = self.frames.last_mut().expect("active frame");
        frame.pc = (frame.pc as i64 + delta) as usize;
    }

    fn frame_top(&self) -> usize {
        self.frames.last().expect("active frame").top
    }

    fn reset_frame_top(&mut self) {
        let frame = self.frames.last_mut().expect("active frame");
        frame.top = frame.base + frame.closure.proto.max_stack as usize;
    }

    fn step(&mut self) -> Result<(), VmError> {
        let (closure, base, pc) = {
            let frame = self.frames.last().expect("active frame");
            (frame.closure.clone(), frame.base, frame.pc)
        };
        let proto = &closure.proto;
        if pc >= proto.code.len() {
            // Defensive: well-formed prototypes end in RETURN.
            self.do_return(base, 0);
            return Ok(());
        }
        let ins = Instruction::from_word(proto.code[pc]);
        self.frames.last_mut().expect("active frame").pc = pc + 1;

        self.gas_used = self.gas_used.saturating_add(1);
        if self.gas_limit != 0 && self.gas_used > self.gas_limit {
            return Err(VmError::Gas);
        }

        let op = ins
            .op()
            .map_err(|raw| self.rt_error(&format!("invalid opcode {raw:#04x}")))?;
        let a = ins.a();
        match op {
            OpCode::Move => {
                let v = self.reg(base, ins.b() as usize);
                self.set_reg(base, a, v);
            }
            OpCode::MoveN => {
                for i in 0..=(ins.c() as usize) {
                    let v = self.reg(base, ins.b() as usize + i);
                    self.set_reg(base, a as usize + i, v);
                }
            }
            OpCode::LoadK => {
                let v = constant_value(&proto.constants[ins.bx() as usize]);
                self.set_reg(base, a, v);
            }
            OpCode::LoadBool => {
                self.set_reg(base, a, Value::Bool(ins.b() != 0));
                if ins.c() != 0 {
                    self.bump_pc(1);
                }
            }
            OpCode::LoadNil => {
                for r in a as usize..=(ins.b() as usize).max(a as usize) {
                    self.set_reg(base, r, Value::Nil);
                }
            }
            OpCode::GetUpval => {
                let v = closure.upvalues[ins.b() as usize].get(&self.registry);
                self.set_reg(base, a, v);
            }
            OpCode::SetUpval => {
                let v = self.reg(base, a);
                closure.upvalues[ins.b() as usize].set(&mut self.registry, v);
            }
            OpCode::GetGlobal => {
                let key = constant_value(&proto.constants[ins.bx() as usize]);
                let globals = Value::Table(self.globals.clone());
                let v = self.get_index(&globals, &key)?;
                self.set_reg(base, a, v);
            }
            OpCode::SetGlobal => {
                let key = constant_value(&proto.constants[ins.bx() as usize]);
                let globals = Value::Table(self.globals.clone());
                let v = self.reg(base, a);
                self.set_index(&globals, &key, v)?;
            }
            OpCode::GetTable | OpCode::GetTableKs => {
                let obj = self.reg(base, ins.b() as usize);
                let key = self.rk(proto, base, ins.c());
                let v = self.get_index(&obj, &key)?;
                self.set_reg(base, a, v);
            }
            OpCode::SetTable | OpCode::SetTableKs => {
                let obj = self.reg(base, a);
                let key = self.rk(proto, base, ins.b());
                let v = self.rk(proto, base, ins.c());
                self.set_index(&obj, &key, v)?;
            }
            OpCode::NewTable => {
                let table = self.new_table();
                self.set_reg(base, a, Value::Table(table));
            }
            OpCode::OpSelf => {
                let obj = self.reg(base, ins.b() as usize);
                let key = self.rk(proto, base, ins.c());
                self.set_reg(base, a as usize + 1, obj.clone());
                let method = self.get_index(&obj, &key)?;
                self.set_reg(base, a, method);
            }
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::IDiv
            | OpCode::BAnd
            | OpCode::BOr
            | OpCode::BXor
            | OpCode::Shl
            | OpCode::Shr => {
                let lhs = self.rk(proto, base, ins.b());
                let rhs = self.rk(proto, base, ins.c());
                let v = self.arith(op, lhs, rhs)?;
                self.set_reg(base, a, v);
            }
            OpCode::Unm => {
                let operand = self.reg(base, ins.b() as usize);
                let v = match operand.as_number() {
                    Some(n) => Value::Number(Uint256::ZERO.wrapping_sub(n)),
                    None => match self.metamethod_of(&operand, "__unm") {
                        Some(mm) => self.call_mm(mm, &[operand.clone(), operand])?,
                        None => {
                            return Err(self.rt_error(&format!(
                                "attempt to perform arithmetic on a {} value",
                                operand.type_name()
                            )))
                        }
                    },
                };
                self.set_reg(base, a, v);
            }
            OpCode::BNot => {
                let operand = self.reg(base, ins.b() as usize);
                let v = match operand.as_number() {
                    Some(n) => Value::Number(n.bitnot()),
                    None => match self.metamethod_of(&operand, "__bnot") {
                        Some(mm) => self.call_mm(mm, &[operand.clone(), operand])?,
                        None => {
                            return Err(self.rt_error(&format!(
                                "attempt to perform arithmetic on a {} value",
                                operand.type_name()
                            )))
                        }
                    },
                };
                self.set_reg(base, a, v);
            }
            OpCode::Not => {
                let operand = self.reg(base, ins.b() as usize);
                self.set_reg(base, a, Value::Bool(!operand.truthy()));
            }
            OpCode::Len => {
                let operand = self.reg(base, ins.b() as usize);
                let v = self.value_len(&operand)?;
                self.set_reg(base, a, v);
            }
            OpCode::Concat => {
                let b = ins.b() as usize;
                let c = ins.c() as usize;
                let mut acc = self.reg(base, c);
                for r in (b..c).rev() {
                    let piece = self.reg(base, r);
                    acc = self.concat_pair(piece, acc)?;
                }
                self.set_reg(base, a, acc);
            }
            OpCode::Jmp => {
                self.bump_pc(i64::from(ins.sbx()));
            }
            OpCode::Eq => {
                let lhs = self.rk(proto, base, ins.b());
                let rhs = self.rk(proto, base, ins.c());
                let cmp = self.values_equal(&lhs, &rhs)?;
                if cmp != (a != 0) {
                    self.bump_pc(1);
                }
            }
            OpCode::Lt => {
                let lhs = self.rk(proto, base, ins.b());
                let rhs = self.rk(proto, base, ins.c());
                let cmp = self.values_less(&lhs, &rhs, false)?;
                if cmp != (a != 0) {
                    self.bump_pc(1);
                }
            }
            OpCode::Le => {
                let lhs = self.rk(proto, base, ins.b());
                let rhs = self.rk(proto, base, ins.c());
                let cmp = self.values_less(&lhs, &rhs, true)?;
                if cmp != (a != 0) {
                    self.bump_pc(1);
                }
            }
            OpCode::Test => {
                let v = self.reg(base, a);
                if v.truthy() != (ins.c() != 0) {
                    self.bump_pc(1);
                }
            }
            OpCode::TestSet => {
                let v = self.reg(base, ins.b() as usize);
                if v.truthy() == (ins.c() != 0) {
                    self.set_reg(base, a, v);
                } else {
                    self.bump_pc(1);
                }
            }
            OpCode::Call => {
                let f = self.reg(base, a);
                let arg_base = base + a as usize + 1;
                let nargs = if ins.b() == 0 {
                    self.frame_top() - arg_base
                } else {
                    ins.b() as usize - 1
                };
                self.reset_frame_top();
                let nresults = ins.c() as i32 - 1;
                self.begin_call(f, arg_base, nargs, base + a as usize, nresults)?;
            }
            OpCode::TailCall => {
                let f = self.reg(base, a);
                let arg_base = base + a as usize + 1;
                let nargs = if ins.b() == 0 {
                    self.frame_top() - arg_base
                } else {
                    ins.b() as usize - 1
                };
                // Reuse the current frame: pop it, keep its return slot.
                let frame = self.frames.pop().expect("active frame");
                self.close_upvalues(frame.base);
                // Slide the callee and arguments down to the frame base.
                self.registry[frame.base] = f;
                for i in 0..nargs {
                    self.registry[frame.base + 1 + i] =
                        self.registry[arg_base + i].clone();
                }
                let f = self.registry[frame.base].clone();
                self.begin_call(
                    f,
                    frame.base + 1,
                    nargs,
                    frame.ret_base,
                    frame.nresults,
                )?;
            }
            OpCode::Return => {
                let result_base = base + a as usize;
                let count = if ins.b() == 0 {
                    self.frame_top() - result_base
                } else {
                    ins.b() as usize - 1
                };
                self.do_return(result_base, count);
            }
            OpCode::ForPrep => {
                let init = self.expect_number(base, a as usize, "'for' initial value")?;
                self.expect_number(base, a as usize + 1, "'for' limit")?;
                let step = self.expect_number(base, a as usize + 2, "'for' step")?;
                if step.is_zero() {
                    return Err(self.rt_error("'for' step is zero"));
                }
                self.set_reg(base, a, Value::Number(init.wrapping_sub(step)));
                self.bump_pc(i64::from(ins.sbx()));
            }
            OpCode::ForLoop => {
                let index = self.expect_number(base, a as usize, "'for' index")?;
                let limit = self.expect_number(base, a as usize + 1, "'for' limit")?;
                let step = self.expect_number(base, a as usize + 2, "'for' step")?;
                let next = index.wrapping_add(step);
                if next <= limit {
                    self.set_reg(base, a, Value::Number(next));
                    self.set_reg(base, a as usize + 3, Value::Number(next));
                    self.bump_pc(i64::from(ins.sbx()));
                }
            }
            OpCode::TForLoop => {
                let f = self.reg(base, a);
                let state = self.reg(base, a as usize + 1);
                let control = self.reg(base, a as usize + 2);
                let results = self.call_value(f, &[state, control])?;
                let wanted = ins.c() as usize;
                for i in 0..wanted {
                    self.set_reg(
                        base,
                        a as usize + 3 + i,
                        results.get(i).cloned().unwrap_or(Value::Nil),
                    );
                }
                let first = self.reg(base, a as usize + 3);
                if first.is_nil() {
                    self.bump_pc(1);
                } else {
                    self.set_reg(base, a as usize + 2, first);
                }
            }
            OpCode::SetList => {
                let block = if ins.c() == 0 {
                    // The block index travels in the next raw code word.
                    let frame = self.frames.last_mut().expect("active frame");
                    let extra = proto.code[frame.pc];
                    frame.pc += 1;
                    extra
                } else {
                    ins.c() as u32
                };
                let start = (block.max(1) as u64 - 1) * u64::from(OpCode::FIELDS_PER_FLUSH);
                let count = if ins.b() == 0 {
                    self.frame_top() - (base + a as usize + 1)
                } else {
                    ins.b() as usize
                };
                self.reset_frame_top();
                let table = self.reg(base, a);
                let Value::Table(t) = table else {
                    return Err(self.rt_error("attempt to set a list on a non-table"));
                };
                for i in 0..count {
                    let v = self.reg(base, a as usize + 1 + i);
                    let key = Value::Number(Uint256::from_u64(start + i as u64 + 1));
                    t.borrow_mut().set(&key, v).map_err(|m| self.rt_error(m))?;
                }
            }
            OpCode::Close => {
                let floor = base + a as usize;
                self.close_upvalues(floor);
                if ins.b() != 0 {
                    self.run_close_hooks(floor)?;
                }
            }
            OpCode::Closure => {
                let nested = Rc::new(proto.protos[ins.bx() as usize].clone());
                let count = nested.num_upvalues as usize;
                let mut upvalues = Vec::with_capacity(count);
                for _ in 0..count {
                    let frame = self.frames.last_mut().expect("active frame");
                    let pseudo = Instruction::from_word(proto.code[frame.pc]);
                    frame.pc += 1;
                    match pseudo.op() {
                        Ok(OpCode::Move) => {
                            let slot = base + pseudo.b() as usize;
                            let upval = self
                                .open_upvals
                                .entry(slot)
                                .or_insert_with(|| Rc::new(Upvalue::open(slot)))
                                .clone();
                            upvalues.push(upval);
                        }
                        Ok(OpCode::GetUpval) => {
                            upvalues.push(closure.upvalues[pseudo.b() as usize].clone());
                        }
                        _ => {
                            return Err(
                                self.rt_error("malformed closure upvalue binding")
                            )
                        }
                    }
                }
                let id = self.fresh_id();
                let value = Value::Function(Rc::new(Closure {
                    id,
                    proto: nested,
                    upvalues,
                }));
                self.set_reg(base, a, value);
            }
            OpCode::Vararg => {
                let varargs = self.frames.last().expect("active frame").varargs.clone();
                let dest = base + a as usize;
                if ins.b() == 0 {
                    self.ensure_registry(dest + varargs.len())?;
                    for (i, v) in varargs.iter().enumerate() {
                        self.registry[dest + i] = v.clone();
                    }
                    let frame = self.frames.last_mut().expect("active frame");
                    frame.top = dest + varargs.len();
                } else {
                    let wanted = ins.b() as usize - 1;
                    for i in 0..wanted {
                        self.registry[dest + i] =
                            varargs.get(i).cloned().unwrap_or(Value::Nil);
                    }
                }
            }
            OpCode::Nop => {}
        }
        Ok(())
    }

    fn expect_number(
        &self,
        base: usize,
        r: usize,
        what: &str,
    ) -> Result<Uint256, VmError> {
        self.registry[base + r]
            .as_number()
            .ok_or_else(|| self.rt_error(&format!("{what} must be a number")))
    }

    /// Run `__close` hooks for registers at or above `floor`, LIFO, within
    /// the current frame. Closed registers are cleared so a hook never
    /// runs twice.
    fn run_close_hooks(&mut self, floor: usize) -> Result<(), VmError> {
        let top = self.frame_top();
        for slot in (floor..top).rev() {
            let value = self.registry[slot].clone();
            if value.is_nil() {
                continue;
            }
            if let Some(mm) = self.metamethod_of(&value, "__close") {
                self.registry[slot] = Value::Nil;
                self.call_value(mm, &[value, Value::Nil])?;
            }
        }
        Ok(())
    }
}

fn stringable(v: &Value) -> Option<String> {
    match v {
        Value::Str(s) => Some(s.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Address(a) => Some(a.to_hex()),
        _ => None,
    }
}

fn arith_event(op: OpCode) -> &'static str {
    match op {
        OpCode::Add => "__add",
        OpCode::Sub => "__sub",
        OpCode::Mul => "__mul",
        OpCode::Div => "__div",
        OpCode::Mod => "__mod",
        OpCode::Pow => "__pow",
        OpCode::IDiv => "__idiv",
        OpCode::BAnd => "__band",
        OpCode::BOr => "__bor",
        OpCode::BXor => "__bxor",
        OpCode::Shl => "__shl",
        OpCode::Shr => "__shr",
        _ => unreachable!("not an arithmetic opcode"),
    }
}
