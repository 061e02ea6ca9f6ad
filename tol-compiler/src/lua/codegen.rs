//! Code generator: AST to register-machine prototypes.
//!
//! One `FuncState` per function context owns the growing code store, the
//! constant pool, the upvalue pool, the block stack (with per-block local
//! pools carrying `<const>`/`<close>` attributes), the label table for
//! `goto` resolution, and the register top of the bump-pointer allocator.
//! After emission every function runs through the peephole pass.

use std::collections::BTreeMap;

use tol_asm::{
    Constant, Instruction, LocalVar, OpCode, Prototype, MAX_ARG_BX, MAX_ARG_SBX,
    RK_CONSTANT_FLAG,
};
use tol_types::{Address, Uint256};

use crate::error::CompileError;
use crate::lua::ast::*;
use crate::lua::fold;
use crate::lua::peephole;

/// Hard cap on allocated registers per function.
const MAX_REGISTERS: u16 = 200;

/// Compile a chunk-level block into the root prototype. The chunk behaves
/// as a vararg function with no parameters.
pub fn compile_chunk(block: &Block, chunk: &str) -> Result<Prototype, CompileError> {
    let mut c = Compiler {
        chunk: chunk.to_string(),
        fs: Vec::new(),
    };
    c.push_func(chunk, 0, true, &[]);
    c.enter_block(false);
    c.compile_block(block)?;
    c.leave_block(0)?;
    c.emit(Instruction::abc(OpCode::Return, 0, 1, 0), last_line(block));
    let state = c.fs.pop().expect("root function state");
    let mut proto = finish_proto(state);
    peephole::patch_code(&mut proto);
    Ok(proto)
}

fn last_line(block: &Block) -> u32 {
    block.stats.last().map(|s| s.line).unwrap_or(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameRef {
    Local(u8),
    Upval(u8),
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpvalSource {
    ParentLocal(u8),
    ParentUpval(u8),
}

#[derive(Debug, Clone)]
struct UpvalDesc {
    name: String,
    source: UpvalSource,
}

#[derive(Debug, Clone)]
struct LocalSlot {
    name: String,
    attrib: Option<Attrib>,
    reg: u8,
    start_pc: u32,
}

#[derive(Debug, Clone)]
struct LabelDesc {
    name: String,
    pc: usize,
    nactive: usize,
}

#[derive(Debug, Clone)]
struct GotoDesc {
    name: String,
    pc: usize,
    nactive: usize,
    line: u32,
}

#[derive(Debug)]
struct BlockCx {
    first_local: usize,
    saved_freereg: u8,
    is_loop: bool,
    breaks: Vec<usize>,
    has_upval: bool,
    has_close: bool,
    labels: Vec<LabelDesc>,
    gotos: Vec<GotoDesc>,
}

#[derive(Debug)]
struct FuncState {
    proto: Prototype,
    const_map: BTreeMap<ConstKey, u32>,
    upvals: Vec<UpvalDesc>,
    blocks: Vec<BlockCx>,
    actvar: Vec<LocalSlot>,
    freereg: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ConstKey {
    Nil,
    Bool(bool),
    Number(Uint256),
    Str(String),
    Address(Address),
}

impl From<&Constant> for ConstKey {
    fn from(c: &Constant) -> Self {
        match c {
            Constant::Nil => ConstKey::Nil,
            Constant::Bool(b) => ConstKey::Bool(*b),
            Constant::Number(n) => ConstKey::Number(*n),
            Constant::Str(s) => ConstKey::Str(s.clone()),
            Constant::Address(a) => ConstKey::Address(*a),
        }
    }
}

fn finish_proto(state: FuncState) -> Prototype {
    let mut proto = state.proto;
    proto.num_upvalues = state.upvals.len() as u8;
    proto.debug.upvalue_names = state.upvals.iter().map(|u| u.name.clone()).collect();
    proto
}

struct Compiler {
    chunk: String,
    fs: Vec<FuncState>,
}

impl Compiler {
    // ---- function/block bookkeeping -------------------------------------

    fn push_func(&mut self, source: &str, line: u32, is_vararg: bool, params: &[String]) {
        let mut state = FuncState {
            proto: Prototype {
                source: source.to_string(),
                line_defined: line,
                last_line_defined: line,
                num_params: params.len() as u8,
                is_vararg,
                max_stack: params.len().max(2) as u8,
                ..Prototype::default()
            },
            const_map: BTreeMap::new(),
            upvals: Vec::new(),
            blocks: Vec::new(),
            actvar: Vec::new(),
            freereg: params.len() as u8,
        };
        for (i, param) in params.iter().enumerate() {
            state.actvar.push(LocalSlot {
                name: param.clone(),
                attrib: None,
                reg: i as u8,
                start_pc: 0,
            });
        }
        self.fs.push(state);
    }

    fn fs(&mut self) -> &mut FuncState {
        self.fs.last_mut().expect("active function state")
    }

    fn fs_ref(&self) -> &FuncState {
        self.fs.last().expect("active function state")
    }

    fn enter_block(&mut self, is_loop: bool) {
        let first_local = self.fs_ref().actvar.len();
        let saved_freereg = self.fs_ref().freereg;
        self.fs().blocks.push(BlockCx {
            first_local,
            saved_freereg,
            is_loop,
            breaks: Vec::new(),
            has_upval: false,
            has_close: false,
            labels: Vec::new(),
            gotos: Vec::new(),
        });
    }

    /// Close the innermost block: emit `CLOSE` when it owned captured or
    /// closable locals, retire its locals, and propagate unresolved gotos.
    fn leave_block(&mut self, line: u32) -> Result<(), CompileError> {
        let block = self.fs().blocks.pop().expect("open block");
        if block.has_upval || block.has_close {
            let reg = self
                .fs_ref()
                .actvar
                .get(block.first_local)
                .map(|s| s.reg)
                .unwrap_or(block.saved_freereg);
            self.emit(
                Instruction::abc(OpCode::Close, reg, block.has_close as u16, 0),
                line,
            );
        }
        let end_pc = self.fs_ref().proto.code.len() as u32;
        let fs = self.fs();
        for slot in fs.actvar.drain(block.first_local..) {
            fs.proto.debug.locals.push(LocalVar {
                name: slot.name,
                start_pc: slot.start_pc,
                end_pc,
            });
        }
        fs.freereg = block.saved_freereg;
        if !block.gotos.is_empty() {
            let first_local = block.first_local;
            match fs.blocks.last_mut() {
                Some(parent) => {
                    for mut g in block.gotos {
                        g.nactive = g.nactive.min(first_local);
                        parent.gotos.push(g);
                    }
                }
                None => {
                    let g = &block.gotos[0];
                    return Err(CompileError::codegen(
                        &self.chunk,
                        g.line,
                        "TOL4005",
                        format!("no visible label '{}' for goto", g.name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn locals_top(&self) -> u8 {
        self.fs_ref()
            .actvar
            .last()
            .map(|s| s.reg + 1)
            .unwrap_or(0)
            .max(
                self.fs_ref()
                    .blocks
                    .last()
                    .map(|b| b.saved_freereg)
                    .unwrap_or(0),
            )
    }

    fn declare_local(&mut self, name: &str, attrib: Option<Attrib>, reg: u8) {
        let start_pc = self.fs_ref().proto.code.len() as u32;
        if attrib == Some(Attrib::Close) {
            if let Some(block) = self.fs().blocks.last_mut() {
                block.has_close = true;
            }
        }
        self.fs().actvar.push(LocalSlot {
            name: name.to_string(),
            attrib,
            reg,
            start_pc,
        });
    }

    // ---- emission helpers ------------------------------------------------

    fn emit(&mut self, ins: Instruction, line: u32) -> usize {
        let fs = self.fs();
        fs.proto.code.push(ins.word());
        fs.proto.debug.source_positions.push(line);
        fs.proto.code.len() - 1
    }

    fn pc(&self) -> usize {
        self.fs_ref().proto.code.len()
    }

    fn patch_jump(&mut self, jmp_pc: usize, target: usize, line: u32) -> Result<(), CompileError> {
        let sbx = target as i64 - (jmp_pc as i64 + 1);
        if sbx.unsigned_abs() > MAX_ARG_SBX as u64 {
            return Err(self.err_codegen(line, "TOL4003", "control structure too long"));
        }
        let old = Instruction::from_word(self.fs_ref().proto.code[jmp_pc]);
        let op = old.op().expect("patching an encoded jump");
        self.fs().proto.code[jmp_pc] =
            Instruction::asbx(op, old.a(), sbx as i32).word();
        Ok(())
    }

    fn patch_jump_here(&mut self, jmp_pc: usize, line: u32) -> Result<(), CompileError> {
        let target = self.pc();
        self.patch_jump(jmp_pc, target, line)
    }

    fn err_codegen(&self, line: u32, code: &str, msg: impl Into<String>) -> CompileError {
        CompileError::codegen(&self.chunk, line, code, msg)
    }

    fn const_index(&mut self, c: Constant, line: u32) -> Result<u32, CompileError> {
        let key = ConstKey::from(&c);
        if let Some(&idx) = self.fs_ref().const_map.get(&key) {
            return Ok(idx);
        }
        let idx = self.fs_ref().proto.constants.len() as u32;
        if idx > MAX_ARG_BX {
            return Err(self.err_codegen(line, "TOL4002", "too many constants in one function"));
        }
        let fs = self.fs();
        fs.proto.constants.push(c);
        fs.const_map.insert(key, idx);
        Ok(idx)
    }

    fn reserve(&mut self, n: u8, line: u32) -> Result<u8, CompileError> {
        let base = self.fs_ref().freereg;
        let top = u16::from(base) + u16::from(n);
        if top > MAX_REGISTERS {
            return Err(self.err_codegen(
                line,
                "TOL4001",
                "function or expression needs too many registers",
            ));
        }
        let fs = self.fs();
        fs.freereg = top as u8;
        if fs.freereg > fs.proto.max_stack {
            fs.proto.max_stack = fs.freereg;
        }
        Ok(base)
    }

    fn free_to(&mut self, level: u8) {
        let floor = self.locals_top();
        self.fs().freereg = level.max(floor);
    }

    // ---- name resolution -------------------------------------------------

    fn resolve_name(&mut self, name: &str) -> NameRef {
        self.resolve_at(self.fs.len() - 1, name)
    }

    fn resolve_at(&mut self, level: usize, name: &str) -> NameRef {
        if let Some(slot) = self.fs[level].actvar.iter().rev().find(|s| s.name == name) {
            return NameRef::Local(slot.reg);
        }
        if let Some(idx) = self.fs[level].upvals.iter().position(|u| u.name == name) {
            return NameRef::Upval(idx as u8);
        }
        if level == 0 {
            return NameRef::Global;
        }
        match self.resolve_at(level - 1, name) {
            NameRef::Global => NameRef::Global,
            NameRef::Local(reg) => {
                self.mark_block_upval(level - 1, reg);
                self.add_upval(level, name, UpvalSource::ParentLocal(reg))
            }
            NameRef::Upval(idx) => {
                self.add_upval(level, name, UpvalSource::ParentUpval(idx))
            }
        }
    }

    /// Mark the innermost block of `level` holding the captured register,
    /// so leaving that block emits `CLOSE`.
    fn mark_block_upval(&mut self, level: usize, reg: u8) {
        let fs = &mut self.fs[level];
        let Some(slot_idx) = fs.actvar.iter().rposition(|s| s.reg == reg) else {
            return;
        };
        for block in fs.blocks.iter_mut().rev() {
            if block.first_local <= slot_idx {
                block.has_upval = true;
                return;
            }
        }
    }

    fn add_upval(&mut self, level: usize, name: &str, source: UpvalSource) -> NameRef {
        let fs = &mut self.fs[level];
        if let Some(idx) = fs.upvals.iter().position(|u| u.name == name) {
            return NameRef::Upval(idx as u8);
        }
        fs.upvals.push(UpvalDesc {
            name: name.to_string(),
            source,
        });
        NameRef::Upval((fs.upvals.len() - 1) as u8)
    }

    fn find_const_attrib(&self, name: &str) -> bool {
        self.fs_ref()
            .actvar
            .iter()
            .rev()
            .find(|s| s.name == name)
            .map(|s| s.attrib == Some(Attrib::Const))
            .unwrap_or(false)
    }

    // ---- expressions -----------------------------------------------------

    fn literal_constant(&self, node: &ExprNode) -> Option<Constant> {
        if let Some(n) = fold::fold(node) {
            return Some(Constant::Number(n));
        }
        match &node.expr {
            Expr::Str(s) => Some(Constant::Str(s.clone())),
            Expr::True => Some(Constant::Bool(true)),
            Expr::False => Some(Constant::Bool(false)),
            _ => None,
        }
    }

    /// Compile into an RK operand: constants go to the pool when the index
    /// fits the 8-bit constant window, everything else lands in a fresh
    /// register.
    fn expr_to_rk(&mut self, node: &ExprNode) -> Result<u16, CompileError> {
        if let Some(c) = self.literal_constant(node) {
            let idx = self.const_index(c, node.line)?;
            if idx <= 0xff {
                return Ok(RK_CONSTANT_FLAG | idx as u16);
            }
        }
        Ok(u16::from(self.expr_to_next_reg(node)?))
    }

    fn expr_to_next_reg(&mut self, node: &ExprNode) -> Result<u8, CompileError> {
        match &node.expr {
            Expr::Call(..) | Expr::Method(..) => self.compile_call(node, 1),
            _ => {
                let dest = self.reserve(1, node.line)?;
                self.expr_to_reg(node, dest)?;
                Ok(dest)
            }
        }
    }

    fn expr_to_reg(&mut self, node: &ExprNode, dest: u8) -> Result<(), CompileError> {
        let line = node.line;
        if let Some(n) = fold::fold(node) {
            let idx = self.const_index(Constant::Number(n), line)?;
            self.emit(Instruction::abx(OpCode::LoadK, dest, idx), line);
            return Ok(());
        }
        match &node.expr {
            Expr::Nil => {
                self.emit(Instruction::abc(OpCode::LoadNil, dest, u16::from(dest), 0), line);
            }
            Expr::True => {
                self.emit(Instruction::abc(OpCode::LoadBool, dest, 1, 0), line);
            }
            Expr::False => {
                self.emit(Instruction::abc(OpCode::LoadBool, dest, 0, 0), line);
            }
            Expr::Number(n) => {
                let idx = self.const_index(Constant::Number(*n), line)?;
                self.emit(Instruction::abx(OpCode::LoadK, dest, idx), line);
            }
            Expr::Str(s) => {
                let idx = self.const_index(Constant::Str(s.clone()), line)?;
                self.emit(Instruction::abx(OpCode::LoadK, dest, idx), line);
            }
            Expr::Vararg => {
                self.emit(Instruction::abc(OpCode::Vararg, dest, 2, 0), line);
            }
            Expr::Name(name) => match self.resolve_name(name) {
                NameRef::Local(reg) => {
                    if reg != dest {
                        self.emit(
                            Instruction::abc(OpCode::Move, dest, u16::from(reg), 0),
                            line,
                        );
                    }
                }
                NameRef::Upval(idx) => {
                    self.emit(
                        Instruction::abc(OpCode::GetUpval, dest, u16::from(idx), 0),
                        line,
                    );
                }
                NameRef::Global => {
                    let idx = self.const_index(Constant::Str(name.clone()), line)?;
                    self.emit(Instruction::abx(OpCode::GetGlobal, dest, idx), line);
                }
            },
            Expr::Index(obj, key) => {
                let save = self.fs_ref().freereg;
                let obj_reg = self.expr_to_next_reg(obj)?;
                let (op, key_rk) = self.index_key(key)?;
                self.emit(
                    Instruction::abc(op, dest, u16::from(obj_reg), key_rk),
                    line,
                );
                self.free_to(save);
            }
            Expr::Call(..) | Expr::Method(..) => {
                let save = self.fs_ref().freereg;
                let base = self.compile_call(node, 1)?;
                if base != dest {
                    self.emit(
                        Instruction::abc(OpCode::Move, dest, u16::from(base), 0),
                        line,
                    );
                }
                self.free_to(save);
            }
            Expr::Function(body) => {
                self.function_to_reg(body, dest)?;
            }
            Expr::Table(fields) => {
                self.table_to_reg(fields, dest, line)?;
            }
            Expr::BinOp(op, lhs, rhs) => {
                self.binop_to_reg(*op, lhs, rhs, dest, line)?;
            }
            Expr::UnOp(op, operand) => {
                let save = self.fs_ref().freereg;
                let src = self.expr_to_next_reg(operand)?;
                let opcode = match op {
                    UnOp::Unm => OpCode::Unm,
                    UnOp::Not => OpCode::Not,
                    UnOp::Len => OpCode::Len,
                    UnOp::BNot => OpCode::BNot,
                };
                self.emit(
                    Instruction::abc(opcode, dest, u16::from(src), 0),
                    line,
                );
                self.free_to(save);
            }
        }
        Ok(())
    }

    /// Key operand of a table access: string literals pick the
    /// string-keyed opcodes.
    fn index_key(&mut self, key: &ExprNode) -> Result<(OpCode, u16), CompileError> {
        if let Expr::Str(s) = &key.expr {
            let idx = self.const_index(Constant::Str(s.clone()), key.line)?;
            if idx <= 0xff {
                return Ok((OpCode::GetTableKs, RK_CONSTANT_FLAG | idx as u16));
            }
        }
        Ok((OpCode::GetTable, self.expr_to_rk(key)?))
    }

    fn binop_to_reg(
        &mut self,
        op: BinOp,
        lhs: &ExprNode,
        rhs: &ExprNode,
        dest: u8,
        line: u32,
    ) -> Result<(), CompileError> {
        match op {
            BinOp::And | BinOp::Or => {
                self.expr_to_reg(lhs, dest)?;
                let c = if op == BinOp::Or { 1 } else { 0 };
                self.emit(
                    Instruction::abc(OpCode::TestSet, dest, u16::from(dest), c),
                    line,
                );
                let skip = self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line);
                self.expr_to_reg(rhs, dest)?;
                self.patch_jump_here(skip, line)?;
            }
            BinOp::Concat => {
                let save = self.fs_ref().freereg;
                let mut parts = Vec::new();
                flatten_concat(lhs, rhs, &mut parts);
                let base = self.fs_ref().freereg;
                for part in &parts {
                    let reg = self.expr_to_next_reg(part)?;
                    debug_assert!(reg >= base);
                }
                let last = base + (parts.len() - 1) as u8;
                self.emit(
                    Instruction::abc(OpCode::Concat, dest, u16::from(base), u16::from(last)),
                    line,
                );
                self.free_to(save);
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let save = self.fs_ref().freereg;
                let (opcode, a_flag, swap) = comparison(op);
                let (first, second) = if swap { (rhs, lhs) } else { (lhs, rhs) };
                let rb = self.expr_to_rk(first)?;
                let rc = self.expr_to_rk(second)?;
                self.emit(Instruction::abc(opcode, a_flag, rb, rc), line);
                self.emit(Instruction::asbx(OpCode::Jmp, 0, 1), line);
                self.emit(Instruction::abc(OpCode::LoadBool, dest, 0, 1), line);
                self.emit(Instruction::abc(OpCode::LoadBool, dest, 1, 0), line);
                self.free_to(save);
            }
            _ => {
                let save = self.fs_ref().freereg;
                let rb = self.expr_to_rk(lhs)?;
                let rc = self.expr_to_rk(rhs)?;
                let opcode = arith_opcode(op);
                self.emit(Instruction::abc(opcode, dest, rb, rc), line);
                self.free_to(save);
            }
        }
        Ok(())
    }

    /// Compile a table constructor. `SETLIST` flushes item blocks from the
    /// registers right above the table, so when `dest` is not the top of
    /// the register window the table builds in a scratch register first.
    fn table_to_reg(
        &mut self,
        fields: &[TableField],
        dest: u8,
        line: u32,
    ) -> Result<(), CompileError> {
        if self.fs_ref().freereg != dest + 1 {
            let save = self.fs_ref().freereg;
            let scratch = self.reserve(1, line)?;
            self.table_into_top(fields, scratch, line)?;
            self.emit(
                Instruction::abc(OpCode::Move, dest, u16::from(scratch), 0),
                line,
            );
            self.free_to(save);
            return Ok(());
        }
        self.table_into_top(fields, dest, line)
    }

    fn table_into_top(
        &mut self,
        fields: &[TableField],
        dest: u8,
        line: u32,
    ) -> Result<(), CompileError> {
        let items: Vec<&ExprNode> = fields
            .iter()
            .filter_map(|f| match f {
                TableField::Item(e) => Some(e),
                TableField::Pair(..) => None,
            })
            .collect();
        let pairs: Vec<(&ExprNode, &ExprNode)> = fields
            .iter()
            .filter_map(|f| match f {
                TableField::Pair(k, v) => Some((k, v)),
                TableField::Item(_) => None,
            })
            .collect();
        self.emit(
            Instruction::abc(
                OpCode::NewTable,
                dest,
                (items.len() as u16).min(0x1ff),
                (pairs.len() as u16).min(0x1ff),
            ),
            line,
        );
        let fpf = OpCode::FIELDS_PER_FLUSH as usize;
        for (block_idx, chunk) in items.chunks(fpf).enumerate() {
            let save = self.fs_ref().freereg;
            let is_last_chunk = (block_idx + 1) * fpf >= items.len();
            let mut multi = false;
            for (i, item) in chunk.iter().enumerate() {
                let is_last = is_last_chunk && i + 1 == chunk.len();
                if is_last
                    && matches!(item.expr, Expr::Call(..) | Expr::Method(..))
                {
                    self.compile_call(item, -1)?;
                    multi = true;
                } else if is_last && matches!(item.expr, Expr::Vararg) {
                    let base = self.reserve(1, item.line)?;
                    self.emit(Instruction::abc(OpCode::Vararg, base, 0, 0), item.line);
                    multi = true;
                } else {
                    self.expr_to_next_reg(item)?;
                }
            }
            let b = if multi { 0 } else { chunk.len() as u16 };
            let block = (block_idx + 1) as u32;
            if block <= 0x1ff {
                self.emit(
                    Instruction::abc(OpCode::SetList, dest, b, block as u16),
                    line,
                );
            } else {
                self.emit(Instruction::abc(OpCode::SetList, dest, b, 0), line);
                // Raw block index word.
                let fs = self.fs();
                fs.proto.code.push(block);
                fs.proto.debug.source_positions.push(line);
            }
            self.free_to(save);
        }
        for (key, value) in pairs {
            let save = self.fs_ref().freereg;
            let (key_rk, ks) = if let Expr::Str(s) = &key.expr {
                let idx = self.const_index(Constant::Str(s.clone()), key.line)?;
                if idx <= 0xff {
                    (RK_CONSTANT_FLAG | idx as u16, true)
                } else {
                    (self.expr_to_rk(key)?, false)
                }
            } else {
                (self.expr_to_rk(key)?, false)
            };
            let value_rk = self.expr_to_rk(value)?;
            let op = if ks { OpCode::SetTableKs } else { OpCode::SetTable };
            self.emit(Instruction::abc(op, dest, key_rk, value_rk), line);
            self.free_to(save);
        }
        Ok(())
    }

    /// Compile a call expression. `nresults` of `-1` keeps all results
    /// (`C == 0`); otherwise that many result registers stay reserved.
    /// Returns the base register holding the first result.
    fn compile_call(&mut self, node: &ExprNode, nresults: i8) -> Result<u8, CompileError> {
        let line = node.line;
        let base = self.fs_ref().freereg;
        let args: &[ExprNode] = match &node.expr {
            Expr::Call(f, args) => {
                let freg = self.expr_to_next_reg(f)?;
                debug_assert_eq!(freg, base);
                self.record_call_site(f, base);
                args
            }
            Expr::Method(obj, name, args) => {
                let oreg = self.expr_to_next_reg(obj)?;
                debug_assert_eq!(oreg, base);
                self.reserve(1, line)?;
                let idx = self.const_index(Constant::Str(name.clone()), line)?;
                let rk = if idx <= 0xff {
                    RK_CONSTANT_FLAG | idx as u16
                } else {
                    return Err(self.err_codegen(
                        line,
                        "TOL4002",
                        "too many constants in one function",
                    ));
                };
                self.emit(
                    Instruction::abc(OpCode::OpSelf, base, u16::from(base), rk),
                    line,
                );
                args
            }
            _ => unreachable!("compile_call on a non-call expression"),
        };
        let extra_self = matches!(node.expr, Expr::Method(..)) as u16;
        let mut multi_args = false;
        for (i, arg) in args.iter().enumerate() {
            let is_last = i + 1 == args.len();
            if is_last && matches!(arg.expr, Expr::Call(..) | Expr::Method(..)) {
                self.compile_call(arg, -1)?;
                multi_args = true;
            } else if is_last && matches!(arg.expr, Expr::Vararg) {
                let vbase = self.reserve(1, arg.line)?;
                self.emit(Instruction::abc(OpCode::Vararg, vbase, 0, 0), arg.line);
                multi_args = true;
            } else {
                self.expr_to_next_reg(arg)?;
            }
        }
        let b = if multi_args {
            0
        } else {
            args.len() as u16 + 1 + extra_self
        };
        let c = if nresults < 0 { 0 } else { nresults as u16 + 1 };
        self.emit(Instruction::abc(OpCode::Call, base, b, c), line);
        self.free_to(base);
        if nresults > 0 {
            self.reserve(nresults as u8, line)?;
        }
        Ok(base)
    }

    fn record_call_site(&mut self, f: &ExprNode, _base: u8) {
        let name = match &f.expr {
            Expr::Name(n) => n.clone(),
            Expr::Index(_, key) => match &key.expr {
                Expr::Str(s) => s.clone(),
                _ => return,
            },
            _ => return,
        };
        let pc = self.pc() as u32;
        self.fs()
            .proto
            .debug
            .calls
            .push(tol_asm::CallSite { name, pc });
    }

    fn function_to_reg(&mut self, body: &FuncBody, dest: u8) -> Result<(), CompileError> {
        let source = self.fs_ref().proto.source.clone();
        self.push_func(&source, body.line, body.is_vararg, &body.params);
        self.fs().proto.last_line_defined = body.end_line;
        self.enter_block(false);
        self.compile_block(&body.block)?;
        self.leave_block(body.end_line)?;
        self.emit(Instruction::abc(OpCode::Return, 0, 1, 0), body.end_line);
        let state = self.fs.pop().expect("function state");
        let upvals = state.upvals.clone();
        let mut proto = finish_proto(state);
        peephole::patch_code(&mut proto);

        let idx = self.fs_ref().proto.protos.len() as u32;
        if idx > MAX_ARG_BX {
            return Err(self.err_codegen(
                body.line,
                "TOL4004",
                "too many nested functions",
            ));
        }
        self.fs().proto.protos.push(proto);
        self.emit(Instruction::abx(OpCode::Closure, dest, idx), body.line);
        // Pseudo-instructions binding the upvalues; the VM consumes them
        // as part of CLOSURE.
        for upval in &upvals {
            match upval.source {
                UpvalSource::ParentLocal(reg) => {
                    self.emit(
                        Instruction::abc(OpCode::Move, 0, u16::from(reg), 0),
                        body.line,
                    );
                }
                UpvalSource::ParentUpval(idx) => {
                    self.emit(
                        Instruction::abc(OpCode::GetUpval, 0, u16::from(idx), 0),
                        body.line,
                    );
                }
            }
        }
        Ok(())
    }

    // ---- statements ------------------------------------------------------

    fn compile_block(&mut self, block: &Block) -> Result<(), CompileError> {
        for stat in &block.stats {
            self.compile_stat(stat)?;
            let top = self.locals_top();
            self.free_to(top);
        }
        Ok(())
    }

    fn compile_stat(&mut self, node: &StatNode) -> Result<(), CompileError> {
        let line = node.line;
        match &node.stat {
            Stat::Local(names, exprs) => self.local_stat(names, exprs, line),
            Stat::Assign(targets, values) => self.assign_stat(targets, values, line),
            Stat::Call(call) => {
                self.compile_call(call, 0)?;
                Ok(())
            }
            Stat::Do(body) => {
                self.enter_block(false);
                self.compile_block(body)?;
                self.leave_block(line)
            }
            Stat::If(arms, else_block) => self.if_stat(arms, else_block.as_ref(), line),
            Stat::While(cond, body) => self.while_stat(cond, body, line),
            Stat::Repeat(body, cond) => self.repeat_stat(body, cond, line),
            Stat::NumericFor {
                var,
                start,
                stop,
                step,
                body,
            } => self.numeric_for(var, start, stop, step.as_ref(), body, line),
            Stat::GenericFor { vars, exprs, body } => {
                self.generic_for(vars, exprs, body, line)
            }
            Stat::FunctionDecl { target, body, .. } => {
                let save = self.fs_ref().freereg;
                let reg = self.reserve(1, line)?;
                self.function_to_reg(body, reg)?;
                self.assign_to_target(target, reg, line)?;
                self.free_to(save);
                Ok(())
            }
            Stat::LocalFunction { name, body } => {
                let reg = self.reserve(1, line)?;
                // The local is visible inside its own body for recursion.
                self.declare_local(name, None, reg);
                self.function_to_reg(body, reg)
            }
            Stat::Return(exprs) => self.return_stat(exprs, line),
            Stat::Break => self.break_stat(line),
            Stat::Goto(label) => self.goto_stat(label, line),
            Stat::Label(name) => self.label_stat(name, line),
        }
    }

    fn local_stat(
        &mut self,
        names: &[(String, Option<Attrib>)],
        exprs: &[ExprNode],
        line: u32,
    ) -> Result<(), CompileError> {
        let base = self.fs_ref().freereg;
        self.adjust_assign(names.len(), exprs, line)?;
        for (i, (name, attrib)) in names.iter().enumerate() {
            self.declare_local(name, *attrib, base + i as u8);
        }
        self.fs().freereg = base + names.len() as u8;
        Ok(())
    }

    /// Compile `exprs` into `want` consecutive registers at the current
    /// top, nil-padding or discarding extras, expanding a trailing call or
    /// vararg when more values are wanted than expressions given.
    fn adjust_assign(
        &mut self,
        want: usize,
        exprs: &[ExprNode],
        line: u32,
    ) -> Result<(), CompileError> {
        let base = self.fs_ref().freereg;
        for (i, expr) in exprs.iter().enumerate() {
            let is_last = i + 1 == exprs.len();
            let missing = want.saturating_sub(exprs.len());
            if is_last && missing > 0 {
                match &expr.expr {
                    Expr::Call(..) | Expr::Method(..) => {
                        self.compile_call(expr, (missing + 1) as i8)?;
                        return Ok(());
                    }
                    Expr::Vararg => {
                        let vbase = self.reserve((missing + 1) as u8, expr.line)?;
                        self.emit(
                            Instruction::abc(
                                OpCode::Vararg,
                                vbase,
                                (missing + 2) as u16,
                                0,
                            ),
                            expr.line,
                        );
                        return Ok(());
                    }
                    _ => {}
                }
            }
            self.expr_to_next_reg(expr)?;
        }
        if exprs.len() < want {
            let first = base + exprs.len() as u8;
            let last = base + want as u8 - 1;
            self.reserve((want - exprs.len()) as u8, line)?;
            self.emit(
                Instruction::abc(OpCode::LoadNil, first, u16::from(last), 0),
                line,
            );
        } else if exprs.len() > want {
            // Extra values were evaluated for their effects only.
            self.free_to(base + want as u8);
        }
        Ok(())
    }

    fn assign_stat(
        &mut self,
        targets: &[ExprNode],
        values: &[ExprNode],
        line: u32,
    ) -> Result<(), CompileError> {
        // Single `name = expr` with a local target writes in place.
        if targets.len() == 1 && values.len() == 1 {
            if let Expr::Name(name) = &targets[0].expr {
                if self.find_const_attrib(name) {
                    return Err(self.err_codegen(
                        line,
                        "TOL4006",
                        format!("attempt to assign to const variable '{name}'"),
                    ));
                }
                if let NameRef::Local(reg) = self.resolve_name(name) {
                    let save = self.fs_ref().freereg;
                    self.expr_to_reg(&values[0], reg)?;
                    self.free_to(save);
                    return Ok(());
                }
            }
        }
        let save = self.fs_ref().freereg;
        let base = save;
        self.adjust_assign(targets.len(), values, line)?;
        self.fs().freereg = base + targets.len() as u8;
        // Right-to-left so earlier targets cannot clobber the registers
        // later targets still need.
        for (i, target) in targets.iter().enumerate().rev() {
            let vreg = base + i as u8;
            self.assign_to_target(target, vreg, line)?;
        }
        self.free_to(save);
        Ok(())
    }

    fn assign_to_target(
        &mut self,
        target: &ExprNode,
        vreg: u8,
        line: u32,
    ) -> Result<(), CompileError> {
        match &target.expr {
            Expr::Name(name) => {
                if self.find_const_attrib(name) {
                    return Err(self.err_codegen(
                        line,
                        "TOL4006",
                        format!("attempt to assign to const variable '{name}'"),
                    ));
                }
                match self.resolve_name(name) {
                    NameRef::Local(reg) => {
                        if reg != vreg {
                            self.emit(
                                Instruction::abc(OpCode::Move, reg, u16::from(vreg), 0),
                                line,
                            );
                        }
                    }
                    NameRef::Upval(idx) => {
                        self.emit(
                            Instruction::abc(OpCode::SetUpval, vreg, u16::from(idx), 0),
                            line,
                        );
                    }
                    NameRef::Global => {
                        let idx = self.const_index(Constant::Str(name.clone()), line)?;
                        self.emit(Instruction::abx(OpCode::SetGlobal, vreg, idx), line);
                    }
                }
            }
            Expr::Index(obj, key) => {
                let save = self.fs_ref().freereg;
                let obj_reg = self.expr_to_next_reg(obj)?;
                let (key_rk, ks) = if let Expr::Str(s) = &key.expr {
                    let idx = self.const_index(Constant::Str(s.clone()), key.line)?;
                    if idx <= 0xff {
                        (RK_CONSTANT_FLAG | idx as u16, true)
                    } else {
                        (self.expr_to_rk(key)?, false)
                    }
                } else {
                    (self.expr_to_rk(key)?, false)
                };
                let op = if ks { OpCode::SetTableKs } else { OpCode::SetTable };
                self.emit(
                    Instruction::abc(op, obj_reg, key_rk, u16::from(vreg)),
                    line,
                );
                self.free_to(save);
            }
            _ => {
                return Err(self.err_codegen(
                    line,
                    "TOL4007",
                    "cannot assign to this expression",
                ))
            }
        }
        Ok(())
    }

    /// Evaluate a condition and emit the test; returns the pc of the jump
    /// taken when the condition is false.
    fn cond_jump_if_false(&mut self, cond: &ExprNode) -> Result<usize, CompileError> {
        let save = self.fs_ref().freereg;
        let reg = self.expr_to_next_reg(cond)?;
        self.emit(
            Instruction::abc(OpCode::Test, reg, 0, 0),
            cond.line,
        );
        let jmp = self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), cond.line);
        self.free_to(save);
        Ok(jmp)
    }

    fn if_stat(
        &mut self,
        arms: &[(ExprNode, Block)],
        else_block: Option<&Block>,
        line: u32,
    ) -> Result<(), CompileError> {
        let mut end_jumps = Vec::new();
        for (i, (cond, body)) in arms.iter().enumerate() {
            let false_jmp = self.cond_jump_if_false(cond)?;
            self.enter_block(false);
            self.compile_block(body)?;
            self.leave_block(line)?;
            let is_last_arm = i + 1 == arms.len();
            if !is_last_arm || else_block.is_some() {
                end_jumps.push(self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line));
            }
            self.patch_jump_here(false_jmp, line)?;
        }
        if let Some(body) = else_block {
            self.enter_block(false);
            self.compile_block(body)?;
            self.leave_block(line)?;
        }
        for jmp in end_jumps {
            self.patch_jump_here(jmp, line)?;
        }
        Ok(())
    }

    fn while_stat(
        &mut self,
        cond: &ExprNode,
        body: &Block,
        line: u32,
    ) -> Result<(), CompileError> {
        let top = self.pc();
        let exit_jmp = self.cond_jump_if_false(cond)?;
        self.enter_block(true);
        self.compile_block(body)?;
        let block_breaks = self.take_loop_breaks();
        self.leave_block(line)?;
        let back = self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line);
        self.patch_jump(back, top, line)?;
        self.patch_jump_here(exit_jmp, line)?;
        for b in block_breaks {
            self.patch_jump_here(b, line)?;
        }
        Ok(())
    }

    fn repeat_stat(
        &mut self,
        body: &Block,
        cond: &ExprNode,
        line: u32,
    ) -> Result<(), CompileError> {
        let top = self.pc();
        self.enter_block(true);
        self.compile_block(body)?;
        // The condition sees the body's locals.
        let save = self.fs_ref().freereg;
        let reg = self.expr_to_next_reg(cond)?;
        self.emit(Instruction::abc(OpCode::Test, reg, 0, 0), cond.line);
        let back = self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), cond.line);
        self.free_to(save);
        self.patch_jump(back, top, line)?;
        let block_breaks = self.take_loop_breaks();
        self.leave_block(line)?;
        for b in block_breaks {
            self.patch_jump_here(b, line)?;
        }
        Ok(())
    }

    fn numeric_for(
        &mut self,
        var: &str,
        start: &ExprNode,
        stop: &ExprNode,
        step: Option<&ExprNode>,
        body: &Block,
        line: u32,
    ) -> Result<(), CompileError> {
        let base = self.fs_ref().freereg;
        self.expr_to_next_reg(start)?;
        self.expr_to_next_reg(stop)?;
        match step {
            Some(step) => {
                self.expr_to_next_reg(step)?;
            }
            None => {
                let reg = self.reserve(1, line)?;
                let idx = self.const_index(Constant::Number(Uint256::ONE), line)?;
                self.emit(Instruction::abx(OpCode::LoadK, reg, idx), line);
            }
        }
        self.reserve(1, line)?; // user-visible loop variable
        let prep = self.emit(Instruction::asbx(OpCode::ForPrep, base, 0), line);
        self.enter_block(true);
        self.declare_local(var, None, base + 3);
        let body_start = self.pc();
        self.compile_block(body)?;
        let block_breaks = self.take_loop_breaks();
        self.leave_block(line)?;
        let loop_pc = self.emit(Instruction::asbx(OpCode::ForLoop, base, 0), line);
        self.patch_jump(loop_pc, body_start, line)?;
        self.patch_jump(prep, loop_pc, line)?;
        for b in block_breaks {
            self.patch_jump_here(b, line)?;
        }
        self.free_to(base);
        Ok(())
    }

    fn generic_for(
        &mut self,
        vars: &[String],
        exprs: &[ExprNode],
        body: &Block,
        line: u32,
    ) -> Result<(), CompileError> {
        let base = self.fs_ref().freereg;
        self.adjust_assign(3, exprs, line)?;
        self.fs().freereg = base + 3;
        self.reserve(vars.len() as u8, line)?;
        let entry_jmp = self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line);
        self.enter_block(true);
        for (i, var) in vars.iter().enumerate() {
            self.declare_local(var, None, base + 3 + i as u8);
        }
        let body_start = self.pc();
        self.compile_block(body)?;
        let block_breaks = self.take_loop_breaks();
        self.leave_block(line)?;
        self.patch_jump_here(entry_jmp, line)?;
        self.emit(
            Instruction::abc(OpCode::TForLoop, base, 0, vars.len() as u16),
            line,
        );
        let back = self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line);
        self.patch_jump(back, body_start, line)?;
        for b in block_breaks {
            self.patch_jump_here(b, line)?;
        }
        self.free_to(base);
        Ok(())
    }

    fn take_loop_breaks(&mut self) -> Vec<usize> {
        let block = self
            .fs()
            .blocks
            .last_mut()
            .expect("loop block open");
        std::mem::take(&mut block.breaks)
    }

    fn return_stat(&mut self, exprs: &[ExprNode], line: u32) -> Result<(), CompileError> {
        self.emit_pending_closes(0, line);
        if exprs.is_empty() {
            self.emit(Instruction::abc(OpCode::Return, 0, 1, 0), line);
            return Ok(());
        }
        // `return f(args)` becomes a tail call reusing the current frame.
        if exprs.len() == 1
            && matches!(exprs[0].expr, Expr::Call(..) | Expr::Method(..))
        {
            let save = self.fs_ref().freereg;
            let base = self.fs_ref().freereg;
            let call_pc = self.compile_call(&exprs[0], -1)?;
            debug_assert_eq!(call_pc, base);
            let fs = self.fs();
            let last = fs.proto.code.len() - 1;
            let old = Instruction::from_word(fs.proto.code[last]);
            fs.proto.code[last] =
                Instruction::abc(OpCode::TailCall, old.a(), old.b(), 0).word();
            self.emit(Instruction::abc(OpCode::Return, base, 0, 0), line);
            self.free_to(save);
            return Ok(());
        }
        let save = self.fs_ref().freereg;
        let base = save;
        let mut multi = false;
        for (i, expr) in exprs.iter().enumerate() {
            let is_last = i + 1 == exprs.len();
            if is_last && matches!(expr.expr, Expr::Call(..) | Expr::Method(..)) {
                self.compile_call(expr, -1)?;
                multi = true;
            } else if is_last && matches!(expr.expr, Expr::Vararg) {
                let vbase = self.reserve(1, expr.line)?;
                self.emit(Instruction::abc(OpCode::Vararg, vbase, 0, 0), expr.line);
                multi = true;
            } else {
                self.expr_to_next_reg(expr)?;
            }
        }
        let b = if multi { 0 } else { exprs.len() as u16 + 1 };
        self.emit(Instruction::abc(OpCode::Return, base, b, 0), line);
        self.free_to(save);
        Ok(())
    }

    /// Emit `CLOSE` for every open block that owns captured or closable
    /// locals, outermost first, before an instruction that leaves them all.
    fn emit_pending_closes(&mut self, down_to_block: usize, line: u32) {
        let mut close: Option<(u8, bool)> = None;
        for block in self.fs_ref().blocks.iter().skip(down_to_block) {
            if block.has_upval || block.has_close {
                let reg = self
                    .fs_ref()
                    .actvar
                    .get(block.first_local)
                    .map(|s| s.reg)
                    .unwrap_or(block.saved_freereg);
                let flag = block.has_close;
                close = match close {
                    None => Some((reg, flag)),
                    Some((r, f)) => Some((r.min(reg), f || flag)),
                };
            }
        }
        if let Some((reg, flag)) = close {
            self.emit(
                Instruction::abc(OpCode::Close, reg, flag as u16, 0),
                line,
            );
        }
    }

    fn break_stat(&mut self, line: u32) -> Result<(), CompileError> {
        let Some(loop_idx) = self
            .fs_ref()
            .blocks
            .iter()
            .rposition(|b| b.is_loop)
        else {
            return Err(self.err_codegen(line, "TOL4008", "break outside a loop"));
        };
        self.emit_pending_closes(loop_idx, line);
        let jmp = self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line);
        self.fs().blocks[loop_idx].breaks.push(jmp);
        Ok(())
    }

    fn goto_stat(&mut self, label: &str, line: u32) -> Result<(), CompileError> {
        // A label already visible in an open block resolves backward
        // immediately.
        let target = self
            .fs_ref()
            .blocks
            .iter()
            .rev()
            .find_map(|b| b.labels.iter().find(|l| l.name == label).map(|l| l.pc));
        let current_close = self
            .fs_ref()
            .blocks
            .last()
            .map(|b| b.has_close || b.has_upval)
            .unwrap_or(false);
        if current_close {
            let block_idx = self.fs_ref().blocks.len() - 1;
            self.emit_pending_closes(block_idx, line);
        }
        let jmp = self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line);
        match target {
            Some(pc) => self.patch_jump(jmp, pc, line),
            None => {
                let nactive = self.fs_ref().actvar.len();
                self.fs()
                    .blocks
                    .last_mut()
                    .expect("open block")
                    .gotos
                    .push(GotoDesc {
                        name: label.to_string(),
                        pc: jmp,
                        nactive,
                        line,
                    });
                Ok(())
            }
        }
    }

    fn label_stat(&mut self, name: &str, line: u32) -> Result<(), CompileError> {
        let pc = self.pc();
        let nactive = self.fs_ref().actvar.len();
        {
            let block = self.fs().blocks.last_mut().expect("open block");
            if block.labels.iter().any(|l| l.name == name) {
                return Err(CompileError::codegen(
                    &self.chunk,
                    line,
                    "TOL4009",
                    format!("label '{name}' already defined"),
                ));
            }
            block.labels.push(LabelDesc {
                name: name.to_string(),
                pc,
                nactive,
            });
        }
        // Resolve forward gotos waiting on this label.
        let pending: Vec<GotoDesc> = {
            let block = self.fs().blocks.last_mut().expect("open block");
            let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut block.gotos)
                .into_iter()
                .partition(|g| g.name == name);
            block.gotos = rest;
            matched
        };
        for g in pending {
            if nactive > g.nactive {
                let local = self.fs_ref().actvar[g.nactive].name.clone();
                return Err(CompileError::codegen(
                    &self.chunk,
                    g.line,
                    "TOL4010",
                    format!(
                        "goto '{}' jumps into the scope of local '{}'",
                        g.name, local
                    ),
                ));
            }
            self.patch_jump(g.pc, pc, g.line)?;
        }
        Ok(())
    }
}

fn flatten_concat<'a>(lhs: &'a ExprNode, rhs: &'a ExprNode, out: &mut Vec<&'a ExprNode>) {
    // Successive `..` flatten into one CONCAT range; the operator is
    // right-associative, so the chain hangs off the right child.
    if let Expr::BinOp(BinOp::Concat, l, r) = &lhs.expr {
        flatten_concat(l, r, out);
    } else {
        out.push(lhs);
    }
    if let Expr::BinOp(BinOp::Concat, l, r) = &rhs.expr {
        flatten_concat(l, r, out);
    } else {
        out.push(rhs);
    }
}

fn comparison(op: BinOp) -> (OpCode, u8, bool) {
    match op {
        BinOp::Eq => (OpCode::Eq, 1, false),
        BinOp::Ne => (OpCode::Eq, 0, false),
        BinOp::Lt => (OpCode::Lt, 1, false),
        BinOp::Le => (OpCode::Le, 1, false),
        BinOp::Gt => (OpCode::Lt, 1, true),
        BinOp::Ge => (OpCode::Le, 1, true),
        _ => unreachable!("not a comparison"),
    }
}

fn arith_opcode(op: BinOp) -> OpCode {
    match op {
        BinOp::Add => OpCode::Add,
        BinOp::Sub => OpCode::Sub,
        BinOp::Mul => OpCode::Mul,
        BinOp::Div => OpCode::Div,
        BinOp::Mod => OpCode::Mod,
        BinOp::Pow => OpCode::Pow,
        BinOp::IDiv => OpCode::IDiv,
        BinOp::BAnd => OpCode::BAnd,
        BinOp::BOr => OpCode::BOr,
        BinOp::BXor => OpCode::BXor,
        BinOp::Shl => OpCode::Shl,
        BinOp::Shr => OpCode::Shr,
        _ => unreachable!("not an arithmetic operator"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::lexer::lex;
    use crate::lua::parser::parse;

    fn compile(src: &str) -> Prototype {
        let block = parse(lex(src, "@t").unwrap(), "@t").unwrap();
        compile_chunk(&block, "@t").unwrap()
    }

    fn ops(proto: &Prototype) -> Vec<OpCode> {
        let mut out = Vec::new();
        let mut pc = 0;
        while pc < proto.code.len() {
            let ins = Instruction::from_word(proto.code[pc]);
            let op = ins.op().unwrap();
            if op == OpCode::SetList && ins.c() == 0 {
                pc += 1;
            }
            if op == OpCode::Closure {
                pc += proto.protos[ins.bx() as usize].num_upvalues as usize;
            }
            out.push(op);
            pc += 1;
        }
        out
    }

    #[test]
    fn compilation_is_deterministic() {
        let src = "local a = 1 _x = a + 2 _y = {1, 2, k = 3}";
        assert_eq!(compile(src), compile(src));
    }

    #[test]
    fn constant_folding_collapses_arithmetic() {
        let proto = compile("_result = (2 ^ 8) + (0xF0 | 0x0F)");
        // One LOADK of the folded value, one SETGLOBAL, final RETURN.
        assert_eq!(
            ops(&proto),
            vec![OpCode::LoadK, OpCode::SetGlobal, OpCode::Return]
        );
        assert!(proto
            .constants
            .contains(&Constant::Number(Uint256::from_u64(511))));
    }

    #[test]
    fn zero_divisor_is_not_folded() {
        let proto = compile("_r = 1 / 0");
        assert!(ops(&proto).contains(&OpCode::Div));
    }

    #[test]
    fn concat_chains_flatten() {
        let proto = compile("_r = \"a\" .. \"b\" .. \"c\" .. \"d\"");
        let concats: Vec<_> = proto
            .code
            .iter()
            .map(|&w| Instruction::from_word(w))
            .filter(|i| i.op() == Ok(OpCode::Concat))
            .collect();
        assert_eq!(concats.len(), 1);
        let c = concats[0];
        assert_eq!(c.c() - c.b(), 3);
    }

    #[test]
    fn relational_uses_paired_jump_skeleton() {
        let proto = compile("_r = 1 < 2");
        let seq = ops(&proto);
        let lt = seq.iter().position(|&o| o == OpCode::Lt).unwrap();
        assert_eq!(seq[lt + 1], OpCode::Jmp);
        assert_eq!(seq[lt + 2], OpCode::LoadBool);
        assert_eq!(seq[lt + 3], OpCode::LoadBool);
    }

    #[test]
    fn and_or_short_circuit_with_testset() {
        let seq = ops(&compile("_r = a and b or c"));
        assert!(seq.iter().filter(|&&o| o == OpCode::TestSet).count() >= 2);
    }

    #[test]
    fn upvalue_capture_emits_closure_and_close() {
        let proto = compile(
            "do\n\
               local counter = 0\n\
               inc = function() counter = counter + 1 return counter end\n\
             end",
        );
        let seq = ops(&proto);
        assert!(seq.contains(&OpCode::Closure));
        assert!(seq.contains(&OpCode::Close));
        assert_eq!(proto.protos.len(), 1);
        assert_eq!(proto.protos[0].num_upvalues, 1);
        assert_eq!(proto.protos[0].debug.upvalue_names, vec!["counter"]);
    }

    #[test]
    fn local_function_supports_recursion() {
        let proto = compile(
            "local function fact(n)\n\
               if n == 0 then return 1 end\n\
               return fact(n - 1) * n\n\
             end",
        );
        assert_eq!(proto.protos.len(), 1);
        // `fact` inside the body resolves to an upvalue-free local slot of
        // the enclosing chunk, captured as an upvalue.
        assert_eq!(proto.protos[0].debug.upvalue_names, vec!["fact"]);
    }

    #[test]
    fn numeric_for_emits_prep_and_loop() {
        let seq = ops(&compile("local s = 0 for i = 1, 10 do s = s + i end"));
        assert!(seq.contains(&OpCode::ForPrep));
        assert!(seq.contains(&OpCode::ForLoop));
    }

    #[test]
    fn generic_for_emits_tforloop() {
        let seq = ops(&compile("for k, v in pairs(t) do end"));
        assert!(seq.contains(&OpCode::TForLoop));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let block = parse(lex("break", "@t").unwrap(), "@t").unwrap();
        let err = compile_chunk(&block, "@t").unwrap_err();
        assert_eq!(err.code, "TOL4008");
    }

    #[test]
    fn goto_over_local_declaration_is_rejected() {
        let src = "goto done\nlocal x = 1\n::done::";
        let block = parse(lex(src, "@t").unwrap(), "@t").unwrap();
        let err = compile_chunk(&block, "@t").unwrap_err();
        assert_eq!(err.code, "TOL4010");
    }

    #[test]
    fn backward_goto_resolves() {
        let seq = ops(&compile("local i = 0 ::top:: i = i + 1 if i < 3 then goto top end"));
        assert!(seq.contains(&OpCode::Jmp));
    }

    #[test]
    fn assignment_to_const_is_rejected() {
        let src = "local c <const> = 1\nc = 2";
        let block = parse(lex(src, "@t").unwrap(), "@t").unwrap();
        let err = compile_chunk(&block, "@t").unwrap_err();
        assert_eq!(err.code, "TOL4006");
    }

    #[test]
    fn tail_calls_reuse_the_frame() {
        let proto = compile("function f() return g() end");
        let inner = &proto.protos[0];
        let seq = ops(inner);
        assert!(seq.contains(&OpCode::TailCall));
    }

    #[test]
    fn table_constructor_emits_setlist_blocks() {
        let proto = compile("_t = {1, 2, 3, k = 4}");
        let seq = ops(&proto);
        assert!(seq.contains(&OpCode::NewTable));
        assert!(seq.contains(&OpCode::SetList));
        assert!(seq.contains(&OpCode::SetTableKs));
    }

    #[test]
    fn method_call_emits_self() {
        let seq = ops(&compile("obj:method(1)"));
        assert!(seq.contains(&OpCode::OpSelf));
    }

    #[test]
    fn vararg_chunk_forwards() {
        let seq = ops(&compile("function f(...) return ... end"));
        assert!(seq.contains(&OpCode::Closure));
    }

    #[test]
    fn max_stack_covers_used_registers() {
        let proto = compile("local a, b, c, d = 1, 2, 3, 4 _r = a + b + c + d");
        assert!(proto.max_stack >= 4);
    }
}
