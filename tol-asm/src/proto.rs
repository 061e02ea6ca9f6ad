use tol_types::{Address, Uint256};

use crate::bytecode::DecodeError;
use crate::instruction::Instruction;
use crate::opcode::{OpCode, MAX_ARG_BX, RK_CONSTANT_FLAG};

/// A constant-pool entry.
///
/// Numbers carry their canonical value; the container serializes them as
/// decimal text and re-validates on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Constant {
    /// The nil singleton.
    Nil,
    /// A boolean.
    Bool(bool),
    /// A canonical 256-bit unsigned integer.
    Number(Uint256),
    /// An immutable string.
    Str(String),
    /// A 32-byte address.
    Address(Address),
}

/// A local-variable debug record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocalVar {
    /// Variable name.
    pub name: String,
    /// First instruction where the variable is live.
    pub start_pc: u32,
    /// First instruction where the variable is dead.
    pub end_pc: u32,
}

/// A call-site debug record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallSite {
    /// Name of the called function, as written in the source.
    pub name: String,
    /// Program counter of the call instruction.
    pub pc: u32,
}

/// Debug tables of a prototype. Advisory: diagnostics read them, execution
/// never depends on them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DebugInfo {
    /// Source line of each code word; empty when stripped.
    pub source_positions: Vec<u32>,
    /// Local-variable liveness records.
    pub locals: Vec<LocalVar>,
    /// Call sites, for traceback naming.
    pub calls: Vec<CallSite>,
    /// Names of the captured upvalues.
    pub upvalue_names: Vec<String>,
}

/// The closed compiled form of one function: code, constants, nested
/// prototypes and debug tables.
///
/// Prototypes are immutable after compilation and may be shared between any
/// number of VM states.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Prototype {
    /// Origin label for diagnostics, bit-exact through the container.
    pub source: String,
    /// First source line of the function.
    pub line_defined: u32,
    /// Last source line of the function.
    pub last_line_defined: u32,
    /// Number of captured upvalues.
    pub num_upvalues: u8,
    /// Number of declared parameters.
    pub num_params: u8,
    /// Whether the function accepts varargs.
    pub is_vararg: bool,
    /// Number of registers the function uses.
    pub max_stack: u8,
    /// Encoded instruction stream.
    pub code: Vec<u32>,
    /// Constant pool, addressed by constant index.
    pub constants: Vec<Constant>,
    /// Nested prototypes, addressed by `CLOSURE`.
    pub protos: Vec<Prototype>,
    /// Debug tables.
    pub debug: DebugInfo,
}

impl Prototype {
    /// Construct an empty prototype with the given source label.
    pub fn named(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Check the structural safety invariants: every opcode is in range,
    /// every constant / nested-prototype / upvalue / jump reference is in
    /// bounds, and every `SETLIST` with `C == 0` carries its trailing raw
    /// block-index word. Applied recursively over nested prototypes.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.constants.len() > MAX_ARG_BX as usize + 1 {
            return Err(DecodeError::ConstantPoolOverflow(self.constants.len()));
        }
        let mut pc = 0usize;
        while pc < self.code.len() {
            let ins = Instruction::from_word(self.code[pc]);
            let op = ins
                .op()
                .map_err(|raw| DecodeError::InvalidOpcode(raw, pc))?;
            self.check_operands(op, ins, pc)?;
            if op == OpCode::SetList && ins.c() == 0 {
                // The next raw word is the block index, not an instruction.
                if pc + 1 >= self.code.len() {
                    return Err(DecodeError::MissingSetListIndex(pc));
                }
                pc += 1;
            }
            pc += 1;
        }
        for proto in &self.protos {
            proto.validate()?;
        }
        Ok(())
    }

    fn check_operands(
        &self,
        op: OpCode,
        ins: Instruction,
        pc: usize,
    ) -> Result<(), DecodeError> {
        let regs = self.max_stack as u16;
        if u16::from(ins.a()) >= regs.max(1) {
            return Err(DecodeError::RegisterOutOfRange(ins.a(), pc));
        }
        match op {
            OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal => {
                if ins.bx() as usize >= self.constants.len() {
                    return Err(DecodeError::ConstantOutOfRange(ins.bx(), pc));
                }
            }
            OpCode::Closure => {
                if ins.bx() as usize >= self.protos.len() {
                    return Err(DecodeError::ClosureOutOfRange(ins.bx(), pc));
                }
            }
            OpCode::GetUpval | OpCode::SetUpval => {
                if ins.b() >= u16::from(self.num_upvalues) {
                    return Err(DecodeError::UpvalueOutOfRange(ins.b(), pc));
                }
            }
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep => {
                let target = pc as i64 + 1 + i64::from(ins.sbx());
                if target < 0 || target >= self.code.len() as i64 {
                    return Err(DecodeError::JumpOutOfRange(pc));
                }
            }
            _ => {}
        }
        if op.b_is_rk() {
            self.check_rk(ins.b(), pc)?;
        }
        if op.c_is_rk() {
            self.check_rk(ins.c(), pc)?;
        }
        Ok(())
    }

    fn check_rk(&self, operand: u16, pc: usize) -> Result<(), DecodeError> {
        if operand & RK_CONSTANT_FLAG != 0 {
            let index = u32::from(operand & !RK_CONSTANT_FLAG);
            if index as usize >= self.constants.len() {
                return Err(DecodeError::ConstantOutOfRange(index, pc));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Prototype {
        Prototype {
            source: "@test".into(),
            max_stack: 2,
            code: vec![
                Instruction::abc(OpCode::LoadNil, 0, 0, 0).word(),
                Instruction::abc(OpCode::Return, 0, 1, 0).word(),
            ],
            ..Prototype::default()
        }
    }

    #[test]
    fn minimal_prototype_validates() {
        minimal().validate().unwrap();
    }

    #[test]
    fn out_of_range_opcode_is_rejected() {
        let mut proto = minimal();
        proto.code[0] = 0x3fu32 << 26;
        assert!(matches!(
            proto.validate(),
            Err(DecodeError::InvalidOpcode(0x3f, 0))
        ));
    }

    #[test]
    fn closure_index_is_bounds_checked() {
        let mut proto = minimal();
        proto.code[0] = Instruction::abx(OpCode::Closure, 0, 3).word();
        assert!(matches!(
            proto.validate(),
            Err(DecodeError::ClosureOutOfRange(3, 0))
        ));
    }

    #[test]
    fn setlist_with_zero_c_requires_trailing_word() {
        let mut proto = minimal();
        proto.code = vec![Instruction::abc(OpCode::SetList, 0, 1, 0).word()];
        assert!(matches!(
            proto.validate(),
            Err(DecodeError::MissingSetListIndex(0))
        ));

        proto.code.push(7); // raw block index, not an instruction
        proto.code.push(Instruction::abc(OpCode::Return, 0, 1, 0).word());
        proto.validate().unwrap();
    }

    #[test]
    fn rk_constant_reference_is_bounds_checked() {
        let mut proto = minimal();
        proto.code[0] =
            Instruction::abc(OpCode::Add, 0, RK_CONSTANT_FLAG, 0).word();
        assert!(matches!(
            proto.validate(),
            Err(DecodeError::ConstantOutOfRange(0, 0))
        ));
        proto.constants.push(Constant::Number(Uint256::ONE));
        proto.validate().unwrap();
    }

    #[test]
    fn nested_prototypes_are_validated() {
        let mut proto = minimal();
        let mut bad = minimal();
        bad.code[1] = 0x3fu32 << 26;
        proto.protos.push(bad);
        assert!(matches!(
            proto.validate(),
            Err(DecodeError::InvalidOpcode(0x3f, 1))
        ));
    }
}
