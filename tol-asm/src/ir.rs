//! Decoded instruction stream, the tooling projection of a prototype.
//!
//! [`IrFunction::from_proto`] and [`IrFunction::assemble`] form a total,
//! bit-exact round trip: every opcode re-encodes to the identical word and
//! the raw trailing word of `SETLIST` with `C == 0` is preserved verbatim.

use crate::bytecode::DecodeError;
use crate::instruction::Instruction;
use crate::opcode::{Format, OpCode};
use crate::proto::{Constant, DebugInfo, Prototype};

/// Decoded operands of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrArgs {
    /// `A`, `B`, `C` operands.
    Abc {
        /// `A` operand.
        a: u8,
        /// `B` operand.
        b: u16,
        /// `C` operand.
        c: u16,
    },
    /// `A`, `Bx` operands.
    Abx {
        /// `A` operand.
        a: u8,
        /// 18-bit unsigned immediate.
        bx: u32,
    },
    /// `A`, `sBx` operands.
    Asbx {
        /// `A` operand.
        a: u8,
        /// 18-bit signed immediate.
        sbx: i32,
    },
}

/// One decoded instruction, plus the raw extra word consumed by `SETLIST`
/// with `C == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrInstruction {
    /// The opcode.
    pub op: OpCode,
    /// Decoded operands matching `op.format()`.
    pub args: IrArgs,
    /// Raw trailing word, present only for `SETLIST` with `C == 0`.
    pub extra: Option<u32>,
}

impl IrInstruction {
    /// Decode a packed word. Does not consume extras; the function-level
    /// decoder handles those.
    pub fn decode(ins: Instruction, pc: usize) -> Result<Self, DecodeError> {
        let op = ins
            .op()
            .map_err(|raw| DecodeError::InvalidOpcode(raw, pc))?;
        let args = match op.format() {
            Format::Abc => IrArgs::Abc {
                a: ins.a(),
                b: ins.b(),
                c: ins.c(),
            },
            Format::Abx => IrArgs::Abx {
                a: ins.a(),
                bx: ins.bx(),
            },
            Format::Asbx => IrArgs::Asbx {
                a: ins.a(),
                sbx: ins.sbx(),
            },
        };
        Ok(Self {
            op,
            args,
            extra: None,
        })
    }

    /// Re-encode into a packed word.
    pub fn encode(&self) -> Instruction {
        match self.args {
            IrArgs::Abc { a, b, c } => Instruction::abc(self.op, a, b, c),
            IrArgs::Abx { a, bx } => Instruction::abx(self.op, a, bx),
            IrArgs::Asbx { a, sbx } => Instruction::asbx(self.op, a, sbx),
        }
    }
}

/// A function with decoded instructions; mirrors [`Prototype`] field for
/// field.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IrFunction {
    /// Origin label for diagnostics.
    pub source: String,
    /// First source line.
    pub line_defined: u32,
    /// Last source line.
    pub last_line_defined: u32,
    /// Number of captured upvalues.
    pub num_upvalues: u8,
    /// Number of declared parameters.
    pub num_params: u8,
    /// Whether the function accepts varargs.
    pub is_vararg: bool,
    /// Number of registers used.
    pub max_stack: u8,
    /// Decoded instruction stream.
    pub code: Vec<IrInstruction>,
    /// Constant pool.
    pub constants: Vec<Constant>,
    /// Nested functions.
    pub protos: Vec<IrFunction>,
    /// Debug tables, carried verbatim.
    pub debug: DebugInfo,
}

impl IrFunction {
    /// Project a prototype into decoded IR.
    pub fn from_proto(proto: &Prototype) -> Result<Self, DecodeError> {
        let mut code = Vec::with_capacity(proto.code.len());
        let mut pc = 0usize;
        while pc < proto.code.len() {
            let word = Instruction::from_word(proto.code[pc]);
            let mut ins = IrInstruction::decode(word, pc)?;
            if ins.op == OpCode::SetList && word.c() == 0 {
                let extra = proto
                    .code
                    .get(pc + 1)
                    .copied()
                    .ok_or(DecodeError::MissingSetListIndex(pc))?;
                ins.extra = Some(extra);
                pc += 1;
            }
            code.push(ins);
            pc += 1;
        }
        let protos = proto
            .protos
            .iter()
            .map(IrFunction::from_proto)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            source: proto.source.clone(),
            line_defined: proto.line_defined,
            last_line_defined: proto.last_line_defined,
            num_upvalues: proto.num_upvalues,
            num_params: proto.num_params,
            is_vararg: proto.is_vararg,
            max_stack: proto.max_stack,
            code,
            constants: proto.constants.clone(),
            protos,
            debug: proto.debug.clone(),
        })
    }

    /// Assemble back into an encoded prototype.
    pub fn assemble(&self) -> Prototype {
        let mut code = Vec::with_capacity(self.code.len());
        for ins in &self.code {
            code.push(ins.encode().word());
            if let Some(extra) = ins.extra {
                code.push(extra);
            }
        }
        Prototype {
            source: self.source.clone(),
            line_defined: self.line_defined,
            last_line_defined: self.last_line_defined,
            num_upvalues: self.num_upvalues,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack: self.max_stack,
            code,
            constants: self.constants.clone(),
            protos: self.protos.iter().map(IrFunction::assemble).collect(),
            debug: self.debug.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tol_types::Uint256;

    fn proto_with_setlist() -> Prototype {
        Prototype {
            source: "@ir".into(),
            max_stack: 4,
            code: vec![
                Instruction::abc(OpCode::NewTable, 0, 2, 0).word(),
                Instruction::abx(OpCode::LoadK, 1, 0).word(),
                Instruction::abx(OpCode::LoadK, 2, 1).word(),
                Instruction::abc(OpCode::SetList, 0, 2, 0).word(),
                // Raw block index carried by the preceding SETLIST.
                912,
                Instruction::abc(OpCode::Return, 0, 1, 0).word(),
            ],
            constants: vec![
                Constant::Number(Uint256::from_u64(1)),
                Constant::Number(Uint256::from_u64(2)),
            ],
            ..Prototype::default()
        }
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let proto = proto_with_setlist();
        let ir = IrFunction::from_proto(&proto).unwrap();
        assert_eq!(ir.assemble(), proto);
    }

    #[test]
    fn setlist_extra_word_is_preserved_verbatim() {
        let ir = IrFunction::from_proto(&proto_with_setlist()).unwrap();
        let setlist = ir
            .code
            .iter()
            .find(|i| i.op == OpCode::SetList)
            .expect("setlist present");
        assert_eq!(setlist.extra, Some(912));
        // Five decoded instructions from six words.
        assert_eq!(ir.code.len(), 5);
    }

    #[test]
    fn setlist_with_nonzero_c_takes_no_extra() {
        let proto = Prototype {
            source: "@ir".into(),
            max_stack: 2,
            code: vec![
                Instruction::abc(OpCode::NewTable, 0, 1, 0).word(),
                Instruction::abc(OpCode::SetList, 0, 1, 1).word(),
                Instruction::abc(OpCode::Return, 0, 1, 0).word(),
            ],
            ..Prototype::default()
        };
        let ir = IrFunction::from_proto(&proto).unwrap();
        assert_eq!(ir.code.len(), 3);
        assert_eq!(ir.assemble(), proto);
    }

    #[test]
    fn truncated_setlist_extra_errors() {
        let proto = Prototype {
            source: "@ir".into(),
            max_stack: 2,
            code: vec![Instruction::abc(OpCode::SetList, 0, 1, 0).word()],
            ..Prototype::default()
        };
        assert!(matches!(
            IrFunction::from_proto(&proto),
            Err(DecodeError::MissingSetListIndex(0))
        ));
    }

    #[test]
    fn nested_protos_round_trip() {
        let mut proto = proto_with_setlist();
        proto.protos.push(proto_with_setlist());
        let ir = IrFunction::from_proto(&proto).unwrap();
        assert_eq!(ir.assemble(), proto);
    }
}
