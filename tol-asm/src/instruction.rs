use core::fmt;

use crate::opcode::{Format, OpCode, MAX_ARG_BX, SBX_BIAS};

/// A packed 32-bit instruction word.
///
/// Layout, most significant bits first: opcode (6), `A` (8), `B` (9),
/// `C` (9). `Bx` occupies the `B` and `C` fields as one 18-bit unsigned
/// immediate; `sBx` is the same span biased by [`SBX_BIAS`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct Instruction(u32);

impl Instruction {
    /// Size of an encoded instruction in bytes.
    pub const LEN: usize = 4;

    /// Wrap a raw code word.
    pub const fn from_word(word: u32) -> Self {
        Self(word)
    }

    /// Pack an ABC-format instruction.
    pub const fn abc(op: OpCode, a: u8, b: u16, c: u16) -> Self {
        Self(
            ((op as u32) << 26)
                | ((a as u32) << 18)
                | (((b as u32) & 0x1ff) << 9)
                | ((c as u32) & 0x1ff),
        )
    }

    /// Pack an ABx-format instruction.
    pub const fn abx(op: OpCode, a: u8, bx: u32) -> Self {
        Self(((op as u32) << 26) | ((a as u32) << 18) | (bx & MAX_ARG_BX))
    }

    /// Pack an AsBx-format instruction.
    pub const fn asbx(op: OpCode, a: u8, sbx: i32) -> Self {
        Self::abx_raw(op, a, (sbx + SBX_BIAS) as u32)
    }

    const fn abx_raw(op: OpCode, a: u8, bx: u32) -> Self {
        Self(((op as u32) << 26) | ((a as u32) << 18) | (bx & MAX_ARG_BX))
    }

    /// The raw code word.
    pub const fn word(self) -> u32 {
        self.0
    }

    /// Opcode field; the raw 6 bits, which may be out of range for
    /// undecoded input.
    pub const fn op_raw(self) -> u8 {
        (self.0 >> 26) as u8
    }

    /// Decoded opcode.
    pub fn op(self) -> Result<OpCode, u8> {
        OpCode::try_from(self.op_raw())
    }

    /// `A` operand.
    pub const fn a(self) -> u8 {
        ((self.0 >> 18) & 0xff) as u8
    }

    /// `B` operand.
    pub const fn b(self) -> u16 {
        ((self.0 >> 9) & 0x1ff) as u16
    }

    /// `C` operand.
    pub const fn c(self) -> u16 {
        (self.0 & 0x1ff) as u16
    }

    /// `Bx` operand.
    pub const fn bx(self) -> u32 {
        self.0 & MAX_ARG_BX
    }

    /// `sBx` operand.
    pub const fn sbx(self) -> i32 {
        self.bx() as i32 - SBX_BIAS
    }

    /// Big-endian byte representation.
    pub const fn to_bytes(self) -> [u8; Self::LEN] {
        self.0.to_be_bytes()
    }
}

impl From<u32> for Instruction {
    fn from(word: u32) -> Self {
        Self(word)
    }
}

impl From<Instruction> for u32 {
    fn from(ins: Instruction) -> u32 {
        ins.0
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op() {
            Err(raw) => write!(f, "INVALID({raw:#04x})"),
            Ok(op) => match op.format() {
                Format::Abc => {
                    write!(f, "{} {} {} {}", op, self.a(), self.b(), self.c())
                }
                Format::Abx => write!(f, "{} {} {}", op, self.a(), self.bx()),
                Format::Asbx => write!(f, "{} {} {}", op, self.a(), self.sbx()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(OpCode::Move, 0, 0, 0)]
    #[case(OpCode::Add, 0xff, 0x1ff, 0x1ff)]
    #[case(OpCode::SetList, 3, 50, 0)]
    #[case(OpCode::Nop, 0, 0, 0)]
    fn abc_fields_round_trip(
        #[case] op: OpCode,
        #[case] a: u8,
        #[case] b: u16,
        #[case] c: u16,
    ) {
        let ins = Instruction::abc(op, a, b, c);
        assert_eq!(ins.op(), Ok(op));
        assert_eq!(ins.a(), a);
        assert_eq!(ins.b(), b);
        assert_eq!(ins.c(), c);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(MAX_ARG_BX)]
    fn abx_fields_round_trip(#[case] bx: u32) {
        let ins = Instruction::abx(OpCode::LoadK, 7, bx);
        assert_eq!(ins.op(), Ok(OpCode::LoadK));
        assert_eq!(ins.a(), 7);
        assert_eq!(ins.bx(), bx);
    }

    #[rstest]
    #[case(0)]
    #[case(-1)]
    #[case(1)]
    #[case(-SBX_BIAS)]
    #[case(crate::opcode::MAX_ARG_SBX)]
    fn asbx_fields_round_trip(#[case] sbx: i32) {
        let ins = Instruction::asbx(OpCode::Jmp, 0, sbx);
        assert_eq!(ins.op(), Ok(OpCode::Jmp));
        assert_eq!(ins.sbx(), sbx);
    }

    #[test]
    fn bytes_are_big_endian() {
        let ins = Instruction::abc(OpCode::Move, 1, 2, 3);
        assert_eq!(u32::from_be_bytes(ins.to_bytes()), ins.word());
    }
}
