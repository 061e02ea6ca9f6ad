use core::fmt;

/// Highest valid opcode discriminant.
pub const OP_MAX: u8 = OpCode::Nop as u8;

/// Maximum value of the `A` operand.
pub const MAX_ARG_A: u32 = 0xff;
/// Maximum value of the `B` and `C` operands.
pub const MAX_ARG_B: u32 = 0x1ff;
/// Maximum value of the `C` operand.
pub const MAX_ARG_C: u32 = 0x1ff;
/// Maximum value of the 18-bit `Bx` operand; also bounds the constant pool.
pub const MAX_ARG_BX: u32 = 0x3ffff;
/// Excess-K bias of the signed `sBx` operand.
pub const SBX_BIAS: i32 = 131071;
/// Maximum value of the signed `sBx` operand.
pub const MAX_ARG_SBX: i32 = MAX_ARG_BX as i32 - SBX_BIAS;

/// Bit marking a `B`/`C` operand as a constant-pool reference rather than a
/// register.
pub const RK_CONSTANT_FLAG: u16 = 0x100;

/// Operand layout of an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Format {
    /// `A` (8 bits), `B` (9 bits), `C` (9 bits).
    Abc,
    /// `A` (8 bits), `Bx` (18 bits unsigned).
    Abx,
    /// `A` (8 bits), `sBx` (18 bits, excess-K signed).
    Asbx,
}

/// Instruction set of the register machine.
///
/// The set is fixed: every discriminant in `0..=OP_MAX` is a valid opcode
/// and nothing above it is. `Closure` is the only instruction whose
/// immediate indexes a nested prototype; `SetList` with `C == 0` consumes
/// one trailing raw code word carrying the list block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum OpCode {
    /// `R(A) := R(B)`
    Move = 0x00,
    /// `R(A..A+C-1) := R(B..B+C-1)`, a collapsed run of moves.
    MoveN = 0x01,
    /// `R(A) := K(Bx)`
    LoadK = 0x02,
    /// `R(A) := (bool)B; if C, pc++`
    LoadBool = 0x03,
    /// `R(A..B) := nil`
    LoadNil = 0x04,
    /// `R(A) := UpValue(B)`
    GetUpval = 0x05,
    /// `R(A) := Globals[K(Bx)]`
    GetGlobal = 0x06,
    /// `R(A) := R(B)[RK(C)]`
    GetTable = 0x07,
    /// `R(A) := R(B)[RK(C)]`, `RK(C)` statically known to be a string key.
    GetTableKs = 0x08,
    /// `Globals[K(Bx)] := R(A)`
    SetGlobal = 0x09,
    /// `UpValue(B) := R(A)`
    SetUpval = 0x0a,
    /// `R(A)[RK(B)] := RK(C)`
    SetTable = 0x0b,
    /// `R(A)[RK(B)] := RK(C)`, `RK(B)` statically known to be a string key.
    SetTableKs = 0x0c,
    /// `R(A) := {} (array size hint B, hash size hint C)`
    NewTable = 0x0d,
    /// `R(A+1) := R(B); R(A) := R(B)[RK(C)]`
    OpSelf = 0x0e,
    /// `R(A) := RK(B) + RK(C)` (mod 2^256)
    Add = 0x0f,
    /// `R(A) := RK(B) - RK(C)` (mod 2^256)
    Sub = 0x10,
    /// `R(A) := RK(B) * RK(C)` (mod 2^256)
    Mul = 0x11,
    /// `R(A) := RK(B) / RK(C)`, truncating; divisor zero raises.
    Div = 0x12,
    /// `R(A) := RK(B) % RK(C)`; divisor zero raises.
    Mod = 0x13,
    /// `R(A) := RK(B) ^ RK(C)` (mod 2^256)
    Pow = 0x14,
    /// `R(A) := RK(B) // RK(C)`, flooring; divisor zero raises.
    IDiv = 0x15,
    /// `R(A) := RK(B) & RK(C)`
    BAnd = 0x16,
    /// `R(A) := RK(B) | RK(C)`
    BOr = 0x17,
    /// `R(A) := RK(B) ~ RK(C)`
    BXor = 0x18,
    /// `R(A) := RK(B) << RK(C)`, logical; amounts >= 256 produce zero.
    Shl = 0x19,
    /// `R(A) := RK(B) >> RK(C)`, logical; amounts >= 256 produce zero.
    Shr = 0x1a,
    /// `R(A) := -R(B)` (two's complement negation mod 2^256)
    Unm = 0x1b,
    /// `R(A) := ~R(B)` (256-bit complement)
    BNot = 0x1c,
    /// `R(A) := not R(B)`
    Not = 0x1d,
    /// `R(A) := length of R(B)`
    Len = 0x1e,
    /// `R(A) := R(B) .. ... .. R(C)`
    Concat = 0x1f,
    /// `pc += sBx`
    Jmp = 0x20,
    /// `if (RK(B) == RK(C)) != A, pc++`
    Eq = 0x21,
    /// `if (RK(B) < RK(C)) != A, pc++`
    Lt = 0x22,
    /// `if (RK(B) <= RK(C)) != A, pc++`
    Le = 0x23,
    /// `if truth(R(A)) != C, pc++`
    Test = 0x24,
    /// `if truth(R(B)) == C, R(A) := R(B); else pc++`
    TestSet = 0x25,
    /// `R(A..A+C-2) := R(A)(R(A+1..A+B-1))`
    Call = 0x26,
    /// `return R(A)(R(A+1..A+B-1))`, reusing the current frame.
    TailCall = 0x27,
    /// `return R(A..A+B-2)`
    Return = 0x28,
    /// Numeric for loop step: add step, test, jump back.
    ForLoop = 0x29,
    /// Numeric for loop prologue: pre-subtract step, jump to ForLoop.
    ForPrep = 0x2a,
    /// Generic for loop step: call iterator, test control value.
    TForLoop = 0x2b,
    /// `R(A)[(C-1)*FPF + i] := R(A+i)`; `C == 0` takes the block index from
    /// the next raw code word.
    SetList = 0x2c,
    /// Close upvalues and `<close>` locals down to register A.
    Close = 0x2d,
    /// `R(A) := closure(Proto[Bx])`, consuming upvalue pseudo-instructions.
    Closure = 0x2e,
    /// `R(A..A+B-2) := vararg`
    Vararg = 0x2f,
    /// No operation; produced by the peephole pass.
    Nop = 0x30,
}

impl OpCode {
    /// Number of list entries per `SetList` block.
    pub const FIELDS_PER_FLUSH: u32 = 50;

    /// Operand layout of this opcode.
    pub const fn format(self) -> Format {
        match self {
            OpCode::LoadK
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::Closure => Format::Abx,
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep => Format::Asbx,
            _ => Format::Abc,
        }
    }

    /// Whether the `B` operand is an RK reference (register or constant).
    pub const fn b_is_rk(self) -> bool {
        matches!(
            self,
            OpCode::SetTable
                | OpCode::SetTableKs
                | OpCode::Add
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
                | OpCode::Shr
                | OpCode::Eq
                | OpCode::Lt
                | OpCode::Le
        )
    }

    /// Whether the `C` operand is an RK reference (register or constant).
    pub const fn c_is_rk(self) -> bool {
        matches!(
            self,
            OpCode::GetTable
                | OpCode::GetTableKs
                | OpCode::SetTable
                | OpCode::SetTableKs
                | OpCode::OpSelf
                | OpCode::Add
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
                | OpCode::Shr
                | OpCode::Eq
                | OpCode::Lt
                | OpCode::Le
        )
    }

    /// Mnemonic used by diagnostics and the IR projection.
    pub const fn name(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::MoveN => "MOVEN",
            OpCode::LoadK => "LOADK",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::GetGlobal => "GETGLOBAL",
            OpCode::GetTable => "GETTABLE",
            OpCode::GetTableKs => "GETTABLEKS",
            OpCode::SetGlobal => "SETGLOBAL",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::SetTable => "SETTABLE",
            OpCode::SetTableKs => "SETTABLEKS",
            OpCode::NewTable => "NEWTABLE",
            OpCode::OpSelf => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::IDiv => "IDIV",
            OpCode::BAnd => "BAND",
            OpCode::BOr => "BOR",
            OpCode::BXor => "BXOR",
            OpCode::Shl => "SHL",
            OpCode::Shr => "SHR",
            OpCode::Unm => "UNM",
            OpCode::BNot => "BNOT",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Jmp => "JMP",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::TailCall => "TAILCALL",
            OpCode::Return => "RETURN",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::SetList => "SETLIST",
            OpCode::Close => "CLOSE",
            OpCode::Closure => "CLOSURE",
            OpCode::Vararg => "VARARG",
            OpCode::Nop => "NOP",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        use OpCode::*;
        Ok(match b {
            0x00 => Move,
            0x01 => MoveN,
            0x02 => LoadK,
            0x03 => LoadBool,
            0x04 => LoadNil,
            0x05 => GetUpval,
            0x06 => GetGlobal,
            0x07 => GetTable,
            0x08 => GetTableKs,
            0x09 => SetGlobal,
            0x0a => SetUpval,
            0x0b => SetTable,
            0x0c => SetTableKs,
            0x0d => NewTable,
            0x0e => OpSelf,
            0x0f => Add,
            0x10 => Sub,
            0x11 => Mul,
            0x12 => Div,
            0x13 => Mod,
            0x14 => Pow,
            0x15 => IDiv,
            0x16 => BAnd,
            0x17 => BOr,
            0x18 => BXor,
            0x19 => Shl,
            0x1a => Shr,
            0x1b => Unm,
            0x1c => BNot,
            0x1d => Not,
            0x1e => Len,
            0x1f => Concat,
            0x20 => Jmp,
            0x21 => Eq,
            0x22 => Lt,
            0x23 => Le,
            0x24 => Test,
            0x25 => TestSet,
            0x26 => Call,
            0x27 => TailCall,
            0x28 => Return,
            0x29 => ForLoop,
            0x2a => ForPrep,
            0x2b => TForLoop,
            0x2c => SetList,
            0x2d => Close,
            0x2e => Closure,
            0x2f => Vararg,
            0x30 => Nop,
            _ => return Err(b),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn discriminants_round_trip_and_are_dense() {
        for (i, op) in OpCode::iter().enumerate() {
            assert_eq!(op as u8, i as u8);
            assert_eq!(OpCode::try_from(op as u8), Ok(op));
        }
        assert_eq!(OpCode::iter().last(), Some(OpCode::Nop));
        assert_eq!(OpCode::try_from(OP_MAX + 1), Err(OP_MAX + 1));
        assert_eq!(OpCode::try_from(0xff), Err(0xff));
    }

    #[test]
    fn formats_cover_the_abx_and_asbx_sets() {
        assert_eq!(OpCode::LoadK.format(), Format::Abx);
        assert_eq!(OpCode::Closure.format(), Format::Abx);
        assert_eq!(OpCode::Jmp.format(), Format::Asbx);
        assert_eq!(OpCode::ForLoop.format(), Format::Asbx);
        assert_eq!(OpCode::ForPrep.format(), Format::Asbx);
        assert_eq!(OpCode::Move.format(), Format::Abc);
        assert_eq!(OpCode::SetList.format(), Format::Abc);
    }
}
