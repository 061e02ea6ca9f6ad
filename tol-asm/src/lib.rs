//! Instruction set, intermediate representation and bytecode container of
//! the TOL engine.
//!
//! A compiled function is a [`Prototype`]: a pure data record of encoded
//! 32-bit instructions, tagged constants, nested prototypes and debug
//! tables. Prototypes travel between processes inside a versioned,
//! fingerprinted, payload-hashed container (see [`bytecode`]) and can be
//! re-projected into decoded [`ir`] for inspection and tooling.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod bytecode;
pub mod ir;

mod instruction;
mod opcode;
mod proto;

pub use bytecode::{decode, encode, is_bytecode, DecodeError, VmId};
pub use instruction::Instruction;
pub use ir::{IrArgs, IrFunction, IrInstruction};
pub use opcode::{Format, OpCode, MAX_ARG_A, MAX_ARG_B, MAX_ARG_BX, MAX_ARG_C, MAX_ARG_SBX, OP_MAX, RK_CONSTANT_FLAG, SBX_BIAS};
pub use proto::{CallSite, Constant, DebugInfo, LocalVar, Prototype};
