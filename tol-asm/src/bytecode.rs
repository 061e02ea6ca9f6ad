//! The on-disk bytecode container.
//!
//! Layout, big-endian throughout:
//!
//! ```text
//! 0   4            magic       = "GLBC"
//! 4   2            version     = 2
//! 6   4            vmid_len    (u32)
//! 10  vmid_len     vmid        (utf-8 fingerprint token)
//! +   4            payload_len (u32)
//! +   payload_len  payload     (recursive prototype serialization)
//! +   32           sha256(payload)
//! ```
//!
//! Decoding validates magic, version, fingerprint, digest, and the
//! structural safety of every prototype before anything is hydrated; the
//! caller sees a well-formed [`Prototype`] or an error, never a partial
//! artifact.

use core::fmt;

use thiserror::Error;
use tol_crypto::sha256;
use tol_types::{Address, Bytes32, NumberError, Uint256};

use crate::opcode::OP_MAX;
use crate::proto::{CallSite, Constant, DebugInfo, LocalVar, Prototype};

/// Container magic.
pub const MAGIC: [u8; 4] = *b"GLBC";
/// Container format version.
pub const VERSION: u16 = 2;

/// Numeric bit width advertised in the fingerprint.
const NUM_BITS: u32 = 256;
/// Language version advertised in the fingerprint.
const LUA_VERSION: &str = "5.1";

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_NUMBER: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_ADDRESS: u8 = 4;

/// The VM fingerprint embedded in every blob.
///
/// Any divergence in any token (package, language version, numeric width,
/// opcode count) rejects the blob; this is the only versioning mechanism
/// and decoders never upgrade across fingerprint boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmId {
    /// Package token, `<name>-<version>`.
    pub pkg: String,
    /// Language version token.
    pub lua_version: String,
    /// Numeric bit width.
    pub num_bits: u32,
    /// Highest opcode discriminant.
    pub op_max: u8,
}

impl VmId {
    /// Fingerprint of this build of the engine.
    pub fn current() -> Self {
        Self {
            pkg: format!("tol-engine-{}", env!("CARGO_PKG_VERSION")),
            lua_version: LUA_VERSION.to_string(),
            num_bits: NUM_BITS,
            op_max: OP_MAX,
        }
    }

    /// The serialized token.
    pub fn token(&self) -> String {
        format!(
            "pkg={};lua={};numbit={};opmax={}",
            self.pkg, self.lua_version, self.num_bits, self.op_max
        )
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// Rejection reasons of the bytecode decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The blob does not start with the container magic.
    #[error("bad bytecode magic")]
    BadMagic,
    /// The container version is not the supported one.
    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u16),
    /// The blob was produced by a different VM flavor.
    #[error("vm mismatch: blob carries \"{found}\", this vm is \"{expected}\"")]
    VmMismatch {
        /// Fingerprint of the running VM.
        expected: String,
        /// Fingerprint found in the blob.
        found: String,
    },
    /// The payload digest does not match the trailing digest.
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
    /// Bytes remain after the trailing digest or inside the payload.
    #[error("unexpected trailing bytes in bytecode")]
    TrailingBytes,
    /// The blob ended before a field could be read.
    #[error("unexpected end of bytecode")]
    Truncated,
    /// The fingerprint or a string field is not valid UTF-8.
    #[error("bytecode string field is not valid utf-8")]
    InvalidUtf8,
    /// A constant carries an unknown tag.
    #[error("unknown constant tag {0}")]
    BadConstantTag(u8),
    /// A number constant failed re-validation.
    #[error("malformed number constant: {0}")]
    BadNumber(#[from] NumberError),
    /// A code word carries an out-of-range opcode.
    #[error("invalid opcode {0:#04x} at pc {1}")]
    InvalidOpcode(u8, usize),
    /// A `CLOSURE` indexes past the nested-prototype table.
    #[error("closure prototype index {0} out of range at pc {1}")]
    ClosureOutOfRange(u32, usize),
    /// A constant reference indexes past the constant pool.
    #[error("constant index {0} out of range at pc {1}")]
    ConstantOutOfRange(u32, usize),
    /// A register operand exceeds the declared register count.
    #[error("register {0} out of range at pc {1}")]
    RegisterOutOfRange(u8, usize),
    /// An upvalue operand exceeds the declared upvalue count.
    #[error("upvalue {0} out of range at pc {1}")]
    UpvalueOutOfRange(u16, usize),
    /// A jump leaves the code array.
    #[error("jump target out of range at pc {0}")]
    JumpOutOfRange(usize),
    /// A `SETLIST` with `C == 0` is the last word of the code array.
    #[error("missing setlist block index after pc {0}")]
    MissingSetListIndex(usize),
    /// The constant pool exceeds the addressable range.
    #[error("constant pool holds {0} entries, over the addressable range")]
    ConstantPoolOverflow(usize),
}

/// Whether the bytes look like an encoded container.
pub fn is_bytecode(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && bytes[..MAGIC.len()] == MAGIC
}

/// Encode a prototype into a self-describing blob stamped with `vmid`.
///
/// Encoding is deterministic: identical prototypes and fingerprints yield
/// identical bytes.
pub fn encode(proto: &Prototype, vmid: &VmId) -> Vec<u8> {
    let mut payload = Vec::new();
    write_proto(&mut payload, proto);
    let digest = sha256(&payload);

    let token = vmid.token();
    let mut out = Vec::with_capacity(
        MAGIC.len() + 2 + 4 + token.len() + 4 + payload.len() + Bytes32::LEN,
    );
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.extend_from_slice(&(token.len() as u32).to_be_bytes());
    out.extend_from_slice(token.as_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(digest.as_ref());
    out
}

/// Decode and validate a blob against the given fingerprint.
pub fn decode(bytes: &[u8], vmid: &VmId) -> Result<Prototype, DecodeError> {
    let mut r = Reader::new(bytes);
    if r.take_bytes(MAGIC.len())? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.take_u16()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let vmid_len = r.take_u32()? as usize;
    let found = core::str::from_utf8(r.take_bytes(vmid_len)?)
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_string();
    let expected = vmid.token();
    if found != expected {
        return Err(DecodeError::VmMismatch { expected, found });
    }
    let payload_len = r.take_u32()? as usize;
    let payload = r.take_bytes(payload_len)?;
    let digest: [u8; Bytes32::LEN] = r
        .take_bytes(Bytes32::LEN)?
        .try_into()
        .expect("fixed length");
    if !r.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    if sha256(payload) != Bytes32::new(digest) {
        return Err(DecodeError::ChecksumMismatch);
    }

    let mut pr = Reader::new(payload);
    let proto = read_proto(&mut pr)?;
    if !pr.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    proto.validate()?;
    Ok(proto)
}

fn write_proto(out: &mut Vec<u8>, proto: &Prototype) {
    write_str(out, &proto.source);
    out.extend_from_slice(&proto.line_defined.to_be_bytes());
    out.extend_from_slice(&proto.last_line_defined.to_be_bytes());
    out.push(proto.num_upvalues);
    out.push(proto.num_params);
    out.push(proto.is_vararg as u8);
    out.push(proto.max_stack);

    out.extend_from_slice(&(proto.code.len() as u32).to_be_bytes());
    for word in &proto.code {
        out.extend_from_slice(&word.to_be_bytes());
    }

    out.extend_from_slice(&(proto.constants.len() as u32).to_be_bytes());
    for constant in &proto.constants {
        match constant {
            Constant::Nil => out.push(TAG_NIL),
            Constant::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(*b as u8);
            }
            Constant::Number(n) => {
                out.push(TAG_NUMBER);
                write_str(out, &n.to_string());
            }
            Constant::Str(s) => {
                out.push(TAG_STRING);
                write_str(out, s);
            }
            Constant::Address(a) => {
                out.push(TAG_ADDRESS);
                out.extend_from_slice(a.as_ref());
            }
        }
    }

    out.extend_from_slice(&(proto.protos.len() as u32).to_be_bytes());
    for nested in &proto.protos {
        write_proto(out, nested);
    }

    let debug = &proto.debug;
    out.extend_from_slice(&(debug.source_positions.len() as u32).to_be_bytes());
    for line in &debug.source_positions {
        out.extend_from_slice(&line.to_be_bytes());
    }
    out.extend_from_slice(&(debug.locals.len() as u32).to_be_bytes());
    for local in &debug.locals {
        write_str(out, &local.name);
        out.extend_from_slice(&local.start_pc.to_be_bytes());
        out.extend_from_slice(&local.end_pc.to_be_bytes());
    }
    out.extend_from_slice(&(debug.calls.len() as u32).to_be_bytes());
    for call in &debug.calls {
        write_str(out, &call.name);
        out.extend_from_slice(&call.pc.to_be_bytes());
    }
    out.extend_from_slice(&(debug.upvalue_names.len() as u32).to_be_bytes());
    for name in &debug.upvalue_names {
        write_str(out, name);
    }
}

fn read_proto(r: &mut Reader<'_>) -> Result<Prototype, DecodeError> {
    let source = read_str(r)?;
    let line_defined = r.take_u32()?;
    let last_line_defined = r.take_u32()?;
    let num_upvalues = r.take_u8()?;
    let num_params = r.take_u8()?;
    let is_vararg = r.take_u8()? != 0;
    let max_stack = r.take_u8()?;

    let code_len = r.take_u32()? as usize;
    let mut code = Vec::with_capacity(code_len.min(r.remaining() / 4));
    for _ in 0..code_len {
        code.push(r.take_u32()?);
    }

    let const_len = r.take_u32()? as usize;
    let mut constants = Vec::with_capacity(const_len.min(r.remaining()));
    for _ in 0..const_len {
        let tag = r.take_u8()?;
        constants.push(match tag {
            TAG_NIL => Constant::Nil,
            TAG_BOOL => Constant::Bool(r.take_u8()? != 0),
            TAG_NUMBER => Constant::Number(Uint256::from_decimal(&read_str(r)?)?),
            TAG_STRING => Constant::Str(read_str(r)?),
            TAG_ADDRESS => {
                let raw: [u8; 32] = r
                    .take_bytes(Address::LEN)?
                    .try_into()
                    .expect("fixed length");
                Constant::Address(Address::new(raw))
            }
            other => return Err(DecodeError::BadConstantTag(other)),
        });
    }

    let proto_len = r.take_u32()? as usize;
    let mut protos = Vec::with_capacity(proto_len.min(r.remaining()));
    for _ in 0..proto_len {
        protos.push(read_proto(r)?);
    }

    let pos_len = r.take_u32()? as usize;
    let mut source_positions = Vec::with_capacity(pos_len.min(r.remaining() / 4));
    for _ in 0..pos_len {
        source_positions.push(r.take_u32()?);
    }
    let local_len = r.take_u32()? as usize;
    let mut locals = Vec::with_capacity(local_len.min(r.remaining()));
    for _ in 0..local_len {
        locals.push(LocalVar {
            name: read_str(r)?,
            start_pc: r.take_u32()?,
            end_pc: r.take_u32()?,
        });
    }
    let call_len = r.take_u32()? as usize;
    let mut calls = Vec::with_capacity(call_len.min(r.remaining()));
    for _ in 0..call_len {
        calls.push(CallSite {
            name: read_str(r)?,
            pc: r.take_u32()?,
        });
    }
    let upname_len = r.take_u32()? as usize;
    let mut upvalue_names = Vec::with_capacity(upname_len.min(r.remaining()));
    for _ in 0..upname_len {
        upvalue_names.push(read_str(r)?);
    }

    Ok(Prototype {
        source,
        line_defined,
        last_line_defined,
        num_upvalues,
        num_params,
        is_vararg,
        max_stack,
        code,
        constants,
        protos,
        debug: DebugInfo {
            source_positions,
            locals,
            calls,
            upvalue_names,
        },
    })
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_str(r: &mut Reader<'_>) -> Result<String, DecodeError> {
    let len = r.take_u32()? as usize;
    let bytes = r.take_bytes(len)?;
    core::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| DecodeError::InvalidUtf8)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(
            self.take_bytes(2)?.try_into().expect("fixed length"),
        ))
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(
            self.take_bytes(4)?.try_into().expect("fixed length"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::opcode::OpCode;

    fn sample() -> Prototype {
        let nested = Prototype {
            source: "@sample".into(),
            num_upvalues: 1,
            max_stack: 2,
            code: vec![
                Instruction::abc(OpCode::GetUpval, 0, 0, 0).word(),
                Instruction::abc(OpCode::Return, 0, 2, 0).word(),
            ],
            debug: DebugInfo {
                source_positions: vec![3, 3],
                upvalue_names: vec!["x".into()],
                ..DebugInfo::default()
            },
            ..Prototype::default()
        };
        Prototype {
            source: "@sample".into(),
            line_defined: 0,
            last_line_defined: 5,
            max_stack: 4,
            code: vec![
                Instruction::abx(OpCode::LoadK, 0, 0).word(),
                Instruction::abx(OpCode::Closure, 1, 0).word(),
                Instruction::abc(OpCode::Move, 2, 0, 0).word(),
                Instruction::abc(OpCode::Return, 0, 1, 0).word(),
            ],
            constants: vec![
                Constant::Number(Uint256::from_u64(514)),
                Constant::Str("hello".into()),
                Constant::Bool(true),
                Constant::Nil,
                Constant::Address(Address::zeroed()),
            ],
            protos: vec![nested],
            debug: DebugInfo {
                source_positions: vec![1, 2, 2, 5],
                locals: vec![LocalVar {
                    name: "a".into(),
                    start_pc: 1,
                    end_pc: 4,
                }],
                calls: vec![],
                upvalue_names: vec![],
            },
            ..Prototype::default()
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let vmid = VmId::current();
        let blob = encode(&sample(), &vmid);
        assert!(is_bytecode(&blob));
        let decoded = decode(&blob, &vmid).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn encoding_is_deterministic() {
        let vmid = VmId::current();
        assert_eq!(encode(&sample(), &vmid), encode(&sample(), &vmid));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let vmid = VmId::current();
        let mut blob = encode(&sample(), &vmid);
        blob[0] ^= 0xff;
        assert_eq!(decode(&blob, &vmid), Err(DecodeError::BadMagic));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let vmid = VmId::current();
        let mut blob = encode(&sample(), &vmid);
        blob[5] = 9;
        assert_eq!(
            decode(&blob, &vmid),
            Err(DecodeError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn vmid_mutation_is_a_vm_mismatch() {
        let vmid = VmId::current();
        let mut blob = encode(&sample(), &vmid);
        // First byte of the embedded token ("p" of "pkg=").
        blob[10] = b'q';
        assert!(matches!(
            decode(&blob, &vmid),
            Err(DecodeError::VmMismatch { .. })
        ));
    }

    #[test]
    fn foreign_fingerprint_is_a_vm_mismatch() {
        let vmid = VmId::current();
        let mut other = vmid.clone();
        other.num_bits = 64;
        let blob = encode(&sample(), &other);
        assert!(matches!(
            decode(&blob, &vmid),
            Err(DecodeError::VmMismatch { .. })
        ));
    }

    #[test]
    fn payload_mutation_is_a_checksum_mismatch() {
        let vmid = VmId::current();
        let mut blob = encode(&sample(), &vmid);
        let payload_start =
            MAGIC.len() + 2 + 4 + vmid.token().len() + 4;
        blob[payload_start] ^= 0x01;
        assert_eq!(decode(&blob, &vmid), Err(DecodeError::ChecksumMismatch));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let vmid = VmId::current();
        let mut blob = encode(&sample(), &vmid);
        blob.push(0);
        assert_eq!(decode(&blob, &vmid), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn truncation_is_rejected() {
        let vmid = VmId::current();
        let blob = encode(&sample(), &vmid);
        for cut in [3, 9, blob.len() / 2, blob.len() - 1] {
            assert!(decode(&blob[..cut], &vmid).is_err());
        }
    }

    #[test]
    fn number_constants_are_revalidated() {
        // Hand-build a payload with a malformed number constant.
        let mut proto = sample();
        proto.protos.clear();
        proto.constants = vec![Constant::Str("1.5".into())];
        let vmid = VmId::current();
        let mut blob = encode(&proto, &vmid);
        // Rewrite the string tag into a number tag. The constant section
        // starts after source, lines, header and code; find the tag by
        // searching for the tagged length-prefixed "1.5".
        let needle = [TAG_STRING, 0, 0, 0, 3, b'1', b'.', b'5'];
        let pos = blob
            .windows(needle.len())
            .position(|w| w == needle)
            .expect("constant present");
        blob[pos] = TAG_NUMBER;
        // Fix up the digest so the mutation reaches constant parsing.
        let payload_start = MAGIC.len() + 2 + 4 + vmid.token().len() + 4;
        let payload_end = blob.len() - Bytes32::LEN;
        let digest = sha256(&blob[payload_start..payload_end]);
        let digest_bytes: [u8; 32] = (*digest).into();
        blob[payload_end..].copy_from_slice(&digest_bytes);
        assert_eq!(
            decode(&blob, &vmid),
            Err(DecodeError::BadNumber(
                tol_types::NumberError::Float
            ))
        );
    }
}
