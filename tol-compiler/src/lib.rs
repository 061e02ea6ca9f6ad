//! Front-ends of the TOL engine.
//!
//! Two surfaces compile into the shared register-machine prototype form:
//! the Lua subset (module [`lua`]) and the contract language TOL (module
//! [`tol`]), which lowers contracts onto the Lua AST and reuses the same
//! code generator. Compilation is a pure function from source bytes to
//! bytecode bytes; repeated compilation of identical source yields
//! identical prototypes.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod lua;
pub mod tol;

mod error;

pub use error::{CompileError, ErrorKind};

use tol_asm::Prototype;

/// Strip a leading `#!` line, if present, returning the remaining source.
pub fn skip_shebang(source: &[u8]) -> &[u8] {
    if source.starts_with(b"#!") {
        match source.iter().position(|&b| b == b'\n') {
            Some(pos) => &source[pos + 1..],
            None => &[],
        }
    } else {
        source
    }
}

/// Compile Lua-subset source into a prototype.
///
/// `chunk_name` labels diagnostics and the prototype's `source` field.
pub fn compile_lua(source: &str, chunk_name: &str) -> Result<Prototype, CompileError> {
    let _span = tracing::debug_span!("compile_lua", chunk = chunk_name).entered();
    let tokens = lua::lexer::lex(source, chunk_name)?;
    let block = lua::parser::parse(tokens, chunk_name)?;
    lua::codegen::compile_chunk(&block, chunk_name)
}

/// Compile TOL source into a prototype.
pub fn compile_tol(source: &str, chunk_name: &str) -> Result<Prototype, CompileError> {
    let _span = tracing::debug_span!("compile_tol", chunk = chunk_name).entered();
    let tokens = tol::lexer::lex(source, chunk_name)?;
    let module = tol::parser::parse(tokens, chunk_name)?;
    tol::sema::check(&module, chunk_name)?;
    let block = tol::lower::lower(&module, chunk_name)?;
    lua::codegen::compile_chunk(&block, chunk_name)
}
