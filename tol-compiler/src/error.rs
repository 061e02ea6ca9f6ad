use thiserror::Error;

/// Phase that rejected the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lexer or parser failure (`TOL1xxx` for TOL sources).
    Parse,
    /// Semantic rule violation (`TOL2xxx`).
    Sema,
    /// Unsupported construct hit during lowering (`TOL3xxx`).
    Lower,
    /// Register overflow, constant overflow, bad jump distance (`TOL4xxx`).
    Codegen,
}

/// A compile-time failure. Compilation never yields partial artifacts:
/// callers get a prototype or one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{chunk}:{line}: {code}: {message}")]
pub struct CompileError {
    /// Phase that failed.
    pub kind: ErrorKind,
    /// Stable diagnostic code, e.g. `TOL2010`.
    pub code: String,
    /// Chunk name the source was compiled under.
    pub chunk: String,
    /// One-based source line of the offending construct.
    pub line: u32,
    /// Human-readable description.
    pub message: String,
}

impl CompileError {
    /// Parse-phase error.
    pub fn parse(chunk: &str, line: u32, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Parse,
            code: code.into(),
            chunk: chunk.into(),
            line,
            message: message.into(),
        }
    }

    /// Semantic-phase error.
    pub fn sema(chunk: &str, line: u32, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Sema,
            code: code.into(),
            chunk: chunk.into(),
            line,
            message: message.into(),
        }
    }

    /// Lowering-phase error.
    pub fn lower(chunk: &str, line: u32, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Lower,
            code: code.into(),
            chunk: chunk.into(),
            line,
            message: message.into(),
        }
    }

    /// Code-generation-phase error.
    pub fn codegen(chunk: &str, line: u32, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Codegen,
            code: code.into(),
            chunk: chunk.into(),
            line,
            message: message.into(),
        }
    }
}
