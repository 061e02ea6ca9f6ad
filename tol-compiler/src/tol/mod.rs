//! The TOL contract front-end.
//!
//! TOL modules parse into a contract AST, pass the semantic checker (every
//! rule gated behind a stable `TOL2xxx` code), and lower onto the Lua AST,
//! materializing selector dispatch, storage-key derivation and the
//! constructor/fallback entry points.

pub mod ast;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod selector;
pub mod sema;
pub mod token;
