//! Hashing primitives of the TOL engine.
//!
//! One digest module, two concerns: SHA-256 guards bytecode payload
//! integrity, Keccak-256 derives storage slots and dispatch selectors.
//! Every function returns the canonical [`tol_types::Bytes32`] or
//! hex-string form the rest of the engine consumes directly.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod digest;

pub use digest::{keccak256, keccak256_hex, selector_hex, sha256};
