//! Atomic types shared by every layer of the TOL engine.
//!
//! The numeric model is a canonical unsigned 256-bit integer: no floats, no
//! scientific notation, wrapping modular arithmetic. The canonical textual
//! form of a number is its shortest decimal representation, which is the
//! cross-implementation reproducibility contract.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod array_types;
mod error;
mod u256;

pub use array_types::{Address, Bytes32};
pub use error::{AddressError, NumberError};
pub use u256::Uint256;
