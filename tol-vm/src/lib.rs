//! Register VM of the TOL engine.
//!
//! A [`Vm`] interprets encoded prototypes under an instruction-counted gas
//! budget using 256-bit unsigned arithmetic. Execution is strictly
//! single-threaded and deterministic: table iteration is ordered, there is
//! no clock, no randomness, and no observable host address. Multiple VM
//! states may coexist in one process; a single state must not be shared
//! across host threads.
//!
//! The [`contract`] module layers the contract host surface on top: the
//! `keccak256`/`__tol_enc`/`uint256_add_hex` bindings, event capture, and
//! the `tos.oncreate`/`tos.oninvoke` entry points produced by the TOL
//! lowering.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod contract;
pub mod stdlib;

mod error;
mod executor;
mod frame;
mod state;
mod table;
mod value;

pub use error::{TracebackFrame, VmError};
pub use frame::{Closure, HostFunction, Upvalue};
pub use state::{Vm, VmParams};
pub use table::{Table, TableKey};
pub use value::{UserData, Value};

/// Commonly used items for embedders.
pub mod prelude {
    pub use crate::contract::{ContractHost, Event};
    pub use crate::{Table, TableKey, Value, Vm, VmError, VmParams};
    pub use tol_types::{Address, Uint256};
}
