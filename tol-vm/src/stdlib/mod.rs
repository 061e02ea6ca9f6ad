//! The deterministic core libraries: `base`, `table`, `string`, `math`.
//!
//! This is the whole library surface. The removed set (`io`, `os`,
//! `debug`, `coroutine`, `loadstring`, `print`, `math.random`,
//! `string.dump`, ...) is simply never registered, so any use is an
//! ordinary "attempt to call a nil value" at runtime.

pub mod base;
pub mod math;
pub mod string;
pub mod table;

use crate::Vm;

/// Install all core libraries into a state.
pub fn open_libs(vm: &mut Vm) {
    base::open(vm);
    table::open(vm);
    string::open(vm);
    math::open(vm);
}
