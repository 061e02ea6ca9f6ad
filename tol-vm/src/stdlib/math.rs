//! The `math` library, reduced to its integer-meaningful core.
//!
//! Ceil and floor are the identity on integers; there is no trig, no
//! exp/log, and no randomness.

use tol_types::Uint256;

use crate::error::VmError;
use crate::value::Value;
use crate::Vm;

/// Install the `math` module.
pub fn open(vm: &mut Vm) {
    vm.register_module(
        "math",
        vec![
            ("abs", identity as fn(&mut Vm, &[Value]) -> Result<Vec<Value>, VmError>),
            ("ceil", identity),
            ("floor", identity),
            ("fmod", fmod),
            ("mod", fmod),
            ("max", max),
            ("min", min),
            ("pow", pow),
        ],
    );
}

fn arg_num(vm: &Vm, args: &[Value], index: usize, what: &str) -> Result<Uint256, VmError> {
    args.get(index).and_then(Value::as_number).ok_or_else(|| {
        vm.rt_error(&format!(
            "bad argument #{} to '{what}' (number expected)",
            index + 1
        ))
    })
}

/// `abs`, `ceil` and `floor`: unsigned integers are their own absolute
/// value and their own rounding.
fn identity(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let n = arg_num(vm, args, 0, "abs")?;
    Ok(vec![Value::Number(n)])
}

fn fmod(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let a = arg_num(vm, args, 0, "fmod")?;
    let b = arg_num(vm, args, 1, "fmod")?;
    let r = a
        .checked_rem(b)
        .ok_or_else(|| vm.rt_error("attempt to perform 'n%%0'"))?;
    Ok(vec![Value::Number(r)])
}

fn max(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let mut best = arg_num(vm, args, 0, "max")?;
    for i in 1..args.len() {
        let n = arg_num(vm, args, i, "max")?;
        if n > best {
            best = n;
        }
    }
    Ok(vec![Value::Number(best)])
}

fn min(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let mut best = arg_num(vm, args, 0, "min")?;
    for i in 1..args.len() {
        let n = arg_num(vm, args, i, "min")?;
        if n < best {
            best = n;
        }
    }
    Ok(vec![Value::Number(best)])
}

fn pow(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let a = arg_num(vm, args, 0, "pow")?;
    let b = arg_num(vm, args, 1, "pow")?;
    Ok(vec![Value::Number(a.wrapping_pow(b))])
}
