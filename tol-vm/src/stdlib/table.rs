//! The `table` library.

use itertools::Itertools;
use tol_types::Uint256;

use crate::error::VmError;
use crate::stdlib::base::unpack_impl;
use crate::value::Value;
use crate::Vm;

/// Install the `table` module.
pub fn open(vm: &mut Vm) {
    vm.register_module(
        "table",
        vec![
            ("insert", insert as fn(&mut Vm, &[Value]) -> Result<Vec<Value>, VmError>),
            ("remove", remove),
            ("concat", concat),
            ("sort", sort),
            ("unpack", unpack_impl),
        ],
    );
}

fn arg_table(
    vm: &Vm,
    args: &[Value],
    what: &str,
) -> Result<std::rc::Rc<std::cell::RefCell<crate::table::Table>>, VmError> {
    match args.first() {
        Some(Value::Table(t)) => Ok(t.clone()),
        _ => Err(vm.rt_error(&format!("bad argument to '{what}' (table expected)"))),
    }
}

fn insert(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let t = arg_table(vm, args, "insert")?;
    match args.len() {
        0 | 1 => Err(vm.rt_error("wrong number of arguments to 'insert'")),
        2 => {
            t.borrow_mut().push(args[1].clone());
            Ok(vec![])
        }
        _ => {
            let pos = args[1]
                .as_number()
                .and_then(|n| n.to_u64())
                .ok_or_else(|| vm.rt_error("bad argument to 'insert' (number expected)"))?;
            let len = t.borrow().len() as u64;
            if pos < 1 || pos > len + 1 {
                return Err(vm.rt_error("bad argument to 'insert' (position out of bounds)"));
            }
            t.borrow_mut().insert_at(pos as usize, args[2].clone());
            Ok(vec![])
        }
    }
}

fn remove(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let t = arg_table(vm, args, "remove")?;
    let len = t.borrow().len() as u64;
    let pos = match args.get(1) {
        Some(v) => v
            .as_number()
            .and_then(|n| n.to_u64())
            .ok_or_else(|| vm.rt_error("bad argument to 'remove' (number expected)"))?,
        None => len,
    };
    if len == 0 {
        return Ok(vec![Value::Nil]);
    }
    if pos < 1 || pos > len {
        return Err(vm.rt_error("bad argument to 'remove' (position out of bounds)"));
    }
    let removed = t.borrow_mut().remove_at(pos as usize);
    Ok(vec![removed])
}

fn concat(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let t = arg_table(vm, args, "concat")?;
    let sep = match args.get(1) {
        None | Some(Value::Nil) => String::new(),
        Some(Value::Str(s)) => s.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(vm.rt_error(&format!(
                "bad argument to 'concat' (string expected, got {})",
                other.type_name()
            )))
        }
    };
    let len = t.borrow().len() as u64;
    let from = args
        .get(2)
        .and_then(Value::as_number)
        .and_then(|n| n.to_u64())
        .unwrap_or(1);
    let to = args
        .get(3)
        .and_then(Value::as_number)
        .and_then(|n| n.to_u64())
        .unwrap_or(len);
    let mut pieces = Vec::new();
    let mut i = from;
    while i <= to {
        let item = t.borrow().get(&Value::Number(Uint256::from_u64(i)));
        match &item {
            Value::Str(s) => pieces.push(s.to_string()),
            Value::Number(n) => pieces.push(n.to_string()),
            Value::Address(a) => pieces.push(a.to_hex()),
            other => {
                return Err(vm.rt_error(&format!(
                    "invalid value (at index {i}) in table for 'concat': {}",
                    other.type_name()
                )))
            }
        }
        i += 1;
    }
    Ok(vec![Value::from_string(pieces.iter().join(&sep))])
}

/// Stable insertion sort driven by the comparator, so equal elements keep
/// a deterministic relative order.
fn sort(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let t = arg_table(vm, args, "sort")?;
    let comparator = args.get(1).cloned();
    let mut items = t.borrow().array().to_vec();

    let mut less = |vm: &mut Vm, a: &Value, b: &Value| -> Result<bool, VmError> {
        match &comparator {
            Some(cmp) if !cmp.is_nil() => {
                let result = vm.call_value(cmp.clone(), &[a.clone(), b.clone()])?;
                Ok(result.first().map(Value::truthy).unwrap_or(false))
            }
            _ => default_less(vm, a, b),
        }
    };

    for i in 1..items.len() {
        let mut j = i;
        while j > 0 {
            if less(vm, &items[j], &items[j - 1])? {
                items.swap(j, j - 1);
                j -= 1;
            } else {
                break;
            }
        }
    }

    *t.borrow_mut().array_mut() = items;
    Ok(vec![])
}

fn default_less(vm: &mut Vm, a: &Value, b: &Value) -> Result<bool, VmError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(x < y),
        (Value::Str(x), Value::Str(y)) => Ok(x.as_bytes() < y.as_bytes()),
        (Value::Address(x), Value::Address(y)) => Ok(x < y),
        _ => Err(vm.rt_error(&format!(
            "attempt to compare {} with {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}
