//! The base library.

use tol_types::{Address, Uint256};

use crate::error::VmError;
use crate::value::Value;
use crate::Vm;

/// Install the base functions as globals.
pub fn open(vm: &mut Vm) {
    vm.register("assert", |_vm, args| {
        let value = args.first().cloned().unwrap_or(Value::Nil);
        if value.truthy() {
            return Ok(args.to_vec());
        }
        let message = args
            .get(1)
            .cloned()
            .unwrap_or_else(|| Value::from_string("assertion failed!"));
        Err(VmError::object(message))
    });

    vm.register("error", |vm, args| {
        let value = args.first().cloned().unwrap_or(Value::Nil);
        let level = args
            .get(1)
            .and_then(Value::as_number)
            .and_then(|n| n.to_u64())
            .unwrap_or(1);
        let value = match (&value, level) {
            (Value::Str(s), level) if level > 0 => match vm.current_location() {
                Some((source, line)) => {
                    Value::from_string(format!("{source}:{line}: {s}"))
                }
                None => value.clone(),
            },
            _ => value,
        };
        Err(VmError::Runtime {
            value,
            traceback: vm.traceback(),
        })
    });

    vm.register("type", |_vm, args| {
        let value = args.first().cloned().unwrap_or(Value::Nil);
        Ok(vec![Value::from_string(value.type_name())])
    });

    vm.register("tostring", |vm, args| {
        let value = args.first().cloned().unwrap_or(Value::Nil);
        let text = vm.tostring_value(&value)?;
        Ok(vec![Value::from_string(text)])
    });

    vm.register("tonumber", |vm, args| {
        let value = args.first().cloned().unwrap_or(Value::Nil);
        let result = match args.get(1) {
            None => match &value {
                Value::Number(n) => Some(*n),
                Value::Str(s) => Uint256::from_literal(s.trim()).ok(),
                _ => None,
            },
            Some(base) => {
                let radix = base
                    .as_number()
                    .and_then(|n| n.to_u64())
                    .ok_or_else(|| vm.rt_error("'tonumber' base must be a number"))?;
                match &value {
                    Value::Str(s) => {
                        Uint256::from_str_radix(s.trim(), radix as u32).ok()
                    }
                    _ => None,
                }
            }
        };
        Ok(vec![result.map(Value::Number).unwrap_or(Value::Nil)])
    });

    vm.register("address", |vm, args| {
        let value = args.first().cloned().unwrap_or(Value::Nil);
        match &value {
            Value::Address(_) => Ok(vec![value.clone()]),
            Value::Str(s) => {
                let parsed = Address::parse(s)
                    .map_err(|e| vm.rt_error(&format!("bad address literal: {e}")))?;
                Ok(vec![Value::Address(parsed)])
            }
            other => Err(vm.rt_error(&format!(
                "bad argument to 'address' (string expected, got {})",
                other.type_name()
            ))),
        }
    });

    vm.register("rawequal", |_vm, args| {
        let a = args.first().cloned().unwrap_or(Value::Nil);
        let b = args.get(1).cloned().unwrap_or(Value::Nil);
        Ok(vec![Value::Bool(a.raw_eq(&b))])
    });

    vm.register("rawget", |vm, args| {
        let Some(Value::Table(t)) = args.first() else {
            return Err(vm.rt_error("bad argument to 'rawget' (table expected)"));
        };
        let key = args.get(1).cloned().unwrap_or(Value::Nil);
        Ok(vec![t.borrow().get(&key)])
    });

    vm.register("rawset", |vm, args| {
        let Some(Value::Table(t)) = args.first() else {
            return Err(vm.rt_error("bad argument to 'rawset' (table expected)"));
        };
        let key = args.get(1).cloned().unwrap_or(Value::Nil);
        let value = args.get(2).cloned().unwrap_or(Value::Nil);
        let Some(canonical) = crate::table::TableKey::from_value(&key) else {
            return Err(vm.rt_error("table index is nil"));
        };
        t.borrow_mut().set_with_key(canonical, &key, value);
        Ok(vec![args[0].clone()])
    });

    vm.register("next", next_impl);

    let next_value = vm.host_function("next", next_impl);
    vm.register("pairs", move |vm, args| {
        let table = args.first().cloned().unwrap_or(Value::Nil);
        if !matches!(table, Value::Table(_)) {
            return Err(vm.rt_error("bad argument to 'pairs' (table expected)"));
        }
        Ok(vec![next_value.clone(), table, Value::Nil])
    });

    let ipairs_iter = vm.host_function("ipairs.iterator", |vm, args| {
        let Some(Value::Table(t)) = args.first() else {
            return Err(vm.rt_error("bad 'ipairs' iterator state"));
        };
        let index = args
            .get(1)
            .and_then(Value::as_number)
            .unwrap_or(Uint256::ZERO)
            .wrapping_add(Uint256::ONE);
        let value = t.borrow().get(&Value::Number(index));
        if value.is_nil() {
            Ok(vec![Value::Nil])
        } else {
            Ok(vec![Value::Number(index), value])
        }
    });
    vm.register("ipairs", move |vm, args| {
        let table = args.first().cloned().unwrap_or(Value::Nil);
        if !matches!(table, Value::Table(_)) {
            return Err(vm.rt_error("bad argument to 'ipairs' (table expected)"));
        }
        Ok(vec![ipairs_iter.clone(), table, Value::number(0)])
    });

    vm.register("select", |vm, args| {
        let selector = args.first().cloned().unwrap_or(Value::Nil);
        if let Value::Str(s) = &selector {
            if &**s == "#" {
                return Ok(vec![Value::number(args.len().saturating_sub(1) as u64)]);
            }
        }
        let n = selector
            .as_number()
            .and_then(|n| n.to_u64())
            .filter(|&n| n >= 1)
            .ok_or_else(|| vm.rt_error("bad argument to 'select' (index out of range)"))?;
        Ok(args.iter().skip(n as usize).cloned().collect())
    });

    vm.register("unpack", unpack_impl);

    vm.register("setmetatable", |vm, args| {
        let Some(Value::Table(t)) = args.first() else {
            return Err(vm.rt_error("bad argument to 'setmetatable' (table expected)"));
        };
        let protected = t
            .borrow()
            .metatable
            .as_ref()
            .map(|mt| !mt.borrow().get_str("__metatable").is_nil())
            .unwrap_or(false);
        if protected {
            return Err(vm.rt_error("cannot change a protected metatable"));
        }
        match args.get(1) {
            Some(Value::Table(mt)) => t.borrow_mut().metatable = Some(mt.clone()),
            Some(Value::Nil) | None => t.borrow_mut().metatable = None,
            Some(_) => {
                return Err(
                    vm.rt_error("bad argument to 'setmetatable' (nil or table expected)")
                )
            }
        }
        Ok(vec![args[0].clone()])
    });

    vm.register("getmetatable", |_vm, args| {
        let value = args.first().cloned().unwrap_or(Value::Nil);
        let Some(mt) = value.metatable() else {
            return Ok(vec![Value::Nil]);
        };
        let guard = mt.borrow().get_str("__metatable");
        if guard.is_nil() {
            Ok(vec![Value::Table(mt)])
        } else {
            Ok(vec![guard])
        }
    });

    vm.register("pcall", |vm, args| {
        let f = args.first().cloned().unwrap_or(Value::Nil);
        vm.pcall(f, args.get(1..).unwrap_or(&[]))
    });

    vm.register("xpcall", |vm, args| {
        let f = args.first().cloned().unwrap_or(Value::Nil);
        let handler = args.get(1).cloned().unwrap_or(Value::Nil);
        vm.xpcall(f, handler, args.get(2..).unwrap_or(&[]))
    });
}

fn next_impl(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let Some(Value::Table(t)) = args.first() else {
        return Err(vm.rt_error("bad argument to 'next' (table expected)"));
    };
    let key = args.get(1).cloned().unwrap_or(Value::Nil);
    match t.borrow().next_pair(&key) {
        Some((k, v)) => Ok(vec![k, v]),
        None => Ok(vec![Value::Nil]),
    }
}

pub(crate) fn unpack_impl(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let Some(Value::Table(t)) = args.first() else {
        return Err(vm.rt_error("bad argument to 'unpack' (table expected)"));
    };
    let len = t.borrow().len() as u64;
    let from = args
        .get(1)
        .and_then(Value::as_number)
        .and_then(|n| n.to_u64())
        .unwrap_or(1);
    let to = args
        .get(2)
        .and_then(Value::as_number)
        .and_then(|n| n.to_u64())
        .unwrap_or(len);
    let mut out = Vec::new();
    let mut i = from;
    while i <= to {
        out.push(t.borrow().get(&Value::Number(Uint256::from_u64(i))));
        i += 1;
    }
    Ok(out)
}
