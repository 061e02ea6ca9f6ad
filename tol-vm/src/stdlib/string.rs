//! The `string` library: the pure, deterministic subset.
//!
//! There is no `string.dump` and no pattern matching in this set.

use tol_types::Uint256;

use crate::error::VmError;
use crate::value::Value;
use crate::Vm;

/// Install the `string` module.
pub fn open(vm: &mut Vm) {
    vm.register_module(
        "string",
        vec![
            ("len", len as fn(&mut Vm, &[Value]) -> Result<Vec<Value>, VmError>),
            ("sub", sub),
            ("upper", upper),
            ("lower", lower),
            ("rep", rep),
            ("reverse", reverse),
            ("byte", byte),
            ("char", char_),
            ("format", format_),
        ],
    );
}

fn arg_str(vm: &Vm, args: &[Value], index: usize, what: &str) -> Result<String, VmError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        other => Err(vm.rt_error(&format!(
            "bad argument #{} to '{what}' (string expected, got {})",
            index + 1,
            other.map(|v| v.type_name()).unwrap_or("no value")
        ))),
    }
}

fn opt_int(args: &[Value], index: usize) -> Option<i128> {
    // Ranges use small signed offsets; huge values clamp at the end.
    args.get(index).and_then(Value::as_number).map(|n| {
        n.to_u64().map(i128::from).unwrap_or(i128::MAX)
    })
}

/// Resolve a 1-based, possibly negative, range endpoint against `len`.
fn str_index(raw: i128, len: usize, default: i128) -> i128 {
    let value = if raw == 0 { default } else { raw };
    if value < 0 {
        (len as i128 + value + 1).max(0)
    } else {
        value
    }
}

fn len(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let s = arg_str(vm, args, 0, "len")?;
    Ok(vec![Value::number(s.len() as u64)])
}

fn sub(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let s = arg_str(vm, args, 0, "sub")?;
    let bytes = s.as_bytes();
    let n = bytes.len();
    let from = str_index(opt_int(args, 1).unwrap_or(1), n, 1).max(1);
    let to = str_index(opt_int(args, 2).unwrap_or(-1), n, -1).min(n as i128);
    if from > to {
        return Ok(vec![Value::from_string("")]);
    }
    let slice = &bytes[(from as usize - 1)..(to as usize)];
    Ok(vec![Value::from_string(
        String::from_utf8_lossy(slice).into_owned(),
    )])
}

fn upper(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let s = arg_str(vm, args, 0, "upper")?;
    Ok(vec![Value::from_string(s.to_ascii_uppercase())])
}

fn lower(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let s = arg_str(vm, args, 0, "lower")?;
    Ok(vec![Value::from_string(s.to_ascii_lowercase())])
}

fn rep(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let s = arg_str(vm, args, 0, "rep")?;
    let n = args
        .get(1)
        .and_then(Value::as_number)
        .and_then(|n| n.to_u64())
        .ok_or_else(|| vm.rt_error("bad argument #2 to 'rep' (number expected)"))?;
    if n.saturating_mul(s.len() as u64) > (1 << 26) {
        return Err(vm.rt_error("resulting string too large"));
    }
    Ok(vec![Value::from_string(s.repeat(n as usize))])
}

fn reverse(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let s = arg_str(vm, args, 0, "reverse")?;
    let mut bytes = s.into_bytes();
    bytes.reverse();
    Ok(vec![Value::from_string(
        String::from_utf8_lossy(&bytes).into_owned(),
    )])
}

fn byte(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let s = arg_str(vm, args, 0, "byte")?;
    let bytes = s.as_bytes();
    let n = bytes.len();
    let from = str_index(opt_int(args, 1).unwrap_or(1), n, 1).max(1);
    let to = str_index(opt_int(args, 2).unwrap_or(from), n, from).min(n as i128);
    let mut out = Vec::new();
    let mut i = from;
    while i <= to {
        out.push(Value::number(bytes[i as usize - 1] as u64));
        i += 1;
    }
    Ok(out)
}

fn char_(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let mut bytes = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let code = arg
            .as_number()
            .and_then(|n| n.to_u64())
            .filter(|&n| n <= 255)
            .ok_or_else(|| {
                vm.rt_error(&format!("bad argument #{} to 'char' (value out of range)", i + 1))
            })?;
        bytes.push(code as u8);
    }
    Ok(vec![Value::from_string(
        String::from_utf8_lossy(&bytes).into_owned(),
    )])
}

/// `%d`, `%s`, `%x` and `%%` verbs; enough for deterministic diagnostics.
fn format_(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let fmt = arg_str(vm, args, 0, "format")?;
    let mut out = String::new();
    let mut next_arg = 1usize;
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') => {
                let v = args
                    .get(next_arg)
                    .and_then(Value::as_number)
                    .ok_or_else(|| {
                        vm.rt_error(&format!(
                            "bad argument #{} to 'format' (number expected)",
                            next_arg + 1
                        ))
                    })?;
                next_arg += 1;
                out.push_str(&v.to_string());
            }
            Some('x') => {
                let v = args
                    .get(next_arg)
                    .and_then(Value::as_number)
                    .ok_or_else(|| {
                        vm.rt_error(&format!(
                            "bad argument #{} to 'format' (number expected)",
                            next_arg + 1
                        ))
                    })?;
                next_arg += 1;
                out.push_str(&to_hex_lower(v));
            }
            Some('s') => {
                let v = args.get(next_arg).cloned().unwrap_or(Value::Nil);
                next_arg += 1;
                out.push_str(&vm.tostring_value(&v)?);
            }
            Some(other) => {
                return Err(vm.rt_error(&format!(
                    "invalid option '%{other}' to 'format'"
                )))
            }
            None => return Err(vm.rt_error("invalid trailing '%' in format string")),
        }
    }
    Ok(vec![Value::from_string(out)])
}

fn to_hex_lower(v: Uint256) -> String {
    let bytes = v.to_be_bytes();
    let text = hex::encode(bytes);
    let trimmed = text.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
