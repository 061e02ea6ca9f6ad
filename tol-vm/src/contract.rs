//! Contract host surface.
//!
//! [`ContractHost`] owns a VM, installs the host bindings the TOL lowering
//! expects (`keccak256`, `__tol_enc`, `uint256_add_hex`, `emit`, `sender`),
//! runs the lowered chunk, and drives the `tos.oncreate`/`tos.oninvoke`
//! entry points.

use std::cell::RefCell;
use std::rc::Rc;

use tol_crypto::keccak256;
use tol_types::{Address, Bytes32, Uint256};

use crate::error::VmError;
use crate::state::{Vm, VmParams};
use crate::value::Value;

/// A captured `emit` call.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event name.
    pub name: String,
    /// Arguments, verbatim.
    pub args: Vec<Value>,
}

/// A deployed contract: VM state, captured events, and the caller
/// identity exposed through the `sender()` binding.
pub struct ContractHost {
    vm: Vm,
    events: Rc<RefCell<Vec<Event>>>,
    sender: Rc<RefCell<Address>>,
}

impl ContractHost {
    /// Compile and run a TOL module, leaving the contract ready for
    /// `create`/`invoke`.
    pub fn deploy(source: &str, name: &str) -> Result<Self, VmError> {
        Self::deploy_with_params(source, name, VmParams::default())
    }

    /// Deploy with explicit VM parameters.
    pub fn deploy_with_params(
        source: &str,
        name: &str,
        params: VmParams,
    ) -> Result<Self, VmError> {
        let mut vm = Vm::with_params(params);
        let events: Rc<RefCell<Vec<Event>>> = Rc::new(RefCell::new(Vec::new()));
        let sender = Rc::new(RefCell::new(Address::zeroed()));
        install_bindings(&mut vm, events.clone(), sender.clone());
        vm.execute_tol(source, name)?;
        Ok(Self { vm, events, sender })
    }

    /// Set the caller identity reported by `sender()`.
    pub fn set_sender(&mut self, address: &str) -> Result<(), VmError> {
        let parsed = Address::parse(address)
            .map_err(|e| VmError::runtime(format!("bad sender address: {e}")))?;
        *self.sender.borrow_mut() = parsed;
        Ok(())
    }

    /// Invoke the constructor entry point.
    pub fn create(&mut self, args: &[Value]) -> Result<Vec<Value>, VmError> {
        let entry = self.entry("oncreate")?;
        self.vm.call_value(entry, args)
    }

    /// Dispatch by 10-character hex selector; unknown selectors fall to
    /// the fallback or raise `UNKNOWN_SELECTOR`.
    pub fn invoke(&mut self, selector: &str, args: &[Value]) -> Result<Vec<Value>, VmError> {
        let entry = self.entry("oninvoke")?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Value::from_string(selector));
        full.extend_from_slice(args);
        self.vm.call_value(entry, &full)
    }

    /// Events emitted so far, in emission order.
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// Drop all captured events.
    pub fn clear_events(&mut self) {
        self.events.borrow_mut().clear();
    }

    /// The underlying VM, for gas control and direct inspection.
    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Read-only access to the underlying VM.
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    fn entry(&self, name: &str) -> Result<Value, VmError> {
        let tos = self.vm.global("tos");
        let Value::Table(tos) = tos else {
            return Err(VmError::runtime("contract did not install 'tos'"));
        };
        let entry = tos.borrow().get_str(name);
        if entry.is_nil() {
            return Err(VmError::runtime(format!("missing entry point 'tos.{name}'")));
        }
        Ok(entry)
    }
}

fn install_bindings(
    vm: &mut Vm,
    events: Rc<RefCell<Vec<Event>>>,
    sender: Rc<RefCell<Address>>,
) {
    vm.register("keccak256", |vm, args| {
        let bytes = hash_input(vm, args.first())?;
        Ok(vec![Value::from_string(keccak256(&bytes).to_hex())])
    });

    vm.register("__tol_enc", |vm, args| {
        let value = args.first().cloned().unwrap_or(Value::Nil);
        let encoded = encode_key(&value).map_err(|msg| vm.rt_error(&msg))?;
        Ok(vec![Value::from_string(format!(
            "0x{}",
            hex::encode(encoded.as_ref())
        ))])
    });

    vm.register("uint256_add_hex", |vm, args| {
        let base = match args.first() {
            Some(Value::Str(s)) => Uint256::from_hex(s)
                .map_err(|e| vm.rt_error(&format!("bad base slot '{s}': {e}")))?,
            other => {
                return Err(vm.rt_error(&format!(
                    "uint256_add_hex expects a hex string, got {}",
                    other.map(|v| v.type_name()).unwrap_or("no value")
                )))
            }
        };
        let offset = match args.get(1) {
            Some(Value::Number(n)) => *n,
            Some(Value::Str(s)) => Uint256::from_literal(s)
                .map_err(|e| vm.rt_error(&format!("bad offset '{s}': {e}")))?,
            other => {
                return Err(vm.rt_error(&format!(
                    "uint256_add_hex expects a numeric offset, got {}",
                    other.map(|v| v.type_name()).unwrap_or("no value")
                )))
            }
        };
        let sum = base.wrapping_add(offset);
        Ok(vec![Value::from_string(format!(
            "0x{}",
            hex::encode(sum.to_be_bytes())
        ))])
    });

    vm.register("emit", move |_vm, args| {
        let name = args
            .first()
            .map(Value::display_string)
            .unwrap_or_default();
        events.borrow_mut().push(Event {
            name,
            args: args.get(1..).unwrap_or(&[]).to_vec(),
        });
        Ok(vec![])
    });

    vm.register("sender", move |_vm, _args| {
        Ok(vec![Value::from_string(sender.borrow().to_hex())])
    });
}

fn hash_input(vm: &Vm, arg: Option<&Value>) -> Result<Vec<u8>, VmError> {
    match arg {
        Some(Value::Str(s)) => {
            if let Some(digits) = s.strip_prefix("0x") {
                let padded = if digits.len() % 2 == 1 {
                    format!("0{digits}")
                } else {
                    digits.to_string()
                };
                hex::decode(padded)
                    .map_err(|e| vm.rt_error(&format!("bad hex input to keccak256: {e}")))
            } else {
                Ok(s.as_bytes().to_vec())
            }
        }
        Some(Value::Address(a)) => Ok(a.as_ref().to_vec()),
        other => Err(vm.rt_error(&format!(
            "keccak256 expects a string, got {}",
            other.map(|v| v.type_name()).unwrap_or("no value")
        ))),
    }
}

/// Canonical 32-byte right-aligned key encoding of a TOL value.
pub fn encode_key(value: &Value) -> Result<Bytes32, String> {
    match value {
        Value::Bool(b) => Ok(Bytes32::right_aligned(&[*b as u8]).expect("one byte")),
        Value::Address(a) => Ok(Bytes32::new((*a).into())),
        Value::Number(n) => Ok(Bytes32::new(n.to_be_bytes())),
        Value::Str(s) => {
            if let Some(digits) = s.strip_prefix("0x") {
                let padded = if digits.len() % 2 == 1 {
                    format!("0{digits}")
                } else {
                    digits.to_string()
                };
                let bytes = hex::decode(padded)
                    .map_err(|e| format!("bad hex key '{s}': {e}"))?;
                Bytes32::right_aligned(&bytes)
                    .ok_or_else(|| format!("hex key '{s}' exceeds 32 bytes"))
            } else {
                let n = Uint256::from_decimal(s)
                    .map_err(|e| format!("bad numeric key '{s}': {e}"))?;
                Ok(Bytes32::new(n.to_be_bytes()))
            }
        }
        other => Err(format!("cannot encode a {} as a storage key", other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_matches_the_canonical_layout() {
        // bool
        let t = encode_key(&Value::Bool(true)).unwrap();
        assert_eq!(t[31], 1);
        assert!(t[..31].iter().all(|&b| b == 0));
        // number
        let n = encode_key(&Value::number(0x1234)).unwrap();
        assert_eq!(&n[30..], &[0x12, 0x34]);
        // decimal string
        let d = encode_key(&Value::from_string("256")).unwrap();
        assert_eq!(&d[30..], &[0x01, 0x00]);
        // hex string, right-aligned
        let h = encode_key(&Value::from_string("0xabcd")).unwrap();
        assert_eq!(&h[30..], &[0xab, 0xcd]);
    }

    #[test]
    fn oversized_hex_keys_are_rejected() {
        let long = format!("0x{}", "ff".repeat(33));
        assert!(encode_key(&Value::from_string(long)).is_err());
    }

    #[test]
    fn float_and_negative_keys_are_rejected() {
        assert!(encode_key(&Value::from_string("1.5")).is_err());
        assert!(encode_key(&Value::from_string("-4")).is_err());
        assert!(encode_key(&Value::Nil).is_err());
    }
}
