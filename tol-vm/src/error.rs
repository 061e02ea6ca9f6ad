//! Runtime error model.
//!
//! Errors split into recoverable ones, which unwind to the nearest
//! protected frame and surface through `pcall` with their error object
//! preserved verbatim, and halting ones (resource exhaustion, malformed
//! input), which terminate the VM run regardless of protection.

use derive_more::Display;
use tol_asm::DecodeError;
use tol_compiler::CompileError;

use crate::value::Value;

/// The exact public gas-exhaustion message; hosts pattern-match on it.
pub const GAS_EXHAUSTED: &str = "lua: gas limit exceeded";

/// One frame of a captured traceback.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display(fmt = "{}:{}: in {}", source, line, what)]
pub struct TracebackFrame {
    /// Source label of the frame's prototype.
    pub source: String,
    /// Line the frame was executing.
    pub line: u32,
    /// Human description of the callee.
    pub what: String,
}

/// Interpreter error variants.
#[derive(Debug, Clone, Display)]
pub enum VmError {
    /// A raised runtime error carrying its error object; recoverable.
    #[display(fmt = "{}", "value.display_string()")]
    Runtime {
        /// The error object, preserved verbatim through `pcall`.
        value: Value,
        /// Call-stack trace captured at the raise site.
        traceback: Vec<TracebackFrame>,
    },
    /// The gas budget ran out.
    #[display(fmt = "{}", GAS_EXHAUSTED)]
    Gas,
    /// Call-stack depth exceeded; not recoverable by scripts.
    #[display(fmt = "stack overflow")]
    StackOverflow,
    /// Register file exceeded its configured maximum; not recoverable.
    #[display(fmt = "registry overflow")]
    RegistryOverflow,
    /// The bytecode container was rejected.
    #[display(fmt = "{}", _0)]
    Decode(DecodeError),
    /// The source failed to compile.
    #[display(fmt = "{}", _0)]
    Compile(CompileError),
}

impl VmError {
    /// Raise a runtime error from a message string.
    pub fn runtime(message: impl Into<String>) -> Self {
        VmError::Runtime {
            value: Value::from_string(message.into()),
            traceback: Vec::new(),
        }
    }

    /// Raise a runtime error carrying an arbitrary error object.
    pub fn object(value: Value) -> Self {
        VmError::Runtime {
            value,
            traceback: Vec::new(),
        }
    }

    /// Whether a protected call recovers from this error.
    ///
    /// Gas exhaustion is recoverable in the sense that it unwinds to the
    /// protected frame; the counter stays exhausted, so execution cannot
    /// make further progress without the host raising the limit.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, VmError::Runtime { .. } | VmError::Gas)
    }

    /// The error object a protected call hands back to the script.
    pub fn error_value(&self) -> Value {
        match self {
            VmError::Runtime { value, .. } => value.clone(),
            other => Value::from_string(other.to_string()),
        }
    }
}

impl std::error::Error for VmError {}

impl From<DecodeError> for VmError {
    fn from(err: DecodeError) -> Self {
        VmError::Decode(err)
    }
}

impl From<CompileError> for VmError {
    fn from(err: CompileError) -> Self {
        VmError::Compile(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_message_is_bit_exact() {
        assert_eq!(VmError::Gas.to_string(), "lua: gas limit exceeded");
    }

    #[test]
    fn recoverability_split() {
        assert!(VmError::runtime("boom").is_recoverable());
        assert!(VmError::Gas.is_recoverable());
        assert!(!VmError::StackOverflow.is_recoverable());
        assert!(!VmError::RegistryOverflow.is_recoverable());
    }

    #[test]
    fn error_objects_are_preserved() {
        let err = VmError::object(Value::from_string("payload"));
        match err.error_value() {
            Value::Str(s) => assert_eq!(&*s, "payload"),
            other => panic!("unexpected error value {other:?}"),
        }
    }
}
