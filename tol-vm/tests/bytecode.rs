//! Bytecode container tests at the VM boundary: determinism, auto
//! detection, rejection of tampered blobs.

use std::rc::Rc;

use tol_asm::{bytecode, DecodeError, VmId};
use tol_compiler::compile_lua;
use tol_vm::prelude::*;
use tol_vm::VmError;

const PROGRAM: &str = "local s = 0\nfor i = 1, 10 do s = s + i end\n_s = s";

fn blob() -> Vec<u8> {
    let proto = compile_lua(PROGRAM, "@blob").unwrap();
    bytecode::encode(&proto, &VmId::current())
}

#[test]
fn identical_source_produces_identical_bytecode() {
    assert_eq!(blob(), blob());
}

#[test]
fn bytecode_executes_like_source() {
    let mut from_source = Vm::new();
    from_source.execute_lua(PROGRAM, "@blob").unwrap();

    let mut from_blob = Vm::new();
    from_blob.execute(&blob(), "@blob").unwrap();

    assert_eq!(
        from_source.global("_s").display_string(),
        from_blob.global("_s").display_string()
    );
    assert_eq!(from_blob.global("_s").display_string(), "55");
}

#[test]
fn decode_round_trips_the_prototype() {
    let proto = compile_lua(PROGRAM, "@blob").unwrap();
    let encoded = bytecode::encode(&proto, &VmId::current());
    let decoded = bytecode::decode(&encoded, &VmId::current()).unwrap();
    assert_eq!(decoded, proto);
}

#[test]
fn tampered_payload_is_rejected_as_checksum_mismatch() {
    let mut bytes = blob();
    let vmid_len = VmId::current().token().len();
    let payload_start = 4 + 2 + 4 + vmid_len + 4;
    bytes[payload_start + 8] ^= 0x40;
    let mut vm = Vm::new();
    let err = vm.execute(&bytes, "@blob").unwrap_err();
    assert!(matches!(
        err,
        VmError::Decode(DecodeError::ChecksumMismatch)
    ));
}

#[test]
fn tampered_vmid_is_rejected_as_vm_mismatch() {
    let mut bytes = blob();
    // Inside the embedded fingerprint token.
    bytes[12] = b'Z';
    let mut vm = Vm::new();
    let err = vm.execute(&bytes, "@blob").unwrap_err();
    assert!(matches!(
        err,
        VmError::Decode(DecodeError::VmMismatch { .. })
    ));
}

#[test]
fn foreign_vm_fingerprint_is_rejected() {
    let proto = compile_lua(PROGRAM, "@blob").unwrap();
    let mut other = VmId::current();
    other.pkg = "other-engine-9.9.9".into();
    let bytes = bytecode::encode(&proto, &other);
    let mut vm = Vm::new();
    let err = vm.execute(&bytes, "@blob").unwrap_err();
    assert!(matches!(
        err,
        VmError::Decode(DecodeError::VmMismatch { .. })
    ));
}

#[test]
fn wrong_version_is_rejected() {
    let mut bytes = blob();
    bytes[5] = 3;
    let err = bytecode::decode(&bytes, &VmId::current()).unwrap_err();
    assert_eq!(err, DecodeError::UnsupportedVersion(3));
}

#[test]
fn every_single_byte_flip_in_the_payload_region_is_caught() {
    let clean = blob();
    let vmid_len = VmId::current().token().len();
    let payload_start = 4 + 2 + 4 + vmid_len + 4;
    let payload_end = clean.len() - 32;
    for pos in (payload_start..payload_end).step_by(7) {
        let mut bytes = clean.clone();
        bytes[pos] ^= 0x01;
        assert!(
            bytecode::decode(&bytes, &VmId::current()).is_err(),
            "flip at {pos} went unnoticed"
        );
    }
}

#[test]
fn truncated_blobs_are_rejected() {
    let bytes = blob();
    for cut in [0, 3, 9, bytes.len() / 2, bytes.len() - 1] {
        assert!(bytecode::decode(&bytes[..cut], &VmId::current()).is_err());
    }
}

#[test]
fn trailing_garbage_is_rejected() {
    let mut bytes = blob();
    bytes.extend_from_slice(b"tail");
    let err = bytecode::decode(&bytes, &VmId::current()).unwrap_err();
    assert_eq!(err, DecodeError::TrailingBytes);
}

#[test]
fn two_states_running_one_blob_agree() {
    let source = "\
        _t = {}\n\
        for i = 1, 5 do _t[i] = i * i end\n\
        _sum = 0\n\
        for i, v in ipairs(_t) do _sum = _sum + v end";
    let proto = Rc::new(compile_lua(source, "@pair").unwrap());

    let mut a = Vm::new();
    let mut b = Vm::new();
    a.execute_proto(proto.clone()).unwrap();
    b.execute_proto(proto).unwrap();

    assert_eq!(
        a.global("_sum").display_string(),
        b.global("_sum").display_string()
    );
    assert_eq!(a.global("_sum").display_string(), "55");
}

#[test]
fn executing_a_prepared_prototype_matches_the_blob_path() {
    let proto = Rc::new(compile_lua(PROGRAM, "@blob").unwrap());
    let mut direct = Vm::new();
    direct.execute_proto(proto).unwrap();
    let mut via_blob = Vm::new();
    via_blob.execute(&blob(), "@blob").unwrap();
    assert_eq!(
        direct.global("_s").display_string(),
        via_blob.global("_s").display_string()
    );
}

#[test]
fn tol_compilation_is_deterministic_end_to_end() {
    let src = "\
tol 0.2\n\
contract Pingable {\n\
    storage { slot n: uint256; }\n\
    fn bump() -> (v: uint256) public {\n\
        set n = n + 1\n\
        return n\n\
    }\n\
}\n";
    let a = tol_compiler::compile_tol(src, "@ping").unwrap();
    let b = tol_compiler::compile_tol(src, "@ping").unwrap();
    assert_eq!(a, b);
    assert_eq!(
        bytecode::encode(&a, &VmId::current()),
        bytecode::encode(&b, &VmId::current())
    );
}
