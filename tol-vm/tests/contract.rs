//! Contract-level end-to-end tests: deploy TOL sources, drive the
//! `tos.oncreate`/`tos.oninvoke` entry points, observe storage effects.

use tol_crypto::selector_hex;
use tol_vm::prelude::*;

const ALICE: &str = "0x00000000000000000000000000000000000000000000000000000000000000a1";
const BOB: &str = "0x00000000000000000000000000000000000000000000000000000000000000b2";

const TRC20: &str = r#"
tol 0.2

contract TRC20 {
    storage {
        slot owner: address;
        slot balances: mapping(address => uint256);
    }

    event Transfer(from: address, to: address, amount: uint256);

    constructor(owner_: address, supply: uint256) public {
        set owner = owner_
        set balances[owner_] = supply
    }

    fn transfer(to: address, amount: uint256) -> (ok: bool) public {
        let from = sender()
        require(balances[from] >= amount, "INSUFFICIENT_BALANCE")
        set balances[from] = balances[from] - amount
        set balances[to] = balances[to] + amount
        emit Transfer(from, to, amount)
        return true
    }

    fn balanceOf(who: address) -> (amount: uint256) public view {
        return balances[who]
    }
}
"#;

fn deploy_trc20(supply: u64) -> ContractHost {
    let mut host = ContractHost::deploy(TRC20, "@trc20").expect("deploys");
    host.create(&[Value::from_string(ALICE), Value::number(supply)])
        .expect("constructor runs");
    host
}

fn balance_of(host: &mut ContractHost, who: &str) -> String {
    let results = host
        .invoke(
            &selector_hex("balanceOf(address)"),
            &[Value::from_string(who)],
        )
        .expect("balanceOf runs");
    results[0].display_string()
}

#[test]
fn transfer_moves_balances() {
    let mut host = deploy_trc20(1000);
    host.set_sender(ALICE).unwrap();
    let results = host
        .invoke(
            &selector_hex("transfer(address,uint256)"),
            &[Value::from_string(BOB), Value::number(300)],
        )
        .expect("transfer succeeds");
    assert_eq!(results[0].display_string(), "true");
    assert_eq!(balance_of(&mut host, ALICE), "700");
    assert_eq!(balance_of(&mut host, BOB), "300");
}

#[test]
fn insufficient_balance_reverts_without_side_effects() {
    let mut host = deploy_trc20(1000);
    host.set_sender(ALICE).unwrap();
    let err = host
        .invoke(
            &selector_hex("transfer(address,uint256)"),
            &[Value::from_string(BOB), Value::number(9999)],
        )
        .expect_err("transfer must fail");
    assert!(err.to_string().contains("INSUFFICIENT_BALANCE"));
    assert_eq!(balance_of(&mut host, ALICE), "1000");
    assert_eq!(balance_of(&mut host, BOB), "0");
}

#[test]
fn unknown_selector_raises() {
    let mut host = deploy_trc20(1000);
    let err = host
        .invoke("0xdeadbeef", &[])
        .expect_err("no such selector");
    assert!(err.to_string().contains("UNKNOWN_SELECTOR"));
}

#[test]
fn transfer_emits_an_event() {
    let mut host = deploy_trc20(500);
    host.set_sender(ALICE).unwrap();
    host.invoke(
        &selector_hex("transfer(address,uint256)"),
        &[Value::from_string(BOB), Value::number(5)],
    )
    .unwrap();
    let events = host.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "Transfer");
    assert_eq!(events[0].args.len(), 3);
    assert_eq!(events[0].args[2].display_string(), "5");
}

#[test]
fn absent_storage_reads_as_zero() {
    let mut host = deploy_trc20(100);
    assert_eq!(balance_of(&mut host, BOB), "0");
}

#[test]
fn fallback_handles_unknown_selectors() {
    let src = r#"
tol 0.2
contract WithFallback {
    storage { slot hits: uint256; }

    fn count() -> (n: uint256) public view {
        return hits
    }

    fallback() {
        set hits = hits + 1
    }
}
"#;
    let mut host = ContractHost::deploy(src, "@fb").unwrap();
    host.create(&[]).unwrap();
    host.invoke("0x00000000", &[]).expect("fallback runs");
    host.invoke("0x11111111", &[]).expect("fallback runs");
    let count = host
        .invoke(&selector_hex("count()"), &[])
        .expect("count dispatches");
    assert_eq!(count[0].display_string(), "2");
}

#[test]
fn selector_override_changes_dispatch() {
    let src = r#"
tol 0.2
contract Custom {
    @selector("0x01020304")
    fn named() -> (v: uint256) public {
        return 77
    }
}
"#;
    let mut host = ContractHost::deploy(src, "@custom").unwrap();
    host.create(&[]).unwrap();
    let results = host.invoke("0x01020304", &[]).expect("override dispatches");
    assert_eq!(results[0].display_string(), "77");
    // The auto-derived selector no longer matches.
    let err = host
        .invoke(&selector_hex("named()"), &[])
        .expect_err("auto selector is gone");
    assert!(err.to_string().contains("UNKNOWN_SELECTOR"));
}

#[test]
fn storage_arrays_push_index_and_length() {
    let src = r#"
tol 0.2
contract Stack {
    storage { slot xs: uint256[]; }

    fn push_two() -> (n: uint256) public {
        xs.push(10)
        xs.push(20)
        return xs.length
    }

    fn read(i: uint256) -> (v: uint256) public view {
        return xs[i]
    }

    fn overwrite() public {
        set xs[0] = 99
    }
}
"#;
    let mut host = ContractHost::deploy(src, "@stack").unwrap();
    host.create(&[]).unwrap();
    let n = host.invoke(&selector_hex("push_two()"), &[]).unwrap();
    assert_eq!(n[0].display_string(), "2");
    let v0 = host
        .invoke(&selector_hex("read(uint256)"), &[Value::number(0)])
        .unwrap();
    assert_eq!(v0[0].display_string(), "10");
    let v1 = host
        .invoke(&selector_hex("read(uint256)"), &[Value::number(1)])
        .unwrap();
    assert_eq!(v1[0].display_string(), "20");
    host.invoke(&selector_hex("overwrite()"), &[]).unwrap();
    let v0 = host
        .invoke(&selector_hex("read(uint256)"), &[Value::number(0)])
        .unwrap();
    assert_eq!(v0[0].display_string(), "99");
}

#[test]
fn nested_mappings_take_two_keys() {
    let src = r#"
tol 0.2
contract Allowances {
    storage { slot allowed: mapping(address => mapping(address => uint256)); }

    fn approve(spender: address, amount: uint256) public {
        set allowed[sender()][spender] = amount
    }

    fn allowance(from: address, spender: address) -> (a: uint256) public view {
        return allowed[from][spender]
    }
}
"#;
    let mut host = ContractHost::deploy(src, "@allow").unwrap();
    host.create(&[]).unwrap();
    host.set_sender(ALICE).unwrap();
    host.invoke(
        &selector_hex("approve(address,uint256)"),
        &[Value::from_string(BOB), Value::number(42)],
    )
    .unwrap();
    let a = host
        .invoke(
            &selector_hex("allowance(address,address)"),
            &[Value::from_string(ALICE), Value::from_string(BOB)],
        )
        .unwrap();
    assert_eq!(a[0].display_string(), "42");
    // Reversed keys read a different slot.
    let b = host
        .invoke(
            &selector_hex("allowance(address,address)"),
            &[Value::from_string(BOB), Value::from_string(ALICE)],
        )
        .unwrap();
    assert_eq!(b[0].display_string(), "0");
}

#[test]
fn control_flow_with_continue_and_break() {
    let src = r#"
tol 0.2
contract Sums {
    fn even_sum(n: uint256) -> (s: uint256) public {
        let s = 0
        for i in 0 .. n {
            if i % 2 == 1 { continue }
            set s = s + i
        }
        return s
    }

    fn capped_sum(n: uint256, cap: uint256) -> (s: uint256) public {
        let s = 0
        let i = 0
        while i < n {
            set s = s + i
            if s > cap { break }
            set i = i + 1
        }
        return s
    }
}
"#;
    let mut host = ContractHost::deploy(src, "@sums").unwrap();
    host.create(&[]).unwrap();
    let s = host
        .invoke(&selector_hex("even_sum(uint256)"), &[Value::number(10)])
        .unwrap();
    // 0 + 2 + 4 + 6 + 8
    assert_eq!(s[0].display_string(), "20");
    let c = host
        .invoke(
            &selector_hex("capped_sum(uint256,uint256)"),
            &[Value::number(100), Value::number(10)],
        )
        .unwrap();
    // 0+1+2+3+4 = 10, then +5 = 15 > 10 breaks
    assert_eq!(c[0].display_string(), "15");
}

#[test]
fn revert_surfaces_its_payload() {
    let src = r#"
tol 0.2
contract Reverting {
    fn nope() public {
        revert "ALWAYS_NO"
    }
}
"#;
    let mut host = ContractHost::deploy(src, "@rev").unwrap();
    host.create(&[]).unwrap();
    let err = host
        .invoke(&selector_hex("nope()"), &[])
        .expect_err("always reverts");
    assert!(err.to_string().contains("ALWAYS_NO"));
}

#[test]
fn gas_limit_applies_to_contract_execution() {
    let src = r#"
tol 0.2
contract Spin {
    fn forever() public {
        while true { }
    }
}
"#;
    let mut host = ContractHost::deploy(src, "@spin").unwrap();
    host.create(&[]).unwrap();
    host.vm_mut().set_gas_limit(50_000);
    let err = host
        .invoke(&selector_hex("forever()"), &[])
        .expect_err("burns out");
    assert_eq!(err.to_string(), "lua: gas limit exceeded");
}

#[test]
fn selector_builtin_and_member_fold_to_dispatchable_literals() {
    let src = r#"
tol 0.2
contract Introspect {
    fn target(a: uint256) -> (v: uint256) public {
        return a + 1
    }

    fn own_selector() -> (s: string) public {
        return this.target.selector
    }

    fn by_signature() -> (s: string) public {
        return selector("target(uint256)")
    }
}
"#;
    let mut host = ContractHost::deploy(src, "@intro").unwrap();
    host.create(&[]).unwrap();
    let expected = selector_hex("target(uint256)");
    let own = host.invoke(&selector_hex("own_selector()"), &[]).unwrap();
    assert_eq!(own[0].display_string(), expected);
    let by_sig = host.invoke(&selector_hex("by_signature()"), &[]).unwrap();
    assert_eq!(by_sig[0].display_string(), expected);
    // The literal they name actually dispatches.
    let v = host.invoke(&expected, &[Value::number(41)]).unwrap();
    assert_eq!(v[0].display_string(), "42");
}

#[test]
fn two_hosts_reach_identical_state() {
    let run = || {
        let mut host = deploy_trc20(1000);
        host.set_sender(ALICE).unwrap();
        host.invoke(
            &selector_hex("transfer(address,uint256)"),
            &[Value::from_string(BOB), Value::number(123)],
        )
        .unwrap();
        (
            balance_of(&mut host, ALICE),
            balance_of(&mut host, BOB),
            host.events().len(),
        )
    };
    assert_eq!(run(), run());
    assert_eq!(run(), ("877".to_string(), "123".to_string(), 1));
}
