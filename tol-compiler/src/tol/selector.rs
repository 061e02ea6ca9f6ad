//! Selector derivation and validation.
//!
//! A dispatch selector is the first four bytes of the Keccak-256 digest of
//! a canonical signature, rendered as the 10-character `0x` hex form, or
//! an explicit `@selector("0x........")` override.

use itertools::Itertools;
use tol_crypto::selector_hex;

use crate::tol::ast::FnDecl;

/// Canonical signature of a function: `name(type1,type2,...)`.
pub fn canonical_signature(decl: &FnDecl) -> String {
    let args = decl.params.iter().map(|p| p.ty.canonical()).join(",");
    format!("{}({})", decl.name, args)
}

/// Selector of a function: the override when present, otherwise derived
/// from the canonical signature.
pub fn selector_of(decl: &FnDecl) -> String {
    match &decl.selector_override {
        Some((sel, _)) => sel.clone(),
        None => selector_hex(&canonical_signature(decl)),
    }
}

/// Whether a literal has the exact selector shape: 10 characters,
/// `0x`-prefixed, lowercase hex.
pub fn is_selector_literal(s: &str) -> bool {
    s.len() == 10
        && s.starts_with("0x")
        && s[2..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Validate the canonical argument-type syntax of a `selector("sig")`
/// argument: `name(t1,t2,...)` over the canonical type names.
pub fn is_canonical_signature(sig: &str) -> bool {
    let Some(open) = sig.find('(') else {
        return false;
    };
    if !sig.ends_with(')') {
        return false;
    }
    let name = &sig[..open];
    if name.is_empty() || !is_identifier(name) {
        return false;
    }
    let args = &sig[open + 1..sig.len() - 1];
    if args.is_empty() {
        return true;
    }
    args.split(',').all(is_canonical_type)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_canonical_type(s: &str) -> bool {
    let base = s.trim_end_matches("[]");
    // Only whole "[]" groups may be trimmed.
    let suffix = &s[base.len()..];
    if !suffix.is_empty() && suffix.len() % 2 != 0 {
        return false;
    }
    matches!(base, "uint256" | "bool" | "address" | "string")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tol::ast::{FnKind, Param, Type};

    fn decl(name: &str, tys: Vec<Type>) -> FnDecl {
        FnDecl {
            name: name.into(),
            kind: FnKind::Normal,
            params: tys
                .into_iter()
                .enumerate()
                .map(|(i, ty)| Param {
                    name: format!("p{i}"),
                    ty,
                    indexed: false,
                    line: 1,
                })
                .collect(),
            returns: vec![],
            modifiers: vec![],
            selector_override: None,
            body: vec![],
            line: 1,
        }
    }

    #[test]
    fn canonical_signature_matches_argument_types() {
        let d = decl("transfer", vec![Type::Address, Type::Uint256]);
        assert_eq!(canonical_signature(&d), "transfer(address,uint256)");
        assert_eq!(selector_of(&d), "0xa9059cbb");
    }

    #[rstest::rstest]
    #[case("0xa9059cbb", true)]
    #[case("0xA9059CBB", false)]
    #[case("0xa9059cb", false)]
    #[case("a9059cbb00", false)]
    fn selector_literal_shape(#[case] literal: &str, #[case] valid: bool) {
        assert_eq!(is_selector_literal(literal), valid);
    }

    #[rstest::rstest]
    #[case("transfer(address,uint256)", true)]
    #[case("init()", true)]
    #[case("f(uint256[])", true)]
    #[case("f", false)]
    #[case("f(uint257)", false)]
    #[case("f(uint256,)", false)]
    #[case("(uint256)", false)]
    fn canonical_signature_syntax(#[case] signature: &str, #[case] valid: bool) {
        assert_eq!(is_canonical_signature(signature), valid);
    }
}
