//! Semantic checker for TOL modules.
//!
//! Every rule is gated behind a stable `TOL2xxx` code:
//!
//! | Code | Rule |
//! |------|------|
//! | 2001 | module version must equal `0.2` |
//! | 2002 | a contract must exist |
//! | 2003 | storage slot names unique |
//! | 2004 | function names unique |
//! | 2010 | `@selector` value is `0x` + 8 lowercase hex |
//! | 2011 | selector collision across public/external functions |
//! | 2012 | `@selector` forbidden on internal/private functions |
//! | 2013 | `selector("sig")` takes one canonical string literal |
//! | 2014 | `.selector` targets a public/external function |
//! | 2020 | `break`/`continue` only inside loops |
//! | 2021 | `set` target is an identifier, member or index expression |
//! | 2023 | `require`/`assert` need a boolean-producing condition |
//! | 2025 | `emit` targets a declared event with matching arity |
//! | 2026 | return value vs void must match the declaration |
//! | 2027 | non-void functions return a value on every path |
//! | 2028 | parameter and return names unique and disjoint |
//! | 2029 | `let` names unique within a lexical scope |
//! | 2030 | statements after a terminator are unreachable |
//! | 2031 | storage access shape matches the slot kind |
//! | 2032 | reserved names cannot be declared |
//! | 2033 | modifier words valid and non-conflicting |
//! | 2034 | constructor modifiers restricted |
//! | 2035 | member access is a known form |
//! | 2036 | mapping types are storage-only |
//!
//! `if`/`while` conditions and `revert` payload shapes (spec codes 2022 and
//! 2024) are enforced by the grammar and cannot reach the checker.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::CompileError;
use crate::tol::ast::*;
use crate::tol::selector::{is_canonical_signature, is_selector_literal, selector_of};

const VISIBILITY: [&str; 4] = ["public", "external", "internal", "private"];
const MUTABILITY: [&str; 3] = ["view", "pure", "payable"];

/// Check a parsed module against the full rule set.
pub fn check(module: &Module, chunk: &str) -> Result<(), CompileError> {
    let checker = Checker { chunk };
    checker.module(module)
}

/// Visibility of a function after modifier resolution.
pub fn visibility(decl: &FnDecl) -> &str {
    decl.modifiers
        .iter()
        .map(|(w, _)| w.as_str())
        .find(|w| VISIBILITY.contains(w))
        .unwrap_or("internal")
}

/// Whether a function takes part in selector dispatch.
pub fn is_dispatchable(decl: &FnDecl) -> bool {
    matches!(visibility(decl), "public" | "external")
}

fn is_reserved(name: &str) -> bool {
    name == "this" || name == "selector" || name.starts_with("__tol_")
}

struct Checker<'a> {
    chunk: &'a str,
}

struct FnCx<'a> {
    contract: &'a Contract,
    decl: &'a FnDecl,
    scopes: Vec<BTreeSet<String>>,
    loop_depth: usize,
    has_value_return: bool,
}

impl<'a> FnCx<'a> {
    fn is_local(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s.contains(name))
    }

    fn slot(&self, name: &str) -> Option<&'a SlotDecl> {
        if self.is_local(name) {
            return None;
        }
        self.contract.storage.iter().find(|s| s.name == name)
    }
}

impl<'a> Checker<'a> {
    fn err(&self, line: u32, code: &str, msg: impl Into<String>) -> CompileError {
        CompileError::sema(self.chunk, line, code, msg)
    }

    fn module(&self, module: &Module) -> Result<(), CompileError> {
        if module.version != "0.2" {
            return Err(self.err(
                module.version_line,
                "TOL2001",
                format!("unsupported tol version '{}', expected 0.2", module.version),
            ));
        }
        let Some(contract) = &module.contract else {
            return Err(self.err(
                module.version_line,
                "TOL2002",
                "module declares no contract",
            ));
        };
        self.contract(contract)
    }

    fn contract(&self, contract: &Contract) -> Result<(), CompileError> {
        let mut slot_names = BTreeSet::new();
        for slot in &contract.storage {
            if is_reserved(&slot.name) {
                return Err(self.err(
                    slot.line,
                    "TOL2032",
                    format!("'{}' is a reserved name", slot.name),
                ));
            }
            if !slot_names.insert(slot.name.clone()) {
                return Err(self.err(
                    slot.line,
                    "TOL2003",
                    format!("duplicate storage slot '{}'", slot.name),
                ));
            }
        }

        let mut fn_names = BTreeSet::new();
        for decl in &contract.functions {
            if is_reserved(&decl.name) {
                return Err(self.err(
                    decl.line,
                    "TOL2032",
                    format!("'{}' is a reserved name", decl.name),
                ));
            }
            if !fn_names.insert(decl.name.clone()) {
                return Err(self.err(
                    decl.line,
                    "TOL2004",
                    format!("duplicate function '{}'", decl.name),
                ));
            }
        }

        self.check_selectors(contract)?;

        for decl in &contract.functions {
            self.function(contract, decl)?;
        }
        if let Some(ctor) = &contract.constructor {
            self.constructor_modifiers(ctor)?;
            self.function(contract, ctor)?;
        }
        if let Some(fallback) = &contract.fallback {
            self.fallback_modifiers(fallback)?;
            self.function(contract, fallback)?;
        }
        Ok(())
    }

    fn check_selectors(&self, contract: &Contract) -> Result<(), CompileError> {
        let mut seen: BTreeMap<String, String> = BTreeMap::new();
        for decl in &contract.functions {
            if let Some((value, line)) = &decl.selector_override {
                if !is_selector_literal(value) {
                    return Err(self.err(
                        *line,
                        "TOL2010",
                        format!(
                            "selector '{value}' must be 0x followed by 8 lowercase hex characters"
                        ),
                    ));
                }
                if !is_dispatchable(decl) {
                    return Err(self.err(
                        *line,
                        "TOL2012",
                        format!(
                            "@selector is not allowed on {} function '{}'",
                            visibility(decl),
                            decl.name
                        ),
                    ));
                }
            }
            if is_dispatchable(decl) {
                let selector = selector_of(decl);
                if let Some(other) = seen.insert(selector.clone(), decl.name.clone()) {
                    return Err(self.err(
                        decl.line,
                        "TOL2011",
                        format!(
                            "selector {selector} of '{}' collides with '{other}'",
                            decl.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn modifier_words(&self, decl: &FnDecl) -> Result<Vec<String>, CompileError> {
        let mut words = Vec::new();
        for (word, line) in &decl.modifiers {
            if !VISIBILITY.contains(&word.as_str()) && !MUTABILITY.contains(&word.as_str()) {
                return Err(self.err(
                    *line,
                    "TOL2033",
                    format!("unknown modifier '{word}'"),
                ));
            }
            if words.contains(word) {
                return Err(self.err(
                    *line,
                    "TOL2033",
                    format!("duplicate modifier '{word}'"),
                ));
            }
            words.push(word.clone());
        }
        let vis: Vec<&String> = words
            .iter()
            .filter(|w| VISIBILITY.contains(&w.as_str()))
            .collect();
        if vis.len() > 1 {
            return Err(self.err(
                decl.line,
                "TOL2033",
                format!("conflicting visibility modifiers on '{}'", decl.name),
            ));
        }
        let payable = words.iter().any(|w| w == "payable");
        let view = words.iter().any(|w| w == "view");
        let pure = words.iter().any(|w| w == "pure");
        if (view && payable) || (pure && payable) || (view && pure) {
            return Err(self.err(
                decl.line,
                "TOL2033",
                format!("conflicting mutability modifiers on '{}'", decl.name),
            ));
        }
        Ok(words)
    }

    fn constructor_modifiers(&self, decl: &FnDecl) -> Result<(), CompileError> {
        for (word, line) in &decl.modifiers {
            if !matches!(word.as_str(), "public" | "internal" | "payable") {
                return Err(self.err(
                    *line,
                    "TOL2034",
                    format!("constructor cannot be '{word}'"),
                ));
            }
        }
        Ok(())
    }

    fn fallback_modifiers(&self, decl: &FnDecl) -> Result<(), CompileError> {
        for (word, line) in &decl.modifiers {
            if !matches!(word.as_str(), "public" | "external" | "payable") {
                return Err(self.err(
                    *line,
                    "TOL2034",
                    format!("fallback cannot be '{word}'"),
                ));
            }
        }
        Ok(())
    }

    fn function(&self, contract: &Contract, decl: &FnDecl) -> Result<(), CompileError> {
        if decl.kind == FnKind::Normal {
            self.modifier_words(decl)?;
        }

        let mut names = BTreeSet::new();
        for param in decl.params.iter().chain(&decl.returns) {
            if is_reserved(&param.name) {
                return Err(self.err(
                    param.line,
                    "TOL2032",
                    format!("'{}' is a reserved name", param.name),
                ));
            }
            if !names.insert(param.name.clone()) {
                return Err(self.err(
                    param.line,
                    "TOL2028",
                    format!(
                        "parameter or return name '{}' declared twice in '{}'",
                        param.name, decl.name
                    ),
                ));
            }
            if param.ty.mapping_depth() > 0 {
                return Err(self.err(
                    param.line,
                    "TOL2036",
                    "mapping types are storage-only",
                ));
            }
        }

        let mut cx = FnCx {
            contract,
            decl,
            scopes: vec![names],
            loop_depth: 0,
            has_value_return: false,
        };
        self.block(&mut cx, &decl.body)?;

        let non_void = !decl.returns.is_empty();
        if non_void {
            if !cx.has_value_return {
                return Err(self.err(
                    decl.line,
                    "TOL2027",
                    format!("function '{}' never returns a value", decl.name),
                ));
            }
            if !block_terminates(&decl.body) {
                return Err(self.err(
                    decl.line,
                    "TOL2027",
                    format!(
                        "function '{}' does not return a value on every path",
                        decl.name
                    ),
                ));
            }
        }
        Ok(())
    }

    fn block(&self, cx: &mut FnCx<'_>, stats: &[TStatNode]) -> Result<(), CompileError> {
        cx.scopes.push(BTreeSet::new());
        for (i, node) in stats.iter().enumerate() {
            if i > 0 && is_terminator(&stats[i - 1].stat) {
                return Err(self.err(
                    node.line,
                    "TOL2030",
                    "unreachable statement after terminator",
                ));
            }
            self.stat(cx, node)?;
        }
        cx.scopes.pop();
        Ok(())
    }

    fn stat(&self, cx: &mut FnCx<'_>, node: &TStatNode) -> Result<(), CompileError> {
        let line = node.line;
        match &node.stat {
            TStat::Let { name, ty, value } => {
                if is_reserved(name) {
                    return Err(self.err(
                        line,
                        "TOL2032",
                        format!("'{name}' is a reserved name"),
                    ));
                }
                if let Some(ty) = ty {
                    if ty.mapping_depth() > 0 {
                        return Err(self.err(
                            line,
                            "TOL2036",
                            "mapping types are storage-only",
                        ));
                    }
                }
                self.expr(cx, value)?;
                let scope = cx.scopes.last_mut().expect("open scope");
                if !scope.insert(name.clone()) {
                    return Err(self.err(
                        line,
                        "TOL2029",
                        format!("'{name}' is already declared in this scope"),
                    ));
                }
                Ok(())
            }
            TStat::SetStat { target, value } => {
                self.set_target(cx, target)?;
                self.expr(cx, value)
            }
            TStat::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cx, cond)?;
                self.block(cx, then_block)?;
                if let Some(else_block) = else_block {
                    self.block(cx, else_block)?;
                }
                Ok(())
            }
            TStat::While { cond, body } => {
                self.expr(cx, cond)?;
                cx.loop_depth += 1;
                self.block(cx, body)?;
                cx.loop_depth -= 1;
                Ok(())
            }
            TStat::For {
                var,
                start,
                stop,
                body,
            } => {
                if is_reserved(var) {
                    return Err(self.err(
                        line,
                        "TOL2032",
                        format!("'{var}' is a reserved name"),
                    ));
                }
                self.expr(cx, start)?;
                self.expr(cx, stop)?;
                cx.loop_depth += 1;
                cx.scopes.push(BTreeSet::from([var.clone()]));
                self.block(cx, body)?;
                cx.scopes.pop();
                cx.loop_depth -= 1;
                Ok(())
            }
            TStat::Break | TStat::Continue => {
                if cx.loop_depth == 0 {
                    return Err(self.err(
                        line,
                        "TOL2020",
                        "break/continue outside of a loop",
                    ));
                }
                Ok(())
            }
            TStat::Return(value) => {
                let non_void =
                    cx.decl.kind == FnKind::Normal && !cx.decl.returns.is_empty();
                match value {
                    Some(expr) => {
                        if !non_void {
                            return Err(self.err(
                                line,
                                "TOL2026",
                                format!("'{}' is void and cannot return a value", cx.decl.name),
                            ));
                        }
                        cx.has_value_return = true;
                        self.expr(cx, expr)
                    }
                    None => {
                        if non_void {
                            return Err(self.err(
                                line,
                                "TOL2026",
                                format!("'{}' must return a value", cx.decl.name),
                            ));
                        }
                        Ok(())
                    }
                }
            }
            TStat::Require { cond, .. } | TStat::Assert { cond, .. } => {
                if matches!(
                    cond.expr,
                    TExpr::Number(_) | TExpr::Str(_) | TExpr::Hex(_)
                ) {
                    return Err(self.err(
                        line,
                        "TOL2023",
                        "condition must be a boolean-producing expression",
                    ));
                }
                self.expr(cx, cond)
            }
            TStat::Revert(_) => Ok(()),
            TStat::EmitStat { name, args } => {
                let Some(event) = cx.contract.events.iter().find(|e| &e.name == name)
                else {
                    return Err(self.err(
                        line,
                        "TOL2025",
                        format!("emit targets undeclared event '{name}'"),
                    ));
                };
                if event.params.len() != args.len() {
                    return Err(self.err(
                        line,
                        "TOL2025",
                        format!(
                            "event '{name}' expects {} arguments, got {}",
                            event.params.len(),
                            args.len()
                        ),
                    ));
                }
                for arg in args {
                    self.expr(cx, arg)?;
                }
                Ok(())
            }
            TStat::Expr(expr) => {
                if !matches!(expr.expr, TExpr::Call(..)) {
                    return Err(self.err(
                        line,
                        "TOL2021",
                        "expression statement must be a call",
                    ));
                }
                self.expr(cx, expr)
            }
        }
    }

    fn set_target(&self, cx: &mut FnCx<'_>, target: &TExprNode) -> Result<(), CompileError> {
        let line = target.line;
        match &target.expr {
            TExpr::Ident(name) => {
                if let Some(slot) = cx.slot(name) {
                    match &slot.ty {
                        Type::Mapping(..) => Err(self.err(
                            line,
                            "TOL2031",
                            format!("mapping slot '{name}' needs its keys"),
                        )),
                        Type::Array(_) => Err(self.err(
                            line,
                            "TOL2031",
                            format!("array slot '{name}' needs an element index"),
                        )),
                        _ => Ok(()),
                    }
                } else if cx.is_local(name) {
                    Ok(())
                } else {
                    Err(self.err(
                        line,
                        "TOL2021",
                        format!("unknown assignment target '{name}'"),
                    ))
                }
            }
            TExpr::Member(_, field) if field == "selector" => Err(self.err(
                line,
                "TOL2021",
                "a selector expression is not assignable",
            )),
            TExpr::Member(base, field) => {
                if field == "length" {
                    if let TExpr::Ident(name) = &base.expr {
                        if cx
                            .slot(name)
                            .map(|s| matches!(s.ty, Type::Array(_)))
                            .unwrap_or(false)
                        {
                            return Err(self.err(
                                line,
                                "TOL2031",
                                format!("'{name}.length' is read-only"),
                            ));
                        }
                    }
                }
                Err(self.err(line, "TOL2035", "invalid member assignment target"))
            }
            TExpr::Index(..) => self.storage_access(cx, target, true).map(|_| ()),
            _ => Err(self.err(
                line,
                "TOL2021",
                "set target must be an identifier, member or index expression",
            )),
        }
    }

    /// Validate a storage access expression rooted at a slot; returns
    /// whether the expression touched storage at all.
    fn storage_access(
        &self,
        cx: &mut FnCx<'_>,
        node: &TExprNode,
        is_write: bool,
    ) -> Result<bool, CompileError> {
        // Peel index keys down to the root identifier.
        let mut keys = Vec::new();
        let mut base = node;
        while let TExpr::Index(inner, key) = &base.expr {
            keys.push(key.as_ref());
            base = inner;
        }
        let TExpr::Ident(name) = &base.expr else {
            return Ok(false);
        };
        let Some(slot) = cx.slot(name) else {
            // Indexing a non-slot value; nothing structural to enforce.
            for key in &keys {
                self.expr(cx, key)?;
            }
            return Ok(false);
        };
        keys.reverse();
        for key in &keys {
            self.expr(cx, key)?;
        }
        let line = node.line;
        match &slot.ty {
            Type::Mapping(..) => {
                let depth = slot.ty.mapping_depth();
                if keys.len() != depth {
                    return Err(self.err(
                        line,
                        "TOL2031",
                        format!(
                            "mapping slot '{name}' expects {depth} key(s), got {}",
                            keys.len()
                        ),
                    ));
                }
            }
            Type::Array(_) => {
                if is_write && keys.len() != 1 {
                    return Err(self.err(
                        line,
                        "TOL2031",
                        format!("array slot '{name}' takes exactly one index for write"),
                    ));
                }
                if !is_write && keys.len() > 1 {
                    return Err(self.err(
                        line,
                        "TOL2031",
                        format!("array slot '{name}' takes at most one index"),
                    ));
                }
            }
            _ => {
                if !keys.is_empty() {
                    return Err(self.err(
                        line,
                        "TOL2031",
                        format!("scalar slot '{name}' accepts no index"),
                    ));
                }
            }
        }
        Ok(true)
    }

    fn expr(&self, cx: &mut FnCx<'_>, node: &TExprNode) -> Result<(), CompileError> {
        let line = node.line;
        match &node.expr {
            TExpr::Number(_) | TExpr::Bool(_) | TExpr::Str(_) | TExpr::Hex(_) | TExpr::This => {
                Ok(())
            }
            TExpr::Ident(name) => {
                if let Some(slot) = cx.slot(name) {
                    if matches!(slot.ty, Type::Mapping(..)) {
                        return Err(self.err(
                            line,
                            "TOL2031",
                            format!("mapping slot '{name}' needs its keys"),
                        ));
                    }
                }
                Ok(())
            }
            TExpr::Index(..) => {
                self.storage_access(cx, node, false)?;
                Ok(())
            }
            TExpr::Member(base, field) => self.member(cx, base, field, line),
            TExpr::Call(callee, args) => {
                // selector("sig") builtin
                if let TExpr::Ident(name) = &callee.expr {
                    if name == "selector" {
                        let valid = args.len() == 1
                            && matches!(
                                &args[0].expr,
                                TExpr::Str(sig) if is_canonical_signature(sig)
                            );
                        if !valid {
                            return Err(self.err(
                                line,
                                "TOL2013",
                                "selector() takes one canonical signature string",
                            ));
                        }
                        return Ok(());
                    }
                }
                // slot.push(v)
                if let TExpr::Member(base, field) = &callee.expr {
                    if field == "push" {
                        if let TExpr::Ident(name) = &base.expr {
                            if let Some(slot) = cx.slot(name) {
                                if !matches!(slot.ty, Type::Array(_)) {
                                    return Err(self.err(
                                        line,
                                        "TOL2031",
                                        format!("'{name}' is not an array slot"),
                                    ));
                                }
                                if args.len() != 1 {
                                    return Err(self.err(
                                        line,
                                        "TOL2031",
                                        ".push takes exactly one argument",
                                    ));
                                }
                                return self.expr(cx, &args[0]);
                            }
                        }
                        return Err(self.err(
                            line,
                            "TOL2035",
                            ".push is only available on array slots",
                        ));
                    }
                }
                match &callee.expr {
                    TExpr::Ident(_) => {}
                    TExpr::Member(base, _) if matches!(base.expr, TExpr::This) => {}
                    _ => {
                        return Err(self.err(
                            line,
                            "TOL2035",
                            "call target must be a function name",
                        ))
                    }
                }
                for arg in args {
                    self.expr(cx, arg)?;
                }
                Ok(())
            }
            TExpr::Bin(_, lhs, rhs) => {
                self.expr(cx, lhs)?;
                self.expr(cx, rhs)
            }
            TExpr::Un(_, operand) => self.expr(cx, operand),
        }
    }

    fn member(
        &self,
        cx: &mut FnCx<'_>,
        base: &TExprNode,
        field: &str,
        line: u32,
    ) -> Result<(), CompileError> {
        if field == "selector" {
            // this.f.selector or Contract.f.selector
            let target = match &base.expr {
                TExpr::Member(root, fn_name) => match &root.expr {
                    TExpr::This => Some(fn_name),
                    TExpr::Ident(c) if c == &cx.contract.name => Some(fn_name),
                    _ => None,
                },
                _ => None,
            };
            let Some(fn_name) = target else {
                return Err(self.err(
                    line,
                    "TOL2035",
                    ".selector applies to this.f or Contract.f",
                ));
            };
            let Some(decl) = cx.contract.functions.iter().find(|f| &f.name == fn_name)
            else {
                return Err(self.err(
                    line,
                    "TOL2014",
                    format!(".selector targets unknown function '{fn_name}'"),
                ));
            };
            if !is_dispatchable(decl) {
                return Err(self.err(
                    line,
                    "TOL2014",
                    format!(
                        ".selector targets {} function '{fn_name}'",
                        visibility(decl)
                    ),
                ));
            }
            return Ok(());
        }
        if field == "length" {
            if let TExpr::Ident(name) = &base.expr {
                if let Some(slot) = cx.slot(name) {
                    if matches!(slot.ty, Type::Array(_)) {
                        return Ok(());
                    }
                    return Err(self.err(
                        line,
                        "TOL2031",
                        format!("'.length' applies to array slots, '{name}' is not one"),
                    ));
                }
            }
            return Err(self.err(line, "TOL2035", "'.length' applies to array slots"));
        }
        // this.f (inside a call or a selector chain checked above)
        if matches!(base.expr, TExpr::This) {
            if cx.contract.functions.iter().any(|f| f.name == field)
                || cx.contract.storage.iter().any(|s| s.name == field)
            {
                return Ok(());
            }
            return Err(self.err(
                line,
                "TOL2035",
                format!("'this.{field}' does not name a contract member"),
            ));
        }
        // Contract.f as the base of a `.selector` chain; anything else is
        // not a known member form.
        if let TExpr::Ident(c) = &base.expr {
            if c == &cx.contract.name
                && cx.contract.functions.iter().any(|f| f.name == field)
            {
                return Ok(());
            }
        }
        Err(self.err(line, "TOL2035", format!("invalid member access '.{field}'")))
    }
}

fn is_terminator(stat: &TStat) -> bool {
    match stat {
        TStat::Return(_) | TStat::Revert(_) | TStat::Break | TStat::Continue => true,
        TStat::If {
            then_block,
            else_block: Some(else_block),
            ..
        } => block_terminates(then_block) && block_terminates(else_block),
        _ => false,
    }
}

/// Whether every structured path through the block ends in a value return
/// or revert. Loops are treated conservatively.
fn block_terminates(stats: &[TStatNode]) -> bool {
    stats.iter().any(|node| match &node.stat {
        TStat::Return(_) | TStat::Revert(_) => true,
        TStat::If {
            then_block,
            else_block: Some(else_block),
            ..
        } => block_terminates(then_block) && block_terminates(else_block),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tol::lexer::lex;
    use crate::tol::parser::parse;

    fn check_src(src: &str) -> Result<(), CompileError> {
        let module = parse(lex(src, "@t").unwrap(), "@t").unwrap();
        check(&module, "@t")
    }

    fn code_of(src: &str) -> String {
        check_src(src).unwrap_err().code
    }

    fn wrap(body: &str) -> String {
        format!("tol 0.2\ncontract C {{\n{body}\n}}")
    }

    #[test]
    fn accepts_a_well_formed_contract() {
        check_src(&wrap(
            "storage { slot owner: address; slot balances: mapping(address => uint256); }\n\
             event Moved(amount: uint256);\n\
             fn move_(to: address, amount: uint256) -> (ok: bool) public {\n\
               require(balances[to] >= amount, \"NO\")\n\
               set balances[to] = balances[to] - amount\n\
               emit Moved(amount)\n\
               return true\n\
             }",
        ))
        .unwrap();
    }

    #[test]
    fn version_must_be_0_2() {
        assert_eq!(code_of("tol 0.3\ncontract C { }"), "TOL2001");
    }

    #[test]
    fn contract_must_exist() {
        assert_eq!(code_of("tol 0.2"), "TOL2002");
    }

    #[test]
    fn duplicate_slots_and_functions() {
        assert_eq!(
            code_of(&wrap(
                "storage { slot a: uint256; slot a: bool; }"
            )),
            "TOL2003"
        );
        assert_eq!(
            code_of(&wrap(
                "fn f() public { return }\nfn f() public { return }"
            )),
            "TOL2004"
        );
    }

    #[test]
    fn selector_override_shape_and_placement() {
        assert_eq!(
            code_of(&wrap("@selector(\"0xABCD1234\")\nfn f() public { return }")),
            "TOL2010"
        );
        assert_eq!(
            code_of(&wrap("@selector(\"0xabcd123\")\nfn f() public { return }")),
            "TOL2010"
        );
        assert_eq!(
            code_of(&wrap("@selector(\"0xabcd1234\")\nfn f() internal { return }")),
            "TOL2012"
        );
    }

    #[test]
    fn selector_collisions() {
        assert_eq!(
            code_of(&wrap(
                "@selector(\"0xabcd1234\")\nfn f() public { return }\n\
                 @selector(\"0xabcd1234\")\nfn g() public { return }"
            )),
            "TOL2011"
        );
    }

    #[test]
    fn selector_builtin_arguments() {
        assert_eq!(
            code_of(&wrap(
                "fn f() -> (s: string) public { return selector(\"oops\") }"
            )),
            "TOL2013"
        );
        check_src(&wrap(
            "fn f() -> (s: string) public { return selector(\"transfer(address,uint256)\") }",
        ))
        .unwrap();
    }

    #[test]
    fn selector_member_requires_dispatchable_target() {
        assert_eq!(
            code_of(&wrap(
                "fn f() -> (s: string) public { return this.g.selector }\n\
                 fn g() private { return }"
            )),
            "TOL2014"
        );
    }

    #[test]
    fn break_outside_loop() {
        assert_eq!(code_of(&wrap("fn f() public { break }")), "TOL2020");
        assert_eq!(code_of(&wrap("fn f() public { continue }")), "TOL2020");
    }

    #[test]
    fn set_target_shapes() {
        assert_eq!(
            code_of(&wrap("fn f() public { set 1 = 2 }")),
            "TOL2021"
        );
        assert_eq!(
            code_of(&wrap(
                "fn f() public { set this.g.selector = 1 }\nfn g() public { return }"
            )),
            "TOL2021"
        );
    }

    #[test]
    fn require_needs_boolean_condition() {
        assert_eq!(
            code_of(&wrap("fn f() public { require(1, \"NO\") }")),
            "TOL2023"
        );
    }

    #[test]
    fn emit_arity_and_declaration() {
        assert_eq!(
            code_of(&wrap("fn f() public { emit Nope(1) }")),
            "TOL2025"
        );
        assert_eq!(
            code_of(&wrap(
                "event E(a: uint256);\nfn f() public { emit E(1, 2) }"
            )),
            "TOL2025"
        );
    }

    #[test]
    fn return_value_discipline() {
        assert_eq!(
            code_of(&wrap("fn f() public { return 1 }")),
            "TOL2026"
        );
        assert_eq!(
            code_of(&wrap("fn f() -> (x: uint256) public { return }")),
            "TOL2026"
        );
        assert_eq!(
            code_of(&wrap("constructor() public { return 1 }")),
            "TOL2026"
        );
    }

    #[test]
    fn missing_return_paths() {
        assert_eq!(
            code_of(&wrap(
                "fn f(c: bool) -> (x: uint256) public { if c { return 1 } }"
            )),
            "TOL2027"
        );
        // a loop does not count as termination
        assert_eq!(
            code_of(&wrap(
                "fn f() -> (x: uint256) public { while true { return 1 } }"
            )),
            "TOL2027"
        );
        // a revert-terminated else branch still satisfies the path rule
        check_src(&wrap(
            "fn f(c: bool) -> (x: uint256) public {\
               if c { return 1 } else { revert \"NO\" } }",
        ))
        .unwrap();
    }

    #[test]
    fn revert_only_function_is_rejected() {
        assert_eq!(
            code_of(&wrap("fn f() -> (x: uint256) public { revert \"NO\" }")),
            "TOL2027"
        );
    }

    #[test]
    fn name_collisions() {
        assert_eq!(
            code_of(&wrap("fn f(a: uint256, a: bool) public { return }")),
            "TOL2028"
        );
        assert_eq!(
            code_of(&wrap(
                "fn f(a: uint256) -> (a: bool) public { return true }"
            )),
            "TOL2028"
        );
        assert_eq!(
            code_of(&wrap(
                "fn f() public { let x = 1\nlet x = 2 }"
            )),
            "TOL2029"
        );
    }

    #[test]
    fn unreachable_statements() {
        assert_eq!(
            code_of(&wrap("fn f() public { return\nlet x = 1 }")),
            "TOL2030"
        );
        assert_eq!(
            code_of(&wrap(
                "fn f() public { while true { break\nlet x = 1 } }"
            )),
            "TOL2030"
        );
    }

    #[test]
    fn storage_shape_rules() {
        let st = "storage { slot m: mapping(address => uint256); slot s: uint256; slot a: uint256[]; }\n";
        assert_eq!(
            code_of(&wrap(&format!("{st}fn f() public {{ set m = 1 }}"))),
            "TOL2031"
        );
        assert_eq!(
            code_of(&wrap(&format!("{st}fn f() public {{ set s[0] = 1 }}"))),
            "TOL2031"
        );
        assert_eq!(
            code_of(&wrap(&format!(
                "{st}fn f(k: address) -> (x: uint256) public {{ return m[k][k] }}"
            ))),
            "TOL2031"
        );
        assert_eq!(
            code_of(&wrap(&format!("{st}fn f() public {{ set a.length = 3 }}"))),
            "TOL2031"
        );
        assert_eq!(
            code_of(&wrap(&format!("{st}fn f() public {{ s.push(1) }}"))),
            "TOL2031"
        );
        check_src(&wrap(&format!(
            "{st}fn f(k: address) -> (x: uint256) public {{\
               a.push(s)\n set a[0] = a.length\n return m[k] }}"
        )))
        .unwrap();
    }

    #[test]
    fn reserved_names() {
        assert_eq!(
            code_of(&wrap("fn f() public { let this = 1 }")),
            "TOL2032"
        );
        assert_eq!(
            code_of(&wrap("fn f(__tol_x: uint256) public { return }")),
            "TOL2032"
        );
        assert_eq!(
            code_of(&wrap("storage { slot selector: uint256; }")),
            "TOL2032"
        );
    }

    #[test]
    fn modifier_conflicts() {
        assert_eq!(
            code_of(&wrap("fn f() public view payable { return }")),
            "TOL2033"
        );
        assert_eq!(
            code_of(&wrap("fn f() public external { return }")),
            "TOL2033"
        );
        assert_eq!(
            code_of(&wrap("fn f() shiny { return }")),
            "TOL2033"
        );
        assert_eq!(
            code_of(&wrap("constructor() view { }")),
            "TOL2034"
        );
    }

    #[test]
    fn mapping_is_storage_only() {
        assert_eq!(
            code_of(&wrap(
                "fn f(m: mapping(address => uint256)) public { return }"
            )),
            "TOL2036"
        );
    }
}
