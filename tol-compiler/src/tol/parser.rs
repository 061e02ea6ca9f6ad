//! Recursive-descent parser for TOL modules.

use crate::error::CompileError;
use crate::tol::ast::*;
use crate::tol::token::{TTok, TToken};

/// Parse a token stream into a module.
pub fn parse(tokens: Vec<TToken>, chunk: &str) -> Result<Module, CompileError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        chunk: chunk.to_string(),
    };
    let module = parser.module()?;
    parser.expect(TTok::Eof)?;
    Ok(module)
}

struct Parser {
    tokens: Vec<TToken>,
    pos: usize,
    chunk: String,
}

impl Parser {
    fn current(&self) -> &TTok {
        &self.tokens[self.pos].tok
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> TTok {
        let tok = self.tokens[self.pos].tok.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn accept(&mut self, tok: TTok) -> bool {
        if *self.current() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: TTok) -> Result<(), CompileError> {
        if *self.current() == tok {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!(
                "{} expected near {}",
                tok.describe(),
                self.current().describe()
            )))
        }
    }

    fn expect_name(&mut self) -> Result<String, CompileError> {
        match self.current().clone() {
            TTok::Name(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("name expected near {}", other.describe()))),
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::parse(&self.chunk, self.line(), "TOL1102", message)
    }

    // ---- module structure ------------------------------------------------

    fn module(&mut self) -> Result<Module, CompileError> {
        let version_line = self.line();
        self.expect(TTok::Tol)?;
        let version = match self.current().clone() {
            TTok::Version(v) => {
                self.advance();
                v
            }
            TTok::Number(n) => {
                self.advance();
                n.to_string()
            }
            other => {
                return Err(self.error(format!(
                    "version literal expected near {}",
                    other.describe()
                )))
            }
        };
        let contract = if *self.current() == TTok::Contract {
            Some(self.contract()?)
        } else {
            None
        };
        Ok(Module {
            version,
            version_line,
            contract,
        })
    }

    fn contract(&mut self) -> Result<Contract, CompileError> {
        let line = self.line();
        self.expect(TTok::Contract)?;
        let name = self.expect_name()?;
        self.expect(TTok::LBrace)?;
        let mut contract = Contract {
            name,
            line,
            storage: Vec::new(),
            events: Vec::new(),
            functions: Vec::new(),
            constructor: None,
            fallback: None,
        };
        while *self.current() != TTok::RBrace {
            match self.current() {
                TTok::Storage => self.storage_block(&mut contract)?,
                TTok::Event => contract.events.push(self.event_decl()?),
                TTok::At | TTok::Fn => {
                    let f = self.fn_decl()?;
                    contract.functions.push(f);
                }
                TTok::Constructor => {
                    let c = self.special_decl(FnKind::Constructor)?;
                    if contract.constructor.is_some() {
                        return Err(self.error("duplicate constructor"));
                    }
                    contract.constructor = Some(c);
                }
                TTok::Fallback => {
                    let f = self.special_decl(FnKind::Fallback)?;
                    if contract.fallback.is_some() {
                        return Err(self.error("duplicate fallback"));
                    }
                    contract.fallback = Some(f);
                }
                other => {
                    return Err(self.error(format!(
                        "contract member expected near {}",
                        other.describe()
                    )))
                }
            }
        }
        self.expect(TTok::RBrace)?;
        Ok(contract)
    }

    fn storage_block(&mut self, contract: &mut Contract) -> Result<(), CompileError> {
        self.expect(TTok::Storage)?;
        self.expect(TTok::LBrace)?;
        while *self.current() != TTok::RBrace {
            let line = self.line();
            self.expect(TTok::Slot)?;
            let name = self.expect_name()?;
            self.expect(TTok::Colon)?;
            let ty = self.type_expr()?;
            self.expect(TTok::Semi)?;
            contract.storage.push(SlotDecl { name, ty, line });
        }
        self.expect(TTok::RBrace)?;
        Ok(())
    }

    fn type_expr(&mut self) -> Result<Type, CompileError> {
        let mut ty = match self.current().clone() {
            TTok::Mapping => {
                self.advance();
                self.expect(TTok::LParen)?;
                let key = self.type_expr()?;
                self.expect(TTok::FatArrow)?;
                let value = self.type_expr()?;
                self.expect(TTok::RParen)?;
                Type::Mapping(Box::new(key), Box::new(value))
            }
            TTok::Name(name) => {
                self.advance();
                match name.as_str() {
                    "uint256" => Type::Uint256,
                    "bool" => Type::Bool,
                    "address" => Type::Address,
                    "string" => Type::Str,
                    other => {
                        return Err(self.error(format!("unknown type '{other}'")))
                    }
                }
            }
            other => {
                return Err(self.error(format!("type expected near {}", other.describe())))
            }
        };
        while *self.current() == TTok::LBracket {
            self.advance();
            self.expect(TTok::RBracket)?;
            ty = Type::Array(Box::new(ty));
        }
        Ok(ty)
    }

    fn event_decl(&mut self) -> Result<EventDecl, CompileError> {
        let line = self.line();
        self.expect(TTok::Event)?;
        let name = self.expect_name()?;
        self.expect(TTok::LParen)?;
        let params = self.param_list(true)?;
        self.expect(TTok::RParen)?;
        self.expect(TTok::Semi)?;
        Ok(EventDecl { name, params, line })
    }

    fn param_list(&mut self, allow_indexed: bool) -> Result<Vec<Param>, CompileError> {
        let mut params = Vec::new();
        if *self.current() == TTok::RParen {
            return Ok(params);
        }
        loop {
            let line = self.line();
            let name = self.expect_name()?;
            self.expect(TTok::Colon)?;
            let ty = self.type_expr()?;
            let indexed = allow_indexed
                && matches!(self.current(), TTok::Name(w) if w == "indexed");
            if indexed {
                self.advance();
            }
            params.push(Param {
                name,
                ty,
                indexed,
                line,
            });
            if !self.accept(TTok::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn fn_decl(&mut self) -> Result<FnDecl, CompileError> {
        let selector_override = if *self.current() == TTok::At {
            let line = self.line();
            self.advance();
            let word = self.expect_name()?;
            if word != "selector" {
                return Err(self.error(format!("unknown annotation '@{word}'")));
            }
            self.expect(TTok::LParen)?;
            let value = match self.current().clone() {
                TTok::Str(s) => {
                    self.advance();
                    s
                }
                other => {
                    return Err(self.error(format!(
                        "string literal expected near {}",
                        other.describe()
                    )))
                }
            };
            self.expect(TTok::RParen)?;
            Some((value, line))
        } else {
            None
        };
        let line = self.line();
        self.expect(TTok::Fn)?;
        let name = self.expect_name()?;
        self.expect(TTok::LParen)?;
        let params = self.param_list(false)?;
        self.expect(TTok::RParen)?;
        let returns = if self.accept(TTok::Arrow) {
            self.expect(TTok::LParen)?;
            let rets = self.param_list(false)?;
            self.expect(TTok::RParen)?;
            rets
        } else {
            Vec::new()
        };
        let modifiers = self.modifier_list()?;
        let body = self.braced_block()?;
        Ok(FnDecl {
            name,
            kind: FnKind::Normal,
            params,
            returns,
            modifiers,
            selector_override,
            body,
            line,
        })
    }

    fn special_decl(&mut self, kind: FnKind) -> Result<FnDecl, CompileError> {
        let line = self.line();
        let name = match kind {
            FnKind::Constructor => {
                self.expect(TTok::Constructor)?;
                "constructor"
            }
            FnKind::Fallback => {
                self.expect(TTok::Fallback)?;
                "fallback"
            }
            FnKind::Normal => unreachable!("special_decl on a plain fn"),
        };
        self.expect(TTok::LParen)?;
        let params = self.param_list(false)?;
        self.expect(TTok::RParen)?;
        let modifiers = self.modifier_list()?;
        let body = self.braced_block()?;
        Ok(FnDecl {
            name: name.into(),
            kind,
            params,
            returns: Vec::new(),
            modifiers,
            selector_override: None,
            body,
            line,
        })
    }

    fn modifier_list(&mut self) -> Result<Vec<(String, u32)>, CompileError> {
        let mut modifiers = Vec::new();
        while let TTok::Name(word) = self.current().clone() {
            let line = self.line();
            self.advance();
            modifiers.push((word, line));
        }
        Ok(modifiers)
    }

    // ---- statements ------------------------------------------------------

    fn braced_block(&mut self) -> Result<Vec<TStatNode>, CompileError> {
        self.expect(TTok::LBrace)?;
        let mut stats = Vec::new();
        while *self.current() != TTok::RBrace {
            stats.push(self.statement()?);
        }
        self.expect(TTok::RBrace)?;
        Ok(stats)
    }

    fn statement(&mut self) -> Result<TStatNode, CompileError> {
        let line = self.line();
        let stat = match self.current().clone() {
            TTok::Let => {
                self.advance();
                let name = self.expect_name()?;
                let ty = if self.accept(TTok::Colon) {
                    Some(self.type_expr()?)
                } else {
                    None
                };
                self.expect(TTok::Assign)?;
                let value = self.expr()?;
                TStat::Let { name, ty, value }
            }
            TTok::Set => {
                self.advance();
                let target = self.expr()?;
                self.expect(TTok::Assign)?;
                let value = self.expr()?;
                TStat::SetStat { target, value }
            }
            TTok::If => return self.if_stat(),
            TTok::While => {
                self.advance();
                let cond = self.expr()?;
                let body = self.braced_block()?;
                TStat::While { cond, body }
            }
            TTok::For => {
                self.advance();
                let var = self.expect_name()?;
                self.expect(TTok::In)?;
                let start = self.expr()?;
                self.expect(TTok::DotDot)?;
                let stop = self.expr()?;
                let body = self.braced_block()?;
                TStat::For {
                    var,
                    start,
                    stop,
                    body,
                }
            }
            TTok::Break => {
                self.advance();
                TStat::Break
            }
            TTok::Continue => {
                self.advance();
                TStat::Continue
            }
            TTok::Return => {
                self.advance();
                let value = if matches!(
                    self.current(),
                    TTok::Semi | TTok::RBrace
                ) {
                    None
                } else {
                    Some(self.expr()?)
                };
                TStat::Return(value)
            }
            TTok::Require => {
                self.advance();
                let (cond, message) = self.cond_with_message()?;
                TStat::Require { cond, message }
            }
            TTok::Assert => {
                self.advance();
                let (cond, message) = self.cond_with_message()?;
                TStat::Assert { cond, message }
            }
            TTok::Revert => {
                self.advance();
                let message = match self.current().clone() {
                    TTok::Str(s) => {
                        self.advance();
                        Some(s)
                    }
                    _ => None,
                };
                TStat::Revert(message)
            }
            TTok::Emit => {
                self.advance();
                let name = self.expect_name()?;
                self.expect(TTok::LParen)?;
                let args = self.expr_list()?;
                self.expect(TTok::RParen)?;
                TStat::EmitStat { name, args }
            }
            _ => TStat::Expr(self.expr()?),
        };
        self.accept(TTok::Semi);
        Ok(TStatNode { stat, line })
    }

    fn cond_with_message(
        &mut self,
    ) -> Result<(TExprNode, Option<String>), CompileError> {
        self.expect(TTok::LParen)?;
        let cond = self.expr()?;
        let message = if self.accept(TTok::Comma) {
            match self.current().clone() {
                TTok::Str(s) => {
                    self.advance();
                    Some(s)
                }
                other => {
                    return Err(self.error(format!(
                        "string literal expected near {}",
                        other.describe()
                    )))
                }
            }
        } else {
            None
        };
        self.expect(TTok::RParen)?;
        Ok((cond, message))
    }

    fn if_stat(&mut self) -> Result<TStatNode, CompileError> {
        let line = self.line();
        self.expect(TTok::If)?;
        let cond = self.expr()?;
        let then_block = self.braced_block()?;
        let else_block = if self.accept(TTok::Else) {
            if *self.current() == TTok::If {
                Some(vec![self.if_stat()?])
            } else {
                Some(self.braced_block()?)
            }
        } else {
            None
        };
        Ok(TStatNode {
            stat: TStat::If {
                cond,
                then_block,
                else_block,
            },
            line,
        })
    }

    // ---- expressions -----------------------------------------------------

    fn expr_list(&mut self) -> Result<Vec<TExprNode>, CompileError> {
        let mut exprs = Vec::new();
        if matches!(self.current(), TTok::RParen) {
            return Ok(exprs);
        }
        loop {
            exprs.push(self.expr()?);
            if !self.accept(TTok::Comma) {
                break;
            }
        }
        Ok(exprs)
    }

    fn expr(&mut self) -> Result<TExprNode, CompileError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<TExprNode, CompileError> {
        let mut left = self.and_expr()?;
        while *self.current() == TTok::OrOr {
            let line = self.line();
            self.advance();
            let right = self.and_expr()?;
            left = TExprNode::new(
                TExpr::Bin(TBinOp::Or, Box::new(left), Box::new(right)),
                line,
            );
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<TExprNode, CompileError> {
        let mut left = self.equality_expr()?;
        while *self.current() == TTok::AndAnd {
            let line = self.line();
            self.advance();
            let right = self.equality_expr()?;
            left = TExprNode::new(
                TExpr::Bin(TBinOp::And, Box::new(left), Box::new(right)),
                line,
            );
        }
        Ok(left)
    }

    fn equality_expr(&mut self) -> Result<TExprNode, CompileError> {
        let mut left = self.relational_expr()?;
        loop {
            let op = match self.current() {
                TTok::EqEq => TBinOp::Eq,
                TTok::Ne => TBinOp::Ne,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.relational_expr()?;
            left = TExprNode::new(TExpr::Bin(op, Box::new(left), Box::new(right)), line);
        }
    }

    fn relational_expr(&mut self) -> Result<TExprNode, CompileError> {
        let mut left = self.additive_expr()?;
        loop {
            let op = match self.current() {
                TTok::Lt => TBinOp::Lt,
                TTok::Le => TBinOp::Le,
                TTok::Gt => TBinOp::Gt,
                TTok::Ge => TBinOp::Ge,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.additive_expr()?;
            left = TExprNode::new(TExpr::Bin(op, Box::new(left), Box::new(right)), line);
        }
    }

    fn additive_expr(&mut self) -> Result<TExprNode, CompileError> {
        let mut left = self.multiplicative_expr()?;
        loop {
            let op = match self.current() {
                TTok::Plus => TBinOp::Add,
                TTok::Minus => TBinOp::Sub,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.multiplicative_expr()?;
            left = TExprNode::new(TExpr::Bin(op, Box::new(left), Box::new(right)), line);
        }
    }

    fn multiplicative_expr(&mut self) -> Result<TExprNode, CompileError> {
        let mut left = self.unary_expr()?;
        loop {
            let op = match self.current() {
                TTok::Star => TBinOp::Mul,
                TTok::Slash => TBinOp::Div,
                TTok::Percent => TBinOp::Mod,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.unary_expr()?;
            left = TExprNode::new(TExpr::Bin(op, Box::new(left), Box::new(right)), line);
        }
    }

    fn unary_expr(&mut self) -> Result<TExprNode, CompileError> {
        let line = self.line();
        match self.current() {
            TTok::Bang => {
                self.advance();
                let operand = self.unary_expr()?;
                Ok(TExprNode::new(TExpr::Un(TUnOp::Not, Box::new(operand)), line))
            }
            TTok::Minus => {
                self.advance();
                let operand = self.unary_expr()?;
                Ok(TExprNode::new(TExpr::Un(TUnOp::Neg, Box::new(operand)), line))
            }
            _ => self.postfix_expr(),
        }
    }

    fn postfix_expr(&mut self) -> Result<TExprNode, CompileError> {
        let mut expr = self.primary_expr()?;
        loop {
            let line = self.line();
            match self.current().clone() {
                TTok::Dot => {
                    self.advance();
                    let field = match self.current().clone() {
                        TTok::Name(n) => {
                            self.advance();
                            n
                        }
                        // `selector` is a keyword-free name in this
                        // position; `length`/`push` arrive as plain names.
                        other => {
                            return Err(self.error(format!(
                                "member name expected near {}",
                                other.describe()
                            )))
                        }
                    };
                    expr = TExprNode::new(TExpr::Member(Box::new(expr), field), line);
                }
                TTok::LBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(TTok::RBracket)?;
                    expr = TExprNode::new(
                        TExpr::Index(Box::new(expr), Box::new(key)),
                        line,
                    );
                }
                TTok::LParen => {
                    self.advance();
                    let args = self.expr_list()?;
                    self.expect(TTok::RParen)?;
                    expr = TExprNode::new(TExpr::Call(Box::new(expr), args), line);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary_expr(&mut self) -> Result<TExprNode, CompileError> {
        let line = self.line();
        let expr = match self.current().clone() {
            TTok::Number(n) => {
                self.advance();
                TExpr::Number(n)
            }
            TTok::Str(s) => {
                self.advance();
                TExpr::Str(s)
            }
            TTok::Hex(h) => {
                self.advance();
                TExpr::Hex(h)
            }
            TTok::True => {
                self.advance();
                TExpr::Bool(true)
            }
            TTok::False => {
                self.advance();
                TExpr::Bool(false)
            }
            TTok::This => {
                self.advance();
                TExpr::This
            }
            TTok::Name(name) => {
                self.advance();
                TExpr::Ident(name)
            }
            TTok::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(TTok::RParen)?;
                return Ok(inner);
            }
            other => {
                return Err(self.error(format!(
                    "expression expected near {}",
                    other.describe()
                )))
            }
        };
        Ok(TExprNode::new(expr, line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tol::lexer::lex;

    fn parse_src(src: &str) -> Module {
        parse(lex(src, "@t").unwrap(), "@t").unwrap()
    }

    const TOKEN: &str = r#"
tol 0.2

contract Token {
    storage {
        slot balances: mapping(address => uint256);
        slot owner: address;
        slot holders: address[];
    }

    event Transfer(from: address indexed, to: address indexed, amount: uint256);

    constructor(owner_: address, supply: uint256) public {
        set owner = owner_
        set balances[owner_] = supply
    }

    fn transfer(to: address, amount: uint256) -> (ok: bool) public {
        require(balances[sender()] >= amount, "INSUFFICIENT_BALANCE")
        set balances[to] = balances[to] + amount
        emit Transfer(owner, to, amount)
        return true
    }

    fallback() {
        revert "NO_FALLBACK"
    }
}
"#;

    #[test]
    fn parses_a_full_contract() {
        let module = parse_src(TOKEN);
        assert_eq!(module.version, "0.2");
        let c = module.contract.unwrap();
        assert_eq!(c.name, "Token");
        assert_eq!(c.storage.len(), 3);
        assert_eq!(c.events.len(), 1);
        assert_eq!(c.functions.len(), 1);
        assert!(c.constructor.is_some());
        assert!(c.fallback.is_some());
        assert_eq!(
            c.storage[0].ty,
            Type::Mapping(Box::new(Type::Address), Box::new(Type::Uint256))
        );
        assert_eq!(c.storage[2].ty, Type::Array(Box::new(Type::Address)));
    }

    #[test]
    fn parses_selector_annotation() {
        let module = parse_src(
            "tol 0.2\ncontract C {\n@selector(\"0xdeadbeef\")\nfn f() public { return }\n}",
        );
        let c = module.contract.unwrap();
        assert_eq!(
            c.functions[0].selector_override,
            Some(("0xdeadbeef".into(), 3))
        );
    }

    #[test]
    fn parses_control_flow() {
        let module = parse_src(
            "tol 0.2\ncontract C {\nfn f(n: uint256) -> (s: uint256) public {\n\
             let s = 0\n\
             for i in 0 .. n {\n  if i % 2 == 0 { continue }\n  set s = s + i\n}\n\
             while s > 100 { set s = s - 1; break }\n\
             return s\n}\n}",
        );
        let c = module.contract.unwrap();
        let body = &c.functions[0].body;
        assert!(matches!(body[0].stat, TStat::Let { .. }));
        assert!(matches!(body[1].stat, TStat::For { .. }));
        assert!(matches!(body[2].stat, TStat::While { .. }));
        assert!(matches!(body[3].stat, TStat::Return(Some(_))));
    }

    #[test]
    fn parses_member_and_selector_expressions() {
        let module = parse_src(
            "tol 0.2\ncontract C {\nfn f() -> (s: string) public {\n\
             return this.g.selector\n}\nfn g() public { return }\n}",
        );
        let c = module.contract.unwrap();
        let TStat::Return(Some(e)) = &c.functions[0].body[0].stat else {
            panic!("return expected");
        };
        assert!(matches!(e.expr, TExpr::Member(..)));
    }

    #[test]
    fn rejects_misplaced_tokens() {
        assert!(parse(lex("contract C {}", "@t").unwrap(), "@t").is_err());
        assert!(parse(lex("tol 0.2 contract C { junk }", "@t").unwrap(), "@t").is_err());
    }
}
