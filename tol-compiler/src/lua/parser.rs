//! Recursive-descent parser for the Lua subset.

use crate::error::CompileError;
use crate::lua::ast::*;
use crate::lua::token::{Tok, Token};

/// Parse a token stream into a chunk-level block.
pub fn parse(tokens: Vec<Token>, chunk: &str) -> Result<Block, CompileError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        chunk: chunk.to_string(),
    };
    let block = parser.block()?;
    parser.expect(Tok::Eof)?;
    Ok(block)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    chunk: String,
}

impl Parser {
    fn current(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Tok {
        let tok = self.tokens[self.pos].tok.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn accept(&mut self, tok: Tok) -> bool {
        if *self.current() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<(), CompileError> {
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
            Tok::Name(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("name expected near {}", other.describe()))),
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::parse(&self.chunk, self.line(), "TOL1002", message)
    }

    fn block_follows(&self) -> bool {
        matches!(
            self.current(),
            Tok::End | Tok::Else | Tok::Elseif | Tok::Until | Tok::Eof
        )
    }

    fn block(&mut self) -> Result<Block, CompileError> {
        let mut stats = Vec::new();
        loop {
            if self.block_follows() {
                return Ok(Block { stats });
            }
            if *self.current() == Tok::Return {
                stats.push(self.return_stat()?);
                return Ok(Block { stats });
            }
            if let Some(stat) = self.statement()? {
                stats.push(stat);
            }
        }
    }

    fn return_stat(&mut self) -> Result<StatNode, CompileError> {
        let line = self.line();
        self.expect(Tok::Return)?;
        let exprs = if self.block_follows() || *self.current() == Tok::Semi {
            Vec::new()
        } else {
            self.expr_list()?
        };
        self.accept(Tok::Semi);
        Ok(StatNode::new(Stat::Return(exprs), line))
    }

    fn statement(&mut self) -> Result<Option<StatNode>, CompileError> {
        let line = self.line();
        let stat = match self.current() {
            Tok::Semi => {
                self.advance();
                return Ok(None);
            }
            Tok::If => self.if_stat()?,
            Tok::While => self.while_stat()?,
            Tok::Do => {
                self.advance();
                let body = self.block()?;
                self.expect(Tok::End)?;
                Stat::Do(body)
            }
            Tok::For => self.for_stat()?,
            Tok::Repeat => self.repeat_stat()?,
            Tok::Function => self.function_stat()?,
            Tok::Local => self.local_stat()?,
            Tok::Break => {
                self.advance();
                Stat::Break
            }
            Tok::Goto => {
                self.advance();
                Stat::Goto(self.expect_name()?)
            }
            Tok::DColon => {
                self.advance();
                let name = self.expect_name()?;
                self.expect(Tok::DColon)?;
                Stat::Label(name)
            }
            _ => self.expr_stat()?,
        };
        Ok(Some(StatNode::new(stat, line)))
    }

    fn if_stat(&mut self) -> Result<Stat, CompileError> {
        self.expect(Tok::If)?;
        let mut arms = Vec::new();
        let cond = self.expr()?;
        self.expect(Tok::Then)?;
        arms.push((cond, self.block()?));
        let mut else_block = None;
        loop {
            match self.current() {
                Tok::Elseif => {
                    self.advance();
                    let cond = self.expr()?;
                    self.expect(Tok::Then)?;
                    arms.push((cond, self.block()?));
                }
                Tok::Else => {
                    self.advance();
                    else_block = Some(self.block()?);
                    self.expect(Tok::End)?;
                    break;
                }
                _ => {
                    self.expect(Tok::End)?;
                    break;
                }
            }
        }
        Ok(Stat::If(arms, else_block))
    }

    fn while_stat(&mut self) -> Result<Stat, CompileError> {
        self.expect(Tok::While)?;
        let cond = self.expr()?;
        self.expect(Tok::Do)?;
        let body = self.block()?;
        self.expect(Tok::End)?;
        Ok(Stat::While(cond, body))
    }

    fn repeat_stat(&mut self) -> Result<Stat, CompileError> {
        self.expect(Tok::Repeat)?;
        let body = self.block()?;
        self.expect(Tok::Until)?;
        let cond = self.expr()?;
        Ok(Stat::Repeat(body, cond))
    }

    fn for_stat(&mut self) -> Result<Stat, CompileError> {
        self.expect(Tok::For)?;
        let first = self.expect_name()?;
        if self.accept(Tok::Assign) {
            let start = self.expr()?;
            self.expect(Tok::Comma)?;
            let stop = self.expr()?;
            let step = if self.accept(Tok::Comma) {
                Some(self.expr()?)
            } else {
                None
            };
            self.expect(Tok::Do)?;
            let body = self.block()?;
            self.expect(Tok::End)?;
            return Ok(Stat::NumericFor {
                var: first,
                start,
                stop,
                step,
                body,
            });
        }
        let mut vars = vec![first];
        while self.accept(Tok::Comma) {
            vars.push(self.expect_name()?);
        }
        self.expect(Tok::In)?;
        let exprs = self.expr_list()?;
        self.expect(Tok::Do)?;
        let body = self.block()?;
        self.expect(Tok::End)?;
        Ok(Stat::GenericFor { vars, exprs, body })
    }

    fn function_stat(&mut self) -> Result<Stat, CompileError> {
        let line = self.line();
        self.expect(Tok::Function)?;
        let mut name = self.expect_name()?;
        let mut target = ExprNode::new(Expr::Name(name.clone()), line);
        let mut is_method = false;
        while self.accept(Tok::Dot) {
            let field = self.expect_name()?;
            name = format!("{name}.{field}");
            target = ExprNode::new(
                Expr::Index(
                    Box::new(target),
                    Box::new(ExprNode::new(Expr::Str(field), line)),
                ),
                line,
            );
        }
        if self.accept(Tok::Colon) {
            let method = self.expect_name()?;
            name = format!("{name}:{method}");
            target = ExprNode::new(
                Expr::Index(
                    Box::new(target),
                    Box::new(ExprNode::new(Expr::Str(method), line)),
                ),
                line,
            );
            is_method = true;
        }
        let body = self.func_body(name, is_method)?;
        Ok(Stat::FunctionDecl {
            target,
            is_method,
            body,
        })
    }

    fn local_stat(&mut self) -> Result<Stat, CompileError> {
        self.expect(Tok::Local)?;
        if self.accept(Tok::Function) {
            let name = self.expect_name()?;
            let body = self.func_body(name.clone(), false)?;
            return Ok(Stat::LocalFunction { name, body });
        }
        let mut names = vec![self.local_name()?];
        while self.accept(Tok::Comma) {
            names.push(self.local_name()?);
        }
        let exprs = if self.accept(Tok::Assign) {
            self.expr_list()?
        } else {
            Vec::new()
        };
        Ok(Stat::Local(names, exprs))
    }

    fn local_name(&mut self) -> Result<(String, Option<Attrib>), CompileError> {
        let name = self.expect_name()?;
        let attrib = if self.accept(Tok::Lt) {
            let word = self.expect_name()?;
            let attrib = match word.as_str() {
                "const" => Attrib::Const,
                "close" => Attrib::Close,
                other => {
                    return Err(self.error(format!("unknown attribute '{other}'")))
                }
            };
            self.expect(Tok::Gt)?;
            Some(attrib)
        } else {
            None
        };
        Ok((name, attrib))
    }

    fn expr_stat(&mut self) -> Result<Stat, CompileError> {
        let first = self.suffixed_expr()?;
        if *self.current() == Tok::Assign || *self.current() == Tok::Comma {
            let mut targets = vec![first];
            while self.accept(Tok::Comma) {
                targets.push(self.suffixed_expr()?);
            }
            for target in &targets {
                if !matches!(target.expr, Expr::Name(_) | Expr::Index(..)) {
                    return Err(self.error("cannot assign to this expression"));
                }
            }
            self.expect(Tok::Assign)?;
            let values = self.expr_list()?;
            return Ok(Stat::Assign(targets, values));
        }
        if !matches!(first.expr, Expr::Call(..) | Expr::Method(..)) {
            return Err(self.error("syntax error near unexpected expression"));
        }
        Ok(Stat::Call(first))
    }

    fn expr_list(&mut self) -> Result<Vec<ExprNode>, CompileError> {
        let mut exprs = vec![self.expr()?];
        while self.accept(Tok::Comma) {
            exprs.push(self.expr()?);
        }
        Ok(exprs)
    }

    fn expr(&mut self) -> Result<ExprNode, CompileError> {
        self.sub_expr(0)
    }

    /// Precedence climbing; returns when an operator binds no tighter than
    /// `limit`.
    fn sub_expr(&mut self, limit: u8) -> Result<ExprNode, CompileError> {
        let line = self.line();
        let mut left = if let Some(op) = unary_op(self.current()) {
            self.advance();
            let operand = self.sub_expr(UNARY_PRIORITY)?;
            ExprNode::new(Expr::UnOp(op, Box::new(operand)), line)
        } else {
            self.simple_expr()?
        };
        while let Some((op, left_pri, right_pri)) = binary_op(self.current()) {
            if left_pri <= limit {
                break;
            }
            let op_line = self.line();
            self.advance();
            let right = self.sub_expr(right_pri)?;
            left = ExprNode::new(
                Expr::BinOp(op, Box::new(left), Box::new(right)),
                op_line,
            );
        }
        Ok(left)
    }

    fn simple_expr(&mut self) -> Result<ExprNode, CompileError> {
        let line = self.line();
        let expr = match self.current().clone() {
            Tok::Nil => {
                self.advance();
                Expr::Nil
            }
            Tok::True => {
                self.advance();
                Expr::True
            }
            Tok::False => {
                self.advance();
                Expr::False
            }
            Tok::Ellipsis => {
                self.advance();
                Expr::Vararg
            }
            Tok::Number(n) => {
                self.advance();
                Expr::Number(n)
            }
            Tok::Str(s) => {
                self.advance();
                Expr::Str(s)
            }
            Tok::Function => {
                self.advance();
                let body = self.func_body_anonymous()?;
                Expr::Function(body)
            }
            Tok::LBrace => return self.table_constructor(),
            _ => return self.suffixed_expr(),
        };
        Ok(ExprNode::new(expr, line))
    }

    fn func_body_anonymous(&mut self) -> Result<FuncBody, CompileError> {
        self.func_body_inner(String::new(), false)
    }

    fn func_body(&mut self, name: String, is_method: bool) -> Result<FuncBody, CompileError> {
        self.func_body_inner(name, is_method)
    }

    fn func_body_inner(
        &mut self,
        name: String,
        is_method: bool,
    ) -> Result<FuncBody, CompileError> {
        let line = self.line();
        self.expect(Tok::LParen)?;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        if *self.current() != Tok::RParen {
            loop {
                match self.current().clone() {
                    Tok::Ellipsis => {
                        self.advance();
                        is_vararg = true;
                        break;
                    }
                    Tok::Name(param) => {
                        self.advance();
                        params.push(param);
                    }
                    other => {
                        return Err(self.error(format!(
                            "parameter expected near {}",
                            other.describe()
                        )))
                    }
                }
                if !self.accept(Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen)?;
        let block = self.block()?;
        let end_line = self.line();
        self.expect(Tok::End)?;
        Ok(FuncBody {
            params,
            is_vararg,
            block,
            line,
            end_line,
            name,
        })
    }

    fn table_constructor(&mut self) -> Result<ExprNode, CompileError> {
        let line = self.line();
        self.expect(Tok::LBrace)?;
        let mut fields = Vec::new();
        while *self.current() != Tok::RBrace {
            match self.current().clone() {
                Tok::LBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(Tok::RBracket)?;
                    self.expect(Tok::Assign)?;
                    fields.push(TableField::Pair(key, self.expr()?));
                }
                Tok::Name(name)
                    if self.tokens[self.pos + 1].tok == Tok::Assign =>
                {
                    let key_line = self.line();
                    self.advance();
                    self.advance();
                    fields.push(TableField::Pair(
                        ExprNode::new(Expr::Str(name), key_line),
                        self.expr()?,
                    ));
                }
                _ => fields.push(TableField::Item(self.expr()?)),
            }
            if !self.accept(Tok::Comma) && !self.accept(Tok::Semi) {
                break;
            }
        }
        self.expect(Tok::RBrace)?;
        Ok(ExprNode::new(Expr::Table(fields), line))
    }

    fn primary_expr(&mut self) -> Result<ExprNode, CompileError> {
        let line = self.line();
        match self.current().clone() {
            Tok::Name(name) => {
                self.advance();
                Ok(ExprNode::new(Expr::Name(name), line))
            }
            Tok::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(Tok::RParen)?;
                // Parenthesization truncates multi-values; the codegen
                // treats any non-call wrapper as single-valued already, so
                // wrapping calls is the only case that matters.
                Ok(inner)
            }
            other => Err(self.error(format!(
                "unexpected symbol near {}",
                other.describe()
            ))),
        }
    }

    fn suffixed_expr(&mut self) -> Result<ExprNode, CompileError> {
        let mut expr = self.primary_expr()?;
        loop {
            let line = self.line();
            match self.current().clone() {
                Tok::Dot => {
                    self.advance();
                    let field = self.expect_name()?;
                    expr = ExprNode::new(
                        Expr::Index(
                            Box::new(expr),
                            Box::new(ExprNode::new(Expr::Str(field), line)),
                        ),
                        line,
                    );
                }
                Tok::LBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(Tok::RBracket)?;
                    expr = ExprNode::new(
                        Expr::Index(Box::new(expr), Box::new(key)),
                        line,
                    );
                }
                Tok::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    let args = self.call_args()?;
                    expr = ExprNode::new(
                        Expr::Method(Box::new(expr), method, args),
                        line,
                    );
                }
                Tok::LParen | Tok::Str(_) | Tok::LBrace => {
                    let args = self.call_args()?;
                    expr = ExprNode::new(Expr::Call(Box::new(expr), args), line);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<ExprNode>, CompileError> {
        match self.current().clone() {
            Tok::LParen => {
                self.advance();
                let args = if *self.current() == Tok::RParen {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                self.expect(Tok::RParen)?;
                Ok(args)
            }
            Tok::Str(s) => {
                let line = self.line();
                self.advance();
                Ok(vec![ExprNode::new(Expr::Str(s), line)])
            }
            Tok::LBrace => Ok(vec![self.table_constructor()?]),
            other => Err(self.error(format!(
                "function arguments expected near {}",
                other.describe()
            ))),
        }
    }
}

const UNARY_PRIORITY: u8 = 12;

fn unary_op(tok: &Tok) -> Option<UnOp> {
    Some(match tok {
        Tok::Minus => UnOp::Unm,
        Tok::Not => UnOp::Not,
        Tok::Hash => UnOp::Len,
        Tok::Tilde => UnOp::BNot,
        _ => return None,
    })
}

fn binary_op(tok: &Tok) -> Option<(BinOp, u8, u8)> {
    Some(match tok {
        Tok::Or => (BinOp::Or, 1, 1),
        Tok::And => (BinOp::And, 2, 2),
        Tok::Lt => (BinOp::Lt, 3, 3),
        Tok::Gt => (BinOp::Gt, 3, 3),
        Tok::Le => (BinOp::Le, 3, 3),
        Tok::Ge => (BinOp::Ge, 3, 3),
        Tok::Ne => (BinOp::Ne, 3, 3),
        Tok::EqEq => (BinOp::Eq, 3, 3),
        Tok::Pipe => (BinOp::BOr, 4, 4),
        Tok::Tilde => (BinOp::BXor, 5, 5),
        Tok::Amp => (BinOp::BAnd, 6, 6),
        Tok::Shl => (BinOp::Shl, 7, 7),
        Tok::Shr => (BinOp::Shr, 7, 7),
        Tok::Concat => (BinOp::Concat, 9, 8),
        Tok::Plus => (BinOp::Add, 10, 10),
        Tok::Minus => (BinOp::Sub, 10, 10),
        Tok::Star => (BinOp::Mul, 11, 11),
        Tok::Slash => (BinOp::Div, 11, 11),
        Tok::DSlash => (BinOp::IDiv, 11, 11),
        Tok::Percent => (BinOp::Mod, 11, 11),
        Tok::Caret => (BinOp::Pow, 14, 13),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::lexer::lex;

    fn parse_src(src: &str) -> Block {
        parse(lex(src, "@t").unwrap(), "@t").unwrap()
    }

    #[test]
    fn parses_precedence() {
        let block = parse_src("x = 1 + 2 * 3");
        let Stat::Assign(_, values) = &block.stats[0].stat else {
            panic!("assignment expected");
        };
        let Expr::BinOp(BinOp::Add, _, rhs) = &values[0].expr else {
            panic!("add at the root expected");
        };
        assert!(matches!(rhs.expr, Expr::BinOp(BinOp::Mul, ..)));
    }

    #[test]
    fn pow_is_right_associative() {
        let block = parse_src("x = 2 ^ 3 ^ 2");
        let Stat::Assign(_, values) = &block.stats[0].stat else {
            panic!("assignment expected");
        };
        let Expr::BinOp(BinOp::Pow, _, rhs) = &values[0].expr else {
            panic!("pow at the root expected");
        };
        assert!(matches!(rhs.expr, Expr::BinOp(BinOp::Pow, ..)));
    }

    #[test]
    fn parses_statements() {
        let block = parse_src(
            "local a <const> = 1\n\
             while a < 10 do a = a + 1 end\n\
             for i = 1, 3 do end\n\
             for k, v in pairs(t) do end\n\
             if a then return 1 elseif b then return 2 else return 3 end",
        );
        assert_eq!(block.stats.len(), 5);
        assert!(matches!(block.stats[0].stat, Stat::Local(..)));
        assert!(matches!(block.stats[1].stat, Stat::While(..)));
        assert!(matches!(block.stats[2].stat, Stat::NumericFor { .. }));
        assert!(matches!(block.stats[3].stat, Stat::GenericFor { .. }));
        assert!(matches!(block.stats[4].stat, Stat::If(..)));
    }

    #[test]
    fn parses_functions_and_calls() {
        let block = parse_src(
            "local function f(a, b, ...) return a end\n\
             function t.g(x) end\n\
             function t:m(x) end\n\
             f(1)(2)\n\
             obj:m(3)",
        );
        assert!(matches!(block.stats[0].stat, Stat::LocalFunction { .. }));
        let Stat::FunctionDecl { is_method, body, .. } = &block.stats[2].stat else {
            panic!("method declaration expected");
        };
        assert!(is_method);
        assert_eq!(body.params[0], "self");
        assert!(matches!(block.stats[3].stat, Stat::Call(..)));
        assert!(matches!(block.stats[4].stat, Stat::Call(..)));
    }

    #[test]
    fn rejects_non_call_expression_statement() {
        assert!(parse(lex("x + 1", "@t").unwrap(), "@t").is_err());
    }

    #[test]
    fn parses_goto_and_labels() {
        let block = parse_src("::top:: goto top");
        assert!(matches!(block.stats[0].stat, Stat::Label(..)));
        assert!(matches!(block.stats[1].stat, Stat::Goto(..)));
    }

    #[test]
    fn table_constructor_forms() {
        let block = parse_src("t = { 1, x = 2, [3] = 4; 5 }");
        let Stat::Assign(_, values) = &block.stats[0].stat else {
            panic!("assignment expected");
        };
        let Expr::Table(fields) = &values[0].expr else {
            panic!("table expected");
        };
        assert_eq!(fields.len(), 4);
    }
}
