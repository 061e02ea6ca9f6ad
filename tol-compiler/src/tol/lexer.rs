//! Lexer for the TOL surface.
//!
//! Numbers are decimal integers; `0x` literals are address-shaped hex and
//! stay textual until the lowering normalizes them. The one place a dot
//! may follow digits is the module-header version literal, which lexes as
//! its own token kind and is rejected semantically anywhere else.

use tol_types::Uint256;

use crate::error::CompileError;
use crate::tol::token::{TTok, TToken};

/// Tokenize a TOL module.
pub fn lex(source: &str, chunk: &str) -> Result<Vec<TToken>, CompileError> {
    Lexer {
        chunk,
        source: source.chars().collect(),
        pos: 0,
        line: 1,
    }
    .run()
}

struct Lexer<'a> {
    chunk: &'a str,
    source: Vec<char>,
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
        }
        Some(ch)
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::parse(self.chunk, self.line, "TOL1101", message)
    }

    fn run(mut self) -> Result<Vec<TToken>, CompileError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let line = self.line;
            let Some(ch) = self.current() else {
                tokens.push(TToken {
                    tok: TTok::Eof,
                    line,
                });
                return Ok(tokens);
            };
            let tok = match ch {
                'a'..='z' | 'A'..='Z' | '_' => self.name(),
                '0'..='9' => self.number()?,
                '"' => self.string()?,
                _ => self.symbol()?,
            };
            tokens.push(TToken { tok, line });
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.current() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('-') if self.peek() == Some('-') => {
                    while let Some(c) = self.current() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn name(&mut self) -> TTok {
        let mut word = String::new();
        while let Some(c) = self.current() {
            if c.is_ascii_alphanumeric() || c == '_' {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }
        TTok::keyword(&word).unwrap_or(TTok::Name(word))
    }

    fn number(&mut self) -> Result<TTok, CompileError> {
        if self.current() == Some('0') && matches!(self.peek(), Some('x') | Some('X')) {
            let mut text = String::from("0x");
            self.advance();
            self.advance();
            while let Some(c) = self.current() {
                if c.is_ascii_hexdigit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            if text.len() == 2 {
                return Err(self.error("hex literal expects digits after 0x"));
            }
            return Ok(TTok::Hex(text));
        }
        let mut text = String::new();
        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        // `<digits>.<digits>` is the version-literal shape; a trailing dot
        // in any other position is a float and rejected outright.
        if self.current() == Some('.') && self.peek() != Some('.') {
            if self.peek().map(|c| c.is_ascii_digit()) == Some(true) {
                let mut version = text;
                version.push('.');
                self.advance();
                while let Some(c) = self.current() {
                    if c.is_ascii_digit() {
                        version.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
                return Ok(TTok::Version(version));
            }
            return Err(self.error("float literals are not supported"));
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            return Err(self.error("exponent literals are not supported"));
        }
        let value = Uint256::from_decimal(&text)
            .map_err(|e| self.error(format!("malformed number '{text}': {e}")))?;
        Ok(TTok::Number(value))
    }

    fn string(&mut self) -> Result<TTok, CompileError> {
        self.advance();
        let mut out = String::new();
        loop {
            match self.advance() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some('"') => return Ok(TTok::Str(out)),
                Some('\\') => {
                    let esc = self
                        .advance()
                        .ok_or_else(|| self.error("unterminated string"))?;
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '\\' => out.push('\\'),
                        '"' => out.push('"'),
                        other => {
                            return Err(
                                self.error(format!("invalid escape sequence '\\{other}'"))
                            )
                        }
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn symbol(&mut self) -> Result<TTok, CompileError> {
        let ch = self.advance().expect("symbol");
        Ok(match ch {
            '{' => TTok::LBrace,
            '}' => TTok::RBrace,
            '(' => TTok::LParen,
            ')' => TTok::RParen,
            '[' => TTok::LBracket,
            ']' => TTok::RBracket,
            ';' => TTok::Semi,
            ':' => TTok::Colon,
            ',' => TTok::Comma,
            '.' => {
                if self.current() == Some('.') {
                    self.advance();
                    TTok::DotDot
                } else {
                    TTok::Dot
                }
            }
            '@' => TTok::At,
            '+' => TTok::Plus,
            '*' => TTok::Star,
            '/' => TTok::Slash,
            '%' => TTok::Percent,
            '-' => {
                if self.current() == Some('>') {
                    self.advance();
                    TTok::Arrow
                } else {
                    TTok::Minus
                }
            }
            '=' => match self.current() {
                Some('=') => {
                    self.advance();
                    TTok::EqEq
                }
                Some('>') => {
                    self.advance();
                    TTok::FatArrow
                }
                _ => TTok::Assign,
            },
            '!' => {
                if self.current() == Some('=') {
                    self.advance();
                    TTok::Ne
                } else {
                    TTok::Bang
                }
            }
            '<' => {
                if self.current() == Some('=') {
                    self.advance();
                    TTok::Le
                } else {
                    TTok::Lt
                }
            }
            '>' => {
                if self.current() == Some('=') {
                    self.advance();
                    TTok::Ge
                } else {
                    TTok::Gt
                }
            }
            '&' => {
                if self.current() == Some('&') {
                    self.advance();
                    TTok::AndAnd
                } else {
                    return Err(self.error("'&' expects '&&'"));
                }
            }
            '|' => {
                if self.current() == Some('|') {
                    self.advance();
                    TTok::OrOr
                } else {
                    return Err(self.error("'|' expects '||'"));
                }
            }
            other => return Err(self.error(format!("unexpected character '{other}'"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<TTok> {
        lex(src, "@t").unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn lexes_header_and_contract() {
        assert_eq!(
            toks("tol 0.2\ncontract Token { }"),
            vec![
                TTok::Tol,
                TTok::Version("0.2".into()),
                TTok::Contract,
                TTok::Name("Token".into()),
                TTok::LBrace,
                TTok::RBrace,
                TTok::Eof,
            ]
        );
    }

    #[test]
    fn lexes_mapping_and_arrows() {
        assert_eq!(
            toks("mapping(address => uint256) -> (ok: bool)"),
            vec![
                TTok::Mapping,
                TTok::LParen,
                TTok::Name("address".into()),
                TTok::FatArrow,
                TTok::Name("uint256".into()),
                TTok::RParen,
                TTok::Arrow,
                TTok::LParen,
                TTok::Name("ok".into()),
                TTok::Colon,
                TTok::Name("bool".into()),
                TTok::RParen,
                TTok::Eof,
            ]
        );
    }

    #[test]
    fn hex_literals_stay_textual() {
        assert_eq!(toks("0xAb01"), vec![TTok::Hex("0xAb01".into()), TTok::Eof]);
    }

    #[test]
    fn floats_outside_header_are_rejected() {
        assert!(lex("let x = 1.", "@t").is_err());
        assert!(lex("let x = 2e8", "@t").is_err());
        // version shape still lexes; the checker rejects misplaced ones
        assert!(lex("let x = 1.5", "@t").is_ok());
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            toks("-- heading\nlet x = 1 -- tail"),
            vec![
                TTok::Let,
                TTok::Name("x".into()),
                TTok::Assign,
                TTok::Number(Uint256::ONE),
                TTok::Eof,
            ]
        );
    }

    #[test]
    fn range_and_comparison_operators() {
        assert_eq!(
            toks("0 .. n != m"),
            vec![
                TTok::Number(Uint256::ZERO),
                TTok::DotDot,
                TTok::Name("n".into()),
                TTok::Ne,
                TTok::Name("m".into()),
                TTok::Eof,
            ]
        );
    }
}
