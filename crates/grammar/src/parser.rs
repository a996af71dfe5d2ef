/// Grammar-file parser.
/// Produces the raw statement list; names are not resolved here.
use crate::ast::{is_terminal_name, Alternative, Expr, ImportDef, RuleDef, Statement, TerminalDef};
use crate::error::GrammarError;
use crate::lexer::{lex, Spanned, Token};

pub fn parse_grammar(src: &str) -> Result<Vec<Statement>, GrammarError> {
    let tokens = lex(src)?;
    let mut p = Parser::new(&tokens);
    p.parse_file()
}

// ──────────────────────────────────────────────
// Parser
// ──────────────────────────────────────────────

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Spanned]) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn cur(&self) -> &Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.cur().token
    }

    fn advance(&mut self) -> &Spanned {
        let t = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn err(&self, msg: impl Into<String>) -> GrammarError {
        let cur = self.cur();
        GrammarError::at(cur.line, cur.column, msg)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), GrammarError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.err(format!("expected {}, got {:?}", what, self.peek())))
        }
    }

    fn take_name(&mut self) -> Result<String, GrammarError> {
        if let Token::Name(n) = self.peek().clone() {
            self.advance();
            Ok(n)
        } else {
            Err(self.err(format!("expected name, got {:?}", self.peek())))
        }
    }

    fn end_of_statement(&mut self) -> Result<(), GrammarError> {
        match self.peek() {
            Token::Newline => {
                self.advance();
                Ok(())
            }
            Token::Eof => Ok(()),
            other => Err(self.err(format!("expected end of line, got {:?}", other))),
        }
    }

    // ── File ─────────────────────────────────────────────────────────────

    fn parse_file(&mut self) -> Result<Vec<Statement>, GrammarError> {
        let mut statements = Vec::new();
        loop {
            match self.peek() {
                Token::Eof => break,
                Token::Newline => {
                    self.advance();
                }
                Token::Directive(_) => {
                    statements.push(self.parse_directive()?);
                    self.end_of_statement()?;
                }
                _ => {
                    statements.push(self.parse_definition()?);
                    self.end_of_statement()?;
                }
            }
        }
        Ok(statements)
    }

    fn parse_definition(&mut self) -> Result<Statement, GrammarError> {
        let line = self.cur().line;
        let mut expand_single = false;
        let mut keep_all_tokens = false;
        loop {
            if self.eat(&Token::Question) {
                expand_single = true;
            } else if self.eat(&Token::Bang) {
                keep_all_tokens = true;
            } else {
                break;
            }
        }

        let name = self.take_name()?;
        let mut priority = 0i32;
        if self.eat(&Token::Dot) {
            match self.peek().clone() {
                Token::Number(n) => {
                    self.advance();
                    priority = n as i32;
                }
                other => return Err(self.err(format!("expected priority number, got {:?}", other))),
            }
        }
        self.expect(Token::Colon, "':'")?;
        let alternatives = self.parse_alternatives()?;

        if is_terminal_name(&name) {
            if expand_single || keep_all_tokens {
                return Err(GrammarError::at(
                    line,
                    1,
                    format!("terminal {} cannot take rule modifiers", name),
                ));
            }
            if alternatives.iter().any(|a| a.alias.is_some()) {
                return Err(GrammarError::at(
                    line,
                    1,
                    format!("terminal {} cannot use aliases", name),
                ));
            }
            Ok(Statement::Terminal(TerminalDef {
                name,
                priority,
                alternatives,
                line,
            }))
        } else {
            Ok(Statement::Rule(RuleDef {
                name,
                expand_single,
                keep_all_tokens,
                alternatives,
                line,
            }))
        }
    }

    // ── Directives ───────────────────────────────────────────────────────

    fn parse_directive(&mut self) -> Result<Statement, GrammarError> {
        let line = self.cur().line;
        let Token::Directive(word) = self.advance().token.clone() else {
            return Err(self.err("expected directive"));
        };
        match word.as_str() {
            "import" => self.parse_import(line).map(Statement::Import),
            "ignore" => {
                let alternatives = self.parse_alternatives()?;
                if alternatives.iter().all(|a| a.items.is_empty()) {
                    return Err(self.err("%ignore needs a terminal"));
                }
                Ok(Statement::Ignore { alternatives, line })
            }
            "declare" => {
                let mut names = Vec::new();
                while let Token::Name(_) = self.peek() {
                    names.push(self.take_name()?);
                }
                if names.is_empty() {
                    return Err(self.err("%declare needs at least one name"));
                }
                Ok(Statement::Declare { names, line })
            }
            other => Err(GrammarError::at(
                line,
                1,
                format!("unknown directive %{}", other),
            )),
        }
    }

    fn parse_import(&mut self, line: u32) -> Result<ImportDef, GrammarError> {
        let mut path = vec![self.take_name()?];
        while self.eat(&Token::Dot) {
            path.push(self.take_name()?);
        }

        if self.eat(&Token::LParen) {
            let mut names = Vec::new();
            loop {
                let n = self.take_name()?;
                names.push((n.clone(), n));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RParen, "')'")?;
            return Ok(ImportDef {
                module: path,
                names,
                line,
            });
        }

        if path.len() < 2 {
            return Err(GrammarError::at(
                line,
                1,
                "%import needs a module and a name, e.g. common.NUMBER",
            ));
        }
        let name = path.pop().unwrap_or_default();
        let local = if self.eat(&Token::Arrow) {
            self.take_name()?
        } else {
            name.clone()
        };
        Ok(ImportDef {
            module: path,
            names: vec![(name, local)],
            line,
        })
    }

    // ── Expansions ───────────────────────────────────────────────────────

    fn parse_alternatives(&mut self) -> Result<Vec<Alternative>, GrammarError> {
        let mut alternatives = vec![self.parse_alternative()?];
        while self.eat(&Token::Pipe) {
            alternatives.push(self.parse_alternative()?);
        }
        Ok(alternatives)
    }

    fn parse_alternative(&mut self) -> Result<Alternative, GrammarError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Token::Pipe
                | Token::Newline
                | Token::Eof
                | Token::RParen
                | Token::RBracket
                | Token::Arrow => break,
                _ => items.push(self.parse_item()?),
            }
        }
        let alias = if self.eat(&Token::Arrow) {
            Some(self.take_name()?)
        } else {
            None
        };
        Ok(Alternative { items, alias })
    }

    fn parse_item(&mut self) -> Result<Expr, GrammarError> {
        let atom = self.parse_atom()?;
        let (min, max) = match self.peek() {
            Token::Question => (0, Some(1)),
            Token::Star => (0, None),
            Token::Plus => (1, None),
            Token::Tilde => {
                self.advance();
                let min = self.take_number()?;
                let max = if self.eat(&Token::DotDot) {
                    self.take_number()?
                } else {
                    min
                };
                if max < min {
                    return Err(self.err(format!("invalid repetition range {}..{}", min, max)));
                }
                return Ok(Expr::Repeat {
                    expr: Box::new(atom),
                    min,
                    max: Some(max),
                });
            }
            _ => return Ok(atom),
        };
        self.advance();
        Ok(Expr::Repeat {
            expr: Box::new(atom),
            min,
            max,
        })
    }

    fn take_number(&mut self) -> Result<u32, GrammarError> {
        if let Token::Number(n) = self.peek().clone() {
            self.advance();
            Ok(n)
        } else {
            Err(self.err(format!("expected number, got {:?}", self.peek())))
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, GrammarError> {
        match self.peek().clone() {
            Token::LParen => {
                self.advance();
                let alts = self.parse_alternatives()?;
                self.expect(Token::RParen, "')'")?;
                Ok(Expr::Group(alts))
            }
            Token::LBracket => {
                self.advance();
                let alts = self.parse_alternatives()?;
                self.expect(Token::RBracket, "']'")?;
                Ok(Expr::Optional(alts))
            }
            Token::Str { value, insensitive } => {
                self.advance();
                if self.eat(&Token::DotDot) {
                    let Token::Str { value: hi, .. } = self.peek().clone() else {
                        return Err(self.err("expected string after '..'"));
                    };
                    self.advance();
                    return range(&value, &hi).ok_or_else(|| {
                        self.err(format!(
                            "range bounds must be single characters: \"{}\"..\"{}\"",
                            value, hi
                        ))
                    });
                }
                Ok(Expr::Literal { value, insensitive })
            }
            Token::Regex { pattern, flags } => {
                self.advance();
                Ok(Expr::Regex { pattern, flags })
            }
            Token::Name(name) => {
                self.advance();
                Ok(Expr::Name(name))
            }
            other => Err(self.err(format!("unexpected {:?} in expansion", other))),
        }
    }
}

fn range(lo: &str, hi: &str) -> Option<Expr> {
    let mut lo_chars = lo.chars();
    let mut hi_chars = hi.chars();
    let (Some(a), None) = (lo_chars.next(), lo_chars.next()) else {
        return None;
    };
    let (Some(b), None) = (hi_chars.next(), hi_chars.next()) else {
        return None;
    };
    (a <= b).then_some(Expr::Range(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rule_with_alternatives_and_alias() {
        let stmts = parse_grammar("?sum: sum \"+\" product -> add\n    | product\n").unwrap();
        let Statement::Rule(rule) = &stmts[0] else {
            panic!("expected rule");
        };
        assert_eq!(rule.name, "sum");
        assert!(rule.expand_single);
        assert_eq!(rule.alternatives.len(), 2);
        assert_eq!(rule.alternatives[0].alias.as_deref(), Some("add"));
        assert_eq!(rule.alternatives[1].items, vec![Expr::Name("product".into())]);
    }

    #[test]
    fn parses_terminal_priority_and_operators() {
        let stmts = parse_grammar("KEYWORD.2: (\"if\" | \"else\")+\nD: \"0\"..\"9\"").unwrap();
        let Statement::Terminal(t) = &stmts[0] else {
            panic!("expected terminal");
        };
        assert_eq!(t.priority, 2);
        assert!(matches!(
            &t.alternatives[0].items[0],
            Expr::Repeat { min: 1, max: None, .. }
        ));
        let Statement::Terminal(d) = &stmts[1] else {
            panic!("expected terminal");
        };
        assert_eq!(d.alternatives[0].items[0], Expr::Range('0', '9'));
    }

    #[test]
    fn parses_import_forms() {
        let stmts = parse_grammar(
            "%import common.NUMBER\n%import common.WS -> SPACE\n%import common (INT, WORD)\n",
        )
        .unwrap();
        assert_eq!(stmts.len(), 3);
        let Statement::Import(single) = &stmts[0] else {
            panic!("expected import");
        };
        assert_eq!(single.module, vec!["common".to_string()]);
        assert_eq!(single.names, vec![("NUMBER".into(), "NUMBER".into())]);
        let Statement::Import(aliased) = &stmts[1] else {
            panic!("expected import");
        };
        assert_eq!(aliased.names, vec![("WS".into(), "SPACE".into())]);
        let Statement::Import(list) = &stmts[2] else {
            panic!("expected import");
        };
        assert_eq!(list.names.len(), 2);
    }

    #[test]
    fn repetition_with_tilde() {
        let stmts = parse_grammar("start: \"a\" ~ 2..3").unwrap();
        let Statement::Rule(rule) = &stmts[0] else {
            panic!("expected rule");
        };
        assert!(matches!(
            rule.alternatives[0].items[0],
            Expr::Repeat { min: 2, max: Some(3), .. }
        ));
    }

    #[test]
    fn rejects_missing_colon() {
        let err = parse_grammar("start NUMBER").unwrap_err();
        assert!(err.message.contains("expected ':'"), "{}", err.message);
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn rejects_unknown_directive() {
        let err = parse_grammar("%override start: A").unwrap_err();
        assert!(err.message.contains("unknown directive"));
    }
}
