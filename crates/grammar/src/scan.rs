//! Tokenizer for sample text, driven by a loaded grammar's terminals.

use crate::budget::Budget;
use crate::error::ParseFailure;
use crate::load::Grammar;
use crate::tree::Token;

/// One token matched in the sample text.
#[derive(Debug, Clone)]
pub struct Lexeme {
    pub terminal: usize,
    pub token: Token,
    /// Byte offset of the first character
    pub byte_pos: usize,
}

/// Position in the sample text.
#[derive(Debug, Clone)]
pub struct Scanner<'t> {
    text: &'t str,
    pos: usize,
    char_pos: usize,
    line: u32,
    column: u32,
}

impl<'t> Scanner<'t> {
    pub fn new(text: &'t str) -> Self {
        Scanner {
            text,
            pos: 0,
            char_pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn byte_pos(&self) -> usize {
        self.pos
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    /// Next significant token, skipping ignored terminals.
    ///
    /// With `allowed` set (contextual lexing) only those terminals compete.
    /// If none of them match, the full terminal set is tried so that the
    /// parser can report the token it did not expect.
    pub fn next(
        &mut self,
        grammar: &Grammar,
        allowed: Option<&[bool]>,
        budget: &Budget,
    ) -> Result<Option<Lexeme>, ParseFailure> {
        loop {
            budget.check()?;
            if self.pos >= self.text.len() {
                return Ok(None);
            }

            let best = self
                .longest_match(grammar, allowed)
                .or_else(|| allowed.and_then(|_| self.longest_match(grammar, None)));

            let Some((terminal, len)) = best else {
                let character = self.text[self.pos..].chars().next().unwrap_or('\0');
                let expected = grammar
                    .terminals
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| allowed.map_or(true, |a| a.get(*i).copied().unwrap_or(false)))
                    .map(|(_, t)| t.name.clone())
                    .collect();
                return Err(ParseFailure::UnexpectedCharacters {
                    character,
                    pos: self.pos,
                    line: self.line,
                    column: self.column,
                    expected,
                });
            };

            let lexeme = self.consume(grammar, terminal, len);
            if !grammar.ignore.contains(&terminal) {
                return Ok(Some(lexeme));
            }
        }
    }

    /// Winner among matching terminals: priority, then match length, then
    /// literal over pattern, then declaration order.
    fn longest_match(&self, grammar: &Grammar, allowed: Option<&[bool]>) -> Option<(usize, usize)> {
        let rest = &self.text[self.pos..];
        let mut best: Option<(usize, usize)> = None;
        for (i, term) in grammar.terminals.iter().enumerate() {
            let permitted = grammar.ignore.contains(&i)
                || allowed.map_or(true, |a| a.get(i).copied().unwrap_or(false));
            if !permitted {
                continue;
            }
            let Some(re) = &term.regex else { continue };
            let Some(m) = re.find(rest) else { continue };
            let len = m.end();
            if len == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((j, best_len)) => {
                    let other = &grammar.terminals[j];
                    (term.priority, len, term.is_literal) > (other.priority, best_len, other.is_literal)
                }
            };
            if better {
                best = Some((i, len));
            }
        }
        best
    }

    fn consume(&mut self, grammar: &Grammar, terminal: usize, len: usize) -> Lexeme {
        let value = &self.text[self.pos..self.pos + len];
        let start = (self.pos, self.char_pos, self.line, self.column);
        for c in value.chars() {
            self.char_pos += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.pos += len;
        Lexeme {
            terminal,
            byte_pos: start.0,
            token: Token {
                kind: grammar.terminals[terminal].name.clone(),
                value: value.to_string(),
                start_pos: start.1,
                end_pos: self.char_pos,
                line: start.2,
                column: start.3,
            },
        }
    }
}

/// Tokenize the whole text with every terminal active.
pub fn tokenize(grammar: &Grammar, text: &str, budget: &Budget) -> Result<Vec<Lexeme>, ParseFailure> {
    let mut scanner = Scanner::new(text);
    let mut out = Vec::new();
    while let Some(lexeme) = scanner.next(grammar, None, budget)? {
        out.push(lexeme);
    }
    Ok(out)
}
