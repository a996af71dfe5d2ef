use crate::error::GrammarError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Rule or terminal name -- distinguished in the parser by case
    Name(String),
    /// Quoted string literal (escapes resolved) with its `i` flag
    Str { value: String, insensitive: bool },
    /// `/pattern/flags`
    Regex { pattern: String, flags: String },
    /// `%import`, `%ignore`, `%declare`, ...
    Directive(String),
    /// Unsigned integer (priorities and `~` repetition counts)
    Number(u32),
    // Punctuation
    Colon,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Question,
    Star,
    Plus,
    Bang,
    Tilde,
    Comma,
    Dot,
    DotDot,
    Arrow,
    /// End of a definition
    Newline,
    // End of input
    Eof,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
    pub column: u32,
}

/// Tokenize grammar source.
///
/// Newlines end definitions, except that a newline followed by an
/// alternative bar (`|`) continues the current definition and newlines
/// inside parentheses or brackets are ignored.
pub fn lex(src: &str) -> Result<Vec<Spanned>, GrammarError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut pos = 0usize;
    let mut line: u32 = 1;
    let mut line_start = 0usize;
    let mut depth = 0usize;

    while pos < chars.len() {
        let c = chars[pos];
        let column = (pos - line_start) as u32 + 1;

        // Line comment
        if c == '/' && pos + 1 < chars.len() && chars[pos + 1] == '/' {
            while pos < chars.len() && chars[pos] != '\n' {
                pos += 1;
            }
            continue;
        }

        if c == '\n' {
            pos += 1;
            line += 1;
            line_start = pos;
            if depth == 0 && !continues_with_pipe(&chars, pos) {
                push_newline(&mut tokens, line - 1, column);
            }
            continue;
        }

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        // String literal
        if c == '"' {
            pos += 1;
            let mut s = String::new();
            loop {
                if pos >= chars.len() || chars[pos] == '\n' {
                    return Err(GrammarError::at(line, column, "unterminated string literal"));
                }
                let sc = chars[pos];
                if sc == '"' {
                    pos += 1;
                    break;
                }
                if sc == '\\' {
                    pos += 1;
                    if pos >= chars.len() {
                        return Err(GrammarError::at(
                            line,
                            column,
                            "unterminated escape in string",
                        ));
                    }
                    match chars[pos] {
                        '"' => s.push('"'),
                        '\\' => s.push('\\'),
                        'n' => s.push('\n'),
                        't' => s.push('\t'),
                        'r' => s.push('\r'),
                        'f' => s.push('\u{c}'),
                        other => {
                            s.push('\\');
                            s.push(other);
                        }
                    }
                    pos += 1;
                    continue;
                }
                s.push(sc);
                pos += 1;
            }
            if s.is_empty() {
                return Err(GrammarError::at(line, column, "empty string literal"));
            }
            let insensitive = pos < chars.len() && chars[pos] == 'i' && !is_name_char_at(&chars, pos + 1);
            if insensitive {
                pos += 1;
            }
            tokens.push(Spanned {
                token: Token::Str {
                    value: s,
                    insensitive,
                },
                line,
                column,
            });
            continue;
        }

        // Regex literal
        if c == '/' {
            pos += 1;
            let mut pattern = String::new();
            loop {
                if pos >= chars.len() || chars[pos] == '\n' {
                    return Err(GrammarError::at(line, column, "unterminated regular expression"));
                }
                let rc = chars[pos];
                if rc == '/' {
                    pos += 1;
                    break;
                }
                if rc == '\\' && pos + 1 < chars.len() {
                    if chars[pos + 1] == '/' {
                        pattern.push('/');
                    } else {
                        pattern.push('\\');
                        pattern.push(chars[pos + 1]);
                    }
                    pos += 2;
                    continue;
                }
                pattern.push(rc);
                pos += 1;
            }
            let mut flags = String::new();
            while pos < chars.len() && "imslux".contains(chars[pos]) {
                flags.push(chars[pos]);
                pos += 1;
            }
            tokens.push(Spanned {
                token: Token::Regex { pattern, flags },
                line,
                column,
            });
            continue;
        }

        // Directive
        if c == '%' {
            pos += 1;
            let start = pos;
            while pos < chars.len() && chars[pos].is_ascii_alphabetic() {
                pos += 1;
            }
            let word: String = chars[start..pos].iter().collect();
            if word.is_empty() {
                return Err(GrammarError::at(line, column, "expected directive name after '%'"));
            }
            tokens.push(Spanned {
                token: Token::Directive(word),
                line,
                column,
            });
            continue;
        }

        // Names
        if c.is_ascii_alphabetic() || c == '_' {
            let start = pos;
            while is_name_char_at(&chars, pos) {
                pos += 1;
            }
            let word: String = chars[start..pos].iter().collect();
            tokens.push(Spanned {
                token: Token::Name(word),
                line,
                column,
            });
            continue;
        }

        // Numbers
        if c.is_ascii_digit() {
            let start = pos;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
            let digits: String = chars[start..pos].iter().collect();
            let n = digits
                .parse::<u32>()
                .map_err(|_| GrammarError::at(line, column, format!("number out of range: {}", digits)))?;
            tokens.push(Spanned {
                token: Token::Number(n),
                line,
                column,
            });
            continue;
        }

        let token = match c {
            ':' => Token::Colon,
            '|' => Token::Pipe,
            '(' => {
                depth += 1;
                Token::LParen
            }
            ')' => {
                depth = depth.saturating_sub(1);
                Token::RParen
            }
            '[' => {
                depth += 1;
                Token::LBracket
            }
            ']' => {
                depth = depth.saturating_sub(1);
                Token::RBracket
            }
            '?' => Token::Question,
            '*' => Token::Star,
            '+' => Token::Plus,
            '!' => Token::Bang,
            '~' => Token::Tilde,
            ',' => Token::Comma,
            '.' => {
                if pos + 1 < chars.len() && chars[pos + 1] == '.' {
                    pos += 1;
                    Token::DotDot
                } else {
                    Token::Dot
                }
            }
            '-' if pos + 1 < chars.len() && chars[pos + 1] == '>' => {
                pos += 1;
                Token::Arrow
            }
            other => {
                return Err(GrammarError::at(
                    line,
                    column,
                    format!("unexpected character '{}'", other),
                ))
            }
        };
        pos += 1;
        tokens.push(Spanned {
            token,
            line,
            column,
        });
    }

    push_newline(&mut tokens, line, (pos - line_start) as u32 + 1);
    tokens.push(Spanned {
        token: Token::Eof,
        line,
        column: (pos - line_start) as u32 + 1,
    });
    Ok(tokens)
}

fn is_name_char_at(chars: &[char], pos: usize) -> bool {
    pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_')
}

/// True when the next non-blank line (skipping comment lines) starts with `|`.
fn continues_with_pipe(chars: &[char], mut pos: usize) -> bool {
    loop {
        while pos < chars.len() && chars[pos].is_whitespace() {
            pos += 1;
        }
        if pos + 1 < chars.len() && chars[pos] == '/' && chars[pos + 1] == '/' {
            while pos < chars.len() && chars[pos] != '\n' {
                pos += 1;
            }
            continue;
        }
        return pos < chars.len() && chars[pos] == '|';
    }
}

/// Blank lines collapse into a single separator.
fn push_newline(tokens: &mut Vec<Spanned>, line: u32, column: u32) {
    if matches!(tokens.last(), None | Some(Spanned { token: Token::Newline, .. })) {
        return;
    }
    tokens.push(Spanned {
        token: Token::Newline,
        line,
        column,
    });
}
