//! Grammar-definition AST produced by [`crate::parser`].
//!
//! Nothing is resolved here: names are plain strings and EBNF operators are
//! kept as written. The loader turns these into BNF productions and
//! terminal patterns.

// ──────────────────────────────────────────────
// Expressions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Reference to a rule (lowercase) or terminal (uppercase)
    Name(String),
    Literal {
        value: String,
        insensitive: bool,
    },
    Regex {
        pattern: String,
        flags: String,
    },
    /// `"a".."z"`
    Range(char, char),
    /// `( a | b )`
    Group(Vec<Alternative>),
    /// `[ a | b ]`
    Optional(Vec<Alternative>),
    /// `x?`, `x*`, `x+`, `x ~ n`, `x ~ n..m`; `max == None` is unbounded
    Repeat {
        expr: Box<Expr>,
        min: u32,
        max: Option<u32>,
    },
}

/// One `|`-separated alternative: a sequence with an optional `-> alias`.
#[derive(Debug, Clone, PartialEq)]
pub struct Alternative {
    pub items: Vec<Expr>,
    pub alias: Option<String>,
}

// ──────────────────────────────────────────────
// Definitions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RuleDef {
    pub name: String,
    /// `?rule`: replaced by its only child when it has exactly one
    pub expand_single: bool,
    /// `!rule`: anonymous string tokens are kept in the tree
    pub keep_all_tokens: bool,
    pub alternatives: Vec<Alternative>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalDef {
    pub name: String,
    pub priority: i32,
    pub alternatives: Vec<Alternative>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportDef {
    /// Dotted module path without the imported name, e.g. `["common"]`
    pub module: Vec<String>,
    /// (name in module, local name)
    pub names: Vec<(String, String)>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Rule(RuleDef),
    Terminal(TerminalDef),
    Import(ImportDef),
    Ignore { alternatives: Vec<Alternative>, line: u32 },
    Declare { names: Vec<String>, line: u32 },
}

/// Terminal names start with an uppercase letter after optional underscores.
pub fn is_terminal_name(name: &str) -> bool {
    name.trim_start_matches('_')
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_uppercase())
}
