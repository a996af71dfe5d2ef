//! Grammar loader: turns parsed statements into a BNF [`Grammar`].
//!
//! - terminals referenced from rules (or `%ignore`) become lexer terminals
//!   with an anchored regex; terminals used only inside other terminals are
//!   inlined as pattern fragments
//! - EBNF operators are expanded: optionals and groups into alternative
//!   productions, unbounded repetition into inlined helper rules
//! - `%import` pulls terminal definitions from the bundled `common` library

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::ast::{is_terminal_name, Alternative, Expr, Statement, TerminalDef};
use crate::error::GrammarError;
use crate::parser::parse_grammar;

/// Upper bound on the alternatives one rule may expand into.
const MAX_EXPANSIONS: usize = 4096;

const COMMON_SOURCE: &str = include_str!("common.lark");

// ──────────────────────────────────────────────
// Output types
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    Terminal(usize),
    Rule(usize),
}

#[derive(Debug, Clone)]
pub struct Terminal {
    pub name: String,
    /// Regex source, unanchored
    pub pattern: String,
    /// Anchored matcher; `None` for `%declare`d terminals that never match
    pub regex: Option<Regex>,
    pub priority: i32,
    /// Defined by a single string literal (wins ties against patterns)
    pub is_literal: bool,
}

#[derive(Debug, Clone)]
pub struct RuleInfo {
    pub name: String,
    /// `_rule` and generated helpers: children are spliced into the parent
    pub inline: bool,
    /// `?rule`: replaced by its child when it has exactly one
    pub expand_single: bool,
}

#[derive(Debug, Clone)]
pub struct Production {
    pub lhs: usize,
    pub rhs: Vec<Symbol>,
    /// Per RHS position: whether a token matched there stays in the tree
    pub keep: Vec<bool>,
    pub alias: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Grammar {
    pub rules: Vec<RuleInfo>,
    pub productions: Vec<Production>,
    pub by_lhs: Vec<Vec<usize>>,
    pub terminals: Vec<Terminal>,
    pub ignore: Vec<usize>,
    pub start: usize,
    pub warnings: Vec<String>,
}

impl Grammar {
    pub fn symbol_name(&self, sym: Symbol) -> &str {
        match sym {
            Symbol::Terminal(t) => self
                .terminals
                .get(t)
                .map(|t| t.name.as_str())
                .unwrap_or("$END"),
            Symbol::Rule(r) => &self.rules[r].name,
        }
    }

    /// Human-readable `lhs : a b c` form used in diagnostics.
    pub fn describe_production(&self, prod: usize) -> String {
        let p = &self.productions[prod];
        let rhs: Vec<&str> = p.rhs.iter().map(|s| self.symbol_name(*s)).collect();
        format!("<{} : {}>", self.rules[p.lhs].name, rhs.join(" "))
    }

    /// Nonterminals that can derive the empty string.
    pub fn nullable(&self) -> Vec<bool> {
        let mut nullable = vec![false; self.rules.len()];
        let mut changed = true;
        while changed {
            changed = false;
            for p in &self.productions {
                if nullable[p.lhs] {
                    continue;
                }
                let all_nullable = p.rhs.iter().all(|s| match s {
                    Symbol::Rule(r) => nullable[*r],
                    Symbol::Terminal(_) => false,
                });
                if all_nullable {
                    nullable[p.lhs] = true;
                    changed = true;
                }
            }
        }
        nullable
    }
}

// ──────────────────────────────────────────────
// Entry point
// ──────────────────────────────────────────────

/// Load `source` with `start` as the start rule.
///
/// When `collect_warnings` is set, unused rules and terminals are reported
/// in [`Grammar::warnings`].
pub fn load(source: &str, start: &str, collect_warnings: bool) -> Result<Grammar, GrammarError> {
    let statements = parse_grammar(source)?;
    let mut loader = Loader::default();
    loader.collect(statements)?;
    loader.build(start, collect_warnings)
}

fn library() -> Result<&'static HashMap<String, TerminalDef>, GrammarError> {
    static LIBRARY: OnceLock<Result<HashMap<String, TerminalDef>, GrammarError>> = OnceLock::new();
    LIBRARY
        .get_or_init(|| {
            let mut defs = HashMap::new();
            for stmt in parse_grammar(COMMON_SOURCE)? {
                if let Statement::Terminal(def) = stmt {
                    defs.insert(def.name.clone(), def);
                }
            }
            Ok(defs)
        })
        .as_ref()
        .map_err(Clone::clone)
}

// ──────────────────────────────────────────────
// Loader
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scope {
    User,
    Library,
}

#[derive(Debug, Clone)]
enum TermSource {
    Defined(TerminalDef),
    /// Imported under a local name; holds the library name
    Imported(String),
    Declared,
}

#[derive(Default)]
struct Loader {
    rule_defs: Vec<crate::ast::RuleDef>,
    term_defs: HashMap<String, TermSource>,
    term_order: Vec<String>,
    ignore: Vec<Vec<Alternative>>,

    rules: Vec<RuleInfo>,
    rule_index: HashMap<String, usize>,
    productions: Vec<Production>,
    terminals: Vec<Terminal>,
    terminal_index: HashMap<String, usize>,
    anon_literals: HashMap<(String, bool), usize>,
    anon_patterns: HashMap<String, usize>,
    anon_counter: usize,
    helper_counter: usize,
    patterns: HashMap<(Scope, String), (String, i32, bool)>,
    used_terms: HashSet<String>,
}

struct RuleCtx<'a> {
    rule: &'a str,
    keep_all_tokens: bool,
}

type Seq = Vec<(Symbol, bool)>;

impl Loader {
    fn collect(&mut self, statements: Vec<Statement>) -> Result<(), GrammarError> {
        for stmt in statements {
            match stmt {
                Statement::Rule(def) => {
                    if self.rule_defs.iter().any(|r| r.name == def.name) {
                        return Err(GrammarError::at(
                            def.line,
                            1,
                            format!("Rule '{}' defined more than once", def.name),
                        ));
                    }
                    self.rule_defs.push(def);
                }
                Statement::Terminal(def) => {
                    let (name, line) = (def.name.clone(), def.line);
                    self.define_terminal(name, TermSource::Defined(def), line)?;
                }
                Statement::Import(import) => {
                    if import.module != ["common"] {
                        return Err(GrammarError::at(
                            import.line,
                            1,
                            format!(
                                "unknown grammar module '{}'; only 'common' is bundled",
                                import.module.join(".")
                            ),
                        ));
                    }
                    let library = library()?;
                    for (name, local) in import.names {
                        if !library.contains_key(&name) {
                            return Err(GrammarError::at(
                                import.line,
                                1,
                                format!("'{}' not found in module common", name),
                            ));
                        }
                        self.define_terminal(local, TermSource::Imported(name), import.line)?;
                    }
                }
                Statement::Ignore { alternatives, .. } => self.ignore.push(alternatives),
                Statement::Declare { names, line } => {
                    for name in names {
                        if !is_terminal_name(&name) {
                            return Err(GrammarError::at(
                                line,
                                1,
                                format!("only terminals can be declared, got '{}'", name),
                            ));
                        }
                        self.define_terminal(name, TermSource::Declared, line)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn define_terminal(&mut self, name: String, source: TermSource, line: u32) -> Result<(), GrammarError> {
        if self.term_defs.contains_key(&name) {
            return Err(GrammarError::at(
                line,
                1,
                format!("Terminal '{}' defined more than once", name),
            ));
        }
        self.term_order.push(name.clone());
        self.term_defs.insert(name, source);
        Ok(())
    }

    fn build(mut self, start: &str, collect_warnings: bool) -> Result<Grammar, GrammarError> {
        let defs = std::mem::take(&mut self.rule_defs);
        for def in &defs {
            self.rule_index.insert(def.name.clone(), self.rules.len());
            self.rules.push(RuleInfo {
                name: def.name.clone(),
                inline: def.name.starts_with('_'),
                expand_single: def.expand_single,
            });
        }

        let start_idx = *self
            .rule_index
            .get(start)
            .ok_or_else(|| GrammarError::undefined_rule(start))?;

        for (lhs, def) in defs.iter().enumerate() {
            let ctx = RuleCtx {
                rule: &def.name,
                keep_all_tokens: def.keep_all_tokens,
            };
            for alt in &def.alternatives {
                for seq in self.expand_seq(&alt.items, &ctx)? {
                    self.push_production(lhs, seq, alt.alias.clone());
                }
            }
        }

        let ignore_defs = std::mem::take(&mut self.ignore);
        let mut ignore = Vec::new();
        for (i, alts) in ignore_defs.iter().enumerate() {
            let idx = match alts.as_slice() {
                [Alternative { items, alias: None }] if items.len() == 1 => match &items[0] {
                    Expr::Name(name) if is_terminal_name(name) => self.named_terminal(name)?,
                    Expr::Literal { value, insensitive } => self.anon_literal(value, *insensitive)?,
                    _ => self.ignore_terminal(i, alts)?,
                },
                _ => self.ignore_terminal(i, alts)?,
            };
            if !ignore.contains(&idx) {
                ignore.push(idx);
            }
        }

        for t in &self.terminals {
            if let Some(re) = &t.regex {
                if re.is_match("") {
                    return Err(GrammarError::new(format!(
                        "Terminal {} matches the empty string",
                        t.name
                    )));
                }
            }
        }

        let mut by_lhs = vec![Vec::new(); self.rules.len()];
        for (i, p) in self.productions.iter().enumerate() {
            by_lhs[p.lhs].push(i);
        }

        let mut grammar = Grammar {
            rules: self.rules,
            productions: self.productions,
            by_lhs,
            terminals: self.terminals,
            ignore,
            start: start_idx,
            warnings: Vec::new(),
        };

        if collect_warnings {
            grammar.warnings = unused_warnings(&grammar, &self.term_order, &self.used_terms);
        }
        Ok(grammar)
    }

    fn push_production(&mut self, lhs: usize, seq: Seq, alias: Option<String>) {
        let (rhs, keep): (Vec<Symbol>, Vec<bool>) = seq.into_iter().unzip();
        self.productions.push(Production {
            lhs,
            rhs,
            keep,
            alias,
        });
    }

    // ── EBNF expansion ──────────────────────────────────────────────────

    fn expand_seq(&mut self, items: &[Expr], ctx: &RuleCtx<'_>) -> Result<Vec<Seq>, GrammarError> {
        let mut seqs: Vec<Seq> = vec![Vec::new()];
        for item in items {
            let expanded = self.expand_item(item, ctx)?;
            seqs = product(&seqs, &expanded, ctx)?;
        }
        Ok(seqs)
    }

    fn expand_alternatives(&mut self, alts: &[Alternative], ctx: &RuleCtx<'_>) -> Result<Vec<Seq>, GrammarError> {
        let mut out = Vec::new();
        for alt in alts {
            if alt.alias.is_some() {
                return Err(GrammarError::new(format!(
                    "Rule {}: aliases are only allowed at the top level of a rule",
                    ctx.rule
                )));
            }
            out.extend(self.expand_seq(&alt.items, ctx)?);
        }
        Ok(out)
    }

    fn expand_item(&mut self, item: &Expr, ctx: &RuleCtx<'_>) -> Result<Vec<Seq>, GrammarError> {
        match item {
            Expr::Name(name) if is_terminal_name(name) => {
                let idx = self.named_terminal(name)?;
                let keep = ctx.keep_all_tokens || !name.starts_with('_');
                Ok(vec![vec![(Symbol::Terminal(idx), keep)]])
            }
            Expr::Name(name) => {
                let idx = *self
                    .rule_index
                    .get(name)
                    .ok_or_else(|| GrammarError::undefined_rule(name))?;
                Ok(vec![vec![(Symbol::Rule(idx), true)]])
            }
            Expr::Literal { value, insensitive } => {
                let idx = self.anon_literal(value, *insensitive)?;
                Ok(vec![vec![(Symbol::Terminal(idx), ctx.keep_all_tokens)]])
            }
            Expr::Regex { pattern, flags } => {
                let idx = self.anon_pattern(regex_fragment(pattern, flags))?;
                Ok(vec![vec![(Symbol::Terminal(idx), true)]])
            }
            Expr::Range(lo, hi) => {
                let idx = self.anon_pattern(range_fragment(*lo, *hi))?;
                Ok(vec![vec![(Symbol::Terminal(idx), true)]])
            }
            Expr::Group(alts) => self.expand_alternatives(alts, ctx),
            Expr::Optional(alts) => {
                let mut seqs = self.expand_alternatives(alts, ctx)?;
                seqs.push(Vec::new());
                Ok(seqs)
            }
            Expr::Repeat { expr, min, max } => {
                let inner = self.expand_item(expr, ctx)?;
                match (*min, *max) {
                    (0, Some(1)) => {
                        let mut seqs = inner;
                        seqs.push(Vec::new());
                        Ok(seqs)
                    }
                    (min, None) => {
                        let helper = self.repeat_helper(&inner, ctx);
                        let mut base: Vec<Seq> = vec![Vec::new()];
                        for _ in 1..min.max(1) {
                            base = product(&base, &inner, ctx)?;
                        }
                        let mut seqs: Vec<Seq> = base
                            .into_iter()
                            .map(|mut s| {
                                s.push((Symbol::Rule(helper), true));
                                s
                            })
                            .collect();
                        if min == 0 {
                            seqs.push(Vec::new());
                        }
                        Ok(seqs)
                    }
                    (min, Some(max)) => {
                        let mut out = Vec::new();
                        let mut current: Vec<Seq> = vec![Vec::new()];
                        for k in 0..=max {
                            if k >= min {
                                out.extend(current.iter().cloned());
                            }
                            if k < max {
                                current = product(&current, &inner, ctx)?;
                            }
                            if out.len() > MAX_EXPANSIONS {
                                return Err(too_many_expansions(ctx));
                            }
                        }
                        Ok(out)
                    }
                }
            }
        }
    }

    /// `H: e | H e` for every expansion `e` of the repeated item.
    fn repeat_helper(&mut self, inner: &[Seq], ctx: &RuleCtx<'_>) -> usize {
        let idx = self.rules.len();
        self.helper_counter += 1;
        self.rules.push(RuleInfo {
            name: format!("__{}_plus_{}", ctx.rule.trim_start_matches('_'), self.helper_counter),
            inline: true,
            expand_single: false,
        });
        for seq in inner {
            self.push_production(idx, seq.clone(), None);
        }
        for seq in inner {
            let mut rec = vec![(Symbol::Rule(idx), true)];
            rec.extend(seq.iter().cloned());
            self.push_production(idx, rec, None);
        }
        idx
    }

    // ── Terminals ───────────────────────────────────────────────────────

    fn named_terminal(&mut self, name: &str) -> Result<usize, GrammarError> {
        if let Some(&idx) = self.terminal_index.get(name) {
            return Ok(idx);
        }
        self.used_terms.insert(name.to_string());
        if matches!(self.term_defs.get(name), Some(TermSource::Declared)) {
            return Ok(self.push_terminal(name.to_string(), String::new(), None, 0, false));
        }
        let (pattern, priority, is_literal) = self.term_pattern(Scope::User, name, &mut Vec::new())?;
        let regex = compile_anchored(name, &pattern)?;
        Ok(self.push_terminal(name.to_string(), pattern, Some(regex), priority, is_literal))
    }

    fn anon_literal(&mut self, value: &str, insensitive: bool) -> Result<usize, GrammarError> {
        let key = (value.to_string(), insensitive);
        if let Some(&idx) = self.anon_literals.get(&key) {
            return Ok(idx);
        }

        // Reuse a user terminal defined as exactly this literal
        let existing = self.term_order.iter().find(|n| {
            matches!(self.term_defs.get(*n), Some(TermSource::Defined(def))
                if matches!(def.alternatives.as_slice(),
                    [Alternative { items, alias: None }] if items.len() == 1
                        && items[0] == Expr::Literal { value: value.to_string(), insensitive }))
        });
        let idx = match existing.cloned() {
            Some(name) => self.named_terminal(&name)?,
            None => {
                let name = self.anon_literal_name(value);
                let pattern = literal_fragment(value, insensitive);
                let regex = compile_anchored(&name, &pattern)?;
                self.push_terminal(name, pattern, Some(regex), 0, true)
            }
        };
        self.anon_literals.insert(key, idx);
        Ok(idx)
    }

    fn anon_pattern(&mut self, pattern: String) -> Result<usize, GrammarError> {
        if let Some(&idx) = self.anon_patterns.get(&pattern) {
            return Ok(idx);
        }
        let name = self.next_anon_name();
        let regex = compile_anchored(&name, &pattern)?;
        let idx = self.push_terminal(name, pattern.clone(), Some(regex), 0, false);
        self.anon_patterns.insert(pattern, idx);
        Ok(idx)
    }

    fn ignore_terminal(&mut self, i: usize, alts: &[Alternative]) -> Result<usize, GrammarError> {
        let name = format!("__IGNORE_{}", i);
        let (pattern, _) = self.alts_pattern(Scope::User, alts, &mut Vec::new())?;
        let regex = compile_anchored(&name, &pattern)?;
        Ok(self.push_terminal(name, pattern, Some(regex), 0, false))
    }

    fn push_terminal(
        &mut self,
        name: String,
        pattern: String,
        regex: Option<Regex>,
        priority: i32,
        is_literal: bool,
    ) -> usize {
        let idx = self.terminals.len();
        self.terminal_index.insert(name.clone(), idx);
        self.terminals.push(Terminal {
            name,
            pattern,
            regex,
            priority,
            is_literal,
        });
        idx
    }

    fn anon_literal_name(&mut self, value: &str) -> String {
        let candidate = if is_identifier(value) {
            Some(value.to_uppercase())
        } else {
            punctuation_name(value).map(str::to_string)
        };
        match candidate {
            Some(name)
                if !self.term_defs.contains_key(&name) && !self.terminal_index.contains_key(&name) =>
            {
                name
            }
            _ => self.next_anon_name(),
        }
    }

    fn next_anon_name(&mut self) -> String {
        let name = format!("__ANON_{}", self.anon_counter);
        self.anon_counter += 1;
        name
    }

    /// Regex source for a terminal, with its priority and literal-ness.
    fn term_pattern(
        &mut self,
        scope: Scope,
        name: &str,
        stack: &mut Vec<(Scope, String)>,
    ) -> Result<(String, i32, bool), GrammarError> {
        let key = (scope, name.to_string());
        if let Some(cached) = self.patterns.get(&key) {
            return Ok(cached.clone());
        }
        if stack.contains(&key) {
            return Err(GrammarError::new(format!("Recursion in terminal '{}'", name)));
        }

        let def = match scope {
            Scope::User => match self.term_defs.get(name).cloned() {
                Some(TermSource::Defined(def)) => def,
                Some(TermSource::Imported(lib_name)) => {
                    let result = self.term_pattern(Scope::Library, &lib_name, stack)?;
                    self.patterns.insert(key, result.clone());
                    return Ok(result);
                }
                Some(TermSource::Declared) => {
                    return Err(GrammarError::new(format!(
                        "Terminal '{}' is declared without a pattern and cannot be used inside another terminal",
                        name
                    )))
                }
                None => return Err(GrammarError::undefined_terminal(name)),
            },
            Scope::Library => library()?
                .get(name)
                .cloned()
                .ok_or_else(|| GrammarError::undefined_terminal(name))?,
        };

        stack.push(key.clone());
        let (pattern, is_literal) = self.alts_pattern(scope, &def.alternatives, stack)?;
        stack.pop();

        let result = (pattern, def.priority, is_literal);
        self.patterns.insert(key, result.clone());
        Ok(result)
    }

    fn alts_pattern(
        &mut self,
        scope: Scope,
        alts: &[Alternative],
        stack: &mut Vec<(Scope, String)>,
    ) -> Result<(String, bool), GrammarError> {
        let mut parts = Vec::new();
        for alt in alts {
            let mut seq = String::new();
            for item in &alt.items {
                seq.push_str(&self.item_pattern(scope, item, stack)?);
            }
            parts.push(seq);
        }
        let is_literal = matches!(alts,
            [Alternative { items, .. }] if matches!(items.as_slice(), [Expr::Literal { .. }]));
        if parts.len() == 1 {
            Ok((parts.remove(0), is_literal))
        } else {
            Ok((format!("(?:{})", parts.join("|")), false))
        }
    }

    fn item_pattern(
        &mut self,
        scope: Scope,
        item: &Expr,
        stack: &mut Vec<(Scope, String)>,
    ) -> Result<String, GrammarError> {
        Ok(match item {
            Expr::Name(name) => {
                if !is_terminal_name(name) {
                    return Err(GrammarError::new(format!(
                        "Terminals cannot reference rules (found '{}')",
                        name
                    )));
                }
                if scope == Scope::User {
                    self.used_terms.insert(name.clone());
                }
                format!("(?:{})", self.term_pattern(scope, name, stack)?.0)
            }
            Expr::Literal { value, insensitive } => literal_fragment(value, *insensitive),
            Expr::Regex { pattern, flags } => regex_fragment(pattern, flags),
            Expr::Range(lo, hi) => range_fragment(*lo, *hi),
            Expr::Group(alts) => format!("(?:{})", self.alts_pattern(scope, alts, stack)?.0),
            Expr::Optional(alts) => format!("(?:{})?", self.alts_pattern(scope, alts, stack)?.0),
            Expr::Repeat { expr, min, max } => {
                let inner = self.item_pattern(scope, expr, stack)?;
                let op = match (min, max) {
                    (0, Some(1)) => "?".to_string(),
                    (0, None) => "*".to_string(),
                    (1, None) => "+".to_string(),
                    (n, None) => format!("{{{},}}", n),
                    (n, Some(m)) if n == m => format!("{{{}}}", n),
                    (n, Some(m)) => format!("{{{},{}}}", n, m),
                };
                format!("(?:{}){}", inner, op)
            }
        })
    }
}

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

fn product(left: &[Seq], right: &[Seq], ctx: &RuleCtx<'_>) -> Result<Vec<Seq>, GrammarError> {
    if left.len() * right.len() > MAX_EXPANSIONS {
        return Err(too_many_expansions(ctx));
    }
    let mut out = Vec::with_capacity(left.len() * right.len());
    for l in left {
        for r in right {
            let mut seq = l.clone();
            seq.extend(r.iter().cloned());
            out.push(seq);
        }
    }
    Ok(out)
}

fn too_many_expansions(ctx: &RuleCtx<'_>) -> GrammarError {
    GrammarError::new(format!(
        "Rule {} expands into more than {} alternatives",
        ctx.rule, MAX_EXPANSIONS
    ))
}

fn compile_anchored(name: &str, pattern: &str) -> Result<Regex, GrammarError> {
    Regex::new(&format!("^(?:{})", pattern)).map_err(|e| {
        GrammarError::new(format!(
            "Invalid regular expression in terminal {}: {}",
            name, e
        ))
    })
}

fn literal_fragment(value: &str, insensitive: bool) -> String {
    if insensitive {
        format!("(?i:{})", regex::escape(value))
    } else {
        regex::escape(value)
    }
}

fn regex_fragment(pattern: &str, flags: &str) -> String {
    let flags: String = flags.chars().filter(|c| "imsxu".contains(*c)).collect();
    format!("(?{}:{})", flags, pattern)
}

fn range_fragment(lo: char, hi: char) -> String {
    format!(
        "[{}-{}]",
        regex::escape(&lo.to_string()),
        regex::escape(&hi.to_string())
    )
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn punctuation_name(value: &str) -> Option<&'static str> {
    Some(match value {
        "." => "DOT",
        "," => "COMMA",
        ":" => "COLON",
        ";" => "SEMICOLON",
        "+" => "PLUS",
        "-" => "MINUS",
        "*" => "STAR",
        "/" => "SLASH",
        "\\" => "BACKSLASH",
        "|" => "VBAR",
        "?" => "QMARK",
        "!" => "BANG",
        "@" => "AT",
        "#" => "HASH",
        "$" => "DOLLAR",
        "%" => "PERCENT",
        "^" => "CIRCUMFLEX",
        "&" => "AMPERSAND",
        "_" => "UNDERSCORE",
        "<" => "LESSTHAN",
        ">" => "MORETHAN",
        "=" => "EQUAL",
        "\"" => "DBLQUOTE",
        "'" => "QUOTE",
        "`" => "BACKQUOTE",
        "~" => "TILDE",
        "(" => "LPAR",
        ")" => "RPAR",
        "{" => "LBRACE",
        "}" => "RBRACE",
        "[" => "LSQB",
        "]" => "RSQB",
        "\n" => "NEWLINE",
        "\r\n" => "CRLF",
        "\t" => "TAB",
        " " => "SPACE",
        _ => return None,
    })
}

fn unused_warnings(grammar: &Grammar, term_order: &[String], used_terms: &HashSet<String>) -> Vec<String> {
    let mut reachable = vec![false; grammar.rules.len()];
    let mut stack = vec![grammar.start];
    reachable[grammar.start] = true;
    while let Some(r) = stack.pop() {
        for &p in &grammar.by_lhs[r] {
            for sym in &grammar.productions[p].rhs {
                if let Symbol::Rule(next) = sym {
                    if !reachable[*next] {
                        reachable[*next] = true;
                        stack.push(*next);
                    }
                }
            }
        }
    }

    let mut warnings: Vec<String> = grammar
        .rules
        .iter()
        .zip(&reachable)
        .filter(|(info, reached)| !**reached && !info.name.starts_with("__"))
        .map(|(info, _)| format!("Unused rule: {}", info.name))
        .collect();
    warnings.extend(
        term_order
            .iter()
            .filter(|name| !used_terms.contains(*name))
            .map(|name| format!("Unused terminal: {}", name)),
    );
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imports_number_and_ignores_whitespace() {
        let g = load(
            "start: NUMBER\n%import common.NUMBER\n%import common.WS\n%ignore WS\n",
            "start",
            false,
        )
        .unwrap();
        assert_eq!(g.productions.len(), 1);
        assert_eq!(g.terminals.len(), 2);
        let number = &g.terminals[0];
        assert_eq!(number.name, "NUMBER");
        let re = number.regex.as_ref().unwrap();
        assert_eq!(re.find("42 rest").map(|m| m.as_str()), Some("42"));
        assert_eq!(re.find("3.5e-2").map(|m| m.as_str()), Some("3.5e-2"));
        assert_eq!(g.ignore, vec![1]);
    }

    #[test]
    fn anonymous_literals_get_readable_names_and_are_filtered() {
        let g = load("start: \"(\" WORD \")\" \"if\"\n%import common.WORD", "start", false).unwrap();
        let names: Vec<&str> = g.terminals.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["LPAR", "WORD", "RPAR", "IF"]);
        assert_eq!(g.productions[0].keep, vec![false, true, false, false]);
    }

    #[test]
    fn literal_reuses_matching_user_terminal() {
        let g = load("start: NUMBER \"+\" NUMBER\nPLUS: \"+\"\n%import common.NUMBER", "start", false).unwrap();
        let plus = g.terminals.iter().position(|t| t.name == "PLUS").unwrap();
        assert_eq!(g.productions[0].rhs[1], Symbol::Terminal(plus));
        assert!(g.terminals[plus].is_literal);
    }

    #[test]
    fn optional_and_group_expand_into_alternatives() {
        let g = load("start: \"a\" [\"b\"] (\"c\" | \"d\")", "start", false).unwrap();
        assert_eq!(g.productions.len(), 4);
    }

    #[test]
    fn repetition_creates_inlined_helper() {
        let g = load("start: \"a\"*", "start", false).unwrap();
        assert_eq!(g.rules.len(), 2);
        assert!(g.rules[1].inline);
        // start: H | <empty>; H: a | H a
        assert_eq!(g.productions.len(), 4);
    }

    #[test]
    fn undefined_rule_is_reported() {
        let err = load("start: expr", "start", false).unwrap_err();
        assert_eq!(err.message, "Using an undefined rule: expr");
    }

    #[test]
    fn missing_start_rule_is_reported() {
        let err = load("value: \"x\"", "start", false).unwrap_err();
        assert_eq!(err.message, "Using an undefined rule: start");
    }

    #[test]
    fn recursive_terminal_is_rejected() {
        let err = load("start: A\nA: \"x\" A", "start", false).unwrap_err();
        assert!(err.message.contains("Recursion in terminal"), "{}", err.message);
    }

    #[test]
    fn empty_terminal_is_rejected() {
        let err = load("start: A\nA: \"x\"?", "start", false).unwrap_err();
        assert!(err.message.contains("empty string"), "{}", err.message);
    }

    #[test]
    fn unknown_module_is_rejected() {
        let err = load("start: A\n%import python.NAME -> A", "start", false).unwrap_err();
        assert!(err.message.contains("unknown grammar module"));
    }

    #[test]
    fn warnings_list_unused_definitions() {
        let g = load("start: \"a\"\nunused: \"b\"\nSPARE: \"c\"", "start", true).unwrap();
        assert_eq!(g.warnings, vec!["Unused rule: unused", "Unused terminal: SPARE"]);
    }
}
