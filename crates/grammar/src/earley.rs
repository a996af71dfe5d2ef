//! Earley backend.
//!
//! Recognition runs over the token stream of the standard lexer, with the
//! Aycock-Horspool treatment of nullable rules. Every completed item is
//! recorded as a span; the tree is then rebuilt top-down from those spans,
//! preferring the longest match for each child.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use crate::budget::Budget;
use crate::error::ParseFailure;
use crate::load::{Grammar, Symbol};
use crate::scan::{tokenize, Lexeme};
use crate::tree::{self, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Item {
    prod: usize,
    dot: usize,
    origin: usize,
}

/// Checking the clock on every item is wasteful; once per this many is enough.
const CHECK_EVERY: usize = 256;

#[derive(Debug)]
pub struct EarleyParser {
    nullable: Vec<bool>,
}

impl EarleyParser {
    pub fn new(grammar: &Grammar) -> Self {
        EarleyParser {
            nullable: grammar.nullable(),
        }
    }

    pub fn parse(&self, grammar: &Grammar, text: &str, budget: &Budget) -> Result<Tree, ParseFailure> {
        let tokens = tokenize(grammar, text, budget)?;
        let spans = self.recognize(grammar, &tokens, text, budget)?;

        let mut extractor = Extractor {
            grammar,
            tokens: &tokens,
            spans: &spans,
            budget,
            done: HashMap::new(),
            active: HashSet::new(),
            dead: HashSet::new(),
        };
        let n = tokens.len();
        let candidates = spans.get(&(grammar.start, 0)).cloned().unwrap_or_default();
        for (end, prod) in candidates {
            if end != n {
                continue;
            }
            if let Some(items) = extractor.node(prod, 0, n)? {
                return Ok(tree::finish(grammar, items));
            }
        }
        Err(end_of_input(&tokens, text, Vec::new()))
    }

    /// Runs the recognizer and returns completed spans keyed by
    /// `(rule, start)`, each list holding `(end, production)` longest first.
    fn recognize(
        &self,
        grammar: &Grammar,
        tokens: &[Lexeme],
        text: &str,
        budget: &Budget,
    ) -> Result<HashMap<(usize, usize), Vec<(usize, usize)>>, ParseFailure> {
        let n = tokens.len();
        let mut sets: Vec<Vec<Item>> = vec![Vec::new(); n + 1];
        let mut seen: Vec<HashSet<Item>> = vec![HashSet::new(); n + 1];
        let mut completed: HashSet<(usize, usize, usize)> = HashSet::new();

        let mut add = |sets: &mut Vec<Vec<Item>>, j: usize, item: Item| {
            if seen[j].insert(item) {
                sets[j].push(item);
            }
        };

        for &prod in &grammar.by_lhs[grammar.start] {
            add(&mut sets, 0, Item { prod, dot: 0, origin: 0 });
        }

        let mut steps = 0usize;
        for j in 0..=n {
            budget.check()?;
            let mut k = 0;
            while k < sets[j].len() {
                steps += 1;
                if steps % CHECK_EVERY == 0 {
                    budget.check()?;
                }
                let item = sets[j][k];
                k += 1;
                let rhs = &grammar.productions[item.prod].rhs;
                match rhs.get(item.dot) {
                    None => {
                        completed.insert((item.prod, item.origin, j));
                        let lhs = grammar.productions[item.prod].lhs;
                        let parents: Vec<Item> = sets[item.origin]
                            .iter()
                            .filter(|p| grammar.productions[p.prod].rhs.get(p.dot) == Some(&Symbol::Rule(lhs)))
                            .copied()
                            .collect();
                        for parent in parents {
                            add(&mut sets, j, Item { dot: parent.dot + 1, ..parent });
                        }
                    }
                    Some(Symbol::Rule(r)) => {
                        for &prod in &grammar.by_lhs[*r] {
                            add(&mut sets, j, Item { prod, dot: 0, origin: j });
                        }
                        if self.nullable[*r] {
                            add(&mut sets, j, Item { dot: item.dot + 1, ..item });
                        }
                    }
                    Some(Symbol::Terminal(t)) => {
                        if j < n && tokens[j].terminal == *t {
                            add(&mut sets, j + 1, Item { dot: item.dot + 1, ..item });
                        }
                    }
                }
            }

            if j < n && sets[j + 1].is_empty() {
                let lexeme = &tokens[j];
                return Err(ParseFailure::UnexpectedToken {
                    terminal: lexeme.token.kind.clone(),
                    value: lexeme.token.value.clone(),
                    pos: lexeme.byte_pos,
                    line: lexeme.token.line,
                    column: lexeme.token.column,
                    expected: expected_terminals(grammar, &sets[j]),
                });
            }
        }

        let accepted = grammar.by_lhs[grammar.start]
            .iter()
            .any(|&prod| completed.contains(&(prod, 0, n)));
        if !accepted {
            return Err(end_of_input(tokens, text, expected_terminals(grammar, &sets[n])));
        }

        let mut spans: HashMap<(usize, usize), Vec<(usize, usize)>> = HashMap::new();
        for (prod, start, end) in completed {
            spans
                .entry((grammar.productions[prod].lhs, start))
                .or_default()
                .push((end, prod));
        }
        for list in spans.values_mut() {
            list.sort_unstable_by_key(|&(end, prod)| (Reverse(end), prod));
        }
        Ok(spans)
    }
}

fn expected_terminals(grammar: &Grammar, set: &[Item]) -> Vec<String> {
    let mut names: Vec<String> = set
        .iter()
        .filter_map(|item| match grammar.productions[item.prod].rhs.get(item.dot) {
            Some(Symbol::Terminal(t)) => Some(grammar.terminals[*t].name.clone()),
            _ => None,
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

fn end_of_input(tokens: &[Lexeme], text: &str, expected: Vec<String>) -> ParseFailure {
    let (line, column) = match tokens.last() {
        Some(last) => {
            let mut line = last.token.line;
            let mut column = last.token.column;
            for c in last.token.value.chars() {
                if c == '\n' {
                    line += 1;
                    column = 1;
                } else {
                    column += 1;
                }
            }
            (line, column)
        }
        None => (1, 1),
    };
    ParseFailure::UnexpectedEof {
        pos: tokens.last().map_or(0, |l| l.byte_pos + l.token.value.len()).min(text.len()),
        line,
        column,
        expected,
    }
}

// ──────────────────────────────────────────────
// Tree extraction
// ──────────────────────────────────────────────

struct Extractor<'a> {
    grammar: &'a Grammar,
    tokens: &'a [Lexeme],
    spans: &'a HashMap<(usize, usize), Vec<(usize, usize)>>,
    budget: &'a Budget,
    /// (prod, start, end) -> shaped children
    done: HashMap<(usize, usize, usize), Vec<Tree>>,
    /// Guards against cyclic derivations such as `a: a | ...`
    active: HashSet<(usize, usize, usize)>,
    /// (prod, rhs position, start, end) known not to derive
    dead: HashSet<(usize, usize, usize, usize)>,
}

impl Extractor<'_> {
    fn node(&mut self, prod: usize, start: usize, end: usize) -> Result<Option<Vec<Tree>>, ParseFailure> {
        let key = (prod, start, end);
        if let Some(trees) = self.done.get(&key) {
            return Ok(Some(trees.clone()));
        }
        if !self.active.insert(key) {
            return Ok(None);
        }
        let mut slots = Vec::new();
        let found = self.fill(prod, 0, start, end, &mut slots);
        self.active.remove(&key);
        if !found? {
            return Ok(None);
        }
        let grammar = self.grammar;
        let trees = tree::reduce(grammar, &grammar.productions[prod], slots);
        self.done.insert(key, trees.clone());
        Ok(Some(trees))
    }

    fn fill(
        &mut self,
        prod: usize,
        i: usize,
        pos: usize,
        end: usize,
        slots: &mut Vec<Vec<Tree>>,
    ) -> Result<bool, ParseFailure> {
        self.budget.check()?;
        let grammar = self.grammar;
        let rhs = &grammar.productions[prod].rhs;
        if i == rhs.len() {
            return Ok(pos == end);
        }
        if self.dead.contains(&(prod, i, pos, end)) {
            return Ok(false);
        }

        match rhs[i] {
            Symbol::Terminal(t) => {
                if pos < end && self.tokens[pos].terminal == t {
                    slots.push(vec![Tree::Token(self.tokens[pos].token.clone())]);
                    if self.fill(prod, i + 1, pos + 1, end, slots)? {
                        return Ok(true);
                    }
                    slots.pop();
                }
            }
            Symbol::Rule(r) => {
                let spans = self.spans;
                for &(child_end, child) in spans.get(&(r, pos)).map_or(&[][..], Vec::as_slice) {
                    if child_end > end {
                        continue;
                    }
                    let Some(sub) = self.node(child, pos, child_end)? else {
                        continue;
                    };
                    slots.push(sub);
                    if self.fill(prod, i + 1, child_end, end, slots)? {
                        return Ok(true);
                    }
                    slots.pop();
                }
            }
        }

        self.dead.insert((prod, i, pos, end));
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::load;

    fn parse(src: &str, text: &str) -> Result<Tree, ParseFailure> {
        let g = load(src, "start", false).unwrap();
        EarleyParser::new(&g).parse(&g, text, &Budget::unlimited())
    }

    #[test]
    fn handles_ambiguous_expression_grammar() {
        let tree = parse(
            "start: e\ne: e \"+\" e -> add | NUMBER\n%import common.NUMBER\n%import common.WS\n%ignore WS",
            "1 + 2 + 3",
        )
        .unwrap();
        assert_eq!(tree.rule(), Some("start"));
        assert_eq!(tree.tokens().len(), 3);
    }

    #[test]
    fn nullable_rules_in_the_middle() {
        let tree = parse("start: \"a\" opt \"b\"\nopt: \"x\"?", "ab").unwrap();
        assert_eq!(tree.children().len(), 1);
        assert_eq!(tree.children()[0].rule(), Some("opt"));
    }

    #[test]
    fn inline_rules_are_spliced() {
        let tree = parse(
            "start: _item+\n_item: WORD\n%import common.WORD\n%import common.WS\n%ignore WS",
            "one two three",
        )
        .unwrap();
        assert_eq!(tree.children().len(), 3);
        assert!(tree.children().iter().all(|c| matches!(c, Tree::Token(_))));
    }

    #[test]
    fn reports_unexpected_token() {
        let err = parse("start: \"a\" \"b\"", "aa").unwrap_err();
        match err {
            ParseFailure::UnexpectedToken {
                terminal, column, expected, ..
            } => {
                assert_eq!(terminal, "A");
                assert_eq!(column, 2);
                assert_eq!(expected, vec!["B".to_string()]);
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[test]
    fn reports_premature_end() {
        let err = parse("start: \"a\" \"b\"", "a").unwrap_err();
        assert!(matches!(err, ParseFailure::UnexpectedEof { line: 1, column: 2, .. }));
    }

    #[test]
    fn cancelled_budget_interrupts() {
        let g = load("start: \"a\"+", "start", false).unwrap();
        let budget = Budget::unlimited();
        budget.cancel();
        let err = EarleyParser::new(&g).parse(&g, "aaaa", &budget).unwrap_err();
        assert_eq!(err, ParseFailure::Interrupted);
    }
}
