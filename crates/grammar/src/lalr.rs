//! LALR(1) backend.
//!
//! Tables are built from the LR(0) automaton with lookaheads computed by
//! spontaneous generation and propagation. Shift/reduce conflicts resolve
//! to shift (with a warning); reduce/reduce conflicts reject the grammar.
//! At parse time each state only lexes the terminals it can act on.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::budget::Budget;
use crate::error::{CompileError, GrammarError, ParseFailure};
use crate::load::{Grammar, Symbol};
use crate::scan::Scanner;
use crate::tree::{self, Tree};

type Item = (usize, usize);
type Lookaheads = BTreeSet<usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Shift(usize),
    Reduce(usize),
    Accept,
}

#[derive(Debug)]
pub struct LalrTables {
    actions: Vec<HashMap<usize, Action>>,
    gotos: Vec<HashMap<usize, usize>>,
    /// Per state: terminals the contextual lexer may produce
    allowed: Vec<Vec<bool>>,
    end: usize,
}

// ──────────────────────────────────────────────
// Table construction
// ──────────────────────────────────────────────

struct Builder<'g> {
    grammar: &'g Grammar,
    /// Grammar productions plus the augmented `$root -> start` at the end
    rhs: Vec<Vec<Symbol>>,
    augmented: usize,
    nullable: Vec<bool>,
    first: Vec<Lookaheads>,
    /// `$END`
    end: usize,
    /// Propagation marker used while computing lookaheads
    marker: usize,
}

fn interrupted(budget: &Budget) -> Result<(), CompileError> {
    budget.check().map_err(|_| CompileError::Interrupted)
}

pub fn build(grammar: &Grammar, budget: &Budget, warnings: &mut Vec<String>) -> Result<LalrTables, CompileError> {
    let mut rhs: Vec<Vec<Symbol>> = grammar.productions.iter().map(|p| p.rhs.clone()).collect();
    let augmented = rhs.len();
    rhs.push(vec![Symbol::Rule(grammar.start)]);

    let end = grammar.terminals.len();
    let nullable = grammar.nullable();
    let first = first_sets(grammar, &nullable);
    let builder = Builder {
        grammar,
        rhs,
        augmented,
        nullable,
        first,
        end,
        marker: end + 1,
    };

    let (kernels, transitions) = builder.lr0_automaton(budget)?;
    let lookaheads = builder.lookaheads(&kernels, &transitions, budget)?;

    let mut actions: Vec<HashMap<usize, Action>> = Vec::with_capacity(kernels.len());
    let mut gotos: Vec<HashMap<usize, usize>> = Vec::with_capacity(kernels.len());

    for (state, kernel) in kernels.iter().enumerate() {
        interrupted(budget)?;
        let mut action = HashMap::new();
        let mut goto = HashMap::new();
        for (sym, target) in &transitions[state] {
            match sym {
                Symbol::Terminal(t) => {
                    action.insert(*t, Action::Shift(*target));
                }
                Symbol::Rule(r) => {
                    goto.insert(*r, *target);
                }
            }
        }

        let seeds: Vec<(Item, Lookaheads)> = kernel
            .iter()
            .cloned()
            .zip(lookaheads[state].iter().cloned())
            .collect();
        for ((prod, dot), la) in builder.closure(seeds) {
            if dot < builder.rhs[prod].len() {
                continue;
            }
            if prod == augmented {
                action.insert(end, Action::Accept);
                continue;
            }
            for t in la {
                match action.get(&t).copied() {
                    None => {
                        action.insert(t, Action::Reduce(prod));
                    }
                    Some(Action::Shift(_)) => {
                        warnings.push(format!(
                            "Shift/Reduce conflict for terminal {}: (resolving as shift)\n * {}",
                            builder.term_name(t),
                            grammar.describe_production(prod)
                        ));
                    }
                    Some(Action::Reduce(other)) if other != prod => {
                        return Err(GrammarError::new(format!(
                            "Reduce/Reduce collision in {} between the following rules:\n\t- {}\n\t- {}",
                            builder.term_name(t),
                            grammar.describe_production(other),
                            grammar.describe_production(prod)
                        ))
                        .into());
                    }
                    Some(_) => {}
                }
            }
        }
        actions.push(action);
        gotos.push(goto);
    }

    let allowed = actions
        .iter()
        .map(|action| {
            let mut mask = vec![false; end];
            for t in action.keys() {
                if *t < end {
                    mask[*t] = true;
                }
            }
            mask
        })
        .collect();

    tracing::debug!(states = kernels.len(), "built LALR(1) tables");
    Ok(LalrTables {
        actions,
        gotos,
        allowed,
        end,
    })
}

fn first_sets(grammar: &Grammar, nullable: &[bool]) -> Vec<Lookaheads> {
    let mut first = vec![Lookaheads::new(); grammar.rules.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for p in &grammar.productions {
            let mut add = Lookaheads::new();
            for sym in &p.rhs {
                match sym {
                    Symbol::Terminal(t) => {
                        add.insert(*t);
                        break;
                    }
                    Symbol::Rule(r) => {
                        add.extend(first[*r].iter().copied());
                        if !nullable[*r] {
                            break;
                        }
                    }
                }
            }
            let before = first[p.lhs].len();
            first[p.lhs].extend(add);
            changed |= first[p.lhs].len() != before;
        }
    }
    first
}

impl Builder<'_> {
    fn term_name(&self, t: usize) -> &str {
        self.grammar
            .terminals
            .get(t)
            .map(|term| term.name.as_str())
            .unwrap_or("$END")
    }

    fn productions_of(&self, rule: usize) -> &[usize] {
        &self.grammar.by_lhs[rule]
    }

    fn first_of(&self, seq: &[Symbol]) -> (Lookaheads, bool) {
        let mut out = Lookaheads::new();
        for sym in seq {
            match sym {
                Symbol::Terminal(t) => {
                    out.insert(*t);
                    return (out, false);
                }
                Symbol::Rule(r) => {
                    out.extend(self.first[*r].iter().copied());
                    if !self.nullable[*r] {
                        return (out, false);
                    }
                }
            }
        }
        (out, true)
    }

    fn lr0_closure(&self, kernel: &[Item]) -> BTreeSet<Item> {
        let mut items: BTreeSet<Item> = kernel.iter().copied().collect();
        let mut work: Vec<Item> = kernel.to_vec();
        while let Some((prod, dot)) = work.pop() {
            if let Some(Symbol::Rule(r)) = self.rhs[prod].get(dot) {
                for &q in self.productions_of(*r) {
                    if items.insert((q, 0)) {
                        work.push((q, 0));
                    }
                }
            }
        }
        items
    }

    /// LR(0) kernels (sorted) and transitions per state.
    #[allow(clippy::type_complexity)]
    fn lr0_automaton(
        &self,
        budget: &Budget,
    ) -> Result<(Vec<Vec<Item>>, Vec<BTreeMap<Symbol, usize>>), CompileError> {
        let mut kernels: Vec<Vec<Item>> = vec![vec![(self.augmented, 0)]];
        let mut index: HashMap<Vec<Item>, usize> = HashMap::new();
        index.insert(kernels[0].clone(), 0);
        let mut transitions: Vec<BTreeMap<Symbol, usize>> = Vec::new();

        let mut state = 0;
        while state < kernels.len() {
            interrupted(budget)?;
            let mut moves: BTreeMap<Symbol, Vec<Item>> = BTreeMap::new();
            for (prod, dot) in self.lr0_closure(&kernels[state]) {
                if let Some(sym) = self.rhs[prod].get(dot) {
                    moves.entry(*sym).or_default().push((prod, dot + 1));
                }
            }

            let mut edges = BTreeMap::new();
            for (sym, mut kernel) in moves {
                kernel.sort_unstable();
                kernel.dedup();
                let target = match index.get(&kernel) {
                    Some(&t) => t,
                    None => {
                        let t = kernels.len();
                        index.insert(kernel.clone(), t);
                        kernels.push(kernel);
                        t
                    }
                };
                edges.insert(sym, target);
            }
            transitions.push(edges);
            state += 1;
        }
        Ok((kernels, transitions))
    }

    /// LR(1) closure where every item carries a lookahead set.
    fn closure(&self, seeds: Vec<(Item, Lookaheads)>) -> BTreeMap<Item, Lookaheads> {
        let mut items: BTreeMap<Item, Lookaheads> = BTreeMap::new();
        let mut work = Vec::new();
        for (item, la) in seeds {
            items.entry(item).or_default().extend(la);
            work.push(item);
        }
        while let Some((prod, dot)) = work.pop() {
            let Some(Symbol::Rule(r)) = self.rhs[prod].get(dot) else {
                continue;
            };
            let (mut la, nullable) = self.first_of(&self.rhs[prod][dot + 1..]);
            if nullable {
                if let Some(parent) = items.get(&(prod, dot)) {
                    la.extend(parent.iter().copied());
                }
            }
            for &q in self.productions_of(*r) {
                let is_new = !items.contains_key(&(q, 0));
                let entry = items.entry((q, 0)).or_default();
                let before = entry.len();
                entry.extend(la.iter().copied());
                if is_new || entry.len() != before {
                    work.push((q, 0));
                }
            }
        }
        items
    }

    /// Lookahead sets for every kernel item of every state.
    fn lookaheads(
        &self,
        kernels: &[Vec<Item>],
        transitions: &[BTreeMap<Symbol, usize>],
        budget: &Budget,
    ) -> Result<Vec<Vec<Lookaheads>>, CompileError> {
        let mut la: Vec<Vec<Lookaheads>> = kernels
            .iter()
            .map(|k| vec![Lookaheads::new(); k.len()])
            .collect();
        la[0][0].insert(self.end);

        let mut links: Vec<((usize, usize), (usize, usize))> = Vec::new();
        for (state, kernel) in kernels.iter().enumerate() {
            interrupted(budget)?;
            for (k, item) in kernel.iter().enumerate() {
                let seed = vec![(*item, Lookaheads::from([self.marker]))];
                for ((prod, dot), set) in self.closure(seed) {
                    let Some(sym) = self.rhs[prod].get(dot) else {
                        continue;
                    };
                    let Some(&target) = transitions[state].get(sym) else {
                        continue;
                    };
                    let Ok(slot) = kernels[target].binary_search(&(prod, dot + 1)) else {
                        continue;
                    };
                    for a in set {
                        if a == self.marker {
                            links.push(((state, k), (target, slot)));
                        } else {
                            la[target][slot].insert(a);
                        }
                    }
                }
            }
        }

        let mut changed = true;
        while changed {
            interrupted(budget)?;
            changed = false;
            for &((from_state, from_item), (to_state, to_item)) in &links {
                if from_state == to_state && from_item == to_item {
                    continue;
                }
                let source = la[from_state][from_item].clone();
                let dest = &mut la[to_state][to_item];
                let before = dest.len();
                dest.extend(source);
                changed |= dest.len() != before;
            }
        }
        Ok(la)
    }
}

// ──────────────────────────────────────────────
// Parsing
// ──────────────────────────────────────────────

impl LalrTables {
    pub fn state_count(&self) -> usize {
        self.actions.len()
    }

    pub fn parse(&self, grammar: &Grammar, text: &str, budget: &Budget) -> Result<Tree, ParseFailure> {
        let mut scanner = Scanner::new(text);
        let mut states: Vec<usize> = vec![0];
        let mut values: Vec<Vec<Tree>> = Vec::new();
        let mut lookahead = scanner.next(grammar, Some(&self.allowed[0]), budget)?;

        loop {
            budget.check()?;
            let state = states.last().copied().unwrap_or(0);
            let terminal = lookahead.as_ref().map_or(self.end, |l| l.terminal);

            match self.actions[state].get(&terminal).copied() {
                Some(Action::Shift(next)) => {
                    if let Some(lexeme) = lookahead.take() {
                        values.push(vec![Tree::Token(lexeme.token)]);
                    }
                    states.push(next);
                    lookahead = scanner.next(grammar, Some(&self.allowed[next]), budget)?;
                }
                Some(Action::Reduce(prod)) => {
                    let production = &grammar.productions[prod];
                    let n = production.rhs.len();
                    let slots = values.split_off(values.len() - n);
                    states.truncate(states.len() - n);
                    let top = states.last().copied().unwrap_or(0);
                    let Some(&next) = self.gotos[top].get(&production.lhs) else {
                        return Err(self.unexpected(grammar, state, lookahead, &scanner));
                    };
                    values.push(tree::reduce(grammar, production, slots));
                    states.push(next);
                }
                Some(Action::Accept) => {
                    return Ok(tree::finish(grammar, values.pop().unwrap_or_default()));
                }
                None => return Err(self.unexpected(grammar, state, lookahead, &scanner)),
            }
        }
    }

    fn unexpected(
        &self,
        grammar: &Grammar,
        state: usize,
        lookahead: Option<crate::scan::Lexeme>,
        scanner: &Scanner<'_>,
    ) -> ParseFailure {
        let mut expected: Vec<String> = self.actions[state]
            .keys()
            .map(|t| {
                grammar
                    .terminals
                    .get(*t)
                    .map_or_else(|| "$END".to_string(), |term| term.name.clone())
            })
            .collect();
        expected.sort();
        match lookahead {
            Some(lexeme) => ParseFailure::UnexpectedToken {
                terminal: lexeme.token.kind,
                value: lexeme.token.value,
                pos: lexeme.byte_pos,
                line: lexeme.token.line,
                column: lexeme.token.column,
                expected,
            },
            None => ParseFailure::UnexpectedEof {
                pos: scanner.byte_pos(),
                line: scanner.line(),
                column: scanner.column(),
                expected,
            },
        }
    }
}
