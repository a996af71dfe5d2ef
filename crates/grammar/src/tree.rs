//! Syntax trees produced by the parser backends.

use crate::load::{Grammar, Production};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Terminal name
    pub kind: String,
    pub value: String,
    /// Character offsets into the parsed text
    pub start_pos: usize,
    pub end_pos: usize,
    /// 1-based
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tree {
    Node { rule: String, children: Vec<Tree> },
    Token(Token),
}

impl Tree {
    pub fn rule(&self) -> Option<&str> {
        match self {
            Tree::Node { rule, .. } => Some(rule),
            Tree::Token(_) => None,
        }
    }

    pub fn children(&self) -> &[Tree] {
        match self {
            Tree::Node { children, .. } => children,
            Tree::Token(_) => &[],
        }
    }

    /// All tokens in left-to-right order.
    pub fn tokens(&self) -> Vec<&Token> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Tree::Token(tok) => out.push(tok),
                Tree::Node { children, .. } => stack.extend(children.iter().rev()),
            }
        }
        out
    }
}

// ──────────────────────────────────────────────
// Tree shaping
// ──────────────────────────────────────────────

/// Builds the output tree for one reduction.
///
/// `slots` holds, per RHS position, what was parsed there: a single token for
/// terminals, or the (possibly spliced) children of a nonterminal. The
/// returned vector is what the parent sees in place of this production.
pub fn reduce(grammar: &Grammar, prod: &Production, slots: Vec<Vec<Tree>>) -> Vec<Tree> {
    let mut children = Vec::new();
    for (slot, keep) in slots.into_iter().zip(&prod.keep) {
        if *keep {
            children.extend(slot);
        }
    }

    if let Some(alias) = &prod.alias {
        return vec![Tree::Node {
            rule: alias.clone(),
            children,
        }];
    }

    let info = &grammar.rules[prod.lhs];
    if info.inline || (info.expand_single && children.len() == 1) {
        return children;
    }
    vec![Tree::Node {
        rule: info.name.clone(),
        children,
    }]
}

/// The tree for the start rule, which always has a root node.
pub fn finish(grammar: &Grammar, mut items: Vec<Tree>) -> Tree {
    if items.len() == 1 && matches!(items[0], Tree::Node { .. }) {
        return items.remove(0);
    }
    Tree::Node {
        rule: grammar.rules[grammar.start].name.clone(),
        children: items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(kind: &str, value: &str) -> Tree {
        Tree::Token(Token {
            kind: kind.into(),
            value: value.into(),
            start_pos: 0,
            end_pos: value.len(),
            line: 1,
            column: 1,
        })
    }

    #[test]
    fn tokens_are_listed_in_order() {
        let tree = Tree::Node {
            rule: "start".into(),
            children: vec![
                token("A", "a"),
                Tree::Node {
                    rule: "inner".into(),
                    children: vec![token("B", "b"), token("C", "c")],
                },
                token("D", "d"),
            ],
        };
        let values: Vec<&str> = tree.tokens().iter().map(|t| t.value.as_str()).collect();
        assert_eq!(values, vec!["a", "b", "c", "d"]);
    }
}
