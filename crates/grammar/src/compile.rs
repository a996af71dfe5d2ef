use serde::{Deserialize, Serialize};

use crate::budget::Budget;
use crate::earley::EarleyParser;
use crate::error::{CompileError, GrammarError, ParseFailure};
use crate::lalr::{self, LalrTables};
use crate::load::{load, Grammar};
use crate::tree::Tree;

/// Parsing algorithm selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Earley,
    Lalr,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Earley => "earley",
            Algorithm::Lalr => "lalr",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = GrammarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earley" => Ok(Algorithm::Earley),
            "lalr" => Ok(Algorithm::Lalr),
            other => Err(GrammarError::new(format!(
                "unsupported parser '{}': expected 'earley' or 'lalr'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub start: String,
    pub algorithm: Algorithm,
    /// Keep construction warnings (unused definitions, resolved conflicts)
    pub debug: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            start: "start".to_string(),
            algorithm: Algorithm::Earley,
            debug: false,
        }
    }
}

#[derive(Debug)]
enum Backend {
    Earley(EarleyParser),
    Lalr(LalrTables),
}

/// A grammar ready to parse any number of texts.
#[derive(Debug)]
pub struct CompiledGrammar {
    grammar: Grammar,
    backend: Backend,
    warnings: Vec<String>,
}

/// Build a parser for `source`.
pub fn compile(source: &str, options: &CompileOptions, budget: &Budget) -> Result<CompiledGrammar, CompileError> {
    let mut grammar = load(source, &options.start, options.debug)?;
    budget.check().map_err(|_| CompileError::Interrupted)?;

    let mut warnings = std::mem::take(&mut grammar.warnings);
    let backend = match options.algorithm {
        Algorithm::Earley => Backend::Earley(EarleyParser::new(&grammar)),
        Algorithm::Lalr => {
            let mut conflicts = Vec::new();
            let tables = lalr::build(&grammar, budget, &mut conflicts)?;
            if options.debug {
                warnings.extend(conflicts);
            }
            Backend::Lalr(tables)
        }
    };

    if options.debug {
        for warning in &warnings {
            tracing::warn!(algorithm = %options.algorithm, "{}", warning);
        }
    }
    tracing::debug!(
        algorithm = %options.algorithm,
        rules = grammar.productions.len(),
        terminals = grammar.terminals.len(),
        "grammar compiled"
    );

    Ok(CompiledGrammar {
        grammar,
        backend,
        warnings,
    })
}

impl CompiledGrammar {
    pub fn parse(&self, text: &str, budget: &Budget) -> Result<Tree, ParseFailure> {
        match &self.backend {
            Backend::Earley(parser) => parser.parse(&self.grammar, text, budget),
            Backend::Lalr(tables) => tables.parse(&self.grammar, text, budget),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self.backend {
            Backend::Earley(_) => Algorithm::Earley,
            Backend::Lalr(_) => Algorithm::Lalr,
        }
    }

    /// Number of BNF productions after EBNF expansion.
    pub fn rule_count(&self) -> usize {
        self.grammar.productions.len()
    }

    /// Number of terminals the lexer matches.
    pub fn terminal_count(&self) -> usize {
        self.grammar.terminals.len()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_names() {
        assert_eq!("lalr".parse::<Algorithm>().unwrap(), Algorithm::Lalr);
        assert!("cyk".parse::<Algorithm>().is_err());
        assert_eq!(serde_json::to_string(&Algorithm::Earley).unwrap(), "\"earley\"");
    }

    #[test]
    fn conflict_warnings_only_in_debug() {
        let src = "start: stmt\nstmt: \"if\" stmt | \"if\" stmt \"else\" stmt | \"x\"\n%ignore \" \"";
        let mut options = CompileOptions {
            algorithm: Algorithm::Lalr,
            ..CompileOptions::default()
        };
        let quiet = compile(src, &options, &Budget::unlimited()).unwrap();
        assert!(quiet.warnings().is_empty());

        options.debug = true;
        let verbose = compile(src, &options, &Budget::unlimited()).unwrap();
        assert_eq!(verbose.warnings().len(), 1);
    }

    #[test]
    fn exhausted_budget_interrupts_compilation() {
        let budget = Budget::unlimited();
        budget.cancel();
        let err = compile("start: \"a\"", &CompileOptions::default(), &budget).unwrap_err();
        assert_eq!(err, CompileError::Interrupted);
    }
}
