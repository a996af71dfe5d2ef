//! Seam between the live pipeline and the grammar implementation.

use std::sync::Arc;

use larkline_grammar::{Budget, CompileError, CompileOptions, ParseFailure, Tree};

/// A grammar compiled for one start rule and algorithm.
pub trait CompiledGrammar: Send + Sync {
    fn parse(&self, text: &str, budget: &Budget) -> Result<Tree, ParseFailure>;

    fn rule_count(&self) -> usize;

    fn terminal_count(&self) -> usize;

    /// Construction warnings; only populated in debug mode.
    fn warnings(&self) -> &[String];
}

/// Builds [`CompiledGrammar`]s. Implementations must be deterministic:
/// the same source and options always produce an equivalent parser or the
/// same error.
pub trait GrammarEngine: Send + Sync {
    fn compile(
        &self,
        grammar: &str,
        options: &CompileOptions,
        budget: &Budget,
    ) -> Result<Arc<dyn CompiledGrammar>, CompileError>;
}

/// Engine backed by `larkline-grammar`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LarkEngine;

impl GrammarEngine for LarkEngine {
    fn compile(
        &self,
        grammar: &str,
        options: &CompileOptions,
        budget: &Budget,
    ) -> Result<Arc<dyn CompiledGrammar>, CompileError> {
        let compiled = larkline_grammar::compile(grammar, options, budget)?;
        Ok(Arc::new(compiled))
    }
}

impl CompiledGrammar for larkline_grammar::CompiledGrammar {
    fn parse(&self, text: &str, budget: &Budget) -> Result<Tree, ParseFailure> {
        larkline_grammar::CompiledGrammar::parse(self, text, budget)
    }

    fn rule_count(&self) -> usize {
        larkline_grammar::CompiledGrammar::rule_count(self)
    }

    fn terminal_count(&self) -> usize {
        larkline_grammar::CompiledGrammar::terminal_count(self)
    }

    fn warnings(&self) -> &[String] {
        larkline_grammar::CompiledGrammar::warnings(self)
    }
}
