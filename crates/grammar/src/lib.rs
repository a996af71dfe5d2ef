//! Lark-style grammar compiler with Earley and LALR(1) backends.
//!
//! ```text
//! source ──parser──> statements ──load──> BNF grammar ──compile──> CompiledGrammar
//!                                                                      │
//!                                              text ──parse(budget)────┴──> Tree
//! ```

pub mod ast;
pub mod budget;
pub mod compile;
pub mod earley;
pub mod error;
pub mod lalr;
pub mod lexer;
pub mod load;
pub mod parser;
pub mod scan;
pub mod tree;

pub use budget::Budget;
pub use compile::{compile, Algorithm, CompileOptions, CompiledGrammar};
pub use error::{CompileError, GrammarError, ParseFailure};
pub use tree::{Token, Tree};
