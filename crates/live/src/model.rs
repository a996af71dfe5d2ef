//! Wire-level data model shared by the HTTP API and the live protocol.

use larkline_grammar::{Algorithm, GrammarError, ParseFailure, Tree};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::LiveError;

/// Bytes of sample text shown on each side of a syntax error.
const CONTEXT_SPAN: usize = 40;

const MAX_START_RULE_LEN: usize = 100;

// ──────────────────────────────────────────────
// Settings
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseSettings {
    pub parser: Algorithm,
    pub start_rule: String,
    pub debug: bool,
}

impl Default for ParseSettings {
    fn default() -> Self {
        ParseSettings {
            parser: Algorithm::Earley,
            start_rule: "start".to_string(),
            debug: false,
        }
    }
}

impl ParseSettings {
    pub fn validate(&self) -> Result<(), LiveError> {
        validate_start_rule(&self.start_rule)
    }
}

fn validate_start_rule(rule: &str) -> Result<(), LiveError> {
    if rule.is_empty() || rule.chars().count() > MAX_START_RULE_LEN {
        return Err(LiveError::Validation(format!(
            "start_rule must be 1 to {} characters",
            MAX_START_RULE_LEN
        )));
    }
    if !rule
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(LiveError::Validation(format!(
            "start_rule '{}' may only contain letters, digits, '_' and '-'",
            rule
        )));
    }
    Ok(())
}

/// Partial settings update; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub parser: Option<Algorithm>,
    #[serde(default)]
    pub start_rule: Option<String>,
    #[serde(default)]
    pub debug: Option<bool>,
}

impl SettingsPatch {
    pub fn validate(&self) -> Result<(), LiveError> {
        match &self.start_rule {
            Some(rule) => validate_start_rule(rule),
            None => Ok(()),
        }
    }

    pub fn apply(&self, settings: &mut ParseSettings) {
        if let Some(parser) = self.parser {
            settings.parser = parser;
        }
        if let Some(rule) = &self.start_rule {
            settings.start_rule = rule.clone();
        }
        if let Some(debug) = self.debug {
            settings.debug = debug;
        }
    }
}

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Success,
    ParseError,
    InvalidGrammar,
    Timeout,
    InternalError,
}

impl ParseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseStatus::Success => "success",
            ParseStatus::ParseError => "parse_error",
            ParseStatus::InvalidGrammar => "invalid_grammar",
            ParseStatus::Timeout => "timeout",
            ParseStatus::InternalError => "internal_error",
        }
    }

    /// Outcomes that depend only on the inputs and may be served from cache.
    pub fn is_deterministic(self) -> bool {
        matches!(
            self,
            ParseStatus::Success | ParseStatus::ParseError | ParseStatus::InvalidGrammar
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    GrammarError,
    ParseError,
    TimeoutError,
    ValidationError,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
}

impl ErrorDetail {
    fn plain(kind: ErrorType, message: impl Into<String>) -> Self {
        ErrorDetail {
            kind,
            message: message.into(),
            line: None,
            column: None,
            context: None,
            suggestions: None,
        }
    }

    pub fn grammar(error: &GrammarError) -> Self {
        ErrorDetail {
            line: error.line,
            column: error.column,
            suggestions: Some(vec![
                "Check grammar syntax".to_string(),
                "Verify rule definitions".to_string(),
            ]),
            ..ErrorDetail::plain(ErrorType::GrammarError, error.to_string())
        }
    }

    /// A syntax error in `text`, with a caret excerpt around the failure.
    pub fn parse(failure: &ParseFailure, text: &str) -> Self {
        ErrorDetail {
            line: failure.line(),
            column: failure.column(),
            context: failure.context(text, CONTEXT_SPAN),
            ..ErrorDetail::plain(ErrorType::ParseError, failure.to_string())
        }
    }

    pub fn timeout() -> Self {
        ErrorDetail {
            suggestions: Some(vec![
                "Simplify grammar".to_string(),
                "Reduce input text size".to_string(),
            ]),
            ..ErrorDetail::plain(ErrorType::TimeoutError, "Parse operation timed out")
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ErrorDetail::plain(ErrorType::ValidationError, message)
    }

    /// Details stay in the server log; clients get a generic message.
    pub fn internal() -> Self {
        ErrorDetail::plain(ErrorType::InternalError, "Internal error while parsing")
    }

    /// Status of a result carrying this error.
    fn status(&self) -> ParseStatus {
        match self.kind {
            ErrorType::GrammarError => ParseStatus::InvalidGrammar,
            ErrorType::ParseError => ParseStatus::ParseError,
            ErrorType::TimeoutError => ParseStatus::Timeout,
            ErrorType::ValidationError | ErrorType::InternalError => ParseStatus::InternalError,
        }
    }
}

// ──────────────────────────────────────────────
// Trees and results
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AstNode {
    Tree {
        /// Rule name or alias
        data: String,
        children: Vec<AstNode>,
    },
    Token {
        /// Matched text
        data: String,
        /// Terminal name
        terminal: String,
        start_pos: Option<usize>,
        end_pos: Option<usize>,
        line: Option<u32>,
        column: Option<u32>,
    },
}

impl From<&Tree> for AstNode {
    fn from(tree: &Tree) -> Self {
        match tree {
            Tree::Node { rule, children } => AstNode::Tree {
                data: rule.clone(),
                children: children.iter().map(AstNode::from).collect(),
            },
            Tree::Token(tok) => AstNode::Token {
                data: tok.value.clone(),
                terminal: tok.kind.clone(),
                start_pos: Some(tok.start_pos),
                end_pos: Some(tok.end_pos),
                line: Some(tok.line),
                column: Some(tok.column),
            },
        }
    }
}

impl AstNode {
    pub fn label(&self) -> &str {
        match self {
            AstNode::Tree { data, .. } | AstNode::Token { data, .. } => data,
        }
    }
}

/// Outcome of one parse request.
///
/// A tree is present exactly when the status is `success`; every other
/// status carries an error instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseResult {
    status: ParseStatus,
    tree: Option<AstNode>,
    error: Option<ErrorDetail>,
    /// Seconds
    parse_time: f64,
    grammar_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

impl ParseResult {
    pub fn success(tree: AstNode, parse_time: f64, grammar_hash: impl Into<String>) -> Self {
        ParseResult {
            status: ParseStatus::Success,
            tree: Some(tree),
            error: None,
            parse_time,
            grammar_hash: grammar_hash.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn failure(error: ErrorDetail, parse_time: f64, grammar_hash: impl Into<String>) -> Self {
        ParseResult {
            status: error.status(),
            tree: None,
            error: Some(error),
            parse_time,
            grammar_hash: grammar_hash.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn status(&self) -> ParseStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == ParseStatus::Success
    }

    pub fn tree(&self) -> Option<&AstNode> {
        self.tree.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorDetail> {
        self.error.as_ref()
    }

    pub fn parse_time(&self) -> f64 {
        self.parse_time
    }

    pub fn grammar_hash(&self) -> &str {
        &self.grammar_hash
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    /// The same outcome reported under a different grammar fingerprint.
    pub fn with_grammar_hash(&self, grammar_hash: impl Into<String>) -> Self {
        ParseResult {
            grammar_hash: grammar_hash.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ErrorDetail>,
    pub warnings: Vec<String>,
    pub rule_count: usize,
    pub terminal_count: usize,
}

impl ValidationResult {
    pub fn valid(rule_count: usize, terminal_count: usize, warnings: Vec<String>) -> Self {
        ValidationResult {
            is_valid: true,
            errors: Vec::new(),
            warnings,
            rule_count,
            terminal_count,
        }
    }

    pub fn invalid(error: ErrorDetail) -> Self {
        ValidationResult {
            is_valid: false,
            errors: vec![error],
            warnings: Vec::new(),
            rule_count: 0,
            terminal_count: 0,
        }
    }
}

/// Snapshot of a session for clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub connection_count: usize,
    pub has_grammar: bool,
    pub has_text: bool,
    pub settings: ParseSettings,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub has_result: bool,
}
