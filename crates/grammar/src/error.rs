use serde::Serialize;

/// A grammar construction error: the grammar source is malformed or
/// cannot be turned into parse tables for the selected algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct GrammarError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl GrammarError {
    pub fn new(message: impl Into<String>) -> Self {
        GrammarError {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    /// An error pinned to a position in the grammar source.
    pub fn at(line: u32, column: u32, message: impl Into<String>) -> Self {
        GrammarError {
            message: message.into(),
            line: Some(line),
            column: Some(column),
        }
    }

    pub fn undefined_rule(name: &str) -> Self {
        GrammarError::new(format!("Using an undefined rule: {}", name))
    }

    pub fn undefined_terminal(name: &str) -> Self {
        GrammarError::new(format!("Using an undefined terminal: {}", name))
    }
}

/// Failure of [`crate::compile`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Grammar(#[from] GrammarError),
    /// The compile budget ran out before the tables were finished.
    #[error("grammar compilation interrupted")]
    Interrupted,
}

/// Failure to parse a sample text with a compiled grammar.
///
/// `pos` is a byte offset into the parsed text; `line`/`column` are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    #[error("Unexpected token {terminal}('{value}') at line {line}, column {column}. Expected one of: {}", .expected.join(", "))]
    UnexpectedToken {
        terminal: String,
        value: String,
        pos: usize,
        line: u32,
        column: u32,
        expected: Vec<String>,
    },
    #[error("No terminal matches '{character}' in the current parser context, at line {line} col {column}")]
    UnexpectedCharacters {
        character: char,
        pos: usize,
        line: u32,
        column: u32,
        expected: Vec<String>,
    },
    #[error("Unexpected end-of-input. Expected one of: {}", .expected.join(", "))]
    UnexpectedEof {
        pos: usize,
        line: u32,
        column: u32,
        expected: Vec<String>,
    },
    /// The parse budget ran out (deadline passed or cancelled by the caller).
    #[error("parse interrupted")]
    Interrupted,
}

impl ParseFailure {
    pub fn line(&self) -> Option<u32> {
        match self {
            ParseFailure::UnexpectedToken { line, .. }
            | ParseFailure::UnexpectedCharacters { line, .. }
            | ParseFailure::UnexpectedEof { line, .. } => Some(*line),
            ParseFailure::Interrupted => None,
        }
    }

    pub fn column(&self) -> Option<u32> {
        match self {
            ParseFailure::UnexpectedToken { column, .. }
            | ParseFailure::UnexpectedCharacters { column, .. }
            | ParseFailure::UnexpectedEof { column, .. } => Some(*column),
            ParseFailure::Interrupted => None,
        }
    }

    fn pos(&self) -> Option<usize> {
        match self {
            ParseFailure::UnexpectedToken { pos, .. }
            | ParseFailure::UnexpectedCharacters { pos, .. }
            | ParseFailure::UnexpectedEof { pos, .. } => Some(*pos),
            ParseFailure::Interrupted => None,
        }
    }

    /// A two-line excerpt of `text` around the failure position with a caret
    /// under the offending column. Looks at most `span` bytes to either side.
    pub fn context(&self, text: &str, span: usize) -> Option<String> {
        let pos = self.pos()?.min(text.len());
        let start = floor_char_boundary(text, pos.saturating_sub(span));
        let end = floor_char_boundary(text, (pos + span).min(text.len()));

        let before = text[start..pos].rsplit('\n').next().unwrap_or("");
        let after = text[pos..end].split('\n').next().unwrap_or("");
        let indent: usize = before
            .chars()
            .map(|c| if c == '\t' { 8 } else { 1 })
            .sum();

        Some(format!("{}{}\n{}^\n", before, after, " ".repeat(indent)))
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_points_at_failure_column() {
        let failure = ParseFailure::UnexpectedCharacters {
            character: '?',
            pos: 8,
            line: 2,
            column: 3,
            expected: vec![],
        };
        let ctx = failure.context("first\nab?cd\nlast", 40).unwrap();
        assert_eq!(ctx, "ab?cd\n  ^\n");
    }

    #[test]
    fn interrupted_has_no_location() {
        let failure = ParseFailure::Interrupted;
        assert_eq!(failure.line(), None);
        assert_eq!(failure.context("abc", 10), None);
    }

    #[test]
    fn unexpected_token_message_lists_expected() {
        let failure = ParseFailure::UnexpectedToken {
            terminal: "NUMBER".into(),
            value: "5".into(),
            pos: 2,
            line: 1,
            column: 3,
            expected: vec!["PLUS".into(), "MINUS".into()],
        };
        assert_eq!(
            failure.to_string(),
            "Unexpected token NUMBER('5') at line 1, column 3. Expected one of: PLUS, MINUS"
        );
    }
}
