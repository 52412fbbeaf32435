// Workflow file errors
// Location-aware YAML errors and semantic errors raised while building a workflow

use crate::execution::graph::GraphError;

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{message}\n  --> line {line}:{column}\n{context}")]
    Yaml {
        message: String,
        line: usize,
        column: usize,
        /// Source lines around the error, with a column marker
        context: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("node '{node}' uses unknown step '{step}'")]
    UnknownStep { node: String, step: String },

    #[error("invalid reference '{reference}' for '{node}.{slot}': expected 'node.slot'")]
    InvalidReference {
        node: String,
        slot: String,
        reference: String,
    },

    #[error("invalid step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    YamlSyntax,
    Io,
    UnknownStep,
    InvalidReference,
    InvalidStep,
    Graph,
}

impl ParseError {
    pub fn kind(&self) -> ParseErrorKind {
        match self {
            ParseError::Yaml { .. } => ParseErrorKind::YamlSyntax,
            ParseError::Io(_) => ParseErrorKind::Io,
            ParseError::UnknownStep { .. } => ParseErrorKind::UnknownStep,
            ParseError::InvalidReference { .. } => ParseErrorKind::InvalidReference,
            ParseError::InvalidStep { .. } => ParseErrorKind::InvalidStep,
            ParseError::Graph(_) => ParseErrorKind::Graph,
        }
    }

    /// Create from a serde_yaml error, quoting the offending source lines
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));

        ParseError::Yaml {
            message: err.to_string(),
            line,
            column,
            context: source_context(source, line, column, 2),
        }
    }

    pub(crate) fn invalid_step(step: &str, reason: impl Into<String>) -> Self {
        ParseError::InvalidStep {
            step: step.to_string(),
            reason: reason.into(),
        }
    }
}

fn source_context(source: &str, line: usize, column: usize, context_lines: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let start = line.saturating_sub(context_lines + 1);
    let end = (line + context_lines).min(lines.len());

    let mut context = String::new();
    for (i, text) in lines.iter().enumerate().take(end).skip(start) {
        let line_num = i + 1;
        let prefix = if line_num == line { ">" } else { " " };
        context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, text));

        if line_num == line && column > 0 {
            context.push_str(&format!("       | {}^\n", " ".repeat(column - 1)));
        }
    }
    context
}
