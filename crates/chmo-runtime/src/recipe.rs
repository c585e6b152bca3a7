//! Recipe parsing.
//!
//! A recipe is a Dockerfile-compatible text. Parsing is pure tokenisation:
//! each logical line (backslash continuations joined) becomes one
//! [`Instruction`] whose op is the uppercased leading token. No variable
//! expansion, no interpretation of values.

use std::fmt;
use std::path::Path;

use chmo_common::ChmoResult;

/// Instruction opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// A `#` comment line.
    Comment,
    /// Opens a stage.
    From,
    /// Shell command inside the chroot.
    Run,
    /// Copy from host path, URL or tar.
    Add,
    /// Copy from a previous stage.
    Copy,
    /// Anything else, uppercased token preserved.
    Other(String),
}

impl Op {
    fn from_token(token: &str) -> Self {
        let upper = token.to_ascii_uppercase();
        match upper.as_str() {
            "FROM" => Self::From,
            "RUN" => Self::Run,
            "ADD" => Self::Add,
            "COPY" => Self::Copy,
            _ => Self::Other(upper),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Comment => write!(f, "COMMENT"),
            Self::From => write!(f, "FROM"),
            Self::Run => write!(f, "RUN"),
            Self::Add => write!(f, "ADD"),
            Self::Copy => write!(f, "COPY"),
            Self::Other(token) => write!(f, "{token}"),
        }
    }
}

/// One parsed recipe instruction. Immutable after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Opcode.
    pub op: Op,
    /// Everything after the opening token.
    pub value: String,
    /// The original logical line, continuations joined.
    pub raw_line: String,
}

/// Parse a recipe file into instructions.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn parse_file(path: &Path) -> ChmoResult<Vec<Instruction>> {
    let text = std::fs::read_to_string(path)?;
    parse_str(&text)
}

/// Parse recipe text into instructions.
///
/// Blank lines are dropped. A line ending in `\` continues on the next
/// line; the backslash itself is removed and the lines are joined as-is,
/// so interior whitespace stays byte-exact.
///
/// # Errors
///
/// Currently infallible; the signature leaves room for stricter lexing.
pub fn parse_str(text: &str) -> ChmoResult<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut pending: Option<String> = None;

    for raw in text.lines() {
        let line = match pending.take() {
            Some(mut acc) => {
                acc.push_str(raw);
                acc
            }
            None => raw.to_string(),
        };

        if let Some(head) = line.strip_suffix('\\') {
            pending = Some(head.to_string());
            continue;
        }

        if line.trim().is_empty() {
            continue;
        }

        instructions.push(tokenize(line));
    }

    // Trailing continuation with no successor line still counts.
    if let Some(line) = pending {
        if !line.trim().is_empty() {
            instructions.push(tokenize(line));
        }
    }

    tracing::debug!(count = instructions.len(), "Parsed recipe");
    Ok(instructions)
}

fn tokenize(line: String) -> Instruction {
    let trimmed = line.trim();

    if let Some(comment) = trimmed.strip_prefix('#') {
        return Instruction {
            op: Op::Comment,
            value: comment.trim().to_string(),
            raw_line: line,
        };
    }

    let mut split = trimmed.splitn(2, char::is_whitespace);
    let token = split.next().unwrap_or_default();
    let value = split.next().unwrap_or_default().trim_start().to_string();

    Instruction {
        op: Op::from_token(token),
        value,
        raw_line: line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_instructions() {
        let parsed = parse_str("FROM base AS builder\nRUN echo hi\n").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].op, Op::From);
        assert_eq!(parsed[0].value, "base AS builder");
        assert_eq!(parsed[0].raw_line, "FROM base AS builder");
        assert_eq!(parsed[1].op, Op::Run);
        assert_eq!(parsed[1].value, "echo hi");
    }

    #[test]
    fn comments_and_blanks() {
        let parsed = parse_str("# build recipe\n\nFROM base\n").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].op, Op::Comment);
        assert_eq!(parsed[0].value, "build recipe");
        assert_eq!(parsed[0].raw_line, "# build recipe");
    }

    #[test]
    fn lowercase_tokens_are_uppercased() {
        let parsed = parse_str("from base\nrun echo hi\n").unwrap();
        assert_eq!(parsed[0].op, Op::From);
        assert_eq!(parsed[1].op, Op::Run);
        // raw lines keep the original casing
        assert_eq!(parsed[0].raw_line, "from base");
    }

    #[test]
    fn unknown_tokens_become_other() {
        let parsed = parse_str("ENV FOO=bar\nWORKDIR /app\n").unwrap();
        assert_eq!(parsed[0].op, Op::Other("ENV".to_string()));
        assert_eq!(parsed[0].value, "FOO=bar");
        assert_eq!(parsed[1].op, Op::Other("WORKDIR".to_string()));
    }

    #[test]
    fn continuations_join_without_collapsing_whitespace() {
        let parsed = parse_str("RUN echo a \\\n  && echo b\n").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].op, Op::Run);
        assert_eq!(parsed[0].raw_line, "RUN echo a   && echo b");
    }

    #[test]
    fn trailing_continuation_is_kept() {
        let parsed = parse_str("RUN echo a \\").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].raw_line, "RUN echo a ");
    }

    #[test]
    fn interior_spacing_is_preserved() {
        let one = parse_str("RUN echo hi").unwrap();
        let two = parse_str("RUN echo  hi").unwrap();
        assert_ne!(one[0].raw_line, two[0].raw_line);
        assert_ne!(one[0].value, two[0].value);
    }

    #[test]
    fn op_display() {
        assert_eq!(Op::From.to_string(), "FROM");
        assert_eq!(Op::Other("HEALTHCHECK".to_string()).to_string(), "HEALTHCHECK");
    }
}
