//! Stage planning.
//!
//! Slices the instruction sequence into stages at `FROM` boundaries and
//! fingerprints each stage with the SHA-256 of its raw text. The hash
//! covers every byte the parser emitted for the stage, comments included,
//! so editing a comment reuses nothing — a documented property callers
//! rely on for cache invalidation.

use chmo_common::{ChmoError, ChmoResult};
use sha2::{Digest, Sha256};

use crate::recipe::{Instruction, Op};

/// A contiguous run of instructions beginning with `FROM`.
#[derive(Debug, Clone)]
pub struct Stage {
    /// The base image the stage builds on.
    pub base_ref: String,
    /// Name from `FROM <image> AS <name>`, if any.
    pub stage_name: Option<String>,
    /// The stage's instructions, `FROM` included.
    pub instructions: Vec<Instruction>,
    /// Concatenated raw lines in source order.
    pub content_text: String,
    /// Hex SHA-256 of `content_text`.
    pub hash: String,
    /// Whether this is the recipe's final stage.
    pub is_last: bool,
}

/// Slice instructions into stages.
///
/// A `FROM` closes the stage under construction once any non-comment
/// instruction has accumulated; comments never open or close a stage but
/// are part of the stage they sit in (and of its hash).
///
/// # Errors
///
/// [`ChmoError::NoBase`] if any emitted stage lacks a leading `FROM`
/// (including the empty recipe), [`ChmoError::RecipeParse`] for a
/// malformed `FROM` value.
pub fn plan(instructions: &[Instruction]) -> ChmoResult<Vec<Stage>> {
    let mut stages = Vec::new();
    let mut base: Option<(String, Option<String>)> = None;
    let mut current: Vec<Instruction> = Vec::new();
    let mut content = String::new();
    let mut has_body = false;

    for instruction in instructions {
        if instruction.op == Op::From {
            if has_body {
                stages.push(close_stage(base.take(), &mut current, &mut content, false)?);
                has_body = false;
            }
            base = Some(parse_from(&instruction.value)?);
        }
        if instruction.op != Op::Comment {
            has_body = true;
        }
        current.push(instruction.clone());
        content.push_str(&instruction.raw_line);
        content.push('\n');
    }

    stages.push(close_stage(base, &mut current, &mut content, true)?);

    tracing::info!(stages = stages.len(), "Planned recipe stages");
    Ok(stages)
}

fn close_stage(
    base: Option<(String, Option<String>)>,
    current: &mut Vec<Instruction>,
    content: &mut String,
    is_last: bool,
) -> ChmoResult<Stage> {
    let (base_ref, stage_name) = base.ok_or(ChmoError::NoBase)?;
    let content_text = std::mem::take(content);
    let hash = hex::encode(Sha256::digest(content_text.as_bytes()));
    Ok(Stage {
        base_ref,
        stage_name,
        instructions: std::mem::take(current),
        content_text,
        hash,
        is_last,
    })
}

/// Parse a `FROM` value: `<image>` or `<image> AS <name>`.
fn parse_from(value: &str) -> ChmoResult<(String, Option<String>)> {
    let tokens: Vec<&str> = value.split_whitespace().collect();
    match tokens.as_slice() {
        [image] => Ok(((*image).to_string(), None)),
        [image, kw, name] if kw.eq_ignore_ascii_case("as") => {
            Ok(((*image).to_string(), Some((*name).to_string())))
        }
        _ => Err(ChmoError::RecipeParse {
            line: format!("FROM {value}"),
        }),
    }
}
