//! Callback URL templates such as
//! `https://me.example/webhooks/{task_type}/{agent_id}?op={operation_id}`.
//!
//! Values before the `?` are encoded as path segments, values after it as
//! query components.

use std::fmt;
use std::str::FromStr;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// RFC 3986 unreserved characters plus `:` and `@`, which are legal in a segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b':')
    .remove(b'@');

/// Unreserved only: `&`, `=`, `+` and `#` must not leak into the query.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Why a callback URL template was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlTemplateError {
    /// Only `{task_type}`, `{agent_id}`, `{operation_id}` are allowed.
    #[error("unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),
    /// A brace without its partner.
    #[error("unbalanced brace at byte {0}")]
    Unbalanced(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    TaskType,
    AgentId,
    OperationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Value { placeholder: Placeholder, in_query: bool },
}

/// Parsed callback URL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackUrlTemplate {
    raw: String,
    pieces: Vec<Piece>,
}

impl CallbackUrlTemplate {
    /// Parse and validate a template.
    pub fn parse(template: &str) -> Result<Self, UrlTemplateError> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut in_query = false;
        let mut chars = template.char_indices();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (inner_pos, inner) in chars.by_ref() {
                        match inner {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return Err(UrlTemplateError::Unbalanced(inner_pos)),
                            other => name.push(other),
                        }
                    }
                    if !closed {
                        return Err(UrlTemplateError::Unbalanced(pos));
                    }
                    let placeholder = match name.as_str() {
                        "task_type" => Placeholder::TaskType,
                        "agent_id" => Placeholder::AgentId,
                        "operation_id" => Placeholder::OperationId,
                        _ => return Err(UrlTemplateError::UnknownPlaceholder(name)),
                    };
                    if !literal.is_empty() {
                        pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    }
                    pieces.push(Piece::Value {
                        placeholder,
                        in_query,
                    });
                }
                '}' => return Err(UrlTemplateError::Unbalanced(pos)),
                '?' => {
                    in_query = true;
                    literal.push(c);
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        Ok(Self {
            raw: template.to_owned(),
            pieces,
        })
    }

    /// Substitute the current operation's identifiers.
    pub fn render(&self, task_type: &str, agent_id: &str, operation_id: &str) -> String {
        let mut out = String::with_capacity(self.raw.len() + 64);
        for piece in &self.pieces {
            match piece {
                Piece::Literal(s) => out.push_str(s),
                Piece::Value {
                    placeholder,
                    in_query,
                } => {
                    let value = match placeholder {
                        Placeholder::TaskType => task_type,
                        Placeholder::AgentId => agent_id,
                        Placeholder::OperationId => operation_id,
                    };
                    let set = if *in_query { QUERY_COMPONENT } else { PATH_SEGMENT };
                    out.extend(utf8_percent_encode(value, set));
                }
            }
        }
        out
    }

    /// The template as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for CallbackUrlTemplate {
    type Err = UrlTemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CallbackUrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
