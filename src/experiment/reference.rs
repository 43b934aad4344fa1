//! `${...}` references between experiment data, inputs and nodes.
//!
//! | Syntax                      | Meaning                                  |
//! |-----------------------------|------------------------------------------|
//! | `${data.<d>}`               | every row of data `d`                    |
//! | `${data.<d>.<column>}`      | one column of data `d`                   |
//! | `${inputs.<name>}`          | experiment input (node input in commands)|
//! | `${<node>.outputs}`         | outputs of an upstream node              |
//! | `${<node>.outputs.<col>}`   | one output field of an upstream node     |
//! | `${<node>.status}`          | terminal status of an upstream node      |
//! | `${outputs.<name>}`         | command run output location              |

use std::fmt;

use serde_json::Value;

use crate::{Error, Result};

/// Reserved first segments that cannot be node names.
pub const RESERVED_NAMES: [&str; 3] = ["data", "inputs", "outputs"];

/// A parsed reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// Experiment data, whole rows or one column
    Data {
        /// Data name
        name: String,
        /// Column, `None` for whole rows
        column: Option<String>,
    },
    /// Experiment input (or, inside a command string, the node's own input)
    Input {
        /// Input name
        name: String,
    },
    /// Output of an upstream node
    NodeOutput {
        /// Upstream node
        node: String,
        /// Field, `None` for the whole output
        column: Option<String>,
    },
    /// Terminal status of an upstream node
    NodeStatus {
        /// Upstream node
        node: String,
    },
    /// Output location of the command run itself
    RunOutput {
        /// Output name
        name: String,
    },
}

impl Reference {
    /// Parse a whole value. Non-strings and strings that are not exactly one
    /// `${...}` are literals (`Ok(None)`).
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for a malformed `${...}`
    pub fn from_value(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::String(text) => Self::parse(text),
            _ => Ok(None),
        }
    }

    /// Parse a string that may be a reference.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for a malformed `${...}`
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let trimmed = text.trim();
        match trimmed
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        {
            Some(inner) if !inner.contains("${") => Self::parse_inner(inner).map(Some),
            _ => Ok(None),
        }
    }

    fn parse_inner(inner: &str) -> Result<Self> {
        let parts: Vec<&str> = inner.trim().split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(malformed(inner));
        }
        let rest = |from: usize| (parts.len() > from).then(|| parts[from..].join("."));
        match parts.as_slice() {
            ["data", name, ..] => Ok(Self::Data {
                name: (*name).to_string(),
                column: rest(2),
            }),
            ["inputs", name] => Ok(Self::Input {
                name: (*name).to_string(),
            }),
            ["outputs", name] => Ok(Self::RunOutput {
                name: (*name).to_string(),
            }),
            [node, "outputs", ..] => Ok(Self::NodeOutput {
                node: (*node).to_string(),
                column: rest(2),
            }),
            [node, "status"] => Ok(Self::NodeStatus {
                node: (*node).to_string(),
            }),
            _ => Err(malformed(inner)),
        }
    }

    /// Node this reference depends on, if any.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::NodeOutput { node, .. } | Self::NodeStatus { node } => Some(node),
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data { name, column: None } => write!(f, "${{data.{name}}}"),
            Self::Data {
                name,
                column: Some(column),
            } => write!(f, "${{data.{name}.{column}}}"),
            Self::Input { name } => write!(f, "${{inputs.{name}}}"),
            Self::NodeOutput { node, column: None } => write!(f, "${{{node}.outputs}}"),
            Self::NodeOutput {
                node,
                column: Some(column),
            } => write!(f, "${{{node}.outputs.{column}}}"),
            Self::NodeStatus { node } => write!(f, "${{{node}.status}}"),
            Self::RunOutput { name } => write!(f, "${{outputs.{name}}}"),
        }
    }
}

fn malformed(inner: &str) -> Error {
    Error::Validation(format!("malformed reference '${{{inner}}}'"))
}

/// Every reference embedded in a template string such as a command line.
///
/// # Errors
/// Returns [`Error::Validation`] for malformed or unterminated references
pub fn references_in(template: &str) -> Result<Vec<Reference>> {
    let mut found = Vec::new();
    interpolate(template, |reference| {
        found.push(reference.clone());
        Ok(String::new())
    })?;
    Ok(found)
}

/// Replace every `${...}` in `template` with `resolve(reference)`.
///
/// # Errors
/// Returns [`Error::Validation`] for malformed or unterminated references,
/// or whatever `resolve` fails with
pub fn interpolate(
    template: &str,
    mut resolve: impl FnMut(&Reference) -> Result<String>,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            Error::Validation(format!("unterminated reference in '{template}'"))
        })?;
        let reference = Reference::parse_inner(&after[..end])?;
        out.push_str(&resolve(&reference)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_shapes() {
        assert_eq!(
            Reference::parse("${data.my_data.question}").unwrap(),
            Some(Reference::Data {
                name: "my_data".to_string(),
                column: Some("question".to_string())
            })
        );
        assert_eq!(
            Reference::parse("${main.outputs}").unwrap(),
            Some(Reference::NodeOutput {
                node: "main".to_string(),
                column: None
            })
        );
        assert_eq!(
            Reference::parse(" ${main.status} ").unwrap(),
            Some(Reference::NodeStatus {
                node: "main".to_string()
            })
        );
        assert_eq!(
            Reference::parse("${inputs.count}").unwrap(),
            Some(Reference::Input {
                name: "count".to_string()
            })
        );
    }

    #[test]
    fn test_literals_are_not_references() {
        assert_eq!(Reference::parse("plain text").unwrap(), None);
        assert_eq!(Reference::parse("a ${b.outputs} c").unwrap(), None);
        assert_eq!(Reference::from_value(&json!(3)).unwrap(), None);
    }

    #[test]
    fn test_malformed_references_fail() {
        assert!(Reference::parse("${main}").is_err());
        assert!(Reference::parse("${main..outputs}").is_err());
        assert!(Reference::parse("${main.result}").is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for text in ["${data.d.c}", "${data.d}", "${n.outputs.x}", "${n.status}", "${outputs.model}"] {
            let reference = Reference::parse(text).unwrap().unwrap();
            assert_eq!(reference.to_string(), text);
        }
    }

    #[test]
    fn test_interpolate_command() {
        let command = "python eval.py --data ${data.d} --out ${outputs.report}";
        let rendered = interpolate(command, |r| match r {
            Reference::Data { name, .. } => Ok(format!("/data/{name}.jsonl")),
            Reference::RunOutput { name } => Ok(format!("/out/{name}")),
            other => Err(Error::Validation(format!("unexpected {other}"))),
        })
        .unwrap();
        assert_eq!(rendered, "python eval.py --data /data/d.jsonl --out /out/report");
        assert_eq!(references_in(command).unwrap().len(), 2);
        assert!(references_in("echo ${oops").is_err());
    }
}
