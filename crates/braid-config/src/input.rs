//! Typed input expressions for node templates.
//!
//! Pipeline files write node inputs as a JSON array. String entries carrying
//! a sigil are references; everything else is a literal.
//!
//! ```json
//! {
//!   "input": [
//!     "@flowInput.files",   // flow input lookup
//!     "@green.data.0",      // result of node `green`, then path `data.0`
//!     "#@flowInput.files",  // batch: one task per array element
//!     "#[1, 2, 3]",         // batch over a literal array
//!     "*@red|@blue",        // wait-any: first of `red` or `blue` to succeed
//!     42                    // literal
//!   ]
//! }
//! ```
//!
//! The strings are parsed once into [`InputExpr`] at deserialization time and
//! printed back in the same syntax when serialized.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const NODE_SIGIL: char = '@';
const BATCH_SIGIL: char = '#';
const WAIT_ANY_SIGIL: char = '*';
const WAIT_ANY_SEPARATOR: char = '|';
const FLOW_INPUT: &str = "flowInput";

/// Errors produced while parsing an input expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputParseError {
  #[error("empty reference in '{expr}'")]
  EmptyReference { expr: String },

  #[error("batch source in '{expr}' must be a reference or a JSON array")]
  InvalidBatchSource { expr: String },

  #[error("wait-any alternative '{alternative}' must reference a node")]
  InvalidWaitAny { alternative: String },
}

/// A reference to another node's result, optionally narrowed by a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
  pub node: String,
  pub path: Vec<String>,
}

impl NodeRef {
  pub fn new(node: impl Into<String>) -> Self {
    Self {
      node: node.into(),
      path: Vec::new(),
    }
  }
}

/// Where a batch node gets the array it fans out over.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchSource {
  Node(NodeRef),
  FlowInput { path: Vec<String> },
  Literal(Vec<Value>),
}

/// One entry of a node's input array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum InputExpr {
  Literal(Value),
  Node(NodeRef),
  FlowInput { path: Vec<String> },
  Batch(BatchSource),
  WaitAny(Vec<NodeRef>),
}

impl InputExpr {
  /// Node names referenced by this expression.
  pub fn node_references(&self) -> Vec<&str> {
    match self {
      InputExpr::Node(r) | InputExpr::Batch(BatchSource::Node(r)) => vec![r.node.as_str()],
      InputExpr::WaitAny(alternatives) => alternatives.iter().map(|r| r.node.as_str()).collect(),
      _ => Vec::new(),
    }
  }

  /// Parse a single JSON input entry.
  pub fn parse_value(value: Value) -> Result<Self, InputParseError> {
    match value {
      Value::String(s) => s.parse(),
      other => Ok(InputExpr::Literal(other)),
    }
  }
}

/// Split `name.a.b` into its reference name and path segments.
fn split_path(body: &str, expr: &str) -> Result<(String, Vec<String>), InputParseError> {
  let mut segments = body.split('.');
  let head = segments.next().unwrap_or_default();
  if head.is_empty() {
    return Err(InputParseError::EmptyReference {
      expr: expr.to_string(),
    });
  }
  let path: Vec<String> = segments.map(str::to_string).collect();
  if path.iter().any(|p| p.is_empty()) {
    return Err(InputParseError::EmptyReference {
      expr: expr.to_string(),
    });
  }
  Ok((head.to_string(), path))
}

/// Parse the part after an `@` sigil.
fn parse_reference(body: &str, expr: &str) -> Result<InputExpr, InputParseError> {
  let (head, path) = split_path(body, expr)?;
  if head == FLOW_INPUT {
    Ok(InputExpr::FlowInput { path })
  } else {
    Ok(InputExpr::Node(NodeRef { node: head, path }))
  }
}

impl FromStr for InputExpr {
  type Err = InputParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Some(body) = s.strip_prefix(NODE_SIGIL) {
      return parse_reference(body, s);
    }

    if let Some(body) = s.strip_prefix(BATCH_SIGIL) {
      if let Some(reference) = body.strip_prefix(NODE_SIGIL) {
        return match parse_reference(reference, s)? {
          InputExpr::FlowInput { path } => Ok(InputExpr::Batch(BatchSource::FlowInput { path })),
          InputExpr::Node(r) => Ok(InputExpr::Batch(BatchSource::Node(r))),
          _ => Err(InputParseError::InvalidBatchSource {
            expr: s.to_string(),
          }),
        };
      }
      return match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => Ok(InputExpr::Batch(BatchSource::Literal(items))),
        _ => Err(InputParseError::InvalidBatchSource {
          expr: s.to_string(),
        }),
      };
    }

    if let Some(body) = s.strip_prefix(WAIT_ANY_SIGIL)
      && body.starts_with(NODE_SIGIL)
    {
      let mut alternatives = Vec::new();
      for alternative in body.split(WAIT_ANY_SEPARATOR) {
        let reference = alternative
          .trim()
          .strip_prefix(NODE_SIGIL)
          .ok_or_else(|| InputParseError::InvalidWaitAny {
            alternative: alternative.to_string(),
          })?;
        match parse_reference(reference, s)? {
          InputExpr::Node(r) => alternatives.push(r),
          _ => {
            return Err(InputParseError::InvalidWaitAny {
              alternative: alternative.to_string(),
            });
          }
        }
      }
      return Ok(InputExpr::WaitAny(alternatives));
    }

    Ok(InputExpr::Literal(Value::String(s.to_string())))
  }
}

impl TryFrom<Value> for InputExpr {
  type Error = InputParseError;

  fn try_from(value: Value) -> Result<Self, Self::Error> {
    InputExpr::parse_value(value)
  }
}

fn write_reference(f: &mut fmt::Formatter<'_>, head: &str, path: &[String]) -> fmt::Result {
  write!(f, "{}{}", NODE_SIGIL, head)?;
  for segment in path {
    write!(f, ".{}", segment)?;
  }
  Ok(())
}

impl fmt::Display for InputExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InputExpr::Literal(Value::String(s)) => f.write_str(s),
      InputExpr::Literal(v) => write!(f, "{}", v),
      InputExpr::Node(r) => write_reference(f, &r.node, &r.path),
      InputExpr::FlowInput { path } => write_reference(f, FLOW_INPUT, path),
      InputExpr::Batch(source) => {
        write!(f, "{}", BATCH_SIGIL)?;
        match source {
          BatchSource::Node(r) => write_reference(f, &r.node, &r.path),
          BatchSource::FlowInput { path } => write_reference(f, FLOW_INPUT, path),
          BatchSource::Literal(items) => write!(f, "{}", Value::Array(items.clone())),
        }
      }
      InputExpr::WaitAny(alternatives) => {
        write!(f, "{}", WAIT_ANY_SIGIL)?;
        for (i, r) in alternatives.iter().enumerate() {
          if i > 0 {
            write!(f, "{}", WAIT_ANY_SEPARATOR)?;
          }
          write_reference(f, &r.node, &r.path)?;
        }
        Ok(())
      }
    }
  }
}

impl From<InputExpr> for Value {
  fn from(expr: InputExpr) -> Self {
    match expr {
      InputExpr::Literal(v) => v,
      other => Value::String(other.to_string()),
    }
  }
}
