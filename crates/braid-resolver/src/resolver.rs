use std::collections::BTreeMap;

use async_trait::async_trait;
use braid_config::{BatchSource, InputExpr, NodeRef};
use serde_json::Value;

use crate::error::ResolveError;

/// Everything needed to resolve one node's input.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
  pub node_name: &'a str,
  pub flow_input: &'a Value,
  pub input: &'a [InputExpr],
  /// Aggregated results of the node's parents, keyed by parent name.
  pub parent_results: &'a BTreeMap<String, Value>,
  /// The alternative that fired the node's wait-any gate, with its result.
  pub wait_any: Option<(&'a str, &'a Value)>,
}

/// Outcome of resolving a node's input.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
  /// One task with this input.
  Single(Vec<Value>),
  /// One task per element, each with its own input.
  Batch(Vec<Vec<Value>>),
  /// The node is wait-any gated and no alternative has fired yet.
  WaitAny,
}

impl Resolution {
  pub fn is_batch(&self) -> bool {
    matches!(self, Resolution::Batch(_))
  }

  pub fn is_wait_any(&self) -> bool {
    matches!(self, Resolution::WaitAny)
  }
}

/// Resolves node input expressions into concrete task input.
///
/// Implementations must be deterministic: the same request always yields
/// the same resolution. Recovery relies on this to rebuild batch shapes.
#[async_trait]
pub trait InputResolver: Send + Sync {
  async fn resolve(&self, request: ResolveRequest<'_>) -> Result<Resolution, ResolveError>;
}

/// Resolver for the `@node`, `@flowInput`, `#` batch and `*` wait-any grammar.
#[derive(Debug, Clone, Default)]
pub struct StandardResolver;

impl StandardResolver {
  pub fn new() -> Self {
    Self
  }

  fn node_value(request: &ResolveRequest<'_>, reference: &NodeRef) -> Result<Value, ResolveError> {
    let result = request
      .parent_results
      .get(&reference.node)
      .ok_or_else(|| ResolveError::MissingParent {
        node: request.node_name.to_string(),
        reference: reference.node.clone(),
      })?;
    Ok(lookup_path(result, &reference.path))
  }

  fn wait_any_value(
    request: &ResolveRequest<'_>,
    alternatives: &[NodeRef],
    parent: &str,
    result: &Value,
  ) -> Result<Value, ResolveError> {
    let alternative = alternatives
      .iter()
      .find(|r| r.node == parent)
      .ok_or_else(|| ResolveError::UnknownAlternative {
        node: request.node_name.to_string(),
        parent: parent.to_string(),
      })?;
    Ok(lookup_path(result, &alternative.path))
  }

  fn batch_items(
    request: &ResolveRequest<'_>,
    source: &BatchSource,
  ) -> Result<Vec<Value>, ResolveError> {
    let value = match source {
      BatchSource::Node(reference) => Self::node_value(request, reference)?,
      BatchSource::FlowInput { path } => lookup_path(request.flow_input, path),
      BatchSource::Literal(items) => Value::Array(items.clone()),
    };
    match value {
      Value::Array(items) if items.is_empty() => Err(ResolveError::EmptyBatch {
        node: request.node_name.to_string(),
      }),
      Value::Array(items) => Ok(items),
      other => Err(ResolveError::BatchNotArray {
        node: request.node_name.to_string(),
        found: type_name(&other).to_string(),
      }),
    }
  }

  fn resolve_sync(request: &ResolveRequest<'_>) -> Result<Resolution, ResolveError> {
    let batch_count = request
      .input
      .iter()
      .filter(|e| matches!(e, InputExpr::Batch(_)))
      .count();
    let has_wait_any = request
      .input
      .iter()
      .any(|e| matches!(e, InputExpr::WaitAny(_)));

    if batch_count > 1 {
      return Err(ResolveError::MultipleBatch {
        node: request.node_name.to_string(),
      });
    }
    if batch_count == 1 && has_wait_any {
      return Err(ResolveError::BatchWithWaitAny {
        node: request.node_name.to_string(),
      });
    }
    if has_wait_any && request.wait_any.is_none() {
      return Ok(Resolution::WaitAny);
    }

    let mut resolved = Vec::with_capacity(request.input.len());
    let mut batch: Option<(usize, Vec<Value>)> = None;

    for (position, expr) in request.input.iter().enumerate() {
      let value = match expr {
        InputExpr::Literal(v) => v.clone(),
        InputExpr::Node(reference) => Self::node_value(request, reference)?,
        InputExpr::FlowInput { path } => lookup_path(request.flow_input, path),
        InputExpr::Batch(source) => {
          batch = Some((position, Self::batch_items(request, source)?));
          Value::Null
        }
        InputExpr::WaitAny(alternatives) => match request.wait_any {
          Some((parent, result)) => Self::wait_any_value(request, alternatives, parent, result)?,
          None => Value::Null,
        },
      };
      resolved.push(value);
    }

    match batch {
      Some((position, items)) => Ok(Resolution::Batch(
        items
          .into_iter()
          .map(|item| {
            let mut input = resolved.clone();
            input[position] = item;
            input
          })
          .collect(),
      )),
      None => Ok(Resolution::Single(resolved)),
    }
  }
}

#[async_trait]
impl InputResolver for StandardResolver {
  async fn resolve(&self, request: ResolveRequest<'_>) -> Result<Resolution, ResolveError> {
    Self::resolve_sync(&request)
  }
}

/// Walk `path` into `value`. Numeric segments index arrays.
///
/// Missing keys resolve to `null`.
pub fn lookup_path(value: &Value, path: &[String]) -> Value {
  let mut current = value;
  for segment in path {
    let next = match current {
      Value::Object(map) => map.get(segment),
      Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
      _ => None,
    };
    match next {
      Some(v) => current = v,
      None => return Value::Null,
    }
  }
  current.clone()
}

fn type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn exprs(value: Value) -> Vec<InputExpr> {
    serde_json::from_value(value).unwrap()
  }

  async fn resolve(
    input: &[InputExpr],
    flow_input: &Value,
    parents: &BTreeMap<String, Value>,
    wait_any: Option<(&str, &Value)>,
  ) -> Result<Resolution, ResolveError> {
    StandardResolver::new()
      .resolve(ResolveRequest {
        node_name: "node",
        flow_input,
        input,
        parent_results: parents,
        wait_any,
      })
      .await
  }

  #[tokio::test]
  async fn test_resolve_references_and_literals() {
    let input = exprs(json!(["@flowInput.files.0", "@green.data", 7, "plain"]));
    let flow = json!({ "files": ["a.txt", "b.txt"] });
    let parents = BTreeMap::from([("green".to_string(), json!({ "data": [1, 2] }))]);

    let resolution = resolve(&input, &flow, &parents, None).await.unwrap();
    assert_eq!(
      resolution,
      Resolution::Single(vec![json!("a.txt"), json!([1, 2]), json!(7), json!("plain")])
    );
  }

  #[tokio::test]
  async fn test_resolve_batch_fans_out() {
    let input = exprs(json!(["#@flowInput.files", "@flowInput.mode"]));
    let flow = json!({ "files": ["a", "b", "c"], "mode": "fast" });

    let resolution = resolve(&input, &flow, &BTreeMap::new(), None).await.unwrap();
    assert!(resolution.is_batch());
    assert_eq!(
      resolution,
      Resolution::Batch(vec![
        vec![json!("a"), json!("fast")],
        vec![json!("b"), json!("fast")],
        vec![json!("c"), json!("fast")],
      ])
    );
  }

  #[tokio::test]
  async fn test_resolve_batch_over_parent_result() {
    let input = exprs(json!(["#@green"]));
    let parents = BTreeMap::from([("green".to_string(), json!([10, 20]))]);

    let resolution = resolve(&input, &Value::Null, &parents, None).await.unwrap();
    assert_eq!(
      resolution,
      Resolution::Batch(vec![vec![json!(10)], vec![json!(20)]])
    );
  }

  #[tokio::test]
  async fn test_batch_errors() {
    let flow = json!({ "files": "nope", "empty": [] });

    let err = resolve(&exprs(json!(["#@flowInput.files"])), &flow, &BTreeMap::new(), None)
      .await
      .unwrap_err();
    assert!(matches!(err, ResolveError::BatchNotArray { ref found, .. } if found == "string"));

    let err = resolve(&exprs(json!(["#@flowInput.empty"])), &flow, &BTreeMap::new(), None)
      .await
      .unwrap_err();
    assert!(matches!(err, ResolveError::EmptyBatch { .. }));

    let err = resolve(&exprs(json!(["#[1]", "#[2]"])), &flow, &BTreeMap::new(), None)
      .await
      .unwrap_err();
    assert!(matches!(err, ResolveError::MultipleBatch { .. }));
  }

  #[tokio::test]
  async fn test_wait_any_deferred_until_winner() {
    let input = exprs(json!(["*@red|@blue.value", "x"]));
    let deferred = resolve(&input, &Value::Null, &BTreeMap::new(), None).await.unwrap();
    assert!(deferred.is_wait_any());

    let winner = json!({ "value": "blue!" });
    let resolved = resolve(&input, &Value::Null, &BTreeMap::new(), Some(("blue", &winner)))
      .await
      .unwrap();
    assert_eq!(resolved, Resolution::Single(vec![json!("blue!"), json!("x")]));

    let err = resolve(&input, &Value::Null, &BTreeMap::new(), Some(("green", &winner)))
      .await
      .unwrap_err();
    assert!(matches!(err, ResolveError::UnknownAlternative { .. }));
  }

  #[tokio::test]
  async fn test_missing_parent() {
    let err = resolve(&exprs(json!(["@green"])), &Value::Null, &BTreeMap::new(), None)
      .await
      .unwrap_err();
    assert_eq!(
      err,
      ResolveError::MissingParent {
        node: "node".to_string(),
        reference: "green".to_string(),
      }
    );
  }

  #[test]
  fn test_lookup_path() {
    let value = json!({ "a": { "b": [1, { "c": true }] } });
    let path = |p: &[&str]| p.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    assert_eq!(lookup_path(&value, &path(&["a", "b", "1", "c"])), json!(true));
    assert_eq!(lookup_path(&value, &path(&["a", "x"])), Value::Null);
    assert_eq!(lookup_path(&value, &[]), value);
  }
}
