use std::collections::{HashMap, VecDeque};

use braid_config::{InputExpr, NodeTemplate};
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// How a child consumes a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeKind {
  Input,
  Batch,
  WaitAny,
}

/// Adjacency structure for traversal and analysis.
#[derive(Debug, Clone)]
pub struct Adjacency {
  /// node -> downstream nodes, in pipeline order.
  children: HashMap<String, Vec<String>>,
  /// node -> upstream nodes, in first-reference order.
  parents: HashMap<String, Vec<String>>,
  /// (from, to) -> how `to` consumes `from`.
  edge_kinds: HashMap<(String, String), Vec<EdgeKind>>,
  /// Edges in discovery order.
  edges: Vec<(String, String)>,
  /// Nodes with no incoming edges, in pipeline order.
  entry_nodes: Vec<String>,
}

impl Adjacency {
  /// Build the adjacency from node templates.
  ///
  /// Rejects duplicate names and references to nodes that do not exist.
  pub fn new(templates: &[NodeTemplate]) -> Result<Self, GraphError> {
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    let mut parents: HashMap<String, Vec<String>> = HashMap::new();

    for template in templates {
      if children.contains_key(&template.node_name) {
        return Err(GraphError::DuplicateNode(template.node_name.clone()));
      }
      children.insert(template.node_name.clone(), Vec::new());
      parents.insert(template.node_name.clone(), Vec::new());
    }

    let mut edge_kinds: HashMap<(String, String), Vec<EdgeKind>> = HashMap::new();
    let mut edges = Vec::new();

    for template in templates {
      for expr in &template.input {
        let kind = match expr {
          InputExpr::Batch(_) => EdgeKind::Batch,
          InputExpr::WaitAny(_) => EdgeKind::WaitAny,
          _ => EdgeKind::Input,
        };
        for parent in expr.node_references() {
          if !children.contains_key(parent) {
            return Err(GraphError::UnknownReference {
              node: template.node_name.clone(),
              reference: parent.to_string(),
            });
          }
          let key = (parent.to_string(), template.node_name.clone());
          let kinds = edge_kinds.entry(key.clone()).or_default();
          if kinds.is_empty() {
            edges.push(key.clone());
            children
              .entry(key.0.clone())
              .or_default()
              .push(key.1.clone());
            parents.entry(key.1.clone()).or_default().push(key.0.clone());
          }
          if !kinds.contains(&kind) {
            kinds.push(kind);
          }
        }
      }
    }

    let entry_nodes = templates
      .iter()
      .filter(|t| parents.get(&t.node_name).is_none_or(|p| p.is_empty()))
      .map(|t| t.node_name.clone())
      .collect();

    Ok(Self {
      children,
      parents,
      edge_kinds,
      edges,
      entry_nodes,
    })
  }

  /// Nodes with no incoming edges.
  pub fn entry_nodes(&self) -> &[String] {
    &self.entry_nodes
  }

  /// Direct successors of a node.
  pub fn children(&self, node: &str) -> &[String] {
    self.children.get(node).map(|v| v.as_slice()).unwrap_or(&[])
  }

  /// Direct predecessors of a node.
  pub fn parents(&self, node: &str) -> &[String] {
    self.parents.get(node).map(|v| v.as_slice()).unwrap_or(&[])
  }

  /// All edges as `(from, to, kinds)`.
  pub fn edges(&self) -> impl Iterator<Item = (&str, &str, &[EdgeKind])> {
    self.edges.iter().map(|(from, to)| {
      let kinds = self
        .edge_kinds
        .get(&(from.clone(), to.clone()))
        .map(|k| k.as_slice())
        .unwrap_or(&[]);
      (from.as_str(), to.as_str(), kinds)
    })
  }

  /// Topological order of `nodes` (given in pipeline order).
  ///
  /// Kahn's algorithm over the adjacency map; ties keep pipeline order.
  pub fn topological_order(&self, nodes: &[String]) -> Result<Vec<String>, GraphError> {
    let mut in_degree: HashMap<&str, usize> = nodes
      .iter()
      .map(|n| (n.as_str(), self.parents(n).len()))
      .collect();

    let mut queue: VecDeque<&str> = nodes
      .iter()
      .map(String::as_str)
      .filter(|n| in_degree.get(n) == Some(&0))
      .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(node) = queue.pop_front() {
      order.push(node.to_string());
      for child in self.children(node) {
        if let Some(degree) = in_degree.get_mut(child.as_str()) {
          *degree -= 1;
          if *degree == 0 {
            queue.push_back(child.as_str());
          }
        }
      }
    }

    if order.len() != nodes.len() {
      let stuck = nodes
        .iter()
        .filter(|n| !order.contains(n))
        .cloned()
        .collect();
      return Err(GraphError::CycleDetected { nodes: stuck });
    }

    Ok(order)
  }
}
