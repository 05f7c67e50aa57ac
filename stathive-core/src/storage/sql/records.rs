//! Flat node records for the normalized schema
//!
//! A tree is stored as one record per node, linked to its parent by id.
//! [`flatten`] emits parents before children; [`rebuild_tree`] accepts the
//! records in any order and rejects sets that do not form exactly one tree.

use crate::{Result, StatNode, StoreError};
use std::collections::HashMap;
use uuid::Uuid;

/// One `stats_node` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub node_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub count: u64,
    pub error_count: u64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub total_duration_ms: u64,
}

impl NodeRecord {
    fn from_node(node: &StatNode, parent_id: Option<String>) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            parent_id,
            name: node.name().to_string(),
            count: node.count,
            error_count: node.error_count,
            min_duration_ms: node.min_duration_ms,
            max_duration_ms: node.max_duration_ms,
            total_duration_ms: node.total_duration_ms,
        }
    }

    fn to_node(&self) -> StatNode {
        StatNode::new(self.name.clone()).with_counters(
            self.count,
            self.error_count,
            self.min_duration_ms,
            self.max_duration_ms,
            self.total_duration_ms,
        )
    }
}

/// Depth-first records of `root` with fresh node ids
pub fn flatten(root: &StatNode) -> Vec<NodeRecord> {
    let mut records = Vec::with_capacity(root.node_count());
    let mut stack = vec![(root, None)];
    while let Some((node, parent_id)) = stack.pop() {
        let record = NodeRecord::from_node(node, parent_id);
        let id = record.node_id.clone();
        records.push(record);
        // reversed so children come out in name order
        let children: Vec<_> = node.children().collect();
        stack.extend(children.into_iter().rev().map(|child| (child, Some(id.clone()))));
    }
    records
}

/// Reassemble the tree described by `records`
///
/// # Errors
/// `StoreError::CorruptData` for duplicate node ids, dangling parents, zero
/// or several roots, duplicate sibling names, records unreachable from the
/// root, or counters that break node invariants.
pub fn rebuild_tree(records: &[NodeRecord]) -> Result<StatNode> {
    let mut by_id: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        if by_id.insert(record.node_id.as_str(), idx).is_some() {
            return Err(StoreError::corrupt(format!("duplicate node id {}", record.node_id)));
        }
    }

    let mut roots = Vec::new();
    let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, record) in records.iter().enumerate() {
        match record.parent_id.as_deref() {
            None => roots.push(idx),
            Some(parent) if by_id.contains_key(parent) => children.entry(parent).or_default().push(idx),
            Some(parent) => {
                return Err(StoreError::corrupt(format!(
                    "node {} references missing parent {parent}",
                    record.node_id
                )))
            }
        }
    }

    let root = match roots.as_slice() {
        [root] => *root,
        [] => return Err(StoreError::corrupt("no root node")),
        _ => return Err(StoreError::corrupt(format!("{} root nodes", roots.len()))),
    };

    let mut visited = 0;
    let tree = build(records, &children, root, &mut visited)?;
    if visited != records.len() {
        return Err(StoreError::corrupt(format!(
            "{} node records are not reachable from the root",
            records.len() - visited
        )));
    }
    tree.validate().map_err(|e| StoreError::corrupt(e.to_string()))?;
    Ok(tree)
}

fn build(
    records: &[NodeRecord],
    children: &HashMap<&str, Vec<usize>>,
    idx: usize,
    visited: &mut usize,
) -> Result<StatNode> {
    *visited += 1;
    let record = &records[idx];
    let mut node = record.to_node();
    for &child_idx in children.get(record.node_id.as_str()).into_iter().flatten() {
        let child = build(records, children, child_idx, visited)?;
        if let Some(previous) = node.insert_child(child) {
            return Err(StoreError::corrupt(format!(
                "duplicate sibling name '{}' under {}",
                previous.name(),
                record.node_id
            )));
        }
    }
    Ok(node)
}
