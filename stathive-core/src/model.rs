/*!
In-memory model of one call-statistics snapshot.

A [`Snapshot`] is a tree of [`StatNode`]s covering a time window for one
producing instance. Children are keyed by name, so sibling names are unique,
and are kept in a sorted map so that serialization is deterministic.
*/

use crate::{Result, StoreError};
use chrono::{DateTime, Datelike, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Deepest tree a snapshot may hold, the root being level 1
///
/// Keeps every stored document decodable by the JSON backends.
pub const MAX_TREE_DEPTH: usize = 48;

/// Calendar years a snapshot window may fall in
pub const WINDOW_YEARS: std::ops::RangeInclusive<i32> = 0..=9999;

/// Counters for one named operation plus its child operations
///
/// Counters of a node are independent of its children and siblings: nothing
/// is rolled up implicitly. Use [`StatNode::merge`] to combine trees. All
/// counters saturate at `u64::MAX`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct StatNode {
    name: String,

    /// Number of recorded invocations
    pub count: u64,

    /// Number of invocations that ended with an error
    pub error_count: u64,

    /// Fastest invocation (0 while `count == 0`)
    pub min_duration_ms: u64,

    /// Slowest invocation (0 while `count == 0`)
    pub max_duration_ms: u64,

    /// Sum of all invocation durations
    pub total_duration_ms: u64,

    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        with = "children_as_list"
    )]
    children: BTreeMap<String, StatNode>,
}

impl StatNode {
    /// Create an empty node with the given operation name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder-style helper that sets all counters at once
    pub fn with_counters(mut self, count: u64, error_count: u64, min: u64, max: u64, total: u64) -> Self {
        self.count = count;
        self.error_count = error_count;
        self.min_duration_ms = min;
        self.max_duration_ms = max;
        self.total_duration_ms = total;
        self
    }

    /// Builder-style helper that adds (or replaces) a child
    pub fn with_child(mut self, child: StatNode) -> Self {
        self.insert_child(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Account one invocation of this operation
    pub fn record(&mut self, duration_ms: u64, failed: bool) {
        if self.count == 0 {
            self.min_duration_ms = duration_ms;
            self.max_duration_ms = duration_ms;
        } else {
            self.min_duration_ms = self.min_duration_ms.min(duration_ms);
            self.max_duration_ms = self.max_duration_ms.max(duration_ms);
        }
        self.total_duration_ms = self.total_duration_ms.saturating_add(duration_ms);
        self.count = self.count.saturating_add(1);
        if failed {
            self.error_count = self.error_count.saturating_add(1);
        }
    }

    /// Average invocation duration, 0 for a node without invocations
    pub fn avg_duration_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_duration_ms / self.count
        }
    }

    pub fn child(&self, name: &str) -> Option<&StatNode> {
        self.children.get(name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut StatNode> {
        self.children.get_mut(name)
    }

    /// Get the named child, creating an empty one when missing
    pub fn child_or_insert(&mut self, name: &str) -> &mut StatNode {
        self.children
            .entry(name.to_string())
            .or_insert_with(|| StatNode::new(name))
    }

    /// Insert a child, returning the previous child with the same name
    pub fn insert_child(&mut self, child: StatNode) -> Option<StatNode> {
        self.children.insert(child.name.clone(), child)
    }

    /// Children in name order
    pub fn children(&self) -> impl Iterator<Item = &StatNode> {
        self.children.values()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Number of nodes in this subtree, including this node
    pub fn node_count(&self) -> usize {
        1 + self.children.values().map(StatNode::node_count).sum::<usize>()
    }

    /// Levels in this subtree, 1 for a leaf
    pub fn depth(&self) -> usize {
        1 + self.children.values().map(StatNode::depth).max().unwrap_or(0)
    }

    /// True when this node or any descendant carries `name`
    pub fn contains_name(&self, name: &str) -> bool {
        self.name == name || self.children.values().any(|c| c.contains_name(name))
    }

    /// Every node in this subtree carrying `name`, outer nodes first
    ///
    /// A named node nested below another one is reported on its own as well.
    pub fn nodes_named<'a>(&'a self, name: &str) -> Vec<&'a StatNode> {
        let mut found = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.name == name {
                found.push(node);
            }
            stack.extend(node.children.values().rev());
        }
        found
    }

    /// Merge nodes into one named `name`, `None` for an empty input
    pub fn merge_named<'a>(name: &str, nodes: impl IntoIterator<Item = &'a StatNode>) -> Option<StatNode> {
        let mut nodes = nodes.into_iter().peekable();
        nodes.peek()?;
        let mut merged = StatNode::new(name);
        for node in nodes {
            merged.merge(node);
        }
        Some(merged)
    }

    /// Copy keeping this node and `levels` levels of descendants
    pub fn truncated(&self, levels: usize) -> StatNode {
        let mut copy = self.clone();
        copy.truncate(levels);
        copy
    }

    fn truncate(&mut self, levels: usize) {
        if levels == 0 {
            self.children.clear();
        } else {
            for child in self.children.values_mut() {
                child.truncate(levels - 1);
            }
        }
    }

    /// Add the counters of `other` to this node and merge children by name
    pub fn merge(&mut self, other: &StatNode) {
        if other.count > 0 {
            if self.count == 0 {
                self.min_duration_ms = other.min_duration_ms;
                self.max_duration_ms = other.max_duration_ms;
            } else {
                self.min_duration_ms = self.min_duration_ms.min(other.min_duration_ms);
                self.max_duration_ms = self.max_duration_ms.max(other.max_duration_ms);
            }
        }
        self.count = self.count.saturating_add(other.count);
        self.error_count = self.error_count.saturating_add(other.error_count);
        self.total_duration_ms = self.total_duration_ms.saturating_add(other.total_duration_ms);

        for (name, child) in &other.children {
            match self.children.get_mut(name) {
                Some(existing) => existing.merge(child),
                None => {
                    self.children.insert(name.clone(), child.clone());
                }
            }
        }
    }

    /// Check the counter invariants and the depth of the whole subtree
    pub fn validate(&self) -> Result<()> {
        self.validate_at(1)
    }

    fn validate_at(&self, level: usize) -> Result<()> {
        if level > MAX_TREE_DEPTH {
            return Err(StoreError::invalid(format!(
                "tree is deeper than {MAX_TREE_DEPTH} levels at node '{}'",
                self.name
            )));
        }
        if self.error_count > self.count {
            return Err(StoreError::invalid(format!(
                "node '{}' has error_count {} greater than count {}",
                self.name, self.error_count, self.count
            )));
        }
        if self.count > 0 && self.min_duration_ms > self.max_duration_ms {
            return Err(StoreError::invalid(format!(
                "node '{}' has min duration {} greater than max duration {}",
                self.name, self.min_duration_ms, self.max_duration_ms
            )));
        }
        self.children
            .values()
            .try_for_each(|child| child.validate_at(level + 1))
    }
}

/// Children travel as a list of nodes; the name inside each node is the key.
mod children_as_list {
    use super::StatNode;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        children: &BTreeMap<String, StatNode>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(children.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, StatNode>, D::Error> {
        let nodes = Vec::<StatNode>::deserialize(deserializer)?;
        let mut children = BTreeMap::new();
        for node in nodes {
            let name = node.name.clone();
            if children.insert(name.clone(), node).is_some() {
                return Err(D::Error::custom(format!("duplicate child name '{name}'")));
            }
        }
        Ok(children)
    }
}

/// One persisted statistics tree covering `[window_start, window_end]`
///
/// Window timestamps have millisecond resolution; constructors truncate finer
/// precision so every backend stores the exact same instants.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    root: StatNode,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    instance_tag: String,
}

impl Snapshot {
    /// Create a snapshot, rejecting windows that end before they start
    pub fn new(
        root: StatNode,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        instance_tag: impl Into<String>,
    ) -> Result<Self> {
        let snapshot = Self {
            root,
            window_start: window_start.trunc_subsecs(3),
            window_end: window_end.trunc_subsecs(3),
            instance_tag: instance_tag.into(),
        };
        snapshot.validate_window()?;
        Ok(snapshot)
    }

    pub fn root(&self) -> &StatNode {
        &self.root
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_end
    }

    pub fn instance_tag(&self) -> &str {
        &self.instance_tag
    }

    /// True when the closed window overlaps the closed range `[from, to]`
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.window_start <= to && self.window_end >= from
    }

    /// Check the window ordering and every node invariant
    pub fn validate(&self) -> Result<()> {
        self.validate_window()?;
        self.root.validate()
    }

    fn validate_window(&self) -> Result<()> {
        for ts in [self.window_start, self.window_end] {
            if !WINDOW_YEARS.contains(&ts.year()) {
                return Err(StoreError::invalid(format!(
                    "window bound {ts} is outside years {}..={}",
                    WINDOW_YEARS.start(),
                    WINDOW_YEARS.end()
                )));
            }
        }
        if self.window_start > self.window_end {
            return Err(StoreError::invalid(format!(
                "window start {} is after window end {}",
                self.window_start, self.window_end
            )));
        }
        Ok(())
    }

    /// Aggregate snapshots into one covering all of their windows
    ///
    /// The instance tag is kept when all inputs share it and is empty
    /// otherwise. Returns `None` for an empty input.
    pub fn merge_all<'a>(snapshots: impl IntoIterator<Item = &'a Snapshot>) -> Option<Snapshot> {
        let mut iter = snapshots.into_iter();
        let mut merged = iter.next()?.clone();
        for snapshot in iter {
            merged.root.merge(&snapshot.root);
            merged.window_start = merged.window_start.min(snapshot.window_start);
            merged.window_end = merged.window_end.max(snapshot.window_end);
            if merged.instance_tag != snapshot.instance_tag {
                merged.instance_tag.clear();
            }
        }
        Some(merged)
    }

    /// Copy with the root and its direct children only
    pub fn top_level(&self) -> Snapshot {
        let mut top = self.clone();
        top.root.truncate(1);
        top
    }

    /// All nodes named `name` merged into one, `None` when the tree has none
    pub fn details(&self, name: &str) -> Option<StatNode> {
        StatNode::merge_named(name, self.root.nodes_named(name))
    }
}
