//! Span tree reconstruction from a session's flat event list.

use crate::{
    error::GraphError,
    record::{Event, Micros},
};
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

/// A Scylla span id. Zero never appears here; the record layer maps it to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    pub fn new(id: u64) -> Option<SpanId> {
        if id == 0 {
            None
        } else {
            Some(SpanId(id))
        }
    }

    /// Reinterpret a signed `bigint` column value.
    pub fn from_raw(raw: i64) -> Option<SpanId> {
        SpanId::new(raw as u64)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Start time of a node no event has touched yet.
pub const START_UNSET: Micros = Micros::MAX;
/// End time of a node no event has touched yet.
pub const END_UNSET: Micros = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct SpanNode {
    pub id: SpanId,
    /// `None` for top-level spans (children of the synthetic root).
    pub parent: Option<SpanId>,
    pub children: Vec<SpanId>,
    pub start: Micros,
    pub end: Micros,
    linked: bool,
}

impl SpanNode {
    fn new(id: SpanId) -> Self {
        SpanNode {
            id,
            parent: None,
            children: Vec::new(),
            start: START_UNSET,
            end: END_UNSET,
            linked: false,
        }
    }

    /// True if the node only exists because some event named it as a parent.
    pub fn is_placeholder(&self) -> bool {
        self.start == START_UNSET
    }

    fn observe(&mut self, timestamp: Micros) {
        self.start = self.start.min(timestamp);
        // Events are instants; a span lasts at least one unit past its last one.
        self.end = self.end.max(timestamp + 1);
    }
}

/// Bookkeeping for session-level events (no span id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootBookkeeping {
    pub start: Micros,
    pub end: Micros,
    pub events: usize,
}

impl Default for RootBookkeeping {
    fn default() -> Self {
        RootBookkeeping {
            start: START_UNSET,
            end: END_UNSET,
            events: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpanTree {
    nodes: HashMap<SpanId, SpanNode>,
    roots: Vec<SpanId>,
    root: RootBookkeeping,
}

impl SpanTree {
    /// Build the tree in one pass over `events`, then reject cycles.
    pub fn build<'a, I>(events: I) -> Result<SpanTree, GraphError>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut tree = SpanTree::default();
        for event in events {
            let id = match event.span {
                Some(id) => id,
                None => {
                    tree.root.start = tree.root.start.min(event.timestamp);
                    tree.root.end = tree.root.end.max(event.timestamp + 1);
                    tree.root.events += 1;
                    continue;
                }
            };
            tree.get_or_create(id);
            if let Some(parent) = event.parent {
                tree.get_or_create(parent);
            }
            tree.link(id, event.parent)?;
            tree.get_or_create(id).observe(event.timestamp);
        }
        tree.check_acyclic()?;
        tree.attach_orphans();
        Ok(tree)
    }

    fn get_or_create(&mut self, id: SpanId) -> &mut SpanNode {
        self.nodes.entry(id).or_insert_with(|| SpanNode::new(id))
    }

    fn link(&mut self, id: SpanId, parent: Option<SpanId>) -> Result<(), GraphError> {
        let node = self.get_or_create(id);
        if node.linked {
            return match (node.parent, parent) {
                (Some(first), Some(second)) if first != second => {
                    Err(GraphError::ConflictingParent {
                        span_id: id,
                        first,
                        second,
                    })
                }
                (Some(parent), None) | (None, Some(parent)) => {
                    Err(GraphError::ConflictingRoot { span_id: id, parent })
                }
                _ => Ok(()),
            };
        }
        node.linked = true;
        node.parent = parent;
        match parent {
            Some(parent) => self.get_or_create(parent).children.push(id),
            None => self.roots.push(id),
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), GraphError> {
        let budget = self.nodes.len();
        let mut verified: HashSet<SpanId> = HashSet::with_capacity(budget);
        for &start in self.nodes.keys() {
            let mut path = Vec::new();
            let mut cursor = Some(start);
            while let Some(id) = cursor {
                if verified.contains(&id) {
                    break;
                }
                if path.len() > budget {
                    return Err(GraphError::Cycle { span_id: start });
                }
                path.push(id);
                cursor = self.nodes.get(&id).and_then(|n| n.parent);
            }
            verified.extend(path);
        }
        Ok(())
    }

    // Placeholders nobody ever linked still have to be reachable from the root.
    fn attach_orphans(&mut self) {
        let mut orphans: Vec<SpanId> = self
            .nodes
            .values()
            .filter(|n| !n.linked)
            .map(|n| n.id)
            .collect();
        orphans.sort();
        for id in orphans {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.linked = true;
            }
            self.roots.push(id);
        }
    }

    pub fn get(&self, id: SpanId) -> Option<&SpanNode> {
        self.nodes.get(&id)
    }

    /// Direct children of the synthetic root.
    pub fn roots(&self) -> &[SpanId] {
        &self.roots
    }

    pub fn root_bookkeeping(&self) -> RootBookkeeping {
        self.root
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SpanNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Latest end over top-level spans and session-level events.
    ///
    /// A top-level placeholder stands in for the latest end found beneath it.
    pub fn end(&self) -> Option<Micros> {
        self.roots
            .iter()
            .filter_map(|&id| self.top_level_end(id))
            .chain(Some(self.root.end).filter(|_| self.root.events > 0))
            .max()
    }

    fn top_level_end(&self, id: SpanId) -> Option<Micros> {
        let node = self.nodes.get(&id)?;
        if !node.is_placeholder() {
            return Some(node.end);
        }
        let mut end = None;
        let mut stack: Vec<SpanId> = node.children.clone();
        while let Some(id) = stack.pop() {
            let node = match self.nodes.get(&id) {
                Some(node) => node,
                None => continue,
            };
            if !node.is_placeholder() {
                end = end.max(Some(node.end));
            }
            stack.extend(node.children.iter().copied());
        }
        end
    }
}
