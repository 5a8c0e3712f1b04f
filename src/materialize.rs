//! Parent-first creation of backend spans for a reconstructed tree.

use crate::{
    error::TracerError,
    graph::{SpanId, SpanTree},
    model::SpanHandle,
    propagation::SpanContext,
    tracer::Tracer,
};
use log::debug;
use std::collections::{HashMap, VecDeque};

/// Backend handles for the nodes of one tree, in creation order.
#[derive(Debug, Default)]
pub struct Materialized {
    order: Vec<SpanId>,
    handles: HashMap<SpanId, SpanHandle>,
}

impl Materialized {
    fn insert(&mut self, id: SpanId, handle: SpanHandle) {
        self.order.push(id);
        self.handles.insert(id, handle);
    }

    /// Creation order; parents always precede their children.
    pub fn order(&self) -> &[SpanId] {
        &self.order
    }

    /// Handle of a span that is still open.
    pub fn get(&self, id: SpanId) -> Option<&SpanHandle> {
        self.handles.get(&id)
    }

    /// Take a handle out so it can be closed; a closed span is never handed out again.
    pub fn take(&mut self, id: SpanId) -> Option<SpanHandle> {
        self.handles.remove(&id)
    }

    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Best-effort close of every handle still open, children first.
    ///
    /// Placeholders are discarded; everything else is finished at its derived end.
    pub fn abandon<T: Tracer + ?Sized>(mut self, tree: &SpanTree, tracer: &T) {
        let order = std::mem::take(&mut self.order);
        for id in order.into_iter().rev() {
            let handle = match self.take(id) {
                Some(handle) => handle,
                None => continue,
            };
            let result = match tree.get(id) {
                Some(node) if !node.is_placeholder() => tracer.finish_span(&handle, node.end),
                _ => tracer.discard_span(&handle),
            };
            if let Err(e) = result {
                debug!("Couldn't close abandoned span {}: {}", id, e);
            }
        }
    }
}

#[derive(Debug)]
pub struct MaterializeError {
    pub span_id: SpanId,
    pub source: TracerError,
    /// Handles created before the failure; still open.
    pub partial: Materialized,
}

/// Create a backend span for every node, breadth-first from the top-level spans.
///
/// Top-level spans continue `session` when given, so the whole tree lands in
/// the session's trace.
pub fn materialize<T: Tracer + ?Sized>(
    tree: &SpanTree,
    tracer: &T,
    session: Option<&SpanContext>,
) -> Result<Materialized, MaterializeError> {
    let mut spans = Materialized::default();
    let mut queue: VecDeque<SpanId> = tree.roots().iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        let node = match tree.get(id) {
            Some(node) => node,
            None => continue,
        };
        let created = match node.parent.and_then(|parent| spans.get(parent).copied()) {
            Some(parent) => tracer.new_child_span(&parent),
            None => tracer.new_root_span(session),
        };
        match created {
            Ok(handle) => spans.insert(id, handle),
            Err(source) => {
                return Err(MaterializeError {
                    span_id: id,
                    source,
                    partial: spans,
                })
            }
        }
        queue.extend(node.children.iter().copied());
    }
    Ok(spans)
}
