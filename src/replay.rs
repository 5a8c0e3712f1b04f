//! Replays a session's events as annotations and closes the spans.

use crate::{
    error::TracerError,
    graph::{SpanId, SpanTree},
    materialize::Materialized,
    model::SpanHandle,
    record::Event,
    tracer::Tracer,
};
use log::warn;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub annotated: usize,
    /// Events whose span had no open handle.
    pub skipped: usize,
    pub finished: usize,
    /// Placeholder spans handed back without being reported.
    pub discarded: usize,
}

/// Group span events per span, each group in time order with ties in event id order.
pub fn events_by_span(events: &[Event]) -> HashMap<SpanId, Vec<&Event>> {
    let mut grouped: HashMap<SpanId, Vec<&Event>> = HashMap::new();
    for event in events {
        if let Some(id) = event.span {
            grouped.entry(id).or_default().push(event);
        }
    }
    for group in grouped.values_mut() {
        group.sort_by_key(|e| e.replay_key());
    }
    grouped
}

/// Annotate every span event onto its span, then finish spans children-first.
///
/// Session-level events go to `session_root` when one is given. A span is
/// removed from `spans` as it is closed, so on error the remainder can still
/// be abandoned by the caller.
pub fn replay<T: Tracer + ?Sized>(
    events: &[Event],
    tree: &SpanTree,
    spans: &mut Materialized,
    session_root: Option<&SpanHandle>,
    tracer: &T,
) -> Result<ReplayStats, TracerError> {
    let mut stats = ReplayStats::default();

    if let Some(root) = session_root {
        let mut session_level: Vec<&Event> = events.iter().filter(|e| e.span.is_none()).collect();
        session_level.sort_by_key(|e| e.replay_key());
        for event in session_level {
            tracer.annotate_span(root, event.timestamp, &event.activity)?;
            stats.annotated += 1;
        }
    }

    let mut grouped: Vec<(SpanId, Vec<&Event>)> = events_by_span(events).into_iter().collect();
    grouped.sort_by_key(|(id, _)| *id);
    for (id, group) in grouped {
        let handle = match spans.get(id) {
            Some(handle) => *handle,
            None => {
                warn!(
                    "Dropping {} annotation(s) for span {}: no materialized span",
                    group.len(),
                    id
                );
                stats.skipped += group.len();
                continue;
            }
        };
        for event in group {
            tracer.annotate_span(&handle, event.timestamp, &event.activity)?;
            stats.annotated += 1;
        }
    }

    let order = spans.order().to_vec();
    for id in order.into_iter().rev() {
        let node = match tree.get(id) {
            Some(node) => node,
            None => continue,
        };
        let handle = match spans.get(id) {
            Some(handle) => *handle,
            None => continue,
        };
        if node.is_placeholder() {
            tracer.discard_span(&handle)?;
            stats.discarded += 1;
        } else {
            tracer.finish_span(&handle, node.end)?;
            stats.finished += 1;
        }
        spans.take(id);
    }
    Ok(stats)
}
