use crate::{
    error::{Error, Result, SessionError, TracerError},
    graph::SpanTree,
    materialize::{materialize, Materialized},
    propagation::B3_PARAMETER,
    record::{Event, Micros, SessionRecord, TimeSource},
    replay::{replay, ReplayStats},
    session::{SessionContext, SessionRegistry},
    source::RecordSource,
    tracer::Tracer,
};
use log::{debug, info, warn};
use uuid::Uuid;

pub const TAG_SPAN_ID: &str = "scylla.span_id";
pub const TAG_PARENT_SPAN_ID: &str = "scylla.parent_span_id";

/// How a session's events are turned into spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One backend span per Scylla span, nested under the session span.
    Hierarchical,
    /// Only the session span; every event becomes one of its annotations.
    Flat,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Hierarchical
    }
}

#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub mode: Mode,
    pub time_source: TimeSource,
    /// Session parameter holding a B3 single-header token.
    pub propagation_key: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            mode: Mode::default(),
            time_source: TimeSource::default(),
            propagation_key: B3_PARAMETER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub trace_id: u64,
    pub spans: usize,
    pub stats: ReplayStats,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<SessionOutcome>,
    pub failed: Vec<(Uuid, &'static str)>,
}

/// Pulls finished sessions from a record source and replays them into a tracer.
pub struct TraceLoader<S, T> {
    source: S,
    tracer: T,
    config: LoaderConfig,
    registry: SessionRegistry,
}

impl<S: RecordSource, T: Tracer> TraceLoader<S, T> {
    pub fn new(source: S, tracer: T, config: LoaderConfig) -> Self {
        TraceLoader {
            source,
            tracer,
            config,
            registry: SessionRegistry::new(),
        }
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn into_tracer(self) -> T {
        self.tracer
    }

    /// Process every session the source has, one at a time.
    ///
    /// A failing session is logged and skipped; only an unavailable source or
    /// tracing transport ends the run early.
    pub fn run(&self) -> Result<RunSummary> {
        info!("Fetching sessions ...");
        let sessions = self.source.fetch_sessions()?;
        info!("Found {} session(s)", sessions.len());

        let mut summary = RunSummary::default();
        for session in &sessions {
            match self.process_session(session) {
                Ok(outcome) => {
                    info!(
                        "Session {} -> trace {:x} ({} span(s), {} annotation(s))",
                        outcome.session_id, outcome.trace_id, outcome.spans, outcome.stats.annotated
                    );
                    summary.completed.push(outcome);
                }
                Err(e) if e.is_fatal() => {
                    return Err(Error::Backend {
                        session_id: session.session_id,
                        source: e,
                    })
                }
                Err(e) => {
                    warn!("Skipping session {} ({}): {}", session.session_id, e.kind(), e);
                    summary.failed.push((session.session_id, e.kind()));
                }
            }
        }
        Ok(summary)
    }

    pub fn process_session(&self, session: &SessionRecord) -> std::result::Result<SessionOutcome, SessionError> {
        debug!("Fetching events for session {} ...", session.session_id);
        let started_at = session.started_at_micros();
        let events: Vec<Event> = self
            .source
            .fetch_events(session.session_id)?
            .iter()
            .map(|record| Event::from_record(record, started_at, self.config.time_source))
            .collect();

        match self.config.mode {
            Mode::Hierarchical => self.replay_tree(session, &events),
            Mode::Flat => self.replay_flat(session, &events),
        }
    }

    fn replay_tree(
        &self,
        session: &SessionRecord,
        events: &[Event],
    ) -> std::result::Result<SessionOutcome, SessionError> {
        // A malformed session is rejected before anything reaches the backend.
        let tree = SpanTree::build(events)?;

        let mut context = SessionContext::start(
            session,
            &self.config.propagation_key,
            &self.tracer,
            &self.registry,
        )?;
        context.begin_annotating();

        let root_context = context.root_context();
        let mut spans = match materialize(&tree, &self.tracer, Some(&root_context)) {
            Ok(spans) => spans,
            Err(e) => {
                e.partial.abandon(&tree, &self.tracer);
                close_failed(context, tree.end());
                return Err(SessionError::Materialization {
                    span_id: e.span_id,
                    source: e.source,
                });
            }
        };
        let span_count = spans.order().len();

        let replayed = decorate_spans(&tree, &spans, session, &self.tracer).and_then(|_| {
            replay(events, &tree, &mut spans, Some(context.root()), &self.tracer)
        });
        let stats = match replayed {
            Ok(stats) => stats,
            Err(e) => {
                spans.abandon(&tree, &self.tracer);
                close_failed(context, tree.end());
                return Err(e.into());
            }
        };
        debug!("Session {} replay: {:?}", session.session_id, stats);

        let root = context.finish(tree.end())?;
        Ok(SessionOutcome {
            session_id: session.session_id,
            trace_id: root.trace_id,
            spans: span_count,
            stats,
        })
    }

    fn replay_flat(
        &self,
        session: &SessionRecord,
        events: &[Event],
    ) -> std::result::Result<SessionOutcome, SessionError> {
        let mut context = SessionContext::start(
            session,
            &self.config.propagation_key,
            &self.tracer,
            &self.registry,
        )?;
        context.begin_annotating();

        let mut ordered: Vec<&Event> = events.iter().collect();
        ordered.sort_by_key(|e| e.replay_key());
        let mut stats = ReplayStats::default();
        for event in &ordered {
            self.tracer
                .annotate_span(context.root(), event.timestamp, &event.activity)?;
            stats.annotated += 1;
        }

        let end = ordered.iter().map(|e| e.timestamp + 1).max();
        let root = context.finish(end)?;
        Ok(SessionOutcome {
            session_id: session.session_id,
            trace_id: root.trace_id,
            spans: 0,
            stats,
        })
    }
}

/// Name, tag and start every real span; placeholders stay bare.
fn decorate_spans<T: Tracer + ?Sized>(
    tree: &SpanTree,
    spans: &Materialized,
    session: &SessionRecord,
    tracer: &T,
) -> std::result::Result<(), TracerError> {
    let name = session.query().unwrap_or(&session.command);
    for &id in spans.order() {
        let (node, handle) = match (tree.get(id), spans.get(id)) {
            (Some(node), Some(handle)) if !node.is_placeholder() => (node, handle),
            _ => continue,
        };
        tracer.name_span(handle, name)?;
        tracer.set_resource(handle, name)?;
        tracer.tag_span(handle, TAG_SPAN_ID, &id.to_string())?;
        if let Some(parent) = node.parent {
            tracer.tag_span(handle, TAG_PARENT_SPAN_ID, &parent.to_string())?;
        }
        tracer.set_remote_endpoint(handle, session.client)?;
        tracer.start_span(handle, node.start)?;
    }
    Ok(())
}

fn close_failed<T: Tracer + ?Sized>(context: SessionContext<'_, T>, end: Option<Micros>) {
    let session_id = context.session_id();
    if let Err(e) = context.finish(end) {
        debug!("Couldn't finish root of failed session {}: {}", session_id, e);
    }
}
