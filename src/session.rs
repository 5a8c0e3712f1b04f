//! Per-session root span lifecycle.
//!
//! A `SessionContext` is passed explicitly through the pipeline; nothing about
//! the session in flight is kept in thread-local state.

use crate::{
    error::{SessionError, TracerError},
    model::SpanHandle,
    propagation::SpanContext,
    record::{Micros, SessionRecord},
    tracer::Tracer,
};
use log::{debug, warn};
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};
use uuid::Uuid;

pub const TAG_REQUEST: &str = "cassandra.request";
pub const TAG_QUERY: &str = "cassandra.query";
pub const TAG_SESSION_ID: &str = "cassandra.session_id";
pub const TAG_COORDINATOR: &str = "cassandra.coordinator";
pub const TAG_SPAN_KIND: &str = "span.kind";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Started,
    Annotating,
    Finished,
}

/// Sessions currently in flight, keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SpanHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, session_id: Uuid, root: SpanHandle) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&session_id) {
            return Err(SessionError::SessionAlreadyActive(session_id));
        }
        sessions.insert(session_id, root);
        Ok(())
    }

    fn remove(&self, session_id: &Uuid) -> Option<SpanHandle> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
    }

    pub fn get(&self, session_id: &Uuid) -> Option<SpanHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The root span of one session and the state of its processing.
///
/// Dropping a context that never reached `Finished` evicts it from the
/// registry and discards the root span.
pub struct SessionContext<'a, T: Tracer + ?Sized> {
    session_id: Uuid,
    root: SpanHandle,
    started_at: Micros,
    state: SessionState,
    tracer: &'a T,
    registry: &'a SessionRegistry,
}

impl<'a, T: Tracer + ?Sized> SessionContext<'a, T> {
    /// Open the session's root span, continuing the propagated context found
    /// under `propagation_key` when it decodes.
    pub fn start(
        session: &SessionRecord,
        propagation_key: &str,
        tracer: &'a T,
        registry: &'a SessionRegistry,
    ) -> Result<Self, SessionError> {
        if registry.get(&session.session_id).is_some() {
            return Err(SessionError::SessionAlreadyActive(session.session_id));
        }

        let continued = session
            .parameters
            .get(propagation_key)
            .and_then(|token| match tracer.decode_propagated_context(token) {
                Ok(context) => Some(context),
                Err(e) => {
                    warn!(
                        "PropagatedContextInvalid for session {}, starting a new trace: {}",
                        session.session_id, e
                    );
                    None
                }
            });
        let root = tracer.new_root_span(continued.as_ref())?;

        if let Err(e) = decorate_root(tracer, &root, session) {
            discard_root(tracer, &root, session.session_id);
            return Err(e.into());
        }
        if let Err(e) = registry.insert(session.session_id, root) {
            discard_root(tracer, &root, session.session_id);
            return Err(e);
        }

        Ok(SessionContext {
            session_id: session.session_id,
            root,
            started_at: session.started_at_micros(),
            state: SessionState::Started,
            tracer,
            registry,
        })
    }

    pub fn begin_annotating(&mut self) {
        if self.state == SessionState::Started {
            self.state = SessionState::Annotating;
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn root(&self) -> &SpanHandle {
        &self.root
    }

    pub fn root_context(&self) -> SpanContext {
        self.root.context()
    }

    pub fn started_at(&self) -> Micros {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Finish the root span and evict the session.
    ///
    /// `end` is the latest time observed in the session; the root never ends
    /// before `started_at` and ends exactly there when nothing was observed.
    pub fn finish(mut self, end: Option<Micros>) -> Result<SpanHandle, SessionError> {
        let timestamp = end.map_or(self.started_at, |end| end.max(self.started_at));
        self.state = SessionState::Finished;
        self.registry.remove(&self.session_id);
        self.tracer.finish_span(&self.root, timestamp)?;
        Ok(self.root)
    }
}

impl<T: Tracer + ?Sized> Drop for SessionContext<'_, T> {
    fn drop(&mut self) {
        if self.state == SessionState::Finished {
            return;
        }
        self.registry.remove(&self.session_id);
        discard_root(self.tracer, &self.root, self.session_id);
    }
}

fn discard_root<T: Tracer + ?Sized>(tracer: &T, root: &SpanHandle, session_id: Uuid) {
    if let Err(e) = tracer.discard_span(root) {
        debug!("Couldn't discard root of session {}: {}", session_id, e);
    }
}

fn decorate_root<T: Tracer + ?Sized>(
    tracer: &T,
    root: &SpanHandle,
    session: &SessionRecord,
) -> Result<(), TracerError> {
    let request = session.request.as_deref().unwrap_or(&session.command);
    tracer.name_span(root, &session.command)?;
    tracer.set_resource(root, session.query().unwrap_or(&session.command))?;
    tracer.tag_span(root, TAG_SPAN_KIND, "server")?;
    tracer.tag_span(root, TAG_REQUEST, request)?;
    tracer.tag_span(root, TAG_SESSION_ID, &session.session_id.to_string())?;
    if let Some(query) = session.query() {
        tracer.tag_span(root, TAG_QUERY, query)?;
    }
    if let Some(coordinator) = session.coordinator {
        tracer.tag_span(root, TAG_COORDINATOR, &coordinator.to_string())?;
    }
    tracer.set_remote_endpoint(root, session.client)?;
    tracer.start_span(root, session.started_at_micros())
}
