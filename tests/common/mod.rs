#![allow(dead_code)]

use chrono::{DateTime, Utc};
use scylla_apm_sync::{
    error::{SourceError, TracerError},
    propagation::SpanContext,
    EventRecord, Micros, RecordSource, SessionRecord, SpanHandle, Tracer,
};
use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    net::IpAddr,
};
use uuid::Uuid;

const GREGORIAN_TO_UNIX_TICKS: u64 = 0x01B2_1DD2_1381_4000;

/// A version 1 UUID carrying `micros`; `seq` keeps ids with equal times distinct.
pub fn time_uuid(micros: Micros, seq: u16) -> Uuid {
    let ticks = micros as u64 * 10 + GREGORIAN_TO_UNIX_TICKS;
    Uuid::from_fields(
        ticks as u32,
        (ticks >> 32) as u16,
        ((ticks >> 48) as u16 & 0x0FFF) | 0x1000,
        &[0x80 | (seq >> 8) as u8 & 0x3F, seq as u8, 0, 0, 0, 0, 0, 1],
    )
}

pub fn micros(ts: Micros) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts).unwrap()
}

pub fn session(id: u128, started_at: Micros) -> SessionRecord {
    SessionRecord {
        session_id: Uuid::from_u128(id),
        client: "10.0.0.7".parse().unwrap(),
        command: "QUERY".to_string(),
        coordinator: Some("10.0.0.1".parse().unwrap()),
        duration: None,
        parameters: [("query".to_string(), "SELECT * FROM ks.t".to_string())]
            .into_iter()
            .collect(),
        request: Some("Execute CQL3 query".to_string()),
        request_size: None,
        response_size: None,
        started_at: micros(started_at),
    }
}

/// An event row whose timeuuid carries `ts`.
pub fn event(session: &SessionRecord, span: i64, parent: i64, ts: Micros, activity: &str) -> EventRecord {
    thread_local!(static SEQ: Cell<u16> = Cell::new(0));
    let seq = SEQ.with(|s| {
        s.set(s.get().wrapping_add(1));
        s.get()
    });
    EventRecord {
        session_id: session.session_id,
        event_id: time_uuid(ts, seq),
        activity: activity.to_string(),
        scylla_parent_id: Some(parent),
        scylla_span_id: Some(span),
        source: None,
        source_elapsed: None,
        thread: None,
    }
}

#[derive(Default)]
pub struct MemorySource {
    pub sessions: Vec<SessionRecord>,
    pub events: HashMap<Uuid, Vec<EventRecord>>,
    pub broken_sessions: HashSet<Uuid>,
    pub unavailable: bool,
}

impl MemorySource {
    pub fn add(&mut self, session: SessionRecord, events: Vec<EventRecord>) {
        self.events.insert(session.session_id, events);
        self.sessions.push(session);
    }
}

impl RecordSource for MemorySource {
    fn fetch_sessions(&self) -> Result<Vec<SessionRecord>, SourceError> {
        if self.unavailable {
            return Err(SourceError::Unavailable("connection refused".into()));
        }
        Ok(self.sessions.clone())
    }

    fn fetch_events(&self, session_id: Uuid) -> Result<Vec<EventRecord>, SourceError> {
        if self.broken_sessions.contains(&session_id) {
            return Err(SourceError::Unavailable("read timeout".into()));
        }
        Ok(self.events.get(&session_id).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    NewRoot(SpanHandle, Option<SpanContext>),
    NewChild(SpanHandle, SpanHandle),
    Name(SpanHandle, String),
    Resource(SpanHandle, String),
    Tag(SpanHandle, String, String),
    Remote(SpanHandle, IpAddr),
    Start(SpanHandle, Micros),
    Annotate(SpanHandle, Micros, String),
    Finish(SpanHandle, Micros),
    Discard(SpanHandle),
}

/// Records every backend call in order; span ids are issued sequentially.
#[derive(Default)]
pub struct RecordingTracer {
    calls: RefCell<Vec<Call>>,
    next_id: Cell<u64>,
    /// Fail the n-th (1-based) span creation with this error.
    pub fail_creation: Option<(u64, TracerError)>,
}

impl RecordingTracer {
    pub fn failing_at(creation: u64, error: TracerError) -> Self {
        RecordingTracer {
            fail_creation: Some((creation, error)),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    fn issue(&self, trace_id: Option<u64>) -> Result<SpanHandle, TracerError> {
        let n = self.next_id.get() + 1;
        self.next_id.set(n);
        if let Some((at, error)) = &self.fail_creation {
            if *at == n {
                return Err(error.clone());
            }
        }
        Ok(SpanHandle {
            trace_id: trace_id.unwrap_or(1000 + n),
            span_id: n,
        })
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    /// Position in the call log at which `handle` was created.
    pub fn created_at(&self, handle: &SpanHandle) -> Option<usize> {
        self.calls.borrow().iter().position(|c| match c {
            Call::NewRoot(h, _) | Call::NewChild(h, _) => h == handle,
            _ => false,
        })
    }

    pub fn creations(&self) -> Vec<SpanHandle> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::NewRoot(h, _) | Call::NewChild(h, _) => Some(*h),
                _ => None,
            })
            .collect()
    }

    /// The first span created: the session root.
    pub fn session_root(&self) -> SpanHandle {
        self.creations()[0]
    }

    /// Handle tagged with the given Scylla span id.
    pub fn handle_for(&self, scylla_span: u64) -> Option<SpanHandle> {
        let wanted = scylla_span.to_string();
        self.calls.borrow().iter().find_map(|c| match c {
            Call::Tag(h, k, v) if k == "scylla.span_id" && *v == wanted => Some(*h),
            _ => None,
        })
    }

    pub fn annotations(&self, handle: &SpanHandle) -> Vec<(Micros, String)> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Annotate(h, ts, text) if h == handle => Some((*ts, text.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn starts(&self, handle: &SpanHandle) -> Vec<Micros> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Start(h, ts) if h == handle => Some(*ts),
                _ => None,
            })
            .collect()
    }

    pub fn finishes(&self, handle: &SpanHandle) -> Vec<Micros> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Finish(h, ts) if h == handle => Some(*ts),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls.borrow().iter().position(|c| c == call)
    }

    pub fn discarded(&self, handle: &SpanHandle) -> bool {
        self.position(&Call::Discard(*handle)).is_some()
    }

    /// Handles created but never finished nor discarded.
    pub fn leaked(&self) -> Vec<SpanHandle> {
        self.creations()
            .into_iter()
            .filter(|h| self.finishes(h).is_empty() && !self.discarded(h))
            .collect()
    }
}

impl Tracer for RecordingTracer {
    fn new_root_span(&self, continued: Option<&SpanContext>) -> Result<SpanHandle, TracerError> {
        let handle = self.issue(continued.map(|c| c.trace_id))?;
        self.record(Call::NewRoot(handle, continued.copied()));
        Ok(handle)
    }

    fn new_child_span(&self, parent: &SpanHandle) -> Result<SpanHandle, TracerError> {
        let handle = self.issue(Some(parent.trace_id))?;
        self.record(Call::NewChild(handle, *parent));
        Ok(handle)
    }

    fn name_span(&self, handle: &SpanHandle, name: &str) -> Result<(), TracerError> {
        self.record(Call::Name(*handle, name.to_string()));
        Ok(())
    }

    fn set_resource(&self, handle: &SpanHandle, resource: &str) -> Result<(), TracerError> {
        self.record(Call::Resource(*handle, resource.to_string()));
        Ok(())
    }

    fn tag_span(&self, handle: &SpanHandle, key: &str, value: &str) -> Result<(), TracerError> {
        self.record(Call::Tag(*handle, key.to_string(), value.to_string()));
        Ok(())
    }

    fn set_remote_endpoint(&self, handle: &SpanHandle, address: IpAddr) -> Result<(), TracerError> {
        self.record(Call::Remote(*handle, address));
        Ok(())
    }

    fn start_span(&self, handle: &SpanHandle, timestamp: Micros) -> Result<(), TracerError> {
        self.record(Call::Start(*handle, timestamp));
        Ok(())
    }

    fn annotate_span(&self, handle: &SpanHandle, timestamp: Micros, text: &str) -> Result<(), TracerError> {
        self.record(Call::Annotate(*handle, timestamp, text.to_string()));
        Ok(())
    }

    fn finish_span(&self, handle: &SpanHandle, timestamp: Micros) -> Result<(), TracerError> {
        self.record(Call::Finish(*handle, timestamp));
        Ok(())
    }

    fn discard_span(&self, handle: &SpanHandle) -> Result<(), TracerError> {
        self.record(Call::Discard(*handle));
        Ok(())
    }
}
