use crate::{
    api::encode_trace,
    error::TracerError,
    model::{Annotation, Span, SpanHandle},
    propagation::SpanContext,
    record::Micros,
    tracer::Tracer,
};
use crossbeam_channel::{Receiver, Sender};
use log::{error, trace, warn};
use rand::Rng;
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Mutex, MutexGuard},
    thread::JoinHandle,
};

/// Meta key carrying the high 64 bits of a 128-bit upstream trace id.
pub const META_TRACE_ID_HIGH: &str = "_dd.p.tid";

/// Configuration settings for the client.
#[derive(Clone, Debug)]
pub struct Config {
    /// Datadog apm service name
    pub service: String,
    /// Datadog apm environment
    pub env: Option<String>,
    /// Datadog agent host/ip, defaults to `localhost`.
    pub host: String,
    /// Datadog agent port, defaults to `8126`.
    pub port: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            env: None,
            host: "localhost".to_string(),
            port: "8126".to_string(),
            service: "scylla".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SpanCollection {
    completed_spans: Vec<Span>,
    open_spans: HashMap<u64, Span>,
}

impl SpanCollection {
    fn start_span(&mut self, span: Span) {
        self.open_spans.insert(span.id, span);
    }

    // Move span to "completed". Return if there are open spans left or not.
    fn end_span(&mut self, span_id: u64, timestamp: Micros) -> Option<bool> {
        let span = self.open_spans.remove(&span_id)?;
        self.completed_spans.push(Span {
            duration: (timestamp - span.start).max(0),
            ..span
        });
        Some(self.open_spans.is_empty())
    }

    fn discard_span(&mut self, span_id: u64) -> Option<bool> {
        self.open_spans.remove(&span_id)?;
        Some(self.open_spans.is_empty())
    }

    fn drain(&mut self) -> Vec<Span> {
        self.completed_spans.drain(..).collect()
    }
}

#[derive(Default)]
struct SpanStorage {
    traces: HashMap<u64, SpanCollection>,
}

impl SpanStorage {
    fn start_span(&mut self, span: Span) {
        self.traces.entry(span.trace_id).or_default().start_span(span);
    }

    fn with_open<F>(&mut self, handle: &SpanHandle, f: F) -> Result<(), TracerError>
    where
        F: FnOnce(&mut Span),
    {
        self.traces
            .get_mut(&handle.trace_id)
            .and_then(|ss| ss.open_spans.get_mut(&handle.span_id))
            .map(f)
            .ok_or(TracerError::UnknownSpan {
                trace_id: handle.trace_id,
                span_id: handle.span_id,
            })
    }

    /// Close a span and return the drained trace if it was the last one open.
    fn close_span(
        &mut self,
        handle: &SpanHandle,
        finish_at: Option<Micros>,
    ) -> Result<Option<Vec<Span>>, TracerError> {
        let unknown = TracerError::UnknownSpan {
            trace_id: handle.trace_id,
            span_id: handle.span_id,
        };
        let ss = self.traces.get_mut(&handle.trace_id).ok_or(unknown.clone())?;
        let emptied = match finish_at {
            Some(timestamp) => ss.end_span(handle.span_id, timestamp),
            None => ss.discard_span(handle.span_id),
        }
        .ok_or(unknown)?;
        if !emptied {
            return Ok(None);
        }
        let stack = self
            .traces
            .remove(&handle.trace_id)
            .map(|mut ss| ss.drain())
            .unwrap_or_default();
        Ok(Some(stack).filter(|stack| !stack.is_empty()))
    }

    fn open_count(&self) -> usize {
        self.traces.values().map(|ss| ss.open_spans.len()).sum()
    }
}

fn agent_loop(client: DdAgentClient, buffer_receiver: Receiver<Vec<Span>>) {
    for stack in buffer_receiver.iter() {
        client.send(stack);
    }
    trace!("Trace channel closed, agent sender exiting");
}

/// A `Tracer` that reports finished traces to a Datadog agent.
///
/// A trace is handed to the sender thread once its last open span closes.
pub struct DatadogTracer {
    storage: Mutex<SpanStorage>,
    buffer_sender: Option<Sender<Vec<Span>>>,
    worker: Option<JoinHandle<()>>,
}

impl DatadogTracer {
    pub fn new(config: Config) -> DatadogTracer {
        let (buffer_sender, buffer_receiver) = crossbeam_channel::unbounded();

        let client = DdAgentClient {
            env: config.env,
            service: config.service,
            endpoint: format!("http://{}:{}/v0.3/traces", config.host, config.port),
        };
        let worker = std::thread::spawn(move || {
            agent_loop(client, buffer_receiver);
        });

        DatadogTracer {
            storage: Mutex::new(SpanStorage::default()),
            buffer_sender: Some(buffer_sender),
            worker: Some(worker),
        }
    }

    /// Deliver completed traces to `sender` instead of an agent.
    pub fn with_sender(sender: Sender<Vec<Span>>) -> DatadogTracer {
        DatadogTracer {
            storage: Mutex::new(SpanStorage::default()),
            buffer_sender: Some(sender),
            worker: None,
        }
    }

    /// Spans created but not yet finished or discarded.
    pub fn open_spans(&self) -> usize {
        self.storage().map(|s| s.open_count()).unwrap_or(0)
    }

    /// Stop accepting traces and wait until every queued one has been sent.
    pub fn close(mut self) {
        let open = self.open_spans();
        if open > 0 {
            warn!("Closing tracer with {} unfinished span(s)", open);
        }
        self.buffer_sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Agent sender thread panicked");
            }
        }
    }

    fn storage(&self) -> Result<MutexGuard<'_, SpanStorage>, TracerError> {
        self.storage.lock().map_err(|_| TracerError::Poisoned)
    }

    fn send_trace(&self, stack: Vec<Span>) -> Result<(), TracerError> {
        self.buffer_sender
            .as_ref()
            .ok_or(TracerError::Disconnected)?
            .send(stack)
            .map_err(|_| TracerError::Disconnected)
    }

    fn close_span(&self, handle: &SpanHandle, finish_at: Option<Micros>) -> Result<(), TracerError> {
        let drained = self.storage()?.close_span(handle, finish_at)?;
        match drained {
            Some(stack) => self.send_trace(stack),
            None => Ok(()),
        }
    }

    // A local parent may carry the high half of a 128-bit upstream trace id.
    fn inherited_trace_id_high(&self, parent: &SpanHandle) -> Result<Option<String>, TracerError> {
        let mut high = None;
        // An unknown parent is an upstream span, not an error.
        let _ = self.storage()?.with_open(parent, |p| {
            high = p.tags.get(META_TRACE_ID_HIGH).cloned();
        });
        Ok(high)
    }

    fn open_span(&self, span: Span) -> Result<SpanHandle, TracerError> {
        let handle = SpanHandle {
            trace_id: span.trace_id,
            span_id: span.id,
        };
        self.storage()?.start_span(span);
        Ok(handle)
    }
}

fn new_id() -> u64 {
    rand::thread_rng().gen_range(1..=i64::MAX as u64)
}

impl Tracer for DatadogTracer {
    fn new_root_span(&self, continued: Option<&SpanContext>) -> Result<SpanHandle, TracerError> {
        let context = match continued {
            Some(context) => context,
            None => return self.open_span(Span::new(new_id(), new_id(), None)),
        };
        let mut span = Span::new(context.trace_id, new_id(), Some(context.span_id));
        let high = match context.trace_id_high {
            Some(high) => Some(format!("{:016x}", high)),
            None => self.inherited_trace_id_high(&SpanHandle {
                trace_id: context.trace_id,
                span_id: context.span_id,
            })?,
        };
        if let Some(high) = high {
            span.tags.insert(META_TRACE_ID_HIGH.to_string(), high);
        }
        self.open_span(span)
    }

    fn new_child_span(&self, parent: &SpanHandle) -> Result<SpanHandle, TracerError> {
        let mut storage = self.storage()?;
        let mut span = Span::new(parent.trace_id, new_id(), Some(parent.span_id));
        storage.with_open(parent, |p| {
            if let Some(high) = p.tags.get(META_TRACE_ID_HIGH) {
                span.tags.insert(META_TRACE_ID_HIGH.to_string(), high.clone());
            }
        })?;
        let handle = SpanHandle {
            trace_id: span.trace_id,
            span_id: span.id,
        };
        storage.start_span(span);
        Ok(handle)
    }

    fn name_span(&self, handle: &SpanHandle, name: &str) -> Result<(), TracerError> {
        self.storage()?.with_open(handle, |span| span.name = name.to_string())
    }

    fn set_resource(&self, handle: &SpanHandle, resource: &str) -> Result<(), TracerError> {
        self.storage()?
            .with_open(handle, |span| span.resource = resource.to_string())
    }

    fn tag_span(&self, handle: &SpanHandle, key: &str, value: &str) -> Result<(), TracerError> {
        self.storage()?.with_open(handle, |span| {
            span.tags.insert(key.to_string(), value.to_string());
        })
    }

    fn set_remote_endpoint(&self, handle: &SpanHandle, address: IpAddr) -> Result<(), TracerError> {
        self.storage()?
            .with_open(handle, |span| span.remote_endpoint = Some(address))
    }

    fn start_span(&self, handle: &SpanHandle, timestamp: Micros) -> Result<(), TracerError> {
        self.storage()?.with_open(handle, |span| span.start = timestamp)
    }

    fn annotate_span(&self, handle: &SpanHandle, timestamp: Micros, text: &str) -> Result<(), TracerError> {
        self.storage()?.with_open(handle, |span| {
            span.annotations.push(Annotation {
                timestamp,
                value: text.to_string(),
            })
        })
    }

    fn finish_span(&self, handle: &SpanHandle, timestamp: Micros) -> Result<(), TracerError> {
        self.close_span(handle, Some(timestamp))
    }

    fn discard_span(&self, handle: &SpanHandle) -> Result<(), TracerError> {
        self.close_span(handle, None)
    }
}

impl Drop for DatadogTracer {
    fn drop(&mut self) {
        self.buffer_sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[derive(Debug, Clone)]
struct DdAgentClient {
    env: Option<String>,
    endpoint: String,
    service: String,
}

impl DdAgentClient {
    fn send(&self, stack: Vec<Span>) {
        let payload = encode_trace(&stack, &self.service, self.env.as_deref());
        trace!("Sending {} span(s) to agent at {}", stack.len(), self.endpoint);

        let req = match attohttpc::post(&self.endpoint)
            .header("X-Datadog-Trace-Count", "1")
            .json(&payload)
        {
            Ok(req) => req,
            Err(e) => {
                warn!("Couldn't encode payload for datadog: {:?}", e);
                return;
            }
        };
        match req.send() {
            Ok(resp) if resp.is_success() => trace!("Sent to agent: {:?}", resp.status()),
            Ok(resp) => error!("error from datadog agent: {:?}", resp.status()),
            Err(err) => error!("error sending traces to datadog: {:?}", err),
        }
    }
}
