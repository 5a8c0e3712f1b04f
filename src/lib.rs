pub mod api;
pub mod client;
pub mod error;
pub mod graph;
pub mod loader;
pub mod logger;
pub mod materialize;
pub mod model;
pub mod propagation;
pub mod record;
pub mod replay;
pub mod session;
pub mod source;
pub mod tracer;

pub use crate::{
    client::{Config, DatadogTracer},
    error::{Error, GraphError, SessionError, TracerError},
    graph::{SpanId, SpanNode, SpanTree},
    loader::{LoaderConfig, Mode, RunSummary, TraceLoader},
    logger::{ConsoleLogger, LoggingConfig},
    materialize::{materialize, Materialized},
    model::{Span, SpanHandle},
    record::{Event, EventRecord, Micros, SessionRecord, TimeSource},
    replay::{replay, ReplayStats},
    session::{SessionContext, SessionRegistry, SessionState},
    source::{JsonLinesSource, RecordSource},
    tracer::Tracer,
};
