mod common;

use common::{event, session, Call, MemorySource, RecordingTracer};
use crossbeam_channel::unbounded;
use scylla_apm_sync::{
    error::TracerError, DatadogTracer, Error, LoaderConfig, Mode, SessionContext, SessionError,
    SessionRegistry, SessionState, TimeSource, TraceLoader, Tracer,
};

#[test]
fn test_cycle_skips_only_that_session() {
    let bad = session(1, 0);
    let good = session(2, 0);
    let mut source = MemorySource::default();
    source.add(
        bad.clone(),
        vec![event(&bad, 5, 7, 10, "a"), event(&bad, 7, 5, 11, "b")],
    );
    source.add(good.clone(), vec![event(&good, 1, 0, 10, "ok")]);

    let tracer = RecordingTracer::default();
    let loader = TraceLoader::new(source, &tracer, LoaderConfig::default());
    let summary = loader.run().unwrap();

    assert_eq!(summary.failed, vec![(bad.session_id, "MalformedGraph")]);
    assert_eq!(summary.completed.len(), 1);
    assert_eq!(summary.completed[0].session_id, good.session_id);
    // Nothing of the malformed session reached the backend.
    assert_eq!(tracer.creations().len(), 2);
    assert!(tracer.leaked().is_empty());
}

#[test]
fn test_materialization_failure_closes_partial_spans() {
    let s = session(3, 0);
    let next = session(4, 0);
    let mut source = MemorySource::default();
    source.add(
        s.clone(),
        vec![event(&s, 1, 0, 10, "a"), event(&s, 2, 1, 12, "b")],
    );
    source.add(next.clone(), vec![]);

    // Creation 1 is the session root, 2 is span 1, 3 would be span 2.
    let tracer = RecordingTracer::failing_at(
        3,
        TracerError::UnknownSpan {
            trace_id: 0,
            span_id: 0,
        },
    );
    let loader = TraceLoader::new(source, &tracer, LoaderConfig::default());
    let summary = loader.run().unwrap();

    assert_eq!(summary.failed, vec![(s.session_id, "MaterializationFailure")]);
    assert_eq!(summary.completed.len(), 1);
    assert!(loader.registry().is_empty());
    assert!(tracer.leaked().is_empty());

    let creations = tracer.creations();
    let (root, span_one) = (creations[0], creations[1]);
    let finish_span = tracer.position(&Call::Finish(span_one, 11)).unwrap();
    let finish_root = tracer.position(&Call::Finish(root, 11)).unwrap();
    assert!(finish_span < finish_root);
    assert!(tracer.annotations(&span_one).is_empty());
}

#[test]
fn test_disconnected_backend_is_fatal() {
    let s = session(5, 0);
    let mut source = MemorySource::default();
    source.add(s.clone(), vec![event(&s, 1, 0, 10, "a")]);
    source.add(session(6, 0), vec![]);

    let tracer = RecordingTracer::failing_at(2, TracerError::Disconnected);
    let loader = TraceLoader::new(source, &tracer, LoaderConfig::default());
    match loader.run() {
        Err(Error::Backend { session_id, source }) => {
            assert_eq!(session_id, s.session_id);
            assert_eq!(source.kind(), "MaterializationFailure");
        }
        other => panic!("expected fatal backend error, got {:?}", other.map(|_| ())),
    }
    // The second session was never started.
    assert_eq!(tracer.creations().len(), 1);
}

#[test]
fn test_source_failures() {
    let broken = session(7, 0);
    let fine = session(8, 0);
    let mut source = MemorySource::default();
    source.add(broken.clone(), vec![]);
    source.add(fine.clone(), vec![]);
    source.broken_sessions.insert(broken.session_id);

    let tracer = RecordingTracer::default();
    let summary = TraceLoader::new(source, &tracer, LoaderConfig::default())
        .run()
        .unwrap();
    assert_eq!(summary.failed, vec![(broken.session_id, "SourceFailure")]);
    assert_eq!(summary.completed.len(), 1);

    let unavailable = MemorySource {
        unavailable: true,
        ..Default::default()
    };
    let result = TraceLoader::new(unavailable, &tracer, LoaderConfig::default()).run();
    assert!(matches!(result, Err(Error::Source(_))));
}

#[test]
fn test_propagated_context_is_continued() {
    let mut s = session(9, 0);
    s.parameters.insert(
        "b3".to_string(),
        "80f198ee56343ba8-e457b5a2e4d86bd1-1".to_string(),
    );
    let mut source = MemorySource::default();
    source.add(s.clone(), vec![event(&s, 1, 0, 10, "a")]);

    let tracer = RecordingTracer::default();
    let summary = TraceLoader::new(source, &tracer, LoaderConfig::default())
        .run()
        .unwrap();

    match &tracer.calls()[0] {
        Call::NewRoot(root, Some(context)) => {
            assert_eq!(context.trace_id, 0x80f198ee56343ba8);
            assert_eq!(context.span_id, 0xe457b5a2e4d86bd1);
            assert_eq!(root.trace_id, 0x80f198ee56343ba8);
        }
        other => panic!("unexpected first call {:?}", other),
    }
    assert_eq!(summary.completed[0].trace_id, 0x80f198ee56343ba8);
    assert_eq!(tracer.handle_for(1).unwrap().trace_id, 0x80f198ee56343ba8);
}

#[test]
fn test_invalid_propagated_context_starts_fresh_trace() {
    let mut s = session(10, 0);
    s.parameters.insert("b3".to_string(), "not-a-context".to_string());
    let mut source = MemorySource::default();
    source.add(s, vec![]);

    let tracer = RecordingTracer::default();
    let summary = TraceLoader::new(source, &tracer, LoaderConfig::default())
        .run()
        .unwrap();
    assert_eq!(summary.completed.len(), 1);
    assert!(matches!(tracer.calls()[0], Call::NewRoot(_, None)));
}

#[test]
fn test_non_ascii_propagated_context_is_contained() {
    let mut s = session(16, 0);
    // 32 bytes, with a two-byte character straddling the high/low split.
    s.parameters.insert(
        "b3".to_string(),
        "aaaaaaaaaaaaaaa\u{e9}bbbbbbbbbbbbbbb-e457b5a2e4d86bd1".to_string(),
    );
    let next = session(17, 0);
    let mut source = MemorySource::default();
    source.add(s.clone(), vec![event(&s, 1, 0, 10, "a")]);
    source.add(next.clone(), vec![]);

    let tracer = RecordingTracer::default();
    let summary = TraceLoader::new(source, &tracer, LoaderConfig::default())
        .run()
        .unwrap();
    assert!(summary.failed.is_empty());
    assert_eq!(summary.completed.len(), 2);
    assert!(matches!(tracer.calls()[0], Call::NewRoot(_, None)));
}

#[test]
fn test_flat_mode_single_span() {
    let s = session(11, 0);
    let mut source = MemorySource::default();
    source.add(
        s.clone(),
        vec![
            event(&s, 1, 0, 30, "late"),
            event(&s, 2, 1, 10, "early"),
            event(&s, 0, 0, 20, "session"),
        ],
    );
    let config = LoaderConfig {
        mode: Mode::Flat,
        ..LoaderConfig::default()
    };
    let tracer = RecordingTracer::default();
    let summary = TraceLoader::new(source, &tracer, config).run().unwrap();

    assert_eq!(summary.completed[0].spans, 0);
    assert_eq!(tracer.creations().len(), 1);
    let root = tracer.session_root();
    let texts: Vec<String> = tracer.annotations(&root).into_iter().map(|(_, t)| t).collect();
    assert_eq!(texts, vec!["early", "session", "late"]);
    assert_eq!(tracer.finishes(&root), vec![31]);
}

#[test]
fn test_flat_mode_ties_follow_event_id() {
    let s = session(18, 0);
    let first = event(&s, 1, 0, 10, "first by id");
    let second = event(&s, 1, 0, 10, "second by id");
    let mut source = MemorySource::default();
    source.add(s, vec![second, first]);
    let config = LoaderConfig {
        mode: Mode::Flat,
        ..LoaderConfig::default()
    };
    let tracer = RecordingTracer::default();
    TraceLoader::new(source, &tracer, config).run().unwrap();

    let root = tracer.session_root();
    let texts: Vec<String> = tracer.annotations(&root).into_iter().map(|(_, t)| t).collect();
    assert_eq!(texts, vec!["first by id", "second by id"]);
}

#[test]
fn test_elapsed_time_source() {
    let s = session(15, 1_000);
    let mut early = event(&s, 1, 0, 999_999, "first");
    early.source_elapsed = Some(20);
    let mut late = event(&s, 1, 0, 5, "second");
    late.source_elapsed = Some(70);
    let mut source = MemorySource::default();
    source.add(s, vec![late, early]);

    let config = LoaderConfig {
        time_source: TimeSource::Elapsed,
        ..LoaderConfig::default()
    };
    let tracer = RecordingTracer::default();
    TraceLoader::new(source, &tracer, config).run().unwrap();

    let one = tracer.handle_for(1).unwrap();
    assert_eq!(tracer.starts(&one), vec![1_020]);
    assert_eq!(
        tracer.annotations(&one),
        vec![(1_020, "first".to_string()), (1_070, "second".to_string())]
    );
    assert_eq!(tracer.finishes(&one), vec![1_071]);
}

#[test]
fn test_session_context_lifecycle() {
    let s = session(12, 500);
    let tracer = RecordingTracer::default();
    let registry = SessionRegistry::new();

    let mut context = SessionContext::start(&s, "b3", &tracer, &registry).unwrap();
    assert_eq!(context.state(), SessionState::Started);
    assert_eq!(registry.get(&s.session_id), Some(*context.root()));

    match SessionContext::start(&s, "b3", &tracer, &registry) {
        Err(SessionError::SessionAlreadyActive(id)) => assert_eq!(id, s.session_id),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("second start of an in-flight session succeeded"),
    }

    context.begin_annotating();
    assert_eq!(context.state(), SessionState::Annotating);
    // A root never ends before its session started.
    let root = context.finish(Some(100)).unwrap();
    assert_eq!(tracer.finishes(&root), vec![500]);
    assert!(registry.is_empty());
}

#[test]
fn test_dropped_context_is_evicted_and_discarded() {
    let s = session(13, 0);
    let tracer = RecordingTracer::default();
    let registry = SessionRegistry::new();
    let root = {
        let context = SessionContext::start(&s, "b3", &tracer, &registry).unwrap();
        *context.root()
    };
    assert!(registry.is_empty());
    assert!(tracer.discarded(&root));
    assert!(tracer.finishes(&root).is_empty());
}

#[test]
fn test_end_to_end_with_datadog_tracer() {
    let s = session(14, 50);
    let mut source = MemorySource::default();
    source.add(
        s.clone(),
        vec![
            event(&s, 1, 0, 100, "A"),
            event(&s, 2, 1, 105, "B"),
            event(&s, 3, 42, 107, "under placeholder"),
            event(&s, 1, 0, 110, "C"),
        ],
    );

    let (sender, receiver) = unbounded();
    let tracer = DatadogTracer::with_sender(sender);
    let summary = TraceLoader::new(source, &tracer, LoaderConfig::default())
        .run()
        .unwrap();
    assert_eq!(tracer.open_spans(), 0);

    let stack = receiver.try_recv().unwrap();
    assert!(receiver.try_recv().is_err());
    // Session span plus spans 1, 2 and 3; the placeholder is not reported.
    assert_eq!(stack.len(), 4);
    let trace_id = summary.completed[0].trace_id;
    assert!(stack.iter().all(|span| span.trace_id == trace_id));

    let root = stack.iter().find(|span| span.parent_id.is_none()).unwrap();
    assert_eq!((root.name.as_str(), root.start, root.duration), ("QUERY", 50, 61));
    let one = stack
        .iter()
        .find(|span| span.tags.get("scylla.span_id").map(String::as_str) == Some("1"))
        .unwrap();
    assert_eq!(one.parent_id, Some(root.id));
    assert_eq!((one.start, one.duration), (100, 11));
    assert_eq!(one.annotations.len(), 2);
    assert!(tracer.decode_propagated_context("bogus").is_err());
}
