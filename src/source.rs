use crate::{
    error::SourceError,
    record::{time_uuid_ticks, EventRecord, SessionRecord},
};
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};
use uuid::Uuid;

/// Where finished tracing sessions come from.
pub trait RecordSource {
    fn fetch_sessions(&self) -> Result<Vec<SessionRecord>, SourceError>;

    /// Events of one session, ordered by `event_id`.
    fn fetch_events(&self, session_id: Uuid) -> Result<Vec<EventRecord>, SourceError>;
}

/// An export of `system_traces` made with `SELECT JSON * FROM ...`, one row per line.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    sessions: Vec<SessionRecord>,
    events: HashMap<Uuid, Vec<EventRecord>>,
}

impl JsonLinesSource {
    pub fn open(sessions: impl AsRef<Path>, events: impl AsRef<Path>) -> Result<Self, SourceError> {
        let sessions: Vec<SessionRecord> = read_rows(sessions.as_ref())?;
        let mut grouped: HashMap<Uuid, Vec<EventRecord>> = HashMap::new();
        for event in read_rows::<EventRecord>(events.as_ref())? {
            grouped.entry(event.session_id).or_default().push(event);
        }
        for group in grouped.values_mut() {
            group.sort_by_key(|e| (time_uuid_ticks(&e.event_id), e.event_id));
        }
        Ok(JsonLinesSource {
            sessions,
            events: grouped,
        })
    }
}

impl RecordSource for JsonLinesSource {
    fn fetch_sessions(&self) -> Result<Vec<SessionRecord>, SourceError> {
        Ok(self.sessions.clone())
    }

    fn fetch_events(&self, session_id: Uuid) -> Result<Vec<EventRecord>, SourceError> {
        Ok(self.events.get(&session_id).cloned().unwrap_or_default())
    }
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, SourceError> {
    let io_err = |source: std::io::Error| SourceError::Io {
        path: PathBuf::from(path),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut rows = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row = serde_json::from_str(line).map_err(|source| SourceError::Row {
            path: PathBuf::from(path),
            line: index + 1,
            source,
        })?;
        rows.push(row);
    }
    Ok(rows)
}
