//! Rows of `system_traces.sessions` / `system_traces.events` and the
//! core `Event` derived from them.
//!
//! The `0` span id sentinel of the upstream schema stops here: an `Event`
//! carries `Option<SpanId>` for both its span and its parent.

use crate::graph::SpanId;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::{collections::HashMap, net::IpAddr};
use uuid::Uuid;

/// Microseconds since the Unix epoch.
pub type Micros = i64;

/// Offset between the RFC 4122 epoch (1582-10-15) and the Unix epoch, in 100ns ticks.
const GREGORIAN_TO_UNIX_TICKS: u64 = 0x01B2_1DD2_1381_4000;

/// One row of `system_traces.sessions`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub client: IpAddr,
    pub command: String,
    #[serde(default)]
    pub coordinator: Option<IpAddr>,
    #[serde(default)]
    pub duration: Option<i32>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub request_size: Option<i32>,
    #[serde(default)]
    pub response_size: Option<i32>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub started_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn started_at_micros(&self) -> Micros {
        self.started_at.timestamp_micros()
    }

    /// The CQL text of the request, when the coordinator recorded one.
    pub fn query(&self) -> Option<&str> {
        self.parameters.get("query").map(String::as_str)
    }
}

/// One row of `system_traces.events`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EventRecord {
    pub session_id: Uuid,
    pub event_id: Uuid,
    pub activity: String,
    #[serde(default)]
    pub scylla_parent_id: Option<i64>,
    #[serde(default)]
    pub scylla_span_id: Option<i64>,
    #[serde(default)]
    pub source: Option<IpAddr>,
    #[serde(default)]
    pub source_elapsed: Option<i32>,
    #[serde(default)]
    pub thread: Option<String>,
}

/// Where an event's timestamp is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    /// The time embedded in a time-based `event_id`, falling back to `Elapsed`.
    EventId,
    /// `started_at + source_elapsed` only.
    Elapsed,
}

impl Default for TimeSource {
    fn default() -> Self {
        TimeSource::EventId
    }
}

/// An event as the graph builder and replayer see it.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: Uuid,
    pub activity: String,
    pub span: Option<SpanId>,
    pub parent: Option<SpanId>,
    pub timestamp: Micros,
}

impl Event {
    pub fn from_record(record: &EventRecord, session_start: Micros, time_source: TimeSource) -> Event {
        Event {
            event_id: record.event_id,
            activity: record.activity.clone(),
            span: record.scylla_span_id.and_then(SpanId::from_raw),
            parent: record.scylla_parent_id.and_then(SpanId::from_raw),
            timestamp: event_time(record, session_start, time_source),
        }
    }

    /// Replay order: time, then the id's embedded ticks, then the id itself.
    pub fn replay_key(&self) -> (Micros, Option<u64>, Uuid) {
        (self.timestamp, time_uuid_ticks(&self.event_id), self.event_id)
    }
}

/// Derive the authoritative time of an event.
pub fn event_time(record: &EventRecord, session_start: Micros, time_source: TimeSource) -> Micros {
    let embedded = match time_source {
        TimeSource::EventId => time_uuid_micros(&record.event_id),
        TimeSource::Elapsed => None,
    };
    embedded.unwrap_or_else(|| session_start + i64::from(record.source_elapsed.unwrap_or(0)))
}

/// The 60-bit timestamp (100ns ticks since 1582-10-15) of a version 1 UUID.
pub fn time_uuid_ticks(id: &Uuid) -> Option<u64> {
    if id.get_version_num() != 1 {
        return None;
    }
    let (time_low, time_mid, time_hi_and_version, _) = id.as_fields();
    Some(
        (u64::from(time_hi_and_version & 0x0FFF) << 48)
            | (u64::from(time_mid) << 32)
            | u64::from(time_low),
    )
}

/// Unix microseconds embedded in a version 1 UUID, if it is one.
pub fn time_uuid_micros(id: &Uuid) -> Option<Micros> {
    time_uuid_ticks(id)?
        .checked_sub(GREGORIAN_TO_UNIX_TICKS)
        .map(|unix_ticks| (unix_ticks / 10) as Micros)
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("bad timestamp {:?}", raw)))
}

/// Accepts RFC 3339 and the cqlsh JSON form (`2016-09-07 16:56:30.123Z`).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let normalized = match raw.strip_suffix('Z') {
        Some(stripped) => format!("{}+0000", stripped),
        None => raw.to_string(),
    };
    if let Ok(ts) = DateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
