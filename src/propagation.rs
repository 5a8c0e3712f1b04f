//! Upstream trace context carried in a session's parameters.
//!
//! Only the B3 single-header form is understood:
//! `{trace_id}-{span_id}[-{sampling}[-{parent_span_id}]]`, where the trace id
//! is 16 or 32 lower-hex characters and span ids are 16.

use crate::error::PropagationError;

/// Parameter key that carries a B3 single-header token.
pub const B3_PARAMETER: &str = "b3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanContext {
    /// Low 64 bits of the trace id; the whole id for 64-bit traces.
    pub trace_id: u64,
    /// High 64 bits of a 128-bit trace id.
    pub trace_id_high: Option<u64>,
    pub span_id: u64,
}

pub fn decode_b3_single(token: &str) -> Result<SpanContext, PropagationError> {
    let token = token.trim();
    let invalid = |reason| PropagationError::Invalid {
        token: token.to_string(),
        reason,
    };

    let mut fields = token.split('-');
    let trace = fields.next().unwrap_or_default();
    let span = fields.next().ok_or_else(|| invalid("missing span id"))?;
    let sampling = fields.next();
    let parent = fields.next();
    if fields.next().is_some() {
        return Err(invalid("too many fields"));
    }

    if !trace.is_ascii() {
        return Err(invalid("bad trace id"));
    }
    let (trace_id_high, trace_id) = match trace.len() {
        16 => (None, parse_id(trace).ok_or_else(|| invalid("bad trace id"))?),
        32 => {
            let high = parse_id(&trace[..16]).ok_or_else(|| invalid("bad trace id"))?;
            let low = parse_id(&trace[16..]).ok_or_else(|| invalid("bad trace id"))?;
            (Some(high).filter(|h| *h != 0), low)
        }
        _ => return Err(invalid("trace id must be 16 or 32 hex characters")),
    };
    if trace_id == 0 && trace_id_high.is_none() {
        return Err(invalid("zero trace id"));
    }

    if span.len() != 16 {
        return Err(invalid("span id must be 16 hex characters"));
    }
    let span_id = parse_id(span).ok_or_else(|| invalid("bad span id"))?;
    if span_id == 0 {
        return Err(invalid("zero span id"));
    }

    // Every session is replayed; the sampling state is only validated.
    if !matches!(sampling, None | Some("0") | Some("1") | Some("d")) {
        return Err(invalid("bad sampling state"));
    }
    if let Some(parent) = parent {
        if parent.len() != 16 || parse_id(parent).is_none() {
            return Err(invalid("bad parent span id"));
        }
    }

    Ok(SpanContext {
        trace_id,
        trace_id_high,
        span_id,
    })
}

fn parse_id(hex: &str) -> Option<u64> {
    if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}
