//! W3C trace-context handling for inbound events.
//!
//! Producers put a `traceparent` into the event carrier so the relay span can
//! join their trace. Anything that does not parse is dropped and the relay
//! starts a new root trace instead; tracing never fails a request.

use crate::envelope::Carrier;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceparentError {
    #[error("traceparent has the wrong number of fields")]
    WrongFieldCount,
    #[error("traceparent version is invalid")]
    InvalidVersion,
    #[error("trace id must be 32 lowercase hex characters and not all zeros")]
    InvalidTraceId,
    #[error("parent id must be 16 lowercase hex characters and not all zeros")]
    InvalidSpanId,
    #[error("trace flags must be 2 lowercase hex characters")]
    InvalidFlags,
}

/// 16 byte trace identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub fn random() -> Self {
        TraceId(Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl FromStr for TraceId {
    type Err = TraceparentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match decode_hex::<16>(s) {
            Some(bytes) if bytes != [0; 16] => Ok(TraceId(bytes)),
            _ => Err(TraceparentError::InvalidTraceId),
        }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// 8 byte span identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub fn random() -> Self {
        loop {
            let (high, low) = Uuid::new_v4().as_u64_pair();
            let id = high ^ low;
            if id != 0 {
                return SpanId(id.to_be_bytes());
            }
        }
    }
}

impl FromStr for SpanId {
    type Err = TraceparentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match decode_hex::<8>(s) {
            Some(bytes) if bytes != [0; 8] => Ok(SpanId(bytes)),
            _ => Err(TraceparentError::InvalidSpanId),
        }
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceFlags(u8);

impl TraceFlags {
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);

    pub fn is_sampled(&self) -> bool {
        self.0 & Self::SAMPLED.0 != 0
    }
}

/// Identity of one span within a trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub flags: TraceFlags,
    pub trace_state: Option<String>,
    /// Whether the context was received from another process.
    pub is_remote: bool,
}

impl SpanContext {
    /// Context for a span that starts a new trace.
    pub fn new_root() -> Self {
        SpanContext {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            flags: TraceFlags::SAMPLED,
            trace_state: None,
            is_remote: false,
        }
    }

    /// Context for a local span whose parent is `self`.
    pub fn new_child(&self) -> Self {
        SpanContext {
            trace_id: self.trace_id,
            span_id: SpanId::random(),
            flags: self.flags,
            trace_state: self.trace_state.clone(),
            is_remote: false,
        }
    }

    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, self.flags.0)
    }
}

/// Parses a `traceparent` value (`version-traceid-parentid-flags`).
pub fn parse_traceparent(value: &str) -> Result<SpanContext, TraceparentError> {
    let fields: Vec<&str> = value.trim().split('-').collect();
    if fields.len() < 4 {
        return Err(TraceparentError::WrongFieldCount);
    }

    let version = match decode_hex::<1>(fields[0]) {
        Some([0xff]) | None => return Err(TraceparentError::InvalidVersion),
        Some([version]) => version,
    };
    // Version 00 is exactly four fields, later versions may append more.
    if version == 0 && fields.len() != 4 {
        return Err(TraceparentError::WrongFieldCount);
    }

    let trace_id = fields[1].parse::<TraceId>()?;
    let span_id = fields[2].parse::<SpanId>()?;
    let [flags] = decode_hex::<1>(fields[3]).ok_or(TraceparentError::InvalidFlags)?;

    Ok(SpanContext {
        trace_id,
        span_id,
        flags: TraceFlags(flags),
        trace_state: None,
        is_remote: true,
    })
}

/// What the relay learned from an event carrier.
#[derive(Debug, Default)]
pub struct Propagation {
    /// Inbound parent the relay span should join.
    pub parent: Option<SpanContext>,
    /// Set when a traceparent was present but unusable.
    pub rejected: Option<TraceparentError>,
    /// User marker for span tagging.
    pub identity: Option<String>,
}

pub fn extract(carrier: Option<&Carrier>) -> Propagation {
    let Some(carrier) = carrier else {
        return Propagation::default();
    };

    let identity = carrier.identity().map(str::to_owned);

    match carrier.traceparent.as_deref().map(parse_traceparent) {
        Some(Ok(mut parent)) => {
            parent.trace_state = carrier.tracestate.clone().filter(|s| !s.is_empty());
            Propagation {
                parent: Some(parent),
                rejected: None,
                identity,
            }
        }
        Some(Err(e)) => Propagation {
            parent: None,
            rejected: Some(e),
            identity,
        },
        None => Propagation {
            parent: None,
            rejected: None,
            identity,
        },
    }
}

fn decode_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    let bytes = s.as_bytes();
    if bytes.len() != N * 2 {
        return None;
    }

    let mut out = [0u8; N];
    for (slot, pair) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *slot = (hex_value(pair[0])? << 4) | hex_value(pair[1])?;
    }
    Some(out)
}

// Lowercase only.
fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VALID: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    fn make_carrier(value: serde_json::Value) -> Carrier {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_valid_traceparent() {
        let ctx = parse_traceparent(VALID).unwrap();
        assert_eq!(ctx.trace_id.to_string(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(ctx.span_id.to_string(), "b7ad6b7169203331");
        assert!(ctx.flags.is_sampled());
        assert!(ctx.is_remote);
        assert_eq!(ctx.to_traceparent(), VALID);
    }

    #[test]
    fn test_parse_unsampled() {
        let ctx =
            parse_traceparent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00").unwrap();
        assert!(!ctx.flags.is_sampled());
    }

    #[test]
    fn test_future_version_allows_extra_fields() {
        let ctx = parse_traceparent(
            "01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-whatever",
        )
        .unwrap();
        assert_eq!(ctx.span_id.to_string(), "b7ad6b7169203331");
    }

    #[test]
    fn test_parse_invalid_traceparent() {
        let cases = [
            ("", TraceparentError::WrongFieldCount),
            ("garbage", TraceparentError::WrongFieldCount),
            (
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-extra",
                TraceparentError::WrongFieldCount,
            ),
            (
                "ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
                TraceparentError::InvalidVersion,
            ),
            (
                "0-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
                TraceparentError::InvalidVersion,
            ),
            (
                "00-00000000000000000000000000000000-b7ad6b7169203331-01",
                TraceparentError::InvalidTraceId,
            ),
            (
                "00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01",
                TraceparentError::InvalidTraceId,
            ),
            (
                "00-0af7651916cd43dd8448eb211c8031-b7ad6b7169203331-01",
                TraceparentError::InvalidTraceId,
            ),
            (
                "00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01",
                TraceparentError::InvalidSpanId,
            ),
            (
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b71692033zz-01",
                TraceparentError::InvalidSpanId,
            ),
            (
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-1",
                TraceparentError::InvalidFlags,
            ),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_traceparent(input).unwrap_err(), expected, "{input}");
        }
    }

    #[test]
    fn test_random_ids() {
        let root = SpanContext::new_root();
        assert!(!root.is_remote);
        let child = root.new_child();
        assert_eq!(root.trace_id, child.trace_id);
        assert_ne!(root.span_id, child.span_id);

        // Rendered ids parse back.
        let parsed = parse_traceparent(&child.to_traceparent()).unwrap();
        assert_eq!(parsed.trace_id, child.trace_id);
        assert_eq!(parsed.span_id, child.span_id);
    }

    #[test]
    fn test_extract_with_parent_and_identity() {
        let carrier = make_carrier(json!({
            "traceparent": VALID,
            "tracestate": "vendor=value",
            "uid": "user-1"
        }));

        let propagation = extract(Some(&carrier));
        let parent = propagation.parent.unwrap();
        assert_eq!(parent.to_traceparent(), VALID);
        assert_eq!(parent.trace_state.as_deref(), Some("vendor=value"));
        assert_eq!(propagation.identity.as_deref(), Some("user-1"));
        assert!(propagation.rejected.is_none());
    }

    #[test]
    fn test_extract_fails_open() {
        let propagation = extract(None);
        assert!(propagation.parent.is_none());
        assert!(propagation.rejected.is_none());
        assert!(propagation.identity.is_none());

        let carrier = make_carrier(json!({"traceparent": "not-a-traceparent"}));
        let propagation = extract(Some(&carrier));
        assert!(propagation.parent.is_none());
        assert_eq!(
            propagation.rejected,
            Some(TraceparentError::WrongFieldCount)
        );

        let carrier = make_carrier(json!({"user_id": "user-2"}));
        let propagation = extract(Some(&carrier));
        assert!(propagation.parent.is_none());
        assert!(propagation.rejected.is_none());
        assert_eq!(propagation.identity.as_deref(), Some("user-2"));
    }
}
