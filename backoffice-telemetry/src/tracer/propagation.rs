//! Trace context propagation over W3C and B3 headers.
//!
//! Carriers are abstract: anything implementing [`Extractor`] can be read
//! and anything implementing [`Injector`] can be written. Implementations are
//! provided for [`HeaderMap`] and for `HashMap<String, Vec<String>>`.
//!
//! Only the configured format is consulted on extraction. Malformed headers
//! yield `None`, which the tracer treats as "start a fresh trace".

use super::ids::{SpanContext, SpanId, TraceId};
use crate::config::PropagationFormat;
use crate::context::{TelemetryContext, MAX_BAGGAGE_ENTRIES};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const BAGGAGE_HEADER: &str = "baggage";
pub const B3_HEADER: &str = "b3";
pub const B3_TRACE_ID_HEADER: &str = "x-b3-traceid";
pub const B3_SPAN_ID_HEADER: &str = "x-b3-spanid";
pub const B3_PARENT_SPAN_ID_HEADER: &str = "x-b3-parentspanid";
pub const B3_SAMPLED_HEADER: &str = "x-b3-sampled";
pub const B3_FLAGS_HEADER: &str = "x-b3-flags";

const W3C_VERSION: &str = "00";

// ============================================================================
// Carriers
// ============================================================================

/// Read access to a header-like carrier. Keys are matched case-insensitively.
pub trait Extractor {
    /// First value stored under `key`.
    fn get(&self, key: &str) -> Option<&str>;
}

/// Write access to a header-like carrier.
pub trait Injector {
    /// Replaces every value stored under `key`.
    fn set(&mut self, key: &str, value: String);
}

impl Extractor for HeaderMap {
    fn get(&self, key: &str) -> Option<&str> {
        HeaderMap::get(self, key).and_then(|v| v.to_str().ok())
    }
}

impl Injector for HeaderMap {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (HeaderName::from_str(key), HeaderValue::from_str(&value)) {
            self.insert(name, value);
        }
    }
}

impl Extractor for HashMap<String, Vec<String>> {
    fn get(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }
}

impl Injector for HashMap<String, Vec<String>> {
    fn set(&mut self, key: &str, value: String) {
        self.retain(|k, _| !k.eq_ignore_ascii_case(key));
        self.insert(key.to_ascii_lowercase(), vec![value]);
    }
}

// ============================================================================
// Propagator
// ============================================================================

/// A span context read from an inbound carrier.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub span_context: SpanContext,
    /// The upstream sampling decision. `None` when the carrier deferred it
    /// (B3 without a sampled flag).
    pub sampled: Option<bool>,
    pub baggage: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Propagator {
    format: PropagationFormat,
    enable_baggage: bool,
}

impl Default for Propagator {
    fn default() -> Self {
        Self::new(PropagationFormat::W3c, true)
    }
}

impl Propagator {
    pub fn new(format: PropagationFormat, enable_baggage: bool) -> Self {
        Self {
            format,
            enable_baggage,
        }
    }

    pub fn format(&self) -> PropagationFormat {
        self.format
    }

    pub fn extract(&self, carrier: &dyn Extractor) -> Option<Extracted> {
        let (span_context, sampled) = match self.format {
            PropagationFormat::W3c => {
                let mut span_context = parse_traceparent(carrier.get(TRACEPARENT_HEADER)?)?;
                if let Some(state) = carrier.get(TRACESTATE_HEADER) {
                    let state = state.trim();
                    if !state.is_empty() {
                        span_context.trace_state = Some(state.to_string());
                    }
                }
                let sampled = span_context.sampled;
                (span_context, Some(sampled))
            }
            PropagationFormat::B3 | PropagationFormat::B3Multi => match carrier.get(B3_HEADER) {
                Some(single) => parse_b3_single(single)?,
                None => parse_b3_multi(carrier)?,
            },
        };

        let baggage = if self.enable_baggage {
            carrier
                .get(BAGGAGE_HEADER)
                .map(parse_baggage)
                .unwrap_or_default()
        } else {
            BTreeMap::new()
        };

        Some(Extracted {
            span_context,
            sampled,
            baggage,
        })
    }

    /// Writes the span context and baggage of `ctx` into `carrier`. Does
    /// nothing when the context carries no valid span.
    pub fn inject(&self, ctx: &TelemetryContext, carrier: &mut dyn Injector) {
        let Some(sc) = ctx.span_context().filter(|sc| sc.is_valid()) else {
            return;
        };

        match self.format {
            PropagationFormat::W3c => {
                carrier.set(TRACEPARENT_HEADER, format_traceparent(sc));
                if let Some(state) = &sc.trace_state {
                    carrier.set(TRACESTATE_HEADER, state.clone());
                }
            }
            PropagationFormat::B3 => {
                carrier.set(B3_HEADER, format_b3_single(sc));
            }
            PropagationFormat::B3Multi => {
                carrier.set(B3_HEADER, format_b3_single(sc));
                carrier.set(B3_TRACE_ID_HEADER, sc.trace_id.to_string());
                carrier.set(B3_SPAN_ID_HEADER, sc.span_id.to_string());
                carrier.set(B3_SAMPLED_HEADER, sampled_flag(sc.sampled).to_string());
            }
        }

        if self.enable_baggage && !ctx.baggage().is_empty() {
            carrier.set(BAGGAGE_HEADER, format_baggage(ctx.baggage()));
        }
    }
}

// ============================================================================
// W3C Trace Context
// ============================================================================

/// Parses `version-traceid-parentid-flags`.
///
/// Version `00` must have exactly four fields. Later versions may append
/// fields, which are ignored. Version `ff` is invalid.
pub fn parse_traceparent(value: &str) -> Option<SpanContext> {
    let parts: Vec<&str> = value.trim().split('-').collect();
    if parts.len() < 4 {
        return None;
    }

    let version = parts[0];
    if version.len() != 2 || !version.bytes().all(|b| b.is_ascii_hexdigit()) || version == "ff" {
        return None;
    }
    if version == W3C_VERSION && parts.len() != 4 {
        return None;
    }

    let trace_id = TraceId::from_hex(parts[1]).ok()?;
    let span_id = SpanId::from_hex(parts[2]).ok()?;
    if parts[3].len() != 2 {
        return None;
    }
    let flags = u8::from_str_radix(parts[3], 16).ok()?;

    Some(SpanContext::remote(trace_id, span_id, flags & 0x01 == 0x01))
}

pub fn format_traceparent(sc: &SpanContext) -> String {
    format!(
        "{W3C_VERSION}-{}-{}-{}",
        sc.trace_id,
        sc.span_id,
        if sc.sampled { "01" } else { "00" }
    )
}

// ============================================================================
// B3
// ============================================================================

fn parse_b3_trace_id(value: &str) -> Option<TraceId> {
    let value = value.trim();
    match value.len() {
        32 => TraceId::from_hex(value).ok(),
        16 => TraceId::from_hex(&format!("{value:0>32}")).ok(),
        _ => None,
    }
}

fn parse_b3_sampled(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "d" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

/// Parses `traceid-spanid[-sampled[-parentspanid]]`. A bare sampling
/// decision carries no identity and yields `None`.
fn parse_b3_single(value: &str) -> Option<(SpanContext, Option<bool>)> {
    let parts: Vec<&str> = value.trim().split('-').collect();
    if parts.len() < 2 || parts.len() > 4 {
        return None;
    }

    let trace_id = parse_b3_trace_id(parts[0])?;
    let span_id = SpanId::from_hex(parts[1]).ok()?;
    let sampled = match parts.get(2) {
        Some(flag) => Some(parse_b3_sampled(flag)?),
        None => None,
    };
    if let Some(parent) = parts.get(3) {
        SpanId::from_hex(parent).ok()?;
    }

    Some((
        SpanContext::remote(trace_id, span_id, sampled.unwrap_or(false)),
        sampled,
    ))
}

fn parse_b3_multi(carrier: &dyn Extractor) -> Option<(SpanContext, Option<bool>)> {
    let trace_id = parse_b3_trace_id(carrier.get(B3_TRACE_ID_HEADER)?)?;
    let span_id = SpanId::from_hex(carrier.get(B3_SPAN_ID_HEADER)?.trim()).ok()?;

    let debug = carrier
        .get(B3_FLAGS_HEADER)
        .is_some_and(|flags| flags.trim() == "1");
    let sampled = if debug {
        Some(true)
    } else {
        match carrier.get(B3_SAMPLED_HEADER) {
            Some(flag) => Some(parse_b3_sampled(flag)?),
            None => None,
        }
    };

    Some((
        SpanContext::remote(trace_id, span_id, sampled.unwrap_or(false)),
        sampled,
    ))
}

fn sampled_flag(sampled: bool) -> &'static str {
    if sampled {
        "1"
    } else {
        "0"
    }
}

pub fn format_b3_single(sc: &SpanContext) -> String {
    format!("{}-{}-{}", sc.trace_id, sc.span_id, sampled_flag(sc.sampled))
}

// ============================================================================
// Baggage
// ============================================================================

/// Parses `k1=v1,k2=v2;prop`. Properties are discarded, values are
/// percent-decoded, and at most [`MAX_BAGGAGE_ENTRIES`] entries are kept.
pub fn parse_baggage(value: &str) -> BTreeMap<String, String> {
    let mut baggage = BTreeMap::new();
    for member in value.split(',') {
        let member = member.split(';').next().unwrap_or_default();
        let Some((key, value)) = member.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if baggage.len() >= MAX_BAGGAGE_ENTRIES && !baggage.contains_key(key) {
            continue;
        }
        baggage.insert(key.to_string(), percent_decode(value.trim()));
    }
    baggage
}

pub fn format_baggage(baggage: &BTreeMap<String, String>) -> String {
    baggage
        .iter()
        .map(|(k, v)| format!("{}={}", k, percent_encode(v)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Controls, space, the baggage delimiters, `%`, quotes and backslash.
const BAGGAGE_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b',')
    .add(b';')
    .add(b'=')
    .add(b'%')
    .add(b'"')
    .add(b'\\');

fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, BAGGAGE_VALUE).to_string()
}

fn percent_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}
