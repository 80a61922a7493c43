use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 128-bit trace identifier, rendered as 32 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

/// 64-bit span identifier, rendered as 16 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

/// Returned when an identifier is not valid lowercase hex of the right length.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier: {0}")]
pub struct InvalidId(pub String);

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    /// Generates a random, non-zero trace id.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let value: u128 = rng.gen();
            if value != 0 {
                return TraceId(value);
            }
        }
    }

    pub fn from_u128(value: u128) -> Self {
        TraceId(value)
    }

    pub fn to_u128(self) -> u128 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Parses exactly 32 lowercase hex chars. The all-zero id is rejected.
    pub fn from_hex(s: &str) -> Result<Self, InvalidId> {
        if s.len() != 32 || !is_lower_hex(s) {
            return Err(InvalidId(s.to_string()));
        }
        match u128::from_str_radix(s, 16) {
            Ok(0) | Err(_) => Err(InvalidId(s.to_string())),
            Ok(v) => Ok(TraceId(v)),
        }
    }
}

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    /// Generates a random, non-zero span id.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let value: u64 = rng.gen();
            if value != 0 {
                return SpanId(value);
            }
        }
    }

    pub fn from_u64(value: u64) -> Self {
        SpanId(value)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Parses exactly 16 lowercase hex chars. The all-zero id is rejected.
    pub fn from_hex(s: &str) -> Result<Self, InvalidId> {
        if s.len() != 16 || !is_lower_hex(s) {
            return Err(InvalidId(s.to_string()));
        }
        match u64::from_str_radix(s, 16) {
            Ok(0) | Err(_) => Err(InvalidId(s.to_string())),
            Ok(v) => Ok(SpanId(v)),
        }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for TraceId {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TraceId::from_hex(s)
    }
}

impl FromStr for SpanId {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SpanId::from_hex(s)
    }
}

macro_rules! hex_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                <$ty>::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_serde!(TraceId);
hex_serde!(SpanId);

/// The propagated identity of a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub sampled: bool,
    /// Opaque W3C `tracestate`, passed through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,
    /// True when the context was extracted from an inbound carrier.
    pub remote: bool,
}

impl SpanContext {
    pub fn new(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        Self {
            trace_id,
            span_id,
            sampled,
            trace_state: None,
            remote: false,
        }
    }

    pub fn remote(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        Self {
            remote: true,
            ..Self::new(trace_id, span_id, sampled)
        }
    }

    pub fn with_trace_state(mut self, trace_state: impl Into<String>) -> Self {
        self.trace_state = Some(trace_state.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_lower_hex() {
        for _ in 0..100 {
            let trace = TraceId::generate().to_string();
            let span = SpanId::generate().to_string();
            assert_eq!(trace.len(), 32);
            assert_eq!(span.len(), 16);
            assert!(is_lower_hex(&trace));
            assert!(is_lower_hex(&span));
        }
    }

    #[test]
    fn test_small_ids_are_zero_padded() {
        assert_eq!(TraceId::from_u128(1).to_string(), format!("{:0>32}", "1"));
        assert_eq!(SpanId::from_u64(255).to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").is_ok());
        assert!(TraceId::from_hex("0AF7651916CD43DD8448EB211C80319C").is_err());
        assert!(TraceId::from_hex("00000000000000000000000000000000").is_err());
        assert!(TraceId::from_hex("0af7651916cd43dd").is_err());
        assert!(SpanId::from_hex("b7ad6b7169203331").is_ok());
        assert!(SpanId::from_hex("b7ad6b716920333").is_err());
        assert!(SpanId::from_hex("zzad6b7169203331").is_err());
    }

    #[test]
    fn test_serde_uses_hex() {
        let ctx = SpanContext::new(TraceId::from_u128(0xabc), SpanId::from_u64(0xdef), true);
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["trace_id"], "00000000000000000000000000000abc");
        assert_eq!(json["span_id"], "0000000000000def");
        let back: SpanContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }
}
