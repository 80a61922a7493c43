//! Prometheus text exposition, format version 0.0.4.

use super::registry::Registry;
use crate::error::MetricsError;
use prometheus::{Encoder, TextEncoder};

pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Renders every family that has at least one series, in name order.
pub fn encode_text(registry: &Registry) -> Result<String, MetricsError> {
    let families: Vec<_> = registry
        .backend()
        .gather()
        .into_iter()
        .filter(|family| !family.get_metric().is_empty())
        .collect();

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buffer)
        .map_err(|e| MetricsError::Encode(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::Encode(e.to_string()))
}
