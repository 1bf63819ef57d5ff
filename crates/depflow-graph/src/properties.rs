//! Persistence encoding of dependent properties.
//!
//! A dependency records which properties of the dependent were derived from
//! the source, per channel. Two encodings are written:
//!
//! - condensed: `"name,title"` when every property is recorded for exactly
//!   the edge's channel set;
//! - structured: `{"name":[0,3],"title":[3]}` otherwise.
//!
//! Two older shapes are still read: a bare comma list (condensed form, applied
//! to the edge's channels) and a map keyed by channel id holding property
//! name lists, e.g. `{"0":["name"],"3":["name","title"]}`.

use depflow_core::{ChannelId, DepflowError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Property name -> channels the property was recorded in.
pub type PropertyChannels = BTreeMap<String, BTreeSet<ChannelId>>;

pub fn encode_dependent_properties(
    properties: &PropertyChannels,
    channel_ids: &[ChannelId],
) -> Result<Option<String>> {
    if properties.is_empty() {
        return Ok(None);
    }

    let edge_channels: BTreeSet<ChannelId> = channel_ids.iter().copied().collect();
    if properties.values().all(|channels| *channels == edge_channels) {
        let names: Vec<&str> = properties.keys().map(String::as_str).collect();
        return Ok(Some(names.join(",")));
    }

    Ok(Some(serde_json::to_string(properties)?))
}

pub fn decode_dependent_properties(
    encoded: Option<&str>,
    channel_ids: &[ChannelId],
) -> Result<PropertyChannels> {
    let text = match encoded.map(str::trim) {
        Some(text) if !text.is_empty() => text,
        _ => return Ok(PropertyChannels::new()),
    };

    if text.starts_with('{') {
        decode_map(text)
    } else {
        Ok(decode_list(text, channel_ids))
    }
}

fn decode_list(text: &str, channel_ids: &[ChannelId]) -> PropertyChannels {
    let channels: BTreeSet<ChannelId> = channel_ids.iter().copied().collect();
    if channels.is_empty() {
        return PropertyChannels::new();
    }
    text.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| (name.to_string(), channels.clone()))
        .collect()
}

fn decode_map(text: &str) -> Result<PropertyChannels> {
    let value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object()
        .ok_or_else(|| DepflowError::Encoding(format!("expected an object: {}", text)))?;

    let mut out = PropertyChannels::new();
    for (key, entries) in object {
        let entries = entries.as_array().ok_or_else(|| {
            DepflowError::Encoding(format!("value of {:?} is not an array", key))
        })?;

        if entries.iter().all(Value::is_number) {
            // structured: property -> channel ids
            let channels = entries
                .iter()
                .map(|v| {
                    v.as_u64()
                        .and_then(|n| ChannelId::try_from(n).ok())
                        .ok_or_else(|| DepflowError::Encoding(format!("invalid channel id {}", v)))
                })
                .collect::<Result<BTreeSet<_>>>()?;
            if !channels.is_empty() {
                out.entry(key.clone()).or_default().extend(channels);
            }
        } else if entries.iter().all(Value::is_string) {
            // legacy: channel id -> property names
            let channel: ChannelId = key
                .trim()
                .parse()
                .map_err(|_| DepflowError::Encoding(format!("invalid channel key {:?}", key)))?;
            for name in entries.iter().filter_map(Value::as_str) {
                let name = name.trim();
                if !name.is_empty() {
                    out.entry(name.to_string()).or_default().insert(channel);
                }
            }
        } else {
            return Err(DepflowError::Encoding(format!(
                "mixed entries for {:?}",
                key
            )));
        }
    }
    Ok(out)
}
