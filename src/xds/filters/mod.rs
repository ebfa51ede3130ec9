//! Shared helpers for HTTP filter builders.
//!
//! Filter families live under [`http`]. Everything here is protocol plumbing
//! used by more than one family: packing prost messages into `Any`, turning
//! IR percentages into Envoy fractions and the common error helper.

pub mod http;

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use envoy_types::pb::envoy::r#type::v3::{fractional_percent::DenominatorType, FractionalPercent};
use envoy_types::pb::google::protobuf::{Any, Duration};
use prost::Message;

/// Helper for building Envoy `Any` values from prost messages.
pub fn any_from_message<M: Message>(type_url: impl Into<String>, msg: &M) -> Any {
    Any { type_url: type_url.into(), value: msg.encode_to_vec() }
}

/// Encode `msg` with the entries of one map field in key order.
///
/// prost writes map fields in hash order, so the map is taken out, the rest of
/// the message encoded, and each entry appended as a single-entry message.
/// Decoders merge the concatenated encodings back into one map.
pub fn encode_with_sorted_map<M, K, V>(msg: &M, field: fn(&mut M) -> &mut HashMap<K, V>) -> Vec<u8>
where
    M: Message + Clone + Default,
    K: Ord + Hash + Eq,
{
    let mut rest = msg.clone();
    let entries = std::mem::take(field(&mut rest));
    let mut buf = rest.encode_to_vec();
    append_sorted_entries(&mut buf, entries, field);
    buf
}

/// Append `entries` to `buf` as single-entry encodings of the map `field`.
pub fn append_sorted_entries<M, K, V>(
    buf: &mut Vec<u8>,
    entries: HashMap<K, V>,
    field: fn(&mut M) -> &mut HashMap<K, V>,
) where
    M: Message + Default,
    K: Ord + Hash + Eq,
{
    let sorted: BTreeMap<K, V> = entries.into_iter().collect();
    for (key, value) in sorted {
        let mut single = M::default();
        field(&mut single).insert(key, value);
        buf.extend_from_slice(&single.encode_to_vec());
    }
}

/// Decode the payload of an `Any`, checking its type URL first.
pub fn message_from_any<M: Message + Default>(any: &Any, type_url: &str) -> crate::Result<M> {
    if any.type_url != type_url {
        return Err(crate::Error::internal(format!(
            "expected payload of type {type_url}, found {}",
            any.type_url
        )));
    }
    M::decode(any.value.as_slice()).map_err(|e| crate::Error::decode(type_url, e))
}

/// Error helper for invalid filter configuration.
pub fn invalid_config(msg: impl Into<String>) -> crate::Error {
    crate::Error::config(msg.into())
}

/// Convert a 0-100 percentage to a per-million fraction.
pub fn fractional_percent(percent: f32) -> crate::Result<FractionalPercent> {
    if !(0.0..=100.0).contains(&percent) || percent.is_nan() {
        return Err(invalid_config(format!("percentage {percent} is outside 0-100")));
    }
    Ok(FractionalPercent {
        numerator: (percent * 10_000.0).round() as u32,
        denominator: DenominatorType::Million as i32,
        ..Default::default()
    })
}

pub fn duration_from_millis(millis: u64) -> Duration {
    Duration { seconds: (millis / 1_000) as i64, nanos: ((millis % 1_000) * 1_000_000) as i32 }
}

pub fn duration_from_secs(seconds: i64) -> Duration {
    Duration { seconds, nanos: 0 }
}
