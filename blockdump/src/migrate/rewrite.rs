//! Payload rewriting applied to each block before it is re-created.

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

/// Public URL of a stored attachment.
///
/// Exactly one `/` separates the base and the relative path.
pub fn attachment_url(static_base: &str, rel_path: &str) -> String {
    format!(
        "{}/{}",
        static_base.trim_end_matches('/'),
        rel_path.trim_start_matches('/')
    )
}

/// Point an attachment payload at an external URL, dropping the hosted file.
pub fn point_to_external(payload: &mut Value, url: &str) {
    if !payload.is_object() {
        *payload = json!({});
    }
    if let Some(obj) = payload.as_object_mut() {
        obj.remove("file");
        obj.insert("type".into(), json!("external"));
        obj.insert("external".into(), json!({ "url": url }));
    }
}

/// Replace string leaves that name a dump-time block with the block's new id.
///
/// Returns `true` when a reference to a known block could not be resolved
/// yet because that block has not been created.
pub fn remap_ids(
    payload: &mut Value,
    known: &HashSet<String>,
    id_map: &BTreeMap<String, String>,
) -> bool {
    let mut unresolved = false;
    let mut stack = vec![payload];
    while let Some(value) = stack.pop() {
        match value {
            Value::String(s) if known.contains(s.as_str()) => match id_map.get(s.as_str()) {
                Some(new_id) => *s = new_id.clone(),
                None => unresolved = true,
            },
            Value::Array(items) => stack.extend(items.iter_mut()),
            Value::Object(fields) => stack.extend(fields.values_mut()),
            _ => {}
        }
    }
    unresolved
}
