//! Generic structural merge over JSON values.
//!
//! Rules, applied recursively per key:
//! - A patch value that is a primitive or an array replaces the target value.
//! - A patch object merges key by key into the target object (a non-object
//!   target is treated as an empty object).
//! - A `null` patch value removes the key from the target object.
//! - Keys absent from the patch are untouched.
//!
//! Typed [`SessionPatch`](crate::SessionPatch) application follows the same
//! rules for every `Replace`/`DeleteOnNull` field, so this function is the
//! reference that the typed merge is checked against.

use serde_json::{Map, Value};

/// Merge `patch` into `target` in place.
pub fn merge_json(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else {
        return;
    };

    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
            continue;
        }
        if value.is_object() {
            let entry = target_map.entry(key.clone()).or_insert(Value::Null);
            merge_json(entry, value);
        } else {
            target_map.insert(key.clone(), value.clone());
        }
    }
}

/// Merge `patch` into a copy of `target`.
pub fn merged(target: &Value, patch: &Value) -> Value {
    let mut out = target.clone();
    merge_json(&mut out, patch);
    out
}

// ============================================================================
// Tests
// ============================================================================
