//! Structural deep merge of rendered resources into live state.
//!
//! [`deep_update`] folds a freshly rendered document (`new`) into the live
//! document (`current`) without disturbing fields the renderer does not
//! speak about. Server-populated subtrees (status, injected defaults,
//! metadata bookkeeping) survive re-rendering because the merge only ever
//! adds or replaces what `new` names.

use serde_json::{map::Entry, Value};

use crate::errors::{OperonError, OperonResult};
use crate::model::resource::value_kind;

/// Merge `new` into `current`, returning whether anything changed.
///
/// Rules, applied recursively:
/// - mapping into mapping: absent keys are inserted, present keys recurse
/// - sequence into sequence: pairwise by position; a longer `new` appends
///   its tail, a longer `current` keeps its tail (sequences never shrink)
/// - scalar (or null) `new`: replaces `current` when unequal
/// - mapping or sequence `new` against a structurally different `current`
///   is a hard error; the caller must discard the partially merged value
pub fn deep_update(current: &mut Value, new: &Value) -> OperonResult<bool> {
    match new {
        Value::Object(new_map) => {
            let Value::Object(current_map) = current else {
                return Err(mismatch(current, new));
            };
            let mut changed = false;
            for (key, value) in new_map {
                match current_map.entry(key.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(value.clone());
                        changed = true;
                    }
                    Entry::Occupied(mut slot) => {
                        changed |= deep_update(slot.get_mut(), value)?;
                    }
                }
            }
            Ok(changed)
        }
        Value::Array(new_seq) => {
            let Value::Array(current_seq) = current else {
                return Err(mismatch(current, new));
            };
            let mut changed = false;
            for (index, value) in new_seq.iter().enumerate() {
                if index < current_seq.len() {
                    changed |= deep_update(&mut current_seq[index], value)?;
                } else {
                    current_seq.extend(new_seq[index..].iter().cloned());
                    changed = true;
                    break;
                }
            }
            Ok(changed)
        }
        scalar => {
            if current == scalar {
                Ok(false)
            } else {
                *current = scalar.clone();
                Ok(true)
            }
        }
    }
}

fn mismatch(current: &Value, new: &Value) -> OperonError {
    OperonError::Convert(format!(
        "cannot merge {} into {}",
        value_kind(new),
        value_kind(current)
    ))
}
