//! Field merging across extraction strategies.
//!
//! Merging is monotonic: a populated field is never cleared or replaced by
//! an empty or shorter value. Text fields (headline, body) are replaced only
//! when the incoming value beats the held one by at least
//! `min_extra_words` words; other fields keep the first value seen.

use crate::models::{ExtractionMethod, Field, FieldMap};
use crate::utils::word_count;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    pub min_extra_words: usize,
}

/// Whether `incoming` should replace `held` for `field`.
pub fn is_more_meaningful(field: Field, held: Option<&str>, incoming: &str, policy: MergePolicy) -> bool {
    let incoming = incoming.trim();
    if incoming.is_empty() {
        return false;
    }
    let held = match held.map(str::trim) {
        Some(h) if !h.is_empty() => h,
        _ => return true,
    };
    if !field.is_text() {
        return false;
    }
    let (have, got) = (word_count(held), word_count(incoming));
    got > have && got - have >= policy.min_extra_words
}

/// Fold `incoming` (produced by `method`) into `held`, recording the
/// contributing method of every field that changed. Returns those fields.
pub fn merge_into(
    held: &mut FieldMap,
    contributors: &mut BTreeMap<Field, ExtractionMethod>,
    incoming: &FieldMap,
    method: ExtractionMethod,
    policy: MergePolicy,
) -> Vec<Field> {
    let mut changed = Vec::new();
    for (field, value) in incoming {
        if is_more_meaningful(*field, held.get(field).map(String::as_str), value, policy) {
            held.insert(*field, value.trim().to_string());
            contributors.insert(*field, method);
            changed.push(*field);
        }
    }
    changed
}

/// Pure form of [`merge_into`] without provenance.
pub fn merge(a: &FieldMap, b: &FieldMap, policy: MergePolicy) -> FieldMap {
    let mut out = a.clone();
    let mut scratch = BTreeMap::new();
    merge_into(&mut out, &mut scratch, b, ExtractionMethod::Lightweight, policy);
    out
}
