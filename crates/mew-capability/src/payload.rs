// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shallow JSON payload matching.
//!
//! A capability's `payload` field is a pattern object: fields present in
//! the pattern must be present and equal (recursively) in the candidate,
//! fields absent from the pattern are wildcards. Arrays are compared
//! element-wise only when the pattern itself is an array; any other type
//! mismatch is a non-match.

use serde_json::Value;

/// Check a candidate payload against a capability payload pattern.
#[must_use]
pub fn payload_matches(pattern: &Value, candidate: &Value) -> bool {
    match (pattern, candidate) {
        (Value::Object(pat), Value::Object(cand)) => pat
            .iter()
            .all(|(key, sub)| cand.get(key).is_some_and(|v| payload_matches(sub, v))),
        (Value::Array(pat), Value::Array(cand)) => {
            pat.len() == cand.len()
                && pat.iter().zip(cand.iter()).all(|(p, c)| payload_matches(p, c))
        }
        (pat, cand) => pat == cand,
    }
}

/// True when every payload matched by `narrow` is also matched by `wide`:
/// `narrow` carries at least every constraint of `wide`.
///
/// Object fields constrained by `wide` must appear in `narrow` with a
/// constraint that is itself subsumed; arrays must agree in length with
/// element-wise subsumption; scalars must be equal.
#[must_use]
pub fn payload_subsumes(wide: &Value, narrow: &Value) -> bool {
    match (wide, narrow) {
        (Value::Object(w), Value::Object(n)) => w
            .iter()
            .all(|(key, sub)| n.get(key).is_some_and(|v| payload_subsumes(sub, v))),
        (Value::Array(w), Value::Array(n)) => {
            w.len() == n.len() && w.iter().zip(n.iter()).all(|(a, b)| payload_subsumes(a, b))
        }
        (w, n) => w == n,
    }
}
