//! Canonical configuration fingerprints
//!
//! A fingerprint is the lowercase MD5 hex of a canonical rendering of the
//! decoded configuration tree. Table key order does not affect the result;
//! element order inside arrays does (arrays canonicalise as one-based
//! integer-keyed tables, so the key travels with each element). The digest
//! identifies an applied configuration; it carries no authenticity.

use md5::{Digest, Md5};
use serde_json::Value;

/// Fingerprint reported before any configuration has been applied.
pub const UNAPPLIED_HASH: &str = "00000000000000000000000000000000";

/// Hash a decoded configuration tree into a 32-hex fingerprint.
pub fn config_hash(tree: &Value) -> String {
    hex::encode(Md5::digest(canonical_form(tree).as_bytes()))
}

/// Canonical rendering of a tree. The normative form for fingerprints.
pub fn canonical_form(tree: &Value) -> String {
    let mut out = String::new();
    write_canonical(tree, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("/null/"),
        Value::Bool(b) => {
            out.push('?');
            out.push_str(if *b { "true" } else { "false" });
            out.push('?');
        }
        Value::Number(n) => {
            out.push('#');
            out.push_str(&n.to_string());
            out.push('#');
        }
        Value::String(s) => {
            out.push('$');
            out.push_str(s);
            out.push('$');
        }
        Value::Array(items) => {
            let entries = items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let mut rendered = String::new();
                    write_canonical(item, &mut rendered);
                    (format!("#{}#", i + 1), rendered)
                })
                .collect();
            write_table(entries, out);
        }
        Value::Object(map) => {
            let entries = map
                .iter()
                .map(|(key, value)| {
                    let mut rendered = String::new();
                    write_canonical(value, &mut rendered);
                    (format!("${key}$"), rendered)
                })
                .collect();
            write_table(entries, out);
        }
    }
}

/// Entries are (canonical key, canonical value); sorted lexicographically on
/// the canonical key form, rendered `{k1:v1;k2:v2}`.
fn write_table(mut entries: Vec<(String, String)>, out: &mut String) {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    out.push('{');
    for (i, (key, value)) in entries.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push_str(key);
        out.push(':');
        out.push_str(value);
    }
    out.push('}');
}
