//! Reference-document flattening.
//!
//! A chunk's schema is the ordered list of numeric-ish leaves of its
//! reference document: depth-first, children in document order. Only the
//! shape of a document matters here; two documents with the same keys in
//! the same order flatten to the same `(path, key)` sequence whatever
//! their leaf values hold.
//!
//! Doubles are truncated toward zero when they become a series; the
//! fractional part does not survive flattening.

use bson::{Bson, Document};

use crate::chunk::Metric;

/// Flatten `doc` into its ordered metric list.
///
/// The returned metrics carry the document's values as starting values
/// and empty delta vectors. Leaves that are not numeric-ish (strings,
/// object ids, decimals, nulls, binary, ...) contribute no series; a
/// timestamp contributes two (`{key}` in milliseconds and `{key}.inc`).
#[must_use]
pub fn flatten_document(doc: &Document) -> Vec<Metric> {
    let mut path = Vec::new();
    let mut out = Vec::new();
    flatten_into(&mut path, doc, &mut out);
    out
}

fn flatten_into(path: &mut Vec<String>, doc: &Document, out: &mut Vec<Metric>) {
    for (key, value) in doc.iter() {
        metrics_for_value(path, key, value, out);
    }
}

fn metrics_for_value(path: &mut Vec<String>, key: &str, value: &Bson, out: &mut Vec<Metric>) {
    match value {
        Bson::Int32(v) => out.push(Metric::new(path.clone(), key, i64::from(*v))),
        Bson::Int64(v) => out.push(Metric::new(path.clone(), key, *v)),
        Bson::Double(v) => out.push(Metric::new(path.clone(), key, *v as i64)),
        Bson::Boolean(v) => out.push(Metric::new(path.clone(), key, i64::from(*v))),
        Bson::DateTime(v) => out.push(Metric::new(path.clone(), key, v.timestamp_millis())),
        Bson::Timestamp(v) => {
            out.push(Metric::new(path.clone(), key, i64::from(v.time) * 1000));
            out.push(Metric::new(
                path.clone(),
                format!("{key}.inc"),
                i64::from(v.increment),
            ));
        }
        Bson::Document(inner) => {
            path.push(key.to_owned());
            flatten_into(path, inner, out);
            path.pop();
        }
        Bson::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                metrics_for_value(path, &format!("{key}.{idx}"), item, out);
            }
        }
        Bson::Null
        | Bson::String(_)
        | Bson::ObjectId(_)
        | Bson::Decimal128(_)
        | Bson::Binary(_) => {}
        // Regexes, code, symbols and the other exotic types carry no
        // numeric interpretation either.
        _ => {}
    }
}
