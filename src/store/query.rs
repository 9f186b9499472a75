//! In-process condition matching and projection over JSON documents.
//!
//! The user store keeps documents as JSON; restriction steps are evaluated
//! here against streamed rows. Field keys are dotted paths; a field spec is
//! either a scalar (equality) or an operator object.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Resolve a dotted path against a document.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Evaluate a restriction condition against a document.
///
/// Supported operators: `$or`, `$and`, `$in`, `$nin`, `$exists`, `$ne` and
/// the ordered comparisons `$gt`/`$gte`/`$lt`/`$lte`. Anything else is
/// scalar equality. Array-valued fields match element-wise for equality,
/// `$in` and `$nin`.
pub fn matches(doc: &Value, cond: &Value) -> bool {
    let Some(clauses) = cond.as_object() else {
        return false;
    };
    clauses.iter().all(|(key, spec)| match key.as_str() {
        "$or" => spec
            .as_array()
            .map_or(false, |alts| alts.iter().any(|c| matches(doc, c))),
        "$and" => spec
            .as_array()
            .map_or(false, |alts| alts.iter().all(|c| matches(doc, c))),
        _ => field_matches(lookup(doc, key), spec),
    })
}

fn field_matches(value: Option<&Value>, spec: &Value) -> bool {
    if let Some(ops) = spec.as_object() {
        if ops.keys().any(|k| k.starts_with('$')) {
            return ops.iter().all(|(op, arg)| op_matches(value, op, arg));
        }
    }
    match value {
        Some(Value::Array(items)) if !spec.is_array() => items.iter().any(|v| v == spec),
        Some(v) => v == spec,
        None => false,
    }
}

fn op_matches(value: Option<&Value>, op: &str, arg: &Value) -> bool {
    match op {
        "$exists" => {
            let wanted = arg.as_bool().unwrap_or(true);
            let present = matches!(value, Some(v) if !v.is_null());
            present == wanted
        }
        "$ne" => match value {
            Some(Value::Array(items)) => !items.iter().any(|v| v == arg),
            Some(v) => v != arg,
            None => true,
        },
        "$in" => {
            let Some(list) = arg.as_array() else {
                return false;
            };
            match value {
                Some(Value::Array(items)) => items.iter().any(|v| list.contains(v)),
                Some(v) => list.contains(v),
                None => false,
            }
        }
        "$nin" => {
            let Some(list) = arg.as_array() else {
                return false;
            };
            match value {
                Some(Value::Array(items)) => !items.iter().any(|v| list.contains(v)),
                Some(v) => !list.contains(v),
                None => true,
            }
        }
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let Some(ord) = value.and_then(|v| compare(v, arg)) else {
                return false;
            };
            match op {
                "$gt" => ord == Ordering::Greater,
                "$gte" => ord != Ordering::Less,
                "$lt" => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }
        }
        // Unknown operator: matches nothing.
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Apply a `{"field": 1, ...}` projection, keeping the listed top-level
/// fields. An empty projection keeps the whole document.
pub fn project(doc: &Value, projection: &Value) -> Value {
    let (Some(fields), Some(proj)) = (doc.as_object(), projection.as_object()) else {
        return doc.clone();
    };
    if proj.is_empty() {
        return doc.clone();
    }
    let mut out = Map::new();
    for (key, flag) in proj {
        let included = flag.as_i64().map_or(flag.as_bool() == Some(true), |n| n != 0);
        if included {
            if let Some(value) = fields.get(key) {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "uid": "u1",
            "tz": -300,
            "tk": { "ap": "tok" },
            "chr": { "c1": { "in": "true" } },
            "msgs": ["m1", "m2"],
            "age": 30,
            "name": "sam",
        })
    }

    #[test]
    fn equality_and_dotted_paths() {
        assert!(matches(&doc(), &json!({ "uid": "u1" })));
        assert!(matches(&doc(), &json!({ "chr.c1.in": "true" })));
        assert!(!matches(&doc(), &json!({ "chr.c2.in": "true" })));
        // equality against a missing field never matches
        assert!(!matches(&doc(), &json!({ "invalidgeo": true })));
    }

    #[test]
    fn array_membership() {
        assert!(matches(&doc(), &json!({ "msgs": "m1" })));
        assert!(matches(&doc(), &json!({ "msgs": { "$in": ["m2", "m9"] } })));
        assert!(!matches(&doc(), &json!({ "msgs": { "$in": ["m9"] } })));
        assert!(matches(&doc(), &json!({ "msgs": { "$nin": ["m9"] } })));
        assert!(!matches(&doc(), &json!({ "msgs": { "$nin": ["m1"] } })));
        // absent field: $nin matches, $in does not
        assert!(matches(&doc(), &json!({ "gone": { "$nin": ["x"] } })));
        assert!(!matches(&doc(), &json!({ "gone": { "$in": ["x"] } })));
    }

    #[test]
    fn exists_and_ne() {
        assert!(matches(&doc(), &json!({ "tk.ap": { "$exists": true } })));
        assert!(matches(&doc(), &json!({ "tk.ip": { "$exists": false } })));
        assert!(!matches(&doc(), &json!({ "tk.ap": { "$exists": false } })));
        assert!(matches(&doc(), &json!({ "name": { "$ne": "alex" } })));
        assert!(!matches(&doc(), &json!({ "name": { "$ne": "sam" } })));
    }

    #[test]
    fn boolean_combinators() {
        let cond = json!({ "$or": [{ "uid": "u9" }, { "tz": -300 }] });
        assert!(matches(&doc(), &cond));
        let cond = json!({ "$and": [{ "uid": "u1" }, { "age": { "$gte": 30 } }] });
        assert!(matches(&doc(), &cond));
        let cond = json!({ "$and": [{ "uid": "u1" }, { "age": { "$gt": 30 } }] });
        assert!(!matches(&doc(), &cond));
    }

    #[test]
    fn ordered_comparisons() {
        assert!(matches(&doc(), &json!({ "age": { "$gt": 18, "$lt": 65 } })));
        assert!(matches(&doc(), &json!({ "name": { "$gte": "sam" } })));
        assert!(!matches(&doc(), &json!({ "age": { "$lt": 30 } })));
        // type mismatch never matches
        assert!(!matches(&doc(), &json!({ "name": { "$gt": 5 } })));
    }

    #[test]
    fn projection_keeps_listed_fields() {
        let projected = project(&doc(), &json!({ "uid": 1, "tk": 1, "gone": 1 }));
        assert_eq!(projected, json!({ "uid": "u1", "tk": { "ap": "tok" } }));
        assert_eq!(project(&doc(), &json!({})), doc());
    }
}
