//! Structural comparison of resource documents.
//!
//! Pure and storage-agnostic: conflict detection works on JSON values, not
//! on any particular snapshot source.

use serde_json::Value;

/// Structural equality of two documents.
#[must_use]
pub fn values_equal(local: &Value, remote: &Value) -> bool {
    diff_paths(local, remote).is_empty()
}

/// Paths at which two documents differ, in depth-first order.
///
/// Paths use `/`-joined keys (array entries by index); the root is `""`.
#[must_use]
pub fn diff_paths(local: &Value, remote: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect(local, remote, String::new(), &mut paths);
    paths
}

fn collect(local: &Value, remote: &Value, path: String, paths: &mut Vec<String>) {
    match (local, remote) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = join(&path, key);
                match (a.get(key), b.get(key)) {
                    (Some(left), Some(right)) => collect(left, right, child, paths),
                    _ => paths.push(child),
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                paths.push(path);
                return;
            }
            for (index, (left, right)) in a.iter().zip(b).enumerate() {
                collect(left, right, join(&path, &index.to_string()), paths);
            }
        }
        (a, b) => {
            if a != b {
                paths.push(path);
            }
        }
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}/{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn identical_documents_have_no_diff() {
        let doc = json!({"name": "A", "nodes": {"n1": {"op": "get"}}, "tags": [1, 2]});
        assert!(values_equal(&doc, &doc.clone()));
        assert!(diff_paths(&doc, &doc).is_empty());
    }

    #[test]
    fn scalar_mismatch_reports_path() {
        let local = json!({"name": "A", "meta": {"color": "red"}});
        let remote = json!({"name": "A", "meta": {"color": "blue"}});
        assert_eq!(diff_paths(&local, &remote), vec!["meta/color"]);
    }

    #[test]
    fn missing_key_reports_path_from_either_side() {
        let local = json!({"a": 1});
        let remote = json!({"b": 2});
        assert_eq!(diff_paths(&local, &remote), vec!["a", "b"]);
    }

    #[test]
    fn array_length_mismatch_reports_array_path() {
        let local = json!({"items": [1, 2]});
        let remote = json!({"items": [1, 2, 3]});
        assert_eq!(diff_paths(&local, &remote), vec!["items"]);
    }

    #[test]
    fn array_entry_mismatch_reports_indexed_path() {
        let local = json!({"items": [{"v": 1}, {"v": 2}]});
        let remote = json!({"items": [{"v": 1}, {"v": 9}]});
        assert_eq!(diff_paths(&local, &remote), vec!["items/1/v"]);
    }

    #[test]
    fn type_change_is_a_root_diff() {
        let local = json!({"a": 1});
        let remote = json!([1]);
        assert_eq!(diff_paths(&local, &remote), vec![""]);
    }

    #[test]
    fn object_key_order_is_irrelevant() {
        let local = json!({"a": 1, "b": 2});
        let remote = serde_json::from_str::<Value>(r#"{"b": 2, "a": 1}"#).unwrap();
        assert!(values_equal(&local, &remote));
    }
}
