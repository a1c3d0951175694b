//! Typed message metadata with path addressing
//!
//! Metadata values are addressed with a path grammar: `a/b/c` descends
//! nested maps, `k[2]` indexes arrays, and both compose (`a[1]/b`).
//! Missing paths read as "not present", never as an error. Typed
//! accessors convert when trivially safe and fail with
//! [Error::TypeMismatch] otherwise. Map keys match exactly first, then
//! case-insensitively.
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;

use crate::Error;

/// One parsed path segment: a map key plus any trailing array indices.
#[derive(Debug, PartialEq)]
struct Segment<'a> {
    key: &'a str,
    indices: Vec<usize>,
}

fn parse_segment(raw: &str) -> Segment<'_> {
    let mut key = raw;
    let mut indices = Vec::new();
    while let Some(open) = key.rfind('[') {
        if !key.ends_with(']') {
            break;
        }
        let inner = &key[open + 1..key.len() - 1];
        match inner.parse::<usize>() {
            Ok(n) => {
                indices.insert(0, n);
                key = &key[..open];
            }
            Err(_) => break,
        }
    }
    Segment { key, indices }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "array",
        Value::Mapping(_) => "map",
        Value::Tagged(_) => "tagged",
    }
}

fn lookup<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    let mut relaxed: Option<&Value> = None;
    for (k, v) in map {
        if let Value::String(s) = k {
            if s == key {
                return Some(v);
            }
            if relaxed.is_none() && s.eq_ignore_ascii_case(key) {
                relaxed = Some(v);
            }
        }
    }
    relaxed
}

/// Mapping from string keys to typed values carried by every [crate::Message].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    root: Mapping,
}

impl Metadata {
    /// Creates an empty metadata mapping.
    pub fn new() -> Self {
        Metadata::default()
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// True when no keys are set.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Reads the value at `path`, `None` when any part of the path is absent.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current: Option<&Value> = None;
        for (i, raw) in path.split('/').enumerate() {
            let seg = parse_segment(raw);
            let map = if i == 0 {
                &self.root
            } else {
                match current {
                    Some(Value::Mapping(m)) => m,
                    _ => return None,
                }
            };
            let mut value = lookup(map, seg.key)?;
            for idx in &seg.indices {
                match value {
                    Value::Sequence(items) => value = items.get(*idx)?,
                    _ => return None,
                }
            }
            current = Some(value);
        }
        current
    }

    /// Writes `value` at `path`, creating intermediate maps as needed.
    ///
    /// Array-index segments must already exist with the index in range;
    /// paths cannot descend through scalars.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<(), Error> {
        let segments: Vec<Segment> = path.split('/').map(parse_segment).collect();
        set_inner(&mut self.root, &segments, value.into(), path)
    }

    /// Removes the value at `path`, returning it if present. Only plain map
    /// paths are supported; array elements cannot be removed.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('/').collect();
        let (last, parents) = segments.split_last()?;
        let mut map = &mut self.root;
        for key in parents {
            match map.get_mut(Value::String((*key).to_string())) {
                Some(Value::Mapping(m)) => map = m,
                _ => return None,
            }
        }
        map.remove(Value::String((*last).to_string()))
    }

    /// Reads an integer. Floats with a zero fraction convert.
    pub fn get_int(&self, path: &str) -> Result<Option<i64>, Error> {
        match self.get(path) {
            None => Ok(None),
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Ok(Some(i))
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 {
                        Ok(Some(f as i64))
                    } else {
                        Err(mismatch(path, "int", "number"))
                    }
                } else {
                    Err(mismatch(path, "int", "number"))
                }
            }
            Some(other) => Err(mismatch(path, "int", type_name(other))),
        }
    }

    /// Reads a boolean.
    pub fn get_bool(&self, path: &str) -> Result<Option<bool>, Error> {
        match self.get(path) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(mismatch(path, "bool", type_name(other))),
        }
    }

    /// Reads a string. Numbers and booleans render to their display form.
    pub fn get_str(&self, path: &str) -> Result<Option<String>, Error> {
        match self.get(path) {
            None => Ok(None),
            Some(v) => scalar_to_string(v)
                .map(Some)
                .ok_or_else(|| mismatch(path, "string", type_name(v))),
        }
    }

    /// Reads an array of strings, coercing scalar elements.
    pub fn get_string_array(&self, path: &str) -> Result<Option<Vec<String>>, Error> {
        match self.get(path) {
            None => Ok(None),
            Some(Value::Sequence(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match scalar_to_string(item) {
                        Some(s) => out.push(s),
                        None => return Err(mismatch(path, "string array", type_name(item))),
                    }
                }
                Ok(Some(out))
            }
            Some(other) => Err(mismatch(path, "string array", type_name(other))),
        }
    }

    /// Reads a map of strings to strings, coercing scalar values.
    pub fn get_string_map(&self, path: &str) -> Result<Option<HashMap<String, String>>, Error> {
        match self.get(path) {
            None => Ok(None),
            Some(Value::Mapping(m)) => {
                let mut out = HashMap::with_capacity(m.len());
                for (k, v) in m {
                    let key = match k {
                        Value::String(s) => s.clone(),
                        _ => return Err(mismatch(path, "string map", type_name(k))),
                    };
                    match scalar_to_string(v) {
                        Some(s) => {
                            let _ = out.insert(key, s);
                        }
                        None => return Err(mismatch(path, "string map", type_name(v))),
                    }
                }
                Ok(Some(out))
            }
            Some(other) => Err(mismatch(path, "string map", type_name(other))),
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn mismatch(path: &str, expected: &'static str, found: &'static str) -> Error {
    Error::TypeMismatch {
        path: path.to_string(),
        expected,
        found,
    }
}

fn set_inner(
    map: &mut Mapping,
    segments: &[Segment],
    value: Value,
    path: &str,
) -> Result<(), Error> {
    let (seg, rest) = match segments.split_first() {
        Some(pair) => pair,
        None => return Ok(()),
    };
    let key = Value::String(seg.key.to_string());

    if seg.indices.is_empty() && rest.is_empty() {
        let _ = map.insert(key, value);
        return Ok(());
    }

    if !seg.indices.is_empty() {
        // descend into an existing array, final index may replace or append
        let entry = map.get_mut(&key).ok_or_else(|| {
            Error::ExecutionError(format!("metadata path {path}: array segment does not exist"))
        })?;
        let mut current = entry;
        for (n, idx) in seg.indices.iter().enumerate() {
            let items = match current {
                Value::Sequence(items) => items,
                other => {
                    return Err(mismatch(path, "array", type_name(other)));
                }
            };
            let last_index = n == seg.indices.len() - 1;
            if last_index && rest.is_empty() {
                if *idx < items.len() {
                    items[*idx] = value;
                } else if *idx == items.len() {
                    items.push(value);
                } else {
                    return Err(Error::ExecutionError(format!(
                        "metadata path {path}: array index {idx} out of bounds"
                    )));
                }
                return Ok(());
            }
            current = items.get_mut(*idx).ok_or_else(|| {
                Error::ExecutionError(format!(
                    "metadata path {path}: array index {idx} out of bounds"
                ))
            })?;
        }
        return match current {
            Value::Mapping(m) => set_inner(m, rest, value, path),
            other => Err(mismatch(path, "map", type_name(other))),
        };
    }

    // plain key with more path to walk: descend, creating maps on the way
    let entry = map
        .entry(key)
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    match entry {
        Value::Mapping(m) => set_inner(m, rest, value, path),
        other => Err(mismatch(path, "map", type_name(other))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut md = Metadata::new();
        md.set("host", "alpha").unwrap();
        assert_eq!(md.get_str("host").unwrap(), Some("alpha".to_string()));
        assert!(md.get("port").is_none());
    }

    #[test]
    fn nested_paths_create_intermediate_maps() {
        let mut md = Metadata::new();
        md.set("net/peer/addr", "10.0.0.1").unwrap();
        assert_eq!(
            md.get_str("net/peer/addr").unwrap(),
            Some("10.0.0.1".to_string())
        );
        assert!(md.get("net/peer/port").is_none());
        assert!(md.get("net/other").is_none());
    }

    #[test]
    fn array_index_reads() {
        let mut md = Metadata::new();
        md.set("tags", vec!["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(md.get_str("tags[1]").unwrap(), Some("b".to_string()));
        assert!(md.get("tags[9]").is_none());
    }

    #[test]
    fn composed_index_and_descent() {
        let yaml = "hosts:\n  - name: a\n  - name: b\n";
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        let mut md = Metadata::new();
        if let Value::Mapping(m) = value {
            md.root = m;
        }
        assert_eq!(md.get_str("hosts[1]/name").unwrap(), Some("b".to_string()));
    }

    #[test]
    fn missing_path_is_not_an_error() {
        let md = Metadata::new();
        assert!(md.get("a/b/c[3]/d").is_none());
        assert_eq!(md.get_int("a/b").unwrap(), None);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut md = Metadata::new();
        md.set("count", "not a number").unwrap();
        match md.get_int("count") {
            Err(Error::TypeMismatch { path, .. }) => assert_eq!(path, "count"),
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn trivially_safe_coercions() {
        let mut md = Metadata::new();
        md.set("port", 8080).unwrap();
        md.set("ratio", 2.0).unwrap();
        md.set("on", true).unwrap();
        assert_eq!(md.get_str("port").unwrap(), Some("8080".to_string()));
        assert_eq!(md.get_int("ratio").unwrap(), Some(2));
        assert_eq!(md.get_str("on").unwrap(), Some("true".to_string()));
    }

    #[test]
    fn fractional_float_does_not_coerce_to_int() {
        let mut md = Metadata::new();
        md.set("ratio", 2.5).unwrap();
        assert!(md.get_int("ratio").is_err());
    }

    #[test]
    fn case_insensitive_lookup() {
        let mut md = Metadata::new();
        md.set("Stream", "errors").unwrap();
        assert_eq!(md.get_str("stream").unwrap(), Some("errors".to_string()));
    }

    #[test]
    fn string_array_accessor() {
        let mut md = Metadata::new();
        md.set("tags", vec![Value::from("x"), Value::from(3)]).unwrap();
        assert_eq!(
            md.get_string_array("tags").unwrap(),
            Some(vec!["x".to_string(), "3".to_string()])
        );
    }

    #[test]
    fn string_map_accessor() {
        let yaml = "labels:\n  app: weir\n  tier: 2\n";
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        let mut md = Metadata::new();
        if let Value::Mapping(m) = value {
            md.root = m;
        }
        let labels = md.get_string_map("labels").unwrap().unwrap();
        assert_eq!(labels.get("app"), Some(&"weir".to_string()));
        assert_eq!(labels.get("tier"), Some(&"2".to_string()));
    }

    #[test]
    fn remove_returns_value() {
        let mut md = Metadata::new();
        md.set("a/b", 1).unwrap();
        assert!(md.remove("a/b").is_some());
        assert!(md.get("a/b").is_none());
    }

    #[test]
    fn array_element_replace_and_append() {
        let mut md = Metadata::new();
        md.set("tags", vec!["a".to_string()]).unwrap();
        md.set("tags[0]", "z").unwrap();
        md.set("tags[1]", "y").unwrap();
        assert_eq!(
            md.get_string_array("tags").unwrap(),
            Some(vec!["z".to_string(), "y".to_string()])
        );
        assert!(md.set("tags[5]", "nope").is_err());
    }
}
