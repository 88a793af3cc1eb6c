//! Document model shared by the store drivers
//!
//! Documents are JSON objects. Filters follow the usual document-database
//! shape: `{ field: value }` for equality, `{ field: { $op: value } }` for
//! comparisons, with dotted paths reaching into nested objects.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::error::StoreError;

pub type Document = Map<String, Value>;

/// Field holding the store-assigned identifier
pub const ID_FIELD: &str = "_id";

/// Modification applied by `update_one`
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Merge the given fields into the document
    Set(Document),
    /// Remove the named fields
    Unset(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Options for `find`
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted_by(field: &str, order: SortOrder) -> Self {
        Self {
            sort: Some((field.to_string(), order)),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Render a timestamp the way every document stores it
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Resolve a dotted path inside a document
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Check a document against a filter
pub fn matches(doc: &Document, filter: &Document) -> Result<bool, StoreError> {
    for (path, condition) in filter {
        if path.starts_with('$') {
            return Err(StoreError::InvalidFilter(format!("unsupported top-level operator {}", path)));
        }
        let actual = get_path(doc, path);
        let matched = match condition {
            Value::Object(ops) if is_operator_object(ops) => {
                let mut all = true;
                for (op, expected) in ops {
                    if !apply_operator(op, actual, expected)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            expected => equals(actual, expected),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn is_operator_object(map: &Document) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn apply_operator(op: &str, actual: Option<&Value>, expected: &Value) -> Result<bool, StoreError> {
    let ordered = |accept: fn(Ordering) -> bool| -> bool {
        match actual {
            Some(value) if same_kind(value, expected) => accept(compare_values(value, expected)),
            _ => false,
        }
    };
    let result = match op {
        "$eq" => equals(actual, expected),
        "$ne" => !equals(actual, expected),
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        "$in" => in_list(op, actual, expected)?,
        "$nin" => !in_list(op, actual, expected)?,
        "$exists" => actual.is_some() == expected.as_bool().unwrap_or(true),
        other => return Err(StoreError::InvalidFilter(format!("unsupported operator {}", other))),
    };
    Ok(result)
}

fn in_list(op: &str, actual: Option<&Value>, expected: &Value) -> Result<bool, StoreError> {
    let candidates = expected
        .as_array()
        .ok_or_else(|| StoreError::InvalidFilter(format!("{} expects an array", op)))?;
    Ok(candidates.iter().any(|candidate| equals(actual, candidate)))
}

/// Equality with array containment, as document databases do it
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => items.iter().any(|item| item == expected),
        Some(value) => value == expected,
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values; RFC 3339 strings compare chronologically
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Apply an update in place; returns whether anything changed.
/// Dotted keys address nested fields, the same way filters read them.
pub fn apply_update(doc: &mut Document, update: &Update) -> Result<bool, StoreError> {
    match update {
        Update::Set(fields) => {
            // Staged on a copy so a conflicting path leaves the document untouched
            let mut staged = doc.clone();
            let mut changed = false;
            for (path, value) in fields {
                check_path(path)?;
                if is_id_path(path) {
                    continue;
                }
                changed |= set_path(&mut staged, path, path, value)?;
            }
            *doc = staged;
            Ok(changed)
        }
        Update::Unset(paths) => {
            let mut changed = false;
            for path in paths {
                check_path(path)?;
                if is_id_path(path) {
                    continue;
                }
                changed |= unset_path(doc, path);
            }
            Ok(changed)
        }
    }
}

fn check_path(path: &str) -> Result<(), StoreError> {
    if path.split('.').any(str::is_empty) {
        return Err(StoreError::InvalidUpdate(format!("empty field name in {:?}", path)));
    }
    Ok(())
}

fn is_id_path(path: &str) -> bool {
    path.split('.').next() == Some(ID_FIELD)
}

/// Write `value` at `rest` below `target`, creating missing objects on the way
fn set_path(target: &mut Document, full: &str, rest: &str, value: &Value) -> Result<bool, StoreError> {
    match rest.split_once('.') {
        None => {
            if target.get(rest) == Some(value) {
                return Ok(false);
            }
            target.insert(rest.to_string(), value.clone());
            Ok(true)
        }
        Some((head, tail)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            set_in_value(child, full, tail, value)
        }
    }
}

fn set_in_value(node: &mut Value, full: &str, rest: &str, value: &Value) -> Result<bool, StoreError> {
    match node {
        Value::Object(map) => set_path(map, full, rest, value),
        Value::Array(items) => {
            let (head, tail) = match rest.split_once('.') {
                Some((head, tail)) => (head, Some(tail)),
                None => (rest, None),
            };
            let slot = head
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get_mut(index))
                .ok_or_else(|| StoreError::InvalidUpdate(format!("cannot reach {} through an array", full)))?;
            match tail {
                Some(tail) => set_in_value(slot, full, tail, value),
                None if slot == value => Ok(false),
                None => {
                    *slot = value.clone();
                    Ok(true)
                }
            }
        }
        _ => Err(StoreError::InvalidUpdate(format!("cannot create {} inside a non-object value", full))),
    }
}

fn unset_path(target: &mut Document, path: &str) -> bool {
    match path.split_once('.') {
        None => target.remove(path).is_some(),
        Some((head, tail)) => match target.get_mut(head) {
            Some(Value::Object(map)) => unset_path(map, tail),
            _ => false,
        },
    }
}

/// Sort documents in place by one field
pub fn sort_documents(docs: &mut [Document], field: &str, order: SortOrder) {
    docs.sort_by(|a, b| {
        let ord = match (get_path(a, field), get_path(b, field)) {
            (Some(x), Some(y)) => compare_values(x, y),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        match order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    });
}

/// Filter, sort and limit an already loaded collection
pub fn select(docs: impl IntoIterator<Item = Document>, filter: &Document, options: &FindOptions) -> Result<Vec<Document>, StoreError> {
    let mut selected = Vec::new();
    for doc in docs {
        if matches(&doc, filter)? {
            selected.push(doc);
        }
    }
    if let Some((field, order)) = &options.sort {
        sort_documents(&mut selected, field, *order);
    }
    if let Some(limit) = options.limit {
        selected.truncate(limit);
    }
    Ok(selected)
}

/// Name an index after its key the conventional way, e.g. `video_id_1_chunk_index_1`
pub fn index_name(keys: &[(String, i32)]) -> String {
    keys.iter()
        .map(|(field, direction)| format!("{}_{}", field, direction))
        .collect::<Vec<_>>()
        .join("_")
}
