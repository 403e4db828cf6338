//! Drift detection between desired and observed state.
//!
//! Top-level attributes the caller never set are treated as computed and do
//! not drift, unless the remote holds a non-empty collection there. Inside
//! anything the caller did set, values the remote has but the caller did not
//! declare (an extra tag, an extra list element) are drift.
//!
//! Per-path rules relax the comparison where the API legitimately rewrites a
//! value. Strings such as locations can be compared ignoring case, lists the
//! server may reorder can be compared as multisets, and some paths can be
//! skipped entirely.
//!
//! Rule paths are dotted attribute paths without list indices, so a rule for
//! `rules.name` applies to the `name` of every element of `rules`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// A single attribute difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Dotted attribute path.
    pub path: String,
    /// Observed value, absent if the remote does not have the attribute.
    pub before: Option<Value>,
    /// Desired value, absent if the attribute is being removed.
    pub after: Option<Value>,
}

impl AttributeChange {
    /// An attribute the remote does not have yet.
    pub fn added(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            before: None,
            after: Some(value),
        }
    }

    /// An attribute that will be removed.
    pub fn removed(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            before: Some(value),
            after: None,
        }
    }

    /// An attribute whose value differs.
    pub fn modified(path: impl Into<String>, before: Value, after: Value) -> Self {
        Self {
            path: path.into(),
            before: Some(before),
            after: Some(after),
        }
    }
}

/// Result of planning a reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// The state the resource will have after reconciliation.
    pub planned_state: Value,
    /// Attribute differences.
    pub changes: Vec<AttributeChange>,
    /// The resource must be destroyed and recreated.
    pub requires_replace: bool,
}

impl PlanResult {
    /// Nothing to do.
    pub fn no_change(state: Value) -> Self {
        Self {
            planned_state: state,
            changes: Vec::new(),
            requires_replace: false,
        }
    }

    /// A plan with changes.
    pub fn with_changes(
        planned_state: Value,
        changes: Vec<AttributeChange>,
        requires_replace: bool,
    ) -> Self {
        Self {
            planned_state,
            changes,
            requires_replace,
        }
    }

    /// Whether there is anything to reconcile.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty() || self.requires_replace
    }

    /// The change at `path`, if any.
    pub fn change(&self, path: &str) -> Option<&AttributeChange> {
        self.changes.iter().find(|c| c.path == path)
    }
}

/// Per-path comparison rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftRules {
    case_insensitive: BTreeSet<String>,
    unordered: BTreeSet<String>,
    ignored: BTreeSet<String>,
}

impl DriftRules {
    /// No relaxations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare strings at `path` ignoring case and spaces.
    pub fn case_insensitive(mut self, path: impl Into<String>) -> Self {
        self.case_insensitive.insert(path.into());
        self
    }

    /// Compare the list at `path` as a multiset.
    pub fn unordered(mut self, path: impl Into<String>) -> Self {
        self.unordered.insert(path.into());
        self
    }

    /// Never compare `path`.
    pub fn ignore(mut self, path: impl Into<String>) -> Self {
        self.ignored.insert(path.into());
        self
    }
}

/// Normalize an Azure location: lowercase with spaces removed.
///
/// ```
/// use hemmer_arm_reconcile::drift::normalize_location;
///
/// assert_eq!(normalize_location("West Europe"), "westeurope");
/// ```
pub fn normalize_location(location: &str) -> String {
    location.replace(' ', "").to_lowercase()
}

/// Order-independent SHA-256 digest of a JSON value, hex encoded.
///
/// Object keys are hashed in sorted order, so two values that differ only in
/// key order hash identically.
pub fn content_hash(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Differences between `desired` and `observed` under `rules`.
///
/// Top-level attributes the caller left unset are computed and only drift
/// when the remote holds a non-empty collection there. Below the top level,
/// anything the remote holds that the caller did not declare is reported as
/// removed.
pub fn detect_drift(desired: &Value, observed: &Value, rules: &DriftRules) -> Vec<AttributeChange> {
    let mut changes = Vec::new();
    let root = Scope::root(rules);
    match (desired, observed) {
        (Value::Object(want), Value::Object(have)) => root.members(want, have, &mut changes),
        _ => root.compare(desired, observed, &mut changes),
    }
    changes
}

/// Where a comparison is happening. `rule` is `path` without list indices.
struct Scope<'a> {
    path: String,
    rule: String,
    top_level: bool,
    rules: &'a DriftRules,
}

impl<'a> Scope<'a> {
    fn root(rules: &'a DriftRules) -> Self {
        Self {
            path: String::new(),
            rule: String::new(),
            top_level: false,
            rules,
        }
    }

    fn key(&self, key: &str) -> Self {
        Self {
            path: join(&self.path, key),
            rule: join(&self.rule, key),
            top_level: self.path.is_empty(),
            rules: self.rules,
        }
    }

    fn index(&self, index: usize) -> Self {
        Self {
            path: join(&self.path, &index.to_string()),
            rule: self.rule.clone(),
            top_level: false,
            rules: self.rules,
        }
    }

    fn ignored(&self) -> bool {
        self.rules.ignored.contains(&self.rule)
    }

    fn members(
        &self,
        want: &Map<String, Value>,
        have: &Map<String, Value>,
        changes: &mut Vec<AttributeChange>,
    ) {
        for (key, value) in want {
            self.key(key)
                .compare(value, have.get(key).unwrap_or(&Value::Null), changes);
        }
        for (key, seen) in have.iter().filter(|(key, _)| !want.contains_key(*key)) {
            self.key(key).unset(seen, changes);
        }
    }

    fn unset(&self, observed: &Value, changes: &mut Vec<AttributeChange>) {
        if self.ignored() {
            return;
        }
        let drifted = if self.top_level {
            is_container(observed) && !is_empty_container(observed)
        } else {
            !observed.is_null()
        };
        if drifted {
            changes.push(AttributeChange::removed(self.path.clone(), observed.clone()));
        }
    }

    fn compare(&self, desired: &Value, observed: &Value, changes: &mut Vec<AttributeChange>) {
        if self.ignored() {
            return;
        }
        if desired.is_null() {
            self.unset(observed, changes);
            return;
        }
        if observed.is_null() && is_empty_container(desired) {
            return;
        }

        let path = self.path.as_str();
        match (desired, observed) {
            (Value::Object(want), Value::Object(have)) => self.members(want, have, changes),
            (Value::Array(want), Value::Array(have)) if self.rules.unordered.contains(&self.rule) => {
                if !same_members(want, have) {
                    changes.push(AttributeChange::modified(path, observed.clone(), desired.clone()));
                }
            }
            (Value::Array(want), Value::Array(have)) if want.len() == have.len() => {
                for (index, (value, seen)) in want.iter().zip(have).enumerate() {
                    self.index(index).compare(value, seen, changes);
                }
            }
            (Value::String(want), Value::String(have))
                if self.rules.case_insensitive.contains(&self.rule) =>
            {
                if normalize_location(want) != normalize_location(have) {
                    changes.push(AttributeChange::modified(path, observed.clone(), desired.clone()));
                }
            }
            _ if desired == observed => {}
            (_, Value::Null) => changes.push(AttributeChange::added(path, desired.clone())),
            _ => changes.push(AttributeChange::modified(path, observed.clone(), desired.clone())),
        }
    }
}

fn same_members(want: &[Value], have: &[Value]) -> bool {
    if want.len() != have.len() {
        return false;
    }
    let mut a: Vec<String> = want.iter().map(content_hash).collect();
    let mut b: Vec<String> = have.iter().map(content_hash).collect();
    a.sort();
    b.sort();
    a == b
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::Array(_) | Value::Object(_))
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}
