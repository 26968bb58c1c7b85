//! Derives record dimensions from cost items.
//!
//! Each mapping rule evaluates a path expression such as
//! `{.Pod.ObjectMeta.Labels.app}` or `{.Node.Labels['topology.kubernetes.io/zone']}`
//! against a fixed view of the cost item:
//!
//! ```text
//! Kind, Strategy, Value
//! Pod.ObjectMeta.{Name,Namespace,Labels,Annotations}   (also promoted onto Pod)
//! Pod.Spec.NodeName, Pod.Status.Phase
//! Node.ObjectMeta.{Name,Labels}                        (also promoted onto Node)
//! ```
//!
//! Paths are parsed when the configuration is loaded. Evaluation never
//! fails: a missing path or an empty value yields the rule's default.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::strategy::CostItem;
use crate::inventory::{Node, ObjectMeta, Workload};

/// Label names reserved for the record identity.
const RESERVED_DESTINATIONS: [&str; 2] = ["kind", "strategy"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapperError {
    #[error("invalid path expression {expr:?} at offset {offset}: {reason}")]
    InvalidPath {
        expr: String,
        offset: usize,
        reason: &'static str,
    },
    #[error("invalid mapping destination {0:?}: must match [a-zA-Z_][a-zA-Z0-9_]*")]
    InvalidDestination(String),
    #[error("mapping destination {0:?} is reserved")]
    ReservedDestination(String),
}

/// A parsed dotted path with optional bracketed map keys.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PathExpr {
    raw: String,
    segments: Vec<String>,
}

impl PathExpr {
    pub fn parse(raw: &str) -> Result<Self, MapperError> {
        let err = |offset: usize, reason: &'static str| MapperError::InvalidPath {
            expr: raw.to_string(),
            offset,
            reason,
        };

        let trimmed = raw.trim();
        let base = raw.len() - raw.trim_start().len();

        let (body, mut offset) = match trimmed.strip_prefix('{') {
            Some(rest) => match rest.strip_suffix('}') {
                Some(inner) => (inner, base + 1),
                None => return Err(err(raw.len(), "missing closing '}'")),
            },
            None => (trimmed, base),
        };
        if body.contains(['{', '}']) {
            return Err(err(offset, "unexpected brace"));
        }

        let mut rest = body;
        if let Some(r) = rest.strip_prefix('$') {
            rest = r;
            offset += 1;
        }

        let mut segments = Vec::new();
        let mut first = true;
        while !rest.is_empty() {
            if let Some(r) = rest.strip_prefix('[') {
                let quote = r
                    .chars()
                    .next()
                    .filter(|c| *c == '\'' || *c == '"')
                    .ok_or_else(|| err(offset + 1, "expected quoted key after '['"))?;
                let r = &r[1..];
                let end = r
                    .find(quote)
                    .ok_or_else(|| err(offset + 2, "unterminated quoted key"))?;
                let key = &r[..end];
                let r = r[end + 1..]
                    .strip_prefix(']')
                    .ok_or_else(|| err(offset + end + 3, "expected ']'"))?;
                segments.push(key.to_string());
                offset += rest.len() - r.len();
                rest = r;
            } else {
                let r = match rest.strip_prefix('.') {
                    Some(r) => r,
                    None if first => rest,
                    None => return Err(err(offset, "expected '.' or '['")),
                };
                let start = offset + (rest.len() - r.len());
                let len = r.find(['.', '[']).unwrap_or(r.len());
                let ident = &r[..len];
                if ident.is_empty() {
                    return Err(err(start, "empty path segment"));
                }
                if let Some(pos) = ident.find(|c: char| !is_ident_char(c)) {
                    return Err(err(start + pos, "invalid character in path segment"));
                }
                segments.push(ident.to_string());
                offset = start + len;
                rest = &r[len..];
            }
            first = false;
        }

        if segments.is_empty() {
            return Err(err(offset, "empty path expression"));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Resolves the path against `source`; missing paths yield "".
    pub fn evaluate(&self, source: &Value) -> String {
        let mut current = source;
        for segment in &self.segments {
            match current.get(segment.as_str()) {
                Some(next) => current = next,
                None => return String::new(),
            }
        }

        match current {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/')
}

impl TryFrom<String> for PathExpr {
    type Error = MapperError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl FromStr for PathExpr {
    type Err = MapperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A single dimension rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Mapping {
    pub source: PathExpr,
    pub destination: String,
    #[serde(default)]
    pub default: String,
}

/// Ordered dimension rules. Later rules overwrite earlier rules sharing a
/// destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Mapper {
    #[serde(default)]
    pub entries: Vec<Mapping>,
}

impl Mapper {
    pub fn new(entries: Vec<Mapping>) -> Self {
        Self { entries }
    }

    /// Checks that every destination is usable as a metric label and a
    /// column suffix.
    pub fn validate(&self) -> Result<(), MapperError> {
        for m in &self.entries {
            let name = m.destination.as_str();
            let mut chars = name.chars();
            let valid_start = chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
            if !valid_start
                || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                || name.starts_with("__")
            {
                return Err(MapperError::InvalidDestination(m.destination.clone()));
            }
            if RESERVED_DESTINATIONS.contains(&name) {
                return Err(MapperError::ReservedDestination(m.destination.clone()));
            }
        }
        Ok(())
    }

    /// Distinct destinations in first-seen order.
    pub fn destinations(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::with_capacity(self.entries.len());
        for m in &self.entries {
            if !out.contains(&m.destination.as_str()) {
                out.push(&m.destination);
            }
        }
        out
    }

    /// Evaluates every rule against `source`.
    pub fn map_data(&self, source: &Value) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for m in &self.entries {
            let mut value = m.source.evaluate(source);
            if value.is_empty() {
                value = m.default.clone();
            }
            out.insert(m.destination.clone(), value);
        }
        out
    }
}

/// Builds the view of a cost item that mapping paths are evaluated against.
pub fn source_view(item: &CostItem<'_>) -> Value {
    let mut view = Map::new();
    view.insert("Kind".into(), json!(item.kind.as_str()));
    view.insert("Strategy".into(), json!(item.strategy));
    view.insert("Value".into(), json!(item.value));
    if let Some(workload) = item.workload {
        view.insert("Pod".into(), workload_view(workload));
    }
    if let Some(node) = item.node {
        view.insert("Node".into(), node_view(node));
    }
    Value::Object(view)
}

fn meta_view(meta: &ObjectMeta, with_namespace: bool) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("Name".into(), json!(meta.name));
    if with_namespace {
        m.insert("Namespace".into(), json!(meta.namespace));
        m.insert("Annotations".into(), json!(meta.annotations));
    }
    m.insert("Labels".into(), json!(meta.labels));
    m
}

fn workload_view(workload: &Workload) -> Value {
    let meta = meta_view(&workload.metadata, true);
    let mut pod = meta.clone();
    pod.insert("ObjectMeta".into(), Value::Object(meta));
    pod.insert(
        "Spec".into(),
        json!({ "NodeName": workload.spec.node_name }),
    );
    pod.insert("Status".into(), json!({ "Phase": workload.status.phase }));
    Value::Object(pod)
}

fn node_view(node: &Node) -> Value {
    let meta = meta_view(&node.metadata, false);
    let mut view = meta.clone();
    view.insert("ObjectMeta".into(), Value::Object(meta));
    Value::Object(view)
}
