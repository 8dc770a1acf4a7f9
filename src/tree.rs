//! Hierarchical attribute store of broadcast services.
//!
//! Every broadcast service keeps the last value received per topic.  Values
//! are JSON trees; a [`TopicPath`] such as `status.motion.axis.0.homed` names
//! the service category first, then walks object keys and array indices.
//! Paths are parsed once, up front, so a malformed path is reported where it
//! is built instead of silently resolving to nothing at lookup time.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

use crate::types::Category;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("empty segment in path '{0}'")]
    EmptySegment(String),
    #[error("unknown service '{segment}' in path '{path}'")]
    UnknownService { path: String, segment: String },
}

/// A validated dotted path into the state mirror.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPath {
    category: Category,
    segments: Vec<String>,
}

impl TopicPath {
    pub fn new<I, S>(category: Category, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            category,
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Shorthand for a path into the status service.
    pub fn status<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Category::Status, segments)
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The topic (first segment below the service), if any.
    pub fn topic(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: impl fmt::Display) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Self {
            category: self.category,
            segments,
        }
    }
}

impl FromStr for TopicPath {
    type Err = PathError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        if path.trim().is_empty() {
            return Err(PathError::Empty);
        }
        let mut parts = path.split('.');
        let head = parts.next().unwrap_or_default();
        let segments: Vec<String> = parts.map(str::to_string).collect();
        if head.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(PathError::EmptySegment(path.to_string()));
        }
        let category = head.parse().map_err(|_| PathError::UnknownService {
            path: path.to_string(),
            segment: head.to_string(),
        })?;
        Ok(Self { category, segments })
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category.name())?;
        for segment in &self.segments {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

/// Read access to the mirrored machine state.
pub trait StateView {
    fn lookup(&self, path: &TopicPath) -> Option<&Value>;
}

/// Last-known value per topic.
#[derive(Debug, Clone, Default)]
pub struct AttributeTree {
    topics: BTreeMap<String, Value>,
}

impl AttributeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole value of `topic`.
    pub fn replace(&mut self, topic: &str, value: Value) {
        self.topics.insert(topic.to_string(), value);
    }

    /// Merges a partial update into `topic`.
    pub fn merge(&mut self, topic: &str, value: Value) {
        match self.topics.get_mut(topic) {
            Some(existing) => merge_value(existing, value),
            None => {
                self.topics.insert(topic.to_string(), value);
            }
        }
    }

    pub fn topic(&self, topic: &str) -> Option<&Value> {
        self.topics.get(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn clear(&mut self) {
        self.topics.clear();
    }

    /// Resolves `segments` (topic first) to a value.
    pub fn get(&self, segments: &[String]) -> Option<&Value> {
        let (topic, rest) = segments.split_first()?;
        navigate(self.topics.get(topic)?, rest)
    }
}

/// Walks `segments` down from `value`: object keys by name, array elements
/// by numeric index.
pub fn navigate<'a>(mut value: &'a Value, segments: &[String]) -> Option<&'a Value> {
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => element(items, segment.parse().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

// Matches the element whose `index` field is `index`; elements without one
// are addressed by position, the same way `merge_array` places them.
fn element(items: &[Value], index: u64) -> Option<&Value> {
    items
        .iter()
        .find(|item| element_index(item) == Some(index))
        .or_else(|| {
            let item = items.get(usize::try_from(index).ok()?)?;
            element_index(item).is_none().then_some(item)
        })
}

/// Machine-style truthiness: `0`, `false`, `null` and empty values are false.
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn merge_value(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                match dst.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        dst.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(dst), Value::Array(src)) => merge_array(dst, src),
        (dst, src) => *dst = src,
    }
}

// Elements carrying an `index` field are matched on it, the others by position.
fn merge_array(dst: &mut Vec<Value>, src: Vec<Value>) {
    for (position, item) in src.into_iter().enumerate() {
        let slot = match element_index(&item) {
            Some(index) => dst
                .iter()
                .position(|existing| element_index(existing) == Some(index)),
            None if position < dst.len() => Some(position),
            None => None,
        };
        match slot {
            Some(slot) => merge_value(&mut dst[slot], item),
            None => dst.push(item),
        }
    }
}

fn element_index(value: &Value) -> Option<u64> {
    value.get("index").and_then(Value::as_u64)
}
