//! Dot-separated field paths over JSON documents
//!
//! `metadata.labels.app` addresses nested object keys. A backslash escapes a
//! literal dot (`metadata.labels.app\.kubernetes\.io/name`) and `[n]`
//! addresses an array element (`spec.containers[0].image`).

use std::fmt;

use serde_json::{Map, Value};

use crate::TransformError;

/// One step of a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object key
    Key(String),
    /// Array index
    Index(usize),
}

/// A parsed field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse a dot-separated path
    pub fn parse(raw: &str) -> Result<Self, TransformError> {
        let invalid = |reason: &str| TransformError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut key = String::new();
        // Set once a segment has been closed by `]`, so `a[0].b` is valid
        // while `a..b` is not
        let mut closed = false;
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => key.push(escaped),
                    None => return Err(invalid("trailing escape")),
                },
                '.' => {
                    if key.is_empty() && !closed {
                        return Err(invalid("empty segment"));
                    }
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    }
                    closed = false;
                }
                '[' => {
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    }
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(d) if d.is_ascii_digit() => digits.push(d),
                            _ => return Err(invalid("malformed array index")),
                        }
                    }
                    let index = digits
                        .parse()
                        .map_err(|_| invalid("malformed array index"))?;
                    segments.push(Segment::Index(index));
                    closed = true;
                    if matches!(chars.peek(), Some(c) if *c != '.' && *c != '[') {
                        return Err(invalid("index must end a segment"));
                    }
                }
                _ => {
                    key.push(c);
                    closed = false;
                }
            }
        }

        if !key.is_empty() {
            segments.push(Segment::Key(key));
        } else if !closed {
            return Err(invalid("empty segment"));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The path as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parsed segments
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether `self` equals `prefix` or lies underneath it
    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Read the value at this path
    pub fn get<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.segments.iter().try_fold(doc, |node, segment| match segment {
            Segment::Key(key) => node.as_object()?.get(key),
            Segment::Index(index) => node.as_array()?.get(*index),
        })
    }

    /// Write `value` at this path, creating missing intermediate objects
    ///
    /// An index one past the end of an array appends. Walking through a
    /// scalar, or indexing beyond the end, is a [`TransformError::PathConflict`].
    pub fn set(&self, doc: &mut Value, value: Value) -> Result<(), TransformError> {
        set_at(doc, &self.segments, value, self)
    }

    /// Remove and return the value at this path; a missing path is a no-op
    pub fn remove(&self, doc: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut node = doc;
        for segment in parents {
            node = match segment {
                Segment::Key(key) => node.as_object_mut()?.get_mut(key)?,
                Segment::Index(index) => node.as_array_mut()?.get_mut(*index)?,
            };
        }
        match last {
            Segment::Key(key) => node.as_object_mut()?.remove(key),
            Segment::Index(index) => {
                let items = node.as_array_mut()?;
                (*index < items.len()).then(|| items.remove(*index))
            }
        }
    }
}

fn set_at(
    node: &mut Value,
    segments: &[Segment],
    value: Value,
    path: &FieldPath,
) -> Result<(), TransformError> {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return Ok(());
    };
    let conflict = || TransformError::PathConflict {
        path: path.raw.clone(),
    };

    match head {
        Segment::Key(key) => {
            if node.is_null() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return Err(conflict());
            };
            let child = map.entry(key.clone()).or_insert(Value::Null);
            set_at(child, rest, value, path)
        }
        Segment::Index(index) => {
            if node.is_null() {
                *node = Value::Array(Vec::new());
            }
            let Value::Array(items) = node else {
                return Err(conflict());
            };
            if *index == items.len() {
                items.push(Value::Null);
            }
            let child = items.get_mut(*index).ok_or_else(conflict)?;
            set_at(child, rest, value, path)
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
