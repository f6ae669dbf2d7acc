//! Field-level transforms for mirrored objects
//!
//! A mirrored object is edited as a JSON document without knowledge of its
//! schema. Every transform first strips the fields in [`DEFAULT_STRIP_PATHS`]
//! (cluster bookkeeping that must never leak from the source cluster), then
//! applies the mirror's rules in declared order, then strips again so a rule
//! writing an enclosing object (`set metadata {...}`) cannot bring them back.
//!
//! Rules may consult a *reference* document: the object as it currently
//! exists on the follower. On the create path there is no reference and every
//! rule that would read from it degrades to a deletion.

#![deny(missing_docs)]

pub mod path;

use std::str::FromStr;

use mirror_common::config::FilterAction;
use once_cell::sync::Lazy;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub use path::{FieldPath, Segment};

/// Fields removed from every source document before rules run
pub const DEFAULT_STRIP_PATHS: &[&str] = &[
    "metadata.annotations",
    "metadata.creationTimestamp",
    "metadata.deletionGracePeriodSeconds",
    "metadata.deletionTimestamp",
    "metadata.finalizers",
    "metadata.generateName",
    "metadata.generation",
    "metadata.managedFields",
    "metadata.ownerReferences",
    "metadata.resourceVersion",
    "metadata.selfLink",
    "metadata.uid",
    "status",
    "secrets",
];

static DEFAULT_STRIP: Lazy<Vec<FieldPath>> = Lazy::new(|| {
    DEFAULT_STRIP_PATHS
        .iter()
        .filter_map(|p| FieldPath::parse(p).ok())
        .collect()
});

/// Transform failures
#[derive(Debug, Error)]
pub enum TransformError {
    /// A rule key is not a valid field path
    #[error("invalid field path {path:?}: {reason}")]
    InvalidPath {
        /// Path as configured
        path: String,
        /// What is wrong with it
        reason: String,
    },

    /// A write would have to traverse a scalar or skip array elements
    #[error("cannot set {path:?}: an intermediate value is not a container")]
    PathConflict {
        /// Path being written
        path: String,
    },

    /// Document bytes are not valid JSON
    #[error("document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a rule does with its field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The follower's value if it has one, otherwise the literal
    Replace,
    /// Always the literal
    Set,
    /// Remove the field
    Delete,
    /// The follower's value if it has one, otherwise remove the field
    ///
    /// Not configurable; the sync layer uses it to keep follower-owned fields.
    CarryOver,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(Self::Replace),
            "set" => Ok(Self::Set),
            "delete" => Ok(Self::Delete),
            other => Err(other.to_string()),
        }
    }
}

/// One compiled field action
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    action: Action,
    path: FieldPath,
    literal: Option<Value>,
}

impl Rule {
    /// Build a rule; an empty `value` means "no literal"
    ///
    /// Literals are parsed as JSON, falling back to a plain string.
    pub fn new(action: Action, key: &str, value: &str) -> Result<Self, TransformError> {
        Ok(Self {
            action,
            path: FieldPath::parse(key)?,
            literal: parse_literal(value),
        })
    }

    /// Keep the follower's value at `path`, or drop the field
    pub fn carry_over(path: FieldPath) -> Self {
        Self {
            action: Action::CarryOver,
            path,
            literal: None,
        }
    }

    /// The rule's action
    pub fn action(&self) -> Action {
        self.action
    }

    /// The rule's field path
    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Apply this rule to `doc`
    pub fn apply(&self, doc: &mut Value, reference: Option<&Value>) -> Result<(), TransformError> {
        let from_reference = || reference.and_then(|r| self.path.get(r)).cloned();
        let resolved = match self.action {
            Action::Delete => None,
            Action::Set => self.literal.clone(),
            Action::Replace => from_reference().or_else(|| self.literal.clone()),
            Action::CarryOver => from_reference(),
        };

        match resolved {
            Some(value) => self.path.set(doc, value),
            None => {
                self.path.remove(doc);
                Ok(())
            }
        }
    }
}

fn parse_literal(value: &str) -> Option<Value> {
    if value.is_empty() {
        return None;
    }
    Some(serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string())))
}

/// Strip default fields from `doc`, apply `rules` in order, strip again
///
/// Rules of kind [`Action::CarryOver`] run after the second strip; they are
/// how follower-owned values get back in.
pub fn transform(
    mut doc: Value,
    reference: Option<&Value>,
    rules: &[Rule],
) -> Result<Value, TransformError> {
    strip_defaults(&mut doc);
    let (carry, user): (Vec<&Rule>, Vec<&Rule>) =
        rules.iter().partition(|r| r.action == Action::CarryOver);
    for rule in user {
        rule.apply(&mut doc, reference)?;
    }
    strip_defaults(&mut doc);
    for rule in carry {
        rule.apply(&mut doc, reference)?;
    }
    Ok(doc)
}

fn strip_defaults(doc: &mut Value) {
    for path in DEFAULT_STRIP.iter() {
        path.remove(doc);
    }
}

/// [`transform`] over serialized documents
///
/// An empty reference buffer means there is no reference document.
pub fn transform_bytes(
    source: &[u8],
    reference: &[u8],
    rules: &[Rule],
) -> Result<Vec<u8>, TransformError> {
    let doc: Value = serde_json::from_slice(source)?;
    let reference: Option<Value> = if reference.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(reference)?)
    };
    let out = transform(doc, reference.as_ref(), rules)?;
    Ok(serde_json::to_vec(&out)?)
}

/// Whether `path` is, or lies under, a default-strip field
pub fn is_stripped(path: &FieldPath) -> bool {
    DEFAULT_STRIP.iter().any(|strip| path.starts_with(strip))
}

/// Whether writing `path` replaces a default-strip field along with it
pub fn encloses_stripped(path: &FieldPath) -> bool {
    DEFAULT_STRIP.iter().any(|strip| strip.starts_with(path))
}

/// The compiled rule list of one mirror
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    rules: Vec<Rule>,
}

impl Filter {
    /// Compile configured actions
    ///
    /// Unknown actions and rules on default-strip fields are logged and
    /// skipped. A malformed key is an error.
    pub fn compile(mirror: &str, actions: &[FilterAction]) -> Result<Self, TransformError> {
        let mut rules = Vec::with_capacity(actions.len());
        for action in actions {
            let kind = match action.action.parse::<Action>() {
                Ok(kind) => kind,
                Err(unknown) => {
                    warn!(mirror = %mirror, action = %unknown, key = %action.key, "unexpected filter action, ignoring");
                    continue;
                }
            };
            let rule = Rule::new(kind, &action.key, &action.value)?;
            if is_stripped(rule.path()) {
                warn!(mirror = %mirror, key = %action.key, "filter targets a stripped field, ignoring");
                continue;
            }
            if encloses_stripped(rule.path()) {
                warn!(mirror = %mirror, key = %action.key, "filter covers stripped fields, they are removed after it runs");
            }
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    /// Compiled rules in application order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Transform a source document for a follower
    ///
    /// With a reference (the existing follower object) the default-strip
    /// fields are carried over from it after the user rules run, so the
    /// follower keeps its own resourceVersion, annotations and status.
    pub fn apply(&self, source: Value, reference: Option<&Value>) -> Result<Value, TransformError> {
        let mut doc = transform(source, reference, &self.rules)?;
        if let Some(reference) = reference {
            for path in DEFAULT_STRIP.iter() {
                Rule::carry_over(path.clone()).apply(&mut doc, Some(reference))?;
            }
        }
        Ok(doc)
    }
}
