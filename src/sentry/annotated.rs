//! Values carrying processing metadata from an API payload's `_meta` block.
//!
//! Metadata is attached once, when a payload is ingested. Consumers match on
//! [`Annotated`] instead of looking metadata up on every field access.

use serde::{Serialize, Serializer};
use serde_json::Value;

/// A value, possibly with metadata about how the server processed it.
#[derive(Debug, Clone, PartialEq)]
pub enum Annotated<T> {
  Plain(T),
  Annotated(T, Meta),
}

impl<T> Annotated<T> {
  /// Attach the metadata for `field` found in a `_meta` object, if any.
  pub fn from_parts(value: T, meta: Option<&Value>, field: &str) -> Self {
    match meta.and_then(|m| Meta::for_field(m, field)) {
      Some(meta) => Annotated::Annotated(value, meta),
      None => Annotated::Plain(value),
    }
  }

  pub fn value(&self) -> &T {
    match self {
      Annotated::Plain(v) | Annotated::Annotated(v, _) => v,
    }
  }

  pub fn into_value(self) -> T {
    match self {
      Annotated::Plain(v) | Annotated::Annotated(v, _) => v,
    }
  }

  pub fn meta(&self) -> Option<&Meta> {
    match self {
      Annotated::Plain(_) => None,
      Annotated::Annotated(_, meta) => Some(meta),
    }
  }

  pub fn is_annotated(&self) -> bool {
    matches!(self, Annotated::Annotated(..))
  }
}

/// Serializes as the bare value.
impl<T: Serialize> Serialize for Annotated<T> {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.value().serialize(serializer)
  }
}

/// A rule that modified part of a value (e.g. a scrubbing rule)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remark {
  pub rule_id: String,
  /// Remark type, e.g. `s` (substituted) or `x` (removed)
  pub kind: String,
  pub range: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
  /// Names of processing errors
  pub errors: Vec<String>,
  pub remarks: Vec<Remark>,
  /// Length of the value before it was trimmed
  pub original_length: Option<u64>,
}

impl Meta {
  /// Read the metadata node for `field`: `meta[field][""]`.
  ///
  /// Returns `None` when there is no node or the node carries nothing.
  pub fn for_field(meta: &Value, field: &str) -> Option<Self> {
    let node = meta.get(field)?.get("")?;

    let errors = node
      .get("err")
      .and_then(Value::as_array)
      .map(|errs| errs.iter().filter_map(error_name).collect())
      .unwrap_or_default();

    let remarks = node
      .get("rem")
      .and_then(Value::as_array)
      .map(|rems| rems.iter().filter_map(parse_remark).collect())
      .unwrap_or_default();

    let original_length = node.get("len").and_then(Value::as_u64);

    let parsed = Self {
      errors,
      remarks,
      original_length,
    };
    if parsed == Meta::default() {
      None
    } else {
      Some(parsed)
    }
  }
}

/// Errors are either a bare name or `[name, {details}]`.
fn error_name(err: &Value) -> Option<String> {
  match err {
    Value::String(name) => Some(name.clone()),
    Value::Array(parts) => parts.first()?.as_str().map(String::from),
    _ => None,
  }
}

/// Remarks are `[rule_id, kind]` or `[rule_id, kind, start, end]`.
fn parse_remark(rem: &Value) -> Option<Remark> {
  let parts = rem.as_array()?;
  let rule_id = parts.first()?.as_str()?.to_string();
  let kind = parts.get(1)?.as_str()?.to_string();
  let range = match (
    parts.get(2).and_then(Value::as_u64),
    parts.get(3).and_then(Value::as_u64),
  ) {
    (Some(start), Some(end)) => Some((start as usize, end as usize)),
    _ => None,
  };
  Some(Remark {
    rule_id,
    kind,
    range,
  })
}
