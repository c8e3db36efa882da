//! Core data-model types: tuple elements, ids, directory paths, and
//! partition bindings.
//!
//! These are the vocabulary every other keyspace crate builds on. Key
//! ordering (namespace/directory → type → id) depends entirely on
//! `TupleValue`'s encoding, defined in [`crate::tuple`].

use std::collections::HashMap;
use uuid::Uuid;

/// A single typed element of a tuple key or a record's index key-expression.
///
/// Supported kinds match §4.A exactly: unit, bool, a 64-bit signed integer,
/// an IEEE-754 double, a UTF-8 string, a byte string, a UUID, an instant
/// (seconds since epoch), and a nested tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    Unit,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    /// Seconds since the Unix epoch.
    Instant(f64),
    Tuple(Vec<TupleValue>),
}

impl TupleValue {
    /// A human-readable type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            TupleValue::Unit => "unit",
            TupleValue::Bool(_) => "bool",
            TupleValue::Int(_) => "int",
            TupleValue::Double(_) => "double",
            TupleValue::String(_) => "string",
            TupleValue::Bytes(_) => "bytes",
            TupleValue::Uuid(_) => "uuid",
            TupleValue::Instant(_) => "instant",
            TupleValue::Tuple(_) => "tuple",
        }
    }
}

impl From<bool> for TupleValue {
    fn from(v: bool) -> Self {
        TupleValue::Bool(v)
    }
}

impl From<i64> for TupleValue {
    fn from(v: i64) -> Self {
        TupleValue::Int(v)
    }
}

impl From<f64> for TupleValue {
    fn from(v: f64) -> Self {
        TupleValue::Double(v)
    }
}

impl From<&str> for TupleValue {
    fn from(v: &str) -> Self {
        TupleValue::String(v.to_string())
    }
}

impl From<String> for TupleValue {
    fn from(v: String) -> Self {
        TupleValue::String(v)
    }
}

impl From<Vec<u8>> for TupleValue {
    fn from(v: Vec<u8>) -> Self {
        TupleValue::Bytes(v)
    }
}

impl From<Uuid> for TupleValue {
    fn from(v: Uuid) -> Self {
        TupleValue::Uuid(v)
    }
}

/// A record's primary key: an ordered tuple of primitive elements, unique
/// within a directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Id(pub Vec<TupleValue>);

impl Id {
    pub fn new(elements: impl Into<Vec<TupleValue>>) -> Self {
        Id(elements.into())
    }

    pub fn single(value: impl Into<TupleValue>) -> Self {
        Id(vec![value.into()])
    }

    pub fn elements(&self) -> &[TupleValue] {
        &self.0
    }
}

/// A small integer assigned to each concrete type conforming to a
/// polymorphic protocol (§4.K, §3 glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeCode(pub u16);

/// One segment of a declared directory path: a static literal, or a
/// dynamic reference to a field whose value is supplied per instance
/// (§3, §4.C).
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryPathSegment {
    Static(String),
    Field(String),
}

impl DirectoryPathSegment {
    pub fn static_(s: impl Into<String>) -> Self {
        DirectoryPathSegment::Static(s.into())
    }

    pub fn field(name: impl Into<String>) -> Self {
        DirectoryPathSegment::Field(name.into())
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, DirectoryPathSegment::Field(_))
    }
}

/// Supplies values for a record type's dynamic directory segments when no
/// concrete record instance is available (e.g. for queries). Required
/// whenever the type's `directory_path_components` contains a `Field`
/// segment; absence is reported as `DynamicFieldsRequired` (§4.C, §4.J).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionBinding {
    values: HashMap<String, TupleValue>,
}

impl PartitionBinding {
    pub fn new() -> Self {
        PartitionBinding {
            values: HashMap::new(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<TupleValue>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&TupleValue> {
        self.values.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
