//! Records and datasets produced by the loaders.

use serde_json::{Map, Value};

use crate::error::DataError;

/// An immutable row of named fields, identified by its position in the input.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    index: usize,
    fields: Map<String, Value>,
}

impl Record {
    /// Creates a record at the given input position.
    pub fn new(index: usize, fields: Map<String, Value>) -> Self {
        Self { index, fields }
    }

    /// Zero-based position in the original input ordering.
    pub fn index(&self) -> usize {
        self.index
    }

    /// All fields of the record.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Looks up a single field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// The record as a JSON object, for re-serialization.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// A loaded row: either a record or the reason it could not be parsed.
///
/// Malformed rows keep their slot so later records keep their index.
pub type RecordSlot = Result<Record, DataError>;

/// An ordered collection of record slots processed as one unit.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Name used for the output subdirectory and manifest file names.
    pub name: String,
    /// Rows in input order.
    pub slots: Vec<RecordSlot>,
}

impl Dataset {
    /// Creates a dataset from loaded slots.
    pub fn new(name: impl Into<String>, slots: Vec<RecordSlot>) -> Self {
        Self {
            name: name.into(),
            slots,
        }
    }

    /// Total number of rows, malformed ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the dataset has no rows.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of rows that failed to parse.
    pub fn malformed_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_err()).count()
    }
}

/// Converts a parsed JSON value into a record slot.
pub(crate) fn slot_from_value(index: usize, value: Value) -> RecordSlot {
    match value {
        Value::Object(fields) => Ok(Record::new(index, fields)),
        other => Err(DataError::MalformedRow {
            index,
            message: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
