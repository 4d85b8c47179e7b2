//! Avro schema entries and the compatibility rule applied on registration.
//!
//! A candidate value schema is accepted iff it is fully compatible (both
//! directions) with every schema already registered for the store. Records
//! are checked field by field: every reader field must exist on the writer
//! side or carry a default. Primitive pairs must match exactly, modulo the
//! int->long and float->double promotions.

use apache_avro::schema::Schema as AvroSchema;
use serde::{Deserialize, Serialize};

use crate::error::{MetadataError, Result};

/// Fixed id under which every store's key schema is registered.
pub const KEY_SCHEMA_ID: i32 = 1;

/// First id handed out to a store's value schemas.
pub const VALUE_SCHEMA_STARTING_ID: i32 = 1;

/// One registered schema with its monotonic id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub id: i32,
    pub schema: String,
}

impl SchemaEntry {
    pub fn new(id: i32, schema: impl Into<String>) -> Self {
        Self {
            id,
            schema: schema.into(),
        }
    }
}

pub fn parse(schema: &str) -> Result<AvroSchema> {
    AvroSchema::parse_str(schema).map_err(|e| MetadataError::InvalidSchema(e.to_string()))
}

/// Structural equality of two schema strings (whitespace and field ordering
/// in the JSON document do not matter).
pub fn schemas_equal(a: &str, b: &str) -> Result<bool> {
    Ok(parse(a)? == parse(b)?)
}

/// Full (two-way) compatibility between an existing schema and a candidate.
pub fn fully_compatible(existing: &str, candidate: &str) -> Result<bool> {
    let existing = parse(existing)?;
    let candidate = parse(candidate)?;
    Ok(reader_can_read(&candidate, &existing) && reader_can_read(&existing, &candidate))
}

fn reader_can_read(reader: &AvroSchema, writer: &AvroSchema) -> bool {
    match (reader, writer) {
        (r, w) if r == w => true,
        (AvroSchema::Record(r), AvroSchema::Record(w)) => {
            if r.name != w.name {
                return false;
            }
            for reader_field in &r.fields {
                match w.fields.iter().find(|f| f.name == reader_field.name) {
                    Some(writer_field) => {
                        if !reader_can_read(&reader_field.schema, &writer_field.schema) {
                            return false;
                        }
                    }
                    // Field only on the reader side needs a default.
                    None => {
                        if reader_field.default.is_none() {
                            return false;
                        }
                    }
                }
            }
            true
        }
        _ => primitives_compatible(reader, writer),
    }
}

fn primitives_compatible(reader: &AvroSchema, writer: &AvroSchema) -> bool {
    matches!(
        (reader, writer),
        (AvroSchema::Long, AvroSchema::Int) | (AvroSchema::Double, AvroSchema::Float)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_V1: &str =
        r#"{"type":"record","name":"User","fields":[{"name":"name","type":"string"}]}"#;
    const USER_V2: &str = r#"{"type":"record","name":"User","fields":[
        {"name":"name","type":"string"},
        {"name":"age","type":"int","default":0}]}"#;
    const USER_V2_NO_DEFAULT: &str = r#"{"type":"record","name":"User","fields":[
        {"name":"name","type":"string"},
        {"name":"age","type":"int"}]}"#;

    #[test]
    fn identical_schemas_are_equal_and_compatible() {
        assert!(schemas_equal("\"string\"", "\"string\"").unwrap());
        assert!(fully_compatible(USER_V1, USER_V1).unwrap());
    }

    #[test]
    fn primitive_mismatch_is_incompatible() {
        assert!(!fully_compatible("\"string\"", "\"int\"").unwrap());
    }

    #[test]
    fn added_field_with_default_is_compatible() {
        assert!(fully_compatible(USER_V1, USER_V2).unwrap());
    }

    #[test]
    fn added_field_without_default_is_incompatible() {
        assert!(!fully_compatible(USER_V1, USER_V2_NO_DEFAULT).unwrap());
    }

    #[test]
    fn record_vs_primitive_is_incompatible() {
        assert!(!fully_compatible("\"string\"", USER_V1).unwrap());
    }

    #[test]
    fn invalid_schema_is_rejected() {
        assert!(matches!(
            parse("not avro"),
            Err(MetadataError::InvalidSchema(_))
        ));
    }
}
