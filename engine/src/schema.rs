//! Record-type descriptors and the registry the engine iterates.
//!
//! The registry is closed: it is built once before the engine starts and
//! every component resolves model names against it.

use crate::{error::Result, Error, ModelName, Record, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field types a model may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since the epoch
    Timestamp,
    /// List of arbitrary JSON values
    List,
    /// Arbitrary nested JSON
    Json,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int | FieldType::Timestamp => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::List => value.is_array(),
            FieldType::Json => true,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::List => "List",
            FieldType::Json => "Json",
        };
        f.write_str(name)
    }
}

/// A single field of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    /// A field that must be present and non-null.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// A field that may be absent or null.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    fn check(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None | Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(v) if self.field_type.accepts(v) => Ok(()),
            Some(v) => Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(v).to_string(),
            }),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "List",
        Value::Object(_) => "Object",
    }
}

/// Descriptor of one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSchema {
    pub name: ModelName,
    /// Payload field holding the record identifier (the merge key)
    pub primary_key: String,
    pub fields: Vec<FieldDef>,
}

impl ModelSchema {
    /// Create a model keyed by its `id` field.
    pub fn new(name: impl Into<ModelName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            primary_key: "id".to_string(),
            fields,
        }
    }

    /// Use a different payload field as the identifier.
    pub fn with_primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = key.into();
        self
    }

    /// Validate a payload against the declared fields.
    pub fn validate_payload(&self, payload: &Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.check(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Read the record identifier out of a payload.
    pub fn identifier(&self, payload: &Value) -> Result<String> {
        match payload.get(&self.primary_key) {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(Error::MissingRequiredField(self.primary_key.clone())),
        }
    }
}

/// The closed set of record types known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRegistry {
    /// Schema version, checked against persisted snapshots
    pub version: SchemaVersion,
    /// Models in deterministic (name) order
    pub models: BTreeMap<ModelName, ModelSchema>,
}

impl ModelRegistry {
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            models: BTreeMap::new(),
        }
    }

    /// Register a model.
    pub fn register(&mut self, model: ModelSchema) -> &mut Self {
        self.models.insert(model.name.clone(), model);
        self
    }

    /// Builder-style registration.
    pub fn with_model(mut self, model: ModelSchema) -> Self {
        self.register(model);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModelSchema> {
        self.models.get(name)
    }

    /// Look up a model, failing with [`Error::ModelNotFound`].
    pub fn model(&self, name: &str) -> Result<&ModelSchema> {
        self.get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    pub fn model_names(&self) -> impl Iterator<Item = &ModelName> {
        self.models.keys()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Validate a record: known model, identifier matches the payload, fields conform.
    pub fn validate(&self, record: &Record) -> Result<()> {
        let schema = self.model(&record.model)?;
        schema.validate_payload(&record.payload)?;

        let id = schema.identifier(&record.payload)?;
        if id != record.id {
            return Err(Error::InvalidPayload(format!(
                "payload {} '{}' does not match record id '{}'",
                schema.primary_key, id, record.id
            )));
        }

        Ok(())
    }

    /// Build a record from a serialized payload, extracting its identifier.
    pub fn record_from_payload(&self, model: &str, payload: Value) -> Result<Record> {
        let schema = self.model(model)?;
        let id = schema.identifier(&payload)?;
        let record = Record::new(id, model, payload);
        schema.validate_payload(&record.payload)?;
        Ok(record)
    }
}
