// SPDX-License-Identifier: MIT

//! Declared shape of a graph's state
//!
//! A schema names every field, its JSON type, and the reducer that folds
//! node updates into it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Field name to definition; YAML maps flatten straight into it
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct StateSchema {
    #[serde(flatten)]
    pub fields: BTreeMap<String, StateFieldDef>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StateFieldDef {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub reducer: ReducerType,
    /// Seeds `WorkflowState::new` and `with_defaults`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Whether `null` is an acceptable value
    #[serde(default)]
    pub nullable: bool,
}

impl StateFieldDef {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            reducer: ReducerType::Overwrite,
            default: None,
            nullable: false,
        }
    }

    pub fn reducer(mut self, reducer: ReducerType) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Check a complete value for this field
    fn check(&self, name: &str, value: &Value) -> Result<(), SchemaError> {
        if value.is_null() && self.nullable {
            return Ok(());
        }
        if self.field_type.accepts(value) {
            Ok(())
        } else {
            Err(SchemaError::TypeMismatch {
                field: name.to_string(),
                expected: self.field_type.clone(),
                found: type_name(value).to_string(),
            })
        }
    }
}

/// JSON type a field holds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    /// Whether a JSON value is of this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => true,
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Number | FieldType::Integer | FieldType::Any)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        };
        f.write_str(name)
    }
}

/// How an update to a field combines with the value already held
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReducerType {
    /// Take the incoming value
    #[default]
    Overwrite,
    /// Extend the list; a non-list update is pushed as one item
    Append,
    /// Keep the larger number
    Max,
    /// Keep the smaller number
    Min,
    /// Shallow merge objects
    Merge,
}

impl fmt::Display for ReducerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReducerType::Overwrite => "overwrite",
            ReducerType::Append => "append",
            ReducerType::Max => "max",
            ReducerType::Min => "min",
            ReducerType::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// Violations of a declared state schema
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{field}' expects {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: String,
    },

    #[error("expected a JSON object, found {0}")]
    NotAnObject(String),

    #[error("reducer '{reducer}' cannot be used on {field_type} field '{field}'")]
    InvalidReducer {
        field: String,
        reducer: ReducerType,
        field_type: FieldType,
    },
}

/// JSON type name used in error messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, builder style
    pub fn field(mut self, name: impl Into<String>, def: StateFieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Check that reducers fit their field types and defaults fit their fields
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (name, def) in &self.fields {
            let fits = match def.reducer {
                ReducerType::Overwrite => true,
                ReducerType::Append => {
                    matches!(def.field_type, FieldType::Array | FieldType::Any)
                }
                ReducerType::Max | ReducerType::Min => def.field_type.is_numeric(),
                ReducerType::Merge => {
                    matches!(def.field_type, FieldType::Object | FieldType::Any)
                }
            };
            if !fits {
                return Err(SchemaError::InvalidReducer {
                    field: name.clone(),
                    reducer: def.reducer.clone(),
                    field_type: def.field_type.clone(),
                });
            }
            if let Some(default) = &def.default {
                def.check(name, default)?;
            }
        }
        Ok(())
    }

    /// A full state must carry exactly the declared keys, each well typed
    pub fn validate_state(&self, values: &Map<String, Value>) -> Result<(), SchemaError> {
        for key in values.keys() {
            if !self.fields.contains_key(key) {
                return Err(SchemaError::UnknownField(key.clone()));
            }
        }
        for (name, def) in &self.fields {
            match values.get(name) {
                Some(value) => def.check(name, value)?,
                None => return Err(SchemaError::MissingField(name.clone())),
            }
        }
        Ok(())
    }

    /// A partial update may carry any subset of the declared keys.
    ///
    /// Append fields accept either a list of items or a single item. Max and
    /// Min fields only take numbers, whatever their declared type.
    pub fn validate_update(&self, values: &Map<String, Value>) -> Result<(), SchemaError> {
        for (key, value) in values {
            let def = self
                .fields
                .get(key)
                .ok_or_else(|| SchemaError::UnknownField(key.clone()))?;
            match def.reducer {
                ReducerType::Append => continue,
                ReducerType::Max | ReducerType::Min if !value.is_number() => {
                    return Err(SchemaError::TypeMismatch {
                        field: key.clone(),
                        expected: FieldType::Number,
                        found: type_name(value).to_string(),
                    });
                }
                _ => def.check(key, value)?,
            }
        }
        Ok(())
    }

    /// Fill absent fields from their declared defaults
    pub fn with_defaults(&self, values: &Map<String, Value>) -> Map<String, Value> {
        let mut filled = values.clone();
        for (name, def) in &self.fields {
            if filled.contains_key(name) {
                continue;
            }
            if let Some(default) = &def.default {
                filled.insert(name.clone(), default.clone());
            }
        }
        filled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn qa_schema() -> StateSchema {
        StateSchema::new()
            .field("question", StateFieldDef::new(FieldType::String))
            .field("answer", StateFieldDef::new(FieldType::String))
    }

    #[test]
    fn test_parse_yaml_fields() {
        let schema: StateSchema = serde_yaml::from_str(
            r#"
question: { type: string }
documents: { type: array, reducer: append, default: [] }
best_grade: { type: number, reducer: max }
retries: { type: integer, reducer: min, default: 0 }
labels: { type: object, reducer: merge, nullable: true }
"#,
        )
        .unwrap();

        let question = &schema.fields["question"];
        assert_eq!(
            (&question.field_type, &question.reducer),
            (&FieldType::String, &ReducerType::Overwrite)
        );
        assert_eq!(schema.fields["documents"].default, Some(json!([])));
        assert_eq!(schema.fields["best_grade"].reducer, ReducerType::Max);
        assert_eq!(schema.fields["retries"].field_type, FieldType::Integer);
        assert!(schema.fields["labels"].nullable);
        assert!(schema.validate().is_ok());

        let unknown: Result<StateSchema, _> = serde_yaml::from_str("x: { type: date }");
        assert!(unknown.is_err());
    }

    #[test]
    fn test_reducer_must_fit_type() {
        let schema = StateSchema::new().field(
            "tags",
            StateFieldDef::new(FieldType::String).reducer(ReducerType::Append),
        );
        assert_eq!(
            schema.validate(),
            Err(SchemaError::InvalidReducer {
                field: "tags".to_string(),
                reducer: ReducerType::Append,
                field_type: FieldType::String,
            })
        );

        let schema = StateSchema::new().field(
            "score",
            StateFieldDef::new(FieldType::Boolean).reducer(ReducerType::Max),
        );
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_default_must_fit_type() {
        let schema = StateSchema::new().field(
            "count",
            StateFieldDef::new(FieldType::Integer).default_value(json!("zero")),
        );
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_state_exact_keys() {
        let schema = qa_schema();

        assert!(schema
            .validate_state(&object(json!({"question": "Q", "answer": ""})))
            .is_ok());
        assert_eq!(
            schema.validate_state(&object(json!({"question": "Q"}))),
            Err(SchemaError::MissingField("answer".to_string()))
        );
        assert_eq!(
            schema.validate_state(&object(json!({"question": "Q", "answer": "", "x": 1}))),
            Err(SchemaError::UnknownField("x".to_string()))
        );
    }

    #[test]
    fn test_validate_state_types() {
        let schema = qa_schema();
        let err = schema
            .validate_state(&object(json!({"question": 1, "answer": ""})))
            .unwrap_err();
        assert_eq!(err.to_string(), "field 'question' expects string, found number");
    }

    #[test]
    fn test_nullable_field() {
        let schema = StateSchema::new()
            .field("document", StateFieldDef::new(FieldType::Object).nullable());
        assert!(schema
            .validate_state(&object(json!({"document": null})))
            .is_ok());

        let strict = StateSchema::new().field("document", StateFieldDef::new(FieldType::Object));
        assert!(strict
            .validate_state(&object(json!({"document": null})))
            .is_err());
    }

    #[test]
    fn test_validate_update_subset() {
        let schema = StateSchema::new()
            .field("which", StateFieldDef::new(FieldType::String))
            .field(
                "aggregate",
                StateFieldDef::new(FieldType::Array).reducer(ReducerType::Append),
            );

        assert!(schema.validate_update(&Map::new()).is_ok());
        assert!(schema.validate_update(&object(json!({"aggregate": "A"}))).is_ok());
        assert!(schema
            .validate_update(&object(json!({"aggregate": ["B", "C"]})))
            .is_ok());
        assert_eq!(
            schema.validate_update(&object(json!({"other": 1}))),
            Err(SchemaError::UnknownField("other".to_string()))
        );
        assert!(schema.validate_update(&object(json!({"which": 3}))).is_err());
    }

    #[test]
    fn test_extreme_reducers_take_numbers_only() {
        let schema = StateSchema::new()
            .field(
                "best_grade",
                StateFieldDef::new(FieldType::Any).reducer(ReducerType::Max),
            )
            .field(
                "latency_ms",
                StateFieldDef::new(FieldType::Number)
                    .reducer(ReducerType::Min)
                    .nullable(),
            );

        assert!(schema.validate_update(&object(json!({"best_grade": 0.9}))).is_ok());
        assert_eq!(
            schema.validate_update(&object(json!({"best_grade": "excellent"}))),
            Err(SchemaError::TypeMismatch {
                field: "best_grade".to_string(),
                expected: FieldType::Number,
                found: "string".to_string(),
            })
        );
        assert!(schema
            .validate_update(&object(json!({"latency_ms": null})))
            .is_err());
    }

    #[test]
    fn test_integer_rejects_float() {
        assert!(FieldType::Integer.accepts(&json!(3)));
        assert!(!FieldType::Integer.accepts(&json!(3.5)));
        assert!(FieldType::Number.accepts(&json!(3.5)));
        assert!(FieldType::Any.accepts(&json!(null)));
    }

    #[test]
    fn test_with_defaults() {
        let schema = StateSchema::new()
            .field("input", StateFieldDef::new(FieldType::String))
            .field(
                "user_feedback",
                StateFieldDef::new(FieldType::String).default_value(json!("")),
            );

        let filled = schema.with_defaults(&object(json!({"input": "hello"})));
        assert_eq!(Value::Object(filled), json!({"input": "hello", "user_feedback": ""}));

        let kept = schema.with_defaults(&object(json!({"input": "a", "user_feedback": "b"})));
        assert_eq!(kept["user_feedback"], json!("b"));
    }
}
