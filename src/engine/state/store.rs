// SPDX-License-Identifier: MIT

//! Field values of a running graph plus the reducer of each field

use serde_json::map::Entry;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::schema::{ReducerType, SchemaError, StateSchema};
use super::update::StateUpdate;

/// The state a node sees and a checkpoint stores.
///
/// Fields missing from the schema fall back to `ReducerType::Overwrite`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowState {
    fields: Map<String, Value>,
    reducers: HashMap<String, ReducerType>,
}

impl WorkflowState {
    /// State seeded with every declared default
    pub fn new(schema: &StateSchema) -> Self {
        let fields = schema
            .fields
            .iter()
            .filter_map(|(name, def)| Some((name.clone(), def.default.clone()?)))
            .collect();
        Self {
            fields,
            reducers: reducers_of(schema),
        }
    }

    /// State holding exactly `values`, which must match the schema
    pub fn from_values(schema: &StateSchema, values: Map<String, Value>) -> Result<Self, SchemaError> {
        schema.validate_state(&values)?;
        Ok(Self {
            fields: values,
            reducers: reducers_of(schema),
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Fold `value` into field `key` with that field's reducer
    pub fn update(&mut self, key: &str, value: Value) {
        let reducer = self.reducers.get(key).unwrap_or(&ReducerType::Overwrite);
        reduce(reducer, self.fields.entry(key), value);
    }

    /// Merge a partial update, field by field
    pub fn apply(&mut self, update: &StateUpdate) {
        for (key, value) in update.iter() {
            self.update(key, value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up a dotted path such as `grade.scores.0`; numeric segments index arrays
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let root = self.fields.get(segments.next()?)?;
        segments.try_fold(root, |value, segment| match value {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
            other => other.get(segment),
        })
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_values(self) -> Map<String, Value> {
        self.fields
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }
}

fn reducers_of(schema: &StateSchema) -> HashMap<String, ReducerType> {
    schema
        .fields
        .iter()
        .map(|(name, def)| (name.clone(), def.reducer.clone()))
        .collect()
}

fn reduce(reducer: &ReducerType, slot: Entry<'_>, value: Value) {
    let current = match slot {
        Entry::Vacant(vacant) => {
            let initial = match (reducer, value) {
                (ReducerType::Append, Value::Array(items)) => Value::Array(items),
                (ReducerType::Append, item) => Value::Array(vec![item]),
                (ReducerType::Max | ReducerType::Min, number) if !number.is_number() => return,
                (_, value) => value,
            };
            vacant.insert(initial);
            return;
        }
        Entry::Occupied(occupied) => occupied.into_mut(),
    };

    match reducer {
        ReducerType::Overwrite => *current = value,
        ReducerType::Append => {
            let mut items = match current.take() {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                scalar => vec![scalar],
            };
            match value {
                Value::Array(more) => items.extend(more),
                item => items.push(item),
            }
            *current = Value::Array(items);
        }
        ReducerType::Max | ReducerType::Min => {
            let Some(incoming) = value.as_f64() else {
                return;
            };
            let wanted = if *reducer == ReducerType::Max {
                Ordering::Greater
            } else {
                Ordering::Less
            };
            let replaces = current
                .as_f64()
                .map_or(true, |held| incoming.partial_cmp(&held) == Some(wanted));
            if replaces {
                *current = value;
            }
        }
        ReducerType::Merge => match (current, value) {
            (Value::Object(held), Value::Object(incoming)) => held.extend(incoming),
            (current, value) => *current = value,
        },
    }
}
