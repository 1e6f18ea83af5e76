use crate::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type RuntimeContext = BTreeMap<String, Value>;

const MAX_KEY_LENGTH: usize = 256;

/// Run-scoped key/value state. Each run and each parallel branch owns its
/// own `Context`; handlers only ever see a shared borrow and report changes
/// through `NodeOutcome::context_updates`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: RuntimeContext,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: RuntimeContext) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &RuntimeContext {
        &self.values
    }

    pub fn into_values(self) -> RuntimeContext {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Missing keys and nulls read as the empty string.
    pub fn get_string(&self, key: &str) -> String {
        match self.values.get(key) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(value)) => value.clone(),
            Some(other) => other.to_string(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<(), EngineError> {
        let key = key.into();
        validate_context_key(&key)?;
        self.values.insert(key, value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// All-or-nothing: nothing is written if any key is invalid.
    pub fn apply_updates(&mut self, updates: &RuntimeContext) -> Result<(), EngineError> {
        for key in updates.keys() {
            validate_context_key(key)?;
        }
        for (key, value) in updates {
            self.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

pub fn validate_context_key(key: &str) -> Result<(), EngineError> {
    if key.is_empty() {
        return Err(EngineError::Runtime(
            "context key cannot be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(EngineError::Runtime(format!(
            "context key '{}' exceeds max length {}",
            key, MAX_KEY_LENGTH
        )));
    }

    for segment in key.split('.') {
        validate_key_segment(segment, key)?;
    }

    Ok(())
}

fn validate_key_segment(segment: &str, full_key: &str) -> Result<(), EngineError> {
    let mut chars = segment.chars();
    let Some(first) = chars.next() else {
        return Err(EngineError::Runtime(format!(
            "context key '{}' contains an empty namespace segment",
            full_key
        )));
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(EngineError::Runtime(format!(
            "context key '{}' has invalid segment '{}'",
            full_key, segment
        )));
    }

    if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-')) {
        return Err(EngineError::Runtime(format!(
            "context key '{}' has invalid segment '{}'",
            full_key, segment
        )));
    }

    Ok(())
}
