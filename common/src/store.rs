use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Non-volatile key/value storage. Each call is assumed atomic per key.
pub trait KvStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError>;
    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Bool(bool),
    Str(String),
}

/// Map-backed store. Used by tests and as the in-memory image of the host
/// simulator's JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryStore {
    values: BTreeMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl KvStore for MemoryStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.values.get(key) {
            Some(StoredValue::Str(value)) => Ok(Some(value.clone())),
            Some(StoredValue::Bool(_)) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .insert(key.to_string(), StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        match self.values.get(key) {
            Some(StoredValue::Bool(value)) => Ok(Some(*value)),
            Some(StoredValue::Str(_)) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), StoredValue::Bool(value));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }
}
