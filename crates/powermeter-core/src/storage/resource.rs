use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::{CachedValue, Storage, StorageError};
use crate::error::{Error, Result};

/// Read/write interface shared by single and redundant JSON resources.
///
/// `try_deserialize` reports why nothing could be read; the `deserialize*`
/// family never fails and substitutes a default instead, which is what most
/// callers want for "no data yet".
pub trait JsonStore {
    /// Logical path of the resource.
    fn path(&self) -> &str;

    fn try_deserialize(&self) -> Result<Value>;

    fn serialize(&mut self, value: &Value) -> Result<()>;

    fn erase(&mut self) -> Result<()>;

    /// The stored value, or `null` when nothing readable is stored.
    fn deserialize(&self) -> Value {
        self.deserialize_or(Value::Null)
    }

    fn deserialize_or(&self, default: Value) -> Value {
        self.deserialize_or_else(|| default)
    }

    fn deserialize_or_else<F: FnOnce() -> Value>(&self, default: F) -> Value {
        match self.try_deserialize() {
            Ok(value) => value,
            Err(e) => {
                debug!("No stored value for {}, using default: {}", self.path(), e);
                default()
            }
        }
    }

    /// Deserialize into a typed value.
    fn load<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.try_deserialize()?;
        serde_json::from_value(value).map_err(|e| Error::Parse {
            path: self.path().into(),
            reason: e.to_string(),
        })
    }

    /// Serialize a typed value.
    fn store<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| Error::InvalidData(e.to_string()))?;
        self.serialize(&value)
    }
}

/// One JSON document on a [`Storage`], or a single member of one when built
/// with a JSON pointer (RFC 6901).
///
/// Writes replace the whole file and are not atomic on the medium; pair two of
/// these in a [`BackedUpJsonResource`](super::BackedUpJsonResource) for data
/// that must survive power loss.
pub struct JsonResource {
    storage: Arc<dyn Storage>,
    path: String,
    pointer: Option<String>,
    cache: CachedValue<Value>,
}

impl JsonResource {
    pub fn new(storage: Arc<dyn Storage>, path: impl Into<String>) -> Self {
        Self {
            storage,
            path: path.into(),
            pointer: None,
            cache: CachedValue::new(true),
        }
    }

    /// Address the member at `pointer` (e.g. `/trackers/3600_60`) inside the
    /// document at `path`.
    pub fn with_pointer(
        storage: Arc<dyn Storage>,
        path: impl Into<String>,
        pointer: impl Into<String>,
    ) -> Self {
        Self {
            pointer: Some(pointer.into()),
            ..Self::new(storage, path)
        }
    }

    /// Always go to storage, never keep a copy in memory.
    pub fn uncached(mut self) -> Self {
        self.cache.set_enabled(false);
        self
    }

    pub fn pointer(&self) -> Option<&str> {
        self.pointer.as_deref()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_populated()
    }

    /// Drop the in-memory copy so the next read goes to storage.
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    fn read_document(&self) -> Result<Value> {
        let bytes = self.storage.read(&self.path)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn tokens(&self, pointer: &str) -> Result<Vec<String>> {
        pointer_tokens(pointer).ok_or_else(|| {
            Error::InvalidData(alloc::format!("malformed JSON pointer {pointer:?}"))
        })
    }

    fn load_value(&self) -> Result<Value> {
        let document = self.read_document()?;
        match &self.pointer {
            None => Ok(document),
            Some(pointer) => {
                document
                    .pointer(pointer)
                    .cloned()
                    .ok_or_else(|| Error::PointerNotFound {
                        path: self.path.clone(),
                        pointer: pointer.clone(),
                    })
            }
        }
    }

    fn write_value(&self, value: &Value) -> Result<()> {
        let bytes = match &self.pointer {
            None => to_bytes(&self.path, value)?,
            Some(pointer) => {
                let tokens = self.tokens(pointer)?;
                let mut document = match self.read_document() {
                    Ok(document) => document,
                    Err(e) if e.is_not_found() => Value::Object(Map::new()),
                    Err(e) => {
                        warn!("Replacing unreadable document {}: {}", self.path, e);
                        Value::Object(Map::new())
                    }
                };
                set_pointer(&mut document, &tokens, value.clone());
                to_bytes(&self.path, &document)?
            }
        };
        self.storage.write(&self.path, &bytes)?;
        Ok(())
    }
}

impl JsonStore for JsonResource {
    fn path(&self) -> &str {
        &self.path
    }

    fn try_deserialize(&self) -> Result<Value> {
        self.cache.get_or_try_load(|| self.load_value())
    }

    fn serialize(&mut self, value: &Value) -> Result<()> {
        self.cache.set(value.clone(), |value| self.write_value(value))
    }

    /// Remove the file, or only the pointed-to member. Erasing something that
    /// does not exist succeeds.
    fn erase(&mut self) -> Result<()> {
        self.cache.invalidate();

        let Some(pointer) = &self.pointer else {
            return match self.storage.remove(&self.path) {
                Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
                Err(e) => Err(e.into()),
            };
        };

        let tokens = self.tokens(pointer)?;
        let mut document = match self.read_document() {
            Ok(document) => document,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if remove_pointer(&mut document, &tokens) {
            let bytes = to_bytes(&self.path, &document)?;
            self.storage.write(&self.path, &bytes)?;
        }
        Ok(())
    }
}

fn to_bytes(path: &str, value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| Error::Parse {
        path: path.into(),
        reason: e.to_string(),
    })
}

/// Split an RFC 6901 pointer into unescaped reference tokens.
fn pointer_tokens(pointer: &str) -> Option<Vec<String>> {
    if pointer.is_empty() {
        return Some(Vec::new());
    }
    let rest = pointer.strip_prefix('/')?;
    Some(
        rest.split('/')
            .map(|token| token.replace("~1", "/").replace("~0", "~"))
            .collect(),
    )
}

fn array_index(value: &Value, token: &str) -> Option<usize> {
    match value {
        Value::Array(items) => token.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was replaced by an object"),
    }
}

/// Store `value` at the location named by `tokens`, creating intermediate
/// objects along the way. Non-container values on the path are replaced.
fn set_pointer(document: &mut Value, tokens: &[String], value: Value) {
    let Some((last, parents)) = tokens.split_last() else {
        *document = value;
        return;
    };

    let mut current = document;
    for token in parents {
        let index = array_index(current, token);
        current = match (current, index) {
            (Value::Array(items), Some(i)) => &mut items[i],
            (other, _) => ensure_object(other)
                .entry(token.as_str())
                .or_insert_with(|| Value::Object(Map::new())),
        };
    }

    let index = array_index(current, last);
    match (current, index) {
        (Value::Array(items), Some(i)) => items[i] = value,
        (other, _) => {
            ensure_object(other).insert(last.clone(), value);
        }
    }
}

/// Remove the member named by `tokens`. Returns whether anything was removed.
fn remove_pointer(document: &mut Value, tokens: &[String]) -> bool {
    let Some((last, parents)) = tokens.split_last() else {
        return false;
    };

    let mut current = document;
    for token in parents {
        let index = array_index(current, token);
        current = match (current, index) {
            (Value::Array(items), Some(i)) => &mut items[i],
            (Value::Object(map), _) => match map.get_mut(token.as_str()) {
                Some(child) => child,
                None => return false,
            },
            _ => return false,
        };
    }

    let index = array_index(current, last);
    match (current, index) {
        (Value::Array(items), Some(i)) => {
            items.remove(i);
            true
        }
        (Value::Object(map), _) => map.remove(last.as_str()).is_some(),
        _ => false,
    }
}
