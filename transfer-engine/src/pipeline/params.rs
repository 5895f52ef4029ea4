//! The parameter bag threaded through every pipeline step.

use super::status::PipelineKind;
use crate::{Result, TransferError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Accumulating key/value bag. Well-known keys have typed accessors; unknown
/// keys round-trip untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineParams(Map<String, Value>);

impl PipelineParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Accepts a JSON object; anything else yields an empty bag.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "yes"),
            _ => false,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// A string parameter the step cannot run without.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TransferError::Format(format!("missing parameter '{}'", key)))
    }

    pub fn priority(&self) -> i64 {
        self.get_i64("priority").unwrap_or(0)
    }

    pub fn set_priority(&mut self, priority: i64) {
        self.set("priority", priority);
    }

    pub fn storage(&self) -> Option<&str> {
        self.get_str("storage")
    }

    pub fn archive(&self) -> Option<&str> {
        self.get_str("archive")
    }

    pub fn kind(&self) -> Result<PipelineKind> {
        match self.get_str("kind") {
            Some("export") => Ok(PipelineKind::Export),
            Some("import") => Ok(PipelineKind::Import),
            other => Err(TransferError::Format(format!(
                "unknown pipeline kind {:?}",
                other
            ))),
        }
    }

    pub fn completed(&self) -> bool {
        self.get_bool("completed")
    }

    pub fn requires_confirmation(&self) -> bool {
        self.get_bool("requires_confirmation")
    }

    pub fn confirmed(&self) -> bool {
        self.get_bool("confirmed")
    }

    pub fn lock_id(&self) -> Option<&str> {
        self.get_str("lock_id")
    }

    pub fn user_id(&self) -> Option<i64> {
        self.get_i64("user_id")
    }

    /// Include option for a part of the export; everything is on by default.
    pub fn include(&self, name: &str) -> bool {
        match self.0.get("include").and_then(|i| i.get(name)) {
            Some(Value::Bool(b)) => *b,
            _ => true,
        }
    }

    /// Title and message shown to pollers for the current step.
    pub fn set_status(&mut self, title: &str, message: &str) {
        let mut status = Map::new();
        status.insert("title".into(), Value::String(title.to_string()));
        status.insert("message".into(), Value::String(message.to_string()));
        self.0.insert("status".into(), Value::Object(status));
    }

    pub fn status_text(&self) -> Option<(String, String)> {
        let status = self.0.get("status")?;
        Some((
            status.get("title")?.as_str()?.to_string(),
            status.get("message")?.as_str()?.to_string(),
        ))
    }
}
