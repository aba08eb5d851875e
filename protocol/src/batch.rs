//! Log entries and batches.
//!
//! A [`LogEntry`] is whatever the agent wants to record, as a flat JSON
//! object, plus the time it was logged. A [`Batch`] is what one chain link
//! carries: the entries plus the session they belong to.
//!
//! The wire names (`ts`, `metrics`) match the format already on chain, so
//! older links decode into these types unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AuditError, AuditResult};

/// One logged action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Caller-supplied fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    /// When the entry was logged.
    pub ts: DateTime<Utc>,
}

impl LogEntry {
    /// Stamps `fields` with the current time. A caller-supplied `ts` field
    /// is replaced.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self::with_timestamp(fields, Utc::now())
    }

    /// Builds an entry with an explicit timestamp.
    pub fn with_timestamp(mut fields: Map<String, Value>, ts: DateTime<Utc>) -> Self {
        fields.remove("ts");
        Self { fields, ts }
    }

    /// Builds an entry from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> AuditResult<Self> {
        match value {
            Value::Object(fields) => Ok(Self::new(fields)),
            other => Err(AuditError::Serialization(format!(
                "log entry must be a JSON object, got {other}"
            ))),
        }
    }

    /// Looks up a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// The payload of one chain link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Agent that produced the entries.
    pub agent_id: String,
    /// When the logging session started.
    pub session_start: DateTime<Utc>,
    /// When the batch was committed.
    pub timestamp: DateTime<Utc>,
    /// Entries in the order they were logged.
    #[serde(rename = "metrics")]
    pub entries: Vec<LogEntry>,
}

impl Batch {
    /// Assembles a batch committed now.
    pub fn new(agent_id: impl Into<String>, session_start: DateTime<Utc>, entries: Vec<LogEntry>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_start,
            timestamp: Utc::now(),
            entries,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the batch has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
