//! Tracking records and sinks
//!
//! The executor emits records only when tracking is enabled in the
//! [`RuntimeConfig`](super::RuntimeConfig) and a sink is installed. Sinks are
//! called with the executor unlocked.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bookmark::Bookmark;
use super::instance::{ActivityInstanceState, InstanceId};

/// Identifies the activity a record is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Display name
    pub name: String,
    /// Dotted address in the definition
    pub qualified_id: String,
    /// Instance id
    pub instance_id: InstanceId,
}

/// One tracking event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrackingRecord {
    /// The workflow changed state
    WorkflowInstance {
        /// Workflow instance id
        instance_id: Uuid,
        /// New state
        state: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// An activity instance changed state
    ActivityState {
        /// Workflow instance id
        instance_id: Uuid,
        /// Activity
        activity: ActivityInfo,
        /// New state
        state: ActivityInstanceState,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// A bookmark was resumed
    BookmarkResumption {
        /// Workflow instance id
        instance_id: Uuid,
        /// Resumed bookmark
        bookmark: Bookmark,
        /// Owning activity
        owner: ActivityInfo,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// Emitted by activity code
    Custom {
        /// Workflow instance id
        instance_id: Uuid,
        /// Emitting activity
        activity: ActivityInfo,
        /// Record name
        name: String,
        /// Payload
        data: serde_json::Map<String, serde_json::Value>,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
}

/// Payload of a record emitted through `ActivityContext::track`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomTrackingRecord {
    /// Record name
    pub name: String,
    /// Payload
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl CustomTrackingRecord {
    /// Create an empty record
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: serde_json::Map::new(),
        }
    }

    /// Add a payload field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Receives tracking records
pub trait TrackingSink: Send + Sync {
    /// Consume one record
    fn track(&self, record: &TrackingRecord);
}

/// Sink that keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryTrackingSink {
    records: Mutex<Vec<TrackingRecord>>,
}

impl MemoryTrackingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far
    pub fn records(&self) -> Vec<TrackingRecord> {
        self.records.lock().clone()
    }

    /// Drain the records
    pub fn take(&self) -> Vec<TrackingRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no records were received
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TrackingSink for MemoryTrackingSink {
    fn track(&self, record: &TrackingRecord) {
        self.records.lock().push(record.clone());
    }
}
