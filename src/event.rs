//! Canonical change-event envelope.
//!
//! Every source emits the same Debezium-shaped [`Event`], regardless of the
//! upstream protocol. The `position` field is opaque to everything except
//! the source that produced it: the replicator stores and forwards it but
//! never parses it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Debezium operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Create / insert.
    #[serde(rename = "c")]
    Create,
    /// Update.
    #[serde(rename = "u")]
    Update,
    /// Delete.
    #[serde(rename = "d")]
    Delete,
    /// Read (snapshot).
    #[serde(rename = "r")]
    Read,
}

/// Heterogeneous row data keyed by column or field name.
///
/// Sources populate these maps from runtime schema; targets serialise them;
/// nothing in the core interprets the values.
pub type Row = Map<String, Value>;

/// Metadata about the origin of a change event (Debezium format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSource {
    pub version: String,
    pub connector: String,
    pub name: String,
    pub ts_ms: i64,
    pub snapshot: String,
    pub db: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
    pub schema: String,
    pub table: String,
    #[serde(rename = "txId", skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lsn: Option<i64>,
    pub xmin: Option<i64>,
}

impl EventSource {
    pub fn new(
        connector: impl Into<String>,
        db: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            connector: connector.into(),
            name: String::new(),
            ts_ms: chrono::Utc::now().timestamp_millis(),
            snapshot: "false".to_string(),
            db: db.into(),
            sequence: None,
            schema: schema.into(),
            table: table.into(),
            tx_id: None,
            lsn: None,
            xmin: None,
        }
    }

    pub fn with_lsn(mut self, lsn: i64) -> Self {
        self.lsn = Some(lsn);
        self
    }

    pub fn with_tx_id(mut self, tx_id: u32) -> Self {
        self.tx_id = Some(tx_id);
        self
    }
}

/// Transaction metadata (optional in Debezium).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub total_order: i64,
    pub data_collection_order: i64,
}

/// Change data in Debezium format.
///
/// `before` is `None` for creates, `after` is `None` for deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub before: Option<Row>,
    pub after: Option<Row>,
    pub source: EventSource,
    pub op: Operation,
    pub ts_ms: i64,
    pub transaction: Option<Transaction>,
}

/// One row-level change captured from a source stream.
///
/// Within a single source stream, positions are monotonically
/// non-decreasing in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Optional payload schema descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,

    pub payload: Payload,

    /// Opaque location of this event in the source stream: an LSN string
    /// for PostgreSQL, a base64 resume token for MongoDB. Used for
    /// checkpointing, never serialised into the envelope.
    #[serde(skip)]
    pub position: Vec<u8>,
}

impl Event {
    pub fn position_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.position)
    }
}
