//! MongoDB change-stream source.
//!
//! Positions are base64-encoded resume tokens. Nothing is acknowledged
//! back to MongoDB: the token persisted in the checkpoint store is
//! replayed as `resume_after` on the next connect, so `checkpoint` is a
//! no-op beyond logging.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use mongodb::bson::{self, doc, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentBeforeChangeType, FullDocumentType};
use mongodb::Client;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use crate::checkpoint::Checkpoint;
use crate::config::MongoSourceConfig;
use crate::event::{Event, EventSource, Operation, Payload, Row};
use crate::replicator::Source;
use crate::stats::{Shared, SourceStats};
use crate::{Error, Result};

/// Server-side wait bound per change-stream poll.
const MAX_AWAIT_TIME: Duration = Duration::from_secs(5);

pub struct MongoSource {
    config: MongoSourceConfig,
    client: Option<Client>,
    change_stream: Option<ChangeStream<ChangeStreamEvent<Document>>>,
    stats: Shared<SourceStats>,
}

impl MongoSource {
    pub fn new(uri: &Url) -> Result<Self> {
        let config = MongoSourceConfig::from_uri(uri)?;

        let stats = Shared::new(SourceStats::default());
        stats.update(|s| {
            s.source_specific
                .insert("database".to_string(), json!(config.database));
            s.source_specific
                .insert("collection".to_string(), json!(config.collection));
        });

        Ok(Self {
            config,
            client: None,
            change_stream: None,
            stats,
        })
    }

    fn record_error(&self, message: String) {
        self.stats.update(|s| {
            s.event_error_count += 1;
            s.last_error = Some(message);
        });
    }
}

fn resume_token_from_position(position: &[u8]) -> Result<ResumeToken> {
    let bytes = BASE64.decode(position).map_err(|e| {
        Error::Checkpoint(format!("checkpoint position is not base64: {e}"))
    })?;
    bson::from_slice(&bytes).map_err(|e| {
        Error::Checkpoint(format!(
            "checkpoint position is not a resume token: {e}; \
             it may be corrupted or from an incompatible server version"
        ))
    })
}

fn document_to_row(document: Document) -> Row {
    let mut row = Row::new();
    for (key, value) in document {
        row.insert(key, serde_json::Value::from(value));
    }
    row
}

#[async_trait]
impl Source for MongoSource {
    async fn connect(&mut self, checkpoint: Option<&Checkpoint>) -> Result<()> {
        self.stats.update(|s| s.connection_retries += 1);

        let client = Client::with_uri_str(&self.config.conn_uri).await?;
        let database = client.database(&self.config.database);
        database.run_command(doc! { "ping": 1 }).await.map_err(|e| {
            self.stats.update(|s| {
                s.connection_healthy = false;
                s.last_error = Some(e.to_string());
            });
            Error::Mongo(e)
        })?;

        let mut options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .full_document_before_change(Some(FullDocumentBeforeChangeType::WhenAvailable))
            .max_await_time(Some(MAX_AWAIT_TIME))
            .build();

        if let Some(checkpoint) = checkpoint {
            if !checkpoint.position.is_empty() {
                options.resume_after = Some(resume_token_from_position(&checkpoint.position)?);
                info!(
                    database = %self.config.database,
                    collection = %self.config.collection,
                    "resuming change stream from checkpoint"
                );
            }
        }

        let change_stream = database
            .collection::<Document>(&self.config.collection)
            .watch()
            .with_options(options)
            .await?;

        self.client = Some(client);
        self.change_stream = Some(change_stream);
        self.stats.update(|s| {
            s.connection_healthy = true;
            s.last_connect_at = Some(Utc::now());
            s.last_error = None;
        });

        info!(
            database = %self.config.database,
            collection = %self.config.collection,
            "mongodb change stream started"
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.change_stream = None;
        self.client = None;
        self.stats.update(|s| s.connection_healthy = false);
        Ok(())
    }

    async fn next(&mut self) -> Result<Event> {
        let stream = self
            .change_stream
            .as_mut()
            .ok_or_else(|| Error::Connection("mongodb source not connected".to_string()))?;

        let change = match stream.next_if_any().await {
            Ok(Some(change)) => change,
            Ok(None) => return Err(Error::NoEventsFound),
            Err(e) => {
                self.record_error(e.to_string());
                return Err(Error::Mongo(e));
            }
        };

        let token = stream.resume_token().ok_or_else(|| {
            Error::Protocol("change stream yielded an event without a resume token".to_string())
        })?;
        let token_bytes = bson::to_vec(&token).map_err(|e| {
            Error::Protocol(format!("serializing resume token: {e}"))
        })?;
        let position = BASE64.encode(&token_bytes);

        let op = match change.operation_type {
            OperationType::Insert => Operation::Create,
            OperationType::Update | OperationType::Replace => Operation::Update,
            OperationType::Delete => Operation::Delete,
            _ => Operation::Read,
        };

        let collection = change
            .ns
            .and_then(|ns| ns.coll)
            .unwrap_or_else(|| self.config.collection.clone());

        let before = change.full_document_before_change.map(document_to_row);
        let after = change.full_document.map(document_to_row);

        let now = Utc::now();
        let mut source = EventSource::new(
            "mongodb",
            self.config.database.clone(),
            // MongoDB has no schema; the collection stands in by
            // convention.
            collection.clone(),
            collection,
        );
        source.name = self.config.database.clone();

        self.stats.update(|s| {
            s.total_events += 1;
            s.total_bytes += token_bytes.len() as u64;
            s.last_event_at = Some(Utc::now());
            s.last_error = None;
            s.source_specific
                .insert("last_operation".to_string(), json!(op));
        });

        debug!(operation = ?op, "change event received");

        Ok(Event {
            schema: None,
            payload: Payload {
                before,
                after,
                source,
                op,
                ts_ms: now.timestamp_millis(),
                transaction: None,
            },
            position: position.into_bytes(),
        })
    }

    /// Resume tokens persist entirely in the checkpoint store and are
    /// replayed on reconnect; there is nothing to acknowledge upstream.
    async fn checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(
            replicator_id = %checkpoint.replicator_id,
            timestamp = %checkpoint.timestamp,
            "checkpoint notification received"
        );
        Ok(())
    }

    fn stats(&self) -> Shared<SourceStats> {
        self.stats.clone()
    }
}
