//! PostgreSQL logical-replication source.
//!
//! Uses two physical connections: a regular connection for catalogue
//! queries (publication/slot checks, `pg_current_wal_lsn()`), and a
//! replication-mode connection for `START_REPLICATION` and CopyData
//! exchange. The two cannot share a socket; replication mode is exclusive.
//!
//! The flush/apply positions reported to PostgreSQL never exceed the last
//! durably persisted LSN: PostgreSQL recycles WAL past the flush position,
//! so acknowledging a non-persisted position would lose data on crash.
//! `persisted_lsn` advances only through [`Source::checkpoint`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_postgres::types::PgLsn;
use tokio_postgres::NoTls;
use tracing::{debug, error, info, warn};
use url::Url;

use super::decoder::{PgOutputDecoder, PgOutputMessage, RowChange};
use super::protocol::{PrimaryKeepalive, ReplicationClient, ReplicationStream};
use crate::checkpoint::Checkpoint;
use crate::config::PostgresSourceConfig;
use crate::event::{Event, EventSource, Payload};
use crate::replicator::Source;
use crate::stats::{Shared, SourceStats};
use crate::{Error, Result};

/// Deadline on each receive; expiry yields back to the replicator loop.
const RECEIVE_DEADLINE: Duration = Duration::from_secs(1);

/// Minimum spacing of unsolicited standby status updates.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct PostgresSource {
    config: PostgresSourceConfig,
    client: Option<tokio_postgres::Client>,
    connection_task: Option<tokio::task::JoinHandle<()>>,
    stream: Option<ReplicationStream>,
    decoder: PgOutputDecoder,

    /// Highest commit LSN received from the server.
    current_lsn: PgLsn,
    /// Highest LSN known durable at the target. Never reported beyond.
    persisted_lsn: PgLsn,
    last_heartbeat: Instant,

    stats: Shared<SourceStats>,
}

impl PostgresSource {
    pub fn new(uri: &Url) -> Result<Self> {
        let config = PostgresSourceConfig::from_uri(uri)?;

        let stats = Shared::new(SourceStats::default());
        stats.update(|s| {
            s.source_specific
                .insert("database".to_string(), json!(config.database));
            s.source_specific
                .insert("slot_name".to_string(), json!(config.slot));
            s.source_specific
                .insert("publication_name".to_string(), json!(config.publication));
        });

        Ok(Self {
            config,
            client: None,
            connection_task: None,
            stream: None,
            decoder: PgOutputDecoder::new(),
            current_lsn: PgLsn::from(0),
            persisted_lsn: PgLsn::from(0),
            last_heartbeat: Instant::now(),
            stats,
        })
    }

    /// Validates the publication exists and creates the slot when missing.
    /// The publication is never created automatically: its table set is a
    /// schema-level decision that belongs to the operator.
    async fn setup_replication(&mut self, repl: &mut ReplicationClient) -> Result<()> {
        let client = self.require_client()?;

        let row = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)",
                &[&self.config.publication],
            )
            .await?;
        let publication_exists: bool = row.get(0);
        if !publication_exists {
            return Err(Error::FailedPrecondition(format!(
                "publication '{p}' does not exist; create it with: CREATE PUBLICATION {p} FOR ALL TABLES",
                p = self.config.publication
            )));
        }

        let row = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
                &[&self.config.slot],
            )
            .await?;
        let slot_exists: bool = row.get(0);
        if !slot_exists {
            repl.create_replication_slot(&self.config.slot, "pgoutput")
                .await?;
        }

        Ok(())
    }

    /// Resumes from the checkpoint when its position parses as an LSN;
    /// otherwise starts at the current WAL head, after existing history.
    async fn starting_lsn(&self, checkpoint: Option<&Checkpoint>) -> Result<PgLsn> {
        if let Some(checkpoint) = checkpoint {
            let position = checkpoint.position_str();
            if let Ok(lsn) = position.parse::<PgLsn>() {
                info!(lsn = %lsn, "resuming from checkpoint");
                return Ok(lsn);
            }
            warn!(
                position = %position,
                "checkpoint position is not an LSN, starting from current WAL position"
            );
        }

        let client = self.require_client()?;
        let row = client.query_one("SELECT pg_current_wal_lsn()", &[]).await?;
        let lsn: PgLsn = row.get(0);
        info!(lsn = %lsn, "starting from current WAL position");
        Ok(lsn)
    }

    /// Reports write=current, flush=apply=persisted. Nothing persisted yet
    /// means flush/apply stay 0.
    async fn send_status_update(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Connection("replication stream not open".to_string()))?;
        stream
            .send_standby_status(self.current_lsn, self.persisted_lsn, self.persisted_lsn)
            .await?;
        self.last_heartbeat = Instant::now();
        Ok(())
    }

    fn event_from_change(&self, change: RowChange) -> Event {
        let now = Utc::now();
        let position = self.current_lsn.to_string();

        let mut source = EventSource::new(
            "postgresql",
            self.config.database.clone(),
            change.schema,
            change.table,
        )
        .with_lsn(u64::from(self.current_lsn) as i64);
        source.name = self.config.database.clone();
        if let Some(xid) = self.decoder.current_xid() {
            source = source.with_tx_id(xid);
        }

        Event {
            schema: None,
            payload: Payload {
                before: change.before,
                after: change.after,
                source,
                op: change.op,
                ts_ms: now.timestamp_millis(),
                transaction: None,
            },
            position: position.into_bytes(),
        }
    }

    fn record_error(&self, e: &Error) {
        let message = e.to_string();
        self.stats.update(|s| {
            s.event_error_count += 1;
            s.last_error = Some(message);
        });
    }

    fn require_client(&self) -> Result<&tokio_postgres::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Connection("postgres source not connected".to_string()))
    }
}

#[async_trait]
impl Source for PostgresSource {
    async fn connect(&mut self, checkpoint: Option<&Checkpoint>) -> Result<()> {
        self.stats.update(|s| s.connection_retries += 1);

        // Catalogue connection.
        let (client, connection) =
            tokio_postgres::connect(self.config.conn_uri.as_str(), NoTls).await?;
        self.connection_task = Some(tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres catalogue connection error");
            }
        }));
        self.client = Some(client);

        // Replication connection.
        let mut repl = ReplicationClient::connect(
            &self.config.host,
            self.config.port,
            &self.config.username,
            self.config.password.as_deref(),
            &self.config.database,
        )
        .await?;

        if let Err(e) = self.setup_replication(&mut repl).await {
            self.stats.update(|s| {
                s.connection_healthy = false;
                s.last_error = Some(e.to_string());
            });
            return Err(e);
        }

        let start_lsn = self.starting_lsn(checkpoint).await?;
        self.current_lsn = start_lsn;

        let stream = repl
            .start_replication(&self.config.slot, start_lsn, &self.config.publication)
            .await?;
        self.stream = Some(stream);
        self.last_heartbeat = Instant::now();

        self.stats.update(|s| {
            s.connection_healthy = true;
            s.last_connect_at = Some(Utc::now());
            s.last_error = None;
            s.source_specific
                .insert("current_lsn".to_string(), json!(start_lsn.to_string()));
        });

        info!(
            database = %self.config.database,
            slot = %self.config.slot,
            publication = %self.config.publication,
            start_lsn = %start_lsn,
            "postgres replication started"
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.close().await.ok();
        }
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
        self.client = None;
        self.decoder.clear();

        self.stats.update(|s| s.connection_healthy = false);
        Ok(())
    }

    async fn next(&mut self) -> Result<Event> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Connection("postgres source not connected".to_string()))?;

        let data = match stream.recv(RECEIVE_DEADLINE).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                let e = Error::Protocol("replication stream closed by server".to_string());
                self.record_error(&e);
                return Err(e);
            }
            Err(Error::NoEventsFound) => return Err(Error::NoEventsFound),
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        if data.is_empty() {
            return Err(Error::NoEventsFound);
        }

        match data[0] {
            // Primary keepalive.
            b'k' => {
                let keepalive = PrimaryKeepalive::parse(&data[1..])?;
                if keepalive.reply_requested {
                    self.send_status_update().await?;
                    debug!(
                        write_lsn = %self.current_lsn,
                        flush_lsn = %self.persisted_lsn,
                        "answered keepalive"
                    );
                }
                Err(Error::NoEventsFound)
            }

            // XLogData: 8-byte wal_start, wal_end, server clock, payload.
            b'w' => {
                if data.len() < 25 {
                    let e = Error::InvalidMessage {
                        message: format!("XLogData frame too short: {} bytes", data.len()),
                    };
                    self.record_error(&e);
                    return Err(e);
                }

                let message = match self.decoder.decode(&data[25..]) {
                    Ok(message) => message,
                    Err(e) => {
                        self.record_error(&e);
                        return Err(e);
                    }
                };

                match message {
                    PgOutputMessage::Begin { .. }
                    | PgOutputMessage::Relation { .. }
                    | PgOutputMessage::Skipped => Err(Error::NoEventsFound),

                    PgOutputMessage::Commit { commit_lsn } => {
                        self.current_lsn = PgLsn::from(commit_lsn);
                        if self.last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                            self.send_status_update().await?;
                        }
                        Err(Error::NoEventsFound)
                    }

                    PgOutputMessage::Row(change) => {
                        let operation = change.op;
                        let event = self.event_from_change(change);
                        self.stats.update(|s| {
                            s.total_events += 1;
                            s.total_bytes += data.len() as u64;
                            s.last_event_at = Some(Utc::now());
                            s.source_specific
                                .insert("last_operation".to_string(), json!(operation));
                            s.source_specific.insert(
                                "current_lsn".to_string(),
                                json!(self.current_lsn.to_string()),
                            );
                        });
                        Ok(event)
                    }
                }
            }

            other => {
                debug!(tag = %(other as char), "ignoring replication message");
                Err(Error::NoEventsFound)
            }
        }
    }

    /// Advances `persisted_lsn` and acknowledges it to PostgreSQL
    /// immediately, allowing WAL up to that position to be recycled.
    async fn checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let position = checkpoint.position_str();
        let lsn: PgLsn = position.parse().map_err(|_| {
            Error::Checkpoint(format!("checkpoint position is not an LSN: {position}"))
        })?;

        self.persisted_lsn = lsn;
        self.send_status_update().await?;

        debug!(
            write_lsn = %self.current_lsn,
            flush_lsn = %self.persisted_lsn,
            replicator_id = %checkpoint.replicator_id,
            "acknowledged persisted LSN"
        );
        Ok(())
    }

    fn stats(&self) -> Shared<SourceStats> {
        self.stats.clone()
    }
}
