//! Kafka target adapter.
//!
//! Writes enqueue onto the producer and rely on its internal linger/batch
//! policy; each enqueued record's delivery future is retained so `flush`
//! can block until everything previously written is durable at the
//! brokers. Delivery failures surface on flush, not per write.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, trace};

use crate::config::KafkaTargetConfig;
use crate::event::Event;
use crate::replicator::Target;
use crate::stats::{Shared, TargetStats};
use crate::{Error, Result};

/// Bound on how long a flush waits for outstanding deliveries.
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaTarget {
    config: KafkaTargetConfig,
    producer: Option<FutureProducer>,
    pending: Vec<DeliveryFuture>,
    flush_timeout: Duration,
    stats: Shared<TargetStats>,
}

impl KafkaTarget {
    pub fn new(config: KafkaTargetConfig) -> Self {
        Self {
            config,
            producer: None,
            pending: Vec::new(),
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            stats: Shared::new(TargetStats::default()),
        }
    }

    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }
}

#[async_trait]
impl Target for KafkaTarget {
    async fn connect(&mut self) -> Result<()> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", self.config.brokers.join(","));
        // URI query params pass through to the client untouched.
        for (key, value) in &self.config.params {
            client_config.set(key, value);
        }

        let producer: FutureProducer = client_config.create().map_err(|e| {
            error!(error = %e, "failed to create kafka producer");
            Error::Kafka(e)
        })?;
        self.producer = Some(producer);

        self.stats.update(|s| {
            s.connection_healthy = true;
            s.last_connect_at = Some(Utc::now());
            s.last_error = None;
        });

        info!(
            brokers = ?self.config.brokers,
            topic = %self.config.topic,
            "kafka producer created"
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.flush().await?;
        self.producer = None;
        self.stats.update(|s| s.connection_healthy = false);
        Ok(())
    }

    async fn write(&mut self, event: &Event) -> Result<()> {
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| Error::Connection("kafka target not connected".to_string()))?;

        let payload = serde_json::to_string(event)?;
        let key = event.position_str().into_owned();

        let record = FutureRecord::to(&self.config.topic)
            .key(&key)
            .payload(&payload);

        match producer.send_result(record) {
            Ok(delivery) => {
                self.pending.push(delivery);
                self.stats.update(|s| {
                    s.total_writes += 1;
                    s.total_bytes += payload.len() as u64;
                    s.last_write_at = Some(Utc::now());
                });
                trace!(topic = %self.config.topic, key = %key, "event enqueued");
                Ok(())
            }
            Err((e, _record)) => {
                self.stats.update(|s| {
                    s.write_error_count += 1;
                    s.last_error = Some(e.to_string());
                });
                Err(Error::Kafka(e))
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            self.stats.update(|s| {
                s.total_flushes += 1;
                s.last_flush_at = Some(Utc::now());
            });
            return Ok(());
        }

        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        let deadline = Instant::now() + self.flush_timeout;

        for delivery in pending {
            match timeout_at(deadline, delivery).await {
                Ok(Ok(Ok((partition, offset)))) => {
                    trace!(partition, offset, "delivery confirmed");
                }
                Ok(Ok(Err((e, _message)))) => {
                    self.stats.update(|s| {
                        s.flush_error_count += 1;
                        s.last_error = Some(e.to_string());
                    });
                    error!(error = %e, "kafka delivery failed");
                    return Err(Error::Kafka(e));
                }
                Ok(Err(_canceled)) => {
                    let e = Error::Connection("kafka delivery cancelled".to_string());
                    self.stats.update(|s| {
                        s.flush_error_count += 1;
                        s.last_error = Some(e.to_string());
                    });
                    return Err(e);
                }
                Err(_) => {
                    let e = Error::Timeout {
                        message: format!(
                            "kafka flush timed out after {:?}",
                            self.flush_timeout
                        ),
                    };
                    self.stats.update(|s| {
                        s.flush_error_count += 1;
                        s.last_error = Some(e.to_string());
                    });
                    return Err(e);
                }
            }
        }

        self.stats.update(|s| {
            s.total_flushes += 1;
            s.last_flush_at = Some(Utc::now());
        });
        debug!(count, topic = %self.config.topic, "flushed deliveries");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.disconnect().await
    }

    fn stats(&self) -> Shared<TargetStats> {
        self.stats.clone()
    }
}
