//! The replication pipeline orchestrator.
//!
//! One `run` per replicator drives the serial `next -> write -> checkpoint`
//! loop, reacting to control signals, a periodic flush timer, and
//! cancellation. Ordering is strict: no event is acknowledged upstream or
//! persisted to checkpoint storage before the target has accepted it and a
//! flush covering it succeeded.
//!
//! A replicator can be deployed three ways: as a standalone daemon, as an
//! embedded library component, or as a short-lived process.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, Checkpointer, NoopCheckpointer};
use crate::config::{SourceOptions, TargetOptions};
use crate::event::Event;
use crate::fsm::{Fsm, State};
use crate::stats::{ReplicatorStats, Shared, SourceStats, Stats, TargetStats};
use crate::{Error, Result};

/// Sleep applied while the replicator is paused.
const PAUSED_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Control signals accepted by a running replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Pause,
    Resume,
    Stop,
    Restart,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Pause => "pause",
            Signal::Resume => "resume",
            Signal::Stop => "stop",
            Signal::Restart => "restart",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pause" => Ok(Signal::Pause),
            "resume" => Ok(Signal::Resume),
            "stop" => Ok(Signal::Stop),
            "restart" => Ok(Signal::Restart),
            other => Err(Error::Config(format!("unknown signal: {other}"))),
        }
    }
}

/// A stream of change events from an upstream database.
#[async_trait]
pub trait Source: Send {
    /// Establishes the upstream connection, resuming from `checkpoint`
    /// when one is supplied.
    async fn connect(&mut self, checkpoint: Option<&Checkpoint>) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Returns the next event, or [`Error::NoEventsFound`] as a
    /// cooperative yield. Must honour cancellation within bounded latency
    /// (about one second).
    async fn next(&mut self) -> Result<Event>;

    /// Notifies the source that `checkpoint` is durable, so it may advance
    /// its upstream acknowledgement. Only ever called after the
    /// checkpoint store accepted the save.
    async fn checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()>;

    /// The source's shared stats block.
    fn stats(&self) -> Shared<SourceStats>;
}

/// A sink for change events.
///
/// Implementations are responsible for their own retry, DLQ, or
/// connection-health tracking; the replicator does not retry per-write.
#[async_trait]
pub trait Target: Send {
    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Accepts one event. May buffer.
    async fn write(&mut self, event: &Event) -> Result<()>;

    /// Blocks until all previously written events are durable at the sink.
    /// Must be idempotent and callable on an empty buffer.
    async fn flush(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// The target's shared stats block.
    fn stats(&self) -> Shared<TargetStats>;
}

pub struct Replicator {
    id: String,
    source: Box<dyn Source>,
    target: Box<dyn Target>,
    checkpointer: Box<dyn Checkpointer>,
    source_options: SourceOptions,
    target_options: TargetOptions,
    state: Arc<Fsm>,
    control_tx: mpsc::Sender<Signal>,
    control_rx: mpsc::Receiver<Signal>,
    last_checkpoint: Option<Checkpoint>,
    events_since_checkpoint: usize,
    stats: Shared<ReplicatorStats>,
}

/// Cloneable view of a replicator for the control surface: state and stats
/// snapshots plus the signal channel.
#[derive(Clone)]
pub struct ReplicatorHandle {
    id: String,
    state: Arc<Fsm>,
    control_tx: mpsc::Sender<Signal>,
    source_stats: Shared<SourceStats>,
    target_stats: Shared<TargetStats>,
    replicator_stats: Shared<ReplicatorStats>,
}

impl ReplicatorHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> State {
        self.state.current()
    }

    pub fn stats(&self) -> Stats {
        let mut replicator = self.replicator_stats.snapshot();
        replicator.state = self.state.current();
        if let Some(started_at) = replicator.started_at {
            replicator.uptime_seconds = (Utc::now() - started_at).num_seconds();
        }
        Stats {
            source: self.source_stats.snapshot(),
            target: self.target_stats.snapshot(),
            replicator,
        }
    }

    /// Enqueues a control signal. The channel holds a single slot; when it
    /// is full the newest signal is dropped with a warning. Signals are
    /// idempotent, so a drop is recoverable by re-issuing.
    pub fn signal(&self, signal: Signal) {
        match self.control_tx.try_send(signal) {
            Ok(()) => info!(replicator_id = %self.id, signal = %signal, "signal sent"),
            Err(_) => {
                warn!(replicator_id = %self.id, signal = %signal, "control channel full, signal dropped")
            }
        }
    }
}

#[derive(Default)]
pub struct ReplicatorBuilder {
    id: Option<String>,
    source: Option<Box<dyn Source>>,
    target: Option<Box<dyn Target>>,
    checkpointer: Option<Box<dyn Checkpointer>>,
    source_options: SourceOptions,
    target_options: TargetOptions,
}

impl ReplicatorBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn source(mut self, source: Box<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn target(mut self, target: Box<dyn Target>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn checkpointer(mut self, checkpointer: Box<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn source_options(mut self, options: SourceOptions) -> Self {
        self.source_options = options;
        self
    }

    pub fn target_options(mut self, options: TargetOptions) -> Self {
        self.target_options = options;
        self
    }

    pub fn build(self) -> Result<Replicator> {
        let id = self
            .id
            .ok_or_else(|| Error::Config("replicator id is required".to_string()))?;
        let source = self
            .source
            .ok_or_else(|| Error::Config("replicator source is required".to_string()))?;
        let target = self
            .target
            .ok_or_else(|| Error::Config("replicator target is required".to_string()))?;

        // Single-slot channel: drop-newest on overflow, see
        // `ReplicatorHandle::signal`.
        let (control_tx, control_rx) = mpsc::channel(1);

        let replicator = Replicator {
            id,
            source,
            target,
            checkpointer: self
                .checkpointer
                .unwrap_or_else(|| Box::new(NoopCheckpointer)),
            source_options: self.source_options,
            target_options: self.target_options,
            state: Arc::new(Fsm::new()),
            control_tx,
            control_rx,
            last_checkpoint: None,
            events_since_checkpoint: 0,
            stats: Shared::new(ReplicatorStats::default()),
        };

        info!(
            replicator_id = %replicator.id,
            state = %replicator.state.current(),
            "replicator created"
        );
        Ok(replicator)
    }
}

enum Step {
    Shutdown,
    Signal(Signal),
    FlushTick,
    Stream,
}

impl Replicator {
    pub fn builder() -> ReplicatorBuilder {
        ReplicatorBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> State {
        self.state.current()
    }

    pub fn handle(&self) -> ReplicatorHandle {
        ReplicatorHandle {
            id: self.id.clone(),
            state: Arc::clone(&self.state),
            control_tx: self.control_tx.clone(),
            source_stats: self.source.stats(),
            target_stats: self.target.stats(),
            replicator_stats: self.stats.clone(),
        }
    }

    /// Runs the replication loop until cancellation, a stop signal, or a
    /// fatal error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        self.state.transition(State::Connecting)?;
        self.stats.update(|s| {
            s.started_at = Some(Utc::now());
            s.state = State::Connecting;
        });

        info!(
            replicator_id = %self.id,
            source_options = ?self.source_options,
            target_options = ?self.target_options,
            "starting replicator"
        );

        let checkpoint = match self.checkpointer.load(&self.id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => return self.fail(e),
        };
        match &checkpoint {
            Some(checkpoint) => info!(
                replicator_id = %self.id,
                position = %checkpoint.position_str(),
                timestamp = %checkpoint.timestamp,
                "loaded checkpoint"
            ),
            None => info!(replicator_id = %self.id, "no checkpoint found, starting fresh"),
        }

        if let Err(e) = self.target.connect().await {
            return self.fail(e);
        }
        if let Err(e) = self.source.connect(checkpoint.as_ref()).await {
            return self.fail(e);
        }
        self.last_checkpoint = checkpoint;

        self.state.transition(State::Streaming)?;
        self.sync_state();
        info!(replicator_id = %self.id, state = %self.state.current(), "replicator started");

        // A zero flush timeout disables the timer.
        let mut flush_interval = self
            .target_options
            .flush_timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| {
                let mut interval = tokio::time::interval(timeout);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                interval.reset();
                interval
            });
        let flush_enabled = flush_interval.is_some();

        loop {
            let step = tokio::select! {
                biased;

                _ = cancel.cancelled() => Step::Shutdown,

                Some(signal) = self.control_rx.recv() => Step::Signal(signal),

                _ = Self::flush_tick(flush_interval.as_mut()), if flush_enabled => {
                    Step::FlushTick
                }

                _ = std::future::ready(()) => Step::Stream,
            };

            match step {
                Step::Shutdown => {
                    info!(replicator_id = %self.id, "cancelled, stopping replicator");
                    let _ = self.state.transition(State::Stopped);
                    self.sync_state();
                    return self.source.disconnect().await;
                }

                Step::Signal(signal) => {
                    self.stats.update(|s| s.signals_received += 1);
                    self.handle_signal(signal).await?;
                    if self.state.current() == State::Stopped {
                        return Ok(());
                    }
                }

                Step::FlushTick => {
                    debug!(replicator_id = %self.id, "flushing target");
                    if let Err(e) = self.target.flush().await {
                        error!(replicator_id = %self.id, error = %e, "target flush failed");
                        return self.fail(e);
                    }
                }

                Step::Stream => {
                    if self.state.current() != State::Streaming {
                        tokio::time::sleep(PAUSED_POLL_INTERVAL).await;
                        continue;
                    }

                    let event = match self.source.next().await {
                        Ok(event) => event,
                        Err(Error::NoEventsFound) => {
                            tokio::time::sleep(self.source_options.empty_poll_interval).await;
                            continue;
                        }
                        Err(e) => {
                            error!(replicator_id = %self.id, error = %e, "source error");
                            return self.fail(e);
                        }
                    };

                    if let Err(e) = self.target.write(&event).await {
                        error!(replicator_id = %self.id, error = %e, "target write failed");
                        return self.fail(e);
                    }

                    if let Err(e) = self.checkpoint(&event).await {
                        error!(replicator_id = %self.id, error = %e, "checkpoint failed");
                        return self.fail(e);
                    }

                    self.sync_state();
                }
            }
        }
    }

    async fn flush_tick(interval: Option<&mut Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    async fn handle_signal(&mut self, signal: Signal) -> Result<()> {
        let current = self.state.current();

        match signal {
            Signal::Pause => {
                if current == State::Streaming {
                    info!(replicator_id = %self.id, "pausing replicator");
                    self.state.transition(State::Paused)?;
                    self.sync_state();
                } else {
                    warn!(replicator_id = %self.id, state = %current, "cannot pause from current state");
                }
            }

            Signal::Resume => {
                if current == State::Paused {
                    info!(replicator_id = %self.id, "resuming replicator");
                    self.state.transition(State::Streaming)?;
                    self.sync_state();
                } else {
                    warn!(replicator_id = %self.id, state = %current, "cannot resume from current state");
                }
            }

            Signal::Stop => {
                info!(replicator_id = %self.id, "stopping replicator");
                let _ = self.state.transition(State::Stopped);
                self.sync_state();
                self.source.disconnect().await?;
            }

            Signal::Restart => {
                if current != State::Streaming {
                    warn!(replicator_id = %self.id, state = %current, "cannot restart from current state");
                    return Ok(());
                }

                info!(replicator_id = %self.id, "restarting replicator");
                if let Err(e) = self.source.disconnect().await {
                    error!(replicator_id = %self.id, error = %e, "error disconnecting during restart");
                }

                self.state.transition(State::Reconnecting)?;
                self.sync_state();

                // The target keeps its connection across a restart; only
                // the source is re-established.
                if let Err(e) = self.source.connect(self.last_checkpoint.as_ref()).await {
                    let _ = self.state.transition(State::Error);
                    self.sync_state();
                    return Err(e);
                }

                self.state.transition(State::Streaming)?;
                self.sync_state();
            }
        }

        Ok(())
    }

    /// Persists and acknowledges `event`'s position once the batch counter
    /// crosses `checkpoint_batch_size`. The order is strict: the target is
    /// flushed so every event up to this one is durable at the sink, then
    /// the store accepts the save, and only then is the source told to
    /// acknowledge upstream.
    async fn checkpoint(&mut self, event: &Event) -> Result<()> {
        if self.source_options.checkpoint_batch_size == 0 {
            return Ok(());
        }

        self.events_since_checkpoint += 1;
        if self.events_since_checkpoint < self.source_options.checkpoint_batch_size {
            return Ok(());
        }

        self.target.flush().await?;

        let checkpoint = Checkpoint::new(self.id.clone(), event.position.clone());
        self.checkpointer.save(&checkpoint).await?;
        self.source.checkpoint(&checkpoint).await?;

        self.events_since_checkpoint = 0;
        self.stats.update(|s| {
            s.checkpoint_count += 1;
            s.last_checkpoint_at = Some(Utc::now());
        });

        info!(
            replicator_id = %self.id,
            position = %checkpoint.position_str(),
            "checkpoint saved"
        );
        self.last_checkpoint = Some(checkpoint);
        Ok(())
    }

    fn fail(&mut self, e: Error) -> Result<()> {
        let _ = self.state.transition(State::Error);
        self.sync_state();
        Err(e)
    }

    fn sync_state(&self) {
        let state = self.state.current();
        self.stats.update(|s| {
            s.state = state;
            if let Some(started_at) = s.started_at {
                s.uptime_seconds = (Utc::now() - started_at).num_seconds();
            }
        });
    }
}
