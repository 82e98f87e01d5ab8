//! Replication-loop behaviour against mock sources and targets: ordering,
//! checkpoint policy, signal handling, and failure transitions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use librarian::checkpoint::{Checkpoint, Checkpointer};
use librarian::config::{SourceOptions, TargetOptions};
use librarian::event::{Event, EventSource, Operation, Payload};
use librarian::replicator::{Replicator, ReplicatorHandle, Signal, Source, Target};
use librarian::stats::{Shared, SourceStats, TargetStats};
use librarian::{Error, Result, State};

fn make_event(position: &str) -> Event {
    Event {
        schema: None,
        payload: Payload {
            before: None,
            after: Some(serde_json::Map::new()),
            source: EventSource::new("mock", "testdb", "public", "t"),
            op: Operation::Create,
            ts_ms: 0,
            transaction: None,
        },
        position: position.as_bytes().to_vec(),
    }
}

fn events(positions: &[&str]) -> VecDeque<Event> {
    positions.iter().map(|p| make_event(p)).collect()
}

/// Interleaved record of store saves and source acknowledgements, for
/// asserting that no position is acked before its save returned.
#[derive(Clone, Default)]
struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct MockSource {
    events: Arc<Mutex<VecDeque<Event>>>,
    fail_when_empty: bool,
    endless: bool,
    generated: u64,
    connects: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
    connected_with: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
    log: CallLog,
    stats: Shared<SourceStats>,
}

impl MockSource {
    fn new(events: VecDeque<Event>) -> Self {
        Self {
            events: Arc::new(Mutex::new(events)),
            fail_when_empty: false,
            endless: false,
            generated: 0,
            connects: Arc::new(AtomicUsize::new(0)),
            disconnects: Arc::new(AtomicUsize::new(0)),
            connected_with: Arc::new(Mutex::new(Vec::new())),
            log: CallLog::default(),
            stats: Shared::new(SourceStats::default()),
        }
    }

    /// A source that never runs dry: generates a fresh event whenever the
    /// queue is empty.
    fn endless() -> Self {
        let mut source = Self::new(VecDeque::new());
        source.endless = true;
        source
    }

    fn failing_when_empty(mut self) -> Self {
        self.fail_when_empty = true;
        self
    }

    fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }
}

#[async_trait]
impl Source for MockSource {
    async fn connect(&mut self, checkpoint: Option<&Checkpoint>) -> Result<()> {
        self.connected_with
            .lock()
            .unwrap()
            .push(checkpoint.map(|c| c.position.clone()));
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next(&mut self) -> Result<Event> {
        let event = self.events.lock().unwrap().pop_front();
        match event {
            Some(event) => {
                self.stats.update(|s| s.total_events += 1);
                Ok(event)
            }
            None if self.endless => {
                self.generated += 1;
                self.stats.update(|s| s.total_events += 1);
                Ok(make_event(&format!("0/{}", self.generated)))
            }
            None if self.fail_when_empty => {
                Err(Error::Protocol("stream broke".to_string()))
            }
            None => Err(Error::NoEventsFound),
        }
    }

    async fn checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.log.push(format!("ack:{}", checkpoint.position_str()));
        Ok(())
    }

    fn stats(&self) -> Shared<SourceStats> {
        self.stats.clone()
    }
}

struct MockTarget {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    flushes: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
    log: CallLog,
    stats: Shared<TargetStats>,
}

impl MockTarget {
    fn new() -> Self {
        Self {
            writes: Arc::new(Mutex::new(Vec::new())),
            flushes: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            log: CallLog::default(),
            stats: Shared::new(TargetStats::default()),
        }
    }

    fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }
}

#[async_trait]
impl Target for MockTarget {
    async fn connect(&mut self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, event: &Event) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Connection("sink unavailable".to_string()));
        }
        self.writes.lock().unwrap().push(event.position.clone());
        self.stats.update(|s| s.total_writes += 1);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.log.push("flush".to_string());
        self.stats.update(|s| s.total_flushes += 1);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> Shared<TargetStats> {
        self.stats.clone()
    }
}

struct RecordingCheckpointer {
    saves: Arc<Mutex<Vec<Checkpoint>>>,
    log: CallLog,
    load_result: Option<Checkpoint>,
    fail_saves: bool,
}

impl RecordingCheckpointer {
    fn new() -> Self {
        Self {
            saves: Arc::new(Mutex::new(Vec::new())),
            log: CallLog::default(),
            load_result: None,
            fail_saves: false,
        }
    }

    fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    fn loading(mut self, checkpoint: Checkpoint) -> Self {
        self.load_result = Some(checkpoint);
        self
    }

    fn failing_saves(mut self) -> Self {
        self.fail_saves = true;
        self
    }

}

#[async_trait]
impl Checkpointer for RecordingCheckpointer {
    async fn load(&self, _replicator_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.load_result.clone())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if self.fail_saves {
            return Err(Error::Checkpoint("store unavailable".to_string()));
        }
        self.log.push(format!("save:{}", checkpoint.position_str()));
        self.saves.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, _replicator_id: &str) -> Result<()> {
        Ok(())
    }
}

fn fast_source_options(checkpoint_batch_size: usize) -> SourceOptions {
    SourceOptions {
        checkpoint_batch_size,
        empty_poll_interval: Duration::from_millis(5),
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Running {
    handle: ReplicatorHandle,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<()>>,
}

fn spawn(mut replicator: Replicator) -> Running {
    let handle = replicator.handle();
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { replicator.run(cancel).await })
    };
    Running {
        handle,
        cancel,
        task,
    }
}

#[tokio::test]
async fn delivers_in_order_and_checkpoints_after_save() {
    let log = CallLog::default();
    let source = MockSource::new(events(&["0/1", "0/2", "0/3"])).with_log(log.clone());
    let target = MockTarget::new().with_log(log.clone());
    let checkpointer = RecordingCheckpointer::new().with_log(log.clone());

    let writes = target.writes.clone();
    let saves = checkpointer.saves.clone();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .checkpointer(Box::new(checkpointer))
        .source_options(fast_source_options(1))
        .build()
        .unwrap();

    let running = spawn(replicator);
    wait_for(|| saves.lock().unwrap().len() == 3, "three checkpoints").await;
    running.cancel.cancel();
    running.task.await.unwrap().unwrap();

    let writes = writes.lock().unwrap().clone();
    assert_eq!(
        writes,
        vec![b"0/1".to_vec(), b"0/2".to_vec(), b"0/3".to_vec()],
        "events must reach the target in source order"
    );

    // Strict ordering: the target is flushed before every save, and every
    // position is saved to the store before the source is told to
    // acknowledge it upstream.
    assert_eq!(
        log.entries(),
        vec![
            "flush", "save:0/1", "ack:0/1", "flush", "save:0/2", "ack:0/2", "flush", "save:0/3",
            "ack:0/3"
        ]
    );

    assert_eq!(running.handle.state(), State::Stopped);
}

#[tokio::test]
async fn batch_size_zero_never_checkpoints() {
    let source = MockSource::new(events(&["0/1", "0/2", "0/3"]));
    let target = MockTarget::new();
    let checkpointer = RecordingCheckpointer::new();

    let writes = target.writes.clone();
    let saves = checkpointer.saves.clone();
    let log = checkpointer.log.clone();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .checkpointer(Box::new(checkpointer))
        .source_options(fast_source_options(0))
        .build()
        .unwrap();

    let running = spawn(replicator);
    wait_for(|| writes.lock().unwrap().len() == 3, "three writes").await;
    // Give a dormant checkpoint a chance to fire before asserting absence.
    tokio::time::sleep(Duration::from_millis(50)).await;
    running.cancel.cancel();
    running.task.await.unwrap().unwrap();

    assert!(saves.lock().unwrap().is_empty());
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn batch_size_two_checkpoints_every_second_event() {
    let source = MockSource::new(events(&["0/1", "0/2", "0/3", "0/4"]));
    let target = MockTarget::new();
    let checkpointer = RecordingCheckpointer::new();
    let saves = checkpointer.saves.clone();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .checkpointer(Box::new(checkpointer))
        .source_options(fast_source_options(2))
        .build()
        .unwrap();

    let running = spawn(replicator);
    wait_for(|| saves.lock().unwrap().len() == 2, "two checkpoints").await;
    running.cancel.cancel();
    running.task.await.unwrap().unwrap();

    let positions: Vec<Vec<u8>> = saves
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.position.clone())
        .collect();
    assert_eq!(positions, vec![b"0/2".to_vec(), b"0/4".to_vec()]);
}

#[tokio::test]
async fn pause_stops_delivery_until_resume() {
    let source = MockSource::endless();
    let target = MockTarget::new();
    let writes = target.writes.clone();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .source_options(fast_source_options(0))
        .build()
        .unwrap();

    let running = spawn(replicator);
    wait_for(|| !writes.lock().unwrap().is_empty(), "first write").await;

    running.handle.signal(Signal::Pause);
    wait_for(|| running.handle.state() == State::Paused, "paused state").await;

    let frozen = writes.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        writes.lock().unwrap().len(),
        frozen,
        "no writes while paused"
    );

    running.handle.signal(Signal::Resume);
    wait_for(|| running.handle.state() == State::Streaming, "streaming again").await;
    wait_for(|| writes.lock().unwrap().len() > frozen, "writes resumed").await;

    running.cancel.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_signal_ends_run_cleanly() {
    let source = MockSource::new(VecDeque::new());
    let disconnects = source.disconnects.clone();
    let target = MockTarget::new();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .source_options(fast_source_options(0))
        .build()
        .unwrap();

    let running = spawn(replicator);
    wait_for(|| running.handle.state() == State::Streaming, "streaming").await;

    running.handle.signal(Signal::Stop);
    let result = running.task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(running.handle.state(), State::Stopped);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn restart_reconnects_source_but_not_target() {
    let source = MockSource::new(events(&["0/1", "0/2"]));
    let source_connects = source.connects.clone();
    let connected_with = source.connected_with.clone();
    let target = MockTarget::new();
    let target_connects = target.connects.clone();
    let checkpointer = RecordingCheckpointer::new();
    let saves = checkpointer.saves.clone();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .checkpointer(Box::new(checkpointer))
        .source_options(fast_source_options(1))
        .build()
        .unwrap();

    let running = spawn(replicator);
    wait_for(|| saves.lock().unwrap().len() == 2, "both events checkpointed").await;

    running.handle.signal(Signal::Restart);
    wait_for(|| source_connects.load(Ordering::SeqCst) == 2, "source reconnected").await;
    wait_for(|| running.handle.state() == State::Streaming, "streaming after restart").await;

    assert_eq!(target_connects.load(Ordering::SeqCst), 1, "target untouched");

    // The reconnect resumes from the last in-memory checkpoint.
    let connected_with = connected_with.lock().unwrap().clone();
    assert_eq!(connected_with[0], None);
    assert_eq!(connected_with[1], Some(b"0/2".to_vec()));

    running.cancel.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn loaded_checkpoint_is_passed_to_source() {
    let source = MockSource::new(VecDeque::new());
    let connected_with = source.connected_with.clone();
    let target = MockTarget::new();
    let checkpointer =
        RecordingCheckpointer::new().loading(Checkpoint::new("r1", b"0/42".to_vec()));

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .checkpointer(Box::new(checkpointer))
        .source_options(fast_source_options(0))
        .build()
        .unwrap();

    let running = spawn(replicator);
    wait_for(|| running.handle.state() == State::Streaming, "streaming").await;
    running.cancel.cancel();
    running.task.await.unwrap().unwrap();

    assert_eq!(
        connected_with.lock().unwrap().clone(),
        vec![Some(b"0/42".to_vec())]
    );
}

#[tokio::test]
async fn source_error_moves_to_error_state() {
    let source = MockSource::new(events(&["0/1"])).failing_when_empty();
    let target = MockTarget::new();
    let writes = target.writes.clone();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .source_options(fast_source_options(0))
        .build()
        .unwrap();

    let running = spawn(replicator);
    let result = running.task.await.unwrap();

    assert!(matches!(result, Err(Error::Protocol(_))));
    assert_eq!(running.handle.state(), State::Error);
    assert_eq!(writes.lock().unwrap().len(), 1, "event before the break was delivered");
}

#[tokio::test]
async fn target_write_error_moves_to_error_state() {
    let source = MockSource::new(events(&["0/1"]));
    let target = MockTarget::new();
    target.fail_writes.store(true, Ordering::SeqCst);
    let checkpointer = RecordingCheckpointer::new();
    let saves = checkpointer.saves.clone();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .checkpointer(Box::new(checkpointer))
        .source_options(fast_source_options(1))
        .build()
        .unwrap();

    let running = spawn(replicator);
    let result = running.task.await.unwrap();

    assert!(result.is_err());
    assert_eq!(running.handle.state(), State::Error);
    assert!(
        saves.lock().unwrap().is_empty(),
        "a failed write must never checkpoint"
    );
}

#[tokio::test]
async fn checkpoint_store_failure_is_fatal() {
    let source = MockSource::new(events(&["0/1"]));
    let target = MockTarget::new();
    let checkpointer = RecordingCheckpointer::new().failing_saves();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .checkpointer(Box::new(checkpointer))
        .source_options(fast_source_options(1))
        .build()
        .unwrap();

    let running = spawn(replicator);
    let result = running.task.await.unwrap();

    assert!(matches!(result, Err(Error::Checkpoint(_))));
    assert_eq!(running.handle.state(), State::Error);
}

#[tokio::test]
async fn flush_timer_flushes_without_checkpointing() {
    let source = MockSource::new(VecDeque::new());
    let target = MockTarget::new();
    let flushes = target.flushes.clone();
    let checkpointer = RecordingCheckpointer::new();
    let saves = checkpointer.saves.clone();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .checkpointer(Box::new(checkpointer))
        .source_options(fast_source_options(1))
        .target_options(TargetOptions {
            flush_timeout: Some(Duration::from_millis(25)),
        })
        .build()
        .unwrap();

    let running = spawn(replicator);
    wait_for(|| flushes.load(Ordering::SeqCst) >= 2, "periodic flushes").await;
    running.cancel.cancel();
    running.task.await.unwrap().unwrap();

    assert!(
        saves.lock().unwrap().is_empty(),
        "timer flushes do not checkpoint"
    );
}

#[tokio::test]
async fn full_signal_channel_drops_newest() {
    let source = MockSource::endless();
    let target = MockTarget::new();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .source_options(fast_source_options(0))
        .build()
        .unwrap();

    let handle = replicator.handle();
    // The channel holds one slot; the second signal is dropped, so the
    // replicator pauses and never resumes.
    handle.signal(Signal::Pause);
    handle.signal(Signal::Resume);

    let running = spawn(replicator);
    wait_for(|| running.handle.state() == State::Paused, "paused").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(running.handle.state(), State::Paused);

    running.cancel.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stats_counters_are_monotonic() {
    let source = MockSource::new(events(&["0/1", "0/2", "0/3", "0/4", "0/5"]));
    let target = MockTarget::new();
    let checkpointer = RecordingCheckpointer::new();
    let saves = checkpointer.saves.clone();

    let replicator = Replicator::builder()
        .id("r1")
        .source(Box::new(source))
        .target(Box::new(target))
        .checkpointer(Box::new(checkpointer))
        .source_options(fast_source_options(1))
        .build()
        .unwrap();

    let running = spawn(replicator);

    let mut last_events = 0;
    let mut last_checkpoints = 0;
    for _ in 0..20 {
        let stats = running.handle.stats();
        assert!(stats.source.total_events >= last_events);
        assert!(stats.replicator.checkpoint_count >= last_checkpoints);
        last_events = stats.source.total_events;
        last_checkpoints = stats.replicator.checkpoint_count;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    wait_for(|| saves.lock().unwrap().len() == 5, "all checkpoints").await;
    running.cancel.cancel();
    running.task.await.unwrap().unwrap();

    let stats = running.handle.stats();
    assert_eq!(stats.replicator.checkpoint_count, 5);
    assert_eq!(stats.source.total_events, 5);
}

#[tokio::test]
async fn builder_requires_id_source_and_target() {
    assert!(Replicator::builder().build().is_err());
    assert!(Replicator::builder().id("r1").build().is_err());
    assert!(Replicator::builder()
        .id("r1")
        .source(Box::new(MockSource::new(VecDeque::new())))
        .build()
        .is_err());
}
