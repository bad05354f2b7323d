/// Offset monitor: runs `kaf consume` on a node and tracks, per partition,
/// the newest offset the consumer has printed.
///
/// One background task owns the consumer's output stream and is the only
/// writer of the offset map. Callers read snapshots at any time and poll
/// [`OffsetMonitor::is_done`] (or use [`OffsetMonitor::wait_until`]) for
/// progress.
use crate::brokers::BrokerSource;
use crate::config::ConsumerConfig;
use crate::parser::{OffsetParser, ProtocolViolation, Reading};
use crate::remote::{LineStream, NodeAccount, RemoteError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

/// Errors surfaced by the monitor or its background task.
#[derive(Debug)]
pub enum MonitorError {
    /// `start()` was called on a monitor that already ran.
    AlreadyStarted,
    /// `wait()` was called before `start()`.
    NotStarted,
    /// The consumer's output broke the partition/offset framing.
    Protocol(ProtocolViolation),
    /// Launching, reading or killing the consumer failed.
    Remote(RemoteError),
    /// The background task panicked or was cancelled.
    Worker(JoinError),
    /// A polled condition did not hold before the deadline.
    Timeout { waited: Duration },
    /// The monitor finished while a polled condition was still false.
    EndedBeforeCondition,
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::AlreadyStarted => write!(f, "offset monitor was already started"),
            MonitorError::NotStarted => write!(f, "offset monitor was never started"),
            MonitorError::Protocol(e) => write!(f, "consumer output protocol violation: {}", e),
            MonitorError::Remote(e) => write!(f, "consumer process failed: {}", e),
            MonitorError::Worker(e) => write!(f, "offset monitor task failed: {}", e),
            MonitorError::Timeout { waited } => {
                write!(f, "condition not met within {:?}", waited)
            }
            MonitorError::EndedBeforeCondition => {
                write!(f, "consumer finished before the condition was met")
            }
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Protocol(e) => Some(e),
            MonitorError::Remote(e) => Some(e),
            MonitorError::Worker(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolViolation> for MonitorError {
    fn from(e: ProtocolViolation) -> Self {
        MonitorError::Protocol(e)
    }
}

impl From<RemoteError> for MonitorError {
    fn from(e: RemoteError) -> Self {
        MonitorError::Remote(e)
    }
}

/// Point-in-time view of a monitor, serializable for reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffsetSnapshot {
    pub topic: String,
    pub done: bool,
    pub offsets: BTreeMap<u32, u64>,
    pub taken_at: DateTime<Utc>,
}

/// State shared between the worker (sole writer) and callers (readers).
#[derive(Debug, Default)]
struct Shared {
    offsets: RwLock<BTreeMap<u32, u64>>,
    done: AtomicBool,
}

impl Shared {
    fn record(&self, reading: Reading) {
        let mut offsets = self.offsets.write().unwrap_or_else(|e| e.into_inner());
        offsets.insert(reading.partition, reading.offset);
    }

    fn offsets(&self) -> BTreeMap<u32, u64> {
        self.offsets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn offset(&self, partition: u32) -> Option<u64> {
        self.offsets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&partition)
            .copied()
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Sets `done` when dropped, whichever way the worker exits.
struct DoneGuard(Arc<Shared>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.done.store(true, Ordering::Release);
        tracing::debug!("offset monitor done");
    }
}

enum Worker {
    Idle,
    Running(JoinHandle<Result<(), MonitorError>>),
    Joined,
}

/// Watches one `kaf consume` process on one node.
pub struct OffsetMonitor {
    account: Arc<NodeAccount>,
    brokers: Arc<dyn BrokerSource>,
    topic: String,
    consumer: ConsumerConfig,
    shared: Arc<Shared>,
    worker: Worker,
}

impl OffsetMonitor {
    pub fn new(
        account: Arc<NodeAccount>,
        brokers: Arc<dyn BrokerSource>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            account,
            brokers,
            topic: topic.into(),
            consumer: ConsumerConfig::default(),
            shared: Arc::new(Shared::default()),
            worker: Worker::Idle,
        }
    }

    /// Use a different client binary, process name or start position.
    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }

    /// Cap the number of records the client consumes.
    pub fn with_record_limit(mut self, limit: u64) -> Self {
        self.consumer.record_limit = Some(limit);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The command run on the node.
    pub fn command_line(&self) -> String {
        let mut cmd = format!(
            "{} consume -b {} --offset {}",
            self.consumer.command,
            self.brokers.brokers(),
            self.consumer.start_offset
        );
        if let Some(limit) = self.consumer.record_limit {
            cmd.push_str(&format!(" --limit-messages {limit}"));
        }
        cmd.push(' ');
        cmd.push_str(&self.topic);
        cmd
    }

    /// Launch the consumer and begin tracking offsets in the background.
    ///
    /// Must be called from within a tokio runtime. A monitor runs once;
    /// monitoring again needs a fresh instance.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if !matches!(self.worker, Worker::Idle) {
            return Err(MonitorError::AlreadyStarted);
        }

        let command_line = self.command_line();
        let span = tracing::info_span!(
            "offset_monitor",
            topic = %self.topic,
            node = %self.account.node().name
        );
        let handle = tokio::spawn(
            run_worker(
                Arc::clone(&self.account),
                command_line,
                Arc::clone(&self.shared),
            )
            .instrument(span),
        );
        self.worker = Worker::Running(handle);
        Ok(())
    }

    /// Forcefully kill the consumer process. Does not wait for `done`.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        self.account
            .kill_process(&self.consumer.process_name, false)
            .await?;
        Ok(())
    }

    /// Wait for the background task to exit and re-raise its failure.
    ///
    /// Cancel-safe: the task stays joinable until one call observes its
    /// result. Returns `Ok(())` once that result has been reported.
    pub async fn wait(&mut self) -> Result<(), MonitorError> {
        let result = match &mut self.worker {
            Worker::Idle => return Err(MonitorError::NotStarted),
            Worker::Joined => return Ok(()),
            Worker::Running(handle) => handle.await,
        };
        self.worker = Worker::Joined;
        result.map_err(MonitorError::Worker)?
    }

    /// Latest offset per partition, ordered by partition.
    pub fn offsets(&self) -> BTreeMap<u32, u64> {
        self.shared.offsets()
    }

    pub fn offset(&self, partition: u32) -> Option<u64> {
        self.shared.offset(partition)
    }

    /// True once the background task has exited, for any reason.
    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    pub fn snapshot(&self) -> OffsetSnapshot {
        // Read `done` first so a `true` snapshot never misses the final offsets.
        let done = self.is_done();
        OffsetSnapshot {
            topic: self.topic.clone(),
            done,
            offsets: self.offsets(),
            taken_at: Utc::now(),
        }
    }

    /// Whether every partition in `partitions` has been read up to at least `offset`.
    pub fn reached(&self, partitions: &[u32], offset: u64) -> bool {
        let offsets = self.shared.offsets();
        partitions
            .iter()
            .all(|p| offsets.get(p).is_some_and(|&o| o >= offset))
    }

    /// Poll `condition` every `backoff` until it holds.
    ///
    /// Fails with `Timeout` after `timeout`, or with `EndedBeforeCondition`
    /// if the monitor finishes while the condition is still false.
    pub async fn wait_until<F>(
        &self,
        condition: F,
        timeout: Duration,
        backoff: Duration,
    ) -> Result<(), MonitorError>
    where
        F: Fn(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Sample `done` before the condition: after `done` the map is frozen.
            let done = self.is_done();
            if condition(self) {
                return Ok(());
            }
            if done {
                return Err(MonitorError::EndedBeforeCondition);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MonitorError::Timeout { waited: timeout });
            }
            tokio::time::sleep(backoff).await;
        }
    }
}

async fn run_worker(
    account: Arc<NodeAccount>,
    command_line: String,
    shared: Arc<Shared>,
) -> Result<(), MonitorError> {
    // Declared first so it drops last, after the stream and its process.
    let _done = DoneGuard(Arc::clone(&shared));

    let result = match account.ssh_capture(&command_line) {
        Ok(stream) => follow(stream, &shared).await,
        Err(e) => Err(e.into()),
    };
    match &result {
        Ok(()) => tracing::info!(
            partitions = shared.offsets().len(),
            "consumer output ended"
        ),
        Err(e) => tracing::error!(error = %e, "offset monitor failed"),
    }
    result
}

/// Feed every line of `stream` through the parser into `shared`.
///
/// Takes the stream by value so it is released before the caller signals done.
async fn follow(mut stream: LineStream, shared: &Shared) -> Result<(), MonitorError> {
    let mut parser = OffsetParser::new();
    while let Some(line) = stream.next_line().await? {
        tracing::debug!(line = %line.trim_end(), "consumer output");
        if let Some(reading) = parser.feed(&line)? {
            shared.record(reading);
        }
    }
    Ok(())
}
