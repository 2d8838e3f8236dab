// Asynchronous queues between execution contexts and the job server.
// Contexts enqueue console lines, timeline snapshots, and completed log
// pages without blocking; background drain passes flush them in order.
//
// Per-record ordering is preserved because each record's lines live in one
// buffer flushed sequentially; no ordering is promised across records.

use agent_common::Tracing;
use agent_sdk::TraceWriter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job_server::{ConsoleLineBatch, JobServer};
use crate::timeline::TimelineRecord;

/// Default delay between drain passes.
const DEFAULT_DELAY: Duration = Duration::from_millis(500);

/// Maximum console lines posted in one request.
const MAX_CONSOLE_BATCH: usize = 100;

/// Cumulative throttling beyond this is surfaced to the user (once per job).
pub const THROTTLING_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Default)]
struct ConsoleBuffer {
    start_line: Option<u64>,
    lines: Vec<String>,
}

struct Buffers {
    console: HashMap<Uuid, ConsoleBuffer>,
    /// Latest snapshot per record, in first-seen order.
    timeline: Vec<TimelineRecord>,
    uploads: Vec<(Uuid, PathBuf)>,
}

/// The per-job queue in front of the job server.
pub struct JobServerQueue {
    server: Arc<dyn JobServer>,
    plan_id: Uuid,
    timeline_id: Uuid,
    trace: Tracing,
    buffers: Mutex<Buffers>,
    post_lines_delay: Mutex<Duration>,
    throttling_warned: AtomicBool,
    stop: CancellationToken,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl JobServerQueue {
    pub fn new(
        server: Arc<dyn JobServer>,
        plan_id: Uuid,
        timeline_id: Uuid,
        trace: Tracing,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            plan_id,
            timeline_id,
            trace,
            buffers: Mutex::new(Buffers {
                console: HashMap::new(),
                timeline: Vec::new(),
                uploads: Vec::new(),
            }),
            post_lines_delay: Mutex::new(DEFAULT_DELAY),
            throttling_warned: AtomicBool::new(false),
            stop: CancellationToken::new(),
            drain_task: Mutex::new(None),
        })
    }

    /// Start the background drain loop.
    pub fn start(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let delay = *queue.post_lines_delay.lock();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = queue.stop.cancelled() => break,
                }
                queue.process_once().await;
            }
            // Final flush after stop.
            queue.process_once().await;
        });
        *self.drain_task.lock() = Some(handle);
    }

    /// Stop the drain loop, flushing everything still queued.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handle = self.drain_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // A send could have been enqueued between the final flush and here.
        self.process_once().await;
    }

    /// Adjust the console flush cadence (driven by job metadata updates).
    pub fn set_post_lines_frequency(&self, delay: Duration) {
        *self.post_lines_delay.lock() = delay.clamp(Duration::from_millis(100), Duration::from_secs(30));
    }

    /// Enqueue one masked console line for a record.
    pub fn queue_console_line(&self, record_id: Uuid, line_number: u64, line: &str) {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.console.entry(record_id).or_default();
        if buffer.start_line.is_none() {
            buffer.start_line = Some(line_number);
        }
        buffer.lines.push(line.to_string());
    }

    /// Enqueue a timeline record snapshot. A newer snapshot of the same
    /// record replaces the queued one.
    pub fn queue_timeline_update(&self, record: TimelineRecord) {
        let mut buffers = self.buffers.lock();
        if let Some(existing) = buffers.timeline.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
        } else {
            buffers.timeline.push(record);
        }
    }

    /// Enqueue a completed log page for upload.
    pub fn queue_log_upload(&self, record_id: Uuid, path: PathBuf) {
        self.buffers.lock().uploads.push((record_id, path));
    }

    /// One-shot throttling check: returns the cumulative delay the first
    /// time it crosses the threshold, `None` otherwise.
    pub fn check_throttling(&self) -> Option<Duration> {
        let total = self.server.accumulated_throttling();
        if total >= THROTTLING_WARNING_THRESHOLD
            && !self.throttling_warned.swap(true, Ordering::SeqCst)
        {
            return Some(total);
        }
        None
    }

    async fn process_once(&self) {
        let (console, timeline, uploads) = {
            let mut buffers = self.buffers.lock();
            let console: Vec<(Uuid, ConsoleBuffer)> = buffers
                .console
                .iter_mut()
                .filter(|(_, b)| !b.lines.is_empty())
                .map(|(id, b)| (*id, std::mem::take(b)))
                .collect();
            let timeline = std::mem::take(&mut buffers.timeline);
            let uploads = std::mem::take(&mut buffers.uploads);
            (console, timeline, uploads)
        };

        for (record_id, buffer) in console {
            let mut start_line = buffer.start_line.unwrap_or(1);
            for chunk in buffer.lines.chunks(MAX_CONSOLE_BATCH) {
                let batch = ConsoleLineBatch {
                    record_id,
                    start_line,
                    lines: chunk.to_vec(),
                };
                start_line += chunk.len() as u64;
                if let Err(e) = self
                    .server
                    .append_console_lines(self.plan_id, self.timeline_id, batch)
                    .await
                {
                    // Console lines are best effort.
                    self.trace
                        .warning(&format!("Failed to post console lines: {e:#}"));
                    break;
                }
            }
        }

        if !timeline.is_empty() {
            if let Err(e) = self
                .server
                .update_records(self.plan_id, self.timeline_id, timeline.clone())
                .await
            {
                self.trace
                    .warning(&format!("Failed to update timeline records: {e:#}"));
                // Keep the snapshots for the next pass unless newer ones arrived.
                let mut buffers = self.buffers.lock();
                for record in timeline {
                    if !buffers.timeline.iter().any(|r| r.id == record.id) {
                        buffers.timeline.push(record);
                    }
                }
            }
        }

        for (record_id, path) in uploads {
            if let Err(e) = self
                .server
                .upload_log(self.plan_id, self.timeline_id, record_id, &path)
                .await
            {
                self.trace
                    .warning(&format!("Failed to upload log '{}': {e:#}", path.display()));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use agent_common::TaskResult;
    use std::path::Path;

    /// In-memory job server used by queue / runner tests.
    #[derive(Default)]
    pub struct FakeJobServer {
        pub console: Mutex<Vec<ConsoleLineBatch>>,
        pub records: Mutex<Vec<TimelineRecord>>,
        pub uploads: Mutex<Vec<PathBuf>>,
        pub completions: Mutex<Vec<(Uuid, TaskResult)>>,
        pub throttled: Mutex<Duration>,
        pub fail_completions: Mutex<usize>,
        pub non_retryable_completion: AtomicBool,
    }

    impl FakeJobServer {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// All console text across batches, in arrival order.
        pub fn console_text(&self) -> Vec<String> {
            self.console
                .lock()
                .iter()
                .flat_map(|b| b.lines.clone())
                .collect()
        }

        /// The most recent snapshot seen for the given record.
        pub fn last_record(&self, id: Uuid) -> Option<TimelineRecord> {
            self.records
                .lock()
                .iter()
                .rev()
                .find(|r| r.id == id)
                .cloned()
        }
    }

    #[async_trait]
    impl JobServer for FakeJobServer {
        async fn update_records(
            &self,
            _plan_id: Uuid,
            _timeline_id: Uuid,
            records: Vec<TimelineRecord>,
        ) -> Result<()> {
            self.records.lock().extend(records);
            Ok(())
        }

        async fn append_console_lines(
            &self,
            _plan_id: Uuid,
            _timeline_id: Uuid,
            batch: ConsoleLineBatch,
        ) -> Result<()> {
            self.console.lock().push(batch);
            Ok(())
        }

        async fn upload_log(
            &self,
            _plan_id: Uuid,
            _timeline_id: Uuid,
            _record_id: Uuid,
            path: &Path,
        ) -> Result<()> {
            self.uploads.lock().push(path.to_path_buf());
            Ok(())
        }

        async fn raise_job_completed(
            &self,
            _plan_id: Uuid,
            job_id: Uuid,
            result: TaskResult,
        ) -> Result<()> {
            {
                let mut remaining = self.fail_completions.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("transient completion failure");
                }
            }
            if self.non_retryable_completion.load(Ordering::SeqCst) {
                return Err(agent_common::NonRetryableError::new("plan not found").into());
            }
            self.completions.lock().push((job_id, result));
            Ok(())
        }

        fn accumulated_throttling(&self) -> Duration {
            *self.throttled.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeJobServer;
    use super::*;
    use crate::timeline::{RecordType, TimelineRecordState};
    use agent_common::{SecretMasker, TraceManager};

    fn trace() -> Tracing {
        TraceManager::new(SecretMasker::new()).get("JobServerQueueTests")
    }

    fn queue_with(server: Arc<FakeJobServer>) -> Arc<JobServerQueue> {
        JobServerQueue::new(server, Uuid::new_v4(), Uuid::new_v4(), trace())
    }

    #[tokio::test]
    async fn console_lines_flush_in_order_with_start_line() {
        let server = FakeJobServer::new();
        let queue = queue_with(Arc::clone(&server));
        let record = Uuid::new_v4();

        queue.queue_console_line(record, 1, "first");
        queue.queue_console_line(record, 2, "second");
        queue.process_once().await;

        let batches = server.console.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].start_line, 1);
        assert_eq!(batches[0].lines, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn large_console_buffers_are_chunked() {
        let server = FakeJobServer::new();
        let queue = queue_with(Arc::clone(&server));
        let record = Uuid::new_v4();

        for i in 0..250u64 {
            queue.queue_console_line(record, i + 1, &format!("line {i}"));
        }
        queue.process_once().await;

        let batches = server.console.lock().clone();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].lines.len(), 100);
        assert_eq!(batches[1].start_line, 101);
        assert_eq!(batches[2].lines.len(), 50);
    }

    #[tokio::test]
    async fn timeline_snapshots_coalesce_to_latest() {
        let server = FakeJobServer::new();
        let queue = queue_with(Arc::clone(&server));

        let mut record = crate::timeline::TimelineRecord::new(
            Uuid::new_v4(),
            None,
            1,
            "Step",
            "__step",
            RecordType::Task,
        );
        queue.queue_timeline_update(record.clone());
        record.transition_to(TimelineRecordState::InProgress);
        queue.queue_timeline_update(record.clone());
        queue.process_once().await;

        let sent = server.records.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].state, TimelineRecordState::InProgress);
    }

    #[tokio::test]
    async fn throttling_warning_fires_once() {
        let server = FakeJobServer::new();
        *server.throttled.lock() = Duration::from_secs(45);
        let queue = queue_with(Arc::clone(&server));

        assert_eq!(queue.check_throttling(), Some(Duration::from_secs(45)));
        assert_eq!(queue.check_throttling(), None);
    }

    #[tokio::test]
    async fn below_threshold_no_warning() {
        let server = FakeJobServer::new();
        *server.throttled.lock() = Duration::from_secs(5);
        let queue = queue_with(Arc::clone(&server));
        assert_eq!(queue.check_throttling(), None);
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_entries() {
        let server = FakeJobServer::new();
        let queue = queue_with(Arc::clone(&server));
        queue.start();

        let record = Uuid::new_v4();
        queue.queue_console_line(record, 1, "tail line");
        queue.shutdown().await;

        assert_eq!(server.console_text(), vec!["tail line"]);
    }
}
