//! Background save queue.
//!
//! Each scheduled write runs on its own thread. The pending-job list is the only shared
//! state: jobs are added on schedule and remove themselves on completion, both under one
//! mutex. The condvar paired with it is signalled when the list becomes empty, which is
//! what shutdown code waits for with [`PersistenceQueue::wait_for_drain`].
//!
//! While the process is shutting down or has crashed, writes run synchronously on the
//! caller's thread instead.

use parking_lot::{Condvar, Mutex};
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::codec::BinaryWriter;
use crate::config::PersistConfig;
use crate::error::Result;

/// Host lifecycle as far as saving is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Running = 0,
    ShuttingDown = 1,
    Crashed = 2,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::Crashed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Scheduled,
    Running,
    Completed,
    Failed,
}

/// Bookkeeping for one in-flight write. Never persisted.
#[derive(Debug, Clone)]
pub struct PendingWriteJob {
    pub id: u64,
    pub label: String,
    pub state: JobState,
    pub scheduled_at: Instant,
}

/// How a write was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Running on a background thread under this job id.
    Background(u64),
    /// Already executed on the calling thread.
    Synchronous { succeeded: bool },
    /// The background thread could not be started; nothing was written.
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub synchronous: u64,
}

/// Where a job's bytes end up.
///
/// `open` is called on the job's thread; `commit` only after the write callback has
/// succeeded, so a target can make the result visible atomically.
pub trait WriteTarget: Send + 'static {
    type Writer: Write;

    fn label(&self) -> String;

    fn open(&mut self) -> Result<Self::Writer>;

    fn commit(self, writer: Self::Writer) -> Result<()>;

    /// Called instead of `commit` when the write failed. Drops any partial output.
    fn discard(self)
    where
        Self: Sized,
    {
    }
}

/// Collects the written bytes in memory. Mostly useful for tests and tools.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    label: String,
    sink: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryTarget {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            sink: Arc::default(),
        }
    }

    /// Bytes of the last committed write, if any.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.sink.lock().clone()
    }
}

impl WriteTarget for MemoryTarget {
    type Writer = Vec<u8>;

    fn label(&self) -> String {
        self.label.clone()
    }

    fn open(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn commit(self, writer: Vec<u8>) -> Result<()> {
        *self.sink.lock() = Some(writer);
        Ok(())
    }
}

#[derive(Debug)]
struct QueueInner {
    pending: Mutex<Vec<PendingWriteJob>>,
    idle: Condvar,
    state: AtomicU8,
    next_id: AtomicU64,
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    synchronous: AtomicU64,
    chunk_size: usize,
    poll_interval: Duration,
    warn_after: Duration,
}

/// Schedules serialization jobs off the caller's thread. Cloning shares the queue.
#[derive(Debug, Clone)]
pub struct PersistenceQueue {
    inner: Arc<QueueInner>,
}

impl PersistenceQueue {
    pub fn new(config: &PersistConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(Vec::new()),
                idle: Condvar::new(),
                state: AtomicU8::new(ProcessState::Running as u8),
                next_id: AtomicU64::new(1),
                scheduled: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                synchronous: AtomicU64::new(0),
                chunk_size: config.block_chunk_size,
                poll_interval: config.drain_poll_interval(),
                warn_after: config.drain_warn_after(),
            }),
        }
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ProcessState) {
        let previous = self.inner.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            tracing::info!(?state, "persistence queue state changed");
        }
    }

    pub fn begin_shutdown(&self) {
        self.set_state(ProcessState::ShuttingDown);
    }

    pub fn mark_crashed(&self) {
        self.set_state(ProcessState::Crashed);
    }

    /// Run `write_fn` against `target`, in the background unless the process is shutting
    /// down or crashed. Never fails: errors are logged and counted.
    pub fn schedule_write<T, F>(&self, target: T, write_fn: F) -> ScheduleOutcome
    where
        T: WriteTarget,
        F: FnOnce(&mut BinaryWriter<T::Writer>) -> Result<()> + Send + 'static,
    {
        let label = target.label();
        if self.state() != ProcessState::Running {
            let succeeded = run_isolated(&label, target, write_fn, self.inner.chunk_size);
            self.inner.synchronous.fetch_add(1, Ordering::Relaxed);
            self.inner.record_outcome(succeeded);
            tracing::debug!(%label, succeeded, "ran write synchronously");
            return ScheduleOutcome::Synchronous { succeeded };
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.lock().push(PendingWriteJob {
            id,
            label: label.clone(),
            state: JobState::Scheduled,
            scheduled_at: Instant::now(),
        });
        self.inner.scheduled.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("persist-job-{id}"))
            .spawn(move || {
                inner.set_job_state(id, JobState::Running);
                let succeeded = run_isolated(&label, target, write_fn, inner.chunk_size);
                inner.finish(id, succeeded);
            });

        match spawned {
            Ok(_) => {
                tracing::debug!(id, "write job scheduled");
                ScheduleOutcome::Background(id)
            }
            Err(e) => {
                tracing::error!(id, error = %e, "failed to start write job");
                self.inner.finish(id, false);
                ScheduleOutcome::Rejected
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0
    }

    pub fn pending_jobs(&self) -> Vec<PendingWriteJob> {
        self.inner.pending.lock().clone()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            scheduled: self.inner.scheduled.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            synchronous: self.inner.synchronous.load(Ordering::Relaxed),
        }
    }

    /// Block until every pending job has finished.
    ///
    /// Only for shutdown and crash handlers. There is no timeout: a stuck write keeps
    /// this waiting, and it is logged once per `drain_warn_after` period.
    pub fn wait_for_drain(&self) {
        let started = Instant::now();
        let mut next_warning = self.inner.warn_after;
        let mut pending = self.inner.pending.lock();
        while !pending.is_empty() {
            self.inner.idle.wait_for(&mut pending, self.inner.poll_interval);
            let waited = started.elapsed();
            if waited >= next_warning {
                tracing::warn!(
                    pending = pending.len(),
                    waited_secs = waited.as_secs(),
                    oldest = pending.first().map(|job| job.label.as_str()).unwrap_or(""),
                    "still waiting for persistence jobs to drain"
                );
                next_warning += self.inner.warn_after;
            }
        }
        tracing::debug!(waited_ms = started.elapsed().as_millis() as u64, "persistence queue drained");
    }

    /// Like [`wait_for_drain`](Self::wait_for_drain) but gives up after `timeout`.
    /// Returns whether the queue drained.
    pub fn wait_for_drain_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.inner.pending.lock();
        while !pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let step = (deadline - now).min(self.inner.poll_interval);
            self.inner.idle.wait_for(&mut pending, step);
        }
        true
    }
}

impl QueueInner {
    fn set_job_state(&self, id: u64, state: JobState) {
        if let Some(job) = self.pending.lock().iter_mut().find(|job| job.id == id) {
            job.state = state;
        }
    }

    fn finish(&self, id: u64, succeeded: bool) {
        let mut pending = self.pending.lock();
        pending.retain(|job| job.id != id);
        self.record_outcome(succeeded);
        if pending.is_empty() {
            self.idle.notify_all();
        }
        let state = if succeeded {
            JobState::Completed
        } else {
            JobState::Failed
        };
        tracing::debug!(id, ?state, remaining = pending.len(), "write job finished");
    }

    fn record_outcome(&self, succeeded: bool) {
        if succeeded {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn run_isolated<T, F>(label: &str, target: T, write_fn: F, chunk_size: usize) -> bool
where
    T: WriteTarget,
    F: FnOnce(&mut BinaryWriter<T::Writer>) -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(|| run_job(target, write_fn, chunk_size))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(%label, error = %e, "write job failed");
            false
        }
        Err(_) => {
            tracing::error!(%label, "write job panicked");
            false
        }
    }
}

fn run_job<T, F>(mut target: T, write_fn: F, chunk_size: usize) -> Result<()>
where
    T: WriteTarget,
    F: FnOnce(&mut BinaryWriter<T::Writer>) -> Result<()>,
{
    let opened = target.open();
    let mut writer = match opened {
        Ok(inner) => BinaryWriter::with_chunk_size(inner, chunk_size),
        Err(e) => {
            target.discard();
            return Err(e);
        }
    };
    if let Err(e) = write_fn(&mut writer).and_then(|()| writer.flush()) {
        drop(writer);
        target.discard();
        return Err(e);
    }
    target.commit(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistError;
    use std::thread;

    fn queue() -> PersistenceQueue {
        PersistenceQueue::new(&PersistConfig::default())
    }

    #[test]
    fn background_write_commits_after_drain() {
        let queue = queue();
        let target = MemoryTarget::new("world");
        let outcome = queue.schedule_write(target.clone(), |w| {
            thread::sleep(Duration::from_millis(20));
            w.write_string("saved")
        });
        assert!(matches!(outcome, ScheduleOutcome::Background(_)));

        queue.wait_for_drain();
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.is_idle());
        assert_eq!(target.contents(), Some(vec![5, b's', b'a', b'v', b'e', b'd']));
        assert_eq!(queue.stats().completed, 1);
    }

    #[test]
    fn drain_waits_for_concurrent_callers() {
        let queue = queue();
        let callers: Vec<_> = (0..8)
            .map(|caller| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for job in 0..20 {
                        queue.schedule_write(MemoryTarget::new(format!("{caller}-{job}")), move |w| {
                            thread::sleep(Duration::from_millis(2));
                            w.write_i32(caller * 100 + job)
                        });
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        queue.wait_for_drain();
        assert_eq!(queue.pending_count(), 0);
        let stats = queue.stats();
        assert_eq!(stats.scheduled, 160);
        assert_eq!(stats.completed + stats.failed, 160);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn shutdown_state_runs_synchronously() {
        let queue = queue();
        queue.begin_shutdown();
        let target = MemoryTarget::new("final");
        let outcome = queue.schedule_write(target.clone(), |w| w.write_u8(1));

        assert_eq!(outcome, ScheduleOutcome::Synchronous { succeeded: true });
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(target.contents(), Some(vec![1]));
        assert_eq!(queue.stats().synchronous, 1);
    }

    #[test]
    fn crashed_state_runs_synchronously() {
        let queue = queue();
        queue.mark_crashed();
        assert_eq!(queue.state(), ProcessState::Crashed);
        let target = MemoryTarget::new("crash");
        queue.schedule_write(target.clone(), |w| w.write_u8(2));
        assert_eq!(target.contents(), Some(vec![2]));
    }

    #[test]
    fn failed_job_is_removed_and_not_committed() {
        let queue = queue();
        let target = MemoryTarget::new("broken");
        queue.schedule_write(target.clone(), |w| {
            w.write_u8(1)?;
            Err(PersistError::invalid("disk full"))
        });
        queue.wait_for_drain();

        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.stats().failed, 1);
        assert_eq!(target.contents(), None);
    }

    #[test]
    fn panicking_job_does_not_wedge_the_queue() {
        let queue = queue();
        queue.schedule_write(MemoryTarget::new("panics"), |_| -> Result<()> { panic!("bug") });
        assert!(queue.wait_for_drain_timeout(Duration::from_secs(5)));
        assert_eq!(queue.stats().failed, 1);
    }

    #[test]
    fn pending_jobs_are_visible_while_running() {
        let queue = queue();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        queue.schedule_write(MemoryTarget::new("slow"), move |w| {
            let _ = rx.recv_timeout(Duration::from_secs(5));
            w.write_u8(0)
        });

        let jobs = queue.pending_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].label, "slow");
        assert!(!queue.wait_for_drain_timeout(Duration::from_millis(30)));

        tx.send(()).unwrap();
        queue.wait_for_drain();
        assert!(queue.is_idle());
    }
}
