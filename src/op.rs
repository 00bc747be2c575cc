//! The unit of work: an asynchronous operation with user-supplied
//! send/receive callbacks and a one-shot completion latch.

use crate::status::Status;
use crate::transport::{NetReader, NetWriter};
use async_trait::async_trait;
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Process-wide operation id counter.
static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// The three wire phases of an operation.
///
/// The engine owns scheduling, pipelining, and retries; the protocol owns
/// the bytes. `send_command` and `send_phase` run on the connection's sender
/// with the write half of the stream, while `recv_phase` runs concurrently
/// on the receiver with the read half. Each phase reports back with a
/// [`Status`]; every method defaults to an immediate [`Status::Success`] so
/// implementations only write the phases their protocol actually has.
///
/// Phases for *different* operations on the same connection overlap (the
/// sender may be three commands ahead of the receiver), so implementations
/// must not assume they are alone on the wire beyond their own half.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Issue the command header. A failure here leaves nothing on the wire.
    async fn send_command(&self, _wire: &mut NetWriter) -> Status {
        Status::Success
    }

    /// Write the request body.
    async fn send_phase(&self, _wire: &mut NetWriter) -> Status {
        Status::Success
    }

    /// Read and decode the response.
    async fn recv_phase(&self, _wire: &mut NetReader) -> Status {
        Status::Success
    }
}

/// Knobs for a single operation.
///
/// Plain fields with stock defaults; override with struct update syntax:
///
/// ```
/// use hostportal::OpConfig;
/// use std::time::Duration;
///
/// let cfg = OpConfig {
///     workload: 4,
///     timeout: Duration::from_secs(5),
///     ..OpConfig::default()
/// };
/// ```
#[derive(Debug, Clone, Copy)]
pub struct OpConfig {
    /// Cost units this operation occupies on a connection while in flight.
    pub workload: u64,
    /// Deadline applied to each individual phase.
    pub timeout: Duration,
    /// How many connection failures this operation survives before the
    /// engine stops re-queueing it.
    pub retry_limit: i64,
    /// How long the portal pauses before reconnecting after the peer asks
    /// for a retry.
    pub retry_wait: Duration,
    /// Allow this operation to run on the caller's task over a dedicated
    /// connection instead of the shared pipeline.
    pub sync_exec: bool,
}

impl Default for OpConfig {
    fn default() -> Self {
        Self {
            workload: 1,
            timeout: Duration::from_secs(30),
            retry_limit: 2,
            retry_wait: Duration::from_secs(1),
            sync_exec: false,
        }
    }
}

/// Start/end marks for one operation, latched at most once.
///
/// Values are microseconds since the operation was created, offset by one so
/// that zero means "unset". The receiver and the sender race to start the
/// clock when an operation reaches the head of the pipeline; the
/// compare-and-swap keeps the earliest mark.
#[derive(Debug, Default)]
struct OpTimer {
    started: AtomicU64,
    ended: AtomicU64,
}

impl OpTimer {
    fn latch_start(&self, since_created: Duration) {
        let mark = since_created.as_micros() as u64 + 1;
        let _ = self
            .started
            .compare_exchange(0, mark, Ordering::AcqRel, Ordering::Acquire);
    }

    fn mark_end(&self, since_created: Duration) {
        self.ended
            .store(since_created.as_micros() as u64 + 1, Ordering::Release);
    }

    fn get(mark: &AtomicU64) -> Option<Duration> {
        match mark.load(Ordering::Acquire) {
            0 => None,
            v => Some(Duration::from_micros(v - 1)),
        }
    }
}

/// One-shot completion latch.
///
/// The status is guarded by a `std::sync::Mutex` (the critical section is a
/// read or a write of an `Option`, never an await), with a `Notify` to wake
/// waiters when the status lands.
#[derive(Debug, Default)]
struct Completion {
    status: Mutex<Option<Status>>,
    notify: Notify,
}

/// A single submitted operation.
///
/// Ops are shared between the producer and the engine as `Arc<Op>`: the
/// producer holds its clone to observe completion, the engine's queue and
/// pipelines hold theirs while the work is in flight. Once
/// [`completed`](Op::completed) resolves the engine no longer touches the
/// operation.
pub struct Op {
    id: u64,
    proto: Box<dyn Protocol>,
    workload: u64,
    timeout: Duration,
    retry_wait: Duration,
    sync_exec: bool,
    retries: AtomicI64,
    created: Instant,
    timer: OpTimer,
    done: Completion,
}

impl Op {
    /// Wrap a protocol with the stock [`OpConfig`].
    pub fn new(proto: impl Protocol + 'static) -> Self {
        Self::with_config(proto, OpConfig::default())
    }

    /// Wrap a protocol with explicit knobs.
    pub fn with_config(proto: impl Protocol + 'static, cfg: OpConfig) -> Self {
        Self {
            id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
            proto: Box::new(proto),
            workload: cfg.workload,
            timeout: cfg.timeout,
            retry_wait: cfg.retry_wait,
            sync_exec: cfg.sync_exec,
            retries: AtomicI64::new(cfg.retry_limit),
            created: Instant::now(),
            timer: OpTimer::default(),
            done: Completion::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn workload(&self) -> u64 {
        self.workload
    }

    pub fn retry_wait(&self) -> Duration {
        self.retry_wait
    }

    /// Remaining connection-failure budget. May go negative: an operation in
    /// flight on a dying connection is charged for the failure even when its
    /// budget is already spent.
    pub fn retries_left(&self) -> i64 {
        self.retries.load(Ordering::Acquire)
    }

    /// Whether [`sync_exec`](crate::HostPortal::sync_exec) may run this
    /// operation on the caller's task.
    pub fn sync_exec_enabled(&self) -> bool {
        self.sync_exec
    }

    /// When the operation reached the head of a pipeline, if it has.
    pub fn started_at(&self) -> Option<Instant> {
        OpTimer::get(&self.timer.started).map(|d| self.created + d)
    }

    /// When the response phase finished, if it has.
    pub fn finished_at(&self) -> Option<Instant> {
        OpTimer::get(&self.timer.ended).map(|d| self.created + d)
    }

    /// The completion status, if the operation has completed.
    pub fn status(&self) -> Option<Status> {
        *self.done.status.lock().unwrap()
    }

    /// Wait until the operation completes and return its status.
    pub async fn completed(&self) -> Status {
        loop {
            // Register for the wakeup *before* checking, so a completion
            // landing between the check and the await is not lost.
            let mut notified = pin!(self.done.notify.notified());
            notified.as_mut().enable();
            if let Some(status) = self.status() {
                return status;
            }
            notified.await;
        }
    }

    pub(crate) fn charge_retry(&self) {
        self.retries.fetch_sub(1, Ordering::AcqRel);
    }

    /// Start the clock if nobody has yet.
    pub(crate) fn latch_start(&self) {
        self.timer.latch_start(self.created.elapsed());
    }

    pub(crate) fn mark_end(&self) {
        self.timer.mark_end(self.created.elapsed());
    }

    /// Complete the operation exactly once. Returns `false` (and changes
    /// nothing) if a status already landed.
    pub(crate) fn complete(&self, status: Status) -> bool {
        {
            let mut slot = self.done.status.lock().unwrap();
            if slot.is_some() {
                return false;
            }
            *slot = Some(status);
        }
        self.done.notify.notify_waiters();
        true
    }

    /// Run the command phase under the operation's deadline.
    pub(crate) async fn send_command(&self, wire: &mut NetWriter) -> Status {
        run_phase(self.timeout, self.proto.send_command(wire)).await
    }

    /// Run the request-body phase under the operation's deadline.
    pub(crate) async fn send_phase(&self, wire: &mut NetWriter) -> Status {
        run_phase(self.timeout, self.proto.send_phase(wire)).await
    }

    /// Run the response phase under the operation's deadline.
    pub(crate) async fn recv_phase(&self, wire: &mut NetReader) -> Status {
        run_phase(self.timeout, self.proto.recv_phase(wire)).await
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("id", &self.id)
            .field("workload", &self.workload)
            .field("retries", &self.retries_left())
            .field("status", &self.status())
            .finish()
    }
}

/// An elapsed deadline is indistinguishable from a peer that stopped
/// answering, so it maps to [`Status::Timeout`].
async fn run_phase<F>(limit: Duration, phase: F) -> Status
where
    F: std::future::Future<Output = Status>,
{
    match tokio::time::timeout(limit, phase).await {
        Ok(status) => status,
        Err(_) => Status::Timeout,
    }
}
