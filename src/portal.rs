//! The per-endpoint scheduler: a shared work queue, the roster of live
//! connections, and the tuning state that decides when the pool grows,
//! pauses, or gives up.

use crate::connection::HostConnection;
use crate::context::PortalContext;
use crate::error::Error;
use crate::op::Op;
use crate::status::Status;
use crate::Result;
use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a queue pop may park before re-checking its predicates.
pub(crate) const QUEUE_WAIT: Duration = Duration::from_secs(1);

/// Mutable portal state, guarded by the portal lock.
///
/// Lock order is strict: when a portal lock and a connection lock are both
/// needed, the portal lock is taken first. In practice almost every section
/// takes only one of the two.
pub(crate) struct PortalState {
    /// Pending operations, oldest at the front. Re-queued in-flight work is
    /// pushed to the front so it drains ahead of fresh submissions.
    pub(crate) que: VecDeque<Arc<Op>>,
    /// Live connections by id. Every entry here is still running; closing
    /// connections remove themselves before they start tearing down.
    pub(crate) roster: HashMap<u64, Arc<HostConnection>>,
    /// Fully-exited connections awaiting a reap sweep.
    pub(crate) closed: Vec<Arc<HostConnection>>,
    pub(crate) n_conn: usize,
    /// Trailing estimate of how many connections the remote end sustains.
    /// Only ever assigned from `n_conn` when a connection dies with work in
    /// flight, so it never exceeds `n_conn`.
    pub(crate) stable_conn: usize,
    pub(crate) sleeping_conn: usize,
    pub(crate) closing_conn: usize,
    pub(crate) idle_conn: usize,
    pub(crate) successful_conn_attempts: u64,
    pub(crate) failed_conn_attempts: u64,
    pub(crate) cmds_processed: u64,
    /// No new connections are started before this instant.
    pub(crate) pause_until: Option<Instant>,
    pub(crate) invalid_host: bool,
    pub(crate) shutdown: bool,
    next_conn_id: u64,
}

impl PortalState {
    /// Complete every queued operation with `status`, emptying the queue.
    pub(crate) fn fail_queued(&mut self, status: Status) {
        if !self.que.is_empty() {
            warn!(count = self.que.len(), %status, "failing queued operations");
        }
        while let Some(op) = self.que.pop_front() {
            op.complete(status);
        }
    }

    fn paused(&self) -> bool {
        self.pause_until.is_some_and(|until| Instant::now() < until)
    }
}

/// State shared between a portal handle and its connections.
pub(crate) struct PortalShared {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) context: Arc<PortalContext>,
    pub(crate) state: Mutex<PortalState>,
    /// Wakes queue poppers and shutdown waiters. Submissions wake one
    /// waiter; state changes broadcast, and every wait re-checks its
    /// predicate with a bounded park so a lost wakeup only costs a beat.
    pub(crate) work: Notify,
}

impl PortalShared {
    pub(crate) fn invalid_host(&self) -> bool {
        self.state.lock().unwrap().invalid_host
    }

    /// Complete everything queued with `status` (used when the endpoint is
    /// known unreachable).
    pub(crate) fn fail_queued(&self, status: Status) {
        self.state.lock().unwrap().fail_queued(status);
    }

    /// Push a previously in-flight operation back to the front of the queue.
    pub(crate) fn requeue_front(&self, op: Arc<Op>) {
        debug!(id = op.id(), host = %self.host, "re-queueing in-flight operation");
        self.state.lock().unwrap().que.push_front(op);
        self.work.notify_one();
    }
}

/// Re-evaluate the pool size and start one connection if warranted.
///
/// Runs on whichever task notices the need: submitters, the periodic tick on
/// each receiver, and closing connections looking for a replacement. Also
/// sweeps the reap list while it holds the lock.
pub(crate) fn check_connections(shared: &Arc<PortalShared>) {
    let mut reaped = Vec::new();
    let spawn_id = {
        let mut st = shared.state.lock().unwrap();
        if st.closing_conn == 0 && !st.closed.is_empty() {
            reaped = std::mem::take(&mut st.closed);
        }

        let wanted = !st.shutdown
            && !st.paused()
            && !st.que.is_empty()
            && st.n_conn < shared.context.config.max_connections
            && (st.n_conn == 0 || st.n_conn < st.stable_conn);
        if wanted {
            st.n_conn += 1;
            st.next_conn_id += 1;
            Some(st.next_conn_id)
        } else {
            None
        }
    };

    if !reaped.is_empty() {
        debug!(count = reaped.len(), host = %shared.host, "reaped connections");
        drop(reaped);
    }

    if let Some(id) = spawn_id {
        info!(host = %shared.host, port = shared.port, conn = id, "starting connection");
        HostConnection::launch(shared, id);
    }
}

/// Handle to one remote endpoint's scheduler.
///
/// A `HostPortal` is a shallow handle over shared state; cloning only bumps
/// a reference count. Producers submit work with [`submit`](Self::submit)
/// and observe completion on the [`Op`] itself.
#[derive(Clone)]
pub struct HostPortal {
    shared: Arc<PortalShared>,
}

/// Point-in-time snapshot of a portal's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortalStats {
    pub n_conn: usize,
    pub stable_conn: usize,
    pub sleeping_conn: usize,
    pub closing_conn: usize,
    pub idle_conn: usize,
    pub successful_conn_attempts: u64,
    pub failed_conn_attempts: u64,
    pub cmds_processed: u64,
    pub queued: usize,
    pub paused: bool,
}

impl HostPortal {
    /// Create a standalone portal for `host:port`.
    ///
    /// Most callers go through [`PortalContext::portal`] instead, which
    /// shares one portal per endpoint.
    pub fn new(context: Arc<PortalContext>, host: impl Into<String>, port: u16) -> Self {
        Self {
            shared: Arc::new(PortalShared {
                host: host.into(),
                port,
                context,
                state: Mutex::new(PortalState {
                    que: VecDeque::new(),
                    roster: HashMap::new(),
                    closed: Vec::new(),
                    n_conn: 0,
                    // The endpoint is assumed to sustain a single persistent
                    // connection until a death with work in flight proves
                    // otherwise.
                    stable_conn: 1,
                    sleeping_conn: 0,
                    closing_conn: 0,
                    idle_conn: 0,
                    successful_conn_attempts: 0,
                    failed_conn_attempts: 0,
                    cmds_processed: 0,
                    pause_until: None,
                    invalid_host: false,
                    shutdown: false,
                    next_conn_id: 0,
                }),
                work: Notify::new(),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Flag the endpoint as unresolvable. Queued and future work completes
    /// with [`Status::InvalidHost`] without any dial attempt.
    pub fn mark_invalid(&self) {
        warn!(host = %self.shared.host, "marking host invalid");
        self.shared.state.lock().unwrap().invalid_host = true;
    }

    /// Enqueue an operation, wake a parked sender, and grow the pool if the
    /// sizing rules call for it.
    ///
    /// Must be called from within a tokio runtime; connection workers are
    /// spawned on it.
    pub fn submit(&self, op: Arc<Op>) -> Result<()> {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.shutdown {
                return Err(Error::PortalClosed);
            }
            debug!(id = op.id(), host = %self.shared.host, depth = st.que.len(), "submit");
            st.que.push_back(op);
        }
        self.shared.work.notify_one();
        check_connections(&self.shared);
        Ok(())
    }

    /// Run the pool-sizing pass by hand.
    pub fn check_connections(&self) {
        check_connections(&self.shared);
    }

    /// Run an operation inline on the caller's task over a dedicated
    /// connection, bypassing the queue and the pipeline.
    ///
    /// The operation is completed before this returns, so the returned
    /// status and [`Op::status`] agree. Callers should check
    /// [`Op::sync_exec_enabled`] first; the flag is the operation author's
    /// declaration that its phases tolerate running back-to-back.
    pub async fn sync_exec(&self, op: &Op) -> Status {
        let shared = &self.shared;
        if shared.invalid_host() {
            op.complete(Status::InvalidHost);
            return Status::InvalidHost;
        }

        let ctx = &shared.context;
        let stream = match ctx
            .transport
            .connect(&shared.host, shared.port, ctx.config.connect_timeout)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                warn!(host = %shared.host, %err, "sync exec could not connect");
                shared.state.lock().unwrap().failed_conn_attempts += 1;
                op.complete(Status::CantConnect);
                return Status::CantConnect;
            }
        };

        let (mut rd, mut wr) = tokio::io::split(stream);
        op.latch_start();
        let mut status = op.send_command(&mut wr).await;
        if status.is_success() {
            status = op.send_phase(&mut wr).await;
        }
        if status.is_success() {
            status = op.recv_phase(&mut rd).await;
        }
        op.mark_end();
        ctx.transport.close(rd.unsplit(wr)).await;

        if status.is_success() {
            self.shared.state.lock().unwrap().cmds_processed += 1;
        }
        op.complete(status);
        status
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> PortalStats {
        let st = self.shared.state.lock().unwrap();
        PortalStats {
            n_conn: st.n_conn,
            stable_conn: st.stable_conn,
            sleeping_conn: st.sleeping_conn,
            closing_conn: st.closing_conn,
            idle_conn: st.idle_conn,
            successful_conn_attempts: st.successful_conn_attempts,
            failed_conn_attempts: st.failed_conn_attempts,
            cmds_processed: st.cmds_processed,
            queued: st.que.len(),
            paused: st.paused(),
        }
    }

    /// Shut the portal down.
    ///
    /// Every connection is asked to drain and both of its workers are woken.
    /// With `quick` set this returns immediately after marking; otherwise it
    /// waits for the pool to empty, fails whatever is still queued (including
    /// work the dying connections re-injected) with [`Status::Error`], and
    /// sweeps the reap list, so that on return every submitted operation has
    /// an observable status.
    pub async fn shutdown(&self, quick: bool) {
        info!(host = %self.shared.host, quick, "shutting portal down");
        let conns: Vec<Arc<HostConnection>> = {
            let mut st = self.shared.state.lock().unwrap();
            st.shutdown = true;
            st.roster.values().cloned().collect()
        };
        for conn in conns {
            conn.request_shutdown();
        }
        self.shared.work.notify_waiters();

        if !quick {
            loop {
                let mut notified = pin!(self.shared.work.notified());
                notified.as_mut().enable();
                {
                    let st = self.shared.state.lock().unwrap();
                    if st.n_conn == 0 && st.closing_conn == 0 {
                        break;
                    }
                }
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(QUEUE_WAIT) => {}
                }
            }
            self.shared.state.lock().unwrap().fail_queued(Status::Error);
        }

        let reaped = std::mem::take(&mut self.shared.state.lock().unwrap().closed);
        if !reaped.is_empty() {
            debug!(count = reaped.len(), host = %self.shared.host, "reaped connections");
        }
    }

    /// Whether two handles point at the same portal.
    pub fn same_portal(&self, other: &HostPortal) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for HostPortal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPortal")
            .field("host", &self.shared.host)
            .field("port", &self.shared.port)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;
    use crate::op::{OpConfig, Protocol};
    use crate::transport::{NetReader, NetStream, NetWriter, Transport};
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// In-memory transport. The far end of each pipe is parked so the
    /// engine's half stays open; `refusing` makes every dial fail.
    struct TestTransport {
        connects: AtomicUsize,
        refuse: bool,
        peers: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl TestTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                refuse: false,
                peers: Mutex::new(Vec::new()),
            })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                refuse: true,
                peers: Mutex::new(Vec::new()),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for TestTransport {
        async fn connect(
            &self,
            _host: &str,
            _port: u16,
            _timeout: Duration,
        ) -> io::Result<NetStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused by test transport",
                ));
            }
            let (local, remote) = tokio::io::duplex(4096);
            self.peers.lock().unwrap().push(remote);
            Ok(Box::new(local))
        }
    }

    /// Shared scoreboard for scripted operations.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        sends_started: AtomicUsize,
        inflight: AtomicUsize,
        peak_inflight: AtomicUsize,
    }

    impl Recorder {
        fn log(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    /// A protocol scripted from the outside: receive statuses are served
    /// from a list (success once the list runs dry), and the scoreboard
    /// records what happened in which order.
    struct Scripted {
        label: usize,
        rec: Arc<Recorder>,
        recv_script: Mutex<std::collections::VecDeque<Status>>,
        /// recv_phase parks until this many send_command calls have begun.
        recv_barrier: Option<usize>,
        /// The first send_command call never returns (the operation's
        /// deadline is expected to cut it short).
        block_first_send: bool,
        send_calls: AtomicUsize,
    }

    impl Scripted {
        fn new(label: usize, rec: &Arc<Recorder>) -> Self {
            Self {
                label,
                rec: rec.clone(),
                recv_script: Mutex::new(std::collections::VecDeque::new()),
                recv_barrier: None,
                block_first_send: false,
                send_calls: AtomicUsize::new(0),
            }
        }

        fn recv(self, statuses: &[Status]) -> Self {
            self.recv_script.lock().unwrap().extend(statuses.iter().copied());
            self
        }

        fn recv_after_sends(mut self, sends: usize) -> Self {
            self.recv_barrier = Some(sends);
            self
        }

        fn block_first_send(mut self) -> Self {
            self.block_first_send = true;
            self
        }

        fn into_op(self, cfg: OpConfig) -> Arc<Op> {
            Arc::new(Op::with_config(self, cfg))
        }
    }

    #[async_trait]
    impl Protocol for Scripted {
        async fn send_command(&self, _wire: &mut NetWriter) -> Status {
            let call = self.send_calls.fetch_add(1, Ordering::SeqCst);
            self.rec.sends_started.fetch_add(1, Ordering::SeqCst);
            if self.block_first_send && call == 0 {
                std::future::pending().await
            }
            Status::Success
        }

        async fn send_phase(&self, _wire: &mut NetWriter) -> Status {
            self.rec.log(format!("send {}", self.label));
            let now = self.rec.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            self.rec.peak_inflight.fetch_max(now, Ordering::SeqCst);
            Status::Success
        }

        async fn recv_phase(&self, _wire: &mut NetReader) -> Status {
            if let Some(target) = self.recv_barrier {
                while self.rec.sends_started.load(Ordering::SeqCst) < target {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            self.rec.log(format!("recv {}", self.label));
            self.rec.inflight.fetch_sub(1, Ordering::SeqCst);
            let scripted = self.recv_script.lock().unwrap().pop_front();
            scripted.unwrap_or(Status::Success)
        }
    }

    fn quick_config() -> ContextConfig {
        ContextConfig {
            min_idle: Duration::from_secs(5),
            connect_timeout: Duration::from_millis(100),
            ..ContextConfig::default()
        }
    }

    fn portal_over(transport: Arc<dyn Transport>, config: ContextConfig) -> HostPortal {
        let ctx = crate::context::PortalContext::new(transport, config);
        HostPortal::new(ctx, "depot-1", 6714)
    }

    /// Poll the stats until `pred` holds; virtual time makes this cheap.
    async fn wait_until(portal: &HostPortal, mut pred: impl FnMut(PortalStats) -> bool) {
        for _ in 0..20_000 {
            if pred(portal.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition never reached: {:?}", portal.stats());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_happy_path() {
        let transport = TestTransport::new();
        let config = ContextConfig {
            max_workload: 4,
            ..quick_config()
        };
        let portal = portal_over(transport.clone(), config);
        let rec = Arc::new(Recorder::default());

        let ops: Vec<Arc<Op>> = (1..=10)
            .map(|n| Scripted::new(n, &rec).into_op(OpConfig::default()))
            .collect();
        for op in &ops {
            portal.submit(op.clone()).unwrap();
        }

        for op in &ops {
            assert_eq!(op.completed().await, Status::Success);
            // A clean round trip has a running clock and a later end mark.
            let started = op.started_at().expect("clock latched");
            let finished = op.finished_at().expect("end marked");
            assert!(finished >= started);
        }

        let stats = portal.stats();
        assert_eq!(stats.cmds_processed, 10);
        assert_eq!(stats.successful_conn_attempts, 1);
        assert_eq!(stats.failed_conn_attempts, 0);
        assert_eq!(transport.connects(), 1);
        // Backpressure keeps the pipeline bounded by max_workload.
        assert!(rec.peak_inflight.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_interleaves_strictly() {
        let transport = TestTransport::new();
        let config = ContextConfig {
            max_workload: 1,
            ..quick_config()
        };
        let portal = portal_over(transport, config);
        let rec = Arc::new(Recorder::default());

        let ops: Vec<Arc<Op>> = (1..=5)
            .map(|n| Scripted::new(n, &rec).into_op(OpConfig::default()))
            .collect();
        for op in &ops {
            portal.submit(op.clone()).unwrap();
        }
        for op in &ops {
            assert_eq!(op.completed().await, Status::Success);
        }

        let expected: Vec<String> = (1..=5)
            .flat_map(|n| [format!("send {n}"), format!("recv {n}")])
            .collect();
        assert_eq!(rec.events(), expected);
        assert_eq!(rec.peak_inflight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_connect_failure_fails_queue() {
        let transport = TestTransport::refusing();
        let portal = portal_over(transport.clone(), quick_config());
        let rec = Arc::new(Recorder::default());

        let ops: Vec<Arc<Op>> = (1..=3)
            .map(|n| Scripted::new(n, &rec).into_op(OpConfig::default()))
            .collect();
        for op in &ops {
            portal.submit(op.clone()).unwrap();
        }
        for op in &ops {
            assert_eq!(op.completed().await, Status::CantConnect);
        }

        wait_until(&portal, |s| s.n_conn == 0 && s.closing_conn == 0).await;
        let stats = portal.stats();
        assert_eq!(stats.failed_conn_attempts, 1);
        assert_eq!(stats.cmds_processed, 0);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_pipeline_death_requeues_in_order() {
        let transport = TestTransport::new();
        let config = ContextConfig {
            max_workload: 100,
            ..quick_config()
        };
        let portal = portal_over(transport, config);
        let rec = Arc::new(Recorder::default());

        // Five operations make it onto the wire; the first response is held
        // back until a sixth is mid-send, then the third response reports a
        // dead socket.
        let op1 = Scripted::new(1, &rec)
            .recv_after_sends(6)
            .into_op(OpConfig::default());
        let op2 = Scripted::new(2, &rec).into_op(OpConfig::default());
        let op3 = Scripted::new(3, &rec)
            .recv(&[Status::Dead, Status::Success])
            .into_op(OpConfig::default());
        let op4 = Scripted::new(4, &rec).into_op(OpConfig::default());
        let op5 = Scripted::new(5, &rec).into_op(OpConfig::default());
        let op6 = Scripted::new(6, &rec).block_first_send().into_op(OpConfig {
            timeout: Duration::from_millis(200),
            ..OpConfig::default()
        });

        let ops = [op1, op2, op3, op4, op5, op6];
        let stable_before = portal.stats().stable_conn;
        for op in &ops {
            portal.submit(op.clone()).unwrap();
        }
        for op in &ops {
            assert_eq!(op.completed().await, Status::Success);
        }

        // The victim was charged exactly once for the lost connection.
        assert_eq!(ops[2].retries_left(), 1);

        // Stranded work went back oldest-first: the pipeline remainder, the
        // harvested victim, then the op the sender had in hand.
        let resends: Vec<String> = rec
            .events()
            .iter()
            .filter(|e| e.starts_with("send"))
            .skip(5)
            .cloned()
            .collect();
        assert_eq!(resends, ["send 4", "send 5", "send 3", "send 6"]);

        let stats = portal.stats();
        assert_eq!(stats.cmds_processed, 6);
        assert!(stats.stable_conn < stable_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_retires() {
        let transport = TestTransport::new();
        let config = ContextConfig {
            min_idle: Duration::from_millis(100),
            ..quick_config()
        };
        let portal = portal_over(transport, config);
        let rec = Arc::new(Recorder::default());

        let op = Scripted::new(1, &rec).into_op(OpConfig::default());
        portal.submit(op.clone()).unwrap();
        assert_eq!(op.completed().await, Status::Success);

        wait_until(&portal, |s| s.n_conn == 0 && s.closing_conn == 0).await;
        let stats = portal.stats();
        assert_eq!(stats.cmds_processed, 1);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_host_fails_without_dialing() {
        let transport = TestTransport::new();
        let portal = portal_over(transport.clone(), quick_config());
        let rec = Arc::new(Recorder::default());

        portal.mark_invalid();
        let ops: Vec<Arc<Op>> = (1..=4)
            .map(|n| Scripted::new(n, &rec).into_op(OpConfig::default()))
            .collect();
        for op in &ops {
            portal.submit(op.clone()).unwrap();
        }
        for op in &ops {
            assert_eq!(op.completed().await, Status::InvalidHost);
        }
        assert_eq!(transport.connects(), 0);

        wait_until(&portal, |s| s.n_conn == 0 && s.closing_conn == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_until_budget_runs_out() {
        let transport = TestTransport::new();
        let portal = portal_over(transport, quick_config());
        let rec = Arc::new(Recorder::default());

        // The response never arrives; each connection charges the operation
        // on the way down, so the budget of two covers one full reconnect.
        let op = Scripted::new(1, &rec)
            .recv(&[Status::Timeout, Status::Timeout])
            .into_op(OpConfig {
                timeout: Duration::from_millis(50),
                retry_limit: 2,
                ..OpConfig::default()
            });
        portal.submit(op.clone()).unwrap();

        assert_eq!(op.completed().await, Status::Timeout);
        assert!(op.retries_left() <= 0);

        wait_until(&portal, |s| s.n_conn == 0 && s.closing_conn == 0).await;
        let stats = portal.stats();
        assert_eq!(stats.successful_conn_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_status_pauses_then_succeeds() {
        let transport = TestTransport::new();
        let portal = portal_over(transport.clone(), quick_config());
        let rec = Arc::new(Recorder::default());

        let op = Scripted::new(1, &rec)
            .recv(&[Status::Retry, Status::Success])
            .into_op(OpConfig {
                retry_wait: Duration::from_millis(500),
                ..OpConfig::default()
            });
        portal.submit(op.clone()).unwrap();

        assert_eq!(op.completed().await, Status::Success);
        assert_eq!(op.retries_left(), 1);
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_completes_every_operation() {
        let transport = TestTransport::new();
        let portal = portal_over(transport, quick_config());
        let rec = Arc::new(Recorder::default());

        // Responses that never arrive keep all three in flight.
        let ops: Vec<Arc<Op>> = (1..=3)
            .map(|n| {
                Scripted::new(n, &rec)
                    .recv_after_sends(usize::MAX)
                    .into_op(OpConfig {
                        timeout: Duration::from_secs(30),
                        ..OpConfig::default()
                    })
            })
            .collect();
        for op in &ops {
            portal.submit(op.clone()).unwrap();
        }
        // Let the workers put all three on the wire before pulling the plug.
        tokio::time::sleep(Duration::from_millis(20)).await;

        portal.shutdown(false).await;

        let stats = portal.stats();
        assert_eq!(stats.n_conn, 0);
        assert_eq!(stats.closing_conn, 0);
        assert_eq!(stats.queued, 0);
        for op in &ops {
            assert!(op.status().is_some(), "op {} left incomplete", op.id());
        }
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let transport = TestTransport::new();
        let portal = portal_over(transport, quick_config());
        portal.shutdown(false).await;

        let rec = Arc::new(Recorder::default());
        let op = Scripted::new(1, &rec).into_op(OpConfig::default());
        assert!(matches!(
            portal.submit(op),
            Err(crate::Error::PortalClosed)
        ));
    }

    #[tokio::test]
    async fn test_sync_exec_runs_inline() {
        let transport = TestTransport::new();
        let portal = portal_over(transport.clone(), quick_config());
        let rec = Arc::new(Recorder::default());

        let op = Scripted::new(1, &rec).into_op(OpConfig {
            sync_exec: true,
            ..OpConfig::default()
        });
        assert!(op.sync_exec_enabled());

        assert_eq!(portal.sync_exec(&op).await, Status::Success);
        assert_eq!(op.status(), Some(Status::Success));
        assert_eq!(transport.connects(), 1);
        assert_eq!(portal.stats().cmds_processed, 1);
        assert_eq!(rec.events(), ["send 1", "recv 1"]);
    }

    /// A scripted byte-level exchange: the mock stream asserts the exact
    /// bytes the send phase writes and serves the scripted response to the
    /// receive phase.
    #[tokio::test(start_paused = true)]
    async fn test_scripted_wire_exchange() {
        struct MockWireTransport;

        #[async_trait]
        impl Transport for MockWireTransport {
            async fn connect(
                &self,
                _host: &str,
                _port: u16,
                _timeout: Duration,
            ) -> io::Result<NetStream> {
                // The mock panics on any write that deviates from the script.
                let mock = tokio_test::io::Builder::new()
                    .write(b"ping\n")
                    .read(b"pong\n")
                    .build();
                Ok(Box::new(mock))
            }
        }

        struct PingPong;

        #[async_trait]
        impl Protocol for PingPong {
            async fn send_phase(&self, wire: &mut NetWriter) -> Status {
                match wire.write_all(b"ping\n").await {
                    Ok(()) => Status::Success,
                    Err(_) => Status::Dead,
                }
            }

            async fn recv_phase(&self, wire: &mut NetReader) -> Status {
                let mut buf = [0u8; 5];
                match wire.read_exact(&mut buf).await {
                    Ok(_) if &buf == b"pong\n" => Status::Success,
                    Ok(_) => Status::Error,
                    Err(_) => Status::Dead,
                }
            }
        }

        let portal = portal_over(Arc::new(MockWireTransport), quick_config());
        let op = Arc::new(Op::new(PingPong));
        portal.submit(op.clone()).unwrap();

        assert_eq!(op.completed().await, Status::Success);
        assert_eq!(portal.stats().cmds_processed, 1);
    }

    /// End-to-end over real sockets: a trivial line-echo protocol against an
    /// in-process TCP echo peer.
    #[tokio::test]
    async fn test_echo_over_tcp() {
        use tokio::net::TcpListener;

        struct EchoLine;

        #[async_trait]
        impl Protocol for EchoLine {
            async fn send_phase(&self, wire: &mut NetWriter) -> Status {
                match wire.write_all(b"ping\n").await {
                    Ok(()) => Status::Success,
                    Err(_) => Status::Dead,
                }
            }

            async fn recv_phase(&self, wire: &mut NetReader) -> Status {
                let mut buf = [0u8; 5];
                match wire.read_exact(&mut buf).await {
                    Ok(_) if &buf == b"ping\n" => Status::Success,
                    Ok(_) => Status::Error,
                    Err(_) => Status::Dead,
                }
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = socket.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });

        let ctx = crate::context::PortalContext::new(
            Arc::new(crate::transport::TcpTransport),
            quick_config(),
        );
        let portal = ctx.portal(&addr.ip().to_string(), addr.port());

        let ops: Vec<Arc<Op>> = (0..3).map(|_| Arc::new(Op::new(EchoLine))).collect();
        for op in &ops {
            portal.submit(op.clone()).unwrap();
        }
        for op in &ops {
            assert_eq!(op.completed().await, Status::Success);
        }
        assert_eq!(portal.stats().cmds_processed, 3);

        ctx.shutdown_all(false).await;
        ctx.wait_idle().await;
        assert_eq!(ctx.running_tasks(), 0);
    }
}
