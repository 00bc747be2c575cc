//! One pooled connection: a sender task and a receiver task cooperating
//! over a shared pipeline.
//!
//! The sender pops operations off the portal queue and writes their request
//! phases; the receiver concurrently reads response phases for operations
//! sent earlier. The pair shares one mutex and two wakeup channels. Neither
//! task ever performs I/O while holding a lock, and every condvar-style wait
//! is bounded and re-checks its predicate on wake, so a lost wakeup costs at
//! most one beat of [`QUEUE_WAIT`].

use crate::op::Op;
use crate::portal::{check_connections, PortalShared, QUEUE_WAIT};
use crate::status::Status;
use crate::transport::{NetReader, NetWriter};
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Whether (and how) a connection has been asked to wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownRequest {
    No,
    /// Exit once the pipeline is empty.
    Drain,
    /// The sender pushed a final operation on its way out; the receiver
    /// downgrades this to `Drain` after one more harvesting pass.
    DrainAfterLast,
}

/// Mutable connection state, guarded by the connection lock.
struct ConnState {
    /// Operations whose request phase is on the wire but whose response has
    /// not been read. Sent order front-to-back; the receiver pops the front.
    pending: VecDeque<Arc<Op>>,
    /// The operation the sender is currently writing, if any. Kept here so
    /// a dying connection can re-queue it.
    curr_op: Option<Arc<Op>>,
    curr_workload: u64,
    last_used: Instant,
    /// Operations completed on this connection.
    cmd_count: u64,
    /// The portal's stable-connection estimate when this connection joined.
    /// Zero means the endpoint is degraded and sockets are used one-shot.
    start_stable: usize,
    recv_up: bool,
    connect_failed: bool,
    shutdown: ShutdownRequest,
    /// Parked read half, handed from the sender (who dials) to the receiver.
    reader: Option<NetReader>,
    /// Parked write half, handed back by the sender for the close.
    writer: Option<NetWriter>,
    send_task: Option<JoinHandle<()>>,
}

/// One socket plus its sender/receiver pair.
pub(crate) struct HostConnection {
    id: u64,
    portal: Arc<PortalShared>,
    state: Mutex<ConnState>,
    /// Wakes the sender: backpressure released, receiver up, or shutdown.
    send_cond: Notify,
    /// Wakes the receiver: work pushed onto the pipeline, or shutdown.
    recv_cond: Notify,
}

impl HostConnection {
    /// Spawn a connection's worker pair. The caller has already counted the
    /// connection in the portal's `n_conn`.
    pub(crate) fn launch(portal: &Arc<PortalShared>, id: u64) {
        let hc = Arc::new(HostConnection {
            id,
            portal: portal.clone(),
            state: Mutex::new(ConnState {
                pending: VecDeque::new(),
                curr_op: None,
                curr_workload: 0,
                last_used: Instant::now(),
                cmd_count: 0,
                start_stable: 0,
                recv_up: false,
                connect_failed: false,
                shutdown: ShutdownRequest::No,
                reader: None,
                writer: None,
                send_task: None,
            }),
            send_cond: Notify::new(),
            recv_cond: Notify::new(),
        });

        let tasks = &portal.context.tasks;
        tasks.started();
        tasks.started();

        let send_task = tokio::spawn(run_sender(hc.clone()));
        hc.state.lock().unwrap().send_task = Some(send_task);
        tokio::spawn(run_receiver(hc));
    }

    /// Ask both workers to wind down. They exit once their current phase
    /// callback returns.
    pub(crate) fn request_shutdown(&self) {
        {
            let mut st = self.state.lock().unwrap();
            st.shutdown = ShutdownRequest::Drain;
        }
        self.send_cond.notify_waiters();
        self.recv_cond.notify_waiters();
    }
}

#[tracing::instrument(skip_all, fields(conn = hc.id, host = %hc.portal.host))]
async fn run_sender(hc: Arc<HostConnection>) {
    sender_main(&hc).await;
    hc.portal.context.tasks.finished();
}

async fn sender_main(hc: &Arc<HostConnection>) {
    let portal = &hc.portal;
    let ctx = &portal.context;

    if wait_for_receiver(hc).await {
        // Dial, unless the host is known to be bogus, in which case the
        // queue is failed wholesale and the connection just winds down.
        let mut connect_failed = false;
        let mut writer = None;
        if portal.invalid_host() {
            portal.fail_queued(Status::InvalidHost);
            connect_failed = true;
        } else {
            match ctx
                .transport
                .connect(&portal.host, portal.port, ctx.config.connect_timeout)
                .await
            {
                Ok(stream) => {
                    let (rd, wr) = tokio::io::split(stream);
                    writer = Some(wr);
                    hc.state.lock().unwrap().reader = Some(rd);
                }
                Err(err) => {
                    warn!(port = portal.port, %err, "connect failed");
                    connect_failed = true;
                }
            }
        }

        // Join the roster and snapshot the stability estimate.
        {
            let mut pst = portal.state.lock().unwrap();
            if connect_failed {
                pst.failed_conn_attempts += 1;
            } else {
                pst.successful_conn_attempts += 1;
                pst.failed_conn_attempts = 0;
            }
            pst.roster.insert(hc.id, hc.clone());
            let stable = pst.stable_conn;
            drop(pst);

            let mut st = hc.state.lock().unwrap();
            st.start_stable = stable;
            st.connect_failed = connect_failed;
        }

        if let Some(mut wr) = writer {
            info!("connection up");
            let finished = sender_loop(hc, &mut wr).await;
            debug!(%finished, "sender loop exited");
            // Park the write half so the receiver can close the stream.
            hc.state.lock().unwrap().writer = Some(wr);
        }
    }

    // Hand off to the receiver, which owns the teardown.
    {
        let mut st = hc.state.lock().unwrap();
        st.shutdown = if st.pending.is_empty() {
            ShutdownRequest::Drain
        } else {
            ShutdownRequest::DrainAfterLast
        };
    }
    hc.recv_cond.notify_one();
    hc.send_cond.notify_waiters();
}

/// Block until the receiver reports up. Returns `false` if a shutdown
/// request lands first, in which case the sender exits without dialing.
async fn wait_for_receiver(hc: &HostConnection) -> bool {
    loop {
        let mut notified = pin!(hc.send_cond.notified());
        notified.as_mut().enable();
        {
            let st = hc.state.lock().unwrap();
            if st.recv_up {
                return true;
            }
            if st.shutdown != ShutdownRequest::No {
                debug!("shutdown before receiver came up");
                return false;
            }
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(QUEUE_WAIT) => {}
        }
    }
}

/// The sender's main loop: pop, write, push onto the pipeline, repeat.
/// Returns the status that ended the loop.
async fn sender_loop(hc: &Arc<HostConnection>, wr: &mut NetWriter) -> Status {
    let portal = &hc.portal;
    let ctx = &portal.context;
    let mut idle = false;
    let mut finished = Status::Success;

    while finished.is_success() {
        // Backpressure: park while the pipeline carries a full workload.
        loop {
            let mut notified = pin!(hc.send_cond.notified());
            notified.as_mut().enable();
            {
                let st = hc.state.lock().unwrap();
                if st.curr_workload < ctx.config.max_workload
                    || st.shutdown != ShutdownRequest::No
                {
                    break;
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(QUEUE_WAIT) => {}
            }
        }

        // Pop the next operation off the portal queue.
        let mut portal_down = false;
        let popped = {
            let mut pst = portal.state.lock().unwrap();
            if pst.shutdown {
                portal_down = true;
                None
            } else {
                let popped = pst.que.pop_front();
                match (&popped, idle) {
                    (Some(_), true) => {
                        idle = false;
                        pst.idle_conn = pst.idle_conn.saturating_sub(1);
                    }
                    (None, false) => {
                        idle = true;
                        pst.idle_conn += 1;
                    }
                    _ => {}
                }
                popped
            }
        };

        if portal_down {
            let mut st = hc.state.lock().unwrap();
            if st.shutdown == ShutdownRequest::No {
                st.shutdown = ShutdownRequest::Drain;
            }
        }

        match popped {
            Some(op) => {
                {
                    let mut st = hc.state.lock().unwrap();
                    if st.pending.is_empty() {
                        op.latch_start();
                    }
                    st.curr_op = Some(op.clone());
                }

                debug!(id = op.id(), "send command");
                finished = op.send_command(wr).await;
                if finished.is_success() {
                    {
                        let mut st = hc.state.lock().unwrap();
                        st.last_used = Instant::now();
                        st.curr_workload += op.workload();
                        if st.pending.is_empty() {
                            op.latch_start();
                        }
                    }

                    finished = op.send_phase(wr).await;
                    // A failed send still goes onto the pipeline: the
                    // receiver has to harvest the status for it.
                    {
                        let mut st = hc.state.lock().unwrap();
                        st.last_used = Instant::now();
                        st.pending.push_back(op);
                        st.curr_op = None;
                    }
                    hc.recv_cond.notify_one();
                }
            }
            None if portal_down => {}
            None => {
                // Nothing queued; park for a submission or a timeout.
                let mut notified = pin!(portal.work.notified());
                notified.as_mut().enable();
                let empty = portal.state.lock().unwrap().que.is_empty();
                if empty {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(QUEUE_WAIT) => {}
                    }
                }
            }
        }

        // Idle retirement and the one-shot-socket policy.
        {
            let mut st = hc.state.lock().unwrap();
            if st.pending.is_empty() {
                let quiet = st.last_used.elapsed();
                if quiet >= ctx.config.min_idle && st.curr_op.is_none() {
                    info!(?quiet, "idle too long, retiring");
                    st.shutdown = ShutdownRequest::Drain;
                }
            } else if st.start_stable == 0 {
                debug!("degraded endpoint, one-shot socket");
                st.shutdown = ShutdownRequest::Drain;
            }
            if st.shutdown != ShutdownRequest::No && finished.is_success() {
                finished = Status::Error;
            }
        }
    }

    if idle {
        let mut pst = portal.state.lock().unwrap();
        pst.idle_conn = pst.idle_conn.saturating_sub(1);
    }

    finished
}

#[tracing::instrument(skip_all, fields(conn = hc.id, host = %hc.portal.host))]
async fn run_receiver(hc: Arc<HostConnection>) {
    receiver_main(&hc).await;
    hc.portal.context.tasks.finished();
}

async fn receiver_main(hc: &Arc<HostConnection>) {
    let portal = &hc.portal;
    let ctx = &portal.context;

    // Commands completed portal-wide before this connection; consulted at
    // teardown to decide whether a dial failure should fail the queue.
    let baseline = portal.state.lock().unwrap().cmds_processed;

    let mut reader: Option<NetReader> = None;
    let mut first = true;
    let mut finished = false;
    // The operation most recently harvested with a retriable failure; it is
    // re-queued (and charged) during teardown rather than completed here.
    let mut recv_op: Option<Arc<Op>> = None;
    let mut pause = Duration::ZERO;
    let mut next_check = Instant::now() + ctx.config.check_connection_interval;

    while !finished {
        let front = {
            let st = hc.state.lock().unwrap();
            st.pending.front().cloned()
        };

        match front {
            Some(op) => {
                if reader.is_none() {
                    reader = hc.state.lock().unwrap().reader.take();
                }
                let Some(rd) = reader.as_mut() else {
                    // An operation can only reach the pipeline after a
                    // successful dial, so the read half must exist.
                    error!(id = op.id(), "pipeline op without a stream");
                    break;
                };

                op.latch_start();
                let status = op.recv_phase(rd).await;
                op.mark_end();
                debug!(id = op.id(), %status, "recv phase done");

                {
                    let mut st = hc.state.lock().unwrap();
                    st.last_used = Instant::now();
                    st.curr_workload = st.curr_workload.saturating_sub(op.workload());
                    st.pending.pop_front();
                }
                hc.send_cond.notify_one();

                recv_op = Some(op.clone());
                match status {
                    Status::Retry if op.retries_left() > 0 => {
                        finished = true;
                        pause = op.retry_wait();
                        debug!(id = op.id(), "peer asked for a retry, retiring connection");
                    }
                    Status::Dead if op.retries_left() > 0 => {
                        finished = true;
                        debug!(id = op.id(), "socket died mid-exchange, retiring connection");
                    }
                    Status::Timeout if op.retries_left() > 0 => {
                        op.charge_retry();
                        finished = true;
                        debug!(
                            id = op.id(),
                            retries = op.retries_left(),
                            "response timed out, retiring connection"
                        );
                    }
                    status => {
                        op.complete(status);
                        recv_op = None;
                        hc.state.lock().unwrap().cmd_count += 1;
                        portal.state.lock().unwrap().cmds_processed += 1;
                    }
                }
            }
            None => {
                let mut wait = false;
                {
                    let mut st = hc.state.lock().unwrap();
                    // The sender may be mid-send of the head-of-line
                    // operation; make sure its clock is running.
                    if let Some(curr) = &st.curr_op {
                        curr.latch_start();
                    }
                    match st.shutdown {
                        ShutdownRequest::DrainAfterLast => {
                            st.shutdown = ShutdownRequest::Drain;
                        }
                        ShutdownRequest::Drain => finished = true,
                        ShutdownRequest::No => wait = true,
                    }
                }
                if wait {
                    if first {
                        first = false;
                        hc.state.lock().unwrap().recv_up = true;
                        hc.send_cond.notify_waiters();
                    }
                    tokio::select! {
                        _ = hc.recv_cond.notified() => {}
                        _ = tokio::time::sleep(QUEUE_WAIT) => {}
                    }
                }
            }
        }

        if Instant::now() >= next_check {
            check_connections(portal);
            next_check = Instant::now() + ctx.config.check_connection_interval;
        }
    }

    teardown(hc, baseline, reader, recv_op, pause).await;
}

/// Wind the connection down: stop the sender, close the wire, re-queue or
/// fail the in-flight work, update the portal's tuning state, and queue
/// this connection for reaping.
async fn teardown(
    hc: &Arc<HostConnection>,
    baseline: u64,
    reader: Option<NetReader>,
    recv_op: Option<Arc<Op>>,
    mut pause: Duration,
) {
    let portal = &hc.portal;
    let ctx = &portal.context;

    {
        let mut st = hc.state.lock().unwrap();
        st.curr_workload = 0;
        st.shutdown = ShutdownRequest::Drain;
    }
    portal.work.notify_waiters();
    hc.send_cond.notify_waiters();

    // The sender exits once its current phase hits the operation deadline,
    // so this join is bounded.
    let send_task = hc.state.lock().unwrap().send_task.take();
    if let Some(task) = send_task {
        if let Err(err) = task.await {
            error!(%err, "sender task failed");
        }
    }

    // Reunite the halves and let the transport dispose of the stream.
    let (parked_rd, parked_wr) = {
        let mut st = hc.state.lock().unwrap();
        (st.reader.take(), st.writer.take())
    };
    if let (Some(rd), Some(wr)) = (reader.or(parked_rd), parked_wr) {
        ctx.transport.close(rd.unsplit(wr)).await;
    }

    let (connect_failed, curr_op, drained, cmd_count, start_stable) = {
        let mut st = hc.state.lock().unwrap();
        let drained: Vec<Arc<Op>> = st.pending.drain(..).collect();
        (
            st.connect_failed,
            st.curr_op.take(),
            drained,
            st.cmd_count,
            st.start_stable,
        )
    };

    let mut requeued = false;
    if connect_failed {
        // Nothing made it onto the wire. If this was the endpoint's last
        // chance (the only connection, or one failure past the abort
        // threshold) and nothing has completed since this worker started,
        // fail the whole queue rather than dialing forever.
        let mut pst = portal.state.lock().unwrap();
        let processed = pst.cmds_processed - baseline;
        if processed == 0
            && (pst.n_conn == 1 || pst.failed_conn_attempts > ctx.config.abort_conn_attempts)
        {
            warn!(
                attempts = pst.failed_conn_attempts,
                "cannot reach endpoint, failing queued operations"
            );
            pst.fail_queued(Status::CantConnect);
        }
    } else {
        // Push the in-flight work back, oldest landing nearest the head:
        // the sender's current op, then the one harvested with a failure
        // (charged for it), then the pipeline from newest to oldest.
        if let Some(op) = curr_op {
            portal.requeue_front(op);
            requeued = true;
        }
        if let Some(op) = recv_op {
            op.charge_retry();
            portal.requeue_front(op);
            requeued = true;
        }
        for op in drained.into_iter().rev() {
            portal.requeue_front(op);
            requeued = true;
        }
    }

    // Remove ourselves and fold what happened into the tuning state.
    let (pause, remaining) = {
        let mut pst = portal.state.lock().unwrap();
        pst.roster.remove(&hc.id);
        pst.n_conn = pst.n_conn.saturating_sub(1);

        if requeued {
            // The connection died with work in flight: lower the stability
            // estimate, with an extra notch if it barely got anything done.
            pst.stable_conn = pst.n_conn;
            if cmd_count < 2 {
                pst.stable_conn = pst.stable_conn.saturating_sub(1);
            }

            if pst.sleeping_conn > 0 {
                pause = Duration::ZERO;
            }
            if !pause.is_zero() {
                pause = pause.min(ctx.config.max_wait);
                let until = Instant::now() + pause;
                pst.pause_until = Some(pst.pause_until.map_or(until, |p| p.max(until)));
            }
            // A one-shot socket that did real work is a normal exit, not a
            // reason to slow the portal down.
            if start_stable == 0 && cmd_count > 0 {
                pause = Duration::ZERO;
            }
        } else {
            pause = Duration::ZERO;
        }

        pst.closing_conn += 1;
        if !pause.is_zero() {
            pst.sleeping_conn += 1;
        }
        (pause, pst.n_conn)
    };

    if !pause.is_zero() {
        if remaining == 0 {
            info!(?pause, "pausing before reconnect");
            tokio::time::sleep(pause).await;
        }
        let mut pst = portal.state.lock().unwrap();
        pst.sleeping_conn = pst.sleeping_conn.saturating_sub(1);
    }

    // A replacement may be warranted for the re-queued work.
    check_connections(portal);

    {
        let mut pst = portal.state.lock().unwrap();
        pst.closing_conn = pst.closing_conn.saturating_sub(1);
        pst.closed.push(hc.clone());
    }
    portal.work.notify_waiters();
    info!(cmd_count, "connection down");
}
