// src/reactor.rs
//! The I/O thread.
//!
//! The reactor is the only code that reads from or writes to a socket, and the
//! only code that accepts, registers or closes descriptors. A connection that
//! has finished reading is checked out of the arena and moved to a worker,
//! which parses it, stages the response and hands it back through the return
//! queue before re-arming its descriptor. Every connection is registered
//! one-shot, so at most one readiness event per descriptor is ever in flight.

use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::conn::Connection;
use crate::error::EtudeResult;
use crate::metrics::ServerMetrics;
use crate::pool::WorkerPool;
use crate::slab::{ConnId, ConnectionSlab, LISTENER_TOKEN};
use crate::syscalls::{self, Epoll, Interest, Readiness, epoll_event};

/// Sent raw to a connection that arrives while the arena is full.
pub const BUSY_MESSAGE: &[u8] = b"Internal server busy";

/// Upper bound on one wait call, so a shutdown request is noticed.
const WAKE_INTERVAL_MS: i32 = 1000;

/// A connection in transit between the reactor and a worker.
pub(crate) struct Checkout {
    id: ConnId,
    conn: Box<Connection>,
}

/// Traffic from the workers back to the reactor, drained after each wait.
#[derive(Default)]
pub(crate) struct ReturnQueue {
    returned: SegQueue<Checkout>,
    /// Returned connections whose re-arm failed. No event will ever wake them.
    stranded: SegQueue<ConnId>,
}

impl ReturnQueue {
    fn push(&self, item: Checkout) {
        self.returned.push(item);
    }

    /// Must follow the `push` of the same connection.
    fn strand(&self, id: ConnId) {
        self.stranded.push(id);
    }

    fn pop_returned(&self) -> Option<Checkout> {
        self.returned.pop()
    }

    fn pop_stranded(&self) -> Option<ConnId> {
        self.stranded.pop()
    }
}

/// Everything a worker needs to give a processed connection back.
#[derive(Clone)]
pub(crate) struct Handoff {
    poller: Arc<Epoll>,
    returns: Arc<ReturnQueue>,
    metrics: Arc<ServerMetrics>,
}

impl Handoff {
    /// Process on the worker thread, then return the connection and re-arm.
    pub(crate) fn complete(&self, task: Checkout, doc_root: &Path) {
        let Checkout { id, mut conn } = task;
        let interest = conn.process(doc_root);
        if interest == Interest::Write {
            self.metrics.inc_req();
        }

        // Hand the connection back first: once re-armed, its next event may
        // be delivered to the reactor immediately.
        let (fd, token) = (conn.fd(), conn.token());
        self.returns.push(Checkout { id, conn });
        if let Err(e) = self.poller.rearm(fd, token, interest) {
            warn!(fd, error = %e, "failed to re-arm after processing, closing");
            self.returns.strand(id);
        }
    }
}

pub(crate) struct Reactor {
    listener: TcpListener,
    poller: Arc<Epoll>,
    slab: ConnectionSlab,
    pool: WorkerPool<Checkout>,
    returns: Arc<ReturnQueue>,
    stranded: Vec<ConnId>,
    metrics: Arc<ServerMetrics>,
    events: Vec<epoll_event>,
    shutdown: Arc<AtomicBool>,
    /// Set when accept failed with the backlog possibly non-empty. The
    /// listener is edge triggered and will not report it again.
    accept_stalled: bool,
    metrics_interval: Option<Duration>,
}

impl Reactor {
    pub(crate) fn new(
        listener: TcpListener,
        config: &Config,
        shutdown: Arc<AtomicBool>,
    ) -> EtudeResult<Self> {
        let doc_root = config.doc_root.clone();
        Self::with_pool(listener, config, shutdown, |handoff| {
            WorkerPool::new(
                config.workers,
                config.queue_depth,
                config.pin_workers,
                move |task: Checkout| handoff.complete(task, &doc_root),
            )
        })
    }

    /// Like [`Reactor::new`], with the worker pool built by `build`.
    pub(crate) fn with_pool<F>(
        listener: TcpListener,
        config: &Config,
        shutdown: Arc<AtomicBool>,
        build: F,
    ) -> EtudeResult<Self>
    where
        F: FnOnce(Handoff) -> EtudeResult<WorkerPool<Checkout>>,
    {
        let poller = Arc::new(Epoll::new()?);
        poller.add_listener(listener.as_raw_fd(), LISTENER_TOKEN)?;

        let metrics = Arc::new(ServerMetrics::new());
        let returns = Arc::new(ReturnQueue::default());
        let pool = build(Handoff {
            poller: Arc::clone(&poller),
            returns: Arc::clone(&returns),
            metrics: Arc::clone(&metrics),
        })?;

        Ok(Self {
            listener,
            poller,
            slab: ConnectionSlab::new(config.max_connections),
            pool,
            returns,
            stranded: Vec::new(),
            metrics,
            events: vec![epoll_event { events: 0, u64: 0 }; config.max_events],
            shutdown,
            accept_stalled: false,
            metrics_interval: match config.metrics_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }

    #[cfg(test)]
    pub(crate) fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until the shutdown flag is set or the multiplexer fails, then tear
    /// everything down.
    pub(crate) fn run(&mut self) -> EtudeResult<()> {
        let result = self.event_loop();
        if let Err(e) = &result {
            error!(error = %e, "reactor failed");
        }
        self.finish();
        result
    }

    fn event_loop(&mut self) -> EtudeResult<()> {
        let mut last_metrics = Instant::now();

        while !self.shutdown.load(Ordering::Acquire) {
            self.turn(WAKE_INTERVAL_MS)?;

            if let Some(interval) = self.metrics_interval {
                if last_metrics.elapsed() >= interval {
                    self.metrics.log();
                    last_metrics = Instant::now();
                }
            }
        }

        info!("shutdown requested, draining workers");
        Ok(())
    }

    /// One wait, then everything it reported.
    fn turn(&mut self, timeout_ms: i32) -> EtudeResult<()> {
        let n = self.poller.wait(&mut self.events, timeout_ms)?;

        self.reclaim();
        if self.accept_stalled {
            self.accept_all();
        }

        for i in 0..n {
            let ready = Readiness::from_raw(&self.events[i]);
            self.dispatch(ready);
        }
        Ok(())
    }

    fn dispatch(&mut self, ready: Readiness) {
        if ready.token == LISTENER_TOKEN {
            self.accept_all();
            return;
        }

        let id = ConnId::from_token(ready.token);
        if self.slab.get_mut(id).is_none() {
            trace!(
                token = ready.token,
                checked_out = self.slab.is_checked_out(id),
                "event for a connection the reactor does not hold"
            );
            return;
        }

        if ready.is_hangup() {
            self.teardown(id);
        } else if ready.is_readable() {
            self.on_readable(id);
        } else if ready.is_writable() {
            self.on_writable(id);
        }
    }

    /// Drain the accept backlog; the listener is edge triggered.
    fn accept_all(&mut self) {
        self.accept_stalled = false;
        loop {
            let fd = match syscalls::accept_connection(self.listener.as_raw_fd()) {
                Ok(Some(fd)) => fd,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "accept failed, retrying after the next wait");
                    self.accept_stalled = true;
                    return;
                }
            };

            let Some(id) = self.slab.acquire(fd) else {
                warn!(fd, capacity = self.slab.capacity(), "connection limit reached, rejecting");
                syscalls::send_best_effort(fd, BUSY_MESSAGE);
                syscalls::close_fd(fd);
                self.metrics.inc_rejected();
                continue;
            };

            if let Err(e) = self.poller.add(fd, id.token(), Interest::Read) {
                warn!(fd, error = %e, "failed to register connection");
                self.slab.release(id);
                syscalls::close_fd(fd);
                continue;
            }

            self.metrics.inc_conn();
            debug!(fd, index = id.index, "accepted connection");
        }
    }

    fn on_readable(&mut self, id: ConnId) {
        let Some(conn) = self.slab.get_mut(id) else {
            return;
        };
        if !conn.read_available() {
            self.teardown(id);
            return;
        }

        let Some(conn) = self.slab.checkout(id) else {
            return;
        };
        if let Err(task) = self.pool.submit(Checkout { id, conn }) {
            warn!(index = id.index, queued = self.pool.queued(), "worker queue full, dropping connection");
            self.metrics.inc_shed();
            if self.slab.checkin(task.id, task.conn).is_ok() {
                self.teardown(id);
            }
        }
    }

    fn on_writable(&mut self, id: ConnId) {
        let Some(conn) = self.slab.get_mut(id) else {
            return;
        };
        if !conn.write_available(&self.poller, &self.metrics) {
            self.teardown(id);
        }
    }

    /// Take back every connection the workers have finished with, and close
    /// the ones that could not be re-armed.
    fn reclaim(&mut self) {
        // Stranded ids first: each one's connection is already in `returned`.
        while let Some(id) = self.returns.pop_stranded() {
            self.stranded.push(id);
        }
        while let Some(Checkout { id, conn }) = self.returns.pop_returned() {
            if self.slab.checkin(id, conn).is_err() {
                warn!(index = id.index, "returned connection has no matching slot");
            }
        }

        let mut stranded = std::mem::take(&mut self.stranded);
        for id in stranded.drain(..) {
            self.teardown(id);
        }
        self.stranded = stranded;
    }

    /// Unregister, close and free. Releases any file mapping.
    fn teardown(&mut self, id: ConnId) {
        let Some(fd) = self.slab.release(id) else {
            return;
        };
        if let Err(e) = self.poller.delete(fd) {
            debug!(fd, error = %e, "epoll delete failed");
        }
        syscalls::close_fd(fd);
        self.metrics.dec_conn();
        debug!(fd, index = id.index, "connection closed");
    }

    fn finish(&mut self) {
        self.pool.shutdown();
        self.reclaim();
        for id in self.slab.live_ids() {
            self.teardown(id);
        }
        self.metrics.log();
        info!("reactor stopped");
    }
}
