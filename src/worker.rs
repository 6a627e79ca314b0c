/*!
 * Worker: one event loop, one connection table, one OS thread
 *
 * A Worker owns a ReactorLoop and the table of connections accepted on its
 * listeners. All socket I/O for a connection happens on the owning
 * worker's thread; admin operations (kill, monitor feed, client list) may
 * arrive from any thread and go through the table mutex plus the
 * per-connection state lock. The kill effect is realized on the owning
 * reactor's next wake, triggered by arming write interest.
 *
 * WorkerThread binds a Worker to a named OS thread.
 */

use crate::conn::{
    Connection, FlushOutcome, ReadOutcome, DEFAULT_NAMESPACE, FLAG_CLOSE_AFTER_REPLY, FLAG_MONITOR,
};
use crate::protocol::{resp_error, resp_simple};
use crate::reactor::{listener_index, set_keepalive, would_block, ReactorLoop, WAKER_TOKEN};
use crate::server::ServerContext;
use crate::table::{ConnectionTable, IDLE_SCAN_BUDGET};
use anyhow::{bail, Result};
use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Registry, Token, Waker};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

/// An admission refusal: the connection is handed back so the accept
/// handler can write the courtesy error before dropping it.
pub struct Refused {
    pub conn: Connection,
    pub reason: String,
}

pub struct Worker {
    ctx: Arc<ServerContext>,
    repl: bool,
    addrs: Vec<SocketAddr>,
    table: Mutex<ConnectionTable>,
    registry: Registry,
    waker: Waker,
    stopped: AtomicBool,
    // Held by the worker thread for the whole run; everything admin
    // threads need lives outside it.
    reactor: Mutex<ReactorLoop>,
}

impl Worker {
    /// Build a worker and bind its listeners.
    ///
    /// Bind or poller failure is fatal for the worker: the error
    /// propagates and the process is expected to exit.
    pub fn new(ctx: Arc<ServerContext>, repl: bool) -> Result<Arc<Worker>> {
        let mut reactor = ReactorLoop::new()?;
        let registry = reactor.registry()?;
        let waker = reactor.waker()?;

        let config = &ctx.config;
        let (port, binds) = if repl {
            let port = match config.repl_port {
                Some(p) => p,
                None => bail!("replication worker requires repl_port"),
            };
            (port, config.effective_repl_binds())
        } else {
            (config.port, &config.binds[..])
        };

        let mut addrs = Vec::with_capacity(binds.len());
        for bind in binds {
            let addr = reactor.listen(bind, port, config.backlog)?;
            addrs.push(addr);
        }

        Ok(Arc::new(Worker {
            ctx,
            repl,
            addrs,
            table: Mutex::new(ConnectionTable::new()),
            registry,
            waker,
            stopped: AtomicBool::new(false),
            reactor: Mutex::new(reactor),
        }))
    }

    pub fn is_repl(&self) -> bool {
        self.repl
    }

    /// Addresses the worker's listeners actually bound.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Drive the event loop until `stop` is called. Blocks.
    pub fn run(self: &Arc<Self>) {
        let mut reactor = self.reactor.lock();
        loop {
            if let Err(e) = reactor.poll_once() {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("[worker] poll failed: {e}");
                break;
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if reactor.tick_due() {
                self.tick();
            }
            let ready: Vec<(Token, bool, bool)> = reactor
                .events()
                .iter()
                .map(|e| {
                    (
                        e.token(),
                        e.is_readable() || e.is_read_closed() || e.is_error(),
                        e.is_writable(),
                    )
                })
                .collect();
            for (token, readable, writable) in ready {
                if token == WAKER_TOKEN {
                    continue;
                }
                if let Some(idx) = listener_index(token) {
                    if let Some(listener) = reactor.listener(idx) {
                        self.handle_accept(listener);
                    }
                    continue;
                }
                let fd = token.0 as RawFd;
                if readable {
                    self.handle_readable(fd);
                }
                if writable {
                    self.handle_writable(fd);
                }
            }
        }
        self.clear_connections();
        reactor.close_listeners();
    }

    /// Break the event loop from any thread. The run loop destroys the
    /// remaining connections and closes the listeners on its way out.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            error!("[worker] failed to wake event loop: {e}");
        }
    }

    /// Timer callback: every tick, scan for idle clients unless the
    /// timeout is disabled.
    fn tick(&self) {
        let timeout = self.ctx.config.timeout;
        if timeout == 0 {
            return;
        }
        self.kickout_idle_clients(timeout);
    }

    // ---- accept path ----

    fn handle_accept(self: &Arc<Self>, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if would_block(e) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("[worker] accept error: {e}");
                    break;
                }
            }
        }
    }

    /// Configure, register and admit a freshly accepted socket.
    ///
    /// A socket that cannot get keepalive is closed rather than admitted
    /// half-configured. On admission refusal a single `-ERR` reply is
    /// written directly to the fd, best effort, before the close.
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let fd = stream.as_raw_fd();
        if let Err(e) = set_keepalive(fd) {
            error!("[worker] failed to set tcp-keepalive on fd {fd}: {e}");
            return;
        }
        let conn = Connection::new(stream, peer.to_string(), Arc::downgrade(self));
        if let Err(e) = conn.register(&self.registry) {
            error!("[worker] failed to register fd {fd}: {e}");
            return;
        }
        match self.add_connection(conn) {
            Ok(()) => debug!("[worker] new connection: fd={fd} addr={peer}"),
            Err(refused) => {
                warn!("[worker] refused connection from {peer}: {}", refused.reason);
                refused.conn.write_direct(&resp_error(&refused.reason));
            }
        }
    }

    // ---- table operations ----

    /// Admit a connection: refuse duplicates and respect `maxclients`,
    /// then assign the process-wide client id.
    ///
    /// The cap check is increment-compare-decrement; concurrent accepts
    /// across workers may transiently overshoot. The cap is approximate.
    pub fn add_connection(&self, mut conn: Connection) -> std::result::Result<(), Refused> {
        let fd = conn.fd();
        let mut table = self.table.lock();
        if table.contains_normal(fd) {
            return Err(Refused {
                conn,
                reason: "connection already exists".into(),
            });
        }
        if self.ctx.incr_client_count() >= self.ctx.config.maxclients {
            self.ctx.decr_client_count();
            return Err(Refused {
                conn,
                reason: "max number of clients reached".into(),
            });
        }
        conn.set_id(self.ctx.next_client_id());
        table.insert_normal(fd, Arc::new(conn));
        Ok(())
    }

    /// Destroy a connection by fd, whichever sub-table holds it.
    /// Idempotent: an unknown fd leaves tables and counters untouched.
    pub fn remove_connection(&self, fd: RawFd) {
        let removed = { self.table.lock().remove(fd) };
        if let Some((conn, was_monitor)) = removed {
            self.ctx.decr_client_count();
            if was_monitor {
                self.ctx.decr_monitor_count();
            }
            debug!("[worker] destroyed connection: fd={fd} id={}", conn.id());
        }
    }

    /// Destroy a connection by fd only if its id still matches: a no-op
    /// when the fd has been recycled by a newer connection.
    pub fn remove_connection_by_id(&self, fd: RawFd, id: u64) {
        let removed = { self.table.lock().remove_by_id(fd, id) };
        if let Some((_, was_monitor)) = removed {
            self.ctx.decr_client_count();
            if was_monitor {
                self.ctx.decr_monitor_count();
            }
            debug!("[worker] destroyed connection: fd={fd} id={id}");
        }
    }

    /// Arm write readiness for a local fd.
    pub fn enable_write_event(&self, fd: RawFd) -> Result<()> {
        let conn = { self.table.lock().get_normal(fd).cloned() };
        match conn {
            Some(c) => {
                c.arm_write(&self.registry)?;
                Ok(())
            }
            None => bail!("connection doesn't exist"),
        }
    }

    /// Append a reply to a local fd's output buffer and make sure the
    /// owning loop wakes to flush it.
    pub fn reply(&self, fd: RawFd, reply: &[u8]) -> Result<()> {
        let conn = { self.table.lock().get_normal(fd).cloned() };
        match conn {
            Some(c) => {
                c.enqueue_and_arm(reply, &self.registry)?;
                Ok(())
            }
            None => bail!("connection doesn't exist"),
        }
    }

    /// Move a local connection into monitor mode: normal table to monitor
    /// table, monitor flag, shared monitor counter.
    pub fn become_monitor_conn(&self, conn: &Arc<Connection>) {
        let moved = { self.table.lock().promote_to_monitor(conn.fd()) };
        if moved {
            self.ctx.incr_monitor_count();
        }
        conn.enable_flag(FLAG_MONITOR);
    }

    /// Append one trace line to every monitor on this worker whose
    /// namespace matches the source's, or who sits in the default
    /// namespace. The source itself never receives its own trace.
    ///
    /// Callers must not hold any worker-local lock; the table lock here
    /// is non-re-entrant.
    pub fn feed_monitor_conns(&self, source: &Arc<Connection>, tokens: &[String]) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut line = format!("{}.{} [0 {}]", now.as_secs(), now.subsec_micros(), source.addr());
        for tok in tokens {
            line.push_str(&format!(" \"{tok}\""));
        }
        let reply = resp_simple(&line);
        let src_ns = source.namespace();

        let table = self.table.lock();
        for (_, monitor) in table.iter_monitors() {
            if Arc::ptr_eq(monitor, source) {
                continue; // skip the monitor that triggered the feed
            }
            let ns = monitor.namespace();
            if ns == src_ns || ns == DEFAULT_NAMESPACE {
                if let Err(e) = monitor.enqueue_and_arm(&reply, &self.registry) {
                    debug!("[worker] failed to feed monitor fd {}: {e}", monitor.fd());
                }
            }
        }
    }

    /// Snapshot report of this worker's normal connections, one line per
    /// client. Monitor connections are not listed.
    pub fn get_clients_str(&self) -> String {
        let table = self.table.lock();
        let mut clients = String::new();
        for (fd, c) in table.iter_normal() {
            let view = c.admin_view();
            clients.push_str(&format!(
                "id={} addr={} fd={} name={} age={} idle={} flags={} namespace={} qbuf={} obuf={} cmd={}\n",
                c.id(),
                c.addr(),
                fd,
                view.name,
                c.age(),
                c.idle_secs(),
                c.flags(),
                view.namespace,
                view.qbuf,
                view.obuf,
                view.last_cmd,
            ));
        }
        clients
    }

    /// Flag matching local connections for close-after-reply and wake the
    /// reactor so the close actually happens. A connection matches on a
    /// non-empty `addr` or a non-zero `id`; `skipme` protects the caller's
    /// own connection.
    pub fn kill_client(
        &self,
        self_conn: Option<&Arc<Connection>>,
        id: u64,
        addr: &str,
        skipme: bool,
        killed: &mut i64,
    ) {
        let table = self.table.lock();
        for (_, conn) in table.iter_normal() {
            if skipme {
                if let Some(me) = self_conn {
                    if Arc::ptr_eq(me, conn) {
                        continue;
                    }
                }
            }
            if (!addr.is_empty() && conn.addr() == addr) || (id != 0 && conn.id() == id) {
                conn.enable_flag(FLAG_CLOSE_AFTER_REPLY);
                // wake the owning loop so it drains and removes the connection
                if let Err(e) = conn.arm_write(&self.registry) {
                    debug!("[worker] failed to arm kill on fd {}: {e}", conn.fd());
                }
                *killed += 1;
            }
        }
    }

    /// One idle-scan pass: visit at most `IDLE_SCAN_BUDGET` connections in
    /// fd order (resuming where the last pass stopped), then remove the
    /// expired ones by (fd, id) after the table lock is released.
    pub fn kickout_idle_clients(&self, timeout: u64) {
        let doomed = {
            let mut table = self.table.lock();
            if table.normal_len() == 0 {
                return;
            }
            let budget = table.normal_len().min(IDLE_SCAN_BUDGET);
            table.collect_idle(timeout, budget)
        };
        for (fd, id) in doomed {
            self.remove_connection_by_id(fd, id);
        }
    }

    // ---- readiness handlers ----

    fn lookup(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.table.lock().get(fd).cloned()
    }

    fn handle_readable(self: &Arc<Self>, fd: RawFd) {
        let Some(conn) = self.lookup(fd) else { return };
        match conn.fill_input() {
            Ok(ReadOutcome::Open) => {}
            Ok(ReadOutcome::Eof) => {
                self.remove_connection(fd);
                return;
            }
            Err(e) => {
                debug!("[worker] read error on fd {fd}: {e}");
                self.remove_connection(fd);
                return;
            }
        }

        // Dispatch with no locks held: the engine calls back into this
        // worker (monitor feed, kill, become-monitor) and those take the
        // table lock themselves.
        let mut pending = conn.take_input();
        if !pending.is_empty() {
            let engine = Arc::clone(self.ctx.engine());
            if let Err(e) = engine.dispatch(self, &conn, &mut pending) {
                debug!("[worker] closing fd {fd} after dispatch error: {e}");
                conn.enqueue(&resp_error(&e.to_string()));
                conn.enable_flag(FLAG_CLOSE_AFTER_REPLY);
            }
        }
        conn.restore_input(pending);

        self.flush_conn(fd, &conn);
    }

    fn handle_writable(&self, fd: RawFd) {
        if let Some(conn) = self.lookup(fd) {
            self.flush_conn(fd, &conn);
        }
    }

    /// Flush queued output; once drained, honor close-after-reply.
    fn flush_conn(&self, fd: RawFd, conn: &Arc<Connection>) {
        match conn.flush(&self.registry) {
            Ok(FlushOutcome::Drained) => {
                if conn.has_flag(FLAG_CLOSE_AFTER_REPLY) {
                    self.remove_connection(fd);
                }
            }
            Ok(FlushOutcome::Pending) => {}
            Err(e) => {
                debug!("[worker] write error on fd {fd}: {e}");
                self.remove_connection(fd);
            }
        }
    }

    /// Destroy every remaining connection; runs when the loop exits.
    fn clear_connections(&self) {
        let fds = { self.table.lock().all_fds() };
        for fd in fds {
            self.remove_connection(fd);
        }
    }
}

/// Binds a Worker to a named OS thread with start/stop/join.
pub struct WorkerThread {
    worker: Arc<Worker>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn new(worker: Arc<Worker>) -> WorkerThread {
        WorkerThread { worker, handle: None }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Spawn the worker thread. Spawn failure is logged and leaves the
    /// worker unstarted; it does not propagate.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let name = if self.worker.is_repl() { "repl-worker" } else { "worker" };
        let worker = Arc::clone(&self.worker);
        match std::thread::Builder::new()
            .name(name.into())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                info!("[worker] thread {name} started");
                self.handle = Some(handle);
            }
            Err(e) => error!("[worker] failed to start worker thread: {e}"),
        }
    }

    /// Signal the worker's loop to break.
    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Wait for the worker thread to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("[worker] worker thread panicked");
            }
        }
    }
}
