/*!
 * Shared Server Context and Server Assembly
 *
 * ServerContext is the process-wide shared state: the read-only config,
 * the command engine handle, the atomic client/monitor counters, the
 * client-id seed, and a registry of weak worker handles used to fan admin
 * operations (client list, kill, monitor feed) across every worker.
 *
 * Server assembles the context with N worker threads plus the optional
 * replication worker.
 */

use crate::config::Config;
use crate::conn::Connection;
use crate::engine::CommandEngine;
use crate::worker::{Worker, WorkerThread};
use anyhow::Result;
use log::info;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub struct ServerContext {
    pub config: Config,
    engine: Arc<dyn CommandEngine>,
    client_count: AtomicU64,
    monitor_count: AtomicU64,
    next_client_id: AtomicU64,
    // Non-owning: workers own their connections, the context only needs
    // to address them for admin fan-out.
    workers: RwLock<Vec<Weak<Worker>>>,
}

impl ServerContext {
    pub fn new(config: Config, engine: Arc<dyn CommandEngine>) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            config,
            engine,
            client_count: AtomicU64::new(0),
            monitor_count: AtomicU64::new(0),
            next_client_id: AtomicU64::new(1),
            workers: RwLock::new(Vec::new()),
        })
    }

    pub fn engine(&self) -> &Arc<dyn CommandEngine> {
        &self.engine
    }

    /// Bump the client counter; returns the count before the increment so
    /// admission can compare against `maxclients`.
    pub fn incr_client_count(&self) -> u64 {
        self.client_count.fetch_add(1, Ordering::Relaxed)
    }

    pub fn decr_client_count(&self) {
        self.client_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn client_count(&self) -> u64 {
        self.client_count.load(Ordering::Relaxed)
    }

    pub fn incr_monitor_count(&self) {
        self.monitor_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_monitor_count(&self) {
        self.monitor_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn monitor_count(&self) -> u64 {
        self.monitor_count.load(Ordering::Relaxed)
    }

    /// Next process-wide client id; monotonic, never reused.
    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_worker(&self, worker: &Arc<Worker>) {
        self.workers.write().push(Arc::downgrade(worker));
    }

    /// Live workers, in registration order.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.read().iter().filter_map(Weak::upgrade).collect()
    }

    /// Client report aggregated across every worker.
    pub fn all_clients_str(&self) -> String {
        let mut out = String::new();
        for worker in self.workers() {
            out.push_str(&worker.get_clients_str());
        }
        out
    }

    /// Apply a client kill to every worker's table in turn; each worker
    /// handles its own matches. Returns how many connections were flagged.
    pub fn kill_client_all(
        &self,
        self_conn: Option<&Arc<Connection>>,
        id: u64,
        addr: &str,
        skipme: bool,
    ) -> i64 {
        let mut killed = 0;
        for worker in self.workers() {
            worker.kill_client(self_conn, id, addr, skipme, &mut killed);
        }
        killed
    }

    /// Fan one command trace out to the monitors of every worker.
    pub fn feed_monitors(&self, source: &Arc<Connection>, tokens: &[String]) {
        for worker in self.workers() {
            worker.feed_monitor_conns(source, tokens);
        }
    }
}

/// The assembled server: N worker threads and the optional replication
/// worker, all sharing one context.
pub struct Server {
    ctx: Arc<ServerContext>,
    workers: Vec<WorkerThread>,
    repl_worker: Option<WorkerThread>,
}

impl Server {
    /// Build all workers and bind their listeners. Any bind failure
    /// surfaces here and the server is not constructed.
    pub fn new(ctx: Arc<ServerContext>) -> Result<Server> {
        let mut workers = Vec::with_capacity(ctx.config.workers);
        for _ in 0..ctx.config.workers {
            let worker = Worker::new(Arc::clone(&ctx), false)?;
            ctx.register_worker(&worker);
            workers.push(WorkerThread::new(worker));
        }

        let repl_worker = match ctx.config.repl_port {
            Some(_) => {
                let worker = Worker::new(Arc::clone(&ctx), true)?;
                ctx.register_worker(&worker);
                Some(WorkerThread::new(worker))
            }
            None => None,
        };

        Ok(Server { ctx, workers, repl_worker })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn start(&mut self) {
        for wt in &mut self.workers {
            wt.start();
        }
        if let Some(wt) = &mut self.repl_worker {
            wt.start();
        }
        info!(
            "[server] started {} workers on port {}",
            self.workers.len(),
            self.ctx.config.port
        );
    }

    pub fn stop(&self) {
        for wt in &self.workers {
            wt.stop();
        }
        if let Some(wt) = &self.repl_worker {
            wt.stop();
        }
    }

    pub fn join(&mut self) {
        for wt in &mut self.workers {
            wt.join();
        }
        if let Some(wt) = &mut self.repl_worker {
            wt.join();
        }
    }

    /// Addresses the normal workers actually bound.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.workers
            .iter()
            .flat_map(|wt| wt.worker().local_addrs().iter().copied())
            .collect()
    }

    /// Addresses of the replication listeners, when enabled.
    pub fn repl_local_addrs(&self) -> Vec<SocketAddr> {
        self.repl_worker
            .iter()
            .flat_map(|wt| wt.worker().local_addrs().iter().copied())
            .collect()
    }

    pub fn get_clients_str(&self) -> String {
        self.ctx.all_clients_str()
    }

    pub fn kill_client(
        &self,
        self_conn: Option<&Arc<Connection>>,
        id: u64,
        addr: &str,
        skipme: bool,
    ) -> i64 {
        self.ctx.kill_client_all(self_conn, id, addr, skipme)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}
