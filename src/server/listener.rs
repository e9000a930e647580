use crate::cache::ResponseCache;
use crate::config::Config;
use crate::server::pipeline::{write_error_response, RequestContext};
use crate::server::upstream::UpstreamPool;
use crate::server::workers::{SubmitOutcome, Task, WorkerPool};
use crate::utils::error::{ProxyError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MIN_BACKLOG: i32 = 128;

/// The proxy: acceptor, worker pool, response cache, and upstream pool
/// wired together under one shutdown token.
pub struct ProxyServer {
    config: Arc<Config>,
    cache: Arc<ResponseCache>,
    upstreams: Arc<UpstreamPool>,
    workers: WorkerPool,
    shutdown: CancellationToken,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl ProxyServer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        let cache = Arc::new(ResponseCache::new(&config.cache));
        let upstreams = Arc::new(UpstreamPool::new(&config.upstream));

        let sweep_every = (config.cache.ttl() / 2).max(Duration::from_secs(1));
        let sweepers = vec![
            cache.start_sweeper(sweep_every, shutdown.clone()),
            upstreams.start_sweeper(shutdown.clone()),
        ];

        let ctx = Arc::new(RequestContext {
            cache: Arc::clone(&cache),
            upstreams: Arc::clone(&upstreams),
            max_request_bytes: config.server.max_request_bytes,
            max_response_bytes: config.server.max_response_bytes,
            recv_timeout: config.upstream.recv_timeout(),
            user_agent: config.server.user_agent.clone(),
        });

        let limiter = Arc::new(Semaphore::new(config.server.max_in_flight));
        let workers = WorkerPool::spawn(
            config.server.workers,
            config.server.queue_capacity,
            limiter,
            ctx,
            shutdown.clone(),
        );

        Ok(Self {
            config,
            cache,
            upstreams,
            workers,
            shutdown,
            sweepers: Mutex::new(sweepers),
            bound_addr: Mutex::new(None),
        })
    }

    /// Accept connections and feed them to the worker queue until shutdown.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.bind_port
        )
        .parse()
        .map_err(|e| ProxyError::Config(format!("invalid bind address: {}", e)))?;

        let backlog = (self.config.server.workers as i32).max(MIN_BACKLOG);
        let listener = bind_listener(addr, backlog)?;
        let local_addr = listener.local_addr()?;

        *self
            .bound_addr
            .lock()
            .expect("bound address mutex poisoned") = Some(local_addr);

        info!("memproxy listening on {}", local_addr);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Acceptor stopping");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!("New connection from {}", peer);

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY on client socket: {}", e);
                            }

                            match self.workers.submit(Task { stream, peer }) {
                                SubmitOutcome::Accepted => {}
                                SubmitOutcome::Rejected(task) => {
                                    let refusal = ProxyError::Overloaded;
                                    warn!("Task queue full, refusing {}: {}", peer, refusal);

                                    if let Some((code, reason)) = refusal.status() {
                                        let mut stream = task.stream;
                                        write_error_response(&mut stream, code, reason).await;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop accepting, drain the workers, and tear down the pools.
    pub async fn shutdown(&self) {
        info!("Shutting down memproxy...");

        self.shutdown.cancel();
        self.workers.shutdown().await;

        let sweepers = {
            let mut guard = self.sweepers.lock().expect("sweeper handle mutex poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in sweepers {
            let _ = handle.await;
        }

        let cache_stats = self.cache.stats();
        let pool_stats = self.upstreams.stats();
        info!(
            cache_hits = cache_stats.hits,
            cache_misses = cache_stats.misses,
            cache_entries = cache_stats.entries,
            upstream_dials = pool_stats.total_dialed,
            upstream_reuses = pool_stats.pool_hits,
            "Final statistics"
        );

        self.upstreams.clear();
        self.cache.clear();

        info!("Shutdown complete");
    }

    /// Address the acceptor is bound to, once `run` has opened the socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .bound_addr
            .lock()
            .expect("bound address mutex poisoned")
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn upstreams(&self) -> &Arc<UpstreamPool> {
        &self.upstreams
    }
}

/// Plain TCP listener with `SO_REUSEADDR` and an explicit backlog.
fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into()).map_err(ProxyError::Io)
}
