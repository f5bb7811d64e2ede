use crate::{
    config::Config,
    filter::AddressFilter,
    relay::Relay,
    workers::WorkerCounter,
};
use anyhow::{Context, Result, anyhow, bail};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream, lookup_host},
    time::{sleep, timeout},
};
use tracing::{debug, error, info};

/// How long a single accept waits before the loop re-checks the active flag
pub const ACCEPT_TIMEOUT: Duration = Duration::from_millis(300);

/// How often drained re-checks the worker count
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// ServerState is the process-wide active flag shared by the accept loop and
/// every running relay
#[derive(Debug, Clone, Default)]
pub struct ServerState {
    active: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// deactivate clears the flag, returning whether it was set
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }
}

/// Dispatch decides how an admitted relay gets run. This is the single
/// admission point for tunnels: swap it out to bound or rate-limit them
/// without touching the relay itself.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, relay: Relay);
}

/// Unbounded spawns one task per relay with no cap
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl Dispatch for Unbounded {
    fn dispatch(&self, relay: Relay) {
        tokio::spawn(async move {
            match relay.run().await {
                Ok(summary) => debug!(
                    "relay for {} finished: {:?}",
                    summary.peer, summary.closure
                ),
                Err(e) => error!("connection error: {e}"),
            }
        });
    }
}

/// ServerHandle lets other tasks observe and stop a running server
#[derive(Debug, Clone)]
pub struct ServerHandle {
    state: ServerState,
    workers: WorkerCounter,
}

impl ServerHandle {
    /// stop asks the accept loop to exit. Running tunnels are left alone and
    /// wind down on their own next iteration.
    pub fn stop(&self) {
        if self.state.deactivate() {
            info!("shutdown requested");
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn workers(&self) -> usize {
        self.workers.value()
    }

    pub fn has_workers(&self) -> bool {
        self.workers.value() > 0
    }

    /// drained resolves once no tunnel is running. Pair it with stop so
    /// in-flight relays finish their last iteration before the process exits.
    pub async fn drained(&self) {
        while self.has_workers() {
            sleep(DRAIN_POLL).await;
        }
    }
}

/// ProxyServer listens on the configured address and tunnels every admitted
/// connection to the configured remote
pub struct ProxyServer {
    config: Arc<Config>,
    filter: Arc<AddressFilter>,
    workers: WorkerCounter,
    state: ServerState,
    dispatcher: Arc<dyn Dispatch>,
    listener: Option<TcpListener>,
}

impl ProxyServer {
    /// new is a constructor for the ProxyServer type. The whitelist is
    /// seeded from the config.
    pub fn new(config: Config) -> Self {
        let filter = AddressFilter::new();
        filter.add(&config.whitelist);

        Self {
            config: Arc::new(config),
            filter: Arc::new(filter),
            workers: WorkerCounter::new(),
            state: ServerState::new(),
            dispatcher: Arc::new(Unbounded),
            listener: None,
        }
    }

    /// with_dispatch replaces the default unbounded task-per-tunnel dispatch
    pub fn with_dispatch(mut self, dispatcher: impl Dispatch + 'static) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// filter returns the shared whitelist, meant to be edited before serving
    pub fn filter(&self) -> Arc<AddressFilter> {
        Arc::clone(&self.filter)
    }

    pub fn workers(&self) -> WorkerCounter {
        self.workers.clone()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: self.state.clone(),
            workers: self.workers.clone(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// bind to the listen address with the configured backlog and mark the
    /// server active. Fails if already bound.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("[ERR] bind can only be called once");
        }
        self.config.validate()?;

        let listen = &self.config.listen;
        let addr = lookup_host(listen.to_string())
            .await
            .with_context(|| format!("[ERR] failed to resolve {listen}"))?
            .next()
            .ok_or_else(|| anyhow!("[ERR] no address found for {listen}"))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("[ERR] failed to create listening socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("[ERR] failed to bind {listen}"))?;
        let listener = socket
            .listen(self.config.backlog)
            .with_context(|| format!("[ERR] failed to listen on {listen}"))?;
        let addr = listener.local_addr()?;

        // DEBUG
        info!(
            "listening for connections on {addr} -> {}",
            self.config.remote
        );

        self.state.activate();
        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts connections until stopped or until accept fails. Each
    /// accept is bounded by ACCEPT_TIMEOUT so a stop request is noticed
    /// promptly.
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("[ERR] listener missing after bind"))?;

        while self.state.is_active() {
            match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
                Err(_elapsed) => continue,
                Ok(Ok((inbound, peer))) => self.admit(inbound, peer),
                Ok(Err(e)) => {
                    error!("[ERR] accept failed: {e}");
                    self.state.deactivate();
                    drop(listener);
                    return Err(anyhow!("[ERR] accept failed: {e}"));
                }
            }
        }

        drop(listener);
        info!("listener on {} closed", self.config.listen);
        Ok(())
    }

    /// admit filters an accepted connection and hands allowed ones off
    /// without waiting on them
    fn admit(&self, inbound: TcpStream, peer: SocketAddr) {
        if !self.filter.allow(&peer) {
            info!("connection from {peer} rejected");
            drop(inbound);
            return;
        }

        let worker = self.workers.enter();
        let relay = Relay::new(
            inbound,
            peer,
            Arc::clone(&self.config),
            self.state.clone(),
            worker,
        );
        self.dispatcher.dispatch(relay);
    }
}
