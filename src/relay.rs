use crate::{
    config::{Config, MAX_BLOCK_SIZE},
    server::ServerState,
    workers::WorkerGuard,
};
use anyhow::{Result, anyhow};
use std::{fmt, io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info};

/// Side names one end of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Remote => f.write_str("remote"),
        }
    }
}

/// Closure records why a tunnel's relay loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// The given side reached end-of-stream
    Closed(Side),
    /// Reading from the given side failed
    ReadFailed(Side),
    /// Writing to the given side failed
    WriteFailed(Side),
    /// The server stopped while the tunnel was running
    Shutdown,
}

/// TunnelSummary is what a finished relay reports back
#[derive(Debug, Clone)]
pub struct TunnelSummary {
    pub peer: SocketAddr,
    pub from_client: u64,
    pub from_remote: u64,
    pub closure: Closure,
}

/// Relay owns one accepted client connection and carries it through a full
/// tunnel lifecycle: dial the remote, shuttle bytes both ways, tear down.
///
/// A single task services both directions. Each iteration reads the remote
/// then the client, every read bounded by the configured read timeout, so
/// neither side can starve the other and the server's active flag is checked
/// at least once per two timeouts.
pub struct Relay {
    inbound: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    state: ServerState,
    worker: WorkerGuard,
}

/// Step is the outcome of one bounded read-then-forward attempt
enum Step {
    Idle,
    Forwarded(usize),
    Eof,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

impl Relay {
    /// new takes over an accepted connection. The worker guard keeps the
    /// tunnel counted until the relay is dropped.
    pub fn new(
        inbound: TcpStream,
        peer: SocketAddr,
        config: Arc<Config>,
        state: ServerState,
        worker: WorkerGuard,
    ) -> Self {
        Self {
            inbound,
            peer,
            config,
            state,
            worker,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// run dials the remote endpoint and relays until either side closes,
    /// an I/O error occurs, or the server goes inactive
    pub async fn run(self) -> Result<TunnelSummary> {
        let Relay {
            mut inbound,
            peer,
            config,
            state,
            worker,
        } = self;
        let remote = &config.remote;

        // Dial, no retry
        let mut outbound = match TcpStream::connect(remote.to_string()).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = inbound.shutdown().await;
                drop(inbound);
                drop(worker);
                return Err(anyhow!("[ERR] failed to dial {remote} for {peer}: {e}"));
            }
        };

        // DEBUG
        info!("tunneling: {peer} ==> {remote}");

        let wait = config.read_timeout;
        let mut buf = vec![0u8; config.block_size.clamp(1, MAX_BLOCK_SIZE)];
        let mut from_client = 0u64;
        let mut from_remote = 0u64;

        let closure = loop {
            if !state.is_active() {
                break Closure::Shutdown;
            }

            // Remote -> client
            let step = pump(&mut outbound, &mut inbound, &mut buf, wait).await;
            if let Some(closure) = settle(step, Side::Remote, &mut from_remote, peer) {
                break closure;
            }

            // Client -> remote
            let step = pump(&mut inbound, &mut outbound, &mut buf, wait).await;
            if let Some(closure) = settle(step, Side::Client, &mut from_client, peer) {
                break closure;
            }
        };

        // Best-effort close, errors are irrelevant at this point
        let _ = inbound.shutdown().await;
        let _ = outbound.shutdown().await;
        drop(inbound);
        drop(outbound);
        drop(worker);

        // DEBUG
        info!(
            "tunnel closed ({closure:?}): {peer}, {} bytes from client, {} bytes from remote",
            from_client, from_remote
        );

        Ok(TunnelSummary {
            peer,
            from_client,
            from_remote,
            closure,
        })
    }
}

/// pump reads at most one block from `from` within `wait` and forwards it
/// in full to `to`
async fn pump(from: &mut TcpStream, to: &mut TcpStream, buf: &mut [u8], wait: Duration) -> Step {
    let n = match timeout(wait, from.read(buf)).await {
        Err(_elapsed) => return Step::Idle,
        Ok(Ok(0)) => return Step::Eof,
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Step::ReadFailed(e),
    };

    match to.write_all(&buf[..n]).await {
        Ok(()) => Step::Forwarded(n),
        Err(e) => Step::WriteFailed(e),
    }
}

/// settle accounts for a step taken while reading from `source` and decides
/// whether the tunnel should close
fn settle(step: Step, source: Side, total: &mut u64, peer: SocketAddr) -> Option<Closure> {
    let sink = match source {
        Side::Client => Side::Remote,
        Side::Remote => Side::Client,
    };

    match step {
        Step::Idle => None,
        Step::Forwarded(n) => {
            *total += n as u64;
            debug!("{peer}: {source} ({n} bytes) ==> {sink}");
            None
        }
        Step::Eof => Some(Closure::Closed(source)),
        Step::ReadFailed(e) => {
            debug!("{peer}: read from {source} failed: {e}");
            Some(Closure::ReadFailed(source))
        }
        Step::WriteFailed(e) => {
            debug!("{peer}: write to {sink} failed: {e}");
            Some(Closure::WriteFailed(sink))
        }
    }
}
