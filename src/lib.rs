//! A static TCP proxy library
//!
//! Listens on a fixed local address and forwards every accepted connection,
//! byte for byte and in both directions, to a single fixed remote address.
//!
//! - Features:
//!     - Optional client whitelist (empty means allow all)
//!     - Count of active tunnels
//!     - One task per tunnel, alternating timed reads on both sockets
//!     - Cooperative shutdown through a shared active flag
//!
//! # Example
//! ```no_run
//! use tcproxy::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::new("127.0.0.1:9000".parse()?, "127.0.0.1:9001".parse()?)
//!         .with_whitelist(["127.0.0.1"]);
//!     let mut server = ProxyServer::new(config);
//!     server.run().await
//! }
//! ```

pub mod config;
pub mod filter;
pub mod relay;
pub mod server;
pub mod workers;

// Re-export main types at crate root for convenience
pub use config::{Config, Endpoint};
pub use filter::AddressFilter;
pub use relay::{Closure, Relay, Side, TunnelSummary};
pub use server::{Dispatch, ProxyServer, ServerHandle, ServerState, Unbounded};
pub use workers::{WorkerCounter, WorkerGuard};
