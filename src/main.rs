use anyhow::Result;
use clap::{CommandFactory, Parser};
use std::time::Duration;
use tcproxy::{
    Config, Endpoint, ProxyServer,
    config::{DEFAULT_BACKLOG, DEFAULT_BLOCK_SIZE, DEFAULT_READ_TIMEOUT},
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "A static TCP proxy", long_about = None)]
struct Args {
    /// Address to listen on <host:port>
    #[arg(short, long)]
    lhost: Option<Endpoint>,

    /// Remote address to route to <host:port>
    #[arg(short, long)]
    rhost: Option<Endpoint>,

    /// Bytes to read per socket cycle
    #[arg(short, long = "blocksize", default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Hosts to whitelist <host1,host2,..>
    #[arg(short, long, value_delimiter = ',')]
    whitelist: Vec<String>,

    /// Verbosity level: 0 = quiet, 1 = verbose, 2 = very verbose
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    verbosity: u8,

    /// Pending connection queue depth
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    backlog: u32,

    /// Relay read timeout in milliseconds
    #[arg(long = "timeout", default_value_t = DEFAULT_READ_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,
}

impl Args {
    /// config builds the validated proxy config, None when either endpoint
    /// is missing
    fn config(self) -> Result<Option<Config>> {
        let (Some(lhost), Some(rhost)) = (self.lhost, self.rhost) else {
            return Ok(None);
        };

        let config = Config::new(lhost, rhost)
            .with_block_size(self.block_size)
            .with_backlog(self.backlog)
            .with_read_timeout(Duration::from_millis(self.timeout_ms))
            .with_verbosity(self.verbosity)
            .with_whitelist(self.whitelist);
        config.validate()?;

        Ok(Some(config))
    }
}

/// log_level maps verbosity to the tracing filter
fn log_level(verbosity: u8) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();
    let level = log_level(args.verbosity);

    // Both endpoints are required, otherwise print usage and do nothing
    let Some(config) = args.config()? else {
        Args::command().print_help()?;
        println!();
        return Ok(());
    };

    // Initialize tracing subscriber
    tracing_subscriber::fmt().with_max_level(level).init();

    if !config.whitelist.is_empty() {
        info!("whitelist enabled: {}", config.whitelist.join(", "));
    }

    // Instantiate server
    let mut server = ProxyServer::new(config);
    let handle = server.handle();
    let drain = server.handle();

    // Stop accepting on ctrl-c
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => handle.stop(),
            Err(e) => error!("failed to listen for ctrl-c: {e}"),
        }
    });

    // Run it
    let result = server.run().await;

    // Let running tunnels finish before the runtime goes away
    if drain.has_workers() {
        info!("waiting for {} tunnel(s) to close", drain.workers());
    }
    drain.drained().await;

    result
}
