//! Echo server over the HTTP server transport
//!
//! Every connection sends back whatever it receives. The network is released
//! when standard input is closed.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;
use transport::{
    Connection, EarlyEventPolicy, HttpServerNetworkTransport, NewConnectionDelegate,
    ServerTransport, TransportConfig,
};

#[derive(Debug, Parser)]
struct Args {
    /// Port to listen on, 0 for an ephemeral port
    #[clap(short, long, default_value_t = 0)]
    port: u16,

    /// TOML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Override the configured handling of events arriving before delegates
    /// are registered (drop or buffer)
    #[clap(long)]
    early_events: Option<EarlyEventPolicy>,
}

fn echo(connection: Arc<dyn Connection>) {
    let peer = connection.peer_id().to_string();
    tracing::info!(%peer, "connection accepted");

    // the delegates keep the connection alive until it is broken
    let sender = Arc::clone(&connection);
    connection.set_data_received_delegate(Box::new(move |data: Vec<u8>| {
        tracing::debug!(peer = sender.peer_id(), bytes = data.len(), "echoing data");
        sender.send_data(data);
    }));

    let breaker = Arc::clone(&connection);
    connection.set_broken_delegate(Box::new(move || {
        tracing::info!(%peer, "connection broken by peer");
        breaker.break_connection(false);
    }));
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    color_eyre::install()?;

    let args = Args::parse();
    tracing::debug!(?args, "parsed command line arguments");

    let mut config = match &args.config {
        Some(path) => TransportConfig::from_path(path).wrap_err("loading configuration")?,
        None => TransportConfig::default(),
    };
    if let Some(early_events) = args.early_events {
        config.early_events = early_events;
    }

    let mut transport = HttpServerNetworkTransport::with_config(config);
    let delegate: NewConnectionDelegate = Arc::new(echo);
    transport
        .bind_network(args.port, delegate)
        .wrap_err_with(|| format!("binding port {}", args.port))?;
    tracing::info!(port = transport.bound_port(), "serving, close stdin to stop");

    let mut sink = Vec::new();
    std::io::stdin()
        .read_to_end(&mut sink)
        .wrap_err("reading standard input")?;

    transport.release_network();
    Ok(())
}
