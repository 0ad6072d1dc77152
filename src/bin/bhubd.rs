//! Broadcast hub server daemon.

use std::net::TcpListener;
use std::process::ExitCode;
use std::thread;

use clap::Parser;

use bhub::Hub;
use bhub::conn::SocketAcceptor;

const DEFAULT_ADDR: &str = "127.0.0.1:2593";

#[derive(Parser, Debug)]
#[command(
    name = "bhubd",
    version,
    about = "The broadcast hub server, relaying messages between connected clients"
)]
struct Args {
    /// Address to listen on (falls back to BHUB_ADDR, then 127.0.0.1:2593).
    #[arg(long, short = 'l', value_name = "ADDR")]
    listen: Option<String>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    bhub::telemetry::init(args.verbose);

    let addr = args
        .listen
        .or_else(|| std::env::var("BHUB_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let listener = match TcpListener::bind(&addr) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("listening on {addr}");

    let hub = Hub::new();
    if !hub.add_listener(SocketAcceptor::new(listener)) {
        tracing::error!("failed to start the accept loop");
        return ExitCode::FAILURE;
    }

    // All the work happens on the hub's session threads.
    loop {
        thread::park();
    }
}
