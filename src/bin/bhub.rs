//! Broadcast hub client CLI.

use std::process::ExitCode;

use bytes::Bytes;
use clap::{Parser, Subcommand};

use bhub::{Client, ClientId};

const DEFAULT_ADDR: &str = "127.0.0.1:2593";

#[derive(Parser, Debug)]
#[command(
    name = "bhub",
    version,
    about = "Broadcast hub client, for talking to other clients through a hub"
)]
struct Args {
    /// Hub address (falls back to BHUB_ADDR, then 127.0.0.1:2593).
    #[arg(long, short = 'a', value_name = "ADDR")]
    addr: Option<String>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print this client's hub-assigned handle.
    Id,
    /// List the other clients connected to the hub.
    List,
    /// Relay a payload to the given destination handles.
    Relay {
        /// Destination handles.
        #[arg(required = true, value_name = "HANDLE")]
        dest: Vec<u64>,
        /// Payload to relay (at most 1024 bytes).
        #[arg(long, short = 'm', value_name = "TEXT")]
        message: String,
    },
    /// Stay connected and print relay indications as they arrive.
    Watch,
}

fn main() -> ExitCode {
    let args = Args::parse();
    bhub::telemetry::init(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let addr = args
        .addr
        .or_else(|| std::env::var("BHUB_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let client = Client::connect(addr.as_str())?;
    let cid = client.identify()?;
    tracing::debug!(client = %cid, "connected to {addr}");

    match args.command {
        Command::Id => println!("{cid}"),
        Command::List => {
            for other in client.list_others()? {
                println!("{other}");
            }
        }
        Command::Relay { dest, message } => {
            let dest: Vec<ClientId> = dest.into_iter().map(ClientId).collect();
            let outcome = client.relay(Bytes::from(message.into_bytes()), dest)?;
            if outcome.fully_delivered() {
                println!("delivered");
            } else {
                println!("overall: {}", outcome.status);
                for (cid, status) in &outcome.status_map {
                    println!("{cid}: {status}");
                }
            }
        }
        Command::Watch => {
            eprintln!("client {cid} watching; ctrl-c to stop");
            for ind in client.relays().iter() {
                match std::str::from_utf8(&ind.msg) {
                    Ok(text) => println!("{}: {text}", ind.src),
                    Err(_) => println!("{}: {:02x?}", ind.src, ind.msg.as_ref()),
                }
            }
        }
    }
    Ok(())
}
