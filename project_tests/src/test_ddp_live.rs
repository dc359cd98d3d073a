//! # DDP Live Snapshot Test
//!
//! Connects to a real Meteor server, subscribes, waits for readiness and
//! prints one snapshot per collection, then streams changes for a while.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use lib_ddp::transport::WsConnector;
use lib_ddp::{ConnectionConfig, DdpTrigger, Emitter, Record, StartMode, SubscriptionSpec, TriggerConfig, TriggerError};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(about = "Live check of the DDP client against a Meteor server")]
struct Args {
    #[clap(long, env = "DDP_URL")]
    url: String,

    #[clap(long = "subscription", required = true)]
    subscriptions: Vec<String>,

    #[clap(long = "collection", required = true)]
    collections: Vec<String>,

    /// Seconds to keep printing pushed changes after the snapshot.
    #[clap(long, default_value_t = 10)]
    watch_secs: u64,

    #[clap(long, default_value_t = 30)]
    timeout_secs: u64,
}

/// Prints what the trigger emits.
struct ConsoleEmitter {
    started: Instant,
}

impl Emitter for ConsoleEmitter {
    fn emit(&self, records: Vec<Record>) {
        let at = chrono::Local::now().format("%H:%M:%S%.3f");
        for record in records {
            let data = serde_json::to_string_pretty(&record.data).unwrap_or_else(|_| record.data.to_string());
            println!("[{}] (+{:?}) {}: {}", at, self.started.elapsed(), record.name, data);
        }
    }

    fn emit_error(&self, error: TriggerError) {
        eprintln!("[ERROR] {}", error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let connection = ConnectionConfig::new(&args.url)?.with_connect_timeout(Duration::from_secs(args.timeout_secs));
    let mut config = TriggerConfig::new(connection).with_start_mode(StartMode::WaitConnected);
    for name in &args.subscriptions {
        config = config.subscribe(SubscriptionSpec::new(name.as_str()));
    }
    for name in &args.collections {
        config = config.collection(name.as_str());
    }

    println!("[*] Connecting to {} ...", config.connection.endpoint);
    let trigger = Arc::new(DdpTrigger::new(config, WsConnector::new(), ConsoleEmitter { started: Instant::now() }));
    trigger.start().await?;

    println!("[*] Waiting for subscriptions to become ready...");
    match tokio::time::timeout(Duration::from_secs(args.timeout_secs), trigger.fetch()).await {
        Ok(Ok(())) => println!("\n[SUCCESS] Snapshot emitted above."),
        Ok(Err(e)) => {
            eprintln!("\n[ERROR] Fetch failed:\n>>> {}", e);
            trigger.stop().await;
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("\n[ERROR] Subscriptions not ready after {}s", args.timeout_secs);
            trigger.stop().await;
            std::process::exit(1);
        }
    }

    println!("[*] Streaming changes for {}s...", args.watch_secs);
    tokio::time::sleep(Duration::from_secs(args.watch_secs)).await;

    trigger.stop().await;
    println!("[INFO] Final state: {}", trigger.state());
    Ok(())
}
