use std::sync::Arc;

use anyhow::Result;
use lib_ddp::transport::WsConnector;
use lib_ddp::DdpTrigger;
use std::io::BufRead;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

mod ddp_logic;
use ddp_logic::{config, logger, sink::JsonLinesSink};

type Trigger = DdpTrigger<WsConnector, JsonLinesSink<std::io::Stdout>>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let _log_guard = logger::setup_logging(&config.log_dir(), config.log_level())?;

    let trigger_config = config.trigger_config()?;
    tracing::info!("{}", trigger_config);
    let trigger: Arc<Trigger> = Arc::new(DdpTrigger::new(trigger_config, WsConnector::new(), JsonLinesSink::stdout()));

    let (shutdown_tx, _) = broadcast::channel(1);

    if let Err(e) = trigger.start().await {
        tracing::error!(error = %e, "Initial connection failed");
        trigger.stop().await;
        return Err(e.into());
    }

    let mut quit = shutdown_tx.subscribe();
    let commands_handle = tokio::spawn(read_commands(
        Arc::clone(&trigger),
        spawn_stdin_reader(),
        shutdown_tx.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            tracing::info!("SIGTERM received, initiating shutdown.");
        }
        _ = quit.recv() => {
            tracing::info!("Quit command received, initiating shutdown.");
        }
    }

    let _ = shutdown_tx.send(());
    trigger.stop().await;
    let _ = commands_handle.await;

    let sink = trigger.emitter();
    tracing::info!(batches = sink.batches(), errors = sink.errors(), "Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Forwards stdin lines from a plain thread. The thread is never joined, so a
/// pending blocking read cannot hold up process exit.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// # Command Loop
///
/// Handles stdin commands line by line:
/// - `fetch`: runs the pull path in its own task, so a fetch waiting for
///   readiness never blocks further commands.
/// - `quit`: requests shutdown.
///
/// End of input only stops the loop; the push path keeps running.
async fn read_commands(
    trigger: Arc<Trigger>,
    mut lines: mpsc::UnboundedReceiver<std::io::Result<String>>,
    quit: broadcast::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.recv() => return,
            line = lines.recv() => line,
        };
        match line {
            Some(Ok(line)) => match line.trim() {
                "" => {}
                "fetch" => {
                    let trigger = Arc::clone(&trigger);
                    tokio::spawn(async move {
                        if let Err(e) = trigger.fetch().await {
                            tracing::warn!(error = %e, "Fetch failed");
                        }
                    });
                }
                "quit" => {
                    let _ = quit.send(());
                    return;
                }
                other => tracing::warn!(command = %other, "Unknown command (expected fetch or quit)"),
            },
            None => {
                tracing::debug!("Stdin closed, command loop finished");
                return;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to read stdin");
                return;
            }
        }
    }
}
