use std::process;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::time;

use flowsync_lib::config::Config;
use flowsync_lib::conn::{self, Conn};
use flowsync_lib::engine::Engine;
use flowsync_lib::logging;
use flowsync_lib::monitor::Monitor;
use flowsync_lib::scan::{Scan, ScanOutcome};

mod cli;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn io_exit(error: conn::Error) -> exitcode::ExitCode {
    tracing::error!(%error, "netlink I/O failure");
    exitcode::IOERR
}

fn flush_outgoing(engine: &mut Engine, action: &mut Conn) -> Result<(), exitcode::ExitCode> {
    while let Some(msg) = engine.next_outgoing() {
        action.send_request(msg).map_err(io_exit)?;
    }
    Ok(())
}

/// Wait out whatever the queue still has in flight, bounded; used before a
/// clean exit so a one-off run leaves its mutations applied.
async fn drain_queue(engine: &mut Engine, action: &mut Conn) -> Result<(), exitcode::ExitCode> {
    let deadline = time::sleep(DRAIN_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        flush_outgoing(engine, action)?;
        if engine.queue_idle() {
            return Ok(());
        }
        tokio::select! {
            _ = &mut deadline => {
                tracing::warn!("gave up waiting for pending requests");
                return Ok(());
            }
            burst = action.recv_burst() => {
                let burst = burst.map_err(io_exit)?;
                if let Some(completion) = burst.completion {
                    engine.on_action_complete(completion.errno);
                }
            }
        }
    }
}

async fn run(cfg: Config) -> Result<(), exitcode::ExitCode> {
    let mut engine = Engine::new(cfg.clone());
    engine.seed_static_rules();

    let mut monitor = Monitor::open().map_err(io_exit)?;
    let mut action = Conn::open("action", &[]).map_err(io_exit)?;
    let mut scan = Scan::open(&cfg).map_err(io_exit)?;

    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;

    // the first tick fires immediately, starting the initial scan
    let mut scan_tick = time::interval(cfg.scan_interval);
    scan_tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let timeout = async {
        match cfg.timeout {
            Some(t) => time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout);

    tracing::info!("entering main event loop");

    loop {
        flush_outgoing(&mut engine, &mut action)?;

        tokio::select! {
            _ = &mut timeout => {
                tracing::info!("timeout reached");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
                break;
            }
            _ = scan_tick.tick(), if scan.is_idle() => {
                scan.start().map_err(io_exit)?;
            }
            burst = scan.recv_burst(), if !scan.is_idle() => {
                let burst = burst.map_err(io_exit)?;
                for msg in &burst.messages {
                    engine.handle_raw(msg);
                }
                if let Some(completion) = burst.completion {
                    if completion.errno != 0 {
                        tracing::warn!(errno = completion.errno, "scan dump failed");
                    }
                    let outcome = scan.on_stage_complete(&mut engine).map_err(io_exit)?;
                    if outcome == ScanOutcome::CycleDone && cfg.one_off {
                        drain_queue(&mut engine, &mut action).await?;
                        tracing::info!("one-off sync complete");
                        return Ok(());
                    }
                }
            }
            burst = monitor.recv_burst() => {
                let burst = burst.map_err(io_exit)?;
                for msg in &burst.messages {
                    engine.handle_raw(msg);
                }
            }
            burst = action.recv_burst(), if engine.queue_busy() => {
                let burst = burst.map_err(io_exit)?;
                for msg in &burst.messages {
                    engine.handle_raw(msg);
                }
                if let Some(completion) = burst.completion {
                    engine.on_action_complete(completion.errno);
                }
            }
        }
    }

    // installed rules stay behind on purpose: the next run recognizes them
    // through the lost-and-found index instead of reinstalling
    drain_queue(&mut engine, &mut action).await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = cli::parse();
    logging::init(args.verbose);

    let cfg = match cli::build_config(&args) {
        Ok(cfg) => cfg,
        Err(error) => {
            tracing::error!(%error, "invalid configuration");
            process::exit(exitcode::USAGE);
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        ifname = %cfg.ifname,
        table_id = cfg.table_id,
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    match run(cfg).await {
        Ok(()) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
