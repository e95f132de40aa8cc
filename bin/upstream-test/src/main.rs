//! Upstream connector test utility.
//!
//! This binary exercises the upstream input connector for development and
//! debugging purposes: a fake upstream source that speaks the SEEK /
//! WINDOWED / COMMITTED protocol, and a consumer that drives an
//! `UpstreamInput` through the host lifecycle.
//!
//! # Examples
//!
//! ```bash
//! # Start a fake upstream that serves 1000 numbered events
//! upstream-test serve --port 9999 --count 1000 --interval 10
//!
//! # In another terminal: consume them in 500 ms windows, committing
//! # two windows behind
//! upstream-test consume --address localhost:9999 --window-ms 500 --commit-lag 2
//!
//! # Run both in one process and verify ordering
//! upstream-test loopback --count 100
//! ```

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use sluice_api::prelude::*;
use sluice_connectors::upstream::{
    decode, Address, Command as UpstreamCommand, DataMessage, FrameCodec, UpstreamConfig,
    UpstreamInput,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "upstream-test")]
#[command(about = "Test utility for the Sluice upstream connector")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a fake upstream source that replays numbered events from SEEK
    Serve {
        /// Port to listen on
        #[arg(long, short, default_value = "9999")]
        port: u16,

        /// Number of events available (0 = infinite)
        #[arg(long, short, default_value = "0")]
        count: u64,

        /// Interval between events in milliseconds
        #[arg(long, short, default_value = "100")]
        interval: u64,

        /// Event prefix
        #[arg(long, default_value = "event")]
        prefix: String,
    },

    /// Consume from an upstream source, window by window
    Consume {
        /// Upstream address (host:port)
        #[arg(long, short, default_value = "localhost:9999")]
        address: Address,

        /// Number of windows to run
        #[arg(long, short, default_value = "20")]
        windows: u64,

        /// Window length in milliseconds
        #[arg(long, default_value = "500")]
        window_ms: u64,

        /// Commit this many windows behind the current one
        #[arg(long, default_value = "1")]
        commit_lag: u64,
    },

    /// Serve and consume in one process and check delivery order
    Loopback {
        /// Number of events to deliver
        #[arg(long, short, default_value = "10")]
        count: u64,

        /// Window length in milliseconds
        #[arg(long, default_value = "100")]
        window_ms: u64,
    },
}

/// Options for one consumer run.
struct ConsumeOptions {
    windows: u64,
    window_len: Duration,
    commit_lag: u64,
    /// Stop once this many records were received.
    until: Option<u64>,
    print: bool,
}

async fn cmd_serve(port: u16, count: u64, interval: u64, prefix: String) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port = port, count = count, "Starting fake upstream");
    println!("Listening on port {}. Run 'upstream-test consume --address localhost:{}'.", port, port);

    tokio::select! {
        result = accept_loop(listener, count, Duration::from_millis(interval), prefix) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

async fn accept_loop(listener: TcpListener, count: u64, interval: Duration, prefix: String) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(peer = %peer, "Connector connected");
        let prefix = prefix.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer, count, interval, prefix).await {
                warn!(peer = %peer, error = %e, "Connection ended with error");
            }
        });
    }
}

/// Replay events strictly after the SEEK offset. Event `n` has offset `n`,
/// starting at 1.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    count: u64,
    interval: Duration,
    prefix: String,
) -> Result<()> {
    let mut framed = Framed::new(stream, FrameCodec::new(MAX_FRAME_SIZE));

    let mut position = match framed.next().await {
        None => return Ok(()),
        Some(frame) => match UpstreamCommand::decode(&frame?)? {
            UpstreamCommand::Seek { offset } => offset.max(0),
            other => bail!("expected SEEK as first command, got {}", other),
        },
    };
    info!(peer = %peer, offset = position, "Replaying from SEEK");

    let available = |position: i64| count == 0 || (position as u64) < count;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(frame) = frame else {
                    info!(peer = %peer, "Connector disconnected");
                    return Ok(());
                };
                match UpstreamCommand::decode(&frame?)? {
                    UpstreamCommand::Windowed { event_count, idle_count } => {
                        info!(peer = %peer, events = event_count, idle = idle_count, "WINDOWED");
                    }
                    UpstreamCommand::Committed { offset } => {
                        info!(peer = %peer, offset = offset, "COMMITTED, may discard up to offset");
                    }
                    UpstreamCommand::Seek { offset } => {
                        info!(peer = %peer, offset = offset, "Re-seek");
                        position = offset.max(0);
                    }
                }
            }
            _ = ticker.tick(), if available(position) => {
                position += 1;
                let payload = Bytes::from(format!("{}-{}", prefix, position));
                framed.send(DataMessage::new(position, payload).to_bytes()).await?;
            }
        }
    }
}

fn run_consumer(address: Address, options: ConsumeOptions) -> Result<Vec<String>> {
    let collector = Collector::new();
    let mut input = UpstreamInput::new(UpstreamConfig::new(address.clone()), decode::utf8());
    input.output.connect(collector.sink());

    let backend = MemoryStateBackend::new();
    let (mut driver, recovered) =
        OperatorDriver::recover(input, OperatorContext::new(1, "upstream"), &backend)?;
    let first_window = recovered.map_or(1, |w| w + 1);

    driver.setup()?;
    driver.activate()?;
    info!(address = %address, "Consumer activated");

    let mut received = Vec::new();
    for window_id in first_window..first_window + options.windows {
        driver.begin_window(window_id)?;
        let deadline = Instant::now() + options.window_len;
        while Instant::now() < deadline {
            driver.emit_tuples()?;
        }
        driver.end_window()?;

        let records = collector.drain();
        if options.print {
            for record in &records {
                println!("  [{}] {}", window_id, record);
            }
        }
        received.extend(records);

        driver.checkpoint(window_id, &backend)?;
        if window_id >= first_window + options.commit_lag {
            driver.committed(window_id - options.commit_lag)?;
        }

        let operator = driver.operator();
        if let Some(counters) = operator.last_window() {
            info!(
                window_id = window_id,
                events = counters.event_count,
                idle = counters.idle_count,
                connected = operator.is_connected(),
                ledger = operator.ledger().len(),
                "Window complete"
            );
        }

        if options.until.is_some_and(|n| received.len() as u64 >= n) {
            break;
        }
    }

    for stats in driver.take_stats().last_windowed_stats {
        if let Some(status) = stats.custom_stats {
            info!(window_id = stats.window_id, connected = status.connected, "Connection status");
        }
    }

    driver.deactivate()?;
    driver.teardown()?;
    Ok(received)
}

async fn cmd_consume(address: Address, windows: u64, window_ms: u64, commit_lag: u64) -> Result<()> {
    info!(address = %address, windows = windows, window_ms = window_ms, "Starting consumer");
    let options = ConsumeOptions {
        windows,
        window_len: Duration::from_millis(window_ms),
        commit_lag,
        until: None,
        print: true,
    };
    let received = tokio::task::spawn_blocking(move || run_consumer(address, options)).await??;
    println!("\nReceived {} records", received.len());
    Ok(())
}

async fn cmd_loopback(count: u64, window_ms: u64) -> Result<()> {
    info!(count = count, "Starting loopback test");

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let server = tokio::spawn(accept_loop(listener, count, Duration::from_millis(5), "event".to_string()));

    let options = ConsumeOptions {
        windows: 10_000,
        window_len: Duration::from_millis(window_ms),
        commit_lag: 1,
        until: Some(count),
        print: false,
    };
    let address = Address::new("127.0.0.1", port);
    let consumer = tokio::task::spawn_blocking(move || run_consumer(address, options));
    let received = tokio::time::timeout(Duration::from_secs(30), consumer)
        .await
        .context("loopback timed out")???;
    server.abort();

    let expected: Vec<String> = (1..=count).map(|n| format!("event-{}", n)).collect();
    if received != expected {
        error!(received = received.len(), expected = expected.len(), "Loopback test failed");
        bail!("records arrived out of order or incomplete");
    }
    println!("\nLoopback test passed: {} records", received.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    match args.command {
        Command::Serve {
            port,
            count,
            interval,
            prefix,
        } => {
            cmd_serve(port, count, interval, prefix).await?;
        }
        Command::Consume {
            address,
            windows,
            window_ms,
            commit_lag,
        } => {
            cmd_consume(address, windows, window_ms, commit_lag).await?;
        }
        Command::Loopback { count, window_ms } => {
            cmd_loopback(count, window_ms).await?;
        }
    }

    Ok(())
}
