//! nanit-bridge - keeps Nanit cameras streaming into a local RTMP server.
//!
//! Usage:
//!   nanit-bridge login
//!   nanit-bridge cameras
//!   nanit-bridge stream <baby-uid>...
//!   nanit-bridge picture <baby-uid>
//!
//! While streaming, ingest notifications are read from stdin, one per line:
//! `publish <path>` or `unpublish <path>` (e.g. `publish /live/<baby-uid>`).

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use nanit_bridge_core::auth::AuthOutcome;
use nanit_bridge_core::reconciler::IngestNotifier;
use nanit_bridge_core::{Config, NanitBridge};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file name prefix inside `NANIT_LOG_DIR`
const LOG_FILE_PREFIX: &str = "nanit-bridge.log";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("NANIT_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    let mut config = Config::load()?;
    match command.as_str() {
        "login" => login(&mut config).await,
        "cameras" => cameras(&config).await,
        "stream" => stream(&config, &args[1..]).await,
        "picture" => picture(&config, &args[1..]).await,
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("Unknown command: {}", other)
        }
    }
}

fn print_usage() {
    eprintln!("Usage: nanit-bridge <login | cameras | stream <baby-uid>... | picture <baby-uid>>");
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{}", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Interactive login, including the MFA code round trip
async fn login(config: &mut Config) -> Result<()> {
    if config.email.is_none() {
        config.email = Some(prompt("Email: ")?);
    }
    if config.password.is_none() {
        config.password = Some(rpassword::prompt_password("Password: ")?);
    }

    let bridge = NanitBridge::from_config(config).await?;
    let mut outcome = bridge.login(None).await?;
    if outcome == AuthOutcome::MfaRequired {
        let code = prompt("MFA code: ")?;
        outcome = bridge.login(Some(&code)).await?;
    }
    bridge.shutdown().await;

    match outcome {
        AuthOutcome::Authenticated => {
            config.save().context("Failed to save config")?;
            eprintln!("Logged in.");
            Ok(())
        }
        AuthOutcome::MfaRequired => bail!("MFA code was not accepted"),
    }
}

async fn cameras(config: &Config) -> Result<()> {
    let bridge = NanitBridge::from_config(config).await?;
    let result = bridge.sync_devices().await;
    bridge.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn picture(config: &Config, cameras: &[String]) -> Result<()> {
    let [camera] = cameras else {
        bail!("picture takes exactly one baby uid");
    };
    let bridge = NanitBridge::from_config(config).await?;
    let result = bridge.take_picture(camera).await;
    bridge.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

/// Start streaming for each camera, then supervise until ctrl-c.
async fn stream(config: &Config, cameras: &[String]) -> Result<()> {
    if cameras.is_empty() {
        bail!("stream needs at least one baby uid");
    }
    let bridge = NanitBridge::from_config(config).await?;

    for camera in cameras {
        match bridge.request_stream(camera).await {
            Ok(source) => println!("{}", serde_json::to_string(&source)?),
            Err(e) => {
                bridge.shutdown().await;
                return Err(e).with_context(|| format!("Failed to start stream for {}", camera));
            }
        }
    }

    info!("Streaming, press ctrl-c to stop");
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        result = forward_ingest_events(bridge.notifier()) => result?,
    }

    bridge.shutdown().await;
    Ok(())
}

/// Relay `publish <path>` / `unpublish <path>` lines from stdin.
async fn forward_ingest_events(notifier: IngestNotifier) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.split_once(char::is_whitespace) {
            Some(("publish", path)) => notifier.on_publish(path.trim()),
            Some(("unpublish", path)) => notifier.on_unpublish(path.trim()),
            _ if line.trim().is_empty() => {}
            _ => warn!(line = %line, "Unrecognised ingest event"),
        }
    }
    // stdin closed; keep supervising until ctrl-c
    std::future::pending::<()>().await;
    Ok(())
}
