//! tripwire-daemon - automation engine fed by JSON-lines events on stdin.
//!
//! Each stdin line is an `AutomationEvent`, for example
//! `{"type":"custom","name":"purchase","value":3}` or `{"type":"foreground"}`.
//! Fired schedules are logged.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tripwire_core::{
    Automation, AutomationEvent, AutomationRuntime, EngineConfig, LoggingExecutor, ScheduleInfo,
};

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_config() -> anyhow::Result<EngineConfig> {
    match std::env::var("TRIPWIRE_CONFIG") {
        Ok(path) => EngineConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path)),
        Err(_) => EngineConfig::from_env().context("invalid TRIPWIRE_* environment"),
    }
}

/// Read seed schedules from `TRIPWIRE_SCHEDULES` when the store is empty.
fn load_seed(runtime: &AutomationRuntime) -> anyhow::Result<Vec<ScheduleInfo>> {
    let Ok(path) = std::env::var("TRIPWIRE_SCHEDULES") else {
        return Ok(Vec::new());
    };

    let existing = runtime.store().schedule_count()?;
    if existing > 0 {
        info!(existing, "Store already holds schedules; skipping seed file");
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read schedules from {}", path))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse schedules in {}", path))
}

/// Track each JSON-lines event from `reader` until it closes.
async fn pump_events<R>(reader: R, automation: &Automation) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AutomationEvent>(line) {
            Ok(event) => automation.track(event)?,
            Err(e) => warn!(error = %e, line, "Ignoring malformed event"),
        }
    }

    info!("Event stream closed");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("tripwire_core=debug".parse()?),
        )
        .init();

    let config = load_config()?;
    let runtime = AutomationRuntime::new(config, Arc::new(LoggingExecutor))?;

    let seed = load_seed(&runtime)?;
    let seeded = runtime.start_with_schedules(seed).await?;
    info!(seeded = seeded.len(), "tripwire-daemon ready; reading events from stdin");

    let automation = runtime.automation();
    tokio::select! {
        result = pump_events(BufReader::new(tokio::io::stdin()), &automation) => result?,
        _ = shutdown_signal() => info!("Shutdown signal received, stopping engine..."),
    }

    // Let queued events settle before tearing down
    if let Err(e) = runtime.automation().flush().await {
        warn!(error = %e, "Failed to flush automation queue");
    }
    runtime.shutdown().await;

    info!("Daemon stopped cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripwire_core::{ChannelExecutor, Trigger};

    #[tokio::test]
    async fn test_pumped_events_settle_on_flush() {
        let (executor, mut rx) = ChannelExecutor::new();
        let config = EngineConfig::builder().in_memory().build();
        let runtime = AutomationRuntime::new(config, Arc::new(executor)).unwrap();
        let seeded = runtime
            .start_with_schedules(vec![
                ScheduleInfo::new().with_trigger(Trigger::custom_event_count("purchase", 2.0))
            ])
            .await
            .unwrap();

        let input = b"{\"type\":\"custom\",\"name\":\"purchase\"}\n\
                      not json\n\
                      \n\
                      {\"type\":\"custom\",\"name\":\"purchase\"}\n";
        let automation = runtime.automation();
        pump_events(&input[..], &automation).await.unwrap();
        automation.flush().await.unwrap();

        let dispatched = rx.try_recv().unwrap();
        assert_eq!(dispatched.id, seeded[0].id);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_pump_stops_when_engine_is_down() {
        let (executor, _rx) = ChannelExecutor::new();
        let config = EngineConfig::builder().in_memory().build();
        let runtime = AutomationRuntime::new(config, Arc::new(executor)).unwrap();
        runtime.start().await.unwrap();
        runtime.shutdown().await;

        let automation = runtime.automation();
        let result = pump_events(&b"{\"type\":\"foreground\"}\n"[..], &automation).await;
        assert!(result.is_err());
    }
}
