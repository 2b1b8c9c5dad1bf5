use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use screen_rewards::config::{
    AppCategory, EXAMPLE_CONFIG, RewardsConfig, get_config_path, load_config,
};
use screen_rewards::platform::common::atomic_write;
use screen_rewards::rewards::{ActivityEvent, ExemptionEvent, LoggingEnforcer, RewardsService};
use screen_rewards::{AppId, ChildId, JsonFileStore, SystemClock};

use super::utils::format_duration;

fn resolve_config_path(config: Option<&Path>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(path.to_path_buf()),
        None => get_config_path(),
    }
}

fn load(config: Option<&Path>) -> Result<RewardsConfig> {
    let path = resolve_config_path(config)?;
    if !path.exists() {
        anyhow::bail!(
            "Configuration file not found: {}\nRun 'screen-rewards init' to create one",
            path.display()
        );
    }
    load_config(&path)
}

/// Open the service over the configured data directory and restore its windows
pub async fn open_service(config: Option<&Path>) -> Result<RewardsService> {
    let config = load(config)?;
    let data_dir = config.data_dir()?;
    info!("Using data directory: {}", data_dir.display());
    let store = JsonFileStore::open(&data_dir)?;

    let service = RewardsService::open(
        config,
        Arc::new(store),
        Arc::new(LoggingEnforcer),
        Arc::new(SystemClock),
    )?;
    let restored = service.restore().await?;
    debug!("Restored {} earned-time windows", restored);
    Ok(service)
}

/// Write the example configuration
pub fn init(output: Option<PathBuf>, device_id: Option<String>, force: bool) -> Result<()> {
    let output_path = match output {
        Some(path) => path,
        None => get_config_path()?,
    };

    if output_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            output_path.display()
        );
    }

    let content = match &device_id {
        Some(id) => EXAMPLE_CONFIG.replacen("id: parent-phone", &format!("id: {}", id), 1),
        None => EXAMPLE_CONFIG.to_string(),
    };
    let parsed: RewardsConfig =
        serde_yaml::from_str(&content).context("Generated configuration is not valid YAML")?;
    screen_rewards::config::validate_config(&parsed)?;

    atomic_write(&output_path, content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", output_path.display()))?;

    println!("✓ Created rewards configuration file: {}", output_path.display());
    println!("  Device id: {}", parsed.device.id);
    println!("\nEdit this file to classify apps and tune accrual and redemption.");
    println!("Then feed activity events to: screen-rewards run");

    Ok(())
}

/// Print the app id a platform token maps to on this device
pub fn app_id(config: Option<&Path>, token: &str) -> Result<()> {
    let config = load(config)?;
    let app_id = AppId::from_platform_token(token.as_bytes(), &config.device.generation);
    println!("{}", app_id);
    Ok(())
}

pub fn balance(service: &RewardsService, child: &str) -> Result<()> {
    let child_id = ChildId::new(child);
    let balances = service.balances(&child_id);

    println!("Balance for {}: {} points", child_id, service.total_balance(&child_id));
    if balances.is_empty() {
        println!("  No ledger entries");
        return Ok(());
    }
    for (scope, points) in balances {
        match scope {
            Some(app_id) => println!("  {}: {}", app_id, points),
            None => println!("  global: {}", points),
        }
    }
    Ok(())
}

pub fn history(service: &RewardsService, child: &str, limit: usize) -> Result<()> {
    let child_id = ChildId::new(child);
    let entries = service.history(&child_id, Some(limit));
    if entries.is_empty() {
        println!("No ledger entries for {}", child_id);
        return Ok(());
    }

    for entry in entries {
        let scope = entry
            .app_id
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "global".to_string());
        let kind = format!("{:?}", entry.kind).to_lowercase();
        print!(
            "{}  {:<10} {:>+6}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            kind,
            entry.amount,
            scope
        );
        match &entry.reason {
            Some(reason) => println!("  ({})", reason),
            None => println!(),
        }
    }
    Ok(())
}

pub async fn adjust(
    service: &RewardsService,
    child: &str,
    points: i64,
    reason: &str,
    app: Option<&str>,
) -> Result<()> {
    let child_id = ChildId::new(child);
    let app_id = app.map(AppId::new);
    let entry = service
        .adjust(&child_id, app_id.as_ref(), points, reason)
        .await
        .with_context(|| format!("Failed to adjust balance for {}", child_id))?;

    println!("✓ Adjusted {} by {:+} points", child_id, entry.amount);
    println!("  New balance: {}", service.total_balance(&child_id));
    Ok(())
}

pub async fn redeem(
    service: &RewardsService,
    child: &str,
    points: i64,
    app: Option<&str>,
) -> Result<()> {
    let child_id = ChildId::new(child);
    let app_id = app.map(AppId::new);
    let redemption = service
        .redeem(&child_id, points, app_id.as_ref())
        .await
        .with_context(|| format!("Failed to redeem {} points for {}", points, child_id))?;

    println!(
        "✓ Redeemed {} points for {} of earned time",
        redemption.points,
        format_duration(chrono::Duration::seconds(redemption.seconds))
    );
    println!(
        "  Window ends at {}",
        redemption.window.end_time().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Remaining balance: {}", service.total_balance(&child_id));
    Ok(())
}

pub fn status(service: &RewardsService, child: Option<&str>) -> Result<()> {
    let children = match child {
        Some(child) => vec![ChildId::new(child)],
        None => service.children(),
    };
    println!("Device: {}", service.device_id());
    println!("Reward apps: {}", service.reward_apps().len());
    println!();

    if children.is_empty() {
        println!("No children with points or earned time");
        return Ok(());
    }

    let now = service.now();
    for child_id in children {
        println!("{}: {} points", child_id, service.total_balance(&child_id));
        match service.active_window(&child_id) {
            Some(window) => println!(
                "  Earned time: {} remaining (until {})",
                format_duration(chrono::Duration::seconds(window.remaining_seconds(now))),
                window.end_time().format("%H:%M:%S UTC")
            ),
            None => println!("  Earned time: none"),
        }
        for window in service.queued_windows(&child_id) {
            println!(
                "  Queued: {} starting {}",
                format_duration(chrono::Duration::seconds(window.duration_seconds)),
                window.start_time.format("%H:%M:%S UTC")
            );
        }
    }
    Ok(())
}

pub async fn cancel(service: &RewardsService, child: &str) -> Result<()> {
    let child_id = ChildId::new(child);
    let cancelled = service
        .cancel(&child_id)
        .await
        .with_context(|| format!("Failed to cancel earned time for {}", child_id))?;

    if cancelled {
        println!("✓ Cancelled earned time for {}", child_id);
    } else {
        println!("No earned time to cancel for {}", child_id);
    }
    Ok(())
}

pub fn audit(service: &RewardsService, limit: usize) -> Result<()> {
    let entries = service.audit_entries(Some(limit));
    if entries.is_empty() {
        println!("Audit log is empty");
        return Ok(());
    }

    for entry in entries {
        let child = entry
            .child_id
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let details = entry
            .metadata
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{}  {:<24} {:<12} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", entry.action),
            child,
            details
        );
    }
    Ok(())
}

pub async fn classify(
    service: &RewardsService,
    app: &str,
    category: AppCategory,
    name: Option<String>,
) -> Result<()> {
    let app_id = AppId::new(app);
    service.classify_app(&app_id, category, name).await?;
    println!("✓ Classified {} as {:?}", app_id, category);
    Ok(())
}

/// Process JSON-lines activity events from stdin until Ctrl-C
///
/// Each opened session is reported on stdout as a JSON line carrying its
/// `session_id`.
///
/// Windows expire on schedule only while this is running; other commands
/// prune windows that ended in the meantime when they start. This holds the
/// data directory lock, so other commands fail until it exits.
pub async fn run(service: &RewardsService) -> Result<()> {
    let mut exemption_events = service.subscribe_exemptions();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let mut stdin_open = true;

    info!("Waiting for activity events on stdin");
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    info!("End of input, keeping earned-time timers running until Ctrl-C");
                    stdin_open = false;
                    continue;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let event: ActivityEvent = match serde_json::from_str(line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Ignoring malformed event: {}", e);
                        continue;
                    }
                };
                let started = matches!(event, ActivityEvent::SessionStarted { .. });
                match service.handle_event(event).await {
                    // The monitor names the session in its touches and end
                    Ok(Some(session)) if started => println!(
                        "{}",
                        serde_json::json!({
                            "session_id": session.id,
                            "child_id": session.child_id,
                            "app_id": session.app_id,
                        })
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Failed to handle event: {:#}", e),
                }
            }
            event = exemption_events.recv() => {
                match event {
                    Ok(ExemptionEvent::Expired(window)) => {
                        info!("Earned time for {} expired", window.child_id);
                    }
                    Ok(ExemptionEvent::PersistenceFailed { child_id, error }) => {
                        warn!("Could not persist expiry for {}: {}", child_id, error);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("Missed {} exemption events", n),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    Ok(())
}
