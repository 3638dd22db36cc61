#![deny(warnings)]

//! Headless CLI that plays a clicker session against an in-process authority
//! and prints the resulting KPIs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clicker_core::Catalog;
use clicker_runtime::{
    FaultProfile, FlakyAuthority, LocalAuthority, RemoteAuthority, SessionConfig, SessionError,
    SessionEvent, SessionHandle,
};
use persistence::{default_settings_path, format_amount, Settings};
use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

const CLICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    seconds: u64,
    chaos: Option<u64>,
    settings: Option<PathBuf>,
    version: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        config: None,
        seconds: 10,
        chaos: None,
        settings: None,
        version: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = it.next().map(PathBuf::from),
            "--seconds" => {
                if let Some(s) = it.next().and_then(|s| s.parse().ok()) {
                    args.seconds = s;
                }
            }
            "--chaos" => args.chaos = it.next().and_then(|s| s.parse().ok()),
            "--settings" => args.settings = it.next().map(PathBuf::from),
            "--version" => args.version = true,
            other => warn!(arg = other, "ignoring unknown argument"),
        }
    }
    args
}

fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

#[derive(Debug, Default)]
struct Tally {
    purchases: u64,
    refused: u64,
}

/// One auto-play step: click, then buy an available upgrade or else the
/// cheapest affordable generator.
async fn play_step(handle: &SessionHandle, tally: &mut Tally) -> Result<()> {
    handle.manual_action().await?;

    let view = handle.view().await?;
    let bought = if let Some(upgrade) = view.upgrades.iter().find(|u| u.available && u.affordable) {
        handle.purchase_upgrade(upgrade.id).await
    } else if let Some(generator) = view
        .generators
        .iter()
        .filter(|g| g.affordable)
        .min_by_key(|g| g.next_cost)
    {
        handle.purchase_generator(generator.id.as_str()).await
    } else {
        return Ok(());
    };

    match bought {
        Ok(applied) => {
            tally.purchases += 1;
            debug!(id = ?applied.id, effect = ?applied.effect, "bought");
        }
        // Local view raced a tick or an unconfirmed action; try again next step.
        Err(SessionError::Action(e)) => {
            tally.refused += 1;
            debug!(error = %e, "purchase refused locally");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn spawn_event_log(handle: &SessionHandle) -> tokio::task::JoinHandle<u64> {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        let mut rejected = 0;
        loop {
            match events.recv().await {
                Ok(SessionEvent::Rejected { action, kind, error, .. }) => {
                    rejected += 1;
                    warn!(?action, ?kind, %error, "action rolled back");
                }
                Ok(SessionEvent::PersistFailed { error, .. }) => warn!(%error, "save failed"),
                Ok(event) => debug!(?event, "session event"),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
        rejected
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logging setup
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .init();

    let args = parse_args();
    if args.version {
        println!(
            "{} {} ({} built {})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("GIT_SHA"),
            env!("BUILD_DATE")
        );
        return Ok(());
    }
    info!(?args, "starting CLI");

    let settings_path = args.settings.clone().unwrap_or_else(default_settings_path);
    let settings = Settings::load(&settings_path)
        .await
        .with_context(|| format!("loading settings {}", settings_path.display()))?;
    let mut config = load_config(args.config.as_ref())?;
    if !settings.auto_save {
        config.autosave_interval_ms = None;
    }

    let catalog = Arc::new(Catalog::standard());
    let local = LocalAuthority::new(Arc::clone(&catalog));
    let remote: Arc<dyn RemoteAuthority> = match args.chaos {
        Some(seed) => {
            info!(seed, "injecting transport faults");
            Arc::new(FlakyAuthority::new(local, FaultProfile::default(), seed))
        }
        None => Arc::new(local),
    };

    let handle = clicker_runtime::start(Arc::clone(&catalog), remote, config).await?;
    let event_log = spawn_event_log(&handle);

    let mut tally = Tally::default();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.seconds);
    let mut clicks = tokio::time::interval(CLICK_INTERVAL);
    while tokio::time::Instant::now() < deadline {
        clicks.tick().await;
        play_step(&handle, &mut tally).await?;
    }

    let view = handle.view().await?;
    let report = handle.shutdown().await?;
    drop(handle);
    let rejected = event_log.await.unwrap_or(0);

    let fmt = |amount: Decimal| format_amount(amount, settings.number_format);
    let owned: u32 = view.generators.iter().map(|g| g.owned).sum();
    let upgrades = view.upgrades.iter().filter(|u| u.purchased).count();
    println!(
        "Session {} | saved: {} | abandoned: {}",
        report.session.0, report.persisted, report.abandoned
    );
    println!(
        "KPI | balance: {} | earned: {} | rate: {}/s | click: {} | generators: {} | upgrades: {} | clicks: {} | purchases: {} | refused: {} | rolled back: {}",
        fmt(report.balance),
        fmt(report.total_earned),
        fmt(view.production_rate),
        fmt(view.manual_action_value),
        owned,
        upgrades,
        view.total_clicks,
        tally.purchases,
        tally.refused,
        rejected
    );

    Ok(())
}
