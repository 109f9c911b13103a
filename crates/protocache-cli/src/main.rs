//! protocache - inspect rental handover/return protocols from the command line.
//!
//! A thin operator tool over `protocache-core`: loads the bulk protocol
//! status, shows the latest protocols of a rental, warms the detail cache and
//! dry-runs the create-protocol dialog workflow against a live back office.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use protocache_core::{
    ApiClient, ApiError, Config, LoadError, ProtocolCoordinator, ProtocolKind, RentalStage,
    WorkflowController, WorkflowState,
};

// ============================================================================
// Constants
// ============================================================================

/// How often `warm` checks whether its background loads have settled
const WARM_POLL_INTERVAL_MS: u64 = 50;

const LOG_FILE_PREFIX: &str = "protocache.log";

const USAGE: &str = "\
Usage: protocache <command> [args]

Commands:
  status                        Load bulk protocol status and list rentals by stage
  show <rental-id>              Show the latest handover/return protocol of a rental
  warm <rental-id>...           Preload protocols for rentals that have any
  check <rental-id> <kind>      Open the create dialog for handover|return and report the outcome

Environment:
  PROTOCACHE_API_URL            Back office API base URL
  PROTOCACHE_TOKEN              Bearer token
  RUST_LOG                      Log filter (default: warn)";

/// Initialize the tracing subscriber for logging.
/// The returned guard must be held until exit so buffered file logs flush.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
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

    let mut config = Config::load().context("Failed to load configuration")?;
    config.apply_env();

    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let coordinator = build_coordinator(&config)?;
    info!(command = %command, api = %config.api_base_url, "protocache starting");

    match command.as_str() {
        "status" => cmd_status(&coordinator).await,
        "show" => {
            let rental_id = args.get(1).context("Missing <rental-id>")?;
            cmd_show(&coordinator, rental_id).await
        }
        "warm" => {
            if args.len() < 2 {
                bail!("Missing <rental-id>...");
            }
            cmd_warm(&coordinator, &args[1..]).await
        }
        "check" => {
            let rental_id = args.get(1).context("Missing <rental-id>")?;
            let kind: ProtocolKind = args
                .get(2)
                .context("Missing <kind>")?
                .parse()
                .map_err(anyhow::Error::msg)?;
            cmd_check(&coordinator, rental_id, kind).await
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

fn build_coordinator(config: &Config) -> Result<ProtocolCoordinator> {
    let mut client = ApiClient::with_timeout(&config.api_base_url, config.request_timeout_secs)?;
    match Config::token_from_env() {
        Some(token) => client.set_token(token),
        None => warn!("PROTOCACHE_TOKEN not set, requests are unauthenticated"),
    }
    Ok(ProtocolCoordinator::new(Arc::new(client), config.coordinator_config()))
}

/// Point at the token when the back office rejected it.
fn auth_hint(cause: &anyhow::Error) -> &'static str {
    match cause.downcast_ref::<ApiError>() {
        Some(e) if e.is_auth_failure() => "\nHint: check PROTOCACHE_TOKEN",
        _ => "",
    }
}

fn detail_error(e: LoadError) -> anyhow::Error {
    let hint = auth_hint(e.cause());
    anyhow::anyhow!("{}{}", e, hint)
}

async fn cmd_status(coordinator: &ProtocolCoordinator) -> Result<()> {
    if let Err(e) = coordinator.load_status().await {
        bail!("{}{}", e, auth_hint(&e.cause));
    }

    println!("{} rentals", coordinator.known_rentals());
    for stage in [
        RentalStage::AwaitingHandover,
        RentalStage::AwaitingReturn,
        RentalStage::Completed,
    ] {
        let ids = coordinator.rentals_in_stage(stage);
        println!("\n{} ({})", stage.display_name(), ids.len());
        for id in ids {
            let status = coordinator.status(&id);
            let protocols: Vec<&str> = ProtocolKind::ALL
                .into_iter()
                .filter_map(|kind| status.protocol_id(kind))
                .collect();
            if protocols.is_empty() {
                println!("  {}", id);
            } else {
                println!("  {}  [{}]", id, protocols.join(", "));
            }
        }
    }
    Ok(())
}

async fn cmd_show(coordinator: &ProtocolCoordinator, rental_id: &str) -> Result<()> {
    let detail = coordinator
        .load_detail(rental_id)
        .await
        .map_err(detail_error)?;

    if detail.is_empty() {
        println!("Rental {} has no protocols", rental_id);
        return Ok(());
    }

    for kind in ProtocolKind::ALL {
        match detail.get(kind) {
            Some(record) => {
                let created = record
                    .created_at
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let state = if record.is_completed() { "completed" } else { "open" };
                println!("{:<9} {}  created {}  {}", kind.display_name(), record.id, created, state);
            }
            None => println!("{:<9} none", kind.display_name()),
        }
    }
    println!("\n{}", serde_json::to_string_pretty(detail.as_ref())?);
    Ok(())
}

async fn cmd_warm(coordinator: &ProtocolCoordinator, rental_ids: &[String]) -> Result<()> {
    // Preloading is driven by presence flags; without them nothing is warmed
    if let Err(e) = coordinator.load_status().await {
        warn!(error = %e, "Continuing without bulk status");
    }

    let started = coordinator.warm(rental_ids, Some(rental_ids.len()));
    while coordinator.loads_in_flight() > 0 {
        tokio::time::sleep(Duration::from_millis(WARM_POLL_INTERVAL_MS)).await;
    }

    println!("Started {} of {} loads", started, rental_ids.len());
    for id in rental_ids {
        let state = if coordinator.has_cached_detail(id) {
            "cached"
        } else if coordinator.status(id).has_any() {
            "failed"
        } else {
            "skipped (no protocols)"
        };
        println!("  {}  {}", id, state);
    }
    Ok(())
}

async fn cmd_check(coordinator: &ProtocolCoordinator, rental_id: &str, kind: ProtocolKind) -> Result<()> {
    let mut controller = WorkflowController::new(coordinator.clone());
    controller.open_create(rental_id, kind);
    println!("{} dialog for {}: {}", kind.display_name(), rental_id, controller.state().name());

    let state = controller.wait_for_update().await;
    println!("-> {}", state.name());
    if let Some(message) = state.user_message() {
        println!("   {}", message);
    }
    if let WorkflowState::Ready { detail, .. } = state {
        if let Some(handover) = detail.handover.as_ref() {
            println!("   handover protocol {}", handover.id);
        }
    }

    if let Some(failure) = controller.take_failure() {
        println!("   dialog closed: {}", failure.message());
        println!("   {}", failure.error);
    }
    Ok(())
}
