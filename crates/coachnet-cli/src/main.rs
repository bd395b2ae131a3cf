//! `coachnetd` – coach network gateway daemon.
//!
//! 1. Loads the component manifest (`--manifest`, `COACHNET_MANIFEST`, or
//!    `~/.coachnet/manifest.toml`).
//! 2. Restores the interlock from the safety store and boots every component
//!    in dependency order.
//! 3. Runs the health propagator, the liveness monitor, the audit journal and
//!    the HTTP/WebSocket API until Ctrl-C.
//! 4. On Ctrl-C engages the emergency stop, stops the background tasks and
//!    records every component's final state.

mod audit;
mod catalog;
mod manifest;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use coachnet_api::{ApiServer, AppState};
use coachnet_gateway::{BusOperations, FacadeParts, Interlock, UNALLOCATED_SEQUENCE};
use coachnet_kernel::{HealthPropagator, LivenessMonitor, Watchdog};
use coachnet_middleware::EventBus;
use coachnet_store::SafetyStore;
use coachnet_types::GatewayError;

use manifest::Manifest;

/// Coach network gateway daemon
#[derive(Debug, Parser)]
#[command(name = "coachnetd")]
#[command(about = "Coach network gateway daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Component manifest [default: ~/.coachnet/manifest.toml]
    #[arg(short, long, env = "COACHNET_MANIFEST", value_name = "PATH")]
    manifest: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _telemetry = telemetry::init_tracing("coachnetd");
    print_banner();

    let path = manifest::manifest_path(cli.manifest);
    let manifest = match manifest::load_from(&path) {
        Ok(manifest) => {
            println!("  Manifest loaded from {}", path.display().to_string().bold());
            manifest
        }
        Err(e) => {
            println!("{}: {e}", "Manifest error".red());
            println!(
                "  Start from {} and pass it with {}.",
                "config/coachnet.example.toml".bold(),
                "--manifest <path>".bold()
            );
            return ExitCode::FAILURE;
        }
    };

    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    let interrupt_tx = Arc::new(interrupt_tx);
    let on_interrupt = interrupt_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – engaging emergency stop …".yellow().bold());
        let _ = on_interrupt.send(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; interrupt will not stop the coach safely");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(run(manifest, interrupt_rx));
    drop(interrupt_tx);
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{}: {e}", "Fatal".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(manifest: Manifest, mut interrupt: watch::Receiver<bool>) -> Result<(), GatewayError> {
    let settings = &manifest.gateway;
    let facade_name = manifest
        .facade_name()
        .ok_or_else(|| GatewayError::Config("manifest declares no bus_operations component".into()))?
        .to_string();

    // ── Safety store & interlock ──────────────────────────────────────────
    let store = Arc::new(SafetyStore::open(&settings.state_db)?);
    let restored = Interlock::restored_record(
        store.last_interlock_event()?,
        settings.require_verification_on_first_boot,
    );
    if let Some(record) = &restored {
        match record.sequence {
            UNALLOCATED_SEQUENCE => println!(
                "  {} no recorded interlock state; operator reset required.",
                "⚠".yellow().bold()
            ),
            sequence => println!(
                "  {} emergency stop #{} is still engaged ({}); operator reset required.",
                "⚠".yellow().bold(),
                sequence,
                record.reason
            ),
        }
    }

    // ── Boot ──────────────────────────────────────────────────────────────
    let events = EventBus::default();
    let parts = FacadeParts {
        restored,
        store: Some(store.clone()),
        events: events.clone(),
        config: settings.facade_config(),
    };
    let mut registry = catalog::build_registry(&manifest, parts)?;
    let boot = registry.start_all().await?;
    for (i, stage) in boot.stages.iter().enumerate() {
        println!("  Stage {i}: {}", stage.join(", ").dimmed());
    }
    for name in &boot.unavailable {
        println!("  {} {} unavailable", "•".yellow(), name.bold());
    }

    let facade = registry.get_as::<BusOperations>(&facade_name)?;
    if let Some(report) = facade.reassert_interlock().await {
        if !report.is_complete() {
            warn!(failures = ?report.failures(), "restored stop did not reach every subsystem");
        }
    }

    // ── Background tasks ──────────────────────────────────────────────────
    let registry = Arc::new(registry);
    let watchdog = Watchdog::shared();
    let (propagator, handle) = HealthPropagator::new(
        registry.clone(),
        facade.clone(),
        events.clone(),
        watchdog.clone(),
        settings.propagator_config(),
    )?;
    facade.attach_propagator(handle.clone());
    let monitor = LivenessMonitor::new(watchdog, facade.clone(), settings.propagator_config().interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(propagator.run(shutdown_rx.clone()));
    tasks.spawn(monitor.run(shutdown_rx.clone()));
    tasks.spawn(audit::run(store.clone(), events.subscribe_all(), shutdown_rx.clone()));

    let state = AppState::new(
        registry.clone(),
        facade.clone(),
        Arc::new(manifest.authorizer()),
        events.clone(),
    );
    let server = ApiServer::new(state).with_port(settings.api_port);
    println!("  API listening on port {}", server.port().to_string().bold());
    let mut api = tokio::spawn(server.run(shutdown_rx));

    // ── Wait for interrupt ────────────────────────────────────────────────
    let api_finished = tokio::select! {
        _ = interrupt.wait_for(|stop| *stop) => false,
        result = &mut api => {
            match result {
                Ok(Ok(())) => warn!("api stopped unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "api failed"),
                Err(e) => error!(error = %e, "api task aborted"),
            }
            true
        }
    };

    // ── Shutdown ──────────────────────────────────────────────────────────
    let ack = facade.emergency_stop("operator interrupt").await;
    if ack.already_engaged {
        println!("  {} emergency stop #{} already engaged.", "✓".green(), ack.record.sequence);
    } else if ack.incomplete {
        println!(
            "  {} emergency stop #{} incomplete; verify the coach manually.",
            "⚠".yellow().bold(),
            ack.record.sequence
        );
    } else {
        println!("  {} emergency stop #{} engaged.", "✓".green(), ack.record.sequence);
    }

    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "background task ended abnormally");
        }
    }
    if !api_finished {
        match api.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "api failed during shutdown"),
            Err(e) => error!(error = %e, "api task aborted"),
        }
    }

    let written = audit::record_final_states(store, handle.snapshot()).await?;
    info!(components = written, "final states recorded");
    println!("{}", "  ✓ Exiting coachnetd.".green());
    Ok(())
}

fn print_banner() {
    println!();
    println!("{}", "  ┌─────────────────────────────┐".bold().cyan());
    println!("{}", "  │   coachnet gateway daemon   │".bold().cyan());
    println!("{}", "  └─────────────────────────────┘".bold().cyan());
    println!("  {}", format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!();
}
