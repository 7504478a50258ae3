mod config;
mod limiter;
mod messages;
mod monitor;
mod policy;
mod process;
mod service;
mod signals;
mod sinks;
mod state_dir;
mod status;
#[cfg(test)]
mod testing;

use clap::Parser;
use config::{TargetSpec, WardenConfig};
use limiter::cgroup::CgroupLimiter;
use monitor::{ExitReason, Monitor};
use process::procfs::ProcfsProcesses;
use service::Service;
use signals::SignalHandler;
use sinks::{DesktopNotifier, EventLog, EventSink, NotificationSink};
use state_dir::StateDir;
use status::StatusTracker;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Memory watchdog: keeps one named process under a resident memory ceiling,
/// killing and relaunching it when it grows past the limit or disappears.
#[derive(Parser, Debug)]
#[command(name = "memwarden", version, about)]
pub struct Cli {
    /// Config file path (missing file means built-in defaults)
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print the resolved target and settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (state transitions, every poll)
    #[arg(short, long)]
    verbose: bool,
}

fn print_settings(target: &TargetSpec, cfg: &WardenConfig) {
    println!("memwarden v{}", env!("CARGO_PKG_VERSION"));
    println!("Target:        {}", target.name());
    println!("Launch path:   {}", target.path().display());
    println!("Ceiling:       {} MB", policy::to_mb(target.ceiling_bytes()));
    println!("Poll interval: {:?}", config::POLL_INTERVAL);
    println!("Retry delay:   {:?}", config::NOT_FOUND_DELAY);
    println!("Event log:     {}", cfg.log.events_file.display());
    println!("State dir:     {}", cfg.state.dir.display());
    println!(
        "Cgroup:        {}",
        cfg.cgroup.mount.join(&cfg.cgroup.parent).display()
    );
    println!(
        "Notifications: {}",
        if cfg.notify.enabled {
            cfg.notify.command.as_str()
        } else {
            "disabled"
        }
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "memwarden=debug"
    } else {
        "memwarden=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };
    let target = match TargetSpec::new(
        config::PROCESS_NAME,
        config::PROCESS_PATH,
        config::MEMORY_LIMIT_BYTES,
    ) {
        Ok(target) => target,
        Err(e) => {
            tracing::error!(error = %e, "invalid built-in target");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        print_settings(&target, &cfg);
        return ExitCode::SUCCESS;
    }

    let state_dir = StateDir::new(&cfg.state.dir);
    if let Err(e) = state_dir.init() {
        tracing::error!(
            error = %e,
            dir = %state_dir.root().display(),
            "cannot create state directory"
        );
        return ExitCode::FAILURE;
    }
    let _lock = match state_dir.acquire_lock() {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "refusing to start");
            return ExitCode::FAILURE;
        }
    };

    let mut signals = match SignalHandler::install() {
        Ok(handler) => handler,
        Err(e) => {
            tracing::error!(error = %e, "cannot install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let events: Arc<dyn EventSink> = Arc::new(EventLog::new(&cfg.log.events_file));
    let notifier: Arc<dyn NotificationSink> =
        Arc::new(DesktopNotifier::new(cfg.notify.enabled, &cfg.notify.command));

    let monitor = Monitor::new(
        target.clone(),
        ProcfsProcesses::new(),
        CgroupLimiter::new(&cfg.cgroup.mount, &cfg.cgroup.parent),
        Arc::clone(&events),
        Arc::clone(&notifier),
    )
    .with_status(StatusTracker::new(
        state_dir.status(),
        target.name(),
        target.ceiling_bytes(),
    ));
    let mut service = Service::new(monitor, target.name(), events, notifier);

    if let Err(e) = service.on_start() {
        tracing::error!(error = %e, "cannot start monitor thread");
        return ExitCode::FAILURE;
    }

    let received = signals.wait().await;
    tracing::info!(signal = ?received, "shutting down");

    // Joining the worker blocks the runtime thread; nothing else is scheduled
    // on it once the signal has arrived.
    let reason = service.on_stop();

    match reason {
        Some(ExitReason::Stopped) | None => ExitCode::SUCCESS,
        Some(ExitReason::LimiterFault(e)) => {
            tracing::error!(
                error = %e,
                "monitor had stopped: memory ceiling could not be enforced"
            );
            ExitCode::FAILURE
        }
        Some(ExitReason::Crashed(detail)) => {
            tracing::error!(%detail, "monitor had stopped after an unexpected failure");
            ExitCode::FAILURE
        }
    }
}
