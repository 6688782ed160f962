//! `folderd` binary — thin CLI shell over the [`folderd`] library crate.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use folderd::control_plane::ControlPlane;
use folderd::manager::FolderManager;
use folderd::model_registry::ModelRegistry;
use folderd::shutdown::{graceful_shutdown, install_panic_hook, wait_for_os_signal, ShutdownFlag, ShutdownSignal};
use folderd::singleton::SingletonGuard;
use folderd::supervisor::{AutoRestartPolicy, ProcessSupervisor};
use folderd::watcher::FolderWatcher;
use folderd_core::config::{load_user_config, merge, DaemonConfig};
use folderd_core::types::{now_unix_ms, DaemonRegistryRecord};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Folder indexing daemon — keeps a chosen set of filesystem folders
/// semantically searchable.
#[derive(Parser)]
#[command(name = "folderd", version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (default: none, built-in defaults apply)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run in the foreground without acquiring the singleton lock (testing
    /// convenience; never use this to run two production daemons at once)
    #[arg(long)]
    no_singleton: bool,
}

fn load_config(cli: &Cli) -> DaemonConfig {
    let defaults = DaemonConfig::default();
    let user = cli.config.as_deref().and_then(|path| match load_user_config(path) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to load config, falling back to defaults");
            None
        }
    });
    merge(defaults, user, None)
}

fn acquire_singleton(skip: bool) -> anyhow::Result<Option<SingletonGuard>> {
    if skip {
        return Ok(None);
    }
    let record = DaemonRegistryRecord {
        pid: std::process::id(),
        control_ports: vec![],
        start_time_unix_ms: now_unix_ms(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    SingletonGuard::acquire(record).map(Some).context("could not acquire daemon singleton")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("folderd=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli);
    let singleton = acquire_singleton(cli.no_singleton)?;

    let registry = Arc::new(ModelRegistry::new(config.model_registry.capacity as usize));
    let manager = Arc::new(FolderManager::new(Arc::clone(&registry)));
    let max_concurrent = config.processing.max_concurrent_operations as usize;

    for folder in &config.folders {
        if let Err(e) = manager.start_folder(folder, max_concurrent) {
            error!(folder = %folder.path.display(), error = %e, "failed to start folder");
        }
    }

    let flag = ShutdownFlag::new();

    // Constructed so the control plane is wired and ready; the concrete
    // transport it is exposed over (HTTP, MCP, ...) is out of scope here.
    let _control_plane =
        ControlPlane::new(Arc::clone(&manager), Arc::clone(&registry), max_concurrent, flag.clone());
    info!(folders = manager.managed_count(), "folderd started");

    // The stdio front-end (§1, §4.J) is an optional auxiliary child; an
    // empty `supervisor.command` means this daemon instance isn't
    // responsible for one.
    let mut supervisor = if config.supervisor.command.is_empty() {
        None
    } else {
        let policy = AutoRestartPolicy {
            enabled: config.auto_restart.enabled,
            max_retries: config.auto_restart.max_retries,
            base_delay: std::time::Duration::from_secs(config.auto_restart.delay as u64),
            max_delay: std::time::Duration::from_secs(config.auto_restart.max_delay as u64),
        };
        let shutdown_timeout = std::time::Duration::from_secs(config.shutdown_timeout as u64);
        let mut supervisor =
            ProcessSupervisor::new(config.supervisor.command.clone(), config.supervisor.args.clone(), policy, shutdown_timeout);
        match supervisor.start().await {
            Ok(()) => Some(supervisor),
            Err(e) => {
                error!(error = %e, "failed to start supervised child process");
                None
            }
        }
    };

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    install_panic_hook(shutdown_tx);

    // §4.L names the configuration file itself, not just folder roots, as a
    // watch target: a config edit should take effect without waiting for a
    // SIGHUP. `_config_watcher` must stay alive for the duration of main —
    // dropping it stops the underlying notify watcher.
    let (config_events_tx, mut config_events_rx) = mpsc::unbounded_channel();
    let _config_watcher = cli.config.as_deref().and_then(|path| {
        match FolderWatcher::start_file(path, config_events_tx.clone()) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to watch config file, relying on SIGHUP reload only");
                None
            }
        }
    });

    loop {
        tokio::select! {
            signal = wait_for_os_signal() => {
                match signal {
                    ShutdownSignal::Reload => {
                        info!("reloading configuration");
                        let _ = load_config(&cli);
                        continue;
                    }
                    other => {
                        run_shutdown(other, &flag, &manager, &registry, singleton, supervisor.take()).await;
                        break;
                    }
                }
            }
            Some(signal) = shutdown_rx.recv() => {
                run_shutdown(signal, &flag, &manager, &registry, singleton, supervisor.take()).await;
                break;
            }
            Some(event) = config_events_rx.recv() => {
                if cli.config.as_deref() == Some(event.path.as_path()) {
                    info!(path = %event.path.display(), "configuration file changed, reloading");
                    let _ = load_config(&cli);
                }
            }
            results = manager.run_all_cycles() => {
                for (path, outcome) in results {
                    if let Err(e) = outcome {
                        warn!(folder = %path.display(), error = %e, "scan cycle failed");
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    }

    Ok(())
}

async fn run_shutdown(
    signal: ShutdownSignal,
    flag: &ShutdownFlag,
    manager: &FolderManager,
    registry: &ModelRegistry,
    singleton: Option<SingletonGuard>,
    supervisor: Option<ProcessSupervisor>,
) {
    info!(?signal, "shutting down");
    graceful_shutdown(flag, manager, registry, singleton, || async move {
        if let Some(mut supervisor) = supervisor {
            if let Err(e) = supervisor.stop().await {
                warn!(error = %e, "supervised child did not stop cleanly");
            }
        }
    })
    .await;
}
