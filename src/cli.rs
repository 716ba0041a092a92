//! `campp` command line.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::error::{AppError, Result};
use crate::orchestrator::{Orchestrator, OrchestratorOptions};
use crate::runtime::{is_cancellation, DownloadProgress, ProgressPhase, ProvisionReport};
use crate::service::{ServiceKind, ServiceStatus};

#[derive(Debug, Parser)]
#[command(name = "campp", version)]
#[command(about = "Run a local Caddy + PHP + MariaDB + phpMyAdmin stack", long_about = None)]
pub struct Cli {
    /// Data directory (defaults to $CAMPP_HOME or the local data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show every service's state and port
    Status,
    /// Download and install the runtime binaries
    Install,
    /// Start services and supervise them until Ctrl-C
    Up {
        /// Services to start (all when omitted)
        services: Vec<ServiceKind>,
    },
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the end of a service's log
    Logs {
        service: ServiceKind,
        /// Number of lines
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
    /// Stop everything and delete the installed runtime
    Reset,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    Show,
    SetPort { service: ServiceKind, port: u16 },
    SetProjectRoot { path: PathBuf },
}

impl Cli {
    pub fn options(&self) -> Result<OrchestratorOptions> {
        match &self.data_dir {
            Some(dir) => Ok(OrchestratorOptions::new(dir.clone())),
            None => OrchestratorOptions::from_env(),
        }
    }
}

/// Run `command` against `orch`.
pub async fn execute(orch: &Orchestrator, command: Command) -> Result<ExitCode> {
    match command {
        Command::Status => {
            println!(
                "Runtime: {} ({})",
                if orch.check_installed() { "installed" } else { "not installed" },
                orch.runtime_dir().display()
            );
            for status in orch.get_all_statuses().values() {
                print_status(status);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Install => {
            let report = match provision(orch).await {
                Ok(report) => report,
                Err(e) if is_cancellation(&e) => {
                    println!("Installation cancelled; completed components were kept");
                    return Ok(ExitCode::from(130));
                }
                Err(e) => return Err(e),
            };
            println!(
                "Installed: {}; already present: {}",
                join_names(&report.installed),
                join_names(&report.skipped)
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Up { services } => up(orch, services).await,
        Command::Config { action } => {
            configure(orch, action)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Logs { service, lines } => {
            println!("{}", orch.read_service_log(service, lines).await?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset => {
            orch.reset_installation().await?;
            println!("Runtime removed from {}", orch.runtime_dir().display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn join_names<T: std::fmt::Display>(items: &[T]) -> String {
    if items.is_empty() {
        return "none".to_string();
    }
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_status(status: &ServiceStatus) {
    let pid = status
        .pid
        .map_or_else(|| "-".to_string(), |pid| pid.to_string());
    println!(
        "{:<12} {:<9} port {:<5} pid {:<7}{}",
        status.kind.as_str(),
        status.state.label(),
        status.port,
        pid,
        status
            .error_message
            .as_deref()
            .map(|m| format!(" {}", m))
            .unwrap_or_default()
    );
}

fn configure(orch: &Orchestrator, action: ConfigAction) -> Result<()> {
    let mut settings = orch.get_settings();
    match action {
        ConfigAction::Show => {
            let text = toml::to_string_pretty(&settings)?;
            print!("{}", text);
            return Ok(());
        }
        ConfigAction::SetPort { service, port } => settings.ports.set(service, port),
        ConfigAction::SetProjectRoot { path } => {
            settings.project_root = std::path::absolute(&path)
                .map_err(|e| AppError::config(format!("Invalid path {}: {}", path.display(), e)))?;
        }
    }
    orch.save_settings(settings)?;
    println!("Settings saved");
    Ok(())
}

/// Percent bucket used to throttle download output.
fn bucket(event: &DownloadProgress) -> Option<u8> {
    event.percent.map(|p| (p / 10.0).floor() as u8)
}

fn print_progress(event: &DownloadProgress, last: &mut Option<(usize, Option<u8>)>) {
    let component = event
        .component
        .map_or_else(String::new, |c| c.display_name().to_string());
    match event.phase {
        ProgressPhase::Downloading => {
            let key = (event.component_index, bucket(event));
            if *last == Some(key) {
                return;
            }
            *last = Some(key);
            match event.percent {
                Some(p) => println!(
                    "[{}/{}] Downloading {} {:.0}%",
                    event.component_index, event.total_components, component, p
                ),
                None => println!(
                    "[{}/{}] Downloading {} {} bytes",
                    event.component_index,
                    event.total_components,
                    component,
                    event.bytes_downloaded
                ),
            }
        }
        ProgressPhase::Extracting | ProgressPhase::Installing => println!(
            "[{}/{}] {} {}{}",
            event.component_index,
            event.total_components,
            if event.phase == ProgressPhase::Extracting { "Extracting" } else { "Installing" },
            component,
            event
                .message
                .as_deref()
                .map(|m| format!(" ({})", m))
                .unwrap_or_default()
        ),
        ProgressPhase::Complete => println!("Runtime ready"),
        ProgressPhase::Error => eprintln!(
            "Provisioning failed: {}",
            event.message.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Provision in the foreground, cancelling on Ctrl-C.
async fn provision(orch: &Orchestrator) -> Result<ProvisionReport> {
    let mut task = orch.provision_runtime();
    let cancel = task.cancel.clone();
    let mut last = None;
    loop {
        tokio::select! {
            event = task.progress.recv() => match event {
                Some(event) => print_progress(&event, &mut last),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                eprintln!("Cancelling after the current step...");
                cancel.cancel();
            }
        }
    }
    task.wait().await
}

async fn up(orch: &Orchestrator, requested: Vec<ServiceKind>) -> Result<ExitCode> {
    if !orch.check_installed() {
        println!("Runtime not installed, provisioning first");
        provision(orch).await?;
    }

    let wanted: Vec<ServiceKind> = ServiceKind::STARTUP_ORDER
        .into_iter()
        .filter(|kind| requested.is_empty() || requested.contains(kind))
        .collect();

    let mut events = orch.subscribe_events();
    let start_all = async {
        let mut failed = false;
        for kind in &wanted {
            let status = orch.start_service(*kind).await;
            print_status(&status);
            failed |= status.state.is_error();
        }
        failed
    };
    // The services run in their own process groups, so an interrupt has to
    // be handled here or they outlive us.
    let failed = tokio::select! {
        failed = start_all => failed,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted while starting services");
            shut_down(orch).await;
            return Ok(ExitCode::from(130));
        }
    };
    let web = orch.get_status(ServiceKind::WebServer);
    if wanted.contains(&ServiceKind::WebServer) && !web.state.is_error() {
        println!(
            "Serving {} at http://127.0.0.1:{}/",
            orch.get_settings().project_root.display(),
            web.port
        );
    }
    println!("Press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{} -> {} (port {})", event.kind, event.state, event.port),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Missed {} service events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    shut_down(orch).await;
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

/// Stop everything gracefully, then kill whatever is left.
async fn shut_down(orch: &Orchestrator) {
    println!("Stopping services...");
    for status in orch.stop_all_services().await {
        print_status(&status);
    }
    orch.cleanup_all_services();
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_up_with_aliases() {
        let cli = Cli::try_parse_from(["campp", "up", "mariadb", "php"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Up { ref services }
                if services == &[ServiceKind::Database, ServiceKind::PhpRuntime]
        ));
    }

    #[test]
    fn parses_set_port() {
        let cli = Cli::try_parse_from([
            "campp", "--data-dir", "/tmp/x", "config", "set-port", "web", "8181",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(
            cli.command,
            Command::Config {
                action: ConfigAction::SetPort {
                    service: ServiceKind::WebServer,
                    port: 8181
                }
            }
        ));
    }

    #[test]
    fn rejects_unknown_service() {
        assert!(Cli::try_parse_from(["campp", "logs", "nginx"]).is_err());
    }

    #[test]
    fn download_output_is_throttled() {
        let mut last = None;
        let event = DownloadProgress {
            phase: ProgressPhase::Downloading,
            component: None,
            component_index: 1,
            total_components: 4,
            percent: Some(12.0),
            bytes_downloaded: 12,
            total_bytes: Some(100),
            message: None,
        };
        print_progress(&event, &mut last);
        assert_eq!(last, Some((1, Some(1))));
        let later = DownloadProgress {
            percent: Some(25.0),
            ..event
        };
        print_progress(&later, &mut last);
        assert_eq!(last, Some((1, Some(2))));
    }
}
