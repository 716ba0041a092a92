//! Command lines and spawning for each service.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::{AppError, Result};
use crate::paths::DataLayout;
use crate::runtime::{RuntimePaths, PMA_CONFIG_ENV};
use crate::service::ServiceKind;

/// Everything needed to spawn one service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, OsString)>,
    pub cwd: PathBuf,
}

fn arg(value: impl Into<OsString>) -> OsString {
    value.into()
}

fn listen_addr(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}

/// Build the command line for `kind` listening on `port`.
pub fn launch_spec(
    kind: ServiceKind,
    port: u16,
    runtime: &RuntimePaths,
    layout: &DataLayout,
) -> LaunchSpec {
    let config_dir = layout.config_dir();
    let php_ini = config_dir.join(crate::config::config_file_name(ServiceKind::PhpRuntime));

    match kind {
        ServiceKind::WebServer => {
            let caddy_state = layout.caddy_state_dir();
            LaunchSpec {
                program: runtime.caddy.clone(),
                args: vec![
                    arg("run"),
                    arg("--config"),
                    arg(config_dir.join(crate::config::config_file_name(kind))),
                    arg("--adapter"),
                    arg("caddyfile"),
                ],
                env: vec![
                    ("XDG_DATA_HOME".to_string(), arg(&caddy_state)),
                    ("XDG_CONFIG_HOME".to_string(), arg(&caddy_state)),
                ],
                cwd: config_dir,
            }
        }
        ServiceKind::PhpRuntime => LaunchSpec {
            program: runtime.php_cgi.clone(),
            args: vec![arg("-b"), arg(listen_addr(port)), arg("-c"), arg(php_ini)],
            // 0 keeps the FastCGI process from exiting after 500 requests
            env: vec![("PHP_FCGI_MAX_REQUESTS".to_string(), arg("0"))],
            cwd: config_dir,
        },
        ServiceKind::Database => {
            // --defaults-file must come first
            let mut defaults = OsString::from("--defaults-file=");
            defaults.push(config_dir.join(crate::config::config_file_name(kind)));
            LaunchSpec {
                program: runtime.mariadb_server.clone(),
                args: vec![defaults, arg("--console")],
                env: Vec::new(),
                cwd: layout.db_data_dir(),
            }
        }
        ServiceKind::DbAdmin => LaunchSpec {
            program: runtime.php_cli.clone(),
            args: vec![
                arg("-S"),
                arg(listen_addr(port)),
                arg("-t"),
                arg(&runtime.phpmyadmin_root),
                arg("-c"),
                arg(php_ini),
            ],
            env: vec![(
                PMA_CONFIG_ENV.to_string(),
                arg(config_dir.join(crate::config::config_file_name(kind))),
            )],
            cwd: runtime.phpmyadmin_root.clone(),
        },
    }
}

/// Open the service log for appending and write a start header.
pub(super) fn open_service_log(path: &Path, header: &str) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppError::io(format!("Failed to open log {}: {}", path.display(), e)))?;
    writeln!(
        file,
        "\n===== {} {} =====",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        header
    )?;
    Ok(file)
}

/// Build a command with output appended to `log` in its own process group.
pub(super) fn command_with_log(spec: &LaunchSpec, log: &std::fs::File) -> Result<Command> {
    let stdout = log.try_clone()?;
    let stderr = log.try_clone()?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(false);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    #[cfg(target_os = "windows")]
    {
        use windows::Win32::System::Threading::CREATE_NO_WINDOW;
        cmd.creation_flags(CREATE_NO_WINDOW.0);
    }

    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    Ok(cmd)
}

/// Spawn a service, returning the child and its PID.
pub(super) fn spawn_service(
    kind: ServiceKind,
    port: u16,
    spec: &LaunchSpec,
    log_path: &Path,
) -> Result<(Child, u32)> {
    let log = open_service_log(log_path, &format!("starting {} on port {}", kind, port))?;
    std::fs::create_dir_all(&spec.cwd)?;
    let child = command_with_log(spec, &log)?.spawn().map_err(|e| {
        AppError::spawn_failed(kind.as_str(), format!("{}: {}", spec.program.display(), e))
    })?;
    let pid = child.id().ok_or_else(|| {
        AppError::spawn_failed(kind.as_str(), "process exited before its PID was read")
    })?;
    log::info!(
        "Spawned {} (pid {}) on port {}: {} {:?}",
        kind,
        pid,
        port,
        spec.program.display(),
        spec.args
    );
    Ok((child, pid))
}
