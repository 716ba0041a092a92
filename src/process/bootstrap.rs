//! First-start initialization of the MariaDB data directory.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::paths::DataLayout;
use crate::runtime::RuntimePaths;

use super::launch::{command_with_log, open_service_log, LaunchSpec};

/// A data directory counts as initialized once the system schema exists.
pub(super) fn is_initialized(data_dir: &Path) -> bool {
    data_dir.join("mysql").is_dir()
}

/// Base directory of the MariaDB install (`<base>/bin/mariadbd`).
fn base_dir(server: &Path) -> Option<PathBuf> {
    server.parent()?.parent().map(Path::to_path_buf)
}

fn install_db_spec(tool: &Path, runtime: &RuntimePaths, scratch: &Path) -> LaunchSpec {
    let mut datadir = OsString::from("--datadir=");
    datadir.push(scratch);

    let mut args = Vec::new();
    if cfg!(windows) {
        args.push(datadir);
    } else {
        args.push(OsString::from("--no-defaults"));
        if let Some(base) = base_dir(&runtime.mariadb_server) {
            let mut basedir = OsString::from("--basedir=");
            basedir.push(base);
            args.push(basedir);
        }
        args.push(datadir);
        args.push(OsString::from("--auth-root-authentication-method=normal"));
    }

    LaunchSpec {
        program: tool.to_path_buf(),
        args,
        env: Vec::new(),
        cwd: scratch
            .parent()
            .map_or_else(|| scratch.to_path_buf(), Path::to_path_buf),
    }
}

/// Run the install-db tool once so the server finds a usable data directory.
///
/// The tool writes into a scratch directory that is renamed into place only
/// after it exits cleanly, so an interrupted run is retried from scratch.
pub(super) async fn ensure_database_initialized(
    runtime: &RuntimePaths,
    layout: &DataLayout,
    log_path: &Path,
    timeout: Duration,
) -> Result<()> {
    let data_dir = layout.db_data_dir();
    if is_initialized(&data_dir) {
        return Ok(());
    }
    let Some(tool) = runtime.mariadb_install_db.as_deref() else {
        log::warn!(
            "No install-db tool found; starting MariaDB with an uninitialized data directory {}",
            data_dir.display()
        );
        return Ok(());
    };

    let parent = data_dir
        .parent()
        .ok_or_else(|| AppError::io(format!("No parent directory for {}", data_dir.display())))?;
    std::fs::create_dir_all(parent)?;
    let scratch = parent.join(format!("mariadb.init-{}", uuid::Uuid::new_v4().simple()));
    std::fs::create_dir_all(&scratch)?;

    log::info!("Initializing MariaDB data directory at {}", data_dir.display());
    let spec = install_db_spec(tool, runtime, &scratch);
    let log = open_service_log(log_path, "initializing data directory")?;
    let outcome = run_install_db(&spec, &log, timeout).await;

    if let Err(e) = outcome {
        let _ = std::fs::remove_dir_all(&scratch);
        return Err(e);
    }

    // An empty directory left by ensure_dirs is replaced; anything else is kept aside.
    if data_dir.exists() && std::fs::remove_dir(&data_dir).is_err() {
        let aside = parent.join(format!("mariadb.old-{}", uuid::Uuid::new_v4().simple()));
        log::warn!(
            "Moving uninitialized data directory aside to {}",
            aside.display()
        );
        std::fs::rename(&data_dir, &aside)?;
    }
    std::fs::rename(&scratch, &data_dir).map_err(|e| {
        AppError::io(format!(
            "Failed to move initialized data into {}: {}",
            data_dir.display(),
            e
        ))
    })?;
    log::info!("MariaDB data directory initialized");
    Ok(())
}

async fn run_install_db(spec: &LaunchSpec, log: &std::fs::File, timeout: Duration) -> Result<()> {
    let mut cmd = command_with_log(spec, log)?;
    // An abandoned start must not leave the tool running.
    cmd.kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| {
        AppError::spawn_failed("mariadb-install-db", format!("{}: {}", spec.program.display(), e))
    })?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(AppError::process(format!(
            "mariadb-install-db failed with {}",
            status
        ))),
        Ok(Err(e)) => Err(AppError::process(format!(
            "Failed to wait for mariadb-install-db: {}",
            e
        ))),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(AppError::process(format!(
                "mariadb-install-db did not finish within {}s",
                timeout.as_secs()
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt as _;

    use super::*;

    fn runtime_with_tool(root: &Path, script: &str) -> RuntimePaths {
        let bin = root.join("mariadb").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let tool = bin.join("mariadb-install-db");
        std::fs::write(&tool, script).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        RuntimePaths {
            caddy: root.join("caddy/caddy"),
            php_cgi: root.join("php/php-cgi"),
            php_cli: root.join("php/php"),
            php_ext_dir: None,
            mariadb_server: bin.join("mariadbd"),
            mariadb_install_db: Some(tool),
            phpmyadmin_root: root.join("phpmyadmin"),
        }
    }

    const FAKE_INSTALL_DB: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    --datadir=*) dir="${arg#--datadir=}" ;;
  esac
done
mkdir -p "$dir/mysql"
echo "initialized $dir"
"#;

    #[tokio::test]
    async fn initializes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(tmp.path().join("data"));
        layout.ensure_dirs().unwrap();
        let runtime = runtime_with_tool(tmp.path(), FAKE_INSTALL_DB);
        let log = layout.logs_dir().join("database.log");

        ensure_database_initialized(&runtime, &layout, &log, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(is_initialized(&layout.db_data_dir()));

        // A second call leaves the initialized directory alone.
        std::fs::write(layout.db_data_dir().join("marker"), "x").unwrap();
        ensure_database_initialized(&runtime, &layout, &log, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(layout.db_data_dir().join("marker").exists());
    }

    #[tokio::test]
    async fn failing_tool_leaves_no_partial_data() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(tmp.path().join("data"));
        layout.ensure_dirs().unwrap();
        let runtime = runtime_with_tool(tmp.path(), "#!/bin/sh\nexit 3\n");
        let log = layout.logs_dir().join("database.log");

        let err = ensure_database_initialized(&runtime, &layout, &log, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Process);
        assert!(!is_initialized(&layout.db_data_dir()));
        let leftovers: Vec<_> = std::fs::read_dir(layout.db_data_dir().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("mariadb.init-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_tool_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(tmp.path().join("data"));
        let mut runtime = runtime_with_tool(tmp.path(), FAKE_INSTALL_DB);
        runtime.mariadb_install_db = None;
        ensure_database_initialized(
            &runtime,
            &layout,
            &layout.logs_dir().join("database.log"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(!is_initialized(&layout.db_data_dir()));
    }
}
