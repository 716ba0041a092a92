//! Finds provisioned executables under the install root.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{AppError, Result};
use crate::platform::exe_name;

use super::Component;

/// Depth limit for the fallback search inside a component directory.
const SEARCH_DEPTH: usize = 4;

/// Absolute locations of everything the services launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub caddy: PathBuf,
    pub php_cgi: PathBuf,
    pub php_cli: PathBuf,
    pub php_ext_dir: Option<PathBuf>,
    pub mariadb_server: PathBuf,
    pub mariadb_install_db: Option<PathBuf>,
    /// Directory containing phpMyAdmin's `index.php`.
    pub phpmyadmin_root: PathBuf,
}

fn find_file(dir: &Path, candidates: &[String], names: &[String]) -> Option<PathBuf> {
    if let Some(hit) = candidates
        .iter()
        .map(|rel| dir.join(rel))
        .find(|p| p.is_file())
    {
        return Some(hit);
    }

    WalkDir::new(dir)
        .max_depth(SEARCH_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry.file_type().is_file()
                && names
                    .iter()
                    .any(|n| entry.file_name().to_str() == Some(n.as_str()))
        })
        .map(|entry| entry.into_path())
}

fn find_dir_containing(dir: &Path, marker: &str) -> Option<PathBuf> {
    if dir.join(marker).is_file() {
        return Some(dir.to_path_buf());
    }
    WalkDir::new(dir)
        .max_depth(SEARCH_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name() == marker)
        .and_then(|entry| entry.path().parent().map(Path::to_path_buf))
}

fn exe_candidates(dirs: &[&str], name: &str) -> Vec<String> {
    let file = exe_name(name);
    dirs.iter()
        .map(|d| {
            if d.is_empty() {
                file.clone()
            } else {
                format!("{}/{}", d, file)
            }
        })
        .collect()
}

fn require(found: Option<PathBuf>, what: &str) -> Result<PathBuf> {
    found.ok_or_else(|| AppError::runtime_not_installed(what))
}

fn locate_caddy(dir: &Path) -> Result<PathBuf> {
    require(
        find_file(dir, &exe_candidates(&["", "bin"], "caddy"), &[exe_name("caddy")]),
        "caddy",
    )
}

fn locate_php(dir: &Path) -> Result<(PathBuf, PathBuf, Option<PathBuf>)> {
    let cgi = require(
        find_file(
            dir,
            &exe_candidates(&["", "bin"], "php-cgi"),
            &[exe_name("php-cgi")],
        ),
        "php-cgi",
    )?;
    let cli = require(
        find_file(dir, &exe_candidates(&["", "bin"], "php"), &[exe_name("php")]),
        "php",
    )?;
    let ext_dir = ["ext", "lib/php/extensions"]
        .iter()
        .map(|rel| dir.join(rel))
        .find(|p| p.is_dir());
    Ok((cgi, cli, ext_dir))
}

fn locate_mariadb(dir: &Path) -> Result<(PathBuf, Option<PathBuf>)> {
    let mut candidates = exe_candidates(&["bin", "sbin", ""], "mariadbd");
    candidates.extend(exe_candidates(&["bin", "sbin", ""], "mysqld"));
    let server = require(
        find_file(
            dir,
            &candidates,
            &[exe_name("mariadbd"), exe_name("mysqld")],
        ),
        "mariadbd",
    )?;

    let mut tool_candidates = exe_candidates(&["bin", "scripts"], "mariadb-install-db");
    tool_candidates.extend(exe_candidates(&["bin", "scripts"], "mysql_install_db"));
    let install_db = find_file(
        dir,
        &tool_candidates,
        &[exe_name("mariadb-install-db"), exe_name("mysql_install_db")],
    );
    Ok((server, install_db))
}

pub(crate) fn locate_phpmyadmin(dir: &Path) -> Result<PathBuf> {
    require(find_dir_containing(dir, "index.php"), "phpmyadmin/index.php")
}

/// Check that `dir` holds a usable copy of `component`.
pub fn verify_component(component: Component, dir: &Path) -> Result<()> {
    match component {
        Component::Caddy => locate_caddy(dir).map(drop),
        Component::Php => locate_php(dir).map(drop),
        Component::MariaDb => locate_mariadb(dir).map(drop),
        Component::PhpMyAdmin => locate_phpmyadmin(dir).map(drop),
    }
}

/// Resolve every runtime path under `install_root`.
pub fn locate(install_root: &Path) -> Result<RuntimePaths> {
    let root = std::path::absolute(install_root)?;
    let (php_cgi, php_cli, php_ext_dir) = locate_php(&root.join(Component::Php.id()))?;
    let (mariadb_server, mariadb_install_db) =
        locate_mariadb(&root.join(Component::MariaDb.id()))?;

    Ok(RuntimePaths {
        caddy: locate_caddy(&root.join(Component::Caddy.id()))?,
        php_cgi,
        php_cli,
        php_ext_dir,
        mariadb_server,
        mariadb_install_db,
        phpmyadmin_root: locate_phpmyadmin(&root.join(Component::PhpMyAdmin.id()))?,
    })
}
