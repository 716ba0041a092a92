use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paths::{to_forward_slashes, write_atomic, DataLayout};
use crate::runtime::RuntimePaths;
use crate::service::ServiceKind;
use crate::settings::ServicePorts;

use super::templates::{render, CADDYFILE, MY_CNF, PHP_INI, PMA_CONFIG};

/// PHP extensions enabled when the runtime ships loadable modules.
const PHP_EXTENSIONS: [&str; 6] = ["curl", "mbstring", "mysqli", "openssl", "pdo_mysql", "zlib"];

/// Everything a config file may depend on.
#[derive(Debug, Clone, Copy)]
pub struct ConfigContext<'a> {
    pub ports: ServicePorts,
    pub runtime: &'a RuntimePaths,
    pub layout: &'a DataLayout,
    pub project_root: &'a Path,
    pub db_admin_secret: &'a str,
}

/// A rendered config file not yet on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub kind: ServiceKind,
    pub file_name: &'static str,
    pub contents: String,
}

pub fn config_file_name(kind: ServiceKind) -> &'static str {
    match kind {
        ServiceKind::WebServer => "Caddyfile",
        ServiceKind::PhpRuntime => "php.ini",
        ServiceKind::Database => "my.cnf",
        ServiceKind::DbAdmin => "config.inc.php",
    }
}

fn template_for(kind: ServiceKind) -> &'static str {
    match kind {
        ServiceKind::WebServer => CADDYFILE,
        ServiceKind::PhpRuntime => PHP_INI,
        ServiceKind::Database => MY_CNF,
        ServiceKind::DbAdmin => PMA_CONFIG,
    }
}

fn slashes(path: &Path) -> String {
    to_forward_slashes(path)
}

/// Escape for a single-quoted PHP string.
fn php_single_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn extension_block(ext_dir: Option<&Path>) -> String {
    match ext_dir {
        Some(dir) => {
            let mut block = format!("extension_dir = \"{}\"\n", slashes(dir));
            for ext in PHP_EXTENSIONS {
                block.push_str("extension=");
                block.push_str(ext);
                block.push('\n');
            }
            block
        }
        // statically linked builds have the extensions compiled in
        None => String::new(),
    }
}

fn values(ctx: &ConfigContext<'_>) -> BTreeMap<&'static str, String> {
    let db_base_dir = ctx
        .runtime
        .mariadb_server
        .parent()
        .and_then(Path::parent)
        .unwrap_or(&ctx.runtime.mariadb_server);
    let db_data_dir = ctx.layout.db_data_dir();

    BTreeMap::from([
        ("web_port", ctx.ports.web_server.to_string()),
        ("php_port", ctx.ports.php_runtime.to_string()),
        ("db_port", ctx.ports.database.to_string()),
        ("db_admin_port", ctx.ports.db_admin.to_string()),
        ("project_root", slashes(ctx.project_root)),
        ("log_dir", slashes(&ctx.layout.logs_dir())),
        ("tmp_dir", slashes(&ctx.layout.db_admin_tmp_dir())),
        (
            "extension_block",
            extension_block(ctx.runtime.php_ext_dir.as_deref()),
        ),
        ("db_base_dir", slashes(db_base_dir)),
        ("db_data_dir", slashes(&db_data_dir)),
        ("db_socket", slashes(&db_data_dir.join("mysqld.sock"))),
        ("db_admin_secret", php_single_quoted(ctx.db_admin_secret)),
        (
            "db_admin_tmp_dir",
            php_single_quoted(&slashes(&ctx.layout.db_admin_tmp_dir())),
        ),
    ])
}

/// Render the config file for `kind`. Pure: identical inputs give identical bytes.
pub fn render_config(kind: ServiceKind, ctx: &ConfigContext<'_>) -> Result<RenderedConfig> {
    Ok(RenderedConfig {
        kind,
        file_name: config_file_name(kind),
        contents: render(template_for(kind), &values(ctx))?,
    })
}

/// Atomically write a rendered config into `config_dir`.
pub fn write_config(config_dir: &Path, rendered: &RenderedConfig) -> Result<PathBuf> {
    let path = config_dir.join(rendered.file_name);
    write_atomic(&path, rendered.contents.as_bytes())?;
    log::debug!("Wrote {}", path.display());
    Ok(path)
}

/// Render and write the config file for `kind`.
pub fn generate(kind: ServiceKind, ctx: &ConfigContext<'_>) -> Result<PathBuf> {
    let rendered = render_config(kind, ctx)?;
    write_config(&ctx.layout.config_dir(), &rendered)
}

/// Regenerate every service's config file.
pub fn generate_all(ctx: &ConfigContext<'_>) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(ServiceKind::ALL.len());
    for kind in ServiceKind::ALL {
        written.push(generate(kind, ctx)?);
    }
    log::info!("Regenerated {} config files", written.len());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(root: &Path, ext: bool) -> RuntimePaths {
        RuntimePaths {
            caddy: root.join("caddy/caddy"),
            php_cgi: root.join("php/php-cgi"),
            php_cli: root.join("php/php"),
            php_ext_dir: ext.then(|| root.join("php/ext")),
            mariadb_server: root.join("mariadb/bin/mariadbd"),
            mariadb_install_db: None,
            phpmyadmin_root: root.join("phpmyadmin"),
        }
    }

    fn with_ctx<T>(ports: ServicePorts, ext: bool, f: impl FnOnce(&ConfigContext<'_>) -> T) -> T {
        let layout = DataLayout::new("/data/campp");
        let runtime = runtime(&layout.install_root(), ext);
        let project_root = PathBuf::from("/home/dev/sites");
        let ctx = ConfigContext {
            ports,
            runtime: &runtime,
            layout: &layout,
            project_root: &project_root,
            db_admin_secret: "0123456789abcdef0123456789abcdef",
        };
        f(&ctx)
    }

    #[test]
    fn caddyfile_serves_project_and_forwards_php() {
        let text = with_ctx(ServicePorts::default(), false, |ctx| {
            render_config(ServiceKind::WebServer, ctx).unwrap().contents
        });
        assert!(text.contains("\n:8080 {\n"));
        assert!(text.contains("root * \"/home/dev/sites\""));
        assert!(text.contains("php_fastcgi 127.0.0.1:9000"));
        assert!(text.contains("reverse_proxy 127.0.0.1:8088"));
    }

    #[test]
    fn fallback_ports_flow_into_every_file() {
        let mut ports = ServicePorts::default();
        ports.web_server = 8081;
        ports.database = 3310;
        with_ctx(ports, false, |ctx| {
            let caddy = render_config(ServiceKind::WebServer, ctx).unwrap().contents;
            assert!(caddy.contains("\n:8081 {\n"));
            let cnf = render_config(ServiceKind::Database, ctx).unwrap().contents;
            assert!(cnf.contains("port = 3310"));
            let pma = render_config(ServiceKind::DbAdmin, ctx).unwrap().contents;
            assert!(pma.contains("['port'] = '3310'"));
            assert!(pma.contains("localhost:8081/phpmyadmin/"));
        });
    }

    #[test]
    fn rendering_is_byte_stable() {
        with_ctx(ServicePorts::default(), true, |ctx| {
            for kind in ServiceKind::ALL {
                assert_eq!(
                    render_config(kind, ctx).unwrap(),
                    render_config(kind, ctx).unwrap()
                );
            }
        });
    }

    #[test]
    fn php_extensions_only_with_ext_dir() {
        let with = with_ctx(ServicePorts::default(), true, |ctx| {
            render_config(ServiceKind::PhpRuntime, ctx).unwrap().contents
        });
        assert!(with.contains("extension=pdo_mysql"));
        assert!(with.contains("extension_dir = \"/data/campp/runtime/php/ext\""));

        let without = with_ctx(ServicePorts::default(), false, |ctx| {
            render_config(ServiceKind::PhpRuntime, ctx).unwrap().contents
        });
        assert!(!without.contains("extension="));
        assert!(without.contains("memory_limit = 256M"));
    }

    #[test]
    fn database_paths_come_from_layout() {
        let cnf = with_ctx(ServicePorts::default(), false, |ctx| {
            render_config(ServiceKind::Database, ctx).unwrap().contents
        });
        assert!(cnf.contains("datadir = \"/data/campp/data/mariadb\""));
        assert!(cnf.contains("basedir = \"/data/campp/runtime/mariadb\""));
        assert!(cnf.contains("bind-address = 127.0.0.1"));
    }

    #[test]
    fn generate_all_writes_four_files() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(tmp.path());
        let runtime = runtime(&layout.install_root(), false);
        let project_root = tmp.path().join("projects");
        let ctx = ConfigContext {
            ports: ServicePorts::default(),
            runtime: &runtime,
            layout: &layout,
            project_root: &project_root,
            db_admin_secret: "0123456789abcdef0123456789abcdef",
        };
        let written = generate_all(&ctx).unwrap();
        assert_eq!(written.len(), 4);
        for path in written {
            assert!(path.is_file());
            assert!(path.starts_with(layout.config_dir()));
        }
    }

    #[test]
    fn php_strings_are_escaped() {
        assert_eq!(php_single_quoted("it's"), "it\\'s");
    }
}
