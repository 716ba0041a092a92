//! Embedded service configuration templates.
//!
//! Placeholders are written `{{name}}`. Every placeholder must be supplied
//! when rendering.

use std::collections::BTreeMap;

use crate::error::{AppError, Result};

pub const CADDYFILE: &str = r#"{
	admin off
	auto_https off
	persist_config off
}

:{{web_port}} {
	root * "{{project_root}}"
	encode gzip

	handle_path /phpmyadmin/* {
		reverse_proxy 127.0.0.1:{{db_admin_port}}
	}

	php_fastcgi 127.0.0.1:{{php_port}}
	file_server browse

	header {
		X-Content-Type-Options nosniff
		X-Frame-Options SAMEORIGIN
		Referrer-Policy strict-origin-when-cross-origin
	}

	log {
		output file "{{log_dir}}/caddy-access.log"
		format json
	}
}
"#;

pub const PHP_INI: &str = r#"; Generated by CAMPP. Changes are overwritten when services start.
[PHP]
engine = On
short_open_tag = Off
error_reporting = E_ALL & ~E_DEPRECATED
display_errors = On
log_errors = On
error_log = "{{log_dir}}/php-errors.log"
memory_limit = 256M
post_max_size = 100M
upload_max_filesize = 100M
max_execution_time = 300
upload_tmp_dir = "{{tmp_dir}}"
cgi.force_redirect = 0
cgi.fix_pathinfo = 1
{{extension_block}}
[Date]
date.timezone = UTC

[Session]
session.save_path = "{{tmp_dir}}"

[MySQLi]
mysqli.default_host = 127.0.0.1
mysqli.default_port = {{db_port}}
"#;

pub const MY_CNF: &str = r#"# Generated by CAMPP. Changes are overwritten when services start.
[mysqld]
basedir = "{{db_base_dir}}"
datadir = "{{db_data_dir}}"
port = {{db_port}}
bind-address = 127.0.0.1
socket = "{{db_socket}}"
character-set-server = utf8mb4
collation-server = utf8mb4_unicode_ci
skip-name-resolve
max_allowed_packet = 64M
innodb_buffer_pool_size = 128M

[client]
host = 127.0.0.1
port = {{db_port}}
socket = "{{db_socket}}"
"#;

pub const PMA_CONFIG: &str = r#"<?php
// Generated by CAMPP. Changes are overwritten when services start.
$cfg['blowfish_secret'] = '{{db_admin_secret}}';

$i = 0;
$i++;
$cfg['Servers'][$i]['auth_type'] = 'config';
$cfg['Servers'][$i]['host'] = '127.0.0.1';
$cfg['Servers'][$i]['port'] = '{{db_port}}';
$cfg['Servers'][$i]['user'] = 'root';
$cfg['Servers'][$i]['password'] = '';
$cfg['Servers'][$i]['compress'] = false;
$cfg['Servers'][$i]['AllowNoPassword'] = true;

$cfg['TempDir'] = '{{db_admin_tmp_dir}}';
$cfg['ThemeDefault'] = 'pmahomme';
$cfg['PmaAbsoluteUri'] = 'http://localhost:{{web_port}}/phpmyadmin/';
"#;

/// Substitute every `{{name}}` in `template` from `values`.
pub fn render(template: &str, values: &BTreeMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            AppError::config(format!(
                "unterminated placeholder near {:?}",
                after.chars().take(24).collect::<String>()
            ))
        })?;
        let name = after[..end].trim();
        let value = values
            .get(name)
            .ok_or_else(|| AppError::config(format!("unknown placeholder {{{{{}}}}}", name)))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}
