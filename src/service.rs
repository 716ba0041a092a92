//! Service identities, lifecycle states and status snapshots.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::runtime::Component;

/// One of the supervised services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    WebServer,
    PhpRuntime,
    Database,
    DbAdmin,
}

impl ServiceKind {
    pub const ALL: [Self; 4] = [Self::WebServer, Self::PhpRuntime, Self::Database, Self::DbAdmin];

    /// Order in which a full stack is brought up.
    pub const STARTUP_ORDER: [Self; 4] =
        [Self::Database, Self::PhpRuntime, Self::DbAdmin, Self::WebServer];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebServer => "web-server",
            Self::PhpRuntime => "php-runtime",
            Self::Database => "database",
            Self::DbAdmin => "db-admin",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::WebServer => "Caddy",
            Self::PhpRuntime => "PHP-CGI",
            Self::Database => "MariaDB",
            Self::DbAdmin => "phpMyAdmin",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::WebServer => 8080,
            Self::PhpRuntime => 9000,
            Self::Database => 3307,
            Self::DbAdmin => 8088,
        }
    }

    /// Provisioned component that supplies this service's executable.
    pub fn component(self) -> Component {
        match self {
            Self::WebServer => Component::Caddy,
            Self::PhpRuntime => Component::Php,
            Self::Database => Component::MariaDb,
            Self::DbAdmin => Component::PhpMyAdmin,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web-server" | "web" | "caddy" => Ok(Self::WebServer),
            "php-runtime" | "php" | "php-cgi" => Ok(Self::PhpRuntime),
            "database" | "db" | "mariadb" | "mysql" => Ok(Self::Database),
            "db-admin" | "phpmyadmin" | "pma" => Ok(Self::DbAdmin),
            other => Err(AppError::config(format!("Unknown service: {}", other))),
        }
    }
}

/// Lifecycle state of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

impl ServiceState {
    /// States in which the service owns a live process.
    pub fn has_process(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(msg) => write!(f, "error: {}", msg),
            other => f.write_str(other.label()),
        }
    }
}

/// Point-in-time view of a service, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub kind: ServiceKind,
    pub state: ServiceState,
    pub port: u16,
    pub pid: Option<u32>,
    pub error_message: Option<String>,
    pub in_transition: bool,
}
