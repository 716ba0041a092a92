use serde::{Deserialize, Serialize};

/// A provisioned runtime artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Caddy,
    Php,
    #[serde(rename = "mariadb")]
    MariaDb,
    #[serde(rename = "phpmyadmin")]
    PhpMyAdmin,
}

impl Component {
    /// Provisioning order.
    pub const ALL: [Self; 4] = [Self::Caddy, Self::Php, Self::MariaDb, Self::PhpMyAdmin];

    /// Manifest key and directory name under the install root.
    pub fn id(self) -> &'static str {
        match self {
            Self::Caddy => "caddy",
            Self::Php => "php",
            Self::MariaDb => "mariadb",
            Self::PhpMyAdmin => "phpmyadmin",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Caddy => "Caddy",
            Self::Php => "PHP",
            Self::MariaDb => "MariaDB",
            Self::PhpMyAdmin => "phpMyAdmin",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}
