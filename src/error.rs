//! Application error types.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Application error carrying a kind and a small ordered payload of details.
#[derive(Debug, Clone)]
pub struct AppError {
    payload: BTreeMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No bindable port inside the scan window
    NoPortAvailable,
    /// Every manifest source failed
    ManifestUnavailable,
    /// Downloaded artifact digest differs from the manifest
    ChecksumMismatch,
    /// Archive could not be unpacked or lacks the expected files
    ExtractionFailed,
    /// A required runtime executable is missing
    RuntimeNotInstalled,
    /// The service process could not be spawned
    SpawnFailed,
    /// The service did not start listening in time
    ProcessTimedOut,
    /// The service process exited on its own
    UnexpectedExit,
    /// Another transition holds the service lock
    AlreadyInTransition,
    /// No manifest entry for this machine
    UnsupportedPlatform,
    /// Provisioning was cancelled
    Cancelled,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// Process control error
    Process,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::NoPortAvailable => 1001,
            Self::ManifestUnavailable => 2001,
            Self::ChecksumMismatch => 2002,
            Self::ExtractionFailed => 2003,
            Self::RuntimeNotInstalled => 2004,
            Self::UnsupportedPlatform => 2005,
            Self::Cancelled => 2006,
            Self::SpawnFailed => 3001,
            Self::ProcessTimedOut => 3002,
            Self::UnexpectedExit => 3003,
            Self::AlreadyInTransition => 3004,
            Self::Process => 3005,
            Self::Config => 4001,
            Self::Io => 4002,
            Self::Network => 4003,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: BTreeMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    fn with_pairs<const N: usize>(kind: ErrorKind, pairs: [(&str, String); N]) -> Self {
        Self::new(
            kind,
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn no_port_available(preferred: u16, attempts: u16) -> Self {
        Self::with_pairs(
            ErrorKind::NoPortAvailable,
            [
                ("preferred", preferred.to_string()),
                ("attempts", attempts.to_string()),
            ],
        )
    }

    pub fn manifest_unavailable(detail: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::ManifestUnavailable, detail)
    }

    pub fn checksum_mismatch(component: &str, expected: &str, actual: &str) -> Self {
        Self::with_pairs(
            ErrorKind::ChecksumMismatch,
            [
                ("component", component.to_string()),
                ("expected", expected.to_string()),
                ("actual", actual.to_string()),
            ],
        )
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::ExtractionFailed, message)
    }

    pub fn runtime_not_installed(missing: &str) -> Self {
        Self::with_pairs(ErrorKind::RuntimeNotInstalled, [("missing", missing.to_string())])
    }

    pub fn spawn_failed(service: &str, detail: impl Into<String>) -> Self {
        Self::with_pairs(
            ErrorKind::SpawnFailed,
            [("service", service.to_string()), ("detail", detail.into())],
        )
    }

    pub fn process_timed_out(service: &str, port: u16, secs: u64) -> Self {
        Self::with_pairs(
            ErrorKind::ProcessTimedOut,
            [
                ("service", service.to_string()),
                ("port", port.to_string()),
                ("timeout_secs", secs.to_string()),
            ],
        )
    }

    pub fn unexpected_exit(service: &str, status: impl Into<String>) -> Self {
        Self::with_pairs(
            ErrorKind::UnexpectedExit,
            [("service", service.to_string()), ("status", status.into())],
        )
    }

    pub fn already_in_transition(service: &str) -> Self {
        Self::with_pairs(
            ErrorKind::AlreadyInTransition,
            [("service", service.to_string())],
        )
    }

    pub fn unsupported_platform(target: &str) -> Self {
        Self::with_pairs(
            ErrorKind::UnsupportedPlatform,
            [("target", target.to_string())],
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, BTreeMap::new())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn network_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::with_pairs(
            ErrorKind::Network,
            [("url", url.to_string()), ("detail", detail.into())],
        )
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::extraction(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_orders_payload_keys() {
        let err = AppError::checksum_mismatch("mariadb", "abc", "def");
        assert_eq!(
            err.to_string(),
            "ChecksumMismatch: actual=def, component=mariadb, expected=abc"
        );
    }

    #[test]
    fn empty_payload_displays_kind_only() {
        assert_eq!(AppError::cancelled().to_string(), "Cancelled");
        assert_eq!(AppError::io("").to_string(), "Io");
    }

    #[test]
    fn serializes_code_and_payload() {
        let err = AppError::no_port_available(8080, 20);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], 1001);
        assert_eq!(json["payload"]["preferred"], "8080");
        assert_eq!(json["payload"]["attempts"], "20");
    }

    #[test]
    fn zip_errors_are_extraction_failures() {
        let err: AppError = zip::result::ZipError::FileNotFound.into();
        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
    }
}
