//! Runtime manifest: which artifact to fetch for each component on each platform.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::download::{RetryPolicy, RuntimeFetcher};
use crate::error::{AppError, Result};

use super::Component;

/// Built-in manifest locations, primary first.
pub const DEFAULT_MANIFEST_SOURCES: [&str; 2] = [
    "https://github.com/campp-dev/runtime-manifest/releases/latest/download/manifest.json",
    "https://cdn.jsdelivr.net/gh/campp-dev/runtime-manifest@main/manifest.json",
];

pub const SUPPORTED_SCHEMA: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub url: String,
    pub sha256: String,
    pub version: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

impl ArtifactSpec {
    /// Primary URL followed by mirrors.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(String::as_str))
    }

    /// Case-insensitive digest comparison.
    pub fn matches_digest(&self, actual: &str) -> bool {
        self.sha256.trim().eq_ignore_ascii_case(actual.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeManifest {
    #[serde(default = "default_schema")]
    pub schema: u32,
    pub platforms: BTreeMap<String, BTreeMap<String, ArtifactSpec>>,
}

fn default_schema() -> u32 {
    SUPPORTED_SCHEMA
}

impl RuntimeManifest {
    pub fn parse(text: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(text)
            .map_err(|e| AppError::manifest_unavailable(format!("invalid manifest: {}", e)))?;
        if manifest.schema != SUPPORTED_SCHEMA {
            return Err(AppError::manifest_unavailable(format!(
                "unsupported manifest schema {}",
                manifest.schema
            )));
        }
        Ok(manifest)
    }

    /// Artifacts for every component on `target`, in provisioning order.
    pub fn artifacts_for(&self, target: &str) -> Result<Vec<(Component, ArtifactSpec)>> {
        let platform = self
            .platforms
            .get(target)
            .ok_or_else(|| AppError::unsupported_platform(target))?;

        Component::ALL
            .into_iter()
            .map(|component| {
                platform
                    .get(component.id())
                    .cloned()
                    .map(|spec| (component, spec))
                    .ok_or_else(|| {
                        AppError::manifest_unavailable(format!(
                            "no {} artifact for {}",
                            component.id(),
                            target
                        ))
                    })
            })
            .collect()
    }
}

/// Fetch the manifest from the first source that answers with a parseable document.
pub async fn fetch_manifest<F: RuntimeFetcher>(
    fetcher: &F,
    sources: &[String],
    retry: RetryPolicy,
) -> Result<RuntimeManifest> {
    let mut failures = Vec::new();
    for source in sources {
        let fetched = retry
            .run(&format!("manifest fetch from {}", source), move || {
                fetcher.fetch_text(source)
            })
            .await;
        match fetched.and_then(|text| RuntimeManifest::parse(&text)) {
            Ok(manifest) => {
                log::info!("Loaded runtime manifest from {}", source);
                return Ok(manifest);
            }
            Err(e) => {
                log::warn!("Manifest source {} failed: {}", source, e);
                failures.push(format!("{}: {}", source, e));
            }
        }
    }

    if failures.is_empty() {
        return Err(AppError::manifest_unavailable("no manifest sources configured"));
    }
    Err(AppError::manifest_unavailable(failures.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const SAMPLE: &str = r#"{
        "schema": 1,
        "platforms": {
            "x86_64-unknown-linux-gnu": {
                "caddy": {"url": "https://a/caddy.tar.gz", "sha256": "AA", "version": "2.8.4"},
                "php": {"url": "https://a/php.tar.gz", "sha256": "bb", "version": "8.3.10",
                        "mirrors": ["https://b/php.tar.gz"]},
                "mariadb": {"url": "https://a/mariadb.tar.gz", "sha256": "cc", "version": "11.4.2"},
                "phpmyadmin": {"url": "https://a/pma.zip", "sha256": "dd", "version": "5.2.1"}
            }
        }
    }"#;

    #[test]
    fn artifacts_in_provisioning_order() {
        let manifest = RuntimeManifest::parse(SAMPLE).unwrap();
        let artifacts = manifest.artifacts_for("x86_64-unknown-linux-gnu").unwrap();
        let order: Vec<Component> = artifacts.iter().map(|(c, _)| *c).collect();
        assert_eq!(order, Component::ALL.to_vec());

        let php = &artifacts[1].1;
        let urls: Vec<&str> = php.urls().collect();
        assert_eq!(urls, ["https://a/php.tar.gz", "https://b/php.tar.gz"]);
    }

    #[test]
    fn digest_comparison_ignores_case() {
        let manifest = RuntimeManifest::parse(SAMPLE).unwrap();
        let caddy = &manifest.platforms["x86_64-unknown-linux-gnu"]["caddy"];
        assert!(caddy.matches_digest("aa"));
        assert!(!caddy.matches_digest("ab"));
    }

    #[test]
    fn unknown_platform_is_unsupported() {
        let manifest = RuntimeManifest::parse(SAMPLE).unwrap();
        let err = manifest.artifacts_for("riscv64gc-unknown-linux-gnu").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedPlatform);
    }

    #[test]
    fn malformed_or_future_schema_rejected() {
        assert_eq!(
            RuntimeManifest::parse("{not json").unwrap_err().kind(),
            ErrorKind::ManifestUnavailable
        );
        assert_eq!(
            RuntimeManifest::parse(r#"{"schema": 2, "platforms": {}}"#)
                .unwrap_err()
                .kind(),
            ErrorKind::ManifestUnavailable
        );
    }
}
