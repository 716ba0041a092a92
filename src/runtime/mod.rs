//! Runtime binaries: manifest, provisioning and location on disk.

mod component;
pub mod locator;
pub mod manifest;
pub mod progress;
pub mod provisioner;

pub use component::Component;
pub use locator::{locate, RuntimePaths};
pub use manifest::{ArtifactSpec, RuntimeManifest, DEFAULT_MANIFEST_SOURCES};
pub use progress::{DownloadProgress, ProgressPhase};
pub use provisioner::{
    is_cancellation, CancelHandle, InstallReceipt, ProvisionReport, ProvisionRequest,
    ProvisionTask, Provisioner, PMA_CONFIG_ENV,
};
