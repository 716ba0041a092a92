use serde::Serialize;

use super::Component;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Downloading,
    Extracting,
    Installing,
    Complete,
    Error,
}

/// One provisioning progress event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub phase: ProgressPhase,
    pub component: Option<Component>,
    /// 1-based position of `component` in the run.
    pub component_index: usize,
    pub total_components: usize,
    /// `None` while the total size is unknown.
    pub percent: Option<f64>,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub message: Option<String>,
}

/// Download percentage clamped to `[0, 100]`. An empty body counts as done.
pub fn download_percent(downloaded: u64, total: Option<u64>) -> Option<f64> {
    match total {
        None => None,
        Some(0) => Some(100.0),
        Some(total) => Some((downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0)),
    }
}

impl DownloadProgress {
    pub(crate) fn step(
        phase: ProgressPhase,
        component: Component,
        index: usize,
        total: usize,
    ) -> Self {
        Self {
            phase,
            component: Some(component),
            component_index: index,
            total_components: total,
            percent: None,
            bytes_downloaded: 0,
            total_bytes: None,
            message: None,
        }
    }

    pub(crate) fn complete(total: usize) -> Self {
        Self {
            phase: ProgressPhase::Complete,
            component: None,
            component_index: total,
            total_components: total,
            percent: Some(100.0),
            bytes_downloaded: 0,
            total_bytes: None,
            message: None,
        }
    }

    pub(crate) fn failed(
        component: Option<Component>,
        index: usize,
        total: usize,
        reason: String,
    ) -> Self {
        Self {
            phase: ProgressPhase::Error,
            component,
            component_index: index,
            total_components: total,
            percent: None,
            bytes_downloaded: 0,
            total_bytes: None,
            message: Some(reason),
        }
    }

    pub(crate) fn with_percent(mut self, percent: f64) -> Self {
        self.percent = Some(percent);
        self
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub(crate) fn with_bytes(mut self, downloaded: u64, total: Option<u64>) -> Self {
        self.bytes_downloaded = downloaded;
        self.total_bytes = total;
        self.percent = download_percent(downloaded, total);
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, ProgressPhase::Complete | ProgressPhase::Error)
    }
}
