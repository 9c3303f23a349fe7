//! Failure diagnostics

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::errors::FlowError;
use crate::page::PageHandle;

/// Default location of the failure screenshot
pub const DEFAULT_SCREENSHOT_PATH: &str = "screenshot.png";

const SCREENSHOT_DEADLINE: Duration = Duration::from_secs(10);

/// Captures the page state when a run fails
#[derive(Debug, Clone)]
pub struct DiagnosticCapture {
    path: PathBuf,
}

impl Default for DiagnosticCapture {
    fn default() -> Self {
        Self::new(DEFAULT_SCREENSHOT_PATH)
    }
}

impl DiagnosticCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log the failure and save a screenshot of the page.
    ///
    /// Returns the screenshot path, or `None` when the page could not be captured.
    pub async fn capture(
        &self,
        page: &PageHandle,
        step: Option<&str>,
        failure: &FlowError,
    ) -> Option<PathBuf> {
        error!(step = step.unwrap_or("-"), error = %failure, "task failed");

        let bytes = match page.screenshot(SCREENSHOT_DEADLINE).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "could not capture screenshot");
                return None;
            }
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %err, path = %parent.display(), "could not create screenshot directory");
                return None;
            }
        }

        match tokio::fs::write(&self.path, &bytes).await {
            Ok(()) => {
                info!(path = %self.path.display(), bytes = bytes.len(), "saved screenshot");
                Some(self.path.clone())
            }
            Err(err) => {
                warn!(error = %err, path = %self.path.display(), "could not write screenshot");
                None
            }
        }
    }
}
