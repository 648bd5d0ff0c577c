//! Package installation seam.
//!
//! Hosts that fetch server packages (npm, pip, cargo) before first launch
//! plug in a [`ServerInstaller`]. The manager treats installation as
//! advisory: a missing installer means servers are assumed preinstalled.

use async_trait::async_trait;
use gantry_core::GantryResult;
use serde::Serialize;
use std::collections::HashMap;

/// Result of one install attempt.
#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    /// Whether the server's package ended up available.
    pub success: bool,
    /// Package manager that handled the request, e.g. `npm` or `pip`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    /// Captured installer output, when there was any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstallOutcome {
    /// Builds a successful outcome.
    pub fn ok(package_manager: Option<String>, output: Option<String>) -> Self {
        Self {
            success: true,
            package_manager,
            output,
            error: None,
        }
    }

    /// Successful outcome for servers with nothing to install (remote
    /// endpoints, preinstalled commands).
    pub fn skipped() -> Self {
        Self::ok(None, None)
    }

    /// Builds a failed outcome carrying the installer's error text.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            package_manager: None,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Installs the package backing a server command before first start.
#[async_trait]
pub trait ServerInstaller: Send + Sync {
    /// Resolves and installs whatever `command` needs to run. Ordinary
    /// install failures come back as `Ok` with a failed outcome; `Err` is
    /// reserved for environment problems (no network, missing tooling).
    async fn install(
        &self,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> GantryResult<InstallOutcome>;
}
