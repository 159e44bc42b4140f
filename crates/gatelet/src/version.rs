//! Version information for gatelet.

/// Gatelet version from Cargo.toml
pub const GATELET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information for the controller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Gatelet library version.
    pub gatelet: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            gatelet: GATELET_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
