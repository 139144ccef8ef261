//! Cross-platform configuration paths using the `dirs` crate.
//!
//! Layout:
//!
//! Config dir (`gatekeeper.toml`):
//!   Windows: %APPDATA%\speaker-gate\
//!   macOS:   ~/Library/Application Support/speaker-gate/
//!   Linux:   ~/.config/speaker-gate/

use std::path::PathBuf;

/// Holds all resolved configuration directory/file paths.
#[derive(Debug, Clone)]
pub struct GatePaths {
    /// Directory for `gatekeeper.toml`.
    pub config_dir: PathBuf,
    /// Full path to `gatekeeper.toml`.
    pub settings_file: PathBuf,
}

impl GatePaths {
    const APP_NAME: &'static str = "speaker-gate";

    /// Resolves all paths using the `dirs` crate.
    ///
    /// Falls back to the current directory if the platform cannot provide a
    /// standard path (should be extremely rare in practice).
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let settings_file = config_dir.join("gatekeeper.toml");

        Self {
            config_dir,
            settings_file,
        }
    }
}

impl Default for GatePaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_non_empty() {
        let paths = GatePaths::new();
        assert!(paths.config_dir.to_str().is_some_and(|s| !s.is_empty()));
        assert!(paths
            .settings_file
            .file_name()
            .is_some_and(|n| n == "gatekeeper.toml"));
    }
}
