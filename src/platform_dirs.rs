/// Cross-platform default locations for the sandbox
///
/// Uses the `dirs` crate to follow OS conventions:
/// - Linux/Unix: XDG Base Directory Specification
/// - macOS: Apple directory guidelines
/// - Windows: Windows directory standards
use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "tcl-sandbox";

/// Get the data directory
///
/// - Linux: `$XDG_DATA_HOME/tcl-sandbox` or `~/.local/share/tcl-sandbox`
/// - macOS: `~/Library/Application Support/tcl-sandbox`
/// - Windows: `%LOCALAPPDATA%\tcl-sandbox`
pub fn data_dir() -> Result<PathBuf> {
    let base_dir =
        dirs::data_local_dir().ok_or_else(|| anyhow!("Unable to determine data directory"))?;
    Ok(base_dir.join(APP_NAME))
}

/// Get the config directory
///
/// - Linux: `$XDG_CONFIG_HOME/tcl-sandbox` or `~/.config/tcl-sandbox`
/// - macOS: `~/Library/Application Support/tcl-sandbox`
/// - Windows: `%APPDATA%\tcl-sandbox`
pub fn config_dir() -> Result<PathBuf> {
    let base_dir =
        dirs::config_dir().ok_or_else(|| anyhow!("Unable to determine config directory"))?;
    Ok(base_dir.join(APP_NAME))
}

/// Default configuration file, `sandbox.toml` in the config directory
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("sandbox.toml"))
}

/// Rolling log files
pub fn logs_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}

/// Default audit log location
pub fn audit_log_path() -> Result<PathBuf> {
    Ok(logs_dir()?.join("audit.jsonl"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Create the config and log directories
pub fn init_directories() -> Result<()> {
    ensure_dir(&config_dir()?)?;
    ensure_dir(&logs_dir()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_namespaced() {
        assert!(data_dir().unwrap().ends_with(APP_NAME));
        assert!(config_dir().unwrap().ends_with(APP_NAME));
        assert!(config_file().unwrap().ends_with("tcl-sandbox/sandbox.toml"));
        assert!(audit_log_path().unwrap().starts_with(logs_dir().unwrap()));
    }

    #[test]
    fn test_linux_follows_xdg() {
        if !cfg!(target_os = "linux") {
            return;
        }
        let config = config_dir().unwrap();
        match std::env::var("XDG_CONFIG_HOME") {
            Ok(xdg_config) if !xdg_config.is_empty() => assert!(config.starts_with(&xdg_config)),
            _ => {
                if let Ok(home) = std::env::var("HOME") {
                    assert!(config.starts_with(Path::new(&home).join(".config")));
                }
            }
        }
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");

        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir(&nested).unwrap();
    }
}
