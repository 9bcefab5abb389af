use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Overrides the base directory (used by workers that run outside a user home).
pub const HOME_ENV: &str = "CDRUN_HOME";

/// Base cdrun directory (`$CDRUN_HOME`, else ~/.config/cdrun/ on all platforms)
pub fn cdrun() -> Result<PathBuf> {
    if let Ok(dir) = env::var(HOME_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(&dir).to_string()));
        }
    }

    #[cfg(windows)]
    {
        let appdata = env::var("APPDATA").map_err(|_| {
            Error::internal_unexpected(
                "APPDATA environment variable not set on Windows".to_string(),
            )
        })?;
        Ok(PathBuf::from(appdata).join("cdrun"))
    }

    #[cfg(not(windows))]
    {
        let home = env::var("HOME").map_err(|_| {
            Error::internal_unexpected(
                "HOME environment variable not set on Unix-like system".to_string(),
            )
        })?;
        Ok(PathBuf::from(home).join(".config").join("cdrun"))
    }
}

/// Global cdrun.json config file path
pub fn cdrun_json() -> Result<PathBuf> {
    Ok(cdrun()?.join("cdrun.json"))
}

/// Default SQLite run record store
pub fn store_db() -> Result<PathBuf> {
    Ok(cdrun()?.join("runs.sqlite3"))
}

/// Default root for per-run checkouts
pub fn workspaces() -> Result<PathBuf> {
    Ok(cdrun()?.join("workspaces"))
}

/// Default root for per-run logs
pub fn logs() -> Result<PathBuf> {
    Ok(cdrun()?.join("logs"))
}

/// Invocation bodies handed to spawned workers
pub fn invocations() -> Result<PathBuf> {
    Ok(cdrun()?.join("invocations"))
}

/// Resolve a configured path, expanding `~`, falling back to `default`.
pub fn resolve_or(configured: Option<&str>, default: impl FnOnce() -> Result<PathBuf>) -> Result<PathBuf> {
    match configured.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => Ok(PathBuf::from(shellexpand::tilde(path).to_string())),
        None => default(),
    }
}
